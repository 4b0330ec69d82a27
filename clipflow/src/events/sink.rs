//! Event sink trait and implementations.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};

/// Receives `batch.*`, `run.*` and `stage.*` lifecycle events.
///
/// Sinks are handed to the scheduler and executor explicitly; there is no
/// process-wide default sink.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event.
    ///
    /// # Arguments
    ///
    /// * `event_type` - Dotted event name (e.g. "stage.completed")
    /// * `data` - Optional JSON payload
    async fn emit(&self, event_type: &str, data: Option<Value>);

    /// Emits an event from code that cannot await. Must never fail.
    fn try_emit(&self, event_type: &str, data: Option<Value>);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event_type: &str, _data: Option<Value>) {}

    fn try_emit(&self, _event_type: &str, _data: Option<Value>) {}
}

/// Writes events to `tracing`.
///
/// Batch and run events log at info. Per-stage events log at debug, since
/// the retry controller already warns about failed attempts.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventSink;

impl LoggingEventSink {
    /// Creates a logging sink.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn log_event(event_type: &str, data: Option<&Value>) {
        let stage = data
            .and_then(|d| d.get("stage"))
            .and_then(Value::as_str)
            .unwrap_or("-");
        if event_type.starts_with("stage.") {
            debug!(event = %event_type, stage = %stage, data = ?data, "Stage event");
        } else {
            info!(event = %event_type, data = ?data, "Lifecycle event");
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        Self::log_event(event_type, data.as_ref());
    }

    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        Self::log_event(event_type, data.as_ref());
    }
}

/// Records event names in order, for asserting lifecycle sequences.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    types: Mutex<Vec<String>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the collected event names in emission order.
    #[must_use]
    pub fn event_types(&self) -> Vec<String> {
        self.types.lock().clone()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event_type: &str, _data: Option<Value>) {
        self.types.lock().push(event_type.to_string());
    }

    fn try_emit(&self, event_type: &str, _data: Option<Value>) {
        self.types.lock().push(event_type.to_string());
    }
}
