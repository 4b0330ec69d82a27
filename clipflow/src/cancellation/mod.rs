//! User-initiated cancellation.
//!
//! A single [`CancellationToken`] is shared by the binary's signal handler,
//! the pipeline executor and the batch scheduler.

mod token;

pub use token::CancellationToken;
