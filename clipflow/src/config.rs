//! Project configuration and project-root discovery.
//!
//! Configuration lives in `clipflow.json` at the project root. The same file
//! is the anchor used to locate the root: discovery walks up from the
//! starting directory until it finds it. Relative paths in the config are
//! resolved against that root.

use crate::pipeline::RetryConfig;
use crate::stages::{default_catalog, CommandStage, StageHandler, StageSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// File name of the project config, also the project-root marker.
pub const ROOT_MARKER: &str = "clipflow.json";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read config {}: {source}", .path.display())]
    Read {
        /// The config path.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },

    /// The config file is not valid JSON for the config schema.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range or inconsistent.
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// No `clipflow.json` was found between `start` and the filesystem root.
    #[error("No clipflow.json found in {} or any parent directory", .start.display())]
    RootNotFound {
        /// Where the search started.
        start: PathBuf,
    },
}

/// Visibility of published output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Privacy {
    /// Publicly listed.
    Public,
    /// Reachable by link only.
    Unlisted,
    /// Visible to the owner only.
    #[default]
    Private,
}

impl fmt::Display for Privacy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Public => "public",
            Self::Unlisted => "unlisted",
            Self::Private => "private",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Privacy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "public" => Ok(Self::Public),
            "unlisted" => Ok(Self::Unlisted),
            "private" => Ok(Self::Private),
            other => Err(ConfigError::Invalid(format!("unknown privacy '{other}'"))),
        }
    }
}

/// One stage of the production sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Stage name.
    pub name: String,
    /// Files the stage must leave in the run directory.
    pub artifacts: Vec<String>,
    /// External command (`program`, `args...`) implementing the stage.
    #[serde(default)]
    pub command: Option<Vec<String>>,
    /// Per-attempt timeout.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl StageConfig {
    /// Creates a stage config without a command.
    #[must_use]
    pub fn new(spec: StageSpec) -> Self {
        Self {
            name: spec.name,
            artifacts: spec.artifacts,
            command: None,
            timeout_seconds: None,
        }
    }

    /// Sets the command.
    #[must_use]
    pub fn with_command<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = Some(argv.into_iter().map(Into::into).collect());
        self
    }
}

/// Where registry sync fetches published items from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SyncSourceConfig {
    /// A JSON file listing published items.
    File {
        /// Path, relative to the project root when not absolute.
        path: PathBuf,
    },
    /// An HTTP endpoint returning the same JSON list.
    Http {
        /// Endpoint URL.
        url: String,
        /// Request timeout.
        #[serde(default = "default_http_timeout")]
        timeout_seconds: u64,
    },
}

fn default_http_timeout() -> u64 {
    30
}

/// Top-level project configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipflowConfig {
    /// Directory holding one folder per run.
    #[serde(default = "default_runs_dir")]
    pub runs_dir: PathBuf,
    /// Duplicate registry file.
    #[serde(default = "default_registry_path")]
    pub registry_path: PathBuf,
    /// Retry policy applied to every stage.
    #[serde(default)]
    pub retry: RetryConfig,
    /// The ordered stage sequence.
    #[serde(default = "default_stages")]
    pub stages: Vec<StageConfig>,
    /// Default publish visibility.
    #[serde(default)]
    pub privacy: Privacy,
    /// Authoritative source used to rebuild an empty registry.
    #[serde(default)]
    pub sync: Option<SyncSourceConfig>,
    /// Stages whose artifact refs are the published external ids.
    #[serde(default = "default_publish_stages")]
    pub publish_stages: Vec<String>,
}

fn default_runs_dir() -> PathBuf {
    PathBuf::from("runs")
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("registry.json")
}

fn default_stages() -> Vec<StageConfig> {
    default_catalog().into_iter().map(StageConfig::new).collect()
}

fn default_publish_stages() -> Vec<String> {
    vec!["publish".to_string(), "short-variant-publish".to_string()]
}

impl Default for ClipflowConfig {
    fn default() -> Self {
        Self {
            runs_dir: default_runs_dir(),
            registry_path: default_registry_path(),
            retry: RetryConfig::default(),
            stages: default_stages(),
            privacy: Privacy::default(),
            sync: None,
            publish_stages: default_publish_stages(),
        }
    }
}

impl ClipflowConfig {
    /// Creates a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the stage sequence.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<StageConfig>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the default privacy.
    #[must_use]
    pub fn with_privacy(mut self, privacy: Privacy) -> Self {
        self.privacy = privacy;
        self
    }

    /// Sets the sync source.
    #[must_use]
    pub fn with_sync(mut self, sync: SyncSourceConfig) -> Self {
        self.sync = Some(sync);
        self
    }

    /// Reads and validates a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `clipflow.json` under `root`.
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        Self::from_file(&root.join(ROOT_MARKER))
    }

    /// Checks the config once, so later code can rely on it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stages.is_empty() {
            return Err(ConfigError::Invalid("at least one stage is required".into()));
        }
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err(ConfigError::Invalid("stage name must not be empty".into()));
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate stage '{}'", stage.name)));
            }
            if stage.artifacts.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "stage '{}' declares no artifacts",
                    stage.name
                )));
            }
            if stage.command.as_ref().is_some_and(Vec::is_empty) {
                return Err(ConfigError::Invalid(format!(
                    "stage '{}' has an empty command",
                    stage.name
                )));
            }
            if stage.timeout_seconds == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "stage '{}' timeout must be positive",
                    stage.name
                )));
            }
        }
        for name in &self.publish_stages {
            if !seen.contains(name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "publish stage '{name}' is not in the stage list"
                )));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        if let Some(SyncSourceConfig::Http { url, .. }) = &self.sync {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid(format!("sync url '{url}' is not http(s)")));
            }
        }
        Ok(())
    }

    /// Returns the artifact contract of every stage, in order.
    #[must_use]
    pub fn stage_specs(&self) -> Vec<StageSpec> {
        self.stages
            .iter()
            .map(|s| StageSpec::new(&s.name, s.artifacts.iter().cloned()))
            .collect()
    }

    /// Builds a command handler for every stage.
    ///
    /// Fails if any stage has no command configured.
    pub fn command_handlers(&self) -> Result<Vec<Arc<dyn StageHandler>>, ConfigError> {
        self.stages
            .iter()
            .map(|stage| {
                let argv = stage.command.as_deref().unwrap_or_default();
                let (program, args) = argv.split_first().ok_or_else(|| {
                    ConfigError::Invalid(format!("stage '{}' has no command", stage.name))
                })?;
                let mut handler = CommandStage::new(&stage.name, program, args.to_vec());
                if let Some(seconds) = stage.timeout_seconds {
                    handler = handler.with_timeout(Duration::from_secs(seconds));
                }
                Ok(Arc::new(handler) as Arc<dyn StageHandler>)
            })
            .collect()
    }

    /// Absolute runs directory.
    #[must_use]
    pub fn runs_dir_in(&self, root: &Path) -> PathBuf {
        resolve(root, &self.runs_dir)
    }

    /// Absolute registry path.
    #[must_use]
    pub fn registry_path_in(&self, root: &Path) -> PathBuf {
        resolve(root, &self.registry_path)
    }
}

/// Resolves `path` against `root` unless it is already absolute.
#[must_use]
pub fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

/// Walks up from `start` to the first directory containing [`ROOT_MARKER`].
pub fn find_project_root(start: &Path) -> Result<PathBuf, ConfigError> {
    start
        .ancestors()
        .find(|dir| dir.join(ROOT_MARKER).is_file())
        .map(Path::to_path_buf)
        .ok_or_else(|| ConfigError::RootNotFound {
            start: start.to_path_buf(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = ClipflowConfig::default();
        config.validate().unwrap();
        assert_eq!(config.retry.max_attempts, 10);
        assert_eq!(config.privacy, Privacy::Private);
        assert_eq!(config.stage_specs().len(), 11);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(ROOT_MARKER),
            r#"{"privacy": "unlisted", "retry": {"max_attempts": 3}}"#,
        )
        .unwrap();

        let config = ClipflowConfig::load(dir.path()).unwrap();
        assert_eq!(config.privacy, Privacy::Unlisted);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.runs_dir_in(dir.path()), dir.path().join("runs"));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let dup = ClipflowConfig::new().with_stages(vec![
            StageConfig::new(StageSpec::new("search", ["a"])),
            StageConfig::new(StageSpec::new("search", ["b"])),
        ]);
        assert!(matches!(dup.validate(), Err(ConfigError::Invalid(_))));

        let no_artifacts = ClipflowConfig::new()
            .with_stages(vec![StageConfig::new(StageSpec::new("search", Vec::<String>::new()))]);
        assert!(no_artifacts.validate().is_err());

        let zero = ClipflowConfig::new().with_retry(RetryConfig::new().with_max_attempts(0));
        assert!(zero.validate().is_err());

        let bad_url = ClipflowConfig::new().with_sync(SyncSourceConfig::Http {
            url: "ftp://x".into(),
            timeout_seconds: 5,
        });
        assert!(bad_url.validate().is_err());
    }

    #[test]
    fn test_publish_stage_must_exist() {
        let config = ClipflowConfig::new()
            .with_stages(vec![StageConfig::new(StageSpec::new("search", ["a.json"]))]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("publish"));
    }

    #[test]
    fn test_command_handlers_require_commands() {
        let config = ClipflowConfig::new();
        assert!(config.command_handlers().is_err());

        let stages = vec![
            StageConfig::new(StageSpec::new("search", ["a.json"])).with_command(["echo", "hi"]),
        ];
        let handlers = ClipflowConfig::new().with_stages(stages).command_handlers().unwrap();
        assert_eq!(handlers.len(), 1);
        assert_eq!(handlers[0].name(), "search");
    }

    #[test]
    fn test_privacy_parse() {
        assert_eq!("Public".parse::<Privacy>().unwrap(), Privacy::Public);
        assert_eq!(Privacy::Unlisted.to_string(), "unlisted");
        assert!("secret".parse::<Privacy>().is_err());
    }

    #[test]
    fn test_sync_source_tagged() {
        let sync: SyncSourceConfig =
            serde_json::from_str(r#"{"kind": "http", "url": "https://example.org/feed"}"#).unwrap();
        assert_eq!(
            sync,
            SyncSourceConfig::Http {
                url: "https://example.org/feed".into(),
                timeout_seconds: 30
            }
        );
    }

    #[test]
    fn test_find_project_root_walks_up() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(ROOT_MARKER), "{}").unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(find_project_root(&nested).unwrap(), dir.path());

        let other = TempDir::new().unwrap();
        assert!(matches!(
            find_project_root(other.path()),
            Err(ConfigError::RootNotFound { .. })
        ));
    }
}
