//! Configuration file loading for the batchq binary.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use batchq_queue::QueueConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

/// Top-level configuration file.
///
/// ```toml
/// [queue]
/// max_concurrent = 2
/// state_file = "~/.batchq/queue.json"
///
/// [logging]
/// dir = "~/.batchq/logs"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for rolling log files; console only when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// Configuration loader.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load `explicit` if given, else `~/.batchq/config.toml` if it exists,
    /// else defaults. Paths are tilde-expanded and the state file defaults
    /// to `~/.batchq/queue.json`.
    pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
        let mut config = match explicit {
            Some(path) => {
                let path = Self::expand(path);
                if !path.exists() {
                    return Err(ConfigError::NotFound(path.display().to_string()));
                }
                Self::load_file(&path)?
            }
            None => {
                let default_path = batchq_dir().join("config.toml");
                if default_path.exists() {
                    Self::load_file(&default_path)?
                } else {
                    Config::default()
                }
            }
        };
        config.normalize()?;
        Ok(config)
    }

    /// Parse configuration from a string without normalizing it.
    pub fn load_str(content: &str) -> Result<Config, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    fn load_file(path: &Path) -> Result<Config, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::load_str(&content)
    }

    /// Expand shell-style paths (e.g., `~/.batchq`).
    pub fn expand(path: &Path) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned())
    }
}

impl Config {
    fn normalize(&mut self) -> Result<(), ConfigError> {
        if self.queue.max_concurrent == 0 {
            return Err(ConfigError::InvalidValue {
                field: "queue.max_concurrent".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        let state_file = self
            .queue
            .state_file
            .take()
            .unwrap_or_else(|| batchq_dir().join("queue.json"));
        self.queue.state_file = Some(ConfigLoader::expand(&state_file));
        self.logging.dir = self.logging.dir.as_deref().map(ConfigLoader::expand);
        Ok(())
    }
}

/// `~/.batchq`, or `.batchq` when there is no home directory.
pub(crate) fn batchq_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".batchq"))
        .unwrap_or_else(|| PathBuf::from(".batchq"))
}
