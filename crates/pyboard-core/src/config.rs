//! Controller configuration.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{policy::ProtectedFiles, traits::BaudRate};

/// Default read chunk size in bytes.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 256;

/// Default port poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Config load error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Settings consumed from the host environment.
///
/// Every field has a default, so an empty JSON object is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Baud rate used when none is chosen explicitly.
    pub baud_rate: BaudRate,

    /// Files destructive operations refuse to touch.
    pub protected_files: Vec<String>,

    /// Bytes per remote read when viewing a file.
    pub read_chunk_size: usize,

    /// Port monitor period.
    pub poll_interval_ms: u64,

    /// Upper bound on the initial raw REPL probe.
    pub handshake_timeout_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            baud_rate: BaudRate::default(),
            protected_files: ProtectedFiles::default().iter().map(String::from).collect(),
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            poll_interval_ms: u64::try_from(DEFAULT_POLL_INTERVAL.as_millis()).unwrap_or(500),
            handshake_timeout_ms: 2000,
        }
    }
}

impl ControllerConfig {
    /// Parse and validate a JSON document.
    ///
    /// # Errors
    /// Returns error on malformed JSON or out-of-range values.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, or defaults when `path` is `None`.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                let json = tokio::fs::read_to_string(path).await?;
                let config = Self::from_json(&json)?;
                tracing::debug!(path = %path.display(), ?config, "Loaded config");
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.read_chunk_size == 0 {
            return Err(ConfigError::Invalid("read_chunk_size must be non-zero".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be non-zero".into()));
        }
        Ok(())
    }

    /// Protected-file policy built from `protected_files`.
    #[must_use]
    pub fn protected(&self) -> ProtectedFiles {
        ProtectedFiles::new(&self.protected_files)
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}
