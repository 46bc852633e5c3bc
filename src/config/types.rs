//! Configuration Types

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::relay::DEFAULT_BUFFER_SIZE;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub forward: ForwardConfig,
    pub logging: LoggingConfig,
}

/// Forwarding configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ForwardConfig {
    /// Listen address, `host:port` or bare port
    pub listen: String,
    /// Target address, `host:port` or bare port
    pub target: String,
    /// Duplication address for target -> client traffic; empty disables it
    pub input: String,
    /// Duplication address for client -> target traffic; empty disables it
    pub output: String,
    pub buffer_size: usize,
    /// Zero means no timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Append-only log file; `None` logs to stdout only
    pub file: Option<PathBuf>,
}

/// Values given on the command line, applied over file and environment settings
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub listen: Option<String>,
    pub target: Option<String>,
    pub input: Option<String>,
    pub output: Option<String>,
    pub buffer_size: Option<usize>,
    pub connect_timeout_secs: Option<u64>,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
}

impl ForwardConfig {
    /// Dial timeout handed to the forwarder
    pub fn dial_timeout(&self) -> Option<Duration> {
        (!self.connect_timeout.is_zero()).then_some(self.connect_timeout)
    }
}

impl LoggingConfig {
    /// Log file path, treating an empty path as disabled
    pub fn log_file(&self) -> Option<&Path> {
        self.file
            .as_deref()
            .filter(|path| !path.as_os_str().is_empty())
    }
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            listen: String::new(),
            target: String::new(),
            input: String::new(),
            output: String::new(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            connect_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some(PathBuf::from("tcpdup.log")),
        }
    }
}
