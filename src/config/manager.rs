//! Configuration Manager

use super::{Config, ConfigOverrides};
use crate::Result;
use anyhow::{bail, Context};
use std::path::{Path, PathBuf};

const MIN_BUFFER_SIZE: usize = 1024;
const MAX_BUFFER_SIZE: usize = 1048576;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file, then apply environment overrides
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let mut config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            config.apply_env()?;
            Ok(config)
        } else {
            Self::load_from_env()
        }
    }

    /// Load configuration from environment variables over the defaults
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();
        config.apply_env()?;
        Ok(config)
    }
}

impl Config {
    /// Override fields from `TCPDUP_*` environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(listen) = var("TCPDUP_LISTEN") {
            self.forward.listen = listen;
        }

        if let Some(target) = var("TCPDUP_TARGET") {
            self.forward.target = target;
        }

        if let Some(input) = var("TCPDUP_INPUT") {
            self.forward.input = input;
        }

        if let Some(output) = var("TCPDUP_OUTPUT") {
            self.forward.output = output;
        }

        if let Some(buffer_size) = var("TCPDUP_BUFFER_SIZE") {
            self.forward.buffer_size = buffer_size
                .parse::<usize>()
                .with_context(|| format!("Invalid TCPDUP_BUFFER_SIZE: {}", buffer_size))?;
        }

        if let Some(timeout) = var("TCPDUP_CONNECT_TIMEOUT") {
            self.forward.connect_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid TCPDUP_CONNECT_TIMEOUT: {}", timeout))?;
        }

        if let Some(log_level) = var("TCPDUP_LOG_LEVEL") {
            self.logging.level = log_level;
        }

        if let Some(log_file) = var("TCPDUP_LOG_FILE") {
            self.logging.file = non_empty_path(log_file);
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_forward_config()
            .with_context(|| "Forward configuration validation failed")?;

        self.validate_logging_config()
            .with_context(|| "Logging configuration validation failed")?;

        Ok(())
    }

    fn validate_forward_config(&self) -> Result<()> {
        if self.forward.listen.trim().is_empty() {
            bail!("listen address is required");
        }

        if self.forward.target.trim().is_empty() {
            bail!("target address is required");
        }

        if self.forward.buffer_size < MIN_BUFFER_SIZE {
            bail!("buffer_size must be at least {} bytes", MIN_BUFFER_SIZE);
        }

        if self.forward.buffer_size > MAX_BUFFER_SIZE {
            bail!("buffer_size cannot exceed 1MB");
        }

        if self.forward.connect_timeout.as_secs() > 3600 {
            bail!("connect_timeout cannot exceed 1 hour");
        }

        Ok(())
    }

    fn validate_logging_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            bail!("logging.level must be one of: {}", valid_log_levels.join(", "));
        }

        Ok(())
    }

    /// Merge with CLI arguments.
    ///
    /// Returns the names of the settings that were overridden, for logging once
    /// tracing is up.
    pub fn merge_with_cli_args(&mut self, overrides: ConfigOverrides) -> Vec<&'static str> {
        let mut applied = Vec::new();

        if let Some(listen) = overrides.listen {
            self.forward.listen = listen;
            applied.push("listen");
        }

        if let Some(target) = overrides.target {
            self.forward.target = target;
            applied.push("target");
        }

        if let Some(input) = overrides.input {
            self.forward.input = input;
            applied.push("input");
        }

        if let Some(output) = overrides.output {
            self.forward.output = output;
            applied.push("output");
        }

        if let Some(buffer_size) = overrides.buffer_size {
            self.forward.buffer_size = buffer_size;
            applied.push("buffer_size");
        }

        if let Some(timeout_secs) = overrides.connect_timeout_secs {
            self.forward.connect_timeout = std::time::Duration::from_secs(timeout_secs);
            applied.push("connect_timeout");
        }

        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
            applied.push("log_level");
        }

        if let Some(log_file) = overrides.log_file {
            self.logging.file = non_empty_path(log_file);
            applied.push("log_file");
        }

        applied
    }
}

fn non_empty_path(path: impl Into<PathBuf>) -> Option<PathBuf> {
    let path = path.into();
    (!path.as_os_str().is_empty()).then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    #[test]
    fn test_env_vars_override_defaults() {
        let vars: HashMap<&str, &str> = [
            ("TCPDUP_LISTEN", "8080"),
            ("TCPDUP_TARGET", "127.0.0.1:8000"),
            ("TCPDUP_CONNECT_TIMEOUT", "2s"),
            ("TCPDUP_LOG_FILE", ""),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_vars(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.forward.listen, "8080");
        assert_eq!(config.forward.target, "127.0.0.1:8000");
        assert_eq!(config.forward.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.logging.file, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_env_buffer_size() {
        let mut config = Config::default();
        let result = config.apply_vars(|key| {
            (key == "TCPDUP_BUFFER_SIZE").then(|| "lots".to_string())
        });
        assert!(result.is_err());
    }
}
