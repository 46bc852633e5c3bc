//! Tests for configuration loading, overrides and validation

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use tempfile::NamedTempFile;

use tcpdup::config::{Config, ConfigManager, ConfigOverrides};

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn valid_config() -> Config {
    let mut config = Config::default();
    config.forward.listen = "8080".to_string();
    config.forward.target = "127.0.0.1:9000".to_string();
    config
}

#[test]
fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.forward.buffer_size, 8192);
    assert_eq!(config.forward.connect_timeout, Duration::from_secs(10));
    assert_eq!(config.forward.shutdown_timeout, Duration::from_secs(30));
    assert_eq!(config.logging.level, "info");
    assert_eq!(
        config.logging.log_file(),
        Some(PathBuf::from("tcpdup.log").as_path())
    );

    // listen and target have no default
    assert!(config.validate().is_err());
}

#[test]
fn test_load_from_file() {
    let file = write_config(
        r#"
[forward]
listen = "0.0.0.0:8080"
target = "10.0.0.1:80"
output = "127.0.0.1:9001"
buffer_size = 16384
connect_timeout = "2s 500ms"
shutdown_timeout = "1m"

[logging]
level = "debug"
file = ""
"#,
    );

    let config = ConfigManager::load_from_file(file.path()).unwrap();
    assert_eq!(config.forward.listen, "0.0.0.0:8080");
    assert_eq!(config.forward.target, "10.0.0.1:80");
    assert_eq!(config.forward.input, "");
    assert_eq!(config.forward.output, "127.0.0.1:9001");
    assert_eq!(config.forward.buffer_size, 16384);
    assert_eq!(config.forward.connect_timeout, Duration::from_millis(2500));
    assert_eq!(config.forward.shutdown_timeout, Duration::from_secs(60));
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.logging.log_file(), None);
    assert!(config.validate().is_ok());
}

#[test]
fn test_partial_file_keeps_defaults() {
    let file = write_config(
        r#"
[forward]
listen = "9000"
target = "9001"
"#,
    );

    let config = ConfigManager::load_from_file(file.path()).unwrap();
    assert_eq!(config.forward.buffer_size, 8192);
    assert_eq!(config.forward.dial_timeout(), Some(Duration::from_secs(10)));
    assert_eq!(config.logging.level, "info");
}

#[test]
fn test_malformed_file_is_an_error() {
    let file = write_config("[forward\nlisten = 8080");
    assert!(ConfigManager::load_from_file(file.path()).is_err());

    let file = write_config("[forward]\nconnect_timeout = \"soon\"\n");
    assert!(ConfigManager::load_from_file(file.path()).is_err());
}

#[test]
fn test_missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = ConfigManager::load_from_file(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.forward.buffer_size, 8192);
}

#[test]
fn test_cli_overrides_take_precedence() {
    let file = write_config(
        r#"
[forward]
listen = "8080"
target = "127.0.0.1:9000"
input = "127.0.0.1:9002"

[logging]
file = "/var/log/tcpdup.log"
"#,
    );

    let mut config = ConfigManager::load_from_file(file.path()).unwrap();
    let overridden = config.merge_with_cli_args(ConfigOverrides {
        target: Some("127.0.0.1:9100".to_string()),
        input: Some(String::new()),
        buffer_size: Some(4096),
        connect_timeout_secs: Some(0),
        log_level: Some("warn".to_string()),
        log_file: Some(PathBuf::new()),
        ..Default::default()
    });

    assert_eq!(
        overridden,
        ["target", "input", "buffer_size", "connect_timeout", "log_level", "log_file"]
    );
    assert_eq!(config.forward.listen, "8080");
    assert_eq!(config.forward.target, "127.0.0.1:9100");
    assert_eq!(config.forward.input, "");
    assert_eq!(config.forward.buffer_size, 4096);
    assert_eq!(config.forward.dial_timeout(), None);
    assert_eq!(config.logging.level, "warn");
    assert_eq!(config.logging.log_file(), None);
    assert!(config.validate().is_ok());
}

#[test]
fn test_no_overrides_reports_nothing() {
    let mut config = valid_config();
    assert!(config.merge_with_cli_args(ConfigOverrides::default()).is_empty());
    assert_eq!(config.forward.listen, "8080");
}

#[test]
fn test_validation_rejects_bad_values() {
    let mut config = valid_config();
    config.forward.buffer_size = 0;
    assert!(config.validate().is_err());

    let mut config = valid_config();
    config.forward.buffer_size = 2 * 1024 * 1024;
    assert!(config.validate().is_err());

    let mut config = valid_config();
    config.forward.connect_timeout = Duration::from_secs(7200);
    assert!(config.validate().is_err());

    let mut config = valid_config();
    config.logging.level = "loud".to_string();
    assert!(config.validate().is_err());

    let mut config = valid_config();
    config.forward.target = "  ".to_string();
    assert!(config.validate().is_err());

    assert!(valid_config().validate().is_ok());
}
