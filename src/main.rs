//! tcpdup - TCP forwarder with traffic duplication
//!
//! Relays every connection accepted on `--listen` to `--target`, mirroring
//! client -> target bytes to `--output` and target -> client bytes to `--input`.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tcpdup::config::{Config, ConfigManager, ConfigOverrides};
use tcpdup::{resolve, Forwarder, ShutdownCoordinator};

/// CLI arguments for tcpdup
#[derive(Parser, Debug)]
#[command(name = "tcpdup")]
#[command(about = "tcpdup - TCP forwarder with traffic duplication")]
#[command(version)]
#[command(long_about = "
tcpdup - TCP forwarder with traffic duplication

Relays every connection accepted on the listen address to the target address.
Client -> target bytes are mirrored to the output address and target -> client
bytes to the input address, when those are given.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Environment variables
3. Configuration file
4. Built-in defaults

Environment variables:
  TCPDUP_LISTEN            - Listen address (e.g., 0.0.0.0:8080)
  TCPDUP_TARGET            - Target address (e.g., 8.8.8.8:8080)
  TCPDUP_INPUT             - Input duplication address
  TCPDUP_OUTPUT            - Output duplication address
  TCPDUP_BUFFER_SIZE       - Copy buffer size in bytes
  TCPDUP_CONNECT_TIMEOUT   - Dial timeout (e.g., 10s, 0s disables)
  TCPDUP_LOG_LEVEL         - Log level (trace, debug, info, warn, error)
  TCPDUP_LOG_FILE          - Log file path (empty disables)
")]
pub struct CliArgs {
    /// Local address (required), eg: 0.0.0.0:8080
    #[arg(long, help = "local address (required), eg: 0.0.0.0:8080")]
    pub listen: Option<String>,

    /// Destination address (required), eg: 8.8.8.8:8080
    #[arg(long, help = "destination address (required), eg: 8.8.8.8:8080")]
    pub target: Option<String>,

    /// Input duplication address (optional)
    #[arg(long, help = "input duplication address (optional), eg: 127.0.0.1:8081")]
    pub input: Option<String>,

    /// Output duplication address (optional)
    #[arg(long, help = "output duplication address (optional), eg: 127.0.0.1:8082")]
    pub output: Option<String>,

    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "tcpdup.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Log file path, empty to disable
    #[arg(long, help = "Log file path (empty to log to stdout only)")]
    pub log_file: Option<PathBuf>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Copy buffer size in bytes
    #[arg(long, help = "Buffer size in bytes")]
    pub buffer_size: Option<usize>,

    /// Dial timeout in seconds, 0 disables
    #[arg(long, help = "Connect timeout in seconds")]
    pub connect_timeout: Option<u64>,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

impl CliArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            listen: self.listen.clone(),
            target: self.target.clone(),
            input: self.input.clone(),
            output: self.output.clone(),
            buffer_size: self.buffer_size,
            connect_timeout_secs: self.connect_timeout,
            log_level: if self.verbose {
                Some("debug".to_string())
            } else {
                self.log_level.clone()
            },
            log_file: self.log_file.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Load configuration with priority: CLI args > environment > config file > defaults
    let config_file = args.config.exists();
    let mut config = if config_file {
        ConfigManager::load_from_file(&args.config)?
    } else {
        ConfigManager::load_from_env()?
    };
    let overridden = config.merge_with_cli_args(args.overrides());

    if config.forward.listen.is_empty() || config.forward.target.is_empty() {
        CliArgs::command().print_help()?;
        std::process::exit(2);
    }

    config
        .validate()
        .context("Final configuration validation failed")?;

    init_tracing(&config)?;

    if config_file {
        info!("Loaded configuration from: {}", args.config.display());
    } else {
        info!(
            "Configuration file not found at {}, using environment and defaults",
            args.config.display()
        );
    }
    for name in overridden {
        info!("CLI override: {}", name);
    }

    if args.validate_config {
        info!("Configuration is valid");
        log_config(&config);
        return Ok(());
    }

    info!("Service starting:");
    log_config(&config);

    let listen = resolve(&config.forward.listen).await.with_context(|| {
        format!("invalid listen address: {}", config.forward.listen)
    })?;
    let target = resolve(&config.forward.target).await.with_context(|| {
        format!("invalid target address: {}", config.forward.target)
    })?;

    let mut forwarder = Forwarder::new();
    forwarder.set_input_dup(config.forward.input.clone());
    forwarder.set_output_dup(config.forward.output.clone());
    forwarder.set_buffer_size(config.forward.buffer_size);
    forwarder.set_connect_timeout(config.forward.dial_timeout());
    forwarder.open(&listen, &target).await?;

    let coordinator = ShutdownCoordinator::new(config.forward.shutdown_timeout);
    tokio::select! {
        _ = forwarder.wait() => {
            error!("Accept loop stopped unexpectedly");
        }
        result = coordinator.listen_for_signals() => {
            if let Err(e) = result {
                error!("Error setting up signal handlers: {}", e);
            }
            coordinator.shutdown_forwarder(&forwarder).await?;
        }
    }

    info!("Service shutdown complete");
    Ok(())
}

fn log_config(config: &Config) {
    info!("config: listen {}", config.forward.listen);
    info!("config: target {}", config.forward.target);
    info!("config: input {}", config.forward.input);
    info!("config: output {}", config.forward.output);
    info!("config: buffer size {} bytes", config.forward.buffer_size);
    info!("config: connect timeout {:?}", config.forward.dial_timeout());
}

/// Initialize tracing/logging to stdout and, when configured, an append-only file
fn init_tracing(config: &Config) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    let file_layer = match config.logging.log_file() {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_target(false)
                    .with_ansi(false),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(file_layer)
        .with(env_filter)
        .init();

    Ok(())
}
