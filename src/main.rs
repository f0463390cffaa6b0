mod config;
mod daemon;
mod discovery;
mod monitor;
mod output;

use anyhow::{anyhow, Context, Result};
use log::{error, info, LevelFilter};
use std::fs;
use std::str::FromStr;
use tokio::signal::unix::{signal, SignalKind};

use crate::config::{LogBackend, LoggingConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/winterhill/config.yaml".to_string());

    let config = load_config(&config_path)?;
    init_logger(&config.logging)?;

    info!("WinterHill receiver starting...");
    info!("Configuration loaded from: {}", config_path);

    let mut daemon = daemon::Daemon::new(config).await?;

    // Setup signal handling via tokio
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to setup SIGHUP handler")?;

    info!("Daemon started successfully");

    let result = loop {
        tokio::select! {
            result = daemon.poll() => {
                if let Err(e) = result {
                    error!("Daemon poll error: {}", e);
                    break Err(e);
                }
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully");
                break Ok(());
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully");
                break Ok(());
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading configuration");
                match load_config(&config_path) {
                    Ok(new_config) => daemon.reload_config(new_config).await?,
                    Err(e) => error!("Keeping current configuration: {:#}", e),
                }
            }
        }
    };

    daemon.shutdown().await?;
    info!("WinterHill receiver shutdown complete");
    result
}

fn load_config(path: &str) -> Result<config::Config> {
    let config_content =
        fs::read_to_string(path).context(format!("Failed to read config file: {}", path))?;
    serde_yaml::from_str(&config_content).context("Failed to parse configuration file")
}

fn init_logger(logging: &LoggingConfig) -> Result<()> {
    match logging.backend {
        LogBackend::Env => {
            // Use `env_logger` for logging. Systemd/journald will capture stdout/stderr.
            if std::env::var("RUST_LOG").is_err() {
                std::env::set_var("RUST_LOG", &logging.level);
            }
            env_logger::init();
        }
        LogBackend::Syslog => {
            let level = LevelFilter::from_str(&logging.level)
                .map_err(|_| anyhow!("Invalid log level: {}", logging.level))?;
            let formatter = syslog::Formatter3164 {
                facility: syslog::Facility::LOG_DAEMON,
                hostname: None,
                process: "winterhill-rx".to_string(),
                pid: std::process::id(),
            };
            let logger = syslog::unix(formatter)
                .map_err(|e| anyhow!("Failed to connect to syslog: {}", e))?;
            log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
                .map(|()| log::set_max_level(level))
                .map_err(|e| anyhow!("Failed to install syslog logger: {}", e))?;
        }
    }
    Ok(())
}
