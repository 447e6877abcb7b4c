use anyhow::{Context, Result};
use clap::Parser;
use multi_relay::{DEFAULT_CONFIG_FILE, load_config, start_all};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(version, about = "Relay TCP, HTTP and WebSocket traffic according to configured rules")]
struct Cli {
    /// Path to the TOML rule file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let config = load_config(&cli.config)?;
    let rules = config.rules()?;
    info!(
        config_file = %cli.config.display(),
        listen_ip = %config.listen.ip,
        rules = rules.len(),
        "Configuration loaded"
    );

    let running = start_all(rules, config.listen.ip).await;
    if running.is_empty() {
        warn!("No proxies running");
    }

    shutdown_signal().await?;
    info!(proxies = running.len(), "Shutting down");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl-C")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_to_config_toml() {
        let cli = Cli::try_parse_from(["multi-relay"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("config.toml"));
    }

    #[test]
    fn cli_accepts_config_path() {
        let cli = Cli::try_parse_from(["multi-relay", "-c", "/etc/relay/rules.toml"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/relay/rules.toml"));

        let cli = Cli::try_parse_from(["multi-relay", "--config", "other.toml"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("other.toml"));
    }

    #[test]
    fn cli_rejects_unknown_flags() {
        assert!(Cli::try_parse_from(["multi-relay", "--verbose"]).is_err());
    }
}
