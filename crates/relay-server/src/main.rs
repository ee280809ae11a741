//! Relay server entry point.
//!
//! Starts the TCP relay that controlled endpoints and control consoles
//! connect to.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use relay_server::{RelayConfig, default_config_path};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Remote-control relay server
#[derive(Parser, Debug)]
#[command(name = "relay-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Config file (defaults to `<config dir>/remote-relay/config.json`)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Seconds without a heartbeat before an endpoint is evicted
    #[arg(long, value_name = "SECS")]
    heartbeat_timeout: Option<u64>,

    /// Seconds between liveness sweeps
    #[arg(long, value_name = "SECS")]
    sweep_interval: Option<u64>,

    /// Seconds a console may stay silent before it is pinged
    #[arg(long, value_name = "SECS")]
    control_idle_timeout: Option<u64>,
}

impl Args {
    fn apply(&self, config: &mut RelayConfig) {
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(secs) = self.heartbeat_timeout {
            config.heartbeat_timeout_secs = secs;
        }
        if let Some(secs) = self.sweep_interval {
            config.sweep_interval_secs = secs;
        }
        if let Some(secs) = self.control_idle_timeout {
            config.control_idle_timeout_secs = secs;
        }
    }
}

/// Set up logging with file output for debugging.
/// In debug builds, defaults to debug level and logs to timestamped file.
/// In release builds, defaults to info level and logs to stderr.
fn setup_logging() {
    let default_level = if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "relay_server={default_level},relay_proto={default_level}"
        ))
    });

    if cfg!(debug_assertions) {
        let temp_dir = std::env::temp_dir();
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let log_filename = format!("relay-server-{timestamp}.log");
        let log_path = temp_dir.join(&log_filename);

        #[cfg(unix)]
        {
            let symlink_path = temp_dir.join("relay-server.log");
            let _ = std::fs::remove_file(&symlink_path);
            let _ = std::os::unix::fs::symlink(&log_path, &symlink_path);
        }

        let file_appender = tracing_appender::rolling::never(&temp_dir, &log_filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        std::mem::forget(guard);

        let file_layer = fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .with_line_number(true);

        let stderr_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .with_target(true)
            .with_line_number(true);

        tracing_subscriber::registry()
            .with(file_layer)
            .with(stderr_layer)
            .with(filter)
            .init();

        eprintln!("Logging to: {} (and stderr)", log_path.display());
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    setup_logging();

    let config_path = args.config.clone().or_else(default_config_path);
    let mut config = match &config_path {
        Some(path) => RelayConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => {
            warn!("No config directory available, using defaults");
            RelayConfig::default()
        }
    };
    args.apply(&mut config);
    config.validate().context("Invalid relay configuration")?;

    info!("Starting relay server...");

    let watch_path = config_path.filter(|path| path.parent().is_some_and(Path::is_dir));
    relay_server::run(config.settings(), watch_path)
        .await
        .context("Relay server failed")?;

    info!("Relay server stopped");
    Ok(())
}
