//! # rtg-gateway
//!
//! Gateway server binary: loads settings, sets up logging and metrics, serves
//! WebSocket sessions, and drains them on Ctrl-C or SIGTERM.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rtg_logging::LogFormat;
use rtg_server::websocket::handler::EchoHandler;
use rtg_server::{GatewayServer, Limits, ServerConfig};
use rtg_settings::GatewaySettings;
use rtg_settings::loader::parse_addr;

/// Real-time WebSocket gateway.
#[derive(Parser, Debug)]
#[command(name = "rtg-gateway", about = "Real-time WebSocket gateway", version)]
struct Cli {
    /// Settings file (defaults to `$RTG_CONFIG`, then `./rtgateway.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address as `:port` or `host:port` (overrides settings).
    #[arg(long)]
    addr: Option<String>,

    /// Log level or filter directive (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Log format, `compact` or `json` (overrides settings).
    #[arg(long)]
    log_format: Option<LogFormat>,
}

impl Cli {
    fn settings_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(rtg_settings::settings_path)
    }

    /// Apply command-line overrides on top of loaded settings.
    fn apply(&self, settings: &mut GatewaySettings) -> Result<()> {
        if let Some(addr) = &self.addr {
            let (host, port) =
                parse_addr(addr).with_context(|| format!("Invalid --addr value: {addr}"))?;
            if let Some(host) = host {
                settings.server.host = host;
            }
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if let Some(format) = self.log_format {
            settings.logging.format = format;
        }
        settings.validate().context("Invalid settings")
    }
}

fn load(cli: &Cli, path: &Path) -> Result<GatewaySettings> {
    let mut settings = rtg_settings::load_settings_from_path(path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    cli.apply(&mut settings)?;
    Ok(settings)
}

/// Resolve when the process is asked to stop.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("Failed to listen for ctrl-c")?;
                tracing::info!("Ctrl-C received");
            }
            _ = term.recv() => tracing::info!("SIGTERM received"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for ctrl-c")?;
        tracing::info!("Ctrl-C received");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = cli.settings_path();
    let settings = rtg_logging::with_bootstrap(|| load(&cli, &path))?;

    rtg_logging::init_subscriber(&settings.logging.level, settings.logging.format);
    tracing::debug!(path = %path.display(), "settings loaded");

    let prometheus =
        rtg_server::metrics::install_recorder().context("Failed to install metrics recorder")?;

    let server = GatewayServer::new(
        ServerConfig::from_settings(&settings.server),
        Limits::from_settings(&settings.limits),
        Arc::new(EchoHandler),
    )
    .with_prometheus(prometheus);

    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!("rt-gateway listening on ws://{addr}/ws");

    shutdown_signal().await?;

    tracing::info!("Shutting down...");
    let shutdown_timeout = Duration::from_millis(settings.server.shutdown_timeout_ms);
    let stopped = tokio::time::timeout(shutdown_timeout, async {
        let report = server.shutdown().await;
        let _ = handle.await;
        report
    })
    .await;

    match stopped {
        Ok(Some(report)) => tracing::info!(
            sessions = report.sessions,
            graceful = report.graceful,
            forced = report.forced,
            failed = report.failed,
            "Shutdown complete"
        ),
        Ok(None) => tracing::info!("Shutdown complete"),
        Err(_) => tracing::warn!(
            timeout_ms = settings.server.shutdown_timeout_ms,
            "Shutdown timed out, exiting"
        ),
    }
    Ok(())
}
