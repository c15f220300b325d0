//! Prometheus exporter for MikroTik RouterOS devices.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use mikrotik_common::{DeviceConnector, SimulatedRouter, init_tracing};
use tokio::sync::watch;
use tracing::{error, info};

use mikrotik_exporter::{
    Controller, ControllerSettings, ExporterConfig, ExporterStats, HttpServer, ReporterRegistry,
    ScrapeBridge,
};

/// Prometheus exporter for MikroTik RouterOS devices.
#[derive(Parser, Debug)]
#[command(name = "mikrotik-exporter")]
#[command(about = "Export RouterOS statistics as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long, default_value = "mikrotik-exporter.json5")]
    config: PathBuf,

    /// HTTP listen address (overrides config).
    #[arg(long)]
    listen: Option<String>,

    /// Log level (overrides config).
    #[arg(long)]
    log_level: Option<String>,

    /// Serve an in-process simulated router instead of a real device.
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if !args.config.exists() {
        ExporterConfig::default()
            .write_to_file(&args.config)
            .with_context(|| format!("Failed to write {}", args.config.display()))?;
        anyhow::bail!(
            "No configuration found; wrote a default one to {}. Edit it and restart.",
            args.config.display()
        );
    }

    let mut config = ExporterConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    config.apply_env_overrides();

    if let Some(listen) = args.listen {
        config.listen = Some(listen);
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    init_tracing(&config.logging)?;
    config.validate()?;

    info!(
        router = %config.router.host,
        user = %config.router.user,
        attributes = config.attributes.len(),
        "Starting MikroTik exporter"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if !args.simulate {
        anyhow::bail!(
            "No RouterOS API driver is built into this binary; run with --simulate \
             or embed the library with your own DeviceConnector"
        );
    }

    let router = SimulatedRouter::demo(config.router.host.clone());
    let demo_task = router.spawn_demo_traffic(Duration::from_secs(1));
    info!("Serving a simulated router");
    let connector: Arc<dyn DeviceConnector> = Arc::new(router);

    let registry = Arc::new(ReporterRegistry::new(config.prefix.clone()));
    let stats = Arc::new(ExporterStats::new(&config.prefix));

    let controller = Controller::new(
        connector,
        config.attributes.clone(),
        ControllerSettings::from(&config),
        Arc::clone(&registry),
        Arc::clone(&stats),
    );

    let http_server = HttpServer::new(
        ScrapeBridge::new(Arc::clone(&registry), Arc::clone(&stats)),
        controller.state(),
        config.listen_addr()?,
        config.metrics_path.clone(),
    );

    let mut controller_task = tokio::spawn(controller.run(shutdown_rx.clone()));

    let mut http_task = tokio::spawn(http_server.run(shutdown_rx.clone()));

    let mut exit = Ok(());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate() => {
            info!("Received SIGTERM, shutting down...");
        }
        result = &mut controller_task => {
            exit = match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(anyhow::Error::new(e)),
                Err(e) => Err(anyhow::anyhow!("Controller task failed: {}", e)),
            };
        }
        result = &mut http_task => {
            exit = match result {
                Ok(Ok(())) => Err(anyhow::anyhow!("HTTP server stopped unexpectedly")),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(anyhow::anyhow!("HTTP server task failed: {}", e)),
            };
            if let Err(e) = &exit {
                error!(error = %e, "HTTP server error");
            }
        }
    }

    shutdown_tx.send(true)?;

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        if !controller_task.is_finished() {
            let _ = controller_task.await;
        }
        if !http_task.is_finished() {
            let _ = http_task.await;
        }
    })
    .await;

    demo_task.abort();

    info!(
        reporters = registry.len(),
        series = registry.series_count(),
        "Exporter stopped"
    );
    exit
}

/// Resolve on SIGTERM; never on platforms without it.
async fn terminate() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        std::future::pending::<()>().await;
    }
}
