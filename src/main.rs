//! sdlab - laboratory sensor measurement daemon.
//!
//! Enumerates sensors on 1-Wire and I²C buses, samples user-selected
//! channels as transient series or persistent monitors, and exposes the
//! whole surface over JSON-RPC on a filesystem socket and a TCP port.

mod config;
mod db;
mod monitor;
mod reading;
mod rpc;
mod sampler;
mod sensors;
mod series;

use config::Config;
use db::Store;
use monitor::MonitorEngine;
use rpc::Lab;
use sensors::{load_sensor_defs, SensorRegistry, SysfsRegistry};
use series::SeriesEngine;

use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| config::DEFAULT_CONFIG_PATH.to_string());
    let cfg = match Config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(err) => {
            // logging is not up yet
            eprintln!("error loading configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = init_logging(&cfg) {
        eprintln!("error opening log: {err}");
        return ExitCode::FAILURE;
    }

    tracing::info!("using database at {}", cfg.database.dsn);

    let defs = load_sensor_defs(&cfg.sensors_path);
    let registry: Arc<dyn SensorRegistry> =
        Arc::new(SysfsRegistry::new(defs, cfg.i2c.buses.clone()));
    if let Err(err) = registry.rescan() {
        tracing::error!("error scanning sensors: {}", err);
        return ExitCode::FAILURE;
    }

    let store = match Store::open(&cfg.database) {
        Ok(store) => store,
        Err(err) => {
            tracing::error!("error opening database: {}", err);
            return ExitCode::FAILURE;
        }
    };
    tracing::info!("database connected");

    let monitors = Arc::new(MonitorEngine::new(store, registry.clone()));
    if let Err(err) = monitors.load_run_monitors() {
        tracing::error!("error running monitors: {}", err);
    }

    let series = Arc::new(SeriesEngine::new(registry.clone(), cfg.series.clone()));
    let lab = Arc::new(Lab {
        registry,
        series,
        monitors,
    });

    let endpoints = rpc::start(&cfg, lab).await;
    if endpoints.is_empty() {
        tracing::error!("no interfaces started");
        return ExitCode::FAILURE;
    }

    shutdown_signal().await;
    // monitor loops are not drained; the next start recovers them
    ExitCode::SUCCESS
}

/// Route logs to the configured file, or stderr when none is set.
fn init_logging(cfg: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("sdlab=info".parse()?);

    if cfg.log.is_empty() {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&cfg.log)?;
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file)),
            )
            .with(filter)
            .init();
    }
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("caught interrupt signal, exiting"),
        _ = terminate => tracing::info!("caught terminate signal, exiting"),
    }
}
