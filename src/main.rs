//! Monitors the reachability of the network devices registered in the IT
//! dashboard and serves their status.
//!
//! API will be:
//!
//! - `GET /devices`: return a JSON list of devices as last observed.
//! - `POST /devices`: register a new device.
//! - `GET /devices/stats`: counts by status and average uptime.
//! - `POST /devices/check`: run a monitoring pass now.
//! - `POST /devices/refresh`: reload devices from the store without probing.
//! - `GET /units`: units devices can belong to.
//!
//! Run with
//!
//! ```not_rust
//! MONITOR_CONFIG_DIR=. cargo run
//! ```

use device_monitor::config::load_bootstrap_config;
use device_monitor::core::*;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "device_monitor=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        tracing::error!("device monitor stopped: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error + Send + Sync>> {
    let config = load_bootstrap_config()?;

    let store: Arc<dyn DeviceStore> = match &config.store {
        Some(store) => Arc::new(RestStore::new(store)?),
        None => {
            tracing::warn!("no store configured, devices are kept in memory only");
            Arc::new(MemoryStore::default())
        }
    };
    let prober = build_prober(&config.monitor)?;
    let alarm = config.alarm.as_ref().map(Alarm::new).transpose()?;

    // 监控事件用的channel
    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(Logger::new(alarm).run(rx));

    let monitor = Arc::new(
        Monitor::new(
            prober,
            store,
            Doctor::new(config.monitor.uptime_policy()),
            config.monitor.probe_timeout(),
        )
        .with_events(tx),
    );
    match monitor.refresh().await {
        Ok(count) => tracing::info!(count, "loaded devices"),
        Err(e) => tracing::warn!("could not load devices, waiting for first tick: {e}"),
    }

    let handle = schedule_monitoring(monitor.clone(), config.monitor.interval());

    let addr: SocketAddr = config
        .server
        .addr
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("server.addr {}: {e}", config.server.addr)))?;
    let served = listen(addr, Arc::new(AppState { monitor }), shutdown_signal()).await;

    handle.stop().await;
    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
