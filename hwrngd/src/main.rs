use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::info;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

mod api;
mod config;
mod device;
mod i2c;
mod protocol;

use crate::api::{all_routes, Metrics, NodeState};
use crate::config::Config;
use crate::device::{AteccDevice, DeviceOptions};

#[derive(Parser, Debug)]
#[command(name = "hwrngd")]
#[command(about = "ATECC608A hardware entropy node")]
struct Args {
    /// Path to config file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = Config::load(args.config.as_deref());
    info!(
        "starting hwrngd on {} (bus {}, addr {:#04x})",
        config.listen,
        config.i2c_bus.display(),
        config.i2c_addr
    );

    let opts = DeviceOptions {
        auto_config: config.auto_config,
        auto_config_confirm: config.auto_config_confirm,
        max_failures: config.max_failures,
    };
    let bus_path = config.i2c_bus.clone();
    let addr = config.i2c_addr;
    let device = tokio::task::spawn_blocking(move || AteccDevice::open(&bus_path, addr, opts))
        .await?
        .context("device initialization failed")?;

    let state = Arc::new(NodeState {
        device: Arc::clone(&device),
        metrics: Metrics::new(),
    });

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {e}");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        let _ = shutdown_tx.send(true);
    });

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!("hwrngd listening on http://{}", config.listen);

    axum::serve(listener, all_routes(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await?;

    info!("shutting down, putting device to sleep");
    let device_for_sleep = Arc::clone(&device);
    tokio::task::spawn_blocking(move || device_for_sleep.sleep_device()).await?;
    Ok(())
}
