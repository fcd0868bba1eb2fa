use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::Parser;
use log::info;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use trng_common::Fortuna;

mod api;
mod config;

use crate::api::{all_routes, FortunaState, Metrics};
use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "fortunad")]
#[command(about = "Fortuna CSPRNG node")]
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

    // Boot seed from the OS; the aggregator's reseed job replaces it with
    // hardware entropy within one seed interval.
    let mut seed = [0u8; 64];
    OsRng.fill_bytes(&mut seed);
    let fortuna = Fortuna::new(&seed).context("failed to build generator")?;

    let state = Arc::new(FortunaState {
        fortuna: Mutex::new(fortuna),
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
    info!("fortunad listening on http://{}", config.listen);

    axum::serve(listener, all_routes(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await?;
    info!("fortunad stopped");
    Ok(())
}
