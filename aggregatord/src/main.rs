use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures_util::future::join_all;
use log::info;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

mod api;
mod config;
mod context;
mod format;
mod metrics;
mod poller;

use crate::api::all_routes;
use crate::config::Config;
use crate::context::ServiceContext;

/// How long in-flight poller requests get to finish after cancellation.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "aggregatord")]
#[command(about = "Entropy aggregator node")]
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
        "starting aggregatord on {} (hwrng {}, fortuna {})",
        config.listen, config.hwrng_url, config.fortuna_url
    );

    let ctx = ServiceContext::new(config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let jobs = poller::spawn_all(&ctx, &shutdown_rx);

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

    let listener = TcpListener::bind(&ctx.config.listen)
        .await
        .with_context(|| format!("failed to bind {}", ctx.config.listen))?;
    info!("aggregatord listening on http://{}", ctx.config.listen);

    let mut serve_shutdown = shutdown_rx.clone();
    axum::serve(listener, all_routes(ctx))
        .with_graceful_shutdown(async move {
            let _ = serve_shutdown.changed().await;
        })
        .await?;

    // give in-flight polls a bounded window to wind down
    if tokio::time::timeout(SHUTDOWN_GRACE, join_all(jobs))
        .await
        .is_err()
    {
        info!("grace period elapsed with jobs still in flight");
    }
    info!("aggregatord stopped");
    Ok(())
}
