//! Periodic jobs: the two source pollers, the Fortuna reseed job and the
//! VirtIO seed job.
//!
//! Every loop is a `tokio::select!` over its interval and the process-wide
//! shutdown watch, so cancellation lands at the next loop head. Per-tick
//! errors are logged and swallowed; only the seed jobs carry circuit
//! breakers.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use trng_common::CircuitBreaker;

use crate::config::SeedSource;
use crate::context::ServiceContext;

/// Blocks consumed per selected source on each VirtIO seed tick.
const VIRTIO_SEED_BLOCKS: usize = 4;
/// Bytes requested from the Fortuna node per poll.
const FORTUNA_POLL_BYTES: usize = 256;
/// Independent hardware seeds fetched per reseed.
const RESEED_SEED_COUNT: usize = 5;

#[derive(Deserialize)]
struct SingleBlock {
    data: String,
}

#[derive(Deserialize)]
struct MultiBlock {
    data: Vec<String>,
}

pub fn spawn_all(
    ctx: &Arc<ServiceContext>,
    shutdown: &watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut handles = vec![
        tokio::spawn(trng_poll_loop(Arc::clone(ctx), shutdown.clone())),
        tokio::spawn(fortuna_poll_loop(Arc::clone(ctx), shutdown.clone())),
        tokio::spawn(reseed_loop(Arc::clone(ctx), shutdown.clone())),
    ];
    if ctx.config.virtio_url.is_some() {
        handles.push(tokio::spawn(virtio_seed_loop(
            Arc::clone(ctx),
            shutdown.clone(),
        )));
    }
    handles
}

pub(crate) async fn trng_poll_loop(ctx: Arc<ServiceContext>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_millis(ctx.config.trng_poll_ms));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                match poll_trng_once(&ctx).await {
                    Ok(bytes) => {
                        ctx.metrics.trng_polls.fetch_add(1, Ordering::Relaxed);
                        ctx.metrics.mark_trng_success();
                        debug!("trng poll stored {bytes} bytes");
                    }
                    Err(e) => {
                        ctx.metrics.trng_poll_errors.fetch_add(1, Ordering::Relaxed);
                        warn!("trng poll failed: {e}");
                    }
                }
            }
        }
    }
    info!("trng poller stopped");
}

async fn poll_trng_once(ctx: &ServiceContext) -> anyhow::Result<usize> {
    let url = format!("{}/generate", ctx.config.hwrng_url);
    let body: SingleBlock = ctx
        .client
        .get(&url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let bytes = hex::decode(&body.data)?;
    // the quality monitors see every byte that reaches the TRNG queue
    ctx.quality.record(&bytes);
    let len = bytes.len();
    ctx.trng_queue.push(bytes);
    Ok(len)
}

pub(crate) async fn fortuna_poll_loop(
    ctx: Arc<ServiceContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(ctx.config.fortuna_poll_ms));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                match poll_fortuna_once(&ctx).await {
                    Ok(()) => {
                        ctx.metrics.fortuna_polls.fetch_add(1, Ordering::Relaxed);
                        ctx.metrics.mark_fortuna_success();
                    }
                    Err(e) => {
                        ctx.metrics.fortuna_poll_errors.fetch_add(1, Ordering::Relaxed);
                        warn!("fortuna poll failed: {e}");
                    }
                }
            }
        }
    }
    info!("fortuna poller stopped");
}

async fn poll_fortuna_once(ctx: &ServiceContext) -> anyhow::Result<()> {
    let url = format!(
        "{}/generate?size={FORTUNA_POLL_BYTES}",
        ctx.config.fortuna_url
    );
    let body: SingleBlock = ctx
        .client
        .get(&url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    ctx.fortuna_queue.push(hex::decode(&body.data)?);
    Ok(())
}

pub(crate) async fn reseed_loop(ctx: Arc<ServiceContext>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(ctx.config.seed_interval_s));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut breaker = CircuitBreaker::default();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                if breaker.is_open() {
                    debug!("reseed breaker open, skipping tick");
                    continue;
                }
                match reseed_once(&ctx).await {
                    Ok(()) => {
                        breaker.record_success();
                        ctx.metrics.reseeds.fetch_add(1, Ordering::Relaxed);
                        ctx.metrics.mark_reseed_success();
                    }
                    Err(e) => {
                        breaker.record_failure();
                        ctx.metrics.reseed_errors.fetch_add(1, Ordering::Relaxed);
                        warn!("fortuna reseed failed: {e}");
                    }
                }
            }
        }
    }
    info!("reseed job stopped");
}

/// Fetch fresh hardware seeds and hand them to the Fortuna node.
async fn reseed_once(ctx: &ServiceContext) -> anyhow::Result<()> {
    let url = format!(
        "{}/generate?count={RESEED_SEED_COUNT}",
        ctx.config.hwrng_url
    );
    let body: MultiBlock = ctx
        .client
        .get(&url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    for seed in &body.data {
        hex::decode(seed)?;
    }
    ctx.client
        .post(format!("{}/seed", ctx.config.fortuna_url))
        .json(&serde_json::json!({ "seeds": body.data }))
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

pub(crate) async fn virtio_seed_loop(
    ctx: Arc<ServiceContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(ctx.config.seed_interval_s));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut breaker = CircuitBreaker::default();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                if breaker.is_open() {
                    debug!("virtio breaker open, skipping tick");
                    continue;
                }
                let bytes = collect_seed_bytes(&ctx, ctx.config.virtio_source);
                if bytes.is_empty() {
                    // nothing queued yet; starving is not a delivery failure
                    continue;
                }
                match seed_virtio_once(&ctx, &bytes).await {
                    Ok(()) => {
                        breaker.record_success();
                        ctx.metrics.virtio_seeds.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        breaker.record_failure();
                        ctx.metrics.virtio_seed_errors.fetch_add(1, Ordering::Relaxed);
                        warn!("virtio seed failed: {e}");
                    }
                }
            }
        }
    }
    info!("virtio seed job stopped");
}

/// Consume blocks from the configured source queues for VirtIO seeding.
pub(crate) fn collect_seed_bytes(ctx: &ServiceContext, source: SeedSource) -> Vec<u8> {
    let mut bytes = Vec::new();
    if matches!(source, SeedSource::Trng | SeedSource::Both) {
        for block in ctx.trng_queue.get(VIRTIO_SEED_BLOCKS, 0, true) {
            bytes.extend(block.data);
        }
    }
    if matches!(source, SeedSource::Fortuna | SeedSource::Both) {
        for block in ctx.fortuna_queue.get(VIRTIO_SEED_BLOCKS, 0, true) {
            bytes.extend(block.data);
        }
    }
    bytes
}

async fn seed_virtio_once(ctx: &ServiceContext, bytes: &[u8]) -> anyhow::Result<()> {
    let base = ctx
        .config
        .virtio_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("virtio url not configured"))?;
    ctx.client
        .post(format!("{base}/seed"))
        .json(&serde_json::json!({ "data": hex::encode(bytes) }))
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}
