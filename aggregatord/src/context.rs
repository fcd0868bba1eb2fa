use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use serde::Deserialize;
use trng_common::{BoundedQueue, QualityMonitor};

use crate::config::Config;
use crate::metrics::Metrics;

/// Queue a `/data` request draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Trng,
    Fortuna,
}

/// Everything the handlers and the scheduler share. Built once in `main`
/// and passed around as `Arc<ServiceContext>`; no module-level state.
pub struct ServiceContext {
    pub trng_queue: BoundedQueue,
    pub fortuna_queue: BoundedQueue,
    pub quality: QualityMonitor,
    pub metrics: Metrics,
    pub consume: AtomicBool,
    pub client: reqwest::Client,
    pub config: Config,
}

impl ServiceContext {
    pub fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.http_timeout_ms))
            .build()
            .context("failed to build http client")?;
        Ok(Arc::new(Self {
            trng_queue: BoundedQueue::new(config.queue_size),
            fortuna_queue: BoundedQueue::new(config.queue_size),
            quality: QualityMonitor::new(config.apt_window),
            metrics: Metrics::new(),
            consume: AtomicBool::new(config.consume_default),
            client,
            config,
        }))
    }

    pub fn queue_for(&self, source: DataSource) -> &BoundedQueue {
        match source {
            DataSource::Trng => &self.trng_queue,
            DataSource::Fortuna => &self.fortuna_queue,
        }
    }
}
