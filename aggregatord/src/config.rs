use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::warn;
use serde::Deserialize;
use trng_common::envcfg::{env_flag, env_or, env_or_string};

const DEFAULT_CONFIG_PATH: &str = "/etc/entropyd/aggregatord.toml";
const ENV_CONFIG_PATH: &str = "ENTROPYD_CONFIG";

/// Hard ceiling on the outbound HTTP timeout so no poll can starve
/// cancellation.
pub const MAX_HTTP_TIMEOUT_MS: u64 = 5_000;

/// Which aggregator queues feed the VirtIO seed job.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SeedSource {
    Trng,
    Fortuna,
    Both,
}

impl FromStr for SeedSource {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trng" => Ok(SeedSource::Trng),
            "fortuna" => Ok(SeedSource::Fortuna),
            "both" => Ok(SeedSource::Both),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_hwrng_url")]
    pub hwrng_url: String,
    #[serde(default = "default_fortuna_url")]
    pub fortuna_url: String,
    /// VirtIO node base URL; the seed job is disabled when unset.
    #[serde(default)]
    pub virtio_url: Option<String>,
    #[serde(default = "default_virtio_source")]
    pub virtio_source: SeedSource,
    #[serde(default = "default_trng_poll_ms")]
    pub trng_poll_ms: u64,
    #[serde(default = "default_fortuna_poll_ms")]
    pub fortuna_poll_ms: u64,
    #[serde(default = "default_seed_interval_s")]
    pub seed_interval_s: u64,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default)]
    pub consume_default: bool,
    #[serde(default = "default_apt_window")]
    pub apt_window: usize,
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
}

impl Config {
    pub fn load(cli_path: Option<&Path>) -> Self {
        let path = cli_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(env_or_string(ENV_CONFIG_PATH, DEFAULT_CONFIG_PATH)));
        let mut cfg = match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                warn!("failed to parse {}: {e}; using defaults", path.display());
                Config::default()
            }),
            Err(_) => Config::default(),
        };
        cfg.apply_env();
        if cfg.http_timeout_ms > MAX_HTTP_TIMEOUT_MS {
            warn!(
                "http_timeout_ms {} above ceiling, clamping to {MAX_HTTP_TIMEOUT_MS}",
                cfg.http_timeout_ms
            );
            cfg.http_timeout_ms = MAX_HTTP_TIMEOUT_MS;
        }
        cfg
    }

    fn apply_env(&mut self) {
        self.listen = env_or_string("AGG_LISTEN", &self.listen);
        self.hwrng_url = env_or_string("AGG_HWRNG_URL", &self.hwrng_url);
        self.fortuna_url = env_or_string("AGG_FORTUNA_URL", &self.fortuna_url);
        if let Ok(url) = std::env::var("AGG_VIRTIO_URL") {
            self.virtio_url = if url.is_empty() { None } else { Some(url) };
        }
        if let Ok(raw) = std::env::var("AGG_VIRTIO_SOURCE") {
            match raw.parse() {
                Ok(source) => self.virtio_source = source,
                Err(()) => warn!("invalid AGG_VIRTIO_SOURCE {raw:?}, keeping current"),
            }
        }
        self.trng_poll_ms = env_or("AGG_TRNG_POLL_MS", self.trng_poll_ms);
        self.fortuna_poll_ms = env_or("AGG_FORTUNA_POLL_MS", self.fortuna_poll_ms);
        self.seed_interval_s = env_or("AGG_SEED_INTERVAL_S", self.seed_interval_s);
        self.queue_size = env_or("AGG_QUEUE_SIZE", self.queue_size);
        self.consume_default = env_flag("AGG_CONSUME_DEFAULT", self.consume_default);
        self.apt_window = env_or("AGG_APT_WINDOW", self.apt_window);
        self.http_timeout_ms = env_or("AGG_HTTP_TIMEOUT_MS", self.http_timeout_ms);
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            hwrng_url: default_hwrng_url(),
            fortuna_url: default_fortuna_url(),
            virtio_url: None,
            virtio_source: default_virtio_source(),
            trng_poll_ms: default_trng_poll_ms(),
            fortuna_poll_ms: default_fortuna_poll_ms(),
            seed_interval_s: default_seed_interval_s(),
            queue_size: default_queue_size(),
            consume_default: false,
            apt_window: default_apt_window(),
            http_timeout_ms: default_http_timeout_ms(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:3000".to_string()
}
fn default_hwrng_url() -> String {
    "http://127.0.0.1:3001".to_string()
}
fn default_fortuna_url() -> String {
    "http://127.0.0.1:3002".to_string()
}
fn default_virtio_source() -> SeedSource {
    SeedSource::Trng
}
fn default_trng_poll_ms() -> u64 {
    100
}
fn default_fortuna_poll_ms() -> u64 {
    100
}
fn default_seed_interval_s() -> u64 {
    30
}
fn default_queue_size() -> usize {
    4096
}
fn default_apt_window() -> usize {
    512
}
fn default_http_timeout_ms() -> u64 {
    5_000
}
