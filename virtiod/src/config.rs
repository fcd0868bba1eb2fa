use std::fs;
use std::path::{Path, PathBuf};

use log::warn;
use serde::Deserialize;
use trng_common::envcfg::{env_or, env_or_string};

const DEFAULT_CONFIG_PATH: &str = "/etc/entropyd/virtiod.toml";
const ENV_CONFIG_PATH: &str = "ENTROPYD_CONFIG";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
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
        cfg.listen = env_or_string("VIRTIO_LISTEN", &cfg.listen);
        cfg.queue_size = env_or("VIRTIO_QUEUE_SIZE", cfg.queue_size);
        cfg
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            queue_size: default_queue_size(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:3003".to_string()
}
fn default_queue_size() -> usize {
    4096
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_toml_layer() {
        let cfg = Config::default();
        assert_eq!(cfg.listen, "127.0.0.1:3003");
        assert_eq!(cfg.queue_size, 4096);
        let cfg: Config = toml::from_str("queue_size = 64").unwrap();
        assert_eq!(cfg.queue_size, 64);
    }
}
