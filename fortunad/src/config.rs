use std::fs;
use std::path::{Path, PathBuf};

use log::warn;
use serde::Deserialize;
use trng_common::envcfg::env_or_string;

const DEFAULT_CONFIG_PATH: &str = "/etc/entropyd/fortunad.toml";
const ENV_CONFIG_PATH: &str = "ENTROPYD_CONFIG";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
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
        cfg.listen = env_or_string("FORTUNA_LISTEN", &cfg.listen);
        cfg
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:3002".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_default_and_toml_override() {
        assert_eq!(Config::default().listen, "127.0.0.1:3002");
        let cfg: Config = toml::from_str(r#"listen = "0.0.0.0:9000""#).unwrap();
        assert_eq!(cfg.listen, "0.0.0.0:9000");
    }
}
