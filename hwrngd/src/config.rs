use std::fs;
use std::path::{Path, PathBuf};

use log::warn;
use serde::Deserialize;
use trng_common::envcfg::{env_flag, env_or, env_or_string};

const DEFAULT_CONFIG_PATH: &str = "/etc/entropyd/hwrngd.toml";
const ENV_CONFIG_PATH: &str = "ENTROPYD_CONFIG";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_i2c_bus")]
    pub i2c_bus: PathBuf,
    #[serde(default = "default_i2c_addr")]
    pub i2c_addr: u16,
    #[serde(default)]
    pub auto_config: bool,
    #[serde(default)]
    pub auto_config_confirm: bool,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
}

impl Config {
    /// Load configuration: optional TOML file (CLI path, then
    /// `ENTROPYD_CONFIG`, then the default path), with environment variables
    /// overriding individual fields. Missing or broken files fall back to
    /// defaults.
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
        cfg
    }

    fn apply_env(&mut self) {
        self.listen = env_or_string("HWRNG_LISTEN", &self.listen);
        if let Ok(raw) = std::env::var("HWRNG_I2C_BUS") {
            self.i2c_bus = PathBuf::from(raw);
        }
        if let Ok(raw) = std::env::var("HWRNG_I2C_ADDR") {
            match parse_addr(&raw) {
                Some(addr) => self.i2c_addr = addr,
                None => warn!("invalid HWRNG_I2C_ADDR {raw:?}, keeping {:#04x}", self.i2c_addr),
            }
        }
        self.auto_config = env_flag("HWRNG_AUTO_CONFIG", self.auto_config);
        self.auto_config_confirm = env_flag("HWRNG_AUTO_CONFIG_CONFIRM", self.auto_config_confirm);
        self.max_failures = env_or("HWRNG_MAX_FAILURES", self.max_failures);
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            i2c_bus: default_i2c_bus(),
            i2c_addr: default_i2c_addr(),
            auto_config: false,
            auto_config_confirm: false,
            max_failures: default_max_failures(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:3001".to_string()
}
fn default_i2c_bus() -> PathBuf {
    PathBuf::from("/dev/i2c-1")
}
fn default_i2c_addr() -> u16 {
    0x60
}
fn default_max_failures() -> u32 {
    10
}

/// Accept both `0x60` and plain decimal bus addresses.
fn parse_addr(raw: &str) -> Option<u16> {
    if let Some(hex_part) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        u16::from_str_radix(hex_part, 16).ok()
    } else {
        raw.parse().ok()
    }
}
