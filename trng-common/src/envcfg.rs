//! Environment-variable configuration helpers.
//!
//! Every tunable in the suite reads an environment variable at process start
//! and falls back to its documented default with a warning when the value is
//! missing or unparsable.

use std::fmt::Display;
use std::str::FromStr;

use log::warn;

/// Parse `key` from the environment, falling back to `default` (with a
/// warning) on an unparsable value.
pub fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr + Display,
{
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("invalid value {raw:?} for {key}, using default {default}");
                default
            }
        },
        Err(_) => default,
    }
}

pub fn env_or_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Boolean tunable accepting `1/0`, `true/false`, `yes/no` (case-insensitive).
pub fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            other => {
                warn!("invalid value {other:?} for {key}, using default {default}");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_falls_back() {
        std::env::set_var("TRNG_TEST_ENV_OR", "250");
        assert_eq!(env_or("TRNG_TEST_ENV_OR", 7u64), 250);
        std::env::set_var("TRNG_TEST_ENV_OR", "not-a-number");
        assert_eq!(env_or("TRNG_TEST_ENV_OR", 7u64), 7);
        std::env::remove_var("TRNG_TEST_ENV_OR");
        assert_eq!(env_or("TRNG_TEST_ENV_OR", 7u64), 7);
    }

    #[test]
    fn flags_accept_common_spellings() {
        std::env::set_var("TRNG_TEST_ENV_FLAG", "yes");
        assert!(env_flag("TRNG_TEST_ENV_FLAG", false));
        std::env::set_var("TRNG_TEST_ENV_FLAG", "0");
        assert!(!env_flag("TRNG_TEST_ENV_FLAG", true));
        std::env::set_var("TRNG_TEST_ENV_FLAG", "maybe");
        assert!(env_flag("TRNG_TEST_ENV_FLAG", true));
        std::env::remove_var("TRNG_TEST_ENV_FLAG");
    }
}
