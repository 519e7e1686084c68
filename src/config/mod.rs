use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;

use crate::constants;
use crate::error::{BrokerError, Result};

/// Every timing constant the engine exposes, overridable from the
/// environment; validated and defaulted the way this codebase's
/// `Config::load()` reads and validates its own environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub scheduler_interval_ms: u64,
    pub ack_timeout_ms: u64,
    pub assigned_timeout_ms: u64,
    pub orphan_timeout_ms: u64,
    pub offline_threshold_ms: u64,
    pub heartbeat_debounce_ms: u64,
    pub max_prompt_timeout_secs: u64,
    pub default_prompt_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scheduler_interval_ms: constants::SCHEDULER_INTERVAL_MS,
            ack_timeout_ms: constants::ACK_TIMEOUT_MS,
            assigned_timeout_ms: constants::ASSIGNED_TIMEOUT_MS,
            orphan_timeout_ms: constants::ORPHAN_TIMEOUT_MS,
            offline_threshold_ms: constants::OFFLINE_THRESHOLD_MS,
            heartbeat_debounce_ms: constants::HEARTBEAT_DEBOUNCE_MS,
            max_prompt_timeout_secs: constants::MAX_PROMPT_TIMEOUT_SECS,
            default_prompt_timeout_secs: constants::DEFAULT_PROMPT_TIMEOUT_SECS,
        }
    }
}

fn positive_u64_var(name: &str, default: u64) -> Result<u64> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => {
            let value: u64 = raw
                .parse()
                .map_err(|_| BrokerError::Configuration(format!("{name} must be a positive integer, got {raw:?}")))?;
            if value == 0 {
                return Err(BrokerError::Configuration(format!("{name} must be greater than zero")));
            }
            Ok(value)
        }
    }
}

impl EngineConfig {
    pub fn load() -> Result<Self> {
        match dotenv() {
            Ok(path) => tracing::info!("loaded .env file from: {:?}", path),
            Err(_) => tracing::debug!("no .env file found, using process environment"),
        }

        let defaults = EngineConfig::default();
        let config = EngineConfig {
            scheduler_interval_ms: positive_u64_var(
                "BROKER_SCHEDULER_INTERVAL_MS",
                defaults.scheduler_interval_ms,
            )?,
            ack_timeout_ms: positive_u64_var("BROKER_ACK_TIMEOUT_MS", defaults.ack_timeout_ms)?,
            assigned_timeout_ms: positive_u64_var(
                "BROKER_ASSIGNED_TIMEOUT_MS",
                defaults.assigned_timeout_ms,
            )?,
            orphan_timeout_ms: positive_u64_var("BROKER_ORPHAN_TIMEOUT_MS", defaults.orphan_timeout_ms)?,
            offline_threshold_ms: positive_u64_var(
                "BROKER_OFFLINE_THRESHOLD_MS",
                defaults.offline_threshold_ms,
            )?,
            heartbeat_debounce_ms: positive_u64_var(
                "BROKER_HEARTBEAT_DEBOUNCE_MS",
                defaults.heartbeat_debounce_ms,
            )?,
            max_prompt_timeout_secs: positive_u64_var(
                "BROKER_MAX_PROMPT_TIMEOUT_SECS",
                defaults.max_prompt_timeout_secs,
            )?,
            default_prompt_timeout_secs: positive_u64_var(
                "BROKER_DEFAULT_PROMPT_TIMEOUT_SECS",
                defaults.default_prompt_timeout_secs,
            )?,
        };

        if config.default_prompt_timeout_secs > config.max_prompt_timeout_secs {
            return Err(BrokerError::Configuration(
                "BROKER_DEFAULT_PROMPT_TIMEOUT_SECS cannot exceed BROKER_MAX_PROMPT_TIMEOUT_SECS".into(),
            ));
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    fn clear_env() {
        for var in [
            "BROKER_SCHEDULER_INTERVAL_MS",
            "BROKER_ACK_TIMEOUT_MS",
            "BROKER_ASSIGNED_TIMEOUT_MS",
            "BROKER_ORPHAN_TIMEOUT_MS",
            "BROKER_OFFLINE_THRESHOLD_MS",
            "BROKER_HEARTBEAT_DEBOUNCE_MS",
            "BROKER_MAX_PROMPT_TIMEOUT_SECS",
            "BROKER_DEFAULT_PROMPT_TIMEOUT_SECS",
        ] {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn loads_defaults_when_environment_is_empty() {
        clear_env();
        let config = EngineConfig::load().unwrap();
        assert_eq!(config.scheduler_interval_ms, constants::SCHEDULER_INTERVAL_MS);
        assert_eq!(config.ack_timeout_ms, constants::ACK_TIMEOUT_MS);
    }

    #[test]
    #[serial]
    fn rejects_non_numeric_override() {
        clear_env();
        env::set_var("BROKER_ACK_TIMEOUT_MS", "not-a-number");
        let err = EngineConfig::load().unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Internal);
        clear_env();
    }

    #[test]
    #[serial]
    fn rejects_zero_for_a_positive_field() {
        clear_env();
        env::set_var("BROKER_SCHEDULER_INTERVAL_MS", "0");
        let err = EngineConfig::load().unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Internal);
        clear_env();
    }

    #[test]
    #[serial]
    fn accepts_a_valid_override() {
        clear_env();
        env::set_var("BROKER_SCHEDULER_INTERVAL_MS", "5000");
        let config = EngineConfig::load().unwrap();
        assert_eq!(config.scheduler_interval_ms, 5000);
        clear_env();
    }

    #[test]
    #[serial]
    fn reads_overrides_from_a_dotenv_file() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(".env"),
            "BROKER_ACK_TIMEOUT_MS=45000\n",
        )
        .unwrap();
        let original_dir = env::current_dir().unwrap();
        env::set_current_dir(dir.path()).unwrap();

        let result = EngineConfig::load();

        env::set_current_dir(original_dir).unwrap();
        clear_env();

        let config = result.unwrap();
        assert_eq!(config.ack_timeout_ms, 45_000);
    }
}
