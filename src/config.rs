use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bus::{
    BusConfig, DbSelfDelivery, ElectionConfig, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_HUB_CAPACITY,
    DEFAULT_LIVENESS_TIMEOUT,
};
use crate::cache::DEFAULT_NAMESPACE;

const ENV_PREFIX: &str = "TABSYNC_";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: `{value}`")]
    InvalidValue { key: String, value: String },
    #[error("liveness timeout ({liveness_ms}ms) must exceed heartbeat interval ({heartbeat_ms}ms)")]
    Timing { heartbeat_ms: u64, liveness_ms: u64 },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the SQLite files.
    pub data_dir: PathBuf,
    pub cache_namespace: String,
    /// Per-pipe buffer on the hub; slower receivers skip what overflows.
    pub channel_capacity: usize,
    pub heartbeat_interval_ms: u64,
    pub liveness_timeout_ms: u64,
    pub db_self_delivery: DbSelfDelivery,
    pub api_base_url: Option<String>,
    pub api_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            cache_namespace: DEFAULT_NAMESPACE.to_string(),
            channel_capacity: DEFAULT_HUB_CAPACITY,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64,
            liveness_timeout_ms: DEFAULT_LIVENESS_TIMEOUT.as_millis() as u64,
            db_self_delivery: DbSelfDelivery::default(),
            api_base_url: None,
            api_key: None,
        }
    }
}

impl Config {
    /// Defaults overridden by `TABSYNC_*` variables, after loading `.env` if
    /// one is present.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "loaded .env");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::from_env`] with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut config = Self::default();
        if let Some(dir) = var("DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(namespace) = var("CACHE_NAMESPACE") {
            config.cache_namespace = namespace;
        }
        if let Some(raw) = var("CHANNEL_CAPACITY") {
            config.channel_capacity = parse("CHANNEL_CAPACITY", &raw)?;
        }
        if let Some(raw) = var("HEARTBEAT_INTERVAL_MS") {
            config.heartbeat_interval_ms = parse("HEARTBEAT_INTERVAL_MS", &raw)?;
        }
        if let Some(raw) = var("LIVENESS_TIMEOUT_MS") {
            config.liveness_timeout_ms = parse("LIVENESS_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = var("DB_SELF_DELIVERY") {
            config.db_self_delivery = parse("DB_SELF_DELIVERY", &raw)?;
        }
        config.api_base_url = var("API_BASE_URL");
        config.api_key = var("API_KEY");

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_capacity == 0 {
            return Err(ConfigError::Zero("channel capacity"));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Zero("heartbeat interval"));
        }
        if self.liveness_timeout_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::Timing {
                heartbeat_ms: self.heartbeat_interval_ms,
                liveness_ms: self.liveness_timeout_ms,
            });
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            election: ElectionConfig {
                heartbeat_interval: self.heartbeat_interval(),
                liveness_timeout: self.liveness_timeout(),
            },
            db_self_delivery: self.db_self_delivery,
        }
    }
}

fn parse<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        key: format!("{ENV_PREFIX}{name}"),
        value: raw.to_string(),
    })
}
