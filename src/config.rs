//! Configuration for the queue engines.
//!
//! Supports YAML file and environment variable overrides.

use serde::Deserialize;
use std::path::Path;

use crate::queue::memq::MemqConfig;
use crate::queue::redisq::ConsumerConfig;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "STREAMQ_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "streamq.yaml";

/// Queue configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// In-memory bus settings.
    pub memq: MemqConfig,
    /// Redis stream consumer settings.
    pub redisq: RedisqConfig,
}

/// Redis stream consumer configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisqConfig {
    /// Redis connection URL.
    pub url: String,
    /// Runtime settings, given inline next to `url`.
    #[serde(flatten)]
    pub consumer: ConsumerConfig,
}

impl Default for RedisqConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            consumer: ConsumerConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Config file
    /// 3. Defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        let mut config = if Path::new(&config_path).exists() {
            Self::from_file(&config_path)?
        } else {
            Self::default()
        };

        config.apply_env_overrides();

        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_string(), e.to_string()))?;

        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("STREAMQ_REDIS_URL") {
            self.redisq.url = url;
        }

        if let Ok(name) = std::env::var("STREAMQ_CONSUMER_NAME") {
            if !name.is_empty() {
                self.redisq.consumer.consumer_name = name;
            }
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{0}': {1}")]
    FileRead(String, String),

    #[error("Failed to parse config: {0}")]
    Parse(String),
}
