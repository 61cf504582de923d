//! Core configuration types and loaders
//!
//! This module defines the configuration structure for the calculation core:
//! retry policy, sharding, deadlines, market calendars and the service
//! surfaces. Loaded from a YAML file; every field has a spec default so a
//! partial file is enough.

use chrono::NaiveTime;
use serde::Deserialize;

use crate::error::CoreError;

/// Complete calculation-core configuration
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub retry: RetryConfig,
    pub sharding: ShardingConfig,
    pub deadlines: DeadlineConfig,
    pub markets: MarketConfig,
    pub logging: LogConfig,
    pub database: Option<DatabaseConfig>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    /// Gateway bind address for the synchronous API
    pub listen_addr: String,
}

/// Unknown-key park-and-retry policy (per ingress partition)
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff_initial_ms: u64,
    pub backoff_factor: u32,
    pub backoff_max_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ShardingConfig {
    /// Shards per engine; 0 means "use the CPU count"
    pub shard_count: usize,
    /// Pause a partition when its shard queue passes this depth
    pub queue_high_watermark: usize,
    /// Resume once the queue drains below this depth
    pub queue_low_watermark: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DeadlineConfig {
    pub event_processing_ms: u64,
    pub order_validation_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MarketConfig {
    /// Markets this core instance calculates for
    pub enabled: Vec<String>,
    /// Japan SLAB settlement cutoff, UTC wall-clock
    pub jp_cutoff_time_utc: NaiveTime,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LogConfig {
    pub log_dir: String,
    pub log_file: String,
    pub log_level: String,
    /// "hourly", "daily" or anything else for a single file
    pub rotation: String,
    pub use_json: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            retry: RetryConfig::default(),
            sharding: ShardingConfig::default(),
            deadlines: DeadlineConfig::default(),
            markets: MarketConfig::default(),
            logging: LogConfig::default(),
            database: None,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "ims-calc-core".to_string(),
            listen_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_initial_ms: 100,
            backoff_factor: 2,
            backoff_max_ms: 1600,
        }
    }
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            shard_count: 0,
            queue_high_watermark: 10_000,
            queue_low_watermark: 2_500,
        }
    }
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            event_processing_ms: 200,
            order_validation_ms: 150,
        }
    }
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            enabled: vec![
                "US".to_string(),
                "JP".to_string(),
                "TW".to_string(),
                "GB".to_string(),
            ],
            // 06:00 UTC ~ 15:00 JST, the domestic SLAB booking cutoff
            jp_cutoff_time_utc: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: "logs".to_string(),
            log_file: "ims-core.log".to_string(),
            log_level: "info".to_string(),
            rotation: "daily".to_string(),
            use_json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from YAML file
    pub fn from_file(path: &str) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path).map_err(|e| CoreError::InvalidField {
            field: "config",
            reason: e.to_string(),
        })?;
        serde_yaml::from_str(&content).map_err(|e| CoreError::InvalidField {
            field: "config",
            reason: e.to_string(),
        })
    }

    /// Effective shard count (resolves the 0 = CPU-count convention)
    pub fn effective_shard_count(&self) -> usize {
        if self.sharding.shard_count == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.sharding.shard_count
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let config = AppConfig::default();
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.backoff_initial_ms, 100);
        assert_eq!(config.retry.backoff_factor, 2);
        assert_eq!(config.retry.backoff_max_ms, 1600);
        assert_eq!(config.sharding.queue_high_watermark, 10_000);
        assert_eq!(config.sharding.queue_low_watermark, 2_500);
        assert_eq!(config.deadlines.event_processing_ms, 200);
        assert_eq!(config.deadlines.order_validation_ms, 150);
    }

    #[test]
    fn test_config_deserialize() {
        let yaml = r#"
service:
  name: "ims-calc-core"
  listen_addr: "127.0.0.1:9090"
retry:
  max_retries: 3
  backoff_initial_ms: 50
sharding:
  shard_count: 8
  queue_high_watermark: 5000
  queue_low_watermark: 1000
deadlines:
  event_processing_ms: 250
markets:
  enabled: ["US", "JP"]
  jp_cutoff_time_utc: "06:30:00"
database:
  url: "postgres://localhost/ims"
"#;

        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.service.listen_addr, "127.0.0.1:9090");
        assert_eq!(config.retry.max_retries, 3);
        // Unspecified fields fall back to defaults
        assert_eq!(config.retry.backoff_max_ms, 1600);
        assert_eq!(config.sharding.shard_count, 8);
        assert_eq!(config.deadlines.order_validation_ms, 150);
        assert_eq!(config.markets.enabled, vec!["US", "JP"]);
        assert_eq!(
            config.markets.jp_cutoff_time_utc,
            NaiveTime::from_hms_opt(6, 30, 0).unwrap()
        );
        assert_eq!(config.database.unwrap().url, "postgres://localhost/ims");
    }

    #[test]
    fn test_effective_shard_count() {
        let mut config = AppConfig::default();
        config.sharding.shard_count = 6;
        assert_eq!(config.effective_shard_count(), 6);

        config.sharding.shard_count = 0;
        assert!(config.effective_shard_count() >= 1);
    }
}
