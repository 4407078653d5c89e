//! Configuration management for chainsync

use crate::error::{ChainError, Result};
use serde::{Deserialize, Deserializer};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Bitcoin regtest genesis header.
pub const REGTEST_GENESIS_HEX: &str = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4adae5494dffff7f2002000000";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Hex encoded 80-byte genesis header.
    #[serde(default = "default_genesis")]
    pub genesis: String,
    #[serde(default = "default_pow_limit_bits")]
    pub pow_limit_bits: u32,
    #[serde(default = "default_max_headers_per_message")]
    pub max_headers_per_message: usize,
    #[serde(
        default = "default_max_future_drift",
        deserialize_with = "deserialize_duration"
    )]
    pub max_future_drift: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(
        default = "default_request_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub request_timeout: Duration,
    #[serde(default = "default_max_tracked_inventory")]
    pub max_tracked_inventory: usize,
    #[serde(
        default = "default_probe_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub probe_interval: Duration,
    #[serde(
        default = "default_tick_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub tick_interval: Duration,
    #[serde(default = "default_block_cache_capacity")]
    pub block_cache_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_prefetch_window")]
    pub prefetch_window: u32,
    #[serde(default = "default_max_pending_validation")]
    pub max_pending_validation: usize,
    #[serde(default = "default_commit_interval")]
    pub commit_interval: usize,
    #[serde(default = "default_reorg_history_depth")]
    pub reorg_history_depth: u32,
    /// Zero means one worker per CPU.
    #[serde(default)]
    pub validation_threads: usize,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            genesis: default_genesis(),
            pow_limit_bits: default_pow_limit_bits(),
            max_headers_per_message: default_max_headers_per_message(),
            max_future_drift: default_max_future_drift(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            request_timeout: default_request_timeout(),
            max_tracked_inventory: default_max_tracked_inventory(),
            probe_interval: default_probe_interval(),
            tick_interval: default_tick_interval(),
            block_cache_capacity: default_block_cache_capacity(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            prefetch_window: default_prefetch_window(),
            max_pending_validation: default_max_pending_validation(),
            commit_interval: default_commit_interval(),
            reorg_history_depth: default_reorg_history_depth(),
            validation_threads: 0,
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.storage.data_dir.is_empty() {
            return Err(ChainError::Config("storage.data_dir must be set".to_string()));
        }
        if self.network.max_headers_per_message == 0 {
            return Err(ChainError::Config(
                "network.max_headers_per_message must be positive".to_string(),
            ));
        }
        if self.fetch.max_in_flight == 0 || self.fetch.max_tracked_inventory == 0 {
            return Err(ChainError::Config(
                "fetch.max_in_flight and fetch.max_tracked_inventory must be positive".to_string(),
            ));
        }
        if self.fetch.request_timeout.is_zero() || self.fetch.tick_interval.is_zero() {
            return Err(ChainError::Config(
                "fetch.request_timeout and fetch.tick_interval must be positive".to_string(),
            ));
        }
        if self.fetch.block_cache_capacity == 0 {
            return Err(ChainError::Config(
                "fetch.block_cache_capacity must be positive".to_string(),
            ));
        }
        if self.pipeline.max_pending_validation == 0 || self.pipeline.commit_interval == 0 {
            return Err(ChainError::Config(
                "pipeline.max_pending_validation and pipeline.commit_interval must be positive"
                    .to_string(),
            ));
        }
        if self.pipeline.channel_capacity == 0 {
            return Err(ChainError::Config(
                "pipeline.channel_capacity must be positive".to_string(),
            ));
        }
        // The next block is always requested, so a smaller cache would evict
        // prefetched bodies before they can be applied.
        if self.fetch.block_cache_capacity < self.pipeline.max_pending_validation {
            return Err(ChainError::Config(format!(
                "fetch.block_cache_capacity ({}) must be at least pipeline.max_pending_validation ({})",
                self.fetch.block_cache_capacity, self.pipeline.max_pending_validation
            )));
        }
        match self.logging.level.parse::<tracing::Level>() {
            Ok(_) => Ok(()),
            Err(_) => Err(ChainError::Config(format!(
                "Unknown logging.level '{}'",
                self.logging.level
            ))),
        }
    }
}

/// Read `path` as TOML. A missing file yields the defaults.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let config_str = match fs::read_to_string(path.as_ref()) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    let config = parse_config(&config_str)?;
    config.validate()?;
    Ok(config)
}

pub fn parse_config(config_str: &str) -> Result<Config> {
    if config_str.trim().is_empty() {
        return Ok(Config::default());
    }
    toml::from_str(config_str).map_err(|e| ChainError::Config(format!("Failed to parse config: {}", e)))
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_genesis() -> String {
    REGTEST_GENESIS_HEX.to_string()
}

fn default_pow_limit_bits() -> u32 {
    crate::blockchain::pow::REGTEST_BITS
}

fn default_max_headers_per_message() -> usize {
    2000
}

fn default_max_future_drift() -> Duration {
    Duration::from_secs(2 * 60 * 60)
}

fn default_max_in_flight() -> usize {
    10
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_max_tracked_inventory() -> usize {
    5000
}

fn default_probe_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_block_cache_capacity() -> usize {
    2048
}

fn default_prefetch_window() -> u32 {
    2000
}

fn default_max_pending_validation() -> usize {
    16
}

fn default_commit_interval() -> usize {
    10
}

fn default_reorg_history_depth() -> u32 {
    288
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}
