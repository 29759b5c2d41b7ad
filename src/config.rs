//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (the oracle key hash on live networks) are referenced by env-var
//! name in the config and resolved at runtime via `std::env::var`.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fs;

use crate::lottery::RoundConfig;
use crate::oracle::mock::{DEFAULT_BASE_FEE, DEFAULT_GAS_PRICE_LINK};
use crate::types::RandomnessRequest;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub lottery: LotteryConfig,
    pub oracle: OracleConfig,
    pub keeper: KeeperConfig,
    pub dashboard: DashboardConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LotteryConfig {
    pub name: String,
    pub entrance_fee: Decimal,
    pub interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OracleConfig {
    /// Gas lane. Ignored when `key_hash_env` is set.
    #[serde(default)]
    pub key_hash: String,
    #[serde(default)]
    pub key_hash_env: Option<String>,
    /// Existing subscription; a local one is created and funded when absent.
    #[serde(default)]
    pub subscription_id: Option<u64>,
    #[serde(default = "default_request_confirmations")]
    pub request_confirmations: u16,
    pub callback_gas_limit: u32,
    #[serde(default = "default_num_words")]
    pub num_words: u32,
    #[serde(default = "default_base_fee")]
    pub base_fee: Decimal,
    #[serde(default = "default_gas_price_link")]
    pub gas_price_link: Decimal,
    #[serde(default)]
    pub subscription_fund: Decimal,
    /// Local coordinator fulfils on its own after this delay.
    #[serde(default)]
    pub auto_fulfill_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KeeperConfig {
    pub name: String,
    pub poll_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub state_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_file: "lottery_state.json".to_string(),
        }
    }
}

fn default_request_confirmations() -> u16 {
    3
}

fn default_num_words() -> u32 {
    1
}

fn default_base_fee() -> Decimal {
    DEFAULT_BASE_FEE
}

fn default_gas_price_link() -> Decimal {
    DEFAULT_GAS_PRICE_LINK
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// Validated round settings.
    pub fn round_config(&self) -> Result<RoundConfig> {
        let interval = chrono::Duration::try_seconds(self.lottery.interval_secs as i64)
            .context("lottery.interval_secs out of range")?;
        RoundConfig::new(self.lottery.entrance_fee, interval).context("Invalid [lottery] section")
    }

    /// Request template sent to the oracle on every upkeep.
    pub fn randomness_request(&self, subscription_id: u64) -> Result<RandomnessRequest> {
        let key_hash = match &self.oracle.key_hash_env {
            Some(env) => Self::resolve_env(env)?,
            None => self.oracle.key_hash.clone(),
        };
        Ok(RandomnessRequest {
            key_hash,
            subscription_id,
            request_confirmations: self.oracle.request_confirmations,
            callback_gas_limit: self.oracle.callback_gas_limit,
            num_words: self.oracle.num_words,
        })
    }
}
