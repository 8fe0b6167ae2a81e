//! Configuration management for the faucet
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use ethers::types::U256;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub faucet: FaucetConfig,
    #[serde(default)]
    pub sender: SenderConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub chains: HashMap<String, ChainConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FaucetConfig {
    /// Amount dispensed per request, in ether (e.g. "0.05")
    pub payout_amount: String,
    /// Environment variable holding the hex private key
    pub private_key_env: String,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Tunables of the transaction-submission engine
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// Maximum distance between a transfer's nonce and the confirmed nonce
    pub window: u64,
    pub poll_interval_ms: u64,
    pub confirm_attempts: u32,
    pub confirm_hash_interval_ms: u64,
    pub confirm_attempt_interval_ms: u64,
    /// Age after which a fee suggestion is recomputed
    pub fee_refresh_secs: u64,
    /// Minimum increase applied to a replacement fee
    pub fee_bump_percent: u64,
    pub sync_interval_secs: u64,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub multiplier: f64,
    pub randomization_factor: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_url: String,
    pub symbol: String,
    #[serde(default)]
    pub explorer_urls: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_cooldown_secs() -> u64 {
    24 * 60 * 60
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_enabled() -> bool {
    true
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            window: 7,
            poll_interval_ms: 100,
            confirm_attempts: 20,
            confirm_hash_interval_ms: 100,
            confirm_attempt_interval_ms: 700,
            fee_refresh_secs: 20,
            fee_bump_percent: 20,
            sync_interval_secs: 30,
            retry: RetryConfig::default(),
        }
    }
}

impl SenderConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn confirm_hash_interval(&self) -> Duration {
        Duration::from_millis(self.confirm_hash_interval_ms)
    }

    pub fn confirm_attempt_interval(&self) -> Duration {
        Duration::from_millis(self.confirm_attempt_interval_ms)
    }

    pub fn fee_refresh(&self) -> Duration {
        Duration::from_secs(self.fee_refresh_secs)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval_ms: 200,
            max_interval_ms: 5_000,
            multiplier: 2.0,
            randomization_factor: 0.3,
        }
    }
}

impl Settings {
    /// Load settings from the file named by `FAUCET_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("FAUCET_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    fn parse(raw: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(raw);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        for (name, chain) in &self.chains {
            if chain.enabled && chain.rpc_url.is_empty() {
                anyhow::bail!("Chain {} has no RPC URL configured", name);
            }
        }

        if self.payout_wei()?.is_zero() {
            anyhow::bail!("Payout amount must be positive");
        }

        if self.sender.window == 0 {
            anyhow::bail!("Sender window must be at least 1");
        }

        if self.sender.confirm_attempts == 0 {
            anyhow::bail!("Sender confirm_attempts must be at least 1");
        }

        Ok(())
    }

    /// Payout amount converted to wei
    pub fn payout_wei(&self) -> Result<U256> {
        ethers::utils::parse_ether(&self.faucet.payout_amount)
            .with_context(|| format!("Invalid payout amount: {}", self.faucet.payout_amount))
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid env var pattern");
    }

    let mut result = input.to_string();
    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
