use alloy::primitives::{Address, B256};
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;

use crate::registry::types::{
    normalize_address, BlockchainPlatform, ContractRegistration, CurrencyConfigPatch, EventTopic,
};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Notification channel carrying contract registrations.
    pub app_id: String,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    /// Extra ABI files by key. A key shadows the bundled ABI of the same name.
    #[serde(default)]
    pub abis: HashMap<String, String>,
    pub chains: Vec<ChainConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_webhook_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            timeout_ms: default_webhook_timeout_ms(),
        }
    }
}

fn default_webhook_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_limiter_max")]
    pub limiter_max: u32,
    #[serde(default = "default_limiter_duration_ms")]
    pub limiter_duration_ms: u64,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_backoff_delay_ms")]
    pub backoff_delay_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Abandoned entries older than this are deleted.
    #[serde(default = "default_failed_retention_secs")]
    pub failed_retention_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            limiter_max: default_limiter_max(),
            limiter_duration_ms: default_limiter_duration_ms(),
            attempts: default_attempts(),
            backoff_delay_ms: default_backoff_delay_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            failed_retention_secs: default_failed_retention_secs(),
        }
    }
}

fn default_limiter_max() -> u32 {
    1
}

fn default_limiter_duration_ms() -> u64 {
    1000
}

fn default_failed_retention_secs() -> u64 {
    7 * 24 * 3600
}

fn default_attempts() -> u32 {
    100
}

fn default_backoff_delay_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    3_600_000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainConfig {
    /// Platform id: `eth`, `bsc` or `polygon`.
    pub platform: String,
    pub chain_id: u64,
    pub chain_name: String,
    #[serde(default)]
    pub network: String,
    pub rpc_endpoint: String,
    /// Backups in failover order.
    #[serde(default)]
    pub rpc_endpoint_backups: Vec<String>,
    pub required_confirmations: u64,
    /// Milliseconds.
    pub average_block_time: u64,
    /// Milliseconds. Defaults to `average_block_time`.
    pub block_time: Option<u64>,
    #[serde(default)]
    pub internal_endpoint: String,
    pub webhook_api: String,
    pub queue_name: String,
    #[serde(default = "default_block_batch_size")]
    pub block_batch_size: u64,
    #[serde(default = "default_parallel_request_limit")]
    pub parallel_request_limit: usize,
    #[serde(default = "default_processing_timeout_ms")]
    pub processing_timeout_ms: u64,
    #[serde(default = "default_block_count_cache_ms")]
    pub block_count_cache_ms: u64,
    #[serde(default)]
    pub cache: CacheConfig,
    pub proxy_contract_address: Option<String>,
    pub force_crawl_block: Option<u64>,
    #[serde(default)]
    pub contracts: Vec<ContractConfig>,
}

fn default_block_batch_size() -> u64 {
    100
}

fn default_parallel_request_limit() -> usize {
    5
}

fn default_processing_timeout_ms() -> u64 {
    300_000
}

fn default_block_count_cache_ms() -> u64 {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_cache_max_age_secs")]
    pub max_age_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_max_entries(),
            max_age_secs: default_cache_max_age_secs(),
        }
    }
}

fn default_cache_max_entries() -> usize {
    1024
}

fn default_cache_max_age_secs() -> u64 {
    300
}

/// A contract watched from startup, before any registration notification.
#[derive(Debug, Deserialize, Clone)]
pub struct ContractConfig {
    pub address: String,
    pub symbol: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_decimals")]
    pub decimals: u8,
    /// Catalog key of the contract's ABI.
    pub abi: String,
    pub events: Vec<ContractEventConfig>,
}

fn default_decimals() -> u8 {
    18
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContractEventConfig {
    pub name: String,
    /// Derived from the ABI when omitted.
    pub topic: Option<String>,
}

impl ChainConfig {
    pub fn platform(&self) -> eyre::Result<BlockchainPlatform> {
        self.platform
            .parse()
            .map_err(|e| eyre::eyre!("Chain '{}': {}", self.chain_name, e))
    }

    /// The file's view of this chain as a registry config write.
    pub fn to_patch(&self) -> CurrencyConfigPatch {
        CurrencyConfigPatch {
            network: Some(self.network.clone()),
            chain_id: Some(self.chain_id),
            chain_name: Some(self.chain_name.clone()),
            rpc_endpoint: Some(self.rpc_endpoint.trim().to_string()),
            rpc_endpoint_backups: Some(
                self.rpc_endpoint_backups
                    .iter()
                    .map(|u| u.trim().to_string())
                    .filter(|u| !u.is_empty())
                    .collect(),
            ),
            required_confirmations: Some(self.required_confirmations),
            average_block_time: Some(self.average_block_time),
            block_time: Some(self.block_time.unwrap_or(self.average_block_time)),
            internal_endpoint: Some(self.internal_endpoint.clone()),
            webhook_api: Some(self.webhook_api.clone()),
            queue_name: Some(self.queue_name.clone()),
        }
    }

    /// Static registrations. Topics left out are zero until resolved against the ABI catalog.
    pub fn registrations(&self) -> eyre::Result<Vec<ContractRegistration>> {
        self.contracts
            .iter()
            .map(|c| {
                let events = c
                    .events
                    .iter()
                    .map(|e| {
                        let topic = match &e.topic {
                            Some(raw) => B256::from_str(raw.trim()).map_err(|err| {
                                eyre::eyre!("Invalid topic '{}' for event {}: {}", raw, e.name, err)
                            })?,
                            None => B256::ZERO,
                        };
                        Ok(EventTopic {
                            name: e.name.trim().to_string(),
                            topic,
                        })
                    })
                    .collect::<eyre::Result<Vec<_>>>()?;
                Ok(ContractRegistration {
                    contract_address: normalize_address(&c.address),
                    symbol: c.symbol.clone(),
                    name: if c.name.is_empty() { c.symbol.clone() } else { c.name.clone() },
                    decimals: c.decimals,
                    abi_key: c.abi.clone(),
                    events,
                })
            })
            .collect()
    }
}

/// Split a comma-separated RPC URL list, dropping blanks.
pub fn parse_rpc_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .collect()
}

fn is_valid_address(raw: &str) -> bool {
    Address::from_str(raw.trim()).is_ok()
}

impl Config {
    pub fn load(path: &str) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("Failed to read config file '{}': {}", path, e))?;
        let mut config: Config = toml::from_str(&content)
            .map_err(|e| eyre::eyre!("Failed to parse config file '{}': {}", path, e))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("WEBHOOK_API_TOKEN") {
            self.webhook.token = token;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database.url = url;
        }
    }

    fn validate(&self) -> eyre::Result<()> {
        if self.app_id.trim().is_empty() {
            return Err(eyre::eyre!("app_id must not be empty"));
        }
        if self.chains.is_empty() {
            return Err(eyre::eyre!("At least one chain must be configured"));
        }
        let mut seen = Vec::new();
        for chain in &self.chains {
            let platform = chain.platform()?;
            if seen.contains(&platform) {
                return Err(eyre::eyre!("Platform '{}' configured twice", platform));
            }
            seen.push(platform);

            if chain.rpc_endpoint.trim().is_empty() {
                return Err(eyre::eyre!("Chain '{}' has no rpc_endpoint", chain.chain_name));
            }
            if !chain.internal_endpoint.is_empty() {
                reqwest::Url::parse(&chain.internal_endpoint).map_err(|e| {
                    eyre::eyre!(
                        "Invalid internal_endpoint '{}' for chain '{}': {}",
                        chain.internal_endpoint,
                        chain.chain_name,
                        e
                    )
                })?;
            }
            if let Some(proxy) = &chain.proxy_contract_address {
                if !is_valid_address(proxy) {
                    return Err(eyre::eyre!(
                        "Invalid proxy_contract_address '{}' for chain '{}'",
                        proxy,
                        chain.chain_name
                    ));
                }
            }
            for contract in &chain.contracts {
                if !is_valid_address(&contract.address) {
                    return Err(eyre::eyre!(
                        "Invalid contract address '{}' for {} on chain '{}'",
                        contract.address,
                        contract.symbol,
                        chain.chain_name
                    ));
                }
            }
            chain.registrations()?;
        }
        Ok(())
    }
}
