use alloy::primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RegistryError;

/// EVM platforms this dispatcher can crawl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockchainPlatform {
    #[serde(rename = "eth")]
    Ethereum,
    #[serde(rename = "bsc")]
    BinanceSmartChain,
    Polygon,
}

impl BlockchainPlatform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ethereum => "eth",
            Self::BinanceSmartChain => "bsc",
            Self::Polygon => "polygon",
        }
    }

    /// Token standard used for contracts registered on this platform.
    pub fn token_type(&self) -> TokenType {
        match self {
            Self::BinanceSmartChain => TokenType::Bep20,
            Self::Ethereum | Self::Polygon => TokenType::Erc20,
        }
    }
}

impl fmt::Display for BlockchainPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockchainPlatform {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "eth" | "ethereum" => Ok(Self::Ethereum),
            "bsc" | "binancesmartchain" => Ok(Self::BinanceSmartChain),
            "polygon" | "matic" => Ok(Self::Polygon),
            other => Err(RegistryError::UnknownPlatform(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Erc20,
    Bep20,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Erc20 => "erc20",
            Self::Bep20 => "bep20",
        }
    }

    /// Compound registry symbol for a token contract, e.g. `bep20.0xabc...`.
    pub fn symbol_for(&self, contract_address: &str) -> String {
        format!("{}.{}", self.as_str(), normalize_address(contract_address))
    }
}

/// A native coin or registered token. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Currency {
    pub symbol: String,
    pub network_symbol: String,
    pub name: String,
    pub platform: BlockchainPlatform,
    pub is_native: bool,
    pub token_type: Option<TokenType>,
    pub contract_address: Option<String>,
    pub human_readable_scale: u32,
    pub native_scale: u32,
    pub has_memo: bool,
}

impl Currency {
    pub fn native(
        symbol: &str,
        name: &str,
        platform: BlockchainPlatform,
        scale: u32,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            network_symbol: symbol.to_string(),
            name: name.to_string(),
            platform,
            is_native: true,
            token_type: None,
            contract_address: None,
            human_readable_scale: scale,
            native_scale: scale,
            has_memo: false,
        }
    }

    /// Registry key: symbols are case-insensitive.
    pub fn key(&self) -> String {
        self.symbol.to_lowercase()
    }
}

/// One watched event of a registered contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTopic {
    pub name: String,
    pub topic: B256,
}

/// A dynamically registered contract whose logs the gateway decodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractRegistration {
    /// Lowercase `0x`-prefixed hex.
    pub contract_address: String,
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
    pub abi_key: String,
    pub events: Vec<EventTopic>,
}

impl ContractRegistration {
    pub fn address(&self) -> Option<Address> {
        Address::from_str(&self.contract_address).ok()
    }

    pub fn event_for_topic(&self, topic: &B256) -> Option<&EventTopic> {
        self.events.iter().find(|e| &e.topic == topic)
    }

    pub fn to_currency(&self, token_type: TokenType, platform: BlockchainPlatform) -> Currency {
        Currency {
            symbol: token_type.symbol_for(&self.contract_address),
            network_symbol: self.symbol.to_lowercase(),
            name: self.name.clone(),
            platform,
            is_native: false,
            token_type: Some(token_type),
            contract_address: Some(self.contract_address.clone()),
            human_readable_scale: self.decimals as u32,
            native_scale: 0,
            has_memo: false,
        }
    }
}

/// Canonical address form used for registry keys and persisted rows.
pub fn normalize_address(address: &str) -> String {
    let trimmed = address.trim();
    match Address::from_str(trimmed) {
        Ok(parsed) => format!("{parsed:#x}"),
        Err(_) => trimmed.to_lowercase(),
    }
}

/// Per-chain operational parameters. One per native currency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrencyConfig {
    pub network: String,
    pub chain_id: u64,
    pub chain_name: String,
    pub rpc_endpoint: String,
    pub rpc_endpoint_backups: Vec<String>,
    pub required_confirmations: u64,
    /// Milliseconds.
    pub average_block_time: u64,
    /// Milliseconds.
    pub block_time: u64,
    pub internal_endpoint: String,
    pub webhook_api: String,
    pub queue_name: String,
}

impl CurrencyConfig {
    /// Primary endpoint followed by the backups, in rotation order.
    pub fn rpc_endpoints(&self) -> Vec<String> {
        std::iter::once(self.rpc_endpoint.clone())
            .chain(self.rpc_endpoint_backups.iter().cloned())
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect()
    }
}

/// Partial config write. Present fields win, absent ones inherit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CurrencyConfigPatch {
    pub network: Option<String>,
    pub chain_id: Option<u64>,
    pub chain_name: Option<String>,
    pub rpc_endpoint: Option<String>,
    pub rpc_endpoint_backups: Option<Vec<String>>,
    pub required_confirmations: Option<u64>,
    pub average_block_time: Option<u64>,
    pub block_time: Option<u64>,
    pub internal_endpoint: Option<String>,
    pub webhook_api: Option<String>,
    pub queue_name: Option<String>,
}

impl CurrencyConfigPatch {
    /// Overlay this patch on an existing config.
    pub fn apply_to(self, base: &CurrencyConfig) -> CurrencyConfig {
        CurrencyConfig {
            network: self.network.unwrap_or_else(|| base.network.clone()),
            chain_id: self.chain_id.unwrap_or(base.chain_id),
            chain_name: self.chain_name.unwrap_or_else(|| base.chain_name.clone()),
            rpc_endpoint: self.rpc_endpoint.unwrap_or_else(|| base.rpc_endpoint.clone()),
            rpc_endpoint_backups: self
                .rpc_endpoint_backups
                .unwrap_or_else(|| base.rpc_endpoint_backups.clone()),
            required_confirmations: self
                .required_confirmations
                .unwrap_or(base.required_confirmations),
            average_block_time: self.average_block_time.unwrap_or(base.average_block_time),
            block_time: self.block_time.unwrap_or(base.block_time),
            internal_endpoint: self
                .internal_endpoint
                .unwrap_or_else(|| base.internal_endpoint.clone()),
            webhook_api: self.webhook_api.unwrap_or_else(|| base.webhook_api.clone()),
            queue_name: self.queue_name.unwrap_or_else(|| base.queue_name.clone()),
        }
    }

    /// Build a full config when nothing was stored before.
    pub fn into_config(self, symbol: &str) -> Result<CurrencyConfig, RegistryError> {
        fn need<T>(value: Option<T>, symbol: &str, field: &'static str) -> Result<T, RegistryError> {
            value.ok_or_else(|| RegistryError::IncompleteConfig {
                symbol: symbol.to_string(),
                field,
            })
        }

        Ok(CurrencyConfig {
            network: self.network.unwrap_or_default(),
            chain_id: need(self.chain_id, symbol, "chain_id")?,
            chain_name: need(self.chain_name, symbol, "chain_name")?,
            rpc_endpoint: need(self.rpc_endpoint, symbol, "rpc_endpoint")?,
            rpc_endpoint_backups: self.rpc_endpoint_backups.unwrap_or_default(),
            required_confirmations: need(
                self.required_confirmations,
                symbol,
                "required_confirmations",
            )?,
            average_block_time: need(self.average_block_time, symbol, "average_block_time")?,
            block_time: self.block_time.or(self.average_block_time).unwrap_or_default(),
            internal_endpoint: self.internal_endpoint.unwrap_or_default(),
            webhook_api: need(self.webhook_api, symbol, "webhook_api")?,
            queue_name: need(self.queue_name, symbol, "queue_name")?,
        })
    }
}

impl From<CurrencyConfig> for CurrencyConfigPatch {
    fn from(c: CurrencyConfig) -> Self {
        Self {
            network: Some(c.network),
            chain_id: Some(c.chain_id),
            chain_name: Some(c.chain_name),
            rpc_endpoint: Some(c.rpc_endpoint),
            rpc_endpoint_backups: Some(c.rpc_endpoint_backups),
            required_confirmations: Some(c.required_confirmations),
            average_block_time: Some(c.average_block_time),
            block_time: Some(c.block_time),
            internal_endpoint: Some(c.internal_endpoint),
            webhook_api: Some(c.webhook_api),
            queue_name: Some(c.queue_name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_parse() {
        assert_eq!(
            "BSC".parse::<BlockchainPlatform>().unwrap(),
            BlockchainPlatform::BinanceSmartChain
        );
        assert_eq!("matic".parse::<BlockchainPlatform>().unwrap(), BlockchainPlatform::Polygon);
        assert!(matches!(
            "dogecoin".parse::<BlockchainPlatform>(),
            Err(RegistryError::UnknownPlatform(_))
        ));
    }

    #[test]
    fn test_token_symbol_is_lowercase() {
        let symbol = TokenType::Bep20.symbol_for("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48");
        assert_eq!(symbol, "bep20.0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48");
    }

    #[test]
    fn test_rpc_endpoints_order() {
        let config = CurrencyConfig {
            network: "testnet".into(),
            chain_id: 97,
            chain_name: "bsc".into(),
            rpc_endpoint: "http://a".into(),
            rpc_endpoint_backups: vec![" http://b ".into(), "".into(), "http://c".into()],
            required_confirmations: 5,
            average_block_time: 3000,
            block_time: 3000,
            internal_endpoint: String::new(),
            webhook_api: "http://hook".into(),
            queue_name: "bsc".into(),
        };
        assert_eq!(config.rpc_endpoints(), vec!["http://a", "http://b", "http://c"]);
    }

    #[test]
    fn test_incomplete_patch_rejected() {
        let patch = CurrencyConfigPatch {
            chain_id: Some(1),
            ..Default::default()
        };
        let err = patch.into_config("eth").unwrap_err();
        assert!(matches!(err, RegistryError::IncompleteConfig { field: "chain_name", .. }));
    }
}
