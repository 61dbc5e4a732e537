use alloy::network::TransactionResponse;
use alloy::primitives::{Address, B256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::{BlockNumberOrTag, Filter, Log};
use alloy::sol;
use async_trait::async_trait;
use eyre::WrapErr;

use std::sync::Arc;

use crate::gateway::rotator::EndpointRotator;
use crate::gateway::types::{ReceiptInfo, TokenInfo, TxDetails};
use crate::registry::types::{normalize_address, Currency};
use crate::registry::CurrencyRegistry;

sol! {
    #[sol(rpc)]
    interface IERC20Metadata {
        function symbol() external view returns (string);
        function name() external view returns (string);
        function decimals() external view returns (uint8);
    }
}

/// Chain reads the gateway needs. `None` means the data could not be obtained.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn block_number(&self) -> Option<u64>;
    async fn logs(&self, filter: &Filter) -> Option<Vec<Log>>;
    async fn transaction(&self, hash: B256) -> Option<TxDetails>;
    async fn receipt(&self, hash: B256) -> Option<ReceiptInfo>;
    /// Block timestamp in seconds.
    async fn block_timestamp(&self, number: u64) -> Option<u64>;
    async fn token_info(&self, address: Address) -> Option<TokenInfo>;
}

/// `ChainRpc` over alloy HTTP providers with endpoint failover.
pub struct RotatingRpc {
    rotator: EndpointRotator<DynProvider>,
}

impl RotatingRpc {
    pub fn new(label: impl Into<String>, endpoints: Vec<String>) -> Self {
        Self {
            rotator: EndpointRotator::new(label, endpoints, connect_http),
        }
    }

    /// Swap in a new endpoint list; calls move to its primary.
    pub fn set_endpoints(&self, endpoints: Vec<String>) {
        self.rotator.set_endpoints(endpoints);
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.rotator.endpoints()
    }

    /// Keep the endpoint list in step with config writes for `currency`.
    ///
    /// A write to the currency itself, or to its platform's native currency
    /// while the currency has no config of its own, replaces the endpoints.
    pub fn follow_config(self: &Arc<Self>, registry: &Arc<CurrencyRegistry>, currency: &Currency) {
        let rpc = Arc::downgrade(self);
        let lookup = Arc::downgrade(registry);
        let watched = currency.clone();
        registry.on_currency_config_set(move |changed, _| {
            if changed.platform != watched.platform || !(changed == &watched || changed.is_native) {
                return;
            }
            let (Some(rpc), Some(registry)) = (rpc.upgrade(), lookup.upgrade()) else {
                return;
            };
            match registry.get_currency_config(&watched) {
                Ok(config) => rpc.set_endpoints(config.rpc_endpoints()),
                Err(e) => tracing::warn!(symbol = %watched.symbol, error = %e, "No config to follow"),
            }
        });
    }
}

fn connect_http(url: &str) -> eyre::Result<DynProvider> {
    let parsed = url
        .parse()
        .wrap_err_with(|| format!("Invalid RPC URL: {}", url))?;
    Ok(ProviderBuilder::new().connect_http(parsed).erased())
}

#[async_trait]
impl ChainRpc for RotatingRpc {
    async fn block_number(&self) -> Option<u64> {
        self.rotator
            .call("get_block_number", |provider| async move {
                Ok(provider.get_block_number().await?)
            })
            .await
    }

    async fn logs(&self, filter: &Filter) -> Option<Vec<Log>> {
        self.rotator
            .call("get_logs", |provider| {
                let filter = filter.clone();
                async move { Ok(provider.get_logs(&filter).await?) }
            })
            .await
    }

    async fn transaction(&self, hash: B256) -> Option<TxDetails> {
        let tx = self
            .rotator
            .call("get_transaction_by_hash", |provider| async move {
                Ok(provider.get_transaction_by_hash(hash).await?)
            })
            .await??;

        Some(TxDetails {
            hash: TransactionResponse::tx_hash(&tx),
            from: TransactionResponse::from(&tx),
            to: alloy::consensus::Transaction::to(&tx),
            block_number: TransactionResponse::block_number(&tx),
        })
    }

    async fn receipt(&self, hash: B256) -> Option<ReceiptInfo> {
        let receipt = self
            .rotator
            .call("get_transaction_receipt", |provider| async move {
                Ok(provider.get_transaction_receipt(hash).await?)
            })
            .await??;

        Some(ReceiptInfo {
            success: receipt.status(),
            block_number: receipt.block_number,
        })
    }

    async fn block_timestamp(&self, number: u64) -> Option<u64> {
        let block = self
            .rotator
            .call("get_block_by_number", |provider| async move {
                Ok(provider
                    .get_block_by_number(BlockNumberOrTag::Number(number))
                    .await?)
            })
            .await??;
        Some(block.header.timestamp)
    }

    async fn token_info(&self, address: Address) -> Option<TokenInfo> {
        self.rotator
            .call("erc20_metadata", |provider| async move {
                let contract = IERC20Metadata::new(address, provider);
                let symbol = contract.symbol().call().await?;
                let name = contract.name().call().await?;
                let decimals = contract.decimals().call().await?;
                Ok(TokenInfo {
                    contract_address: normalize_address(&address.to_string()),
                    symbol: symbol.clone(),
                    network_symbol: symbol.to_lowercase(),
                    name,
                    decimals,
                })
            })
            .await
    }
}
