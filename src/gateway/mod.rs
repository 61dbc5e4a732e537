pub mod cache;
pub mod decoder;
pub mod events;
pub mod evm;
pub mod rotator;
pub mod rpc;
pub mod types;

use alloy::primitives::B256;
use async_trait::async_trait;

use crate::registry::types::Currency;
use types::{BatchOutcome, TokenInfo, TransactionStatus};

/// Network access for one chain: heights, log ranges, transaction lookups.
#[async_trait]
pub trait Gateway: Send + Sync {
    fn currency(&self) -> &Currency;

    /// Latest network height minus one, or `None` if no endpoint answered.
    async fn get_block_count(&self) -> Option<u64>;

    /// Fetch the watched contracts' logs in `[from_block, to_block]` and
    /// dispatch every new decoded event.
    async fn get_multi_blocks_transactions(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> eyre::Result<BatchOutcome>;

    async fn get_transaction_status(&self, txid: B256) -> TransactionStatus;

    async fn get_erc20_token_info(&self, contract_address: &str) -> Option<TokenInfo>;
}
