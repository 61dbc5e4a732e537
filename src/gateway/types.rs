use alloy::primitives::{Address, B256};
use serde::Serialize;

/// The parts of a transaction the dispatcher reports downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxDetails {
    pub hash: B256,
    pub from: Address,
    pub to: Option<Address>,
    pub block_number: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptInfo {
    pub success: bool,
    pub block_number: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Unknown,
    Confirming,
    Completed,
    Failed,
}

impl TransactionStatus {
    /// Classify a receipt given the current height and the chain's confirmation depth.
    pub fn classify(receipt: Option<ReceiptInfo>, latest_block: u64, required_confirmations: u64) -> Self {
        let Some(receipt) = receipt else {
            return Self::Unknown;
        };
        let Some(mined_at) = receipt.block_number else {
            return Self::Confirming;
        };
        if !receipt.success {
            return Self::Failed;
        }
        let confirmations = latest_block.saturating_sub(mined_at) + 1;
        if confirmations < required_confirmations {
            Self::Confirming
        } else {
            Self::Completed
        }
    }
}

/// On-chain metadata of a fungible token contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenInfo {
    pub contract_address: String,
    pub symbol: String,
    pub network_symbol: String,
    pub name: String,
    pub decimals: u8,
}

/// Result of processing one block range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub logs: usize,
    pub dispatched: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receipt(success: bool, block: u64) -> Option<ReceiptInfo> {
        Some(ReceiptInfo {
            success,
            block_number: Some(block),
        })
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(TransactionStatus::classify(None, 100, 5), TransactionStatus::Unknown);
        assert_eq!(TransactionStatus::classify(receipt(true, 98), 100, 5), TransactionStatus::Confirming);
        assert_eq!(TransactionStatus::classify(receipt(true, 96), 100, 5), TransactionStatus::Completed);
        assert_eq!(TransactionStatus::classify(receipt(false, 90), 100, 5), TransactionStatus::Failed);
    }
}
