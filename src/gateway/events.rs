use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::gateway::decoder::{AbiCatalog, DecodedLog};
use crate::registry::types::ContractRegistration;

/// Builds the `data` object of a webhook payload from a decoded log.
pub type Extractor = fn(&DecodedLog) -> Option<Value>;

pub const TRANSFER: &str = "Transfer";
pub const TRANSFER_BATCH: &str = "TransferBatch";

/// Copy the listed params into a new object, renaming `(out, param)`.
/// Params missing from the log are left out.
fn pick(decoded: &DecodedLog, fields: &[(&str, &str)]) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, param) in fields {
        if let Some(value) = decoded.param(param) {
            out.insert((*key).to_string(), value.clone());
        }
    }
    out
}

fn transaction_only(d: &DecodedLog) -> Option<Value> {
    Some(Value::Object(pick(d, &[("transactionId", "transactionId")])))
}

fn mint_nft(d: &DecodedLog) -> Option<Value> {
    Some(Value::Object(pick(
        d,
        &[
            ("transactionId", "transactionId"),
            ("totalSupply", "totalSupply"),
            ("totalMinted", "totalMinted"),
            ("tokenId", "tokenId"),
            ("priceConvert", "priceConvert"),
            ("quantity", "quantity"),
        ],
    )))
}

fn admin_mint(d: &DecodedLog) -> Option<Value> {
    Some(Value::Object(pick(
        d,
        &[
            ("transactionId", "transactionId"),
            ("totalSupply", "totalSupply"),
            ("totalMinted", "totalMinted"),
            ("tokenIds", "tokenIds"),
        ],
    )))
}

fn transfer(d: &DecodedLog) -> Option<Value> {
    Some(Value::Object(pick(
        d,
        &[("from", "from"), ("to", "to"), ("tokenId", "tokenId"), ("value", "value")],
    )))
}

fn transfer_single(d: &DecodedLog) -> Option<Value> {
    Some(Value::Object(pick(
        d,
        &[
            ("operator", "operator"),
            ("from", "from"),
            ("to", "to"),
            ("id", "id"),
            ("value", "value"),
        ],
    )))
}

fn transfer_batch(d: &DecodedLog) -> Option<Value> {
    Some(Value::Object(pick(
        d,
        &[
            ("operator", "operator"),
            ("from", "from"),
            ("to", "to"),
            ("ids", "ids"),
            ("values", "values"),
        ],
    )))
}

fn set_super_admin(d: &DecodedLog) -> Option<Value> {
    let mut out = pick(d, &[("account", "account")]);
    out.insert("value".to_string(), Value::Bool(true));
    Some(Value::Object(out))
}

fn role_change(d: &DecodedLog) -> Option<Value> {
    Some(Value::Object(pick(d, &[("account", "account"), ("value", "value")])))
}

fn rent_listing(d: &DecodedLog) -> Option<Value> {
    Some(Value::Object(pick(
        d,
        &[
            ("tokenId", "tokenId"),
            ("endTime", "expDate"),
            ("startTime", "startDate"),
            ("fee", "fee"),
            ("tokenAddress", "tokenAddress"),
            ("owner", "owner"),
            ("transactionId", "transactionId"),
        ],
    )))
}

fn rent_nft(d: &DecodedLog) -> Option<Value> {
    Some(Value::Object(pick(
        d,
        &[
            ("tokenId", "tokenId"),
            ("endTime", "expDate"),
            ("startTime", "startDate"),
            ("totalFee", "totalFee"),
            ("renter", "renter"),
            ("owner", "owner"),
            ("transactionId", "transactionId"),
        ],
    )))
}

fn pool_updated(d: &DecodedLog) -> Option<Value> {
    Some(Value::Object(pick(
        d,
        &[
            ("rewardFund", "rewardFund"),
            ("creator", "creator"),
            ("poolId", "poolId"),
            ("internalTxID", "internalTxID"),
            ("eventType", "eventType"),
        ],
    )))
}

fn staking(d: &DecodedLog) -> Option<Value> {
    Some(Value::Object(pick(
        d,
        &[
            ("amount", "amount"),
            ("account", "account"),
            ("poolId", "poolId"),
            ("internalTxID", "internalTxID"),
            ("eventType", "eventType"),
        ],
    )))
}

fn transfer_initiated(d: &DecodedLog) -> Option<Value> {
    Some(Value::Object(pick(
        d,
        &[("amount", "amount"), ("targetChain", "targetChain")],
    )))
}

/// Event name to payload extractor. Events without an entry are not dispatched.
pub struct EventExtractors {
    table: HashMap<&'static str, Extractor>,
}

impl EventExtractors {
    pub fn builtin() -> Self {
        let entries: [(&'static str, Extractor); 16] = [
            ("BuyNFTEvent", transaction_only),
            ("CancelOrderEvent", transaction_only),
            ("MintNFTEvent", mint_nft),
            ("AdminMintEvent", admin_mint),
            (TRANSFER, transfer),
            ("TransferSingle", transfer_single),
            (TRANSFER_BATCH, transfer_batch),
            ("SetSuperAdminEvent", set_super_admin),
            ("SetSaleAdminEvent", role_change),
            ("SetCreatorAdminEvent", role_change),
            ("PutUpForRentEvent", rent_listing),
            ("CancelPutUpForRentEvent", rent_listing),
            ("RentNFTEvent", rent_nft),
            ("PoolUpdated", pool_updated),
            ("StakingEvent", staking),
            ("TransferInitiated", transfer_initiated),
        ];
        Self {
            table: entries.into_iter().collect(),
        }
    }

    pub fn contains(&self, event_name: &str) -> bool {
        self.table.contains_key(event_name.trim())
    }

    pub fn extract(&self, decoded: &DecodedLog) -> Option<Value> {
        let extractor = self.table.get(decoded.event_name.as_str())?;
        extractor(decoded)
    }

    /// Every extractor must correspond to an event some ABI declares.
    pub fn validate(&self, catalog: &AbiCatalog) -> eyre::Result<()> {
        let known: std::collections::HashSet<&str> = catalog.event_names().collect();
        let mut missing: Vec<&str> = self
            .table
            .keys()
            .copied()
            .filter(|name| !known.contains(name))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        missing.sort_unstable();
        Err(eyre::eyre!(
            "Payload extractors reference events missing from every ABI: {}",
            missing.join(", ")
        ))
    }

    /// Watched events of a registration that have no extractor.
    pub fn unhandled_events<'a>(&self, registration: &'a ContractRegistration) -> Vec<&'a str> {
        registration
            .events
            .iter()
            .map(|e| e.name.as_str())
            .filter(|name| !self.contains(name))
            .collect()
    }
}
