use alloy::dyn_abi::{DynSolValue, EventExt};
use alloy::json_abi::{Event, JsonAbi};
use alloy::primitives::B256;
use alloy::rpc::types::Log;
use eyre::WrapErr;
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::registry::types::{ContractRegistration, EventTopic};

const ERC20_ABI: &str = include_str!("../../abi/erc20.json");
const ERC721_ABI: &str = include_str!("../../abi/erc721.json");
const ERC1155_ABI: &str = include_str!("../../abi/erc1155.json");
const MARKETPLACE_PROXY_ABI: &str = include_str!("../../abi/marketplace_proxy.json");

/// A log decoded against its contract's ABI, parameters keyed by input name.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedLog {
    pub event_name: String,
    pub contract_address: String,
    pub params: Map<String, Value>,
}

impl DecodedLog {
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }
}

/// Contract ABIs addressable by the `abi_key` of a registration.
#[derive(Debug, Clone, Default)]
pub struct AbiCatalog {
    abis: HashMap<String, JsonAbi>,
}

impl AbiCatalog {
    /// Catalog with the bundled token and marketplace ABIs.
    ///
    /// Keys: `erc20`, `erc721` (alias `token`), `erc1155`, `proxy`.
    pub fn builtin() -> eyre::Result<Self> {
        let mut catalog = Self::default();
        catalog.insert_json("erc20", ERC20_ABI)?;
        catalog.insert_json("erc721", ERC721_ABI)?;
        catalog.insert_json("token", ERC721_ABI)?;
        catalog.insert_json("erc1155", ERC1155_ABI)?;
        catalog.insert_json("proxy", MARKETPLACE_PROXY_ABI)?;
        Ok(catalog)
    }

    pub fn insert_json(&mut self, key: &str, json: &str) -> eyre::Result<()> {
        let abi: JsonAbi = serde_json::from_str(json)
            .wrap_err_with(|| format!("Failed to parse ABI '{}'", key))?;
        self.abis.insert(key.to_string(), abi);
        Ok(())
    }

    /// Load an ABI file, replacing any bundled ABI with the same key.
    pub fn load_file(&mut self, key: &str, path: &str) -> eyre::Result<()> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("Failed to read ABI file '{}': {}", path, e))?;
        self.insert_json(key, &content)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.abis.contains_key(key)
    }

    pub fn event(&self, abi_key: &str, name: &str) -> Option<&Event> {
        self.abis.get(abi_key)?.events.get(name.trim())?.first()
    }

    fn event_by_selector(&self, abi_key: &str, name: &str, selector: &B256) -> Option<&Event> {
        self.abis
            .get(abi_key)?
            .events
            .get(name.trim())?
            .iter()
            .find(|e| &e.selector() == selector)
    }

    /// Every event name declared by any ABI in the catalog.
    pub fn event_names(&self) -> impl Iterator<Item = &str> {
        self.abis.values().flat_map(|abi| abi.events.keys().map(String::as_str))
    }

    /// Topic for a named event of an ABI, from its canonical signature.
    pub fn topic_for(&self, abi_key: &str, name: &str) -> Option<B256> {
        self.event(abi_key, name).map(|e| e.selector())
    }

    /// Check a registration against the catalog and fill in derivable topics.
    ///
    /// Entries whose topic is zero get the selector of the named ABI event.
    pub fn resolve_registration(&self, registration: &mut ContractRegistration) -> eyre::Result<()> {
        if !self.contains(&registration.abi_key) {
            return Err(eyre::eyre!(
                "Unknown ABI key '{}' for contract {}",
                registration.abi_key,
                registration.contract_address
            ));
        }
        for event in registration.events.iter_mut() {
            let selector = self.topic_for(&registration.abi_key, &event.name).ok_or_else(|| {
                eyre::eyre!(
                    "Event '{}' not found in ABI '{}' for contract {}",
                    event.name,
                    registration.abi_key,
                    registration.contract_address
                )
            })?;
            if event.topic == B256::ZERO {
                event.topic = selector;
            }
        }
        Ok(())
    }

    /// Decode a log emitted by `contract`.
    ///
    /// Returns `None` when the topic is not one of the contract's watched
    /// events or the data does not match the ABI.
    pub fn decode(&self, contract: &ContractRegistration, log: &Log) -> Option<DecodedLog> {
        let topic0 = log.topics().first()?;
        let EventTopic { name, .. } = contract.event_for_topic(topic0)?;
        let event = match self.event_by_selector(&contract.abi_key, name, topic0) {
            Some(event) => event,
            None => {
                tracing::warn!(
                    contract = %contract.contract_address,
                    event = %name,
                    abi = %contract.abi_key,
                    "Event inputs not found in ABI"
                );
                return None;
            }
        };

        let decoded = match event.decode_log(&log.inner.data) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(
                    contract = %contract.contract_address,
                    event = %name,
                    tx = ?log.transaction_hash,
                    error = %e,
                    "Failed to decode log"
                );
                return None;
            }
        };

        let mut indexed = decoded.indexed.into_iter();
        let mut body = decoded.body.into_iter();
        let mut params = Map::new();
        for input in &event.inputs {
            let value = if input.indexed { indexed.next() } else { body.next() };
            if let Some(value) = value {
                params.insert(input.name.clone(), to_json(&value));
            }
        }

        Some(DecodedLog {
            event_name: name.trim().to_string(),
            contract_address: contract.contract_address.clone(),
            params,
        })
    }
}

/// JSON rendering of an ABI value. Integers become decimal strings so large
/// values survive JSON consumers.
pub fn to_json(value: &DynSolValue) -> Value {
    match value {
        DynSolValue::Bool(b) => Value::Bool(*b),
        DynSolValue::Int(i, _) => Value::String(i.to_string()),
        DynSolValue::Uint(u, _) => Value::String(u.to_string()),
        DynSolValue::FixedBytes(word, size) => {
            Value::String(format!("0x{}", hex::encode(&word[..*size])))
        }
        DynSolValue::Address(a) => Value::String(a.to_checksum(None)),
        DynSolValue::Bytes(b) => Value::String(format!("0x{}", hex::encode(b))),
        DynSolValue::String(s) => Value::String(s.clone()),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) | DynSolValue::Tuple(items) => {
            Value::Array(items.iter().map(to_json).collect())
        }
        _ => Value::Null,
    }
}
