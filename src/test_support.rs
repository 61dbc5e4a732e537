//! In-memory collaborators and fixtures shared by the unit tests.

use alloy::dyn_abi::DynSolValue;
use alloy::primitives::{keccak256, Address, LogData, B256};
use alloy::rpc::types::{Filter, Log};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::callbacks::{CrawlerHooks, CrawlerInfo};
use crate::crawler::PlatformStrategy;
use crate::db::{JobStatus, JobStatusRecord, JobStatusStore, NewJobStatus};
use crate::gateway::decoder::AbiCatalog;
use crate::gateway::events::EventExtractors;
use crate::gateway::rpc::ChainRpc;
use crate::gateway::types::{BatchOutcome, ReceiptInfo, TokenInfo, TransactionStatus, TxDetails};
use crate::gateway::Gateway;
use crate::queue::backend::{NewJob, QueueBackend, QueueCounts, QueueJob};
use crate::queue::webhook::{DeliveryStatus, WebhookSink};
use crate::queue::EventPayload;
use crate::registration::TokenLookup;
use crate::registry::types::{normalize_address, ContractRegistration, Currency, CurrencyConfig, EventTopic};
use crate::registry::CurrencyRegistry;

pub const PROXY_CONTRACT: &str = "0x00000000000000000000000000000000000000cc";

pub fn bsc_config() -> CurrencyConfig {
    CurrencyConfig {
        network: "testnet".to_string(),
        chain_id: 97,
        chain_name: "bsc".to_string(),
        rpc_endpoint: "http://localhost:8545".to_string(),
        rpc_endpoint_backups: vec![],
        required_confirmations: 5,
        average_block_time: 3000,
        block_time: 3000,
        internal_endpoint: String::new(),
        webhook_api: "http://hook.local/events".to_string(),
        queue_name: "bsc_webhook".to_string(),
    }
}

/// Native registry with a BSC config, plus the bundled ABIs.
pub fn bsc_registry() -> (Arc<CurrencyRegistry>, AbiCatalog) {
    let registry = CurrencyRegistry::new();
    let bnb = registry.get_one_currency("bnb").unwrap();
    registry.set_currency_config(&bnb, bsc_config().into()).unwrap();
    (Arc::new(registry), AbiCatalog::builtin().unwrap())
}

/// An ERC20 registration watching `Transfer`.
pub fn sample_contract(address: &str) -> ContractRegistration {
    ContractRegistration {
        contract_address: normalize_address(address),
        symbol: "TKN".to_string(),
        name: "Token".to_string(),
        decimals: 18,
        abi_key: "erc20".to_string(),
        events: vec![EventTopic {
            name: "Transfer".to_string(),
            topic: keccak256("Transfer(address,address,uint256)"),
        }],
    }
}

/// The marketplace proxy watching every event it has an extractor for.
pub fn proxy_contract(abis: &AbiCatalog) -> ContractRegistration {
    let extractors = EventExtractors::builtin();
    let names = [
        "BuyNFTEvent",
        "CancelOrderEvent",
        "MintNFTEvent",
        "AdminMintEvent",
        "SetSuperAdminEvent",
        "SetSaleAdminEvent",
        "SetCreatorAdminEvent",
        "PutUpForRentEvent",
        "RentNFTEvent",
    ]
    .into_iter()
    .filter(|name| extractors.contains(name) && abis.event("proxy", name).is_some());
    ContractRegistration {
        contract_address: PROXY_CONTRACT.to_string(),
        symbol: "MKT".to_string(),
        name: "Marketplace".to_string(),
        decimals: 18,
        abi_key: "proxy".to_string(),
        events: names
            .into_iter()
            .map(|name| EventTopic {
                name: name.to_string(),
                topic: abis.topic_for("proxy", name).unwrap(),
            })
            .collect(),
    }
}

pub fn address_topic(address: Address) -> B256 {
    address.into_word()
}

pub fn make_log(address: Address, topics: Vec<B256>, data: Vec<u8>, tx: B256) -> Log {
    Log {
        inner: alloy::primitives::Log {
            address,
            data: LogData::new_unchecked(topics, data.into()),
        },
        block_hash: None,
        block_number: None,
        block_timestamp: None,
        transaction_hash: Some(tx),
        transaction_index: None,
        log_index: None,
        removed: false,
    }
}

/// `SetSaleAdminEvent(account, true)` emitted by `contract`.
pub fn set_admin_log(contract: &ContractRegistration, tx: B256, account: Address, block: u64) -> Log {
    let topic = contract
        .events
        .iter()
        .find(|e| e.name == "SetSaleAdminEvent")
        .map(|e| e.topic)
        .unwrap();
    let data = DynSolValue::Tuple(vec![DynSolValue::Bool(true)]).abi_encode_params();
    let mut log = make_log(contract.address().unwrap(), vec![topic, address_topic(account)], data, tx);
    log.block_number = Some(block);
    log
}

pub fn sample_payload(hash: &str) -> EventPayload {
    EventPayload {
        time_stamp: DateTime::from_timestamp(1_704_067_200, 0).unwrap(),
        hash: hash.to_string(),
        from: Address::repeat_byte(0x01).to_checksum(None),
        to: Some(PROXY_CONTRACT.to_string()),
        contract_address: PROXY_CONTRACT.to_string(),
        event_type: "BuyNFTEvent".to_string(),
        chain_id: 97,
        data: json!({ "transactionId": "order-1" }),
    }
}

#[derive(Default)]
pub struct MemoryJobStore {
    records: Mutex<Vec<JobStatusRecord>>,
}

impl MemoryJobStore {
    pub fn all(&self) -> Vec<JobStatusRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobStatusStore for MemoryJobStore {
    async fn exists_for_transaction(&self, chain_name: &str, transaction: &str) -> eyre::Result<bool> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .any(|r| r.chain_name == chain_name && r.transaction == transaction))
    }

    async fn insert_waiting(&self, record: NewJobStatus) -> eyre::Result<Option<i64>> {
        let mut records = self.records.lock().unwrap();
        if records
            .iter()
            .any(|r| r.chain_name == record.chain_name && r.transaction == record.transaction)
        {
            return Ok(None);
        }
        let id = records.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        records.push(JobStatusRecord {
            id,
            status: JobStatus::Waiting,
            contract_address: record.contract_address,
            transaction: record.transaction,
            data: record.data,
            chain_name: record.chain_name,
        });
        Ok(Some(id))
    }

    async fn mark_completed(&self, id: i64) -> eyre::Result<()> {
        if let Some(r) = self.records.lock().unwrap().iter_mut().find(|r| r.id == id) {
            r.status = JobStatus::Completed;
        }
        Ok(())
    }

    async fn remove(&self, id: i64) -> eyre::Result<()> {
        self.records.lock().unwrap().retain(|r| r.id != id);
        Ok(())
    }

    async fn find_by_id(&self, id: i64) -> eyre::Result<Option<JobStatusRecord>> {
        Ok(self.records.lock().unwrap().iter().find(|r| r.id == id).cloned())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum EntryState {
    Waiting,
    Active,
    Delayed(DateTime<Utc>),
    Failed(DateTime<Utc>),
}

#[derive(Default)]
pub struct MemoryQueue {
    entries: Mutex<Vec<(QueueJob, EntryState)>>,
    next_id: AtomicUsize,
    fail_adds: Mutex<bool>,
}

impl MemoryQueue {
    /// Entries not yet completed, in insertion order.
    pub fn snapshot(&self) -> Vec<QueueJob> {
        self.entries.lock().unwrap().iter().map(|(j, _)| j.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Make `add` return an error until switched back.
    pub fn fail_adds(&self, fail: bool) {
        *self.fail_adds.lock().unwrap() = fail;
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn add(&self, queue: &str, job: NewJob) -> eyre::Result<i64> {
        if *self.fail_adds.lock().unwrap() {
            return Err(eyre::eyre!("queue unavailable"));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) as i64 + 1;
        self.entries.lock().unwrap().push((
            QueueJob {
                id,
                queue: queue.to_string(),
                record_id: job.record_id,
                payload: job.payload,
                priority: job.priority,
                attempts: job.attempts,
                max_attempts: job.max_attempts,
            },
            EntryState::Waiting,
        ));
        Ok(id)
    }

    async fn reserve(&self, queue: &str) -> eyre::Result<Option<QueueJob>> {
        let now = Utc::now();
        let mut entries = self.entries.lock().unwrap();
        let next = entries
            .iter_mut()
            .filter(|(j, state)| {
                j.queue == queue
                    && match state {
                        EntryState::Waiting => true,
                        EntryState::Delayed(at) => *at <= now,
                        _ => false,
                    }
            })
            .min_by_key(|(j, _)| (std::cmp::Reverse(j.priority), j.id));
        Ok(next.map(|(job, state)| {
            *state = EntryState::Active;
            job.clone()
        }))
    }

    async fn complete(&self, job_id: i64) -> eyre::Result<()> {
        self.entries.lock().unwrap().retain(|(j, _)| j.id != job_id);
        Ok(())
    }

    async fn fail(&self, job_id: i64, _error: &str, retry_at: Option<DateTime<Utc>>) -> eyre::Result<()> {
        if let Some((job, state)) = self.entries.lock().unwrap().iter_mut().find(|(j, _)| j.id == job_id) {
            job.attempts += 1;
            *state = match retry_at {
                Some(at) => EntryState::Delayed(at),
                None => EntryState::Failed(Utc::now()),
            };
        }
        Ok(())
    }

    async fn counts(&self, queue: &str) -> eyre::Result<QueueCounts> {
        let mut counts = QueueCounts::default();
        for (_, state) in self.entries.lock().unwrap().iter().filter(|(j, _)| j.queue == queue) {
            match state {
                EntryState::Waiting => counts.waiting += 1,
                EntryState::Active => counts.active += 1,
                EntryState::Delayed(_) => counts.delayed += 1,
                EntryState::Failed(_) => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn recover_stalled(&self, queue: &str) -> eyre::Result<u64> {
        let mut recovered = 0;
        for (job, state) in self.entries.lock().unwrap().iter_mut() {
            if job.queue == queue && *state == EntryState::Active {
                *state = EntryState::Waiting;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn prune_failed(&self, queue: &str, older_than: DateTime<Utc>) -> eyre::Result<u64> {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|(job, state)| {
            !(job.queue == queue && matches!(state, EntryState::Failed(at) if *at < older_than))
        });
        Ok((before - entries.len()) as u64)
    }
}

/// Answers deliveries from a script, then with 200 once it runs out.
pub struct ScriptedWebhook {
    statuses: Mutex<Vec<DeliveryStatus>>,
    calls: AtomicUsize,
}

impl ScriptedWebhook {
    pub fn new(mut statuses: Vec<DeliveryStatus>) -> Self {
        statuses.reverse();
        Self {
            statuses: Mutex::new(statuses),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WebhookSink for ScriptedWebhook {
    async fn deliver(&self, _url: &str, _payload: &EventPayload) -> DeliveryStatus {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.statuses.lock().unwrap().pop().unwrap_or(Some(200))
    }
}

/// Gateway with a fixed height and no logs.
pub struct StaticGateway {
    currency: Currency,
    height: u64,
}

impl StaticGateway {
    pub fn new(currency: Currency, height: u64) -> Self {
        Self { currency, height }
    }
}

#[async_trait]
impl Gateway for StaticGateway {
    fn currency(&self) -> &Currency {
        &self.currency
    }

    async fn get_block_count(&self) -> Option<u64> {
        Some(self.height)
    }

    async fn get_multi_blocks_transactions(&self, _from: u64, _to: u64) -> eyre::Result<BatchOutcome> {
        Ok(BatchOutcome::default())
    }

    async fn get_transaction_status(&self, _txid: B256) -> TransactionStatus {
        TransactionStatus::Unknown
    }

    async fn get_erc20_token_info(&self, _contract_address: &str) -> Option<TokenInfo> {
        None
    }
}

/// Chain reads served from memory.
pub struct ScriptedRpc {
    height: Mutex<u64>,
    latency: Mutex<Duration>,
    block_number_calls: AtomicUsize,
    logs: Mutex<Vec<Log>>,
    fail_logs: Mutex<bool>,
    tx_to: Mutex<HashMap<B256, Address>>,
    receipts: Mutex<HashMap<B256, ReceiptInfo>>,
}

impl ScriptedRpc {
    pub fn new(height: u64) -> Self {
        Self {
            height: Mutex::new(height),
            latency: Mutex::new(Duration::ZERO),
            block_number_calls: AtomicUsize::new(0),
            logs: Mutex::new(Vec::new()),
            fail_logs: Mutex::new(false),
            tx_to: Mutex::new(HashMap::new()),
            receipts: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_height(&self, height: u64) {
        *self.height.lock().unwrap() = height;
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn block_number_calls(&self) -> usize {
        self.block_number_calls.load(Ordering::SeqCst)
    }

    pub fn add_log(&self, log: Log) {
        self.logs.lock().unwrap().push(log);
    }

    pub fn fail_logs(&self, fail: bool) {
        *self.fail_logs.lock().unwrap() = fail;
    }

    pub fn set_transaction_to(&self, tx: B256, to: Address) {
        self.tx_to.lock().unwrap().insert(tx, to);
    }

    pub fn set_receipt(&self, tx: B256, receipt: ReceiptInfo) {
        self.receipts.lock().unwrap().insert(tx, receipt);
    }

    async fn delay(&self) {
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ChainRpc for ScriptedRpc {
    async fn block_number(&self) -> Option<u64> {
        self.block_number_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        Some(*self.height.lock().unwrap())
    }

    async fn logs(&self, _filter: &Filter) -> Option<Vec<Log>> {
        self.delay().await;
        if *self.fail_logs.lock().unwrap() {
            return None;
        }
        Some(self.logs.lock().unwrap().clone())
    }

    async fn transaction(&self, hash: B256) -> Option<TxDetails> {
        self.delay().await;
        let to = self
            .tx_to
            .lock()
            .unwrap()
            .get(&hash)
            .copied()
            .unwrap_or(Address::repeat_byte(0x77));
        Some(TxDetails {
            hash,
            from: Address::repeat_byte(0x01),
            to: Some(to),
            block_number: Some(990),
        })
    }

    async fn receipt(&self, hash: B256) -> Option<ReceiptInfo> {
        self.receipts.lock().unwrap().get(&hash).copied()
    }

    async fn block_timestamp(&self, number: u64) -> Option<u64> {
        Some(1_704_067_200 + number * 3)
    }

    async fn token_info(&self, address: Address) -> Option<TokenInfo> {
        Some(TokenInfo {
            contract_address: format!("{address:#x}"),
            symbol: "TKN".to_string(),
            network_symbol: "tkn".to_string(),
            name: "Token".to_string(),
            decimals: 18,
        })
    }
}

#[derive(Default)]
pub struct MemoryHooks {
    checkpoint: Option<u64>,
    announced: Mutex<Vec<u64>>,
}

impl MemoryHooks {
    pub fn with_checkpoint(block: u64) -> Self {
        Self {
            checkpoint: Some(block),
            announced: Mutex::new(Vec::new()),
        }
    }

    pub fn announced(&self) -> Vec<u64> {
        self.announced.lock().unwrap().clone()
    }
}

#[async_trait]
impl CrawlerHooks for MemoryHooks {
    async fn latest_crawled_block(&self, _crawler: &CrawlerInfo) -> eyre::Result<Option<u64>> {
        Ok(self.checkpoint)
    }

    async fn on_block_crawled(&self, _crawler: &CrawlerInfo, block_number: u64) -> eyre::Result<()> {
        self.announced.lock().unwrap().push(block_number);
        Ok(())
    }
}

/// Records requested ranges instead of touching a chain.
pub struct ScriptedStrategy {
    latest: Mutex<Option<u64>>,
    fail: Mutex<bool>,
    ranges: Mutex<Vec<(u64, u64)>>,
}

impl ScriptedStrategy {
    pub fn new(latest: Option<u64>) -> Self {
        Self {
            latest: Mutex::new(latest),
            fail: Mutex::new(false),
            ranges: Mutex::new(Vec::new()),
        }
    }

    pub fn set_latest(&self, latest: Option<u64>) {
        *self.latest.lock().unwrap() = latest;
    }

    pub fn fail_ranges(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    pub fn ranges(&self) -> Vec<(u64, u64)> {
        self.ranges.lock().unwrap().clone()
    }
}

#[async_trait]
impl PlatformStrategy for ScriptedStrategy {
    async fn latest_block(&self) -> Option<u64> {
        *self.latest.lock().unwrap()
    }

    async fn process_range(&self, from_block: u64, to_block: u64) -> eyre::Result<BatchOutcome> {
        if *self.fail.lock().unwrap() {
            return Err(eyre::eyre!("rpc down"));
        }
        self.ranges.lock().unwrap().push((from_block, to_block));
        Ok(BatchOutcome::default())
    }
}

#[derive(Default)]
pub struct MemoryTokenLookup {
    contracts: Mutex<Vec<(String, ContractRegistration)>>,
}

impl MemoryTokenLookup {
    pub fn insert(&self, platform: &str, registration: ContractRegistration) {
        self.contracts
            .lock()
            .unwrap()
            .push((platform.to_string(), registration));
    }
}

#[async_trait]
impl TokenLookup for MemoryTokenLookup {
    async fn find(&self, contract_address: &str) -> eyre::Result<Option<(String, ContractRegistration)>> {
        let address = normalize_address(contract_address);
        Ok(self
            .contracts
            .lock()
            .unwrap()
            .iter()
            .find(|(_, c)| c.contract_address == address)
            .cloned())
    }
}
