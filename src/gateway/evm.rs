use alloy::primitives::{Address, B256};
use alloy::rpc::types::{Filter, Log};
use async_trait::async_trait;
use chrono::DateTime;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::ChainConfig;
use crate::db::{JobStatusStore, NewJobStatus};
use crate::gateway::cache::BoundedCache;
use crate::gateway::decoder::AbiCatalog;
use crate::gateway::events::{EventExtractors, TRANSFER, TRANSFER_BATCH};
use crate::gateway::rpc::ChainRpc;
use crate::gateway::types::{BatchOutcome, TokenInfo, TransactionStatus, TxDetails};
use crate::gateway::Gateway;
use crate::queue::backend::{NewJob, QueueBackend};
use crate::queue::EventPayload;
use crate::registry::types::{ContractRegistration, Currency};
use crate::registry::CurrencyRegistry;

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    /// Logs processed concurrently within one batch.
    pub parallel_limit: usize,
    pub block_count_ttl: Duration,
    pub cache_max_entries: usize,
    pub cache_max_age: Duration,
    /// Transfers sent to this contract are internal and never dispatched.
    pub proxy_address: Option<Address>,
    pub queue_attempts: u32,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            parallel_limit: 5,
            block_count_ttl: Duration::from_secs(10),
            cache_max_entries: 1024,
            cache_max_age: Duration::from_secs(300),
            proxy_address: None,
            queue_attempts: 100,
        }
    }
}

impl GatewayOptions {
    pub fn from_chain(chain: &ChainConfig, queue_attempts: u32) -> Self {
        Self {
            parallel_limit: chain.parallel_request_limit.max(1),
            block_count_ttl: Duration::from_millis(chain.block_count_cache_ms),
            cache_max_entries: chain.cache.max_entries,
            cache_max_age: Duration::from_secs(chain.cache.max_age_secs),
            proxy_address: chain
                .proxy_contract_address
                .as_deref()
                .and_then(|a| Address::from_str(a).ok()),
            queue_attempts,
        }
    }
}

/// Removes a transaction hash from the in-flight set when dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<B256>>,
    hash: B256,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        lock(self.set).remove(&self.hash);
    }
}

/// Gateway for an EVM chain. One instance per native currency.
pub struct EvmGateway {
    currency: Currency,
    registry: Arc<CurrencyRegistry>,
    rpc: Arc<dyn ChainRpc>,
    abis: Arc<AbiCatalog>,
    extractors: Arc<EventExtractors>,
    job_store: Arc<dyn JobStatusStore>,
    queue: Arc<dyn QueueBackend>,
    options: GatewayOptions,
    // Held across the refresh so concurrent callers wait for one RPC call.
    block_count: tokio::sync::Mutex<Option<(u64, Instant)>>,
    tx_cache: Mutex<BoundedCache<B256, TxDetails>>,
    timestamp_cache: Mutex<BoundedCache<u64, u64>>,
    in_flight: Mutex<HashSet<B256>>,
}

impl EvmGateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        currency: Currency,
        registry: Arc<CurrencyRegistry>,
        rpc: Arc<dyn ChainRpc>,
        abis: Arc<AbiCatalog>,
        extractors: Arc<EventExtractors>,
        job_store: Arc<dyn JobStatusStore>,
        queue: Arc<dyn QueueBackend>,
        options: GatewayOptions,
    ) -> Self {
        let tx_cache = BoundedCache::new(options.cache_max_entries, options.cache_max_age);
        let timestamp_cache = BoundedCache::new(options.cache_max_entries, options.cache_max_age);
        Self {
            currency,
            registry,
            rpc,
            abis,
            extractors,
            job_store,
            queue,
            options,
            block_count: tokio::sync::Mutex::new(None),
            tx_cache: Mutex::new(tx_cache),
            timestamp_cache: Mutex::new(timestamp_cache),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Transaction details, served from the cache within its window.
    async fn get_transaction(&self, hash: B256) -> Option<TxDetails> {
        let cached = lock(&self.tx_cache).get(&hash);
        if let Some(tx) = cached {
            return Some(tx);
        }
        let tx = self.rpc.transaction(hash).await?;
        lock(&self.tx_cache).insert(hash, tx.clone());
        Some(tx)
    }

    async fn get_block_timestamp(&self, number: u64) -> Option<u64> {
        let cached = lock(&self.timestamp_cache).get(&number);
        if let Some(ts) = cached {
            return Some(ts);
        }
        let ts = self.rpc.block_timestamp(number).await?;
        lock(&self.timestamp_cache).insert(number, ts);
        Some(ts)
    }

    /// Contracts watched on this gateway's platform, keyed by address.
    fn watched_contracts(&self) -> HashMap<Address, ContractRegistration> {
        self.registry
            .contracts_of_platform(self.currency.platform)
            .into_iter()
            .filter_map(|c| c.address().map(|a| (a, c)))
            .collect()
    }

    async fn get_log_transactions(
        &self,
        from_block: u64,
        to_block: u64,
        contracts: &HashMap<Address, ContractRegistration>,
    ) -> eyre::Result<Vec<Log>> {
        let addresses: Vec<Address> = contracts.keys().copied().collect();
        let topics: Vec<B256> = contracts
            .values()
            .flat_map(|c| c.events.iter().map(|e| e.topic))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let filter = Filter::new()
            .address(addresses)
            .event_signature(topics)
            .from_block(from_block)
            .to_block(to_block);

        self.rpc.logs(&filter).await.ok_or_else(|| {
            eyre::eyre!(
                "Could not fetch logs for {} blocks {}..{}",
                self.currency.symbol,
                from_block,
                to_block
            )
        })
    }

    /// Fan out log handling with bounded concurrency. Completion order is unspecified.
    pub async fn process_logs(
        &self,
        logs: Vec<Log>,
        contracts: &HashMap<Address, ContractRegistration>,
    ) -> eyre::Result<BatchOutcome> {
        let total = logs.len();
        let results: Vec<eyre::Result<bool>> = futures::stream::iter(logs)
            .map(|log| async move { self.get_one_log(&log, contracts).await })
            .buffer_unordered(self.options.parallel_limit.max(1))
            .collect()
            .await;

        let mut outcome = BatchOutcome {
            logs: total,
            dispatched: 0,
        };
        let mut first_error = None;
        for result in results {
            match result {
                Ok(true) => outcome.dispatched += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(chain = %self.currency.symbol, error = %e, "Failed to handle log");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    }

    /// Decode and dispatch a single log. Returns whether a job was queued.
    async fn get_one_log(
        &self,
        log: &Log,
        contracts: &HashMap<Address, ContractRegistration>,
    ) -> eyre::Result<bool> {
        if log.removed {
            return Ok(false);
        }
        let Some(tx_hash) = log.transaction_hash else {
            return Ok(false);
        };
        // Only the emitting contract's ABI applies.
        let Some(contract) = contracts.get(&log.address()) else {
            return Ok(false);
        };
        let Some(decoded) = self.abis.decode(contract, log) else {
            return Ok(false);
        };
        let Some(data) = self.extractors.extract(&decoded) else {
            tracing::debug!(event = %decoded.event_name, "No payload extractor for event");
            return Ok(false);
        };

        let hash = format!("{:#x}", tx_hash);
        let tx = self
            .get_transaction(tx_hash)
            .await
            .ok_or_else(|| eyre::eyre!("Could not fetch transaction {}", hash))?;

        // Checked before claiming: sibling events of a suppressed transfer still dispatch.
        if decoded.event_name == TRANSFER || decoded.event_name == TRANSFER_BATCH {
            if let (Some(proxy), Some(to)) = (self.options.proxy_address, tx.to) {
                if to == proxy {
                    tracing::debug!(tx = %hash, event = %decoded.event_name, "Skipping transfer through proxy");
                    return Ok(false);
                }
            }
        }

        let Some(_claim) = self.claim(tx_hash) else {
            tracing::debug!(tx = %tx_hash, "Transaction already being handled");
            return Ok(false);
        };

        let config = self.registry.get_currency_config(&self.currency)?;
        if self
            .job_store
            .exists_for_transaction(&config.chain_name, &hash)
            .await?
        {
            tracing::debug!(tx = %hash, "Transaction already crawled");
            return Ok(false);
        }

        let block_number = log
            .block_number
            .or(tx.block_number)
            .ok_or_else(|| eyre::eyre!("Log for {} has no block number", hash))?;
        let timestamp = match log.block_timestamp {
            Some(ts) => ts,
            None => self
                .get_block_timestamp(block_number)
                .await
                .ok_or_else(|| eyre::eyre!("Could not fetch block {}", block_number))?,
        };

        let payload = EventPayload {
            time_stamp: DateTime::from_timestamp(timestamp as i64, 0).unwrap_or_default(),
            hash: hash.clone(),
            from: tx.from.to_checksum(None),
            to: tx.to.map(|a| a.to_checksum(None)),
            contract_address: contract.contract_address.clone(),
            event_type: decoded.event_name.clone(),
            chain_id: config.chain_id,
            data,
        };

        let record_id = self
            .job_store
            .insert_waiting(NewJobStatus {
                contract_address: contract.contract_address.clone(),
                transaction: hash.clone(),
                data: payload.data.clone(),
                chain_name: config.chain_name.clone(),
            })
            .await?;
        let Some(record_id) = record_id else {
            tracing::debug!(tx = %hash, "Job status already recorded");
            return Ok(false);
        };

        let job = NewJob {
            record_id,
            payload,
            priority: 0,
            attempts: 0,
            max_attempts: self.options.queue_attempts,
        };
        let job_id = match self.queue.add(&config.queue_name, job).await {
            Ok(id) => id,
            Err(e) => {
                // Drop the status row so the next crawl of this range retries.
                if let Err(cleanup) = self.job_store.remove(record_id).await {
                    tracing::error!(tx = %hash, record_id, error = %cleanup, "Could not remove orphaned job status");
                }
                return Err(e.wrap_err(format!("Could not enqueue {}", hash)));
            }
        };

        tracing::info!(
            chain = %self.currency.symbol,
            queue = %config.queue_name,
            tx = %hash,
            event = %decoded.event_name,
            contract = %contract.contract_address,
            block = block_number,
            record_id,
            job_id,
            "Event dispatched"
        );
        Ok(true)
    }

    fn claim(&self, hash: B256) -> Option<InFlight<'_>> {
        if !lock(&self.in_flight).insert(hash) {
            return None;
        }
        Some(InFlight {
            set: &self.in_flight,
            hash,
        })
    }
}

#[async_trait]
impl Gateway for EvmGateway {
    fn currency(&self) -> &Currency {
        &self.currency
    }

    async fn get_block_count(&self) -> Option<u64> {
        let mut cached = self.block_count.lock().await;
        if let Some((height, fetched_at)) = *cached {
            if fetched_at.elapsed() < self.options.block_count_ttl {
                return Some(height);
            }
        }

        let latest = self.rpc.block_number().await?;
        let height = latest.saturating_sub(1);
        *cached = Some((height, Instant::now()));
        Some(height)
    }

    async fn get_multi_blocks_transactions(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> eyre::Result<BatchOutcome> {
        let contracts = self.watched_contracts();
        if contracts.is_empty() {
            tracing::debug!(chain = %self.currency.symbol, "No watched contracts");
            return Ok(BatchOutcome::default());
        }

        let logs = self.get_log_transactions(from_block, to_block, &contracts).await?;
        tracing::debug!(
            chain = %self.currency.symbol,
            from = from_block,
            to = to_block,
            logs = logs.len(),
            "Fetched logs"
        );
        self.process_logs(logs, &contracts).await
    }

    async fn get_transaction_status(&self, txid: B256) -> TransactionStatus {
        let Ok(config) = self.registry.get_currency_config(&self.currency) else {
            return TransactionStatus::Unknown;
        };
        let receipt = self.rpc.receipt(txid).await;
        let Some(latest) = self.get_block_count().await else {
            return TransactionStatus::Unknown;
        };
        TransactionStatus::classify(receipt, latest, config.required_confirmations)
    }

    async fn get_erc20_token_info(&self, contract_address: &str) -> Option<TokenInfo> {
        let address = match Address::from_str(contract_address.trim()) {
            Ok(address) => address,
            Err(e) => {
                tracing::warn!(contract = contract_address, error = %e, "Invalid token address");
                return None;
            }
        };
        let info = self.rpc.token_info(address).await;
        if info.is_none() {
            tracing::warn!(chain = %self.currency.symbol, contract = contract_address, "Could not read token metadata");
        }
        info
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::JobStatus;
    use crate::gateway::types::ReceiptInfo;
    use crate::test_support::{
        bsc_registry, make_log, proxy_contract, set_admin_log, MemoryJobStore, MemoryQueue, ScriptedRpc,
        PROXY_CONTRACT,
    };
    use alloy::primitives::address;

    struct Fixture {
        gateway: Arc<EvmGateway>,
        rpc: Arc<ScriptedRpc>,
        store: Arc<MemoryJobStore>,
        queue: Arc<MemoryQueue>,
        contract: ContractRegistration,
    }

    fn fixture(options: GatewayOptions) -> Fixture {
        let (registry, abis) = bsc_registry();
        let contract = proxy_contract(&abis);
        registry.register_bep20_token(contract.clone());
        let rpc = Arc::new(ScriptedRpc::new(1000));
        let store = Arc::new(MemoryJobStore::default());
        let queue = Arc::new(MemoryQueue::default());
        let currency = registry.get_one_currency("bnb").unwrap();
        let gateway = Arc::new(EvmGateway::new(
            currency,
            registry,
            rpc.clone(),
            Arc::new(abis),
            Arc::new(EventExtractors::builtin()),
            store.clone(),
            queue.clone(),
            options,
        ));
        Fixture {
            gateway,
            rpc,
            store,
            queue,
            contract,
        }
    }

    #[tokio::test]
    async fn test_block_count_is_height_minus_one_and_cached() {
        let f = fixture(GatewayOptions::default());
        assert_eq!(f.gateway.get_block_count().await, Some(999));
        f.rpc.set_height(1010);
        assert_eq!(f.gateway.get_block_count().await, Some(999));
        assert_eq!(f.rpc.block_number_calls(), 1);
    }

    #[tokio::test]
    async fn test_block_count_single_flight() {
        let f = fixture(GatewayOptions::default());
        f.rpc.set_latency(Duration::from_millis(50));
        let calls = (0..8).map(|_| {
            let gateway = f.gateway.clone();
            async move { gateway.get_block_count().await }
        });
        let heights = futures::future::join_all(calls).await;
        assert!(heights.iter().all(|h| *h == Some(999)));
        assert_eq!(f.rpc.block_number_calls(), 1);
    }

    #[tokio::test]
    async fn test_block_count_refreshes_after_ttl() {
        let f = fixture(GatewayOptions {
            block_count_ttl: Duration::ZERO,
            ..Default::default()
        });
        f.gateway.get_block_count().await;
        f.rpc.set_height(1010);
        assert_eq!(f.gateway.get_block_count().await, Some(1009));
    }

    #[tokio::test]
    async fn test_dispatches_decoded_event() {
        let f = fixture(GatewayOptions::default());
        let tx = B256::repeat_byte(0x01);
        let account = Address::repeat_byte(0x33);
        f.rpc.add_log(set_admin_log(&f.contract, tx, account, 990));

        let outcome = f.gateway.get_multi_blocks_transactions(980, 995).await.unwrap();
        assert_eq!(outcome, BatchOutcome { logs: 1, dispatched: 1 });

        let records = f.store.all();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, JobStatus::Waiting);
        assert_eq!(records[0].chain_name, "bsc");

        let jobs = f.queue.snapshot();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].queue, "bsc_webhook");
        assert_eq!(jobs[0].payload.event_type, "SetSaleAdminEvent");
        assert_eq!(jobs[0].payload.chain_id, 97);
        assert_eq!(jobs[0].payload.data["account"], account.to_checksum(None));
    }

    #[tokio::test]
    async fn test_same_transaction_dispatched_once() {
        let f = fixture(GatewayOptions {
            parallel_limit: 10,
            ..Default::default()
        });
        f.rpc.set_latency(Duration::from_millis(10));
        let tx = B256::repeat_byte(0x02);
        let account = Address::repeat_byte(0x44);
        let log = set_admin_log(&f.contract, tx, account, 990);

        let contracts = f.gateway.watched_contracts();
        let outcome = f
            .gateway
            .process_logs(vec![log.clone(), log], &contracts)
            .await
            .unwrap();
        assert_eq!(outcome.dispatched, 1);
        assert_eq!(f.store.all().len(), 1);
        assert_eq!(f.queue.len(), 1);

        // a later crawl over the same range is a no-op
        f.rpc.add_log(set_admin_log(&f.contract, tx, account, 990));
        let again = f.gateway.get_multi_blocks_transactions(980, 995).await.unwrap();
        assert_eq!(again.dispatched, 0);
        assert_eq!(f.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_logs_from_other_contracts_ignored() {
        let f = fixture(GatewayOptions::default());
        let mut log = set_admin_log(&f.contract, B256::repeat_byte(0x03), Address::repeat_byte(0x55), 990);
        log.inner.address = Address::repeat_byte(0x99);
        let contracts = f.gateway.watched_contracts();
        let outcome = f.gateway.process_logs(vec![log], &contracts).await.unwrap();
        assert_eq!(outcome.dispatched, 0);
        assert!(f.store.all().is_empty());
    }

    /// Registers an ERC721 contract and returns a `Transfer` log it emitted in `tx`.
    fn nft_transfer_log(f: &Fixture, tx: B256) -> Log {
        let abis = AbiCatalog::builtin().unwrap();
        let topic = abis.topic_for("erc721", "Transfer").unwrap();
        let mut nft = crate::test_support::sample_contract("0x0000000000000000000000000000000000000721");
        nft.abi_key = "erc721".to_string();
        nft.events = vec![crate::registry::types::EventTopic {
            name: "Transfer".to_string(),
            topic,
        }];
        f.gateway.registry.register_bep20_token(nft.clone());
        make_log(
            nft.address().unwrap(),
            vec![
                topic,
                Address::repeat_byte(0x01).into_word(),
                Address::repeat_byte(0x02).into_word(),
                B256::with_last_byte(7),
            ],
            vec![],
            tx,
        )
    }

    #[tokio::test]
    async fn test_suppressed_transfer_leaves_sibling_event() {
        let proxy = Address::from_str(PROXY_CONTRACT).unwrap();
        let f = fixture(GatewayOptions {
            proxy_address: Some(proxy),
            parallel_limit: 10,
            ..Default::default()
        });
        f.rpc.set_latency(Duration::from_millis(10));
        let tx = B256::repeat_byte(0x06);
        f.rpc.set_transaction_to(tx, proxy);
        let transfer = nft_transfer_log(&f, tx);
        let admin = set_admin_log(&f.contract, tx, Address::repeat_byte(0x66), 990);

        let contracts = f.gateway.watched_contracts();
        let outcome = f
            .gateway
            .process_logs(vec![transfer, admin], &contracts)
            .await
            .unwrap();
        assert_eq!(outcome.dispatched, 1);
        let jobs = f.queue.snapshot();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].payload.event_type, "SetSaleAdminEvent");
    }

    #[tokio::test]
    async fn test_failed_enqueue_leaves_range_retryable() {
        let f = fixture(GatewayOptions::default());
        let tx = B256::repeat_byte(0x07);
        f.rpc.add_log(set_admin_log(&f.contract, tx, Address::repeat_byte(0x77), 990));

        f.queue.fail_adds(true);
        assert!(f.gateway.get_multi_blocks_transactions(980, 995).await.is_err());
        assert!(f.store.all().is_empty());
        assert_eq!(f.queue.len(), 0);

        f.queue.fail_adds(false);
        let outcome = f.gateway.get_multi_blocks_transactions(980, 995).await.unwrap();
        assert_eq!(outcome.dispatched, 1);
        assert_eq!(f.store.all().len(), 1);
        assert_eq!(f.queue.snapshot()[0].record_id, f.store.all()[0].id);
    }

    #[tokio::test]
    async fn test_transfer_through_proxy_suppressed() {
        let proxy = address!("0x00000000000000000000000000000000000000ee");
        let f = fixture(GatewayOptions {
            proxy_address: Some(proxy),
            ..Default::default()
        });
        let tx = B256::repeat_byte(0x04);
        let log = nft_transfer_log(&f, tx);
        f.rpc.set_transaction_to(tx, proxy);
        let contracts = f.gateway.watched_contracts();
        let outcome = f.gateway.process_logs(vec![log.clone()], &contracts).await.unwrap();
        assert_eq!(outcome.dispatched, 0);

        f.rpc.set_transaction_to(tx, Address::repeat_byte(0x77));
        f.gateway.tx_cache.lock().unwrap().insert(
            tx,
            TxDetails {
                hash: tx,
                from: Address::repeat_byte(0x01),
                to: Some(Address::repeat_byte(0x77)),
                block_number: Some(990),
            },
        );
        let outcome = f.gateway.process_logs(vec![log], &contracts).await.unwrap();
        assert_eq!(outcome.dispatched, 1);
    }

    #[tokio::test]
    async fn test_exhausted_rpc_is_an_error() {
        let f = fixture(GatewayOptions::default());
        f.rpc.fail_logs(true);
        assert!(f.gateway.get_multi_blocks_transactions(980, 995).await.is_err());
    }

    #[tokio::test]
    async fn test_transaction_status() {
        let f = fixture(GatewayOptions::default());
        let tx = B256::repeat_byte(0x05);
        assert_eq!(f.gateway.get_transaction_status(tx).await, TransactionStatus::Unknown);
        f.rpc.set_receipt(
            tx,
            ReceiptInfo {
                success: true,
                block_number: Some(990),
            },
        );
        assert_eq!(f.gateway.get_transaction_status(tx).await, TransactionStatus::Completed);
    }

    #[tokio::test]
    async fn test_token_info_invalid_address() {
        let f = fixture(GatewayOptions::default());
        assert!(f.gateway.get_erc20_token_info("nope").await.is_none());
        let info = f
            .gateway
            .get_erc20_token_info("0x0000000000000000000000000000000000000abc")
            .await
            .unwrap();
        assert_eq!(info.decimals, 18);
    }
}
