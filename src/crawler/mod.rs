use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::callbacks::{CrawlerHooks, CrawlerInfo};
use crate::config::ChainConfig;
use crate::gateway::types::BatchOutcome;
use crate::registry::types::Currency;
use crate::registry::{CurrencyRegistry, GatewayRegistry};
use crate::worker::interval::{IntervalTask, DEFAULT_NEXT_TICK, DEFAULT_PROCESSING_TIMEOUT};

pub const CRAWL_TYPE_DEPOSIT: &str = "deposit";

/// Blocks kept back from the head when a batch would overshoot it.
const HEAD_SAFETY_MARGIN: u64 = 5;

/// Block-range access a crawler needs from its chain.
#[async_trait]
pub trait PlatformStrategy: Send + Sync {
    async fn latest_block(&self) -> Option<u64>;

    async fn process_range(&self, from_block: u64, to_block: u64) -> eyre::Result<BatchOutcome>;
}

/// Resolves the currency's gateway from the registry on every call.
pub struct GatewayStrategy {
    gateways: Arc<GatewayRegistry>,
    symbol: String,
}

impl GatewayStrategy {
    pub fn new(gateways: Arc<GatewayRegistry>, symbol: impl Into<String>) -> Self {
        Self {
            gateways,
            symbol: symbol.into(),
        }
    }
}

#[async_trait]
impl PlatformStrategy for GatewayStrategy {
    async fn latest_block(&self) -> Option<u64> {
        match self.gateways.get_gateway(&self.symbol) {
            Ok(gateway) => gateway.get_block_count().await,
            Err(e) => {
                tracing::error!(currency = %self.symbol, error = %e, "Gateway unavailable");
                None
            }
        }
    }

    async fn process_range(&self, from_block: u64, to_block: u64) -> eyre::Result<BatchOutcome> {
        self.gateways
            .get_gateway(&self.symbol)?
            .get_multi_blocks_transactions(from_block, to_block)
            .await
    }
}

#[derive(Debug, Clone)]
pub struct CrawlerSettings {
    pub block_batch_size: u64,
    /// Start block used when nothing is known in memory.
    pub force_crawl_block: Option<u64>,
    /// Tick delay while behind the confirmed head.
    pub catch_up_interval: Duration,
    pub processing_timeout: Duration,
}

impl Default for CrawlerSettings {
    fn default() -> Self {
        Self {
            block_batch_size: 100,
            force_crawl_block: None,
            catch_up_interval: Duration::from_millis(1000),
            processing_timeout: DEFAULT_PROCESSING_TIMEOUT,
        }
    }
}

impl CrawlerSettings {
    /// Settings for a configured chain. `FORCE_CRAWL_BLOCK` overrides the file value.
    pub fn from_chain(chain: &ChainConfig) -> Self {
        let force_crawl_block = std::env::var("FORCE_CRAWL_BLOCK")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .or(chain.force_crawl_block);
        Self {
            block_batch_size: chain.block_batch_size.max(1),
            force_crawl_block,
            catch_up_interval: Duration::from_millis(1000),
            processing_timeout: Duration::from_millis(chain.processing_timeout_ms),
        }
    }
}

/// In-memory progress. Lost on restart and re-derived from the hooks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlerState {
    pub last_safe_block: Option<u64>,
    pub last_processed_at: Option<Instant>,
    pub last_announced: Option<u64>,
}

/// Inclusive range to crawl, or `None` when `from` is past the head.
///
/// The batch end never passes `latest`; when it would, it is pulled back to
/// a few blocks below the head, but never below `from`.
pub fn plan_range(from: u64, latest: u64, batch_size: u64) -> Option<(u64, u64)> {
    if from > latest {
        return None;
    }
    let mut to = from.saturating_add(batch_size);
    if to >= latest {
        to = latest.saturating_sub(HEAD_SAFETY_MARGIN).max(from);
    }
    Some((from, to))
}

/// Highest block with the required confirmations, capped at the crawled range.
pub fn safe_block(to_block: u64, latest: u64, required_confirmations: u64) -> u64 {
    to_block.min(latest.saturating_sub(required_confirmations))
}

/// Walks one platform's chain forward in confirmation-safe batches.
pub struct Crawler {
    info: CrawlerInfo,
    currency: Currency,
    registry: Arc<CurrencyRegistry>,
    strategy: Arc<dyn PlatformStrategy>,
    hooks: Arc<dyn CrawlerHooks>,
    settings: CrawlerSettings,
    state: CrawlerState,
    next_tick: Duration,
}

impl Crawler {
    pub fn new(
        currency: Currency,
        registry: Arc<CurrencyRegistry>,
        strategy: Arc<dyn PlatformStrategy>,
        hooks: Arc<dyn CrawlerHooks>,
        settings: CrawlerSettings,
    ) -> Self {
        let info = CrawlerInfo {
            id: format!("{:08x}", rand::random::<u32>()),
            currency: currency.key(),
            crawl_type: CRAWL_TYPE_DEPOSIT,
        };
        Self {
            info,
            currency,
            registry,
            strategy,
            hooks,
            settings,
            state: CrawlerState::default(),
            next_tick: DEFAULT_NEXT_TICK,
        }
    }

    pub fn info(&self) -> &CrawlerInfo {
        &self.info
    }

    pub fn state(&self) -> &CrawlerState {
        &self.state
    }

    async fn resolve_from_block(&self, latest: u64) -> eyre::Result<u64> {
        if let Some(block) = self.state.last_safe_block {
            return Ok(block);
        }
        if let Some(block) = self.settings.force_crawl_block {
            tracing::info!(crawler = %self.info.id, block, "Starting from forced block");
            return Ok(block);
        }
        if let Some(block) = self.hooks.latest_crawled_block(&self.info).await? {
            if block > 0 {
                return Ok(block);
            }
        }
        Ok(latest.saturating_sub(1))
    }

    /// One crawl step. Leaves the checkpoint untouched on any failure.
    pub async fn tick(&mut self) -> eyre::Result<()> {
        let config = self.registry.get_currency_config(&self.currency)?;
        let average_block_time = Duration::from_millis(config.average_block_time);

        let latest = self.strategy.latest_block().await.ok_or_else(|| {
            eyre::eyre!("Could not get latest block number for {}", self.currency.symbol)
        })?;

        let from = self.resolve_from_block(latest).await?;
        let Some((from, to)) = plan_range(from, latest, self.settings.block_batch_size) else {
            tracing::debug!(
                crawler = %self.info.id,
                currency = %self.info.currency,
                from,
                latest,
                "Caught up, waiting for new blocks"
            );
            self.next_tick = average_block_time;
            return Ok(());
        };

        tracing::info!(
            crawler = %self.info.id,
            currency = %self.info.currency,
            from,
            to,
            latest,
            "Crawling block range"
        );

        let outcome = self
            .strategy
            .process_range(from.saturating_sub(1), to)
            .await?;

        let safe = safe_block(to, latest, config.required_confirmations);
        if self.state.last_announced.map_or(true, |announced| to >= announced) {
            self.hooks.on_block_crawled(&self.info, to).await?;
            self.state.last_announced = Some(to);
        }
        self.state.last_safe_block = Some(safe);
        self.state.last_processed_at = Some(Instant::now());

        let confirmed_head = latest.saturating_sub(config.required_confirmations) + 1;
        self.next_tick = if to >= confirmed_head {
            average_block_time
        } else {
            self.settings.catch_up_interval
        };

        tracing::info!(
            crawler = %self.info.id,
            currency = %self.info.currency,
            to,
            safe_block = safe,
            logs = outcome.logs,
            dispatched = outcome.dispatched,
            next_tick_ms = self.next_tick.as_millis() as u64,
            "Block range crawled"
        );
        Ok(())
    }
}

#[async_trait]
impl IntervalTask for Crawler {
    fn name(&self) -> String {
        format!("{}-crawler-{}", self.info.currency, self.info.id)
    }

    async fn prepare(&mut self) -> eyre::Result<()> {
        let config = self.registry.get_currency_config(&self.currency)?;
        self.next_tick = Duration::from_millis(config.average_block_time);
        tracing::info!(
            crawler = %self.info.id,
            currency = %self.info.currency,
            chain = %config.chain_name,
            batch = self.settings.block_batch_size,
            confirmations = config.required_confirmations,
            "Crawler prepared"
        );
        Ok(())
    }

    async fn do_process(&mut self) -> eyre::Result<()> {
        self.tick().await
    }

    fn next_tick(&self) -> Duration {
        self.next_tick
    }

    fn processing_timeout(&self) -> Duration {
        self.settings.processing_timeout
    }
}
