use async_trait::async_trait;
use sqlx::PgPool;

use crate::db::repository;

/// Identity of a crawler as seen by its checkpoint hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlerInfo {
    pub id: String,
    pub currency: String,
    pub crawl_type: &'static str,
}

/// External checkpoint storage for crawlers.
#[async_trait]
pub trait CrawlerHooks: Send + Sync {
    async fn latest_crawled_block(&self, crawler: &CrawlerInfo) -> eyre::Result<Option<u64>>;

    async fn on_block_crawled(&self, crawler: &CrawlerInfo, block_number: u64) -> eyre::Result<()>;
}

/// Checkpoints kept in the `latest_block` table.
pub struct PgCrawlerHooks {
    pool: PgPool,
}

impl PgCrawlerHooks {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CrawlerHooks for PgCrawlerHooks {
    async fn latest_crawled_block(&self, crawler: &CrawlerInfo) -> eyre::Result<Option<u64>> {
        repository::get_latest_block(&self.pool, &crawler.currency, crawler.crawl_type).await
    }

    async fn on_block_crawled(&self, crawler: &CrawlerInfo, block_number: u64) -> eyre::Result<()> {
        repository::upsert_latest_block(&self.pool, &crawler.currency, crawler.crawl_type, block_number)
            .await?;
        tracing::debug!(
            crawler = %crawler.id,
            currency = %crawler.currency,
            block = block_number,
            "Checkpoint saved"
        );
        Ok(())
    }
}
