use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::db::repository;
use crate::queue::EventPayload;

/// A payload waiting to be queued. A requeued payload carries the attempts
/// already spent on it.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub record_id: i64,
    pub payload: EventPayload,
    pub priority: i64,
    pub attempts: u32,
    pub max_attempts: u32,
}

/// A reserved queue entry.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueJob {
    pub id: i64,
    pub queue: String,
    pub record_id: i64,
    pub payload: EventPayload,
    pub priority: i64,
    pub attempts: u32,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub failed: u64,
}

impl QueueCounts {
    pub fn total(&self) -> u64 {
        self.waiting + self.active + self.delayed + self.failed
    }
}

/// Durable queue storage.
///
/// `reserve` hands out the ready entry with the highest priority, oldest first
/// within a priority, and marks it active. Completed entries are removed.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn add(&self, queue: &str, job: NewJob) -> eyre::Result<i64>;

    async fn reserve(&self, queue: &str) -> eyre::Result<Option<QueueJob>>;

    async fn complete(&self, job_id: i64) -> eyre::Result<()>;

    /// Record a failed attempt. `retry_at = None` abandons the entry.
    async fn fail(&self, job_id: i64, error: &str, retry_at: Option<DateTime<Utc>>) -> eyre::Result<()>;

    async fn counts(&self, queue: &str) -> eyre::Result<QueueCounts>;

    /// Return entries left active by a dead consumer to waiting.
    async fn recover_stalled(&self, queue: &str) -> eyre::Result<u64>;

    /// Delete abandoned entries last touched before `older_than`.
    async fn prune_failed(&self, queue: &str, older_than: DateTime<Utc>) -> eyre::Result<u64>;
}

pub struct PgQueueBackend {
    pool: PgPool,
}

impl PgQueueBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueueBackend for PgQueueBackend {
    async fn add(&self, queue: &str, job: NewJob) -> eyre::Result<i64> {
        repository::enqueue_job(&self.pool, queue, &job).await
    }

    async fn reserve(&self, queue: &str) -> eyre::Result<Option<QueueJob>> {
        repository::reserve_job(&self.pool, queue).await
    }

    async fn complete(&self, job_id: i64) -> eyre::Result<()> {
        repository::delete_job(&self.pool, job_id).await
    }

    async fn fail(&self, job_id: i64, error: &str, retry_at: Option<DateTime<Utc>>) -> eyre::Result<()> {
        repository::fail_job(&self.pool, job_id, error, retry_at).await
    }

    async fn counts(&self, queue: &str) -> eyre::Result<QueueCounts> {
        repository::queue_counts(&self.pool, queue).await
    }

    async fn recover_stalled(&self, queue: &str) -> eyre::Result<u64> {
        repository::recover_stalled_jobs(&self.pool, queue).await
    }

    async fn prune_failed(&self, queue: &str, older_than: DateTime<Utc>) -> eyre::Result<u64> {
        repository::prune_failed_jobs(&self.pool, queue, older_than).await
    }
}
