pub mod repository;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Waiting,
    Completed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(Self::Waiting),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Durable record of one dispatched event.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatusRecord {
    pub id: i64,
    pub status: JobStatus,
    pub contract_address: String,
    pub transaction: String,
    pub data: Value,
    pub chain_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewJobStatus {
    pub contract_address: String,
    pub transaction: String,
    pub data: Value,
    pub chain_name: String,
}

/// Job-status persistence used for dedup and completion tracking.
#[async_trait]
pub trait JobStatusStore: Send + Sync {
    async fn exists_for_transaction(&self, chain_name: &str, transaction: &str) -> eyre::Result<bool>;

    /// Insert a `waiting` record. Returns `None` when one already exists for the transaction.
    async fn insert_waiting(&self, record: NewJobStatus) -> eyre::Result<Option<i64>>;

    async fn mark_completed(&self, id: i64) -> eyre::Result<()>;

    /// Delete a record whose job never reached the queue.
    async fn remove(&self, id: i64) -> eyre::Result<()>;

    async fn find_by_id(&self, id: i64) -> eyre::Result<Option<JobStatusRecord>>;
}

pub struct PgJobStatusStore {
    pool: PgPool,
}

impl PgJobStatusStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStatusStore for PgJobStatusStore {
    async fn exists_for_transaction(&self, chain_name: &str, transaction: &str) -> eyre::Result<bool> {
        repository::job_status_exists(&self.pool, chain_name, transaction).await
    }

    async fn insert_waiting(&self, record: NewJobStatus) -> eyre::Result<Option<i64>> {
        repository::insert_job_status(&self.pool, &record).await
    }

    async fn mark_completed(&self, id: i64) -> eyre::Result<()> {
        repository::mark_job_status_completed(&self.pool, id).await
    }

    async fn remove(&self, id: i64) -> eyre::Result<()> {
        repository::delete_job_status(&self.pool, id).await
    }

    async fn find_by_id(&self, id: i64) -> eyre::Result<Option<JobStatusRecord>> {
        repository::find_job_status(&self.pool, id).await
    }
}
