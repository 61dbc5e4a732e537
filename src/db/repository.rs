use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgPool;

use crate::config::parse_rpc_urls;
use crate::db::{JobStatus, JobStatusRecord, NewJobStatus};
use crate::queue::backend::{NewJob, QueueCounts, QueueJob};
use crate::queue::EventPayload;
use crate::registry::types::{normalize_address, ContractRegistration, CurrencyConfigPatch, EventTopic};

// ============================================================
// Job status
// ============================================================

pub async fn job_status_exists(
    pool: &PgPool,
    chain_name: &str,
    transaction: &str,
) -> eyre::Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT id FROM job_status WHERE chain_name = $1 AND transaction = $2 LIMIT 1",
    )
    .bind(chain_name)
    .bind(transaction)
    .fetch_optional(pool)
    .await?;

    Ok(row.is_some())
}

/// Insert a waiting record; `None` if the transaction was already recorded for this chain.
pub async fn insert_job_status(pool: &PgPool, record: &NewJobStatus) -> eyre::Result<Option<i64>> {
    let row: Option<(i64,)> = sqlx::query_as(
        "INSERT INTO job_status (status, contract_address, transaction, data, chain_name)
         VALUES ($1, $2, $3, $4, $5)
         ON CONFLICT (chain_name, transaction) DO NOTHING
         RETURNING id",
    )
    .bind(JobStatus::Waiting.as_str())
    .bind(&record.contract_address)
    .bind(&record.transaction)
    .bind(Json(&record.data))
    .bind(&record.chain_name)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(id,)| id))
}

pub async fn mark_job_status_completed(pool: &PgPool, id: i64) -> eyre::Result<()> {
    sqlx::query("UPDATE job_status SET status = $2, updated_at = NOW() WHERE id = $1")
        .bind(id)
        .bind(JobStatus::Completed.as_str())
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn delete_job_status(pool: &PgPool, id: i64) -> eyre::Result<()> {
    sqlx::query("DELETE FROM job_status WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn find_job_status(pool: &PgPool, id: i64) -> eyre::Result<Option<JobStatusRecord>> {
    let row: Option<(i64, String, String, String, Json<Value>, String)> = sqlx::query_as(
        "SELECT id, status, contract_address, transaction, data, chain_name
         FROM job_status WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(|(id, status, contract_address, transaction, data, chain_name)| {
        let status = JobStatus::parse(&status)
            .ok_or_else(|| eyre::eyre!("Unknown job status '{}' for record {}", status, id))?;
        Ok(JobStatusRecord {
            id,
            status,
            contract_address,
            transaction,
            data: data.0,
            chain_name,
        })
    })
    .transpose()
}

// ============================================================
// Crawl checkpoints
// ============================================================

pub async fn get_latest_block(
    pool: &PgPool,
    currency: &str,
    crawl_type: &str,
) -> eyre::Result<Option<u64>> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT block_number FROM latest_block WHERE currency = $1 AND type = $2",
    )
    .bind(currency)
    .bind(crawl_type)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(b,)| b as u64))
}

pub async fn upsert_latest_block(
    pool: &PgPool,
    currency: &str,
    crawl_type: &str,
    block_number: u64,
) -> eyre::Result<()> {
    sqlx::query(
        "INSERT INTO latest_block (currency, type, block_number, updated_at)
         VALUES ($1, $2, $3, NOW())
         ON CONFLICT (currency, type) DO UPDATE
         SET block_number = $3, updated_at = NOW()",
    )
    .bind(currency)
    .bind(crawl_type)
    .bind(block_number as i64)
    .execute(pool)
    .await?;

    Ok(())
}

// ============================================================
// Currency config and token contracts
// ============================================================

type CurrencyConfigRow = (
    String,
    Option<String>,
    Option<i64>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<i64>,
    Option<i64>,
    Option<i64>,
    Option<String>,
    Option<String>,
    Option<String>,
);

/// Stored config overrides as `(currency symbol, patch)`. NULL columns inherit.
pub async fn load_currency_configs(pool: &PgPool) -> eyre::Result<Vec<(String, CurrencyConfigPatch)>> {
    let rows: Vec<CurrencyConfigRow> = sqlx::query_as(
        "SELECT currency, network, chain_id, chain_name, rpc_endpoint, rpc_endpoint_backups,
                required_confirmations, average_block_time, block_time, internal_endpoint,
                webhook_api, queue_name
         FROM currency_config ORDER BY updated_at ASC",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(
            |(
                currency,
                network,
                chain_id,
                chain_name,
                rpc_endpoint,
                backups,
                required_confirmations,
                average_block_time,
                block_time,
                internal_endpoint,
                webhook_api,
                queue_name,
            )| {
                let patch = CurrencyConfigPatch {
                    network,
                    chain_id: chain_id.map(|v| v as u64),
                    chain_name,
                    rpc_endpoint,
                    rpc_endpoint_backups: backups.map(|raw| parse_rpc_urls(&raw)),
                    required_confirmations: required_confirmations.map(|v| v as u64),
                    average_block_time: average_block_time.map(|v| v as u64),
                    block_time: block_time.map(|v| v as u64),
                    internal_endpoint,
                    webhook_api,
                    queue_name,
                };
                (currency, patch)
            },
        )
        .collect())
}

type TokenContractRow = (String, String, String, String, i16, String, Json<Vec<EventTopic>>);

fn token_from_row(row: TokenContractRow) -> (String, ContractRegistration) {
    let (contract_address, platform, symbol, name, decimals, abi_key, events) = row;
    (
        platform,
        ContractRegistration {
            contract_address: normalize_address(&contract_address),
            symbol,
            name,
            decimals: decimals.clamp(0, u8::MAX as i16) as u8,
            abi_key,
            events: events.0,
        },
    )
}

/// All stored contracts as `(platform id, registration)`.
pub async fn load_token_contracts(pool: &PgPool) -> eyre::Result<Vec<(String, ContractRegistration)>> {
    let rows: Vec<TokenContractRow> = sqlx::query_as(
        "SELECT contract_address, platform, symbol, name, decimals, abi_key, events
         FROM token_contract ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(token_from_row).collect())
}

/// Find a stored contract by address, in any case.
pub async fn find_token_contract(
    pool: &PgPool,
    contract_address: &str,
) -> eyre::Result<Option<(String, ContractRegistration)>> {
    let row: Option<TokenContractRow> = sqlx::query_as(
        "SELECT contract_address, platform, symbol, name, decimals, abi_key, events
         FROM token_contract WHERE LOWER(contract_address) = LOWER($1) LIMIT 1",
    )
    .bind(contract_address)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(token_from_row))
}

// ============================================================
// Queue
// ============================================================

pub async fn enqueue_job(pool: &PgPool, queue: &str, job: &NewJob) -> eyre::Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO queue_job (queue, record_id, payload, priority, attempts, max_attempts)
         VALUES ($1, $2, $3, $4, $5, $6)
         RETURNING id",
    )
    .bind(queue)
    .bind(job.record_id)
    .bind(Json(&job.payload))
    .bind(job.priority)
    .bind(job.attempts as i32)
    .bind(job.max_attempts as i32)
    .fetch_one(pool)
    .await?;

    Ok(id)
}

/// Claim the next ready entry: highest priority first, FIFO within a priority.
pub async fn reserve_job(pool: &PgPool, queue: &str) -> eyre::Result<Option<QueueJob>> {
    let row: Option<(i64, String, i64, Json<EventPayload>, i64, i32, i32)> = sqlx::query_as(
        "UPDATE queue_job SET status = 'active', updated_at = NOW()
         WHERE id = (
             SELECT id FROM queue_job
             WHERE queue = $1
               AND status IN ('waiting', 'delayed')
               AND run_after <= NOW()
             ORDER BY priority DESC, id ASC
             LIMIT 1
             FOR UPDATE SKIP LOCKED
         )
         RETURNING id, queue, record_id, payload, priority, attempts, max_attempts",
    )
    .bind(queue)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(
        |(id, queue, record_id, payload, priority, attempts, max_attempts)| QueueJob {
            id,
            queue,
            record_id,
            payload: payload.0,
            priority,
            attempts: attempts.max(0) as u32,
            max_attempts: max_attempts.max(0) as u32,
        },
    ))
}

pub async fn delete_job(pool: &PgPool, job_id: i64) -> eyre::Result<()> {
    sqlx::query("DELETE FROM queue_job WHERE id = $1")
        .bind(job_id)
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn fail_job(
    pool: &PgPool,
    job_id: i64,
    error: &str,
    retry_at: Option<DateTime<Utc>>,
) -> eyre::Result<()> {
    sqlx::query(
        "UPDATE queue_job
         SET attempts = attempts + 1,
             last_error = $2,
             status = CASE WHEN $3::timestamptz IS NULL THEN 'failed' ELSE 'delayed' END,
             run_after = COALESCE($3, run_after),
             updated_at = NOW()
         WHERE id = $1",
    )
    .bind(job_id)
    .bind(error)
    .bind(retry_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn queue_counts(pool: &PgPool, queue: &str) -> eyre::Result<QueueCounts> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) FROM queue_job WHERE queue = $1 GROUP BY status",
    )
    .bind(queue)
    .fetch_all(pool)
    .await?;

    let mut counts = QueueCounts::default();
    for (status, count) in rows {
        let count = count.max(0) as u64;
        match status.as_str() {
            "waiting" => counts.waiting = count,
            "active" => counts.active = count,
            "delayed" => counts.delayed = count,
            "failed" => counts.failed = count,
            other => tracing::warn!(queue, status = other, "Unknown queue job status"),
        }
    }
    Ok(counts)
}

pub async fn recover_stalled_jobs(pool: &PgPool, queue: &str) -> eyre::Result<u64> {
    let result = sqlx::query(
        "UPDATE queue_job SET status = 'waiting', updated_at = NOW()
         WHERE queue = $1 AND status = 'active'",
    )
    .bind(queue)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

pub async fn prune_failed_jobs(
    pool: &PgPool,
    queue: &str,
    older_than: DateTime<Utc>,
) -> eyre::Result<u64> {
    let result = sqlx::query(
        "DELETE FROM queue_job
         WHERE queue = $1 AND status = 'failed' AND updated_at < $2",
    )
    .bind(queue)
    .bind(older_than)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
