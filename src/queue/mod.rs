pub mod backend;
pub mod webhook;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::QueueConfig;
use crate::db::JobStatusStore;
use backend::{NewJob, QueueBackend, QueueJob};
use webhook::{is_success, WebhookSink};

/// Webhook body for one decoded event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub time_stamp: DateTime<Utc>,
    pub hash: String,
    pub from: String,
    pub to: Option<String>,
    pub contract_address: String,
    pub event_type: String,
    pub chain_id: u64,
    pub data: Value,
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Jobs processed per `limiter_duration`.
    pub limiter_max: u32,
    pub limiter_duration: Duration,
    /// Attempts per entry before it is abandoned.
    pub attempts: u32,
    pub backoff_delay: Duration,
    pub max_backoff: Duration,
    /// Sleep when the queue has nothing ready.
    pub poll_interval: Duration,
    /// How long abandoned entries are kept before they are pruned.
    pub failed_retention: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            limiter_max: 1,
            limiter_duration: Duration::from_millis(1000),
            attempts: 100,
            backoff_delay: Duration::from_millis(1000),
            max_backoff: Duration::from_secs(3600),
            poll_interval: Duration::from_millis(1000),
            failed_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl From<&QueueConfig> for QueueOptions {
    fn from(c: &QueueConfig) -> Self {
        Self {
            limiter_max: c.limiter_max.max(1),
            limiter_duration: Duration::from_millis(c.limiter_duration_ms),
            attempts: c.attempts.max(1),
            backoff_delay: Duration::from_millis(c.backoff_delay_ms),
            max_backoff: Duration::from_millis(c.max_backoff_ms),
            poll_interval: Duration::from_millis(c.poll_interval_ms),
            failed_retention: Duration::from_secs(c.failed_retention_secs),
        }
    }
}

impl QueueOptions {
    /// Exponential backoff for a 0-indexed attempt, capped at `max_backoff`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let secs = self.backoff_delay.as_secs_f64() * 2f64.powi(attempt.min(63) as i32);
        Duration::from_secs_f64(secs.min(self.max_backoff.as_secs_f64()))
    }

    fn limiter_period(&self) -> Duration {
        self.limiter_duration / self.limiter_max.max(1)
    }
}

const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

/// What happened to a reserved entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Delivered,
    /// Re-added ahead of the backlog with one more attempt spent.
    Requeued,
    /// Out of attempts; the entry stays `failed`.
    Abandoned,
}

/// Rate-limited consumer that delivers queued events to one webhook.
///
/// A non-2xx delivery is requeued as a fresh entry ahead of the backlog, with
/// its attempt count carried over, and the original entry is completed. Once
/// `max_attempts` deliveries have failed the entry is abandoned instead.
/// Errors while processing an entry go through the backend's attempt/backoff
/// path.
pub struct JobQueue {
    name: String,
    webhook_url: String,
    backend: Arc<dyn QueueBackend>,
    sink: Arc<dyn WebhookSink>,
    job_store: Arc<dyn JobStatusStore>,
    options: QueueOptions,
}

impl JobQueue {
    pub fn new(
        name: impl Into<String>,
        webhook_url: impl Into<String>,
        backend: Arc<dyn QueueBackend>,
        sink: Arc<dyn WebhookSink>,
        job_store: Arc<dyn JobStatusStore>,
        options: QueueOptions,
    ) -> Self {
        Self {
            name: name.into(),
            webhook_url: webhook_url.into(),
            backend,
            sink,
            job_store,
            options,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Consume until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> eyre::Result<()> {
        let recovered = self.backend.recover_stalled(&self.name).await?;
        if recovered > 0 {
            tracing::warn!(queue = %self.name, recovered, "Returned stalled jobs to waiting");
        }
        tracing::info!(queue = %self.name, webhook = %self.webhook_url, "Queue worker started");

        let mut last_prune: Option<Instant> = None;
        let mut limiter = tokio::time::interval(self.options.limiter_period());
        limiter.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = limiter.tick() => {}
            }

            if last_prune.map_or(true, |at| at.elapsed() >= PRUNE_INTERVAL) {
                if let Err(e) = self.prune_failed().await {
                    tracing::warn!(queue = %self.name, error = %e, "Pruning failed jobs failed");
                }
                last_prune = Some(Instant::now());
            }

            let idle = match self.run_once().await {
                Ok(processed) => !processed,
                Err(e) => {
                    tracing::error!(queue = %self.name, error = %e, "Queue poll failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.options.poll_interval) => {}
                }
            }
        }

        tracing::info!(queue = %self.name, "Queue worker stopped");
        Ok(())
    }

    /// Reserve and handle one entry. Returns false when nothing was ready.
    pub async fn run_once(&self) -> eyre::Result<bool> {
        let Some(job) = self.backend.reserve(&self.name).await? else {
            return Ok(false);
        };

        match self.process(&job).await {
            Ok(Delivery::Delivered | Delivery::Requeued) => self.backend.complete(job.id).await?,
            Ok(Delivery::Abandoned) => {
                self.backend
                    .fail(job.id, "webhook delivery failed", None)
                    .await?
            }
            Err(e) => {
                let error = format!("{:#}", e);
                if job.attempts + 1 >= job.max_attempts {
                    tracing::error!(
                        queue = %self.name,
                        job_id = job.id,
                        record_id = job.record_id,
                        attempts = job.attempts + 1,
                        error = %error,
                        "Job abandoned after max attempts"
                    );
                    self.backend.fail(job.id, &error, None).await?;
                } else {
                    let delay = self.options.backoff_for_attempt(job.attempts);
                    let retry_at = Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::seconds(60));
                    tracing::warn!(
                        queue = %self.name,
                        job_id = job.id,
                        attempt = job.attempts + 1,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %error,
                        "Job failed, scheduling retry"
                    );
                    self.backend.fail(job.id, &error, Some(retry_at)).await?;
                }
            }
        }
        Ok(true)
    }

    /// Delete abandoned entries older than the retention window.
    pub async fn prune_failed(&self) -> eyre::Result<u64> {
        let retention = chrono::Duration::from_std(self.options.failed_retention)
            .unwrap_or(chrono::Duration::days(7));
        let pruned = self
            .backend
            .prune_failed(&self.name, Utc::now() - retention)
            .await?;
        if pruned > 0 {
            tracing::info!(queue = %self.name, pruned, "Pruned abandoned jobs");
        }
        Ok(pruned)
    }

    async fn process(&self, job: &QueueJob) -> eyre::Result<Delivery> {
        let counts = self.backend.counts(&self.name).await?;
        if counts.total() == 0 {
            tracing::debug!(queue = %self.name, job_id = job.id, "Queue empty, nothing to deliver");
            return Ok(Delivery::Delivered);
        }

        let status = self.sink.deliver(&self.webhook_url, &job.payload).await;
        if is_success(status) {
            self.job_store.mark_completed(job.record_id).await?;
            tracing::info!(
                queue = %self.name,
                record_id = job.record_id,
                tx = %job.payload.hash,
                event = %job.payload.event_type,
                "Webhook delivered"
            );
            return Ok(Delivery::Delivered);
        }

        let attempts = job.attempts + 1;
        if attempts >= job.max_attempts {
            tracing::error!(
                queue = %self.name,
                record_id = job.record_id,
                tx = %job.payload.hash,
                status = ?status,
                attempts,
                "Webhook delivery abandoned after max attempts"
            );
            return Ok(Delivery::Abandoned);
        }

        let priority = (counts.total() as i64 + 1).max(job.priority + 1);
        let requeued = self
            .backend
            .add(
                &self.name,
                NewJob {
                    record_id: job.record_id,
                    payload: job.payload.clone(),
                    priority,
                    attempts,
                    max_attempts: job.max_attempts,
                },
            )
            .await?;
        tracing::warn!(
            queue = %self.name,
            record_id = job.record_id,
            tx = %job.payload.hash,
            status = ?status,
            requeued_job = requeued,
            priority,
            attempts,
            "Webhook delivery failed, requeued"
        );
        Ok(Delivery::Requeued)
    }
}
