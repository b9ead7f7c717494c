/// Worker Pool - claim, judge, write back
///
/// **Core Responsibility:**
/// Run `worker_count` independent loops that each claim the oldest queued
/// submission, judge it under the submission budget and write exactly one
/// terminal state, plus one sweeper loop that reclaims stranded claims.
///
/// **Critical Properties:**
/// - The judge runs in its own task, so a panic becomes a retryable fault
///   instead of killing the loop
/// - Faults go through `release_for_retry` (bounded retries), budget
///   exhaustion becomes `timeout`, a lost claim writes nothing
/// - Shutdown stops claiming; a submission already claimed is finished

use crate::executor::{ClaimLost, SubmissionJudge};
use crate::metrics;
use anyhow::Result;
use arbiter_common::store::{RetryDecision, SubmissionStore};
use arbiter_common::types::{Submission, SubmissionStatus, Verdict, WorkerHeartbeat};
use chrono::Utc;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Heartbeats older than this many staleness windows belong to departed workers
const HEARTBEAT_RETENTION_WINDOWS: i32 = 4;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Prefix for worker ids; loop `n` is `{prefix}-{n}`
    pub worker_prefix: String,
    pub worker_count: usize,
    pub poll_interval: Duration,
    pub submission_budget: Duration,
    pub sweep_interval: Duration,
    pub stale_after: Duration,
    pub max_retries: u32,
}

pub struct WorkerPool {
    store: Arc<dyn SubmissionStore>,
    judge: Arc<dyn SubmissionJudge>,
    config: PoolConfig,
}

/// What happened to one claimed submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Finished(SubmissionStatus),
    Retried(RetryDecision),
    ClaimLost,
}

impl WorkerPool {
    pub fn new(store: Arc<dyn SubmissionStore>, judge: Arc<dyn SubmissionJudge>, config: PoolConfig) -> Self {
        Self { store, judge, config }
    }

    pub fn worker_ids(&self) -> Vec<String> {
        (0..self.config.worker_count)
            .map(|n| format!("{}-{}", self.config.worker_prefix, n))
            .collect()
    }

    /// Run every loop until `shutdown` flips to true.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let pool = Arc::new(self);
        let mut tasks = Vec::new();

        for worker_id in pool.worker_ids() {
            let pool = pool.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move { pool.worker_loop(worker_id, shutdown).await }));
        }
        {
            let pool = pool.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move { pool.sweeper_loop(shutdown).await }));
        }

        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!(error = %e, "Pool task terminated abnormally");
            }
        }
        info!("Worker pool stopped");
    }

    async fn heartbeat(&self, worker_id: &str, processed: u64, current: Option<Uuid>) {
        let heartbeat = WorkerHeartbeat {
            worker_id: worker_id.to_string(),
            last_seen: Utc::now(),
            processed,
            current_submission: current,
        };
        if let Err(e) = self.store.record_heartbeat(&heartbeat).await {
            warn!(worker_id, error = %e, "Failed to record worker heartbeat");
        }
    }

    #[instrument(skip(self, shutdown), fields(worker_id = %worker_id))]
    async fn worker_loop(&self, worker_id: String, mut shutdown: watch::Receiver<bool>) {
        info!("Worker loop started");
        let mut processed = 0u64;

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.heartbeat(&worker_id, processed, None).await;

            match self.store.claim_next(&worker_id).await {
                Ok(Some(submission)) => {
                    self.heartbeat(&worker_id, processed, Some(submission.id)).await;
                    self.process(&worker_id, submission).await;
                    processed += 1;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to claim from queue");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }

        self.heartbeat(&worker_id, processed, None).await;
        info!(processed, "Worker loop stopped");
    }

    /// Judge one claimed submission and write its outcome.
    #[instrument(
        skip(self, submission),
        fields(submission_id = %submission.id, language = %submission.language, status = tracing::field::Empty)
    )]
    async fn process(&self, worker_id: &str, submission: Submission) -> Disposition {
        let id = submission.id;
        info!(
            challenge_id = %submission.challenge_id,
            mode = %submission.mode,
            retry_count = submission.retry_count,
            code_size = submission.code.len(),
            "Claimed submission"
        );

        let handle = {
            let judge = self.judge.clone();
            let worker_id = worker_id.to_string();
            tokio::spawn(async move { judge.judge(&submission, &worker_id).await })
        };
        let abort = handle.abort_handle();

        let disposition = match tokio::time::timeout(self.config.submission_budget, handle).await {
            Ok(Ok(Ok(verdict))) => self.finish(id, worker_id, verdict).await,
            Ok(Ok(Err(e))) if e.downcast_ref::<ClaimLost>().is_some() => {
                warn!("Claim lost, dropping result");
                Disposition::ClaimLost
            }
            Ok(Ok(Err(e))) => {
                error!(error = %format!("{:#}", e), "Judging failed");
                self.release(id, worker_id, &format!("{:#}", e)).await
            }
            Ok(Err(join_error)) => {
                error!(error = %join_error, "Judge task panicked");
                self.release(id, worker_id, "judge task panicked").await
            }
            Err(_) => {
                abort.abort();
                let budget_ms = self.config.submission_budget.as_millis();
                warn!(budget_ms = budget_ms as u64, "Submission budget exhausted");
                self.finish(id, worker_id, Verdict::timed_out(format!("Judging exceeded {}ms", budget_ms)))
                    .await
            }
        };

        let label = match disposition {
            Disposition::Finished(status) => status.as_str(),
            Disposition::Retried(RetryDecision::Requeued) => "requeued",
            Disposition::Retried(RetryDecision::Failed) => "failed",
            Disposition::Retried(RetryDecision::NotClaimed) | Disposition::ClaimLost => "claim_lost",
        };
        tracing::Span::current().record("status", label);
        metrics::SUBMISSIONS_JUDGED.with_label_values(&[label]).inc();
        disposition
    }

    async fn finish(&self, id: Uuid, worker_id: &str, verdict: Verdict) -> Disposition {
        let status = verdict.status;
        match self.store.finish(id, worker_id, &verdict).await {
            Ok(true) => {
                info!(status = %status, score = ?verdict.score, "Result persisted");
                Disposition::Finished(status)
            }
            Ok(false) => {
                warn!("Terminal write refused, claim no longer held");
                Disposition::ClaimLost
            }
            Err(e) => {
                // Leave the row running; the sweep will requeue it
                error!(error = %e, "Failed to persist result");
                Disposition::Retried(RetryDecision::NotClaimed)
            }
        }
    }

    async fn release(&self, id: Uuid, worker_id: &str, message: &str) -> Disposition {
        match self
            .store
            .release_for_retry(id, worker_id, message, self.config.max_retries)
            .await
        {
            Ok(decision) => {
                info!(decision = ?decision, "Released submission after fault");
                Disposition::Retried(decision)
            }
            Err(e) => {
                error!(error = %e, "Failed to release submission");
                Disposition::Retried(RetryDecision::NotClaimed)
            }
        }
    }

    /// One staleness sweep, heartbeat pruning and a queue depth refresh.
    async fn sweep(&self) -> Result<usize> {
        let now = Utc::now();
        let stale_after = chrono::Duration::from_std(self.config.stale_after)?;
        let swept = self.store.requeue_stale(now - stale_after, self.config.max_retries).await?;
        for entry in &swept {
            warn!(submission_id = %entry.id, status = %entry.status, "Reclaimed stale submission");
        }
        metrics::STALE_REQUEUES.inc_by(swept.len() as u64);

        let pruned = self
            .store
            .prune_workers(now - stale_after * HEARTBEAT_RETENTION_WINDOWS)
            .await?;
        if pruned > 0 {
            info!(pruned, "Pruned heartbeats of departed workers");
        }

        let depth = self.store.queue_depth().await?;
        metrics::QUEUE_DEPTH.set(depth as i64);
        debug!(queue_depth = depth, "Sweep complete");
        Ok(swept.len())
    }

    #[instrument(skip_all)]
    async fn sweeper_loop(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.sweep_interval) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.sweep().await {
                error!(error = %e, "Staleness sweep failed");
            }
        }
    }
}
