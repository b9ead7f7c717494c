/// Submission store - the queue and state machine behind every submission
///
/// **Core Responsibility:**
/// Persist submissions and move them through
/// `queued -> running -> {completed, failed, timeout}` with atomic
/// compare-and-set transitions.
///
/// **Critical Properties:**
/// - `claim_next` hands a queued submission to exactly one worker
/// - Only the worker holding the claim can heartbeat it, finish it, or
///   release it for retry
/// - Terminal states are never overwritten
/// - Queue order is FIFO by sequence; a requeued submission keeps its place
///
/// Implementations: `RedisStore` (shared between processes) and
/// `MemoryStore` (single process, tests).

use crate::types::{Submission, SubmissionMode, SubmissionStatus, Verdict, WorkerHeartbeat};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Number of recent claims averaged for the wait-time figure
pub const WAIT_SAMPLE_WINDOW: usize = 100;

/// Ordering policy between test runs and scored submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    /// One lane, strict arrival order
    #[default]
    Fifo,
    /// Test runs are claimed before any queued submit
    PrioritizeTestRuns,
}

impl QueuePolicy {
    pub fn lane_for(&self, mode: SubmissionMode) -> Lane {
        match (self, mode) {
            (QueuePolicy::PrioritizeTestRuns, SubmissionMode::TestRun) => Lane::Priority,
            _ => Lane::Standard,
        }
    }
}

impl FromStr for QueuePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "fifo" => Ok(QueuePolicy::Fifo),
            "prioritize_test_runs" => Ok(QueuePolicy::PrioritizeTestRuns),
            other => Err(format!("unknown queue policy: {}", other)),
        }
    }
}

/// Queue lanes, claimed in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Lane {
    Priority,
    Standard,
}

impl Lane {
    pub const CLAIM_ORDER: [Lane; 2] = [Lane::Priority, Lane::Standard];

    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Priority => "priority",
            Lane::Standard => "standard",
        }
    }
}

/// What happened to a submission released by its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back in the queue with its original sequence
    Requeued,
    /// Retries exhausted, now `failed`
    Failed,
    /// The caller no longer held the claim; nothing was written
    NotClaimed,
}

/// One submission touched by a staleness sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweptSubmission {
    pub id: Uuid,
    pub status: SubmissionStatus,
}

#[async_trait]
pub trait SubmissionStore: Send + Sync {
    /// Store a new submission as `queued` and assign its sequence.
    async fn insert(&self, submission: Submission, lane: Lane) -> Result<Submission>;

    async fn get(&self, id: Uuid) -> Result<Option<Submission>>;

    /// Atomically move the oldest queued submission to `running` for this worker.
    async fn claim_next(&self, worker_id: &str) -> Result<Option<Submission>>;

    /// Refresh the claim heartbeat. Returns false when the claim was lost.
    async fn touch(&self, id: Uuid, worker_id: &str) -> Result<bool>;

    /// Terminal write. Returns false when the worker no longer holds the claim.
    async fn finish(&self, id: Uuid, worker_id: &str, verdict: &Verdict) -> Result<bool>;

    /// Requeue after a system fault, or fail once `max_retries` is spent.
    async fn release_for_retry(
        &self,
        id: Uuid,
        worker_id: &str,
        message: &str,
        max_retries: u32,
    ) -> Result<RetryDecision>;

    /// Requeue (or fail) running submissions whose heartbeat is older than `cutoff`.
    async fn requeue_stale(&self, cutoff: DateTime<Utc>, max_retries: u32) -> Result<Vec<SweptSubmission>>;

    async fn queue_depth(&self) -> Result<u64>;

    async fn record_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<()>;

    async fn workers(&self) -> Result<Vec<WorkerHeartbeat>>;

    /// Forget workers last seen before `cutoff`. Returns how many were removed.
    async fn prune_workers(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Mean queue wait over the last `WAIT_SAMPLE_WINDOW` claims.
    async fn average_wait_ms(&self) -> Result<Option<f64>>;
}

pub(crate) fn mean(samples: &[i64]) -> Option<f64> {
    if samples.is_empty() {
        None
    } else {
        Some(samples.iter().sum::<i64>() as f64 / samples.len() as f64)
    }
}

/// Conformance checks shared by every store implementation.
#[cfg(test)]
pub(crate) mod conformance {
    use super::*;
    use crate::types::{ErrorType, HarnessStyle, Language, SubmissionMode};
    use std::collections::HashSet;
    use std::sync::Arc;

    pub fn queued(user: &str, mode: SubmissionMode) -> Submission {
        Submission::new(user, "sum", Language::Python, "print(1)", mode, 100)
    }

    pub fn completed_verdict() -> Verdict {
        Verdict {
            status: SubmissionStatus::Completed,
            score: Some(71),
            execution_time_ms: Some(120),
            error_type: None,
            error_message: None,
            harness_style: Some(HarnessStyle::Function),
            test_results: Vec::new(),
        }
    }

    pub async fn fifo_claim_and_finish(store: &dyn SubmissionStore) {
        let first = store.insert(queued("u1", SubmissionMode::Submit), Lane::Standard).await.unwrap();
        let second = store.insert(queued("u2", SubmissionMode::Submit), Lane::Standard).await.unwrap();
        assert!(second.sequence > first.sequence);
        assert_eq!(store.queue_depth().await.unwrap(), 2);

        let claimed = store.claim_next("w1").await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, SubmissionStatus::Running);
        assert_eq!(claimed.claimed_by.as_deref(), Some("w1"));
        assert!(claimed.started_at.is_some());
        assert_eq!(store.queue_depth().await.unwrap(), 1);

        assert!(store.touch(first.id, "w1").await.unwrap());
        assert!(!store.touch(first.id, "w2").await.unwrap());

        // Another worker cannot write the terminal state
        assert!(!store.finish(first.id, "w2", &completed_verdict()).await.unwrap());
        assert!(store.finish(first.id, "w1", &completed_verdict()).await.unwrap());
        // Terminal states are final
        assert!(!store.finish(first.id, "w1", &Verdict::timed_out("late")).await.unwrap());

        let done = store.get(first.id).await.unwrap().unwrap();
        assert_eq!(done.status, SubmissionStatus::Completed);
        assert_eq!(done.score, Some(71));
        assert_eq!(done.harness_style, Some(HarnessStyle::Function));
        assert!(done.completed_at.is_some());

        let next = store.claim_next("w2").await.unwrap().unwrap();
        assert_eq!(next.id, second.id);
        assert!(store.claim_next("w3").await.unwrap().is_none());
        assert!(store.average_wait_ms().await.unwrap().is_some());
    }

    pub async fn retry_then_fail(store: &dyn SubmissionStore) {
        let sub = store.insert(queued("u1", SubmissionMode::Submit), Lane::Standard).await.unwrap();
        let later = store.insert(queued("u2", SubmissionMode::Submit), Lane::Standard).await.unwrap();

        let claimed = store.claim_next("w1").await.unwrap().unwrap();
        assert_eq!(claimed.id, sub.id);
        assert_eq!(
            store.release_for_retry(sub.id, "w1", "spawn failed", 1).await.unwrap(),
            RetryDecision::Requeued
        );
        let requeued = store.get(sub.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, SubmissionStatus::Queued);
        assert_eq!(requeued.retry_count, 1);
        assert_eq!(requeued.error_type, Some(ErrorType::WorkerRetry));
        assert!(requeued.claimed_by.is_none());

        // Original sequence keeps it ahead of later arrivals
        let again = store.claim_next("w2").await.unwrap().unwrap();
        assert_eq!(again.id, sub.id);
        assert_eq!(
            store.release_for_retry(sub.id, "w1", "stale worker", 1).await.unwrap(),
            RetryDecision::NotClaimed
        );
        assert_eq!(
            store.release_for_retry(sub.id, "w2", "spawn failed", 1).await.unwrap(),
            RetryDecision::Failed
        );
        let failed = store.get(sub.id).await.unwrap().unwrap();
        assert_eq!(failed.status, SubmissionStatus::Failed);
        assert_eq!(failed.error_type, Some(ErrorType::WorkerFailure));

        let next = store.claim_next("w2").await.unwrap().unwrap();
        assert_eq!(next.id, later.id);
    }

    pub async fn stale_sweep(store: &dyn SubmissionStore) {
        let sub = store.insert(queued("u1", SubmissionMode::Submit), Lane::Standard).await.unwrap();
        store.claim_next("w1").await.unwrap().unwrap();

        // Fresh heartbeat survives a sweep with an old cutoff
        let swept = store
            .requeue_stale(Utc::now() - chrono::Duration::minutes(5), 1)
            .await
            .unwrap();
        assert!(swept.is_empty());

        let swept = store
            .requeue_stale(Utc::now() + chrono::Duration::seconds(1), 1)
            .await
            .unwrap();
        assert_eq!(swept, vec![SweptSubmission { id: sub.id, status: SubmissionStatus::Queued }]);
        // The original worker lost its claim
        assert!(!store.touch(sub.id, "w1").await.unwrap());
        assert!(!store.finish(sub.id, "w1", &completed_verdict()).await.unwrap());

        store.claim_next("w2").await.unwrap().unwrap();
        let swept = store
            .requeue_stale(Utc::now() + chrono::Duration::seconds(1), 1)
            .await
            .unwrap();
        assert_eq!(swept, vec![SweptSubmission { id: sub.id, status: SubmissionStatus::Failed }]);
        let failed = store.get(sub.id).await.unwrap().unwrap();
        assert_eq!(failed.error_type, Some(ErrorType::StaleClaim));
        assert!(store.claim_next("w3").await.unwrap().is_none());
    }

    pub async fn priority_lane(store: &dyn SubmissionStore) {
        let policy = QueuePolicy::PrioritizeTestRuns;
        let submit = queued("u1", SubmissionMode::Submit);
        let run = queued("u2", SubmissionMode::TestRun);
        let submit = store.insert(submit, policy.lane_for(SubmissionMode::Submit)).await.unwrap();
        let run = store.insert(run, policy.lane_for(SubmissionMode::TestRun)).await.unwrap();
        assert_eq!(store.queue_depth().await.unwrap(), 2);

        assert_eq!(store.claim_next("w1").await.unwrap().unwrap().id, run.id);
        assert_eq!(store.claim_next("w1").await.unwrap().unwrap().id, submit.id);
    }

    pub async fn concurrent_claims_are_exclusive(store: Arc<dyn SubmissionStore>) {
        let sub = store.insert(queued("u1", SubmissionMode::Submit), Lane::Standard).await.unwrap();

        let mut handles = Vec::new();
        for n in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim_next(&format!("w{}", n)).await.unwrap().map(|s| s.id)
            }));
        }
        let mut winners = HashSet::new();
        let mut claims = 0;
        for handle in handles {
            if let Some(id) = handle.await.unwrap() {
                claims += 1;
                winners.insert(id);
            }
        }
        assert_eq!(claims, 1);
        assert!(winners.contains(&sub.id));
    }

    pub async fn worker_heartbeats(store: &dyn SubmissionStore) {
        let beat = WorkerHeartbeat {
            worker_id: "host-1/0".to_string(),
            last_seen: Utc::now(),
            processed: 3,
            current_submission: None,
        };
        store.record_heartbeat(&beat).await.unwrap();
        let mut newer = beat.clone();
        newer.processed = 4;
        store.record_heartbeat(&newer).await.unwrap();

        let workers = store.workers().await.unwrap();
        let found: Vec<_> = workers.iter().filter(|w| w.worker_id == "host-1/0").collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].processed, 4);
    }

    pub async fn departed_workers_are_pruned(store: &dyn SubmissionStore) {
        let now = Utc::now();
        for (worker_id, age) in [("live-0", 1), ("gone-0", 600), ("gone-1", 3600)] {
            store
                .record_heartbeat(&WorkerHeartbeat {
                    worker_id: worker_id.to_string(),
                    last_seen: now - chrono::Duration::seconds(age),
                    processed: 0,
                    current_submission: None,
                })
                .await
                .unwrap();
        }

        let removed = store.prune_workers(now - chrono::Duration::seconds(60)).await.unwrap();
        assert_eq!(removed, 2);
        let remaining: Vec<String> = store.workers().await.unwrap().into_iter().map(|w| w.worker_id).collect();
        assert_eq!(remaining, vec!["live-0".to_string()]);
        assert_eq!(store.prune_workers(now - chrono::Duration::seconds(60)).await.unwrap(), 0);
    }

    /// A worker id that comes back after its claim was swept must not
    /// write to a submission another worker now holds.
    pub async fn reclaimed_submission_ignores_previous_holder(store: &dyn SubmissionStore) {
        let sub = store.insert(queued("u1", SubmissionMode::Submit), Lane::Standard).await.unwrap();
        store.claim_next("host-a-0").await.unwrap().unwrap();
        store
            .requeue_stale(Utc::now() + chrono::Duration::seconds(1), 3)
            .await
            .unwrap();

        let reclaimed = store.claim_next("host-b-0").await.unwrap().unwrap();
        assert_eq!(reclaimed.id, sub.id);
        assert!(!store.touch(sub.id, "host-a-0").await.unwrap());
        assert!(!store.finish(sub.id, "host-a-0", &completed_verdict()).await.unwrap());
        assert_eq!(
            store.release_for_retry(sub.id, "host-a-0", "late fault", 3).await.unwrap(),
            RetryDecision::NotClaimed
        );

        assert!(store.finish(sub.id, "host-b-0", &completed_verdict()).await.unwrap());
        let done = store.get(sub.id).await.unwrap().unwrap();
        assert_eq!(done.claimed_by.as_deref(), Some("host-b-0"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_lanes() {
        assert_eq!(QueuePolicy::Fifo.lane_for(SubmissionMode::TestRun), Lane::Standard);
        assert_eq!(QueuePolicy::PrioritizeTestRuns.lane_for(SubmissionMode::TestRun), Lane::Priority);
        assert_eq!(QueuePolicy::PrioritizeTestRuns.lane_for(SubmissionMode::Submit), Lane::Standard);
        assert_eq!("prioritize_test_runs".parse::<QueuePolicy>().unwrap(), QueuePolicy::PrioritizeTestRuns);
        assert!("lifo".parse::<QueuePolicy>().is_err());
    }

    #[test]
    fn test_mean() {
        assert_eq!(mean(&[]), None);
        assert_eq!(mean(&[10, 20, 30]), Some(20.0));
    }
}
