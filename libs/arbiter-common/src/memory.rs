// In-process submission store. Same semantics as the Redis store; a single
// mutex makes every transition atomic.

use crate::store::{mean, Lane, RetryDecision, SubmissionStore, SweptSubmission, WAIT_SAMPLE_WINDOW};
use crate::types::{ErrorType, Submission, SubmissionStatus, Verdict, WorkerHeartbeat};
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    next_sequence: u64,
    submissions: HashMap<Uuid, (Submission, Lane)>,
    /// lane -> sequence -> id
    queues: BTreeMap<Lane, BTreeMap<u64, Uuid>>,
    /// Time each submission last entered the queue
    queued_at: HashMap<Uuid, DateTime<Utc>>,
    workers: BTreeMap<String, WorkerHeartbeat>,
    wait_samples: VecDeque<i64>,
}

/// Moves `sub` to `next` when the state machine allows it.
fn advance(sub: &mut Submission, next: SubmissionStatus) -> bool {
    if !sub.status.can_transition_to(next) {
        return false;
    }
    sub.status = next;
    true
}

impl Inner {
    fn enqueue(&mut self, id: Uuid, sequence: u64, lane: Lane) {
        self.queues.entry(lane).or_default().insert(sequence, id);
        self.queued_at.insert(id, Utc::now());
    }

    fn holds_claim(&self, id: Uuid, worker_id: &str) -> bool {
        matches!(
            self.submissions.get(&id),
            Some((s, _)) if s.status == SubmissionStatus::Running && s.claimed_by.as_deref() == Some(worker_id)
        )
    }

    /// Shared by fault release and the staleness sweep.
    fn release(&mut self, id: Uuid, message: &str, max_retries: u32, exhausted: ErrorType) -> Option<SubmissionStatus> {
        let now = Utc::now();
        let (sub, lane) = self.submissions.get_mut(&id)?;
        let (sequence, lane) = (sub.sequence, *lane);
        let next = if sub.retry_count < max_retries {
            SubmissionStatus::Queued
        } else {
            SubmissionStatus::Failed
        };
        if !advance(sub, next) {
            return None;
        }
        sub.claimed_by = None;
        sub.error_message = Some(message.to_string());

        if next == SubmissionStatus::Queued {
            sub.retry_count += 1;
            sub.error_type = Some(ErrorType::WorkerRetry);
            self.enqueue(id, sequence, lane);
            Some(SubmissionStatus::Queued)
        } else {
            sub.error_type = Some(exhausted);
            sub.completed_at = Some(now);
            Some(SubmissionStatus::Failed)
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        match self.inner.lock() {
            Ok(guard) => Ok(guard),
            Err(_) => bail!("memory store lock poisoned"),
        }
    }
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn insert(&self, mut submission: Submission, lane: Lane) -> Result<Submission> {
        let mut inner = self.lock()?;
        inner.next_sequence += 1;
        submission.sequence = inner.next_sequence;
        submission.status = SubmissionStatus::Queued;
        inner.enqueue(submission.id, submission.sequence, lane);
        inner.submissions.insert(submission.id, (submission.clone(), lane));
        Ok(submission)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Submission>> {
        Ok(self.lock()?.submissions.get(&id).map(|(s, _)| s.clone()))
    }

    async fn claim_next(&self, worker_id: &str) -> Result<Option<Submission>> {
        let mut inner = self.lock()?;
        let now = Utc::now();

        for lane in Lane::CLAIM_ORDER {
            loop {
                let Some((_, id)) = inner.queues.get_mut(&lane).and_then(|q| q.pop_first()) else {
                    break;
                };
                let queued_at = inner.queued_at.remove(&id);
                let Some((sub, _)) = inner.submissions.get_mut(&id) else {
                    continue;
                };
                if !advance(sub, SubmissionStatus::Running) {
                    continue;
                }
                sub.claimed_by = Some(worker_id.to_string());
                sub.started_at = Some(now);
                sub.heartbeat_at = Some(now);
                let claimed = sub.clone();

                if let Some(queued_at) = queued_at {
                    inner.wait_samples.push_front((now - queued_at).num_milliseconds());
                    inner.wait_samples.truncate(WAIT_SAMPLE_WINDOW);
                }
                return Ok(Some(claimed));
            }
        }
        Ok(None)
    }

    async fn touch(&self, id: Uuid, worker_id: &str) -> Result<bool> {
        let mut inner = self.lock()?;
        if !inner.holds_claim(id, worker_id) {
            return Ok(false);
        }
        if let Some((sub, _)) = inner.submissions.get_mut(&id) {
            sub.heartbeat_at = Some(Utc::now());
        }
        Ok(true)
    }

    async fn finish(&self, id: Uuid, worker_id: &str, verdict: &Verdict) -> Result<bool> {
        if !verdict.status.is_terminal() {
            bail!("finish requires a terminal status, got {}", verdict.status);
        }
        let mut inner = self.lock()?;
        if !inner.holds_claim(id, worker_id) {
            return Ok(false);
        }
        if let Some((sub, _)) = inner.submissions.get_mut(&id) {
            if !advance(sub, verdict.status) {
                return Ok(false);
            }
            sub.score = verdict.score;
            sub.execution_time_ms = verdict.execution_time_ms;
            sub.error_type = verdict.error_type;
            sub.error_message = verdict.error_message.clone();
            sub.harness_style = verdict.harness_style;
            sub.test_results = verdict.test_results.clone();
            sub.completed_at = Some(Utc::now());
        }
        Ok(true)
    }

    async fn release_for_retry(
        &self,
        id: Uuid,
        worker_id: &str,
        message: &str,
        max_retries: u32,
    ) -> Result<RetryDecision> {
        let mut inner = self.lock()?;
        if !inner.holds_claim(id, worker_id) {
            return Ok(RetryDecision::NotClaimed);
        }
        Ok(match inner.release(id, message, max_retries, ErrorType::WorkerFailure) {
            Some(SubmissionStatus::Queued) => RetryDecision::Requeued,
            Some(_) => RetryDecision::Failed,
            None => RetryDecision::NotClaimed,
        })
    }

    async fn requeue_stale(&self, cutoff: DateTime<Utc>, max_retries: u32) -> Result<Vec<SweptSubmission>> {
        let mut inner = self.lock()?;
        let mut stale: Vec<(u64, Uuid)> = inner
            .submissions
            .values()
            .filter(|(s, _)| s.status == SubmissionStatus::Running && s.heartbeat_at.map_or(true, |hb| hb < cutoff))
            .map(|(s, _)| (s.sequence, s.id))
            .collect();
        stale.sort_unstable();

        let mut swept = Vec::with_capacity(stale.len());
        for (_, id) in stale {
            if let Some(status) = inner.release(id, "worker heartbeat lost", max_retries, ErrorType::StaleClaim) {
                swept.push(SweptSubmission { id, status });
            }
        }
        Ok(swept)
    }

    async fn queue_depth(&self) -> Result<u64> {
        Ok(self.lock()?.queues.values().map(|q| q.len() as u64).sum())
    }

    async fn record_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<()> {
        self.lock()?
            .workers
            .insert(heartbeat.worker_id.clone(), heartbeat.clone());
        Ok(())
    }

    async fn workers(&self) -> Result<Vec<WorkerHeartbeat>> {
        Ok(self.lock()?.workers.values().cloned().collect())
    }

    async fn prune_workers(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.lock()?;
        let before = inner.workers.len();
        inner.workers.retain(|_, w| w.last_seen >= cutoff);
        Ok(before - inner.workers.len())
    }

    async fn average_wait_ms(&self) -> Result<Option<f64>> {
        let inner = self.lock()?;
        let samples: Vec<i64> = inner.wait_samples.iter().copied().collect();
        Ok(mean(&samples))
    }
}
