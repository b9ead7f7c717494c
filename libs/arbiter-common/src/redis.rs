use crate::store::{Lane, RetryDecision, SubmissionStore, SweptSubmission, WAIT_SAMPLE_WINDOW};
use crate::types::{
    ErrorType, Language, Submission, SubmissionMode, SubmissionStatus, TestResult, Verdict, WorkerHeartbeat,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Redis key layout - defines only naming, not runtime logic
/// Ensures API, worker and CLI never drift and keys stay deterministic.
///
/// `<ns>:submission:<id>`  hash, one per submission
/// `<ns>:queue:<lane>`     zset of queued ids scored by sequence
/// `<ns>:running`          zset of running ids scored by heartbeat (ms)
/// `<ns>:sequence`         counter behind FIFO order
/// `<ns>:workers`          hash worker_id -> heartbeat JSON
/// `<ns>:wait_samples`     list of recent queue waits (ms)
pub const DEFAULT_NAMESPACE: &str = "arbiter";

#[derive(Debug, Clone)]
pub struct Keys {
    namespace: String,
}

impl Keys {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self { namespace: namespace.into() }
    }

    pub fn submission_prefix(&self) -> String {
        format!("{}:submission:", self.namespace)
    }

    pub fn submission(&self, id: &Uuid) -> String {
        format!("{}{}", self.submission_prefix(), id)
    }

    pub fn queue_prefix(&self) -> String {
        format!("{}:queue:", self.namespace)
    }

    pub fn queue(&self, lane: Lane) -> String {
        format!("{}{}", self.queue_prefix(), lane.as_str())
    }

    pub fn running(&self) -> String {
        format!("{}:running", self.namespace)
    }

    pub fn sequence(&self) -> String {
        format!("{}:sequence", self.namespace)
    }

    pub fn workers(&self) -> String {
        format!("{}:workers", self.namespace)
    }

    pub fn wait_samples(&self) -> String {
        format!("{}:wait_samples", self.namespace)
    }
}

impl Default for Keys {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

// KEYS: running, wait_samples, lane queues in claim order
// ARGV: worker_id, now_ms, submission prefix, sample window
const CLAIM_SCRIPT: &str = r#"
for i = 3, #KEYS do
  while true do
    local head = redis.call('ZRANGE', KEYS[i], 0, 0)
    if #head == 0 then break end
    local id = head[1]
    redis.call('ZREM', KEYS[i], id)
    local key = ARGV[3] .. id
    if redis.call('HGET', key, 'status') == 'queued' then
      redis.call('HSET', key, 'status', 'running', 'claimed_by', ARGV[1], 'started_ms', ARGV[2], 'heartbeat_ms', ARGV[2])
      redis.call('ZADD', KEYS[1], ARGV[2], id)
      local queued = tonumber(redis.call('HGET', key, 'queued_ms'))
      if queued then
        redis.call('LPUSH', KEYS[2], tonumber(ARGV[2]) - queued)
        redis.call('LTRIM', KEYS[2], 0, tonumber(ARGV[4]) - 1)
      end
      return id
    end
  end
end
return false
"#;

// KEYS: submission, running
// ARGV: worker_id, id, now_ms
const TOUCH_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'status') ~= 'running' or redis.call('HGET', KEYS[1], 'claimed_by') ~= ARGV[1] then
  return 0
end
redis.call('HSET', KEYS[1], 'heartbeat_ms', ARGV[3])
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[2])
return 1
"#;

// KEYS: submission, running
// ARGV: worker_id, id, pair count, field/value pairs..., fields to delete...
const FINISH_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'status') ~= 'running' or redis.call('HGET', KEYS[1], 'claimed_by') ~= ARGV[1] then
  return 0
end
local n = tonumber(ARGV[3])
for i = 4, 3 + 2 * n, 2 do
  redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
for i = 4 + 2 * n, #ARGV do
  redis.call('HDEL', KEYS[1], ARGV[i])
end
redis.call('ZREM', KEYS[2], ARGV[2])
return 1
"#;

// KEYS: submission, running
// ARGV: worker_id, id, now_ms, max_retries, message, exhausted error type,
//       queue prefix, mode ('claim' | 'stale'), stale cutoff_ms
const RELEASE_SCRIPT: &str = r#"
local key = KEYS[1]
if redis.call('HGET', key, 'status') ~= 'running' then
  redis.call('ZREM', KEYS[2], ARGV[2])
  return false
end
if ARGV[8] == 'claim' then
  if redis.call('HGET', key, 'claimed_by') ~= ARGV[1] then return false end
else
  local hb = tonumber(redis.call('HGET', key, 'heartbeat_ms')) or 0
  if hb >= tonumber(ARGV[9]) then return false end
end
redis.call('ZREM', KEYS[2], ARGV[2])
redis.call('HDEL', key, 'claimed_by')
redis.call('HSET', key, 'error_message', ARGV[5])
local retries = tonumber(redis.call('HGET', key, 'retry_count')) or 0
if retries < tonumber(ARGV[4]) then
  redis.call('HSET', key, 'status', 'queued', 'retry_count', retries + 1, 'error_type', 'worker_retry', 'queued_ms', ARGV[3])
  local lane = redis.call('HGET', key, 'lane') or 'standard'
  redis.call('ZADD', ARGV[7] .. lane, tonumber(redis.call('HGET', key, 'sequence')), ARGV[2])
  return 'queued'
end
redis.call('HSET', key, 'status', 'failed', 'error_type', ARGV[6], 'completed_ms', ARGV[3])
return 'failed'
"#;

lazy_static! {
    static ref CLAIM: Script = Script::new(CLAIM_SCRIPT);
    static ref TOUCH: Script = Script::new(TOUCH_SCRIPT);
    static ref FINISH: Script = Script::new(FINISH_SCRIPT);
    static ref RELEASE: Script = Script::new(RELEASE_SCRIPT);
}

/// Fields fixed at enqueue time, stored as one JSON blob.
#[derive(Debug, Serialize, Deserialize)]
struct SubmissionBody {
    id: Uuid,
    user_id: String,
    challenge_id: String,
    language: Language,
    code: String,
    mode: SubmissionMode,
    max_score: u32,
    submitted_at: DateTime<Utc>,
}

fn millis_to_datetime(value: Option<&String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

fn parse_field<T: std::str::FromStr>(fields: &HashMap<String, String>, name: &str) -> Option<T> {
    fields.get(name).and_then(|v| v.parse().ok())
}

fn submission_from_hash(fields: &HashMap<String, String>) -> Result<Submission> {
    let body: SubmissionBody = serde_json::from_str(
        fields.get("body").ok_or_else(|| anyhow!("submission hash has no body"))?,
    )
    .context("Failed to parse submission body")?;

    let status = fields
        .get("status")
        .ok_or_else(|| anyhow!("submission hash has no status"))?
        .parse::<SubmissionStatus>()
        .map_err(|e| anyhow!(e))?;

    let test_results: Vec<TestResult> = match fields.get("results") {
        Some(json) => serde_json::from_str(json).context("Failed to parse test results")?,
        None => Vec::new(),
    };

    Ok(Submission {
        id: body.id,
        user_id: body.user_id,
        challenge_id: body.challenge_id,
        language: body.language,
        code: body.code,
        mode: body.mode,
        status,
        score: parse_field(fields, "score"),
        max_score: body.max_score,
        execution_time_ms: parse_field(fields, "execution_time_ms"),
        error_type: parse_field::<ErrorType>(fields, "error_type"),
        error_message: fields.get("error_message").cloned(),
        retry_count: parse_field(fields, "retry_count").unwrap_or(0),
        harness_style: parse_field(fields, "harness_style"),
        sequence: parse_field(fields, "sequence").unwrap_or(0),
        submitted_at: body.submitted_at,
        started_at: millis_to_datetime(fields.get("started_ms")),
        completed_at: millis_to_datetime(fields.get("completed_ms")),
        claimed_by: fields.get("claimed_by").cloned(),
        heartbeat_at: millis_to_datetime(fields.get("heartbeat_ms")),
        test_results,
    })
}

/// Redis-backed submission store shared by the API, workers and CLI.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    keys: Keys,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self::with_keys(conn, Keys::default())
    }

    pub fn with_keys(conn: ConnectionManager, keys: Keys) -> Self {
        Self { conn, keys }
    }

    /// Open a connection manager for `redis_url`.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let conn = ConnectionManager::new(client)
            .await
            .with_context(|| format!("Failed to connect to Redis at {}", redis_url))?;
        Ok(Self::new(conn))
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    async fn release(
        &self,
        id: Uuid,
        worker_id: &str,
        message: &str,
        max_retries: u32,
        exhausted: ErrorType,
        stale_cutoff_ms: Option<i64>,
    ) -> Result<Option<SubmissionStatus>> {
        let mut conn = self.conn.clone();
        let mode = if stale_cutoff_ms.is_some() { "stale" } else { "claim" };
        let outcome: Option<String> = RELEASE
            .key(self.keys.submission(&id))
            .key(self.keys.running())
            .arg(worker_id)
            .arg(id.to_string())
            .arg(Utc::now().timestamp_millis())
            .arg(max_retries)
            .arg(message)
            .arg(exhausted.as_str())
            .arg(self.keys.queue_prefix())
            .arg(mode)
            .arg(stale_cutoff_ms.unwrap_or(0))
            .invoke_async(&mut conn)
            .await
            .context("Release script failed")?;

        outcome
            .map(|s| s.parse::<SubmissionStatus>().map_err(|e| anyhow!(e)))
            .transpose()
    }
}

#[async_trait]
impl SubmissionStore for RedisStore {
    async fn insert(&self, mut submission: Submission, lane: Lane) -> Result<Submission> {
        let mut conn = self.conn.clone();
        let sequence: u64 = conn.incr(self.keys.sequence(), 1u64).await?;
        submission.sequence = sequence;
        submission.status = SubmissionStatus::Queued;

        let body = serde_json::to_string(&SubmissionBody {
            id: submission.id,
            user_id: submission.user_id.clone(),
            challenge_id: submission.challenge_id.clone(),
            language: submission.language,
            code: submission.code.clone(),
            mode: submission.mode,
            max_score: submission.max_score,
            submitted_at: submission.submitted_at,
        })?;

        let fields = [
            ("body", body),
            ("status", SubmissionStatus::Queued.as_str().to_string()),
            ("lane", lane.as_str().to_string()),
            ("sequence", sequence.to_string()),
            ("retry_count", "0".to_string()),
            ("queued_ms", Utc::now().timestamp_millis().to_string()),
        ];

        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(self.keys.submission(&submission.id), &fields)
            .ignore()
            .zadd(self.keys.queue(lane), submission.id.to_string(), sequence)
            .ignore()
            .query_async(&mut conn)
            .await
            .context("Failed to enqueue submission")?;

        Ok(submission)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Submission>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.keys.submission(&id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        submission_from_hash(&fields).map(Some)
    }

    async fn claim_next(&self, worker_id: &str) -> Result<Option<Submission>> {
        let mut conn = self.conn.clone();
        let mut script = CLAIM.prepare_invoke();
        script.key(self.keys.running()).key(self.keys.wait_samples());
        for lane in Lane::CLAIM_ORDER {
            script.key(self.keys.queue(lane));
        }
        let claimed: Option<String> = script
            .arg(worker_id)
            .arg(Utc::now().timestamp_millis())
            .arg(self.keys.submission_prefix())
            .arg(WAIT_SAMPLE_WINDOW)
            .invoke_async(&mut conn)
            .await
            .context("Claim script failed")?;

        match claimed {
            Some(id) => {
                let id = Uuid::parse_str(&id).context("Queue held an invalid submission id")?;
                self.get(id).await
            }
            None => Ok(None),
        }
    }

    async fn touch(&self, id: Uuid, worker_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let touched: i32 = TOUCH
            .key(self.keys.submission(&id))
            .key(self.keys.running())
            .arg(worker_id)
            .arg(id.to_string())
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(touched == 1)
    }

    async fn finish(&self, id: Uuid, worker_id: &str, verdict: &Verdict) -> Result<bool> {
        if !verdict.status.is_terminal() {
            anyhow::bail!("finish requires a terminal status, got {}", verdict.status);
        }

        let optional = [
            ("score", verdict.score.map(|s| s.to_string())),
            ("execution_time_ms", verdict.execution_time_ms.map(|t| t.to_string())),
            ("error_type", verdict.error_type.map(|e| e.as_str().to_string())),
            ("error_message", verdict.error_message.clone()),
            ("harness_style", verdict.harness_style.map(|h| h.to_string())),
        ];
        let mut pairs = vec![
            ("status", verdict.status.as_str().to_string()),
            ("completed_ms", Utc::now().timestamp_millis().to_string()),
            ("results", serde_json::to_string(&verdict.test_results)?),
        ];
        let mut deletes = Vec::new();
        for (field, value) in optional {
            match value {
                Some(v) => pairs.push((field, v)),
                None => deletes.push(field),
            }
        }

        let mut conn = self.conn.clone();
        let mut script = FINISH.prepare_invoke();
        script
            .key(self.keys.submission(&id))
            .key(self.keys.running())
            .arg(worker_id)
            .arg(id.to_string())
            .arg(pairs.len());
        for (field, value) in &pairs {
            script.arg(*field).arg(value);
        }
        for field in deletes {
            script.arg(field);
        }
        let written: i32 = script.invoke_async(&mut conn).await.context("Finish script failed")?;
        Ok(written == 1)
    }

    async fn release_for_retry(
        &self,
        id: Uuid,
        worker_id: &str,
        message: &str,
        max_retries: u32,
    ) -> Result<RetryDecision> {
        Ok(
            match self
                .release(id, worker_id, message, max_retries, ErrorType::WorkerFailure, None)
                .await?
            {
                Some(SubmissionStatus::Queued) => RetryDecision::Requeued,
                Some(_) => RetryDecision::Failed,
                None => RetryDecision::NotClaimed,
            },
        )
    }

    async fn requeue_stale(&self, cutoff: DateTime<Utc>, max_retries: u32) -> Result<Vec<SweptSubmission>> {
        let cutoff_ms = cutoff.timestamp_millis();
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .zrangebyscore(self.keys.running(), "-inf", format!("({}", cutoff_ms))
            .await?;

        let mut swept = Vec::new();
        for raw in ids {
            let Ok(id) = Uuid::parse_str(&raw) else {
                let _: () = conn.zrem(self.keys.running(), &raw).await?;
                continue;
            };
            if let Some(status) = self
                .release(id, "", "worker heartbeat lost", max_retries, ErrorType::StaleClaim, Some(cutoff_ms))
                .await?
            {
                swept.push(SweptSubmission { id, status });
            }
        }
        Ok(swept)
    }

    async fn queue_depth(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let mut depth = 0u64;
        for lane in Lane::CLAIM_ORDER {
            let n: u64 = conn.zcard(self.keys.queue(lane)).await?;
            depth += n;
        }
        Ok(depth)
    }

    async fn record_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(heartbeat)?;
        let _: () = conn.hset(self.keys.workers(), &heartbeat.worker_id, payload).await?;
        Ok(())
    }

    async fn workers(&self) -> Result<Vec<WorkerHeartbeat>> {
        let mut conn = self.conn.clone();
        let values: Vec<String> = conn.hvals(self.keys.workers()).await?;
        values
            .iter()
            .map(|v| serde_json::from_str(v).context("Failed to parse worker heartbeat"))
            .collect()
    }

    async fn prune_workers(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.conn.clone();
        let entries: Vec<(String, String)> = conn.hgetall(self.keys.workers()).await?;
        let stale: Vec<String> = entries
            .into_iter()
            .filter(|(_, payload)| {
                serde_json::from_str::<WorkerHeartbeat>(payload).map_or(true, |w| w.last_seen < cutoff)
            })
            .map(|(worker_id, _)| worker_id)
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }
        let removed: usize = conn.hdel(self.keys.workers(), &stale).await?;
        Ok(removed)
    }

    async fn average_wait_ms(&self) -> Result<Option<f64>> {
        let mut conn = self.conn.clone();
        let samples: Vec<i64> = conn.lrange(self.keys.wait_samples(), 0, -1).await?;
        Ok(crate::store::mean(&samples))
    }
}
