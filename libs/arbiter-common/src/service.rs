/// Boundary operations - what the API and CLI call into
///
/// **Core Responsibility:**
/// - `enqueue`: validate a submission and insert it as `queued`
/// - `get_status`: read a submission back, with per-test results visible only
///   to the owner or an admin
/// - `get_queue_health`: queue depth, worker liveness and average wait
///
/// Judging never happens here; `enqueue` returns as soon as the row is stored.

use crate::challenge::ChallengeCatalog;
use crate::config::SubmissionLimits;
use crate::store::{QueuePolicy, SubmissionStore};
use crate::types::{
    ErrorType, FailureKind, Language, Submission, SubmissionMode, SubmissionStatus, TestResult, Visibility,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("code must not be empty")]
    EmptyCode,
    #[error("code exceeds the maximum size of {limit} bytes")]
    CodeTooLarge { limit: usize },
    #[error("code exceeds the maximum of {limit} lines")]
    TooManyLines { limit: usize },
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("unknown challenge: {0}")]
    UnknownChallenge(String),
    #[error("failed to store submission: {0}")]
    Store(#[source] anyhow::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnqueueRequest {
    pub user_id: String,
    pub challenge_id: String,
    pub language: String,
    pub code: String,
    pub mode: SubmissionMode,
}

/// Everything `enqueue` checks a request against.
pub struct Intake<'a> {
    pub catalog: &'a ChallengeCatalog,
    pub enabled_languages: &'a HashSet<Language>,
    pub limits: &'a SubmissionLimits,
    pub policy: QueuePolicy,
}

/// Strip NUL bytes and normalize line endings.
pub fn sanitize_code(code: &str) -> String {
    code.replace('\0', "").replace("\r\n", "\n")
}

/// Accept a submission for judging.
///
/// ## Returns
/// The new submission id; the submission is `queued` when this returns
pub async fn enqueue(
    store: &dyn SubmissionStore,
    intake: &Intake<'_>,
    request: EnqueueRequest,
) -> Result<Uuid, EnqueueError> {
    let language: Language = request
        .language
        .parse()
        .map_err(|_| EnqueueError::UnsupportedLanguage(request.language.clone()))?;
    if !intake.enabled_languages.contains(&language) {
        return Err(EnqueueError::UnsupportedLanguage(request.language));
    }

    let code = sanitize_code(&request.code);
    if code.trim().is_empty() {
        return Err(EnqueueError::EmptyCode);
    }
    if code.len() > intake.limits.max_code_bytes {
        return Err(EnqueueError::CodeTooLarge { limit: intake.limits.max_code_bytes });
    }
    if code.lines().count() > intake.limits.max_code_lines {
        return Err(EnqueueError::TooManyLines { limit: intake.limits.max_code_lines });
    }

    let challenge = intake
        .catalog
        .get(&request.challenge_id)
        .ok_or_else(|| EnqueueError::UnknownChallenge(request.challenge_id.clone()))?;

    let submission = Submission::new(
        request.user_id,
        challenge.id.clone(),
        language,
        code,
        request.mode,
        challenge.max_score,
    );
    let lane = intake.policy.lane_for(request.mode);
    let stored = store.insert(submission, lane).await.map_err(EnqueueError::Store)?;

    info!(
        submission_id = %stored.id,
        user_id = %stored.user_id,
        challenge_id = %stored.challenge_id,
        language = %stored.language,
        mode = %stored.mode,
        sequence = stored.sequence,
        "Submission queued"
    );
    Ok(stored.id)
}

/// Who is asking for a submission's status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Viewer {
    Admin,
    User(String),
    Anonymous,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestResultView {
    pub test_case_id: u32,
    pub visibility: Visibility,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    pub execution_time_ms: u64,
}

impl TestResultView {
    fn from_result(result: &TestResult, reveal_hidden: bool) -> Self {
        let reveal = reveal_hidden || result.visibility == Visibility::Sample;
        Self {
            test_case_id: result.test_case_id,
            visibility: result.visibility,
            passed: result.passed,
            classification: result.classification,
            actual_output: reveal.then(|| result.actual_output.clone()),
            stderr: reveal.then(|| result.stderr.clone()),
            execution_time_ms: result.execution_time_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusView {
    pub submission_id: Uuid,
    pub challenge_id: String,
    pub language: Language,
    pub mode: SubmissionMode,
    pub status: SubmissionStatus,
    pub score: Option<u32>,
    pub max_score: u32,
    pub execution_time_ms: Option<u64>,
    pub error_type: Option<ErrorType>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_results: Option<Vec<TestResultView>>,
}

/// Message shown to participants for a given error category.
fn participant_message(submission: &Submission) -> Option<String> {
    match submission.error_type {
        None => None,
        Some(ErrorType::CompileError) => submission.error_message.clone(),
        Some(ErrorType::WorkerRetry) => Some("Judging was interrupted and has been rescheduled".to_string()),
        Some(ErrorType::JudgeTimeout) => Some("Judging exceeded the time budget for this submission".to_string()),
        Some(ErrorType::WorkerFailure) | Some(ErrorType::StaleClaim) => {
            Some("The judge could not evaluate this submission".to_string())
        }
    }
}

pub fn status_view(submission: &Submission, viewer: &Viewer) -> StatusView {
    let is_admin = *viewer == Viewer::Admin;
    let is_owner = matches!(viewer, Viewer::User(id) if *id == submission.user_id);

    let test_results = (is_admin || is_owner).then(|| {
        submission
            .test_results
            .iter()
            .map(|r| TestResultView::from_result(r, is_admin))
            .collect()
    });

    StatusView {
        submission_id: submission.id,
        challenge_id: submission.challenge_id.clone(),
        language: submission.language,
        mode: submission.mode,
        status: submission.status,
        score: submission.score,
        max_score: submission.max_score,
        execution_time_ms: submission.execution_time_ms,
        error_type: submission.error_type,
        error_message: if is_admin {
            submission.error_message.clone()
        } else {
            participant_message(submission)
        },
        retry_count: submission.retry_count,
        submitted_at: submission.submitted_at,
        started_at: submission.started_at,
        completed_at: submission.completed_at,
        test_results,
    }
}

/// Look up a submission as seen by `viewer`.
pub async fn get_status(
    store: &dyn SubmissionStore,
    id: Uuid,
    viewer: &Viewer,
) -> anyhow::Result<Option<StatusView>> {
    Ok(store.get(id).await?.map(|s| status_view(&s, viewer)))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerLiveness {
    pub worker_id: String,
    pub last_heartbeat: DateTime<Utc>,
    pub alive: bool,
    pub processed: u64,
    pub current_submission: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueHealth {
    pub queue_depth: u64,
    pub workers_alive: usize,
    pub workers: Vec<WorkerLiveness>,
    pub avg_wait_time_ms: Option<f64>,
}

/// Queue depth, worker liveness and average wait.
///
/// A worker is alive when its last heartbeat is within `liveness_window`.
pub async fn get_queue_health(
    store: &dyn SubmissionStore,
    liveness_window: Duration,
) -> anyhow::Result<QueueHealth> {
    let now = Utc::now();
    let window = chrono::Duration::from_std(liveness_window).unwrap_or_else(|_| chrono::Duration::seconds(15));

    let mut workers: Vec<WorkerLiveness> = store
        .workers()
        .await?
        .into_iter()
        .map(|w| WorkerLiveness {
            alive: now - w.last_seen <= window,
            worker_id: w.worker_id,
            last_heartbeat: w.last_seen,
            processed: w.processed,
            current_submission: w.current_submission,
        })
        .collect();
    workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));

    Ok(QueueHealth {
        queue_depth: store.queue_depth().await?,
        workers_alive: workers.iter().filter(|w| w.alive).count(),
        workers,
        avg_wait_time_ms: store.average_wait_ms().await?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::types::{Challenge, HarnessStyle, TestCase, Verdict, WorkerHeartbeat};
    use serde_json::json;

    fn catalog() -> ChallengeCatalog {
        let case = |id, visibility| TestCase {
            id,
            name: None,
            input: vec![json!(1), json!(2)],
            expected_output: json!(3),
            visibility,
            weight: None,
            timeout_ms: None,
        };
        std::iter::once(Challenge {
            id: "sum".into(),
            title: Some("Sum".into()),
            function_name: "solve".into(),
            max_score: 100,
            time_limit_ms: None,
            memory_limit_mb: None,
            test_cases: vec![case(1, Visibility::Sample), case(2, Visibility::Hidden)],
        })
        .collect()
    }

    fn request(code: &str, language: &str, challenge: &str) -> EnqueueRequest {
        EnqueueRequest {
            user_id: "alice".into(),
            challenge_id: challenge.into(),
            language: language.into(),
            code: code.into(),
            mode: SubmissionMode::Submit,
        }
    }

    struct Fixture {
        catalog: ChallengeCatalog,
        languages: HashSet<Language>,
        limits: SubmissionLimits,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                catalog: catalog(),
                languages: Language::ALL.into_iter().filter(|l| *l != Language::CSharp).collect(),
                limits: SubmissionLimits { max_code_bytes: 64, max_code_lines: 3 },
            }
        }

        fn intake(&self) -> Intake<'_> {
            Intake {
                catalog: &self.catalog,
                enabled_languages: &self.languages,
                limits: &self.limits,
                policy: QueuePolicy::Fifo,
            }
        }
    }

    #[tokio::test]
    async fn test_enqueue_stores_queued_submission() {
        let store = MemoryStore::new();
        let fixture = Fixture::new();
        let id = enqueue(&store, &fixture.intake(), request("print(1)\0\r\n", "python", "sum"))
            .await
            .unwrap();

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubmissionStatus::Queued);
        assert_eq!(stored.code, "print(1)\n");
        assert_eq!(stored.language, Language::Python);
        assert_eq!(store.queue_depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_validation() {
        let store = MemoryStore::new();
        let fixture = Fixture::new();
        let intake = fixture.intake();

        let err = enqueue(&store, &intake, request("x", "rust", "sum")).await.unwrap_err();
        assert!(matches!(err, EnqueueError::UnsupportedLanguage(_)));
        let err = enqueue(&store, &intake, request("x", "csharp", "sum")).await.unwrap_err();
        assert!(matches!(err, EnqueueError::UnsupportedLanguage(_)));
        let err = enqueue(&store, &intake, request("  \n", "python", "sum")).await.unwrap_err();
        assert!(matches!(err, EnqueueError::EmptyCode));
        let err = enqueue(&store, &intake, request(&"x".repeat(65), "python", "sum")).await.unwrap_err();
        assert!(matches!(err, EnqueueError::CodeTooLarge { limit: 64 }));
        let err = enqueue(&store, &intake, request("a\nb\nc\nd", "python", "sum")).await.unwrap_err();
        assert!(matches!(err, EnqueueError::TooManyLines { limit: 3 }));
        let err = enqueue(&store, &intake, request("x", "python", "nope")).await.unwrap_err();
        assert!(matches!(err, EnqueueError::UnknownChallenge(_)));

        assert_eq!(store.queue_depth().await.unwrap(), 0);
    }

    fn judged_submission() -> Submission {
        let mut sub = Submission::new("alice", "sum", Language::Python, "x", SubmissionMode::Submit, 100);
        sub.status = SubmissionStatus::Completed;
        sub.score = Some(50);
        sub.test_results = vec![
            TestResult {
                test_case_id: 1,
                visibility: Visibility::Sample,
                passed: true,
                classification: None,
                actual_output: "3".into(),
                stderr: String::new(),
                execution_time_ms: 4,
            },
            TestResult {
                test_case_id: 2,
                visibility: Visibility::Hidden,
                passed: false,
                classification: Some(FailureKind::WrongAnswer),
                actual_output: "4".into(),
                stderr: "debug".into(),
                execution_time_ms: 5,
            },
        ];
        sub
    }

    #[test]
    fn test_status_view_visibility() {
        let sub = judged_submission();

        let admin = status_view(&sub, &Viewer::Admin);
        let admin_results = admin.test_results.unwrap();
        assert_eq!(admin_results[1].actual_output.as_deref(), Some("4"));

        let owner = status_view(&sub, &Viewer::User("alice".into()));
        let owner_results = owner.test_results.unwrap();
        assert_eq!(owner_results.len(), 2);
        assert_eq!(owner_results[0].actual_output.as_deref(), Some("3"));
        assert_eq!(owner_results[1].actual_output, None);
        assert_eq!(owner_results[1].stderr, None);
        assert_eq!(owner_results[1].classification, Some(FailureKind::WrongAnswer));

        let other = status_view(&sub, &Viewer::User("bob".into()));
        assert!(other.test_results.is_none());
        assert_eq!(other.score, Some(50));
        assert!(status_view(&sub, &Viewer::Anonymous).test_results.is_none());
    }

    #[test]
    fn test_system_errors_are_not_leaked() {
        let mut sub = judged_submission();
        sub.status = SubmissionStatus::Failed;
        sub.error_type = Some(ErrorType::WorkerFailure);
        sub.error_message = Some("spawn /usr/bin/python3: ENOENT at /var/lib/arbiter/ws".into());

        let owner = status_view(&sub, &Viewer::User("alice".into()));
        assert!(!owner.error_message.unwrap().contains("/var/lib"));
        let admin = status_view(&sub, &Viewer::Admin);
        assert!(admin.error_message.unwrap().contains("ENOENT"));
    }

    #[tokio::test]
    async fn test_get_status_round_trip() {
        let store = MemoryStore::new();
        let fixture = Fixture::new();
        let id = enqueue(&store, &fixture.intake(), request("print(3)", "python", "sum")).await.unwrap();

        store.claim_next("w1").await.unwrap();
        let verdict = Verdict {
            status: SubmissionStatus::Completed,
            score: Some(100),
            execution_time_ms: Some(9),
            error_type: None,
            error_message: None,
            harness_style: Some(HarnessStyle::Input),
            test_results: judged_submission().test_results,
        };
        assert!(store.finish(id, "w1", &verdict).await.unwrap());

        let view = get_status(&store, id, &Viewer::User("alice".into())).await.unwrap().unwrap();
        assert_eq!(view.status, SubmissionStatus::Completed);
        assert_eq!(view.score, Some(100));
        assert_eq!(view.test_results.unwrap().len(), 2);
        assert!(get_status(&store, Uuid::new_v4(), &Viewer::Admin).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_queue_health() {
        let store = MemoryStore::new();
        let fixture = Fixture::new();
        enqueue(&store, &fixture.intake(), request("print(3)", "python", "sum")).await.unwrap();
        enqueue(&store, &fixture.intake(), request("print(3)", "python", "sum")).await.unwrap();
        store.claim_next("w1").await.unwrap();

        store
            .record_heartbeat(&WorkerHeartbeat {
                worker_id: "w1".into(),
                last_seen: Utc::now(),
                processed: 0,
                current_submission: None,
            })
            .await
            .unwrap();
        store
            .record_heartbeat(&WorkerHeartbeat {
                worker_id: "w0".into(),
                last_seen: Utc::now() - chrono::Duration::minutes(10),
                processed: 7,
                current_submission: None,
            })
            .await
            .unwrap();

        let health = get_queue_health(&store, Duration::from_secs(15)).await.unwrap();
        assert_eq!(health.queue_depth, 1);
        assert_eq!(health.workers.len(), 2);
        assert_eq!(health.workers_alive, 1);
        assert_eq!(health.workers[0].worker_id, "w0");
        assert!(!health.workers[0].alive);
        assert!(health.avg_wait_time_ms.is_some());
    }
}
