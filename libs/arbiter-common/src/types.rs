use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Languages accepted by the judge.
///
/// Python and JavaScript are interpreted and support both harness styles;
/// the rest are compiled and always run in input style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    Java,
    C,
    Cpp,
    CSharp,
}

impl Language {
    pub const ALL: [Language; 6] = [
        Language::Python,
        Language::JavaScript,
        Language::Java,
        Language::C,
        Language::Cpp,
        Language::CSharp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Java => "java",
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::CSharp => "csharp",
        }
    }

    pub fn is_interpreted(&self) -> bool {
        matches!(self, Language::Python | Language::JavaScript)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported language: {0}")]
pub struct UnknownLanguage(pub String);

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "javascript" | "js" | "node" => Ok(Language::JavaScript),
            "java" => Ok(Language::Java),
            "c" => Ok(Language::C),
            "cpp" | "c++" => Ok(Language::Cpp),
            "csharp" | "c#" | "cs" => Ok(Language::CSharp),
            other => Err(UnknownLanguage(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Sample,
    #[default]
    Hidden,
}

/// A single graded case of a challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Positional arguments for function style, stdin lines for input style
    pub input: Vec<serde_json::Value>,
    pub expected_output: serde_json::Value,
    pub visibility: Visibility,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl TestCase {
    pub fn weight(&self) -> f64 {
        self.weight.unwrap_or(1.0)
    }

    pub fn is_sample(&self) -> bool {
        self.visibility == Visibility::Sample
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub function_name: String,
    pub max_score: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_mb: Option<u64>,
    pub test_cases: Vec<TestCase>,
}

impl Challenge {
    /// Cases evaluated for a given mode, in challenge order.
    pub fn cases_for(&self, mode: SubmissionMode) -> Vec<&TestCase> {
        self.test_cases
            .iter()
            .filter(|tc| mode == SubmissionMode::Submit || tc.is_sample())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionMode {
    /// Sample cases only
    TestRun,
    /// Every case, counts toward the participant's score
    Submit,
}

impl fmt::Display for SubmissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmissionMode::TestRun => f.write_str("test_run"),
            SubmissionMode::Submit => f.write_str("submit"),
        }
    }
}

impl FromStr for SubmissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "test_run" | "test-run" | "run" => Ok(SubmissionMode::TestRun),
            "submit" => Ok(SubmissionMode::Submit),
            other => Err(format!("unknown submission mode: {}", other)),
        }
    }
}

/// Submission lifecycle.
///
/// `queued -> running -> {completed, failed, timeout}`, plus the bounded
/// retry edge `running -> queued`. Terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Queued => "queued",
            SubmissionStatus::Running => "running",
            SubmissionStatus::Completed => "completed",
            SubmissionStatus::Failed => "failed",
            SubmissionStatus::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubmissionStatus::Completed | SubmissionStatus::Failed | SubmissionStatus::Timeout
        )
    }

    pub fn can_transition_to(&self, next: SubmissionStatus) -> bool {
        use SubmissionStatus::*;
        matches!(
            (self, next),
            (Queued, Running) | (Running, Queued) | (Running, Completed) | (Running, Failed) | (Running, Timeout)
        )
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubmissionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(SubmissionStatus::Queued),
            "running" => Ok(SubmissionStatus::Running),
            "completed" => Ok(SubmissionStatus::Completed),
            "failed" => Ok(SubmissionStatus::Failed),
            "timeout" => Ok(SubmissionStatus::Timeout),
            other => Err(format!("unknown submission status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarnessStyle {
    Function,
    Input,
}

impl fmt::Display for HarnessStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HarnessStyle::Function => f.write_str("function"),
            HarnessStyle::Input => f.write_str("input"),
        }
    }
}

impl FromStr for HarnessStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "function" => Ok(HarnessStyle::Function),
            "input" => Ok(HarnessStyle::Input),
            other => Err(format!("unknown harness style: {}", other)),
        }
    }
}

/// Why a single test case did not pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    WrongAnswer,
    Timeout,
    MemoryExceeded,
    RuntimeError,
    CompileError,
    OutputLimitExceeded,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::WrongAnswer => "wrong_answer",
            FailureKind::Timeout => "timeout",
            FailureKind::MemoryExceeded => "memory_exceeded",
            FailureKind::RuntimeError => "runtime_error",
            FailureKind::CompileError => "compile_error",
            FailureKind::OutputLimitExceeded => "output_limit_exceeded",
        }
    }
}

/// Submission-level error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    CompileError,
    WorkerRetry,
    WorkerFailure,
    StaleClaim,
    JudgeTimeout,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::CompileError => "compile_error",
            ErrorType::WorkerRetry => "worker_retry",
            ErrorType::WorkerFailure => "worker_failure",
            ErrorType::StaleClaim => "stale_claim",
            ErrorType::JudgeTimeout => "judge_timeout",
        }
    }
}

impl FromStr for ErrorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "compile_error" => Ok(ErrorType::CompileError),
            "worker_retry" => Ok(ErrorType::WorkerRetry),
            "worker_failure" => Ok(ErrorType::WorkerFailure),
            "stale_claim" => Ok(ErrorType::StaleClaim),
            "judge_timeout" => Ok(ErrorType::JudgeTimeout),
            other => Err(format!("unknown error type: {}", other)),
        }
    }
}

/// Raw result of one sandboxed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success {
        stdout: String,
        stderr: String,
        exit_code: i32,
        duration_ms: u64,
        #[serde(default)]
        truncated: bool,
    },
    Timeout {
        duration_ms: u64,
    },
    MemoryExceeded {
        duration_ms: u64,
    },
    RuntimeError {
        message: String,
        stdout: String,
        duration_ms: u64,
    },
    CompileError {
        message: String,
    },
}

impl ExecutionOutcome {
    pub fn duration_ms(&self) -> u64 {
        match self {
            ExecutionOutcome::Success { duration_ms, .. }
            | ExecutionOutcome::Timeout { duration_ms }
            | ExecutionOutcome::MemoryExceeded { duration_ms }
            | ExecutionOutcome::RuntimeError { duration_ms, .. } => *duration_ms,
            ExecutionOutcome::CompileError { .. } => 0,
        }
    }

    /// Label used for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionOutcome::Success { .. } => "success",
            ExecutionOutcome::Timeout { .. } => "timeout",
            ExecutionOutcome::MemoryExceeded { .. } => "memory_exceeded",
            ExecutionOutcome::RuntimeError { .. } => "runtime_error",
            ExecutionOutcome::CompileError { .. } => "compile_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub test_case_id: u32,
    pub visibility: Visibility,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<FailureKind>,
    #[serde(default)]
    pub actual_output: String,
    #[serde(default)]
    pub stderr: String,
    pub execution_time_ms: u64,
}

/// A participant's attempt, as persisted by the submission store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: Uuid,
    pub user_id: String,
    pub challenge_id: String,
    pub language: Language,
    pub code: String,
    pub mode: SubmissionMode,
    pub status: SubmissionStatus,
    pub score: Option<u32>,
    pub max_score: u32,
    pub execution_time_ms: Option<u64>,
    pub error_type: Option<ErrorType>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub harness_style: Option<HarnessStyle>,
    pub sequence: u64,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub test_results: Vec<TestResult>,
}

impl Submission {
    /// A freshly accepted submission; the store assigns `sequence` on insert.
    pub fn new(
        user_id: impl Into<String>,
        challenge_id: impl Into<String>,
        language: Language,
        code: impl Into<String>,
        mode: SubmissionMode,
        max_score: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            challenge_id: challenge_id.into(),
            language,
            code: code.into(),
            mode,
            status: SubmissionStatus::Queued,
            score: None,
            max_score,
            execution_time_ms: None,
            error_type: None,
            error_message: None,
            retry_count: 0,
            harness_style: None,
            sequence: 0,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            claimed_by: None,
            heartbeat_at: None,
            test_results: Vec::new(),
        }
    }
}

/// Terminal write produced by a worker for a claimed submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub status: SubmissionStatus,
    pub score: Option<u32>,
    pub execution_time_ms: Option<u64>,
    pub error_type: Option<ErrorType>,
    pub error_message: Option<String>,
    pub harness_style: Option<HarnessStyle>,
    pub test_results: Vec<TestResult>,
}

impl Verdict {
    pub fn timed_out(message: impl Into<String>) -> Self {
        Self {
            status: SubmissionStatus::Timeout,
            score: None,
            execution_time_ms: None,
            error_type: Some(ErrorType::JudgeTimeout),
            error_message: Some(message.into()),
            harness_style: None,
            test_results: Vec::new(),
        }
    }
}

/// Liveness record published by each worker loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub last_seen: DateTime<Utc>,
    pub processed: u64,
    pub current_submission: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_round_trips_through_str() {
        for lang in Language::ALL {
            assert_eq!(lang.to_string().parse::<Language>().unwrap(), lang);
        }
        assert_eq!("C++".parse::<Language>().unwrap(), Language::Cpp);
        assert!("rust".parse::<Language>().is_err());
    }

    #[test]
    fn test_language_serde_names() {
        assert_eq!(serde_json::to_string(&Language::CSharp).unwrap(), "\"csharp\"");
        assert_eq!(serde_json::to_string(&Language::JavaScript).unwrap(), "\"javascript\"");
    }

    #[test]
    fn test_status_transitions() {
        use SubmissionStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Queued));
        assert!(!Queued.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Timeout.can_transition_to(Queued));
        for terminal in [Completed, Failed, Timeout] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(Failed));
        }
    }

    #[test]
    fn test_outcome_tagging() {
        let outcome = ExecutionOutcome::Timeout { duration_ms: 2000 };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["kind"], "timeout");
        assert_eq!(outcome.duration_ms(), 2000);
        assert_eq!(ExecutionOutcome::CompileError { message: "x".into() }.duration_ms(), 0);
    }

    #[test]
    fn test_cases_for_mode() {
        let case = |id, visibility| TestCase {
            id,
            name: None,
            input: vec![],
            expected_output: serde_json::Value::Null,
            visibility,
            weight: None,
            timeout_ms: None,
        };
        let challenge = Challenge {
            id: "c".into(),
            title: None,
            function_name: "solve".into(),
            max_score: 100,
            time_limit_ms: None,
            memory_limit_mb: None,
            test_cases: vec![
                case(1, Visibility::Sample),
                case(2, Visibility::Hidden),
                case(3, Visibility::Sample),
            ],
        };
        let ids: Vec<u32> = challenge.cases_for(SubmissionMode::TestRun).iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(challenge.cases_for(SubmissionMode::Submit).len(), 3);
    }
}
