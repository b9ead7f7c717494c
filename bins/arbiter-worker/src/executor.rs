/// Submission Executor - High-Level Orchestration
///
/// **Responsibility:**
/// Coordinate harness, engine and evaluator to turn one claimed submission
/// into a verdict.
///
/// **Architecture:**
/// 1. Resolve the challenge from the catalog
/// 2. Harness the code once (harness.rs)
/// 3. Build once (engine.rs)
/// 4. Run every selected case sequentially, refreshing the claim after each
/// 5. Grade the outcomes (evaluator.rs)
///
/// Participant errors (compile, runtime, wrong answer, limits) become a
/// `completed` verdict. Anything else is returned as `Err` so the pool can
/// retry the submission.

use crate::engine::{Build, Limits, SandboxEngine};
use crate::evaluator::{self, TestOutcome};
use anyhow::{anyhow, Result};
use arbiter_common::challenge::ChallengeCatalog;
use arbiter_common::harness;
use arbiter_common::store::SubmissionStore;
use arbiter_common::types::{
    Challenge, ErrorType, ExecutionOutcome, Submission, SubmissionStatus, TestCase, Verdict,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// The worker no longer holds the claim; its result must not be written.
#[derive(Debug, thiserror::Error)]
#[error("claim on submission {0} was lost")]
pub struct ClaimLost(pub Uuid);

/// Seam between the worker pool and the judging pipeline.
#[async_trait]
pub trait SubmissionJudge: Send + Sync {
    async fn judge(&self, submission: &Submission, worker_id: &str) -> Result<Verdict>;
}

pub struct Judge {
    engine: Arc<SandboxEngine>,
    catalog: Arc<ChallengeCatalog>,
    store: Arc<dyn SubmissionStore>,
}

impl Judge {
    pub fn new(engine: Arc<SandboxEngine>, catalog: Arc<ChallengeCatalog>, store: Arc<dyn SubmissionStore>) -> Self {
        Self { engine, catalog, store }
    }

    /// Limits for one case: case timeout, then challenge limit, then language default.
    fn limits_for(&self, challenge: &Challenge, test_case: &TestCase, defaults: Limits) -> Limits {
        let time_limit = test_case
            .timeout_ms
            .or(challenge.time_limit_ms)
            .map_or(defaults.time_limit, Duration::from_millis);
        Limits {
            time_limit,
            memory_limit_mb: challenge.memory_limit_mb.unwrap_or(defaults.memory_limit_mb),
        }
    }
}

#[async_trait]
impl SubmissionJudge for Judge {
    #[tracing::instrument(
        skip(self, submission),
        fields(
            submission_id = %submission.id,
            language = %submission.language,
            mode = %submission.mode,
            worker_id = %worker_id
        )
    )]
    async fn judge(&self, submission: &Submission, worker_id: &str) -> Result<Verdict> {
        let challenge = self
            .catalog
            .get(&submission.challenge_id)
            .ok_or_else(|| anyhow!("challenge '{}' is not loaded on this worker", submission.challenge_id))?;

        let program = harness::prepare(submission.language, &submission.code, &challenge.function_name);
        let style = program.style;
        let cases = challenge.cases_for(submission.mode);
        info!(style = %style, test_count = cases.len(), "Judging submission");

        let artifact = match self.engine.build(&program).await? {
            Build::Ready(artifact) => artifact,
            Build::Failed(message) => {
                let outcomes = vec![TestOutcome {
                    test_id: cases.first().map_or(0, |tc| tc.id),
                    outcome: ExecutionOutcome::CompileError { message: message.clone() },
                }];
                let grade = evaluator::grade(challenge, submission.mode, style, &outcomes);
                return Ok(Verdict {
                    status: SubmissionStatus::Completed,
                    score: Some(grade.score),
                    execution_time_ms: Some(grade.execution_time_ms),
                    error_type: Some(ErrorType::CompileError),
                    error_message: Some(message),
                    harness_style: Some(style),
                    test_results: grade.results,
                });
            }
        };

        let defaults = self.engine.default_limits(submission.language)?;
        let mut outcomes = Vec::with_capacity(cases.len());

        for (idx, test_case) in cases.iter().enumerate() {
            let limits = self.limits_for(challenge, test_case, defaults);
            let stdin = harness::stdin_lines(style, &test_case.input);
            let outcome = self.engine.run(&artifact, &stdin, limits).await?;
            info!(
                test_num = idx + 1,
                test_id = test_case.id,
                outcome = outcome.label(),
                execution_ms = outcome.duration_ms(),
                "Test executed"
            );
            outcomes.push(TestOutcome {
                test_id: test_case.id,
                outcome,
            });

            if !self.store.touch(submission.id, worker_id).await? {
                warn!("Claim lost mid-judging, abandoning submission");
                return Err(ClaimLost(submission.id).into());
            }
        }

        let grade = evaluator::grade(challenge, submission.mode, style, &outcomes);
        info!(
            score = grade.score,
            passed = grade.passed,
            total = grade.total,
            execution_time_ms = grade.execution_time_ms,
            "Submission graded"
        );

        Ok(Verdict {
            status: SubmissionStatus::Completed,
            score: Some(grade.score),
            execution_time_ms: Some(grade.execution_time_ms),
            error_type: None,
            error_message: None,
            harness_style: Some(style),
            test_results: grade.results,
        })
    }
}
