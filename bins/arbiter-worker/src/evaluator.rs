/// Test Evaluator - Language-Agnostic Grading
///
/// **Core Responsibility:**
/// Compare raw execution outcomes against expected outputs and assign a score.
///
/// **Critical Properties:**
/// - Knows nothing about sandboxes, language runtimes or the queue
/// - Pure function: (challenge, mode, style, outcomes) → grade
/// - Running it twice over the same stored outcomes gives the same grade
///
/// **Scoring Rules:**
/// - Test-run mode evaluates sample cases only, submit mode evaluates all
/// - Each case has a weight (default 1.0)
/// - score = round(100 × passed_weight / total_weight)
/// - A compile error fails every evaluated case and scores 0
///
/// **Comparison Rules:**
/// - Function style: stdout is parsed as JSON and compared structurally;
///   numbers compare by value (`2` equals `2.0`), no float tolerance
/// - Input style: CRLF folded, trailing whitespace stripped per line,
///   leading and trailing blank lines ignored, otherwise exact and case
///   sensitive

use arbiter_common::harness::expected_text;
use arbiter_common::types::{
    Challenge, ExecutionOutcome, FailureKind, HarnessStyle, SubmissionMode, TestCase, TestResult,
};
use serde_json::Value;

const SCORE_SCALE: f64 = 100.0;

/// Raw outcome for one test case, produced by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct TestOutcome {
    pub test_id: u32,
    pub outcome: ExecutionOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Grade {
    pub score: u32,
    pub passed: usize,
    pub total: usize,
    pub execution_time_ms: u64,
    pub compile_error: Option<String>,
    pub results: Vec<TestResult>,
}

/// Normalize program output for input-style comparison.
///
/// **Normalization Rules:**
/// - `\r\n` becomes `\n`
/// - Trailing whitespace removed from every line
/// - Leading and trailing blank lines removed
///
/// **Preserves:**
/// - Leading whitespace on a line
/// - Case
/// - Blank lines between content
pub fn normalize_output(output: &str) -> String {
    let folded = output.replace("\r\n", "\n");
    let lines: Vec<&str> = folded.lines().map(str::trim_end).collect();
    let start = lines.iter().position(|l| !l.is_empty());
    let end = lines.iter().rposition(|l| !l.is_empty());
    match (start, end) {
        (Some(start), Some(end)) => lines[start..=end].join("\n"),
        _ => String::new(),
    }
}

/// Structural equality with numbers compared by value.
pub fn json_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
                return x == y;
            }
            if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
                return x == y;
            }
            match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| json_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len() && a.iter().all(|(k, v)| b.get(k).is_some_and(|w| json_equal(v, w)))
        }
        (a, b) => a == b,
    }
}

fn output_matches(style: HarnessStyle, stdout: &str, expected: &Value) -> bool {
    match style {
        HarnessStyle::Function => match serde_json::from_str::<Value>(stdout.trim()) {
            Ok(actual) => json_equal(&actual, expected),
            Err(_) => normalize_output(stdout) == normalize_output(&expected_text(expected)),
        },
        HarnessStyle::Input => normalize_output(stdout) == normalize_output(&expected_text(expected)),
    }
}

/// Evaluate a single test case outcome.
///
/// ## Arguments
/// * `test_case` - Expected test case definition
/// * `style` - Harness style the submission ran under
/// * `outcome` - Raw outcome, `None` when the case never ran
///
/// ## Returns
/// TestResult with pass flag and failure classification
pub fn evaluate_test(test_case: &TestCase, style: HarnessStyle, outcome: Option<&ExecutionOutcome>) -> TestResult {
    let (passed, classification, actual_output, stderr) = match outcome {
        None => (
            false,
            Some(FailureKind::RuntimeError),
            String::new(),
            "Test case was not executed".to_string(),
        ),
        Some(ExecutionOutcome::Success {
            stdout,
            stderr,
            truncated: true,
            ..
        }) => (false, Some(FailureKind::OutputLimitExceeded), stdout.clone(), stderr.clone()),
        Some(ExecutionOutcome::Success { stdout, stderr, .. }) => {
            if output_matches(style, stdout, &test_case.expected_output) {
                (true, None, stdout.clone(), stderr.clone())
            } else {
                (false, Some(FailureKind::WrongAnswer), stdout.clone(), stderr.clone())
            }
        }
        Some(ExecutionOutcome::Timeout { .. }) => (false, Some(FailureKind::Timeout), String::new(), String::new()),
        Some(ExecutionOutcome::MemoryExceeded { .. }) => {
            (false, Some(FailureKind::MemoryExceeded), String::new(), String::new())
        }
        Some(ExecutionOutcome::RuntimeError { message, stdout, .. }) => {
            (false, Some(FailureKind::RuntimeError), stdout.clone(), message.clone())
        }
        Some(ExecutionOutcome::CompileError { message }) => {
            (false, Some(FailureKind::CompileError), String::new(), message.clone())
        }
    };

    TestResult {
        test_case_id: test_case.id,
        visibility: test_case.visibility,
        passed,
        classification,
        actual_output,
        stderr,
        execution_time_ms: outcome.map_or(0, ExecutionOutcome::duration_ms),
    }
}

fn compile_error(outcomes: &[TestOutcome]) -> Option<&str> {
    outcomes.iter().find_map(|o| match &o.outcome {
        ExecutionOutcome::CompileError { message } => Some(message.as_str()),
        _ => None,
    })
}

/// Grade a submission from its stored outcomes.
///
/// Outcomes for cases outside the mode's selection are ignored, so hidden
/// cases never influence a test run.
pub fn grade(challenge: &Challenge, mode: SubmissionMode, style: HarnessStyle, outcomes: &[TestOutcome]) -> Grade {
    let cases = challenge.cases_for(mode);

    if let Some(message) = compile_error(outcomes) {
        let results = cases
            .iter()
            .map(|tc| TestResult {
                test_case_id: tc.id,
                visibility: tc.visibility,
                passed: false,
                classification: Some(FailureKind::CompileError),
                actual_output: String::new(),
                stderr: message.to_string(),
                execution_time_ms: 0,
            })
            .collect();
        return Grade {
            score: 0,
            passed: 0,
            total: cases.len(),
            execution_time_ms: 0,
            compile_error: Some(message.to_string()),
            results,
        };
    }

    let mut results = Vec::with_capacity(cases.len());
    let mut passed_weight = 0.0;
    let mut total_weight = 0.0;

    for test_case in &cases {
        let outcome = outcomes.iter().find(|o| o.test_id == test_case.id).map(|o| &o.outcome);
        let result = evaluate_test(test_case, style, outcome);
        total_weight += test_case.weight();
        if result.passed {
            passed_weight += test_case.weight();
        }
        results.push(result);
    }

    let score = if total_weight > 0.0 {
        (SCORE_SCALE * passed_weight / total_weight).round().clamp(0.0, SCORE_SCALE) as u32
    } else {
        0
    };

    let times = results.iter().map(|r| r.execution_time_ms);
    let execution_time_ms = match mode {
        SubmissionMode::Submit => times.sum(),
        SubmissionMode::TestRun => times.max().unwrap_or(0),
    };

    Grade {
        score,
        passed: results.iter().filter(|r| r.passed).count(),
        total: results.len(),
        execution_time_ms,
        compile_error: None,
        results,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_common::types::Visibility;
    use serde_json::json;

    fn make_test_case(id: u32, expected_output: Value, visibility: Visibility) -> TestCase {
        TestCase {
            id,
            name: None,
            input: vec![],
            expected_output,
            visibility,
            weight: None,
            timeout_ms: None,
        }
    }

    fn make_output(test_id: u32, stdout: &str, exec_time: u64) -> TestOutcome {
        TestOutcome {
            test_id,
            outcome: ExecutionOutcome::Success {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_code: 0,
                duration_ms: exec_time,
                truncated: false,
            },
        }
    }

    fn make_challenge(cases: Vec<TestCase>) -> Challenge {
        Challenge {
            id: "sum".to_string(),
            title: None,
            function_name: "solve".to_string(),
            max_score: 100,
            time_limit_ms: None,
            memory_limit_mb: None,
            test_cases: cases,
        }
    }

    /// Two samples followed by five hidden cases, all expecting "ok"
    fn seven_case_challenge() -> Challenge {
        make_challenge(
            (1..=7)
                .map(|id| {
                    let visibility = if id <= 2 { Visibility::Sample } else { Visibility::Hidden };
                    make_test_case(id, json!("ok"), visibility)
                })
                .collect(),
        )
    }

    #[test]
    fn test_normalize_output() {
        assert_eq!(normalize_output("  hello  "), "  hello");
        assert_eq!(normalize_output("\n\nhello\r\nworld  \n\n"), "hello\nworld");
        assert_eq!(normalize_output("a\n\nb"), "a\n\nb");
        assert_eq!(normalize_output("   \n"), "");
    }

    #[test]
    fn test_json_equal_numbers_by_value() {
        assert!(json_equal(&json!(2), &json!(2.0)));
        assert!(json_equal(&json!([1, [2.5, "x"]]), &json!([1.0, [2.5, "x"]])));
        assert!(!json_equal(&json!(0.1), &json!(0.10000001)));
        assert!(!json_equal(&json!("2"), &json!(2)));
        assert!(json_equal(&json!({"a": 1, "b": [true]}), &json!({"b": [true], "a": 1.0})));
        assert!(!json_equal(&json!({"a": 1}), &json!({"a": 1, "b": 2})));
    }

    #[test]
    fn test_five_of_seven_scores_71() {
        let challenge = seven_case_challenge();
        let outcomes: Vec<TestOutcome> = (1..=7)
            .map(|id| make_output(id, if id <= 5 { "ok" } else { "nope" }, 10))
            .collect();

        let grade = grade(&challenge, SubmissionMode::Submit, HarnessStyle::Input, &outcomes);
        assert_eq!(grade.score, 71);
        assert_eq!(grade.passed, 5);
        assert_eq!(grade.total, 7);
        assert_eq!(grade.execution_time_ms, 70);
        assert_eq!(
            grade.results[5].classification,
            Some(FailureKind::WrongAnswer)
        );
    }

    #[test]
    fn test_test_run_ignores_hidden_cases() {
        let challenge = seven_case_challenge();
        let outcomes: Vec<TestOutcome> = (1..=7).map(|id| make_output(id, "wrong", id as u64)).collect();
        let mut passing = outcomes.clone();
        passing[0] = make_output(1, "ok", 5);
        passing[1] = make_output(2, "ok", 9);

        let grade = grade(&challenge, SubmissionMode::TestRun, HarnessStyle::Input, &passing);
        assert_eq!(grade.total, 2);
        assert!(grade.results.iter().all(|r| r.visibility == Visibility::Sample));
        assert_eq!(grade.score, 100);
        // Test runs report the slowest case
        assert_eq!(grade.execution_time_ms, 9);
    }

    #[test]
    fn test_compile_error_fails_every_case() {
        let challenge = seven_case_challenge();
        let outcomes = vec![TestOutcome {
            test_id: 1,
            outcome: ExecutionOutcome::CompileError {
                message: "main.c:1: error: expected ';'".to_string(),
            },
        }];

        let grade = grade(&challenge, SubmissionMode::Submit, HarnessStyle::Input, &outcomes);
        assert_eq!(grade.score, 0);
        assert_eq!(grade.results.len(), 7);
        assert!(grade
            .results
            .iter()
            .all(|r| r.classification == Some(FailureKind::CompileError)));
        assert!(grade.compile_error.is_some());
    }

    #[test]
    fn test_failure_classifications() {
        let challenge = make_challenge(vec![
            make_test_case(1, json!(1), Visibility::Sample),
            make_test_case(2, json!(2), Visibility::Sample),
            make_test_case(3, json!(3), Visibility::Hidden),
            make_test_case(4, json!(4), Visibility::Hidden),
        ]);
        let outcomes = vec![
            TestOutcome {
                test_id: 1,
                outcome: ExecutionOutcome::Timeout { duration_ms: 2001 },
            },
            TestOutcome {
                test_id: 2,
                outcome: ExecutionOutcome::MemoryExceeded { duration_ms: 30 },
            },
            TestOutcome {
                test_id: 3,
                outcome: ExecutionOutcome::RuntimeError {
                    message: "ZeroDivisionError".to_string(),
                    stdout: String::new(),
                    duration_ms: 12,
                },
            },
            TestOutcome {
                test_id: 4,
                outcome: ExecutionOutcome::Success {
                    stdout: "4".repeat(10),
                    stderr: String::new(),
                    exit_code: 0,
                    duration_ms: 3,
                    truncated: true,
                },
            },
        ];

        let grade = grade(&challenge, SubmissionMode::Submit, HarnessStyle::Function, &outcomes);
        let kinds: Vec<_> = grade.results.iter().map(|r| r.classification).collect();
        assert_eq!(
            kinds,
            vec![
                Some(FailureKind::Timeout),
                Some(FailureKind::MemoryExceeded),
                Some(FailureKind::RuntimeError),
                Some(FailureKind::OutputLimitExceeded),
            ]
        );
        assert_eq!(grade.results[2].stderr, "ZeroDivisionError");
        assert_eq!(grade.score, 0);
    }

    #[test]
    fn test_missing_outcome_is_runtime_error() {
        let challenge = make_challenge(vec![
            make_test_case(1, json!("a"), Visibility::Sample),
            make_test_case(2, json!("b"), Visibility::Hidden),
        ]);
        let grade = grade(&challenge, SubmissionMode::Submit, HarnessStyle::Input, &[make_output(1, "a\n", 4)]);
        assert_eq!(grade.score, 50);
        assert_eq!(grade.results[1].classification, Some(FailureKind::RuntimeError));
    }

    #[test]
    fn test_function_style_compares_json() {
        let challenge = make_challenge(vec![
            make_test_case(1, json!(3), Visibility::Sample),
            make_test_case(2, json!([1, 2]), Visibility::Sample),
            make_test_case(3, json!("hi"), Visibility::Hidden),
        ]);
        let outcomes = vec![
            make_output(1, "3.0\n", 1),
            make_output(2, "[1, 2]\n", 1),
            make_output(3, "\"hi\"\n", 1),
        ];
        let grade = grade(&challenge, SubmissionMode::Submit, HarnessStyle::Function, &outcomes);
        assert_eq!(grade.score, 100);
    }

    #[test]
    fn test_input_style_renders_expected_values() {
        let challenge = make_challenge(vec![
            make_test_case(1, json!([1, 2, 3]), Visibility::Sample),
            make_test_case(2, json!(true), Visibility::Sample),
            make_test_case(3, json!("Hello"), Visibility::Hidden),
        ]);
        let outcomes = vec![
            make_output(1, "1 2 3\r\n", 1),
            make_output(2, "true\n", 1),
            make_output(3, "hello\n", 1),
        ];
        let grade = grade(&challenge, SubmissionMode::Submit, HarnessStyle::Input, &outcomes);
        assert!(grade.results[0].passed);
        assert!(grade.results[1].passed);
        // Case sensitive
        assert!(!grade.results[2].passed);
        assert_eq!(grade.score, 67);
    }

    #[test]
    fn test_weighted_score() {
        let mut heavy = make_test_case(2, json!("b"), Visibility::Hidden);
        heavy.weight = Some(3.0);
        let challenge = make_challenge(vec![make_test_case(1, json!("a"), Visibility::Sample), heavy]);
        let outcomes = vec![make_output(1, "a", 1), make_output(2, "b", 1)];
        let mut outcomes_half = outcomes.clone();
        outcomes_half[0] = make_output(1, "x", 1);

        assert_eq!(grade(&challenge, SubmissionMode::Submit, HarnessStyle::Input, &outcomes).score, 100);
        assert_eq!(grade(&challenge, SubmissionMode::Submit, HarnessStyle::Input, &outcomes_half).score, 75);
    }

    #[test]
    fn test_grading_is_idempotent() {
        let challenge = seven_case_challenge();
        let outcomes: Vec<TestOutcome> = (1..=7).map(|id| make_output(id, if id % 2 == 0 { "ok" } else { "no" }, 3)).collect();
        let first = grade(&challenge, SubmissionMode::Submit, HarnessStyle::Input, &outcomes);
        let second = grade(&challenge, SubmissionMode::Submit, HarnessStyle::Input, &outcomes);
        assert_eq!(first, second);
        assert!(first.score <= 100);
    }

    #[test]
    fn test_no_selected_cases_scores_zero() {
        let challenge = make_challenge(vec![make_test_case(1, json!("a"), Visibility::Hidden)]);
        let grade = grade(&challenge, SubmissionMode::TestRun, HarnessStyle::Input, &[]);
        assert_eq!(grade.total, 0);
        assert_eq!(grade.score, 0);
    }
}
