/// Challenge Catalog - read-only challenge definitions
///
/// **Core Responsibility:**
/// Load challenge files from disk, validate them, and serve them by id.
///
/// **File Format:**
/// One JSON object per challenge (`<dir>/<id>.json`):
/// `function_name`, optional `id` / `title` / `max_score` / `time_limit_ms` /
/// `memory_limit_mb`, and a non-empty `test_cases` array. Each case carries
/// `input` (array of positional values, or a single value), `expected_output`
/// (or `output`), and optionally `id`, `name`, `is_sample` / `sample` /
/// `visibility`, `weight`, `timeout_ms`.
///
/// **Defaults:**
/// - Case ids default to their 1-based position
/// - The first two cases are samples unless a case says otherwise
/// - `max_score` defaults to 100

use crate::types::{Challenge, TestCase, Visibility};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid challenge {id}: {}", .errors.join("; "))]
    Invalid { id: String, errors: Vec<String> },
}

#[derive(Debug, Deserialize)]
struct RawChallenge {
    id: Option<String>,
    title: Option<String>,
    function_name: Option<String>,
    max_score: Option<u32>,
    time_limit_ms: Option<u64>,
    memory_limit_mb: Option<u64>,
    #[serde(default)]
    test_cases: Vec<RawTestCase>,
}

#[derive(Debug, Deserialize)]
struct RawTestCase {
    id: Option<i64>,
    name: Option<String>,
    input: Option<serde_json::Value>,
    #[serde(alias = "output")]
    expected_output: Option<serde_json::Value>,
    #[serde(alias = "sample")]
    is_sample: Option<serde_json::Value>,
    visibility: Option<Visibility>,
    weight: Option<f64>,
    timeout_ms: Option<i64>,
}

/// A validated challenge plus non-fatal authoring warnings.
#[derive(Debug, Clone)]
pub struct LoadedChallenge {
    pub challenge: Challenge,
    pub warnings: Vec<String>,
}

fn sample_flag(value: &serde_json::Value) -> Option<bool> {
    match value {
        serde_json::Value::Bool(b) => Some(*b),
        serde_json::Value::Number(n) => n.as_i64().map(|n| n != 0),
        serde_json::Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Validate and normalize a raw challenge document.
///
/// ## Arguments
/// * `fallback_id` - Id used when the document has no `id` (usually the file stem)
/// * `json` - Challenge document text
///
/// ## Returns
/// The normalized challenge with warnings, or every validation error found
pub fn parse_challenge(fallback_id: &str, json: &str, path: &Path) -> Result<LoadedChallenge, CatalogError> {
    let raw: RawChallenge = serde_json::from_str(json).map_err(|source| CatalogError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let id = raw
        .id
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| fallback_id.to_string());
    let mut errors = Vec::new();

    let function_name = raw.function_name.map(|s| s.trim().to_string()).unwrap_or_default();
    if function_name.is_empty() {
        errors.push("function_name must be a non-empty string".to_string());
    } else if !is_identifier(&function_name) {
        errors.push(format!("function_name '{}' is not a valid identifier", function_name));
    }
    if raw.test_cases.is_empty() {
        errors.push("test_cases must be a non-empty array".to_string());
    }
    if raw.time_limit_ms == Some(0) {
        errors.push("time_limit_ms must be > 0".to_string());
    }
    if raw.memory_limit_mb == Some(0) {
        errors.push("memory_limit_mb must be > 0".to_string());
    }

    let mut seen = HashSet::new();
    let mut test_cases = Vec::with_capacity(raw.test_cases.len());

    for (idx, tc) in raw.test_cases.into_iter().enumerate() {
        let case_id = tc.id.unwrap_or(idx as i64 + 1);
        if case_id <= 0 || case_id > u32::MAX as i64 {
            errors.push(format!("test_cases[{}].id must be > 0", idx));
            continue;
        }
        let case_id = case_id as u32;
        if !seen.insert(case_id) {
            errors.push(format!("duplicate test case id: {}", case_id));
        }

        let input = match tc.input {
            None => {
                errors.push(format!("test_cases[{}].input is required", idx));
                Vec::new()
            }
            Some(serde_json::Value::Array(values)) => values,
            Some(single) => vec![single],
        };
        let expected_output = match tc.expected_output {
            Some(v) => v,
            None => {
                errors.push(format!("test_cases[{}].output is required", idx));
                serde_json::Value::Null
            }
        };

        let visibility = match (tc.visibility, tc.is_sample.as_ref()) {
            (Some(v), _) => v,
            (None, Some(flag)) => match sample_flag(flag) {
                Some(true) => Visibility::Sample,
                Some(false) => Visibility::Hidden,
                None => {
                    errors.push(format!("test_cases[{}].is_sample must be a boolean", idx));
                    Visibility::Hidden
                }
            },
            (None, None) if idx < 2 => Visibility::Sample,
            (None, None) => Visibility::Hidden,
        };

        if let Some(w) = tc.weight {
            if w <= 0.0 || !w.is_finite() {
                errors.push(format!("test_cases[{}].weight must be > 0", idx));
            }
        }
        let timeout_ms = match tc.timeout_ms {
            Some(t) if t <= 0 => {
                errors.push(format!("test_cases[{}].timeout_ms must be > 0", idx));
                None
            }
            Some(t) => Some(t as u64),
            None => None,
        };
        let name = match tc.name {
            Some(n) if n.trim().is_empty() => {
                errors.push(format!("test_cases[{}].name must be a non-empty string", idx));
                None
            }
            Some(n) => Some(n.trim().to_string()),
            None => None,
        };

        test_cases.push(TestCase {
            id: case_id,
            name,
            input,
            expected_output,
            visibility,
            weight: tc.weight,
            timeout_ms,
        });
    }

    if !errors.is_empty() {
        return Err(CatalogError::Invalid { id, errors });
    }

    let samples = test_cases.iter().filter(|tc| tc.is_sample()).count();
    let hidden = test_cases.len() - samples;
    let mut warnings = Vec::new();
    if samples == 0 {
        warnings.push("No sample test cases defined. Participants will have limited run feedback.".to_string());
    }
    if hidden < 2 {
        warnings.push("Too few hidden test cases. Consider adding more for robust grading.".to_string());
    }

    Ok(LoadedChallenge {
        challenge: Challenge {
            id,
            title: raw.title.map(|t| t.trim().to_string()),
            function_name,
            max_score: raw.max_score.unwrap_or(100),
            time_limit_ms: raw.time_limit_ms,
            memory_limit_mb: raw.memory_limit_mb,
            test_cases,
        },
        warnings,
    })
}

/// Load and validate a single challenge file.
pub fn load_file(path: &Path) -> Result<LoadedChallenge, CatalogError> {
    let content = fs::read_to_string(path).map_err(|source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    parse_challenge(&stem, &content, path)
}

/// In-memory catalog keyed by challenge id.
#[derive(Debug, Clone, Default)]
pub struct ChallengeCatalog {
    challenges: BTreeMap<String, Challenge>,
}

impl ChallengeCatalog {
    /// Load every `*.json` file in a directory.
    ///
    /// Invalid files are skipped with a warning so one bad challenge does not
    /// take the judge down; use `load_file` to surface the errors.
    pub fn load_dir(dir: &Path) -> Result<Self, CatalogError> {
        let entries = fs::read_dir(dir).map_err(|source| CatalogError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|ext| ext == "json").unwrap_or(false))
            .collect();
        paths.sort();

        let mut catalog = Self::default();
        for path in paths {
            match load_file(&path) {
                Ok(loaded) => {
                    for warning in &loaded.warnings {
                        warn!(challenge_id = %loaded.challenge.id, "{}", warning);
                    }
                    catalog.insert(loaded.challenge);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping invalid challenge"),
            }
        }

        info!(count = catalog.len(), dir = %dir.display(), "Challenge catalog loaded");
        Ok(catalog)
    }

    pub fn insert(&mut self, challenge: Challenge) {
        self.challenges.insert(challenge.id.clone(), challenge);
    }

    pub fn get(&self, id: &str) -> Option<&Challenge> {
        self.challenges.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.challenges.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.challenges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.challenges.is_empty()
    }
}

impl FromIterator<Challenge> for ChallengeCatalog {
    fn from_iter<I: IntoIterator<Item = Challenge>>(iter: I) -> Self {
        let mut catalog = Self::default();
        for challenge in iter {
            catalog.insert(challenge);
        }
        catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<LoadedChallenge, CatalogError> {
        parse_challenge("question1", json, Path::new("question1.json"))
    }

    #[test]
    fn test_defaults_applied() {
        let loaded = parse(
            r#"{
                "function_name": "solve",
                "test_cases": [
                    {"input": [1, 2], "output": 3},
                    {"input": [2, 2], "output": 4},
                    {"input": [5, 5], "output": 10},
                    {"input": 7, "output": 7, "weight": 2.5, "timeout_ms": 500}
                ]
            }"#,
        )
        .unwrap();

        let c = &loaded.challenge;
        assert_eq!(c.id, "question1");
        assert_eq!(c.max_score, 100);
        assert_eq!(c.test_cases.iter().map(|t| t.id).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert!(c.test_cases[0].is_sample());
        assert!(c.test_cases[1].is_sample());
        assert!(!c.test_cases[2].is_sample());
        assert_eq!(c.test_cases[3].input, vec![serde_json::json!(7)]);
        assert_eq!(c.test_cases[3].weight(), 2.5);
        assert_eq!(c.test_cases[3].timeout_ms, Some(500));
        assert!(loaded.warnings.is_empty());
    }

    #[test]
    fn test_explicit_sample_flags() {
        let loaded = parse(
            r#"{
                "function_name": "solve",
                "test_cases": [
                    {"input": [1], "output": 1, "is_sample": false},
                    {"input": [2], "output": 2, "sample": "yes"},
                    {"input": [3], "output": 3, "visibility": "hidden"}
                ]
            }"#,
        )
        .unwrap();
        let vis: Vec<Visibility> = loaded.challenge.test_cases.iter().map(|t| t.visibility).collect();
        assert_eq!(vis, vec![Visibility::Hidden, Visibility::Sample, Visibility::Hidden]);
    }

    #[test]
    fn test_rejects_bad_documents() {
        let err = parse(r#"{"function_name": "", "test_cases": []}"#).unwrap_err();
        match err {
            CatalogError::Invalid { errors, .. } => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {other}"),
        }

        let err = parse(
            r#"{"function_name": "solve", "test_cases": [
                {"id": 1, "input": [1], "output": 1},
                {"id": 1, "input": [2], "output": 2, "weight": 0}
            ]}"#,
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("duplicate test case id: 1"));
        assert!(msg.contains("weight must be > 0"));

        assert!(parse(r#"{"function_name": "x; import os", "test_cases": [{"input": [], "output": 1}]}"#).is_err());
        assert!(matches!(parse("not json"), Err(CatalogError::Parse { .. })));
    }

    #[test]
    fn test_warnings_for_thin_suites() {
        let loaded = parse(
            r#"{"function_name": "solve", "test_cases": [
                {"input": [1], "output": 1, "is_sample": false}
            ]}"#,
        )
        .unwrap();
        assert_eq!(loaded.warnings.len(), 2);
    }

    #[test]
    fn test_load_dir_skips_invalid_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("sum.json"),
            r#"{"function_name": "solve", "test_cases": [{"input": [1, 2], "output": 3}]}"#,
        )
        .unwrap();
        fs::write(dir.path().join("broken.json"), "{").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let catalog = ChallengeCatalog::load_dir(dir.path()).unwrap();
        assert_eq!(catalog.len(), 1);
        assert!(catalog.get("sum").is_some());
        assert!(catalog.get("broken").is_none());
    }

    #[test]
    fn test_identifier_check() {
        assert!(is_identifier("two_sum"));
        assert!(is_identifier("_x1"));
        assert!(!is_identifier("1abc"));
        assert!(!is_identifier("a-b"));
        assert!(!is_identifier(""));
    }
}
