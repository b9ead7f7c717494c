// Shared configuration: environment settings and the languages.json table.

use crate::store::QueuePolicy;
use crate::types::Language;
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_LANGUAGES_FILE: &str = "config/languages.json";

/// Read an environment variable, falling back to `default` when unset.
pub fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("Invalid value for {}: {} ({})", key, raw, e)),
        _ => Ok(default),
    }
}

pub fn env_millis(key: &str, default_ms: u64) -> Result<Duration> {
    env_or(key, default_ms).map(Duration::from_millis)
}

/// Size limits applied at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionLimits {
    pub max_code_bytes: usize,
    pub max_code_lines: usize,
}

impl Default for SubmissionLimits {
    fn default() -> Self {
        Self {
            max_code_bytes: 51_200,
            max_code_lines: 1_000,
        }
    }
}

/// Settings shared by every binary.
#[derive(Debug, Clone)]
pub struct Settings {
    pub redis_url: String,
    pub challenges_dir: PathBuf,
    pub languages_file: PathBuf,
    pub queue_policy: QueuePolicy,
    pub limits: SubmissionLimits,
    pub max_retries: u32,
    pub stale_after: Duration,
    pub worker_liveness: Duration,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let defaults = SubmissionLimits::default();
        Ok(Self {
            redis_url: env_or("REDIS_URL", "redis://127.0.0.1:6379".to_string())?,
            challenges_dir: env_or("ARBITER_CHALLENGES_DIR", PathBuf::from("challenges"))?,
            languages_file: env_or("ARBITER_LANGUAGES_FILE", PathBuf::from(DEFAULT_LANGUAGES_FILE))?,
            queue_policy: env_or("ARBITER_QUEUE_POLICY", QueuePolicy::Fifo)?,
            limits: SubmissionLimits {
                max_code_bytes: env_or("ARBITER_MAX_CODE_BYTES", defaults.max_code_bytes)?,
                max_code_lines: env_or("ARBITER_MAX_CODE_LINES", defaults.max_code_lines)?,
            },
            max_retries: env_or("ARBITER_MAX_RETRIES", 2)?,
            stale_after: env_millis("ARBITER_STALE_AFTER_MS", 120_000)?,
            worker_liveness: env_millis("ARBITER_WORKER_LIVENESS_MS", 15_000)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageExecution {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub file_extension: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageCompilation {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_compile_timeout_ms() -> u64 {
    30_000
}

/// One entry of languages.json.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: String,
    pub version: String,
    pub execution: LanguageExecution,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compilation: Option<LanguageCompilation>,
    /// Default per-test wall-clock limit
    pub timeout_ms: u64,
    #[serde(default = "default_compile_timeout_ms")]
    pub compile_timeout_ms: u64,
    /// Memory available to the participant's program
    pub memory_limit_mb: u64,
    /// Extra address space the runtime itself needs on top of the limit
    #[serde(default)]
    pub runtime_overhead_mb: u64,
}

impl LanguageConfig {
    pub fn language(&self) -> Result<Language> {
        self.name.parse().map_err(|e| anyhow!("{}", e))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguagesFile {
    pub languages: Vec<LanguageConfig>,
}

impl LanguagesFile {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("Language config file not found: {}", path.display());
        }
        let content = fs::read_to_string(path).context("Failed to read languages.json")?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let file: LanguagesFile = serde_json::from_str(content).context("Failed to parse languages.json")?;
        let mut seen = HashSet::new();
        for config in &file.languages {
            let language = config
                .language()
                .with_context(|| format!("Unknown language '{}' in languages.json", config.name))?;
            if !seen.insert(language) {
                bail!("Language '{}' is configured twice", config.name);
            }
            if config.timeout_ms == 0 || config.memory_limit_mb == 0 {
                bail!("Language '{}' needs non-zero timeout_ms and memory_limit_mb", config.name);
            }
        }
        if seen.is_empty() {
            bail!("No languages configured in languages.json");
        }
        Ok(file)
    }

    pub fn enabled_languages(&self) -> HashSet<Language> {
        self.languages.iter().filter_map(|c| c.language().ok()).collect()
    }
}
