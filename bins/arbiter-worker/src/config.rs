// Worker configuration: language table plus environment settings
use anyhow::{anyhow, Result};
use arbiter_common::config::{env_millis, env_or, LanguageConfig, LanguagesFile, Settings};
use arbiter_common::types::Language;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Language configuration manager
#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    configs: HashMap<Language, LanguageConfig>,
}

impl LanguageConfigManager {
    /// Load language configurations from languages.json
    pub fn load(config_path: &Path) -> Result<Self> {
        Ok(Self::from_file(LanguagesFile::load(config_path)?))
    }

    pub fn from_file(file: LanguagesFile) -> Self {
        let configs = file
            .languages
            .into_iter()
            .filter_map(|c| c.language().ok().map(|l| (l, c)))
            .collect();
        Self { configs }
    }

    /// Get configuration for a specific language
    pub fn get_config(&self, language: Language) -> Result<&LanguageConfig> {
        self.configs
            .get(&language)
            .ok_or_else(|| anyhow!("No configuration found for language: {}", language))
    }

    /// List all supported languages
    pub fn list_languages(&self) -> Vec<Language> {
        let mut languages: Vec<Language> = self.configs.keys().copied().collect();
        languages.sort();
        languages
    }
}

/// Sandbox and pool settings, read once at startup.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub common: Settings,
    pub worker_count: usize,
    pub max_concurrent_executions: usize,
    pub poll_interval: Duration,
    pub submission_budget: Duration,
    pub sweep_interval: Duration,
    pub workspace_root: PathBuf,
    pub output_limit_bytes: usize,
    pub isolate_network: bool,
    pub isolate_filesystem: bool,
    pub sandbox_uid: Option<u32>,
    pub sandbox_gid: Option<u32>,
    pub http_addr: SocketAddr,
}

impl WorkerSettings {
    pub fn from_env() -> Result<Self> {
        let sandbox_uid: i64 = env_or("ARBITER_SANDBOX_UID", -1)?;
        let sandbox_gid: i64 = env_or("ARBITER_SANDBOX_GID", -1)?;

        let settings = Self {
            common: Settings::from_env()?,
            worker_count: env_or("ARBITER_WORKERS", 2)?,
            max_concurrent_executions: env_or("ARBITER_MAX_CONCURRENT_EXECUTIONS", 4)?,
            poll_interval: env_millis("ARBITER_POLL_INTERVAL_MS", 500)?,
            submission_budget: env_millis("ARBITER_SUBMISSION_BUDGET_MS", 90_000)?,
            sweep_interval: env_millis("ARBITER_SWEEP_INTERVAL_MS", 10_000)?,
            workspace_root: env_or("ARBITER_WORKSPACE_ROOT", std::env::temp_dir().join("arbiter"))?,
            output_limit_bytes: env_or("ARBITER_OUTPUT_LIMIT_BYTES", 1024 * 1024)?,
            isolate_network: env_or("ARBITER_ISOLATE_NETWORK", true)?,
            isolate_filesystem: env_or("ARBITER_ISOLATE_FILESYSTEM", true)?,
            sandbox_uid: u32::try_from(sandbox_uid).ok(),
            sandbox_gid: u32::try_from(sandbox_gid).ok(),
            http_addr: env_or("ARBITER_WORKER_HTTP_ADDR", SocketAddr::from(([0, 0, 0, 0], 9100)))?,
        };

        if settings.worker_count == 0 || settings.max_concurrent_executions == 0 {
            anyhow::bail!("ARBITER_WORKERS and ARBITER_MAX_CONCURRENT_EXECUTIONS must be at least 1");
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config() {
        let manager = LanguageConfigManager::load(Path::new("../../config/languages.json")).unwrap();
        assert_eq!(manager.list_languages(), Language::ALL.to_vec());
        let python = manager.get_config(Language::Python).unwrap();
        assert_eq!(python.execution.command, "python3");
        assert!(manager.get_config(Language::Cpp).unwrap().compilation.is_some());
    }

    #[test]
    fn test_missing_language() {
        let file = LanguagesFile::parse(
            r#"{"languages": [{"name": "c", "version": "12",
                "execution": {"command": "./solution", "file_extension": "c"},
                "timeout_ms": 1000, "memory_limit_mb": 64}]}"#,
        )
        .unwrap();
        let manager = LanguageConfigManager::from_file(file);
        assert!(manager.get_config(Language::Java).is_err());
    }
}
