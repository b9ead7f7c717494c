// Language registry for the API
// Built from languages.json; decides which languages enqueue accepts

use arbiter_common::config::LanguagesFile;
use arbiter_common::types::Language;
use anyhow::Result;
use std::collections::HashSet;
use std::path::Path;

/// Registry of configured languages
/// This is the authoritative source for which languages are enabled
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    enabled_languages: HashSet<Language>,
}

impl LanguageRegistry {
    /// Load language configuration from languages.json
    pub fn load_from_file(path: &Path) -> Result<Self> {
        Ok(Self::from_file(&LanguagesFile::load(path)?))
    }

    pub fn from_file(file: &LanguagesFile) -> Self {
        Self {
            enabled_languages: file.enabled_languages(),
        }
    }

    pub fn enabled(&self) -> &HashSet<Language> {
        &self.enabled_languages
    }

    /// Enabled languages in declaration order
    pub fn enabled_languages(&self) -> Vec<Language> {
        Language::ALL
            .into_iter()
            .filter(|l| self.enabled_languages.contains(l))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_registry() {
        let registry = LanguageRegistry::load_from_file(Path::new("../../config/languages.json")).unwrap();
        assert!(registry.enabled().contains(&Language::Python));
        assert_eq!(registry.enabled_languages().len(), Language::ALL.len());
    }

    #[test]
    fn test_registry_only_enables_configured_languages() {
        let file = LanguagesFile::parse(
            r#"{"languages": [{
                "name": "javascript",
                "version": "20",
                "execution": { "command": "node", "file_extension": "js" },
                "timeout_ms": 5000,
                "memory_limit_mb": 256
            }]}"#,
        )
        .unwrap();
        let registry = LanguageRegistry::from_file(&file);
        assert!(registry.enabled().contains(&Language::JavaScript));
        assert!(!registry.enabled().contains(&Language::Python));
        assert_eq!(registry.enabled_languages(), vec![Language::JavaScript]);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(LanguageRegistry::load_from_file(Path::new("does/not/exist.json")).is_err());
    }
}
