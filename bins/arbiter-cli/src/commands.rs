// CLI commands for operating Arbiter
use anyhow::{bail, Context, Result};
use arbiter_common::challenge::{self, ChallengeCatalog, LoadedChallenge};
use arbiter_common::config::{LanguagesFile, Settings};
use arbiter_common::harness;
use arbiter_common::redis::RedisStore;
use arbiter_common::service::{self, EnqueueRequest, Intake, Viewer};
use arbiter_common::types::{HarnessStyle, Language, SubmissionMode};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// List all configured languages
pub fn list_languages(config_path: &Path) -> Result<()> {
    let file = LanguagesFile::load(config_path)?;

    println!("📋 Configured Languages:\n");
    println!(
        "{:<12} {:<10} {:<24} {:<10} {:<10} {:<10}",
        "Name", "Version", "Run", "Compiled", "Timeout", "Memory"
    );
    println!("{}", "─".repeat(80));

    for lang in &file.languages {
        println!(
            "{:<12} {:<10} {:<24} {:<10} {:<10} {} MB",
            lang.name,
            lang.version,
            lang.execution.command,
            if lang.compilation.is_some() { "yes" } else { "no" },
            format!("{}ms", lang.timeout_ms),
            lang.memory_limit_mb
        );
    }

    println!("\n✅ Total: {} language(s)", file.languages.len());
    Ok(())
}

/// Challenge files at `path`: the file itself, or every `*.json` in a directory.
fn challenge_files(path: &Path) -> Result<Vec<PathBuf>> {
    if !path.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut files: Vec<PathBuf> = fs::read_dir(path)
        .with_context(|| format!("Failed to read {}", path.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    Ok(files)
}

fn describe(loaded: &LoadedChallenge) -> String {
    let challenge = &loaded.challenge;
    let samples = challenge.test_cases.iter().filter(|tc| tc.is_sample()).count();
    format!(
        "{} (function '{}', {} sample / {} hidden)",
        challenge.id,
        challenge.function_name,
        samples,
        challenge.test_cases.len() - samples
    )
}

/// Validate one challenge file or a directory of them
pub fn validate_challenge(path: &Path) -> Result<()> {
    let files = challenge_files(path)?;
    if files.is_empty() {
        bail!("No challenge files found in {}", path.display());
    }

    let mut failures = 0;
    for file in &files {
        match challenge::load_file(file) {
            Ok(loaded) => {
                println!("✅ {}: {}", file.display(), describe(&loaded));
                for warning in &loaded.warnings {
                    println!("   ⚠️  {}", warning);
                }
            }
            Err(e) => {
                failures += 1;
                println!("❌ {}", e);
            }
        }
    }

    if failures > 0 {
        bail!("{} of {} challenge file(s) are invalid", failures, files.len());
    }
    println!("\n✅ {} challenge file(s) valid", files.len());
    Ok(())
}

#[derive(Debug)]
pub struct Detection {
    pub language: Language,
    pub style: HarnessStyle,
    pub entry: String,
    pub support_files: Vec<String>,
}

pub fn detection(language: Language, function_name: &str, code: &str) -> Detection {
    let program = harness::prepare(language, code, function_name);
    Detection {
        language,
        style: program.style,
        entry: program.entry,
        support_files: program.support.into_iter().map(|f| f.name).collect(),
    }
}

/// Show which harness a source file would be judged with
pub fn detect(language: &str, function_name: &str, file: &Path, show_entry: bool) -> Result<()> {
    let language: Language = language.parse()?;
    let code = fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let detected = detection(language, function_name, &code);

    println!("Language: {}", detected.language);
    println!("Style:    {}", detected.style);
    if !detected.support_files.is_empty() {
        println!("Support:  {}", detected.support_files.join(", "));
    }
    if show_entry {
        println!("\n{}", detected.entry);
    }
    Ok(())
}

pub struct EnqueueArgs<'a> {
    pub user: &'a str,
    pub challenge: &'a str,
    pub language: &'a str,
    pub file: &'a Path,
    pub mode: SubmissionMode,
}

/// Queue a submission directly through the store
pub async fn enqueue(settings: &Settings, args: EnqueueArgs<'_>) -> Result<()> {
    let catalog = ChallengeCatalog::load_dir(&settings.challenges_dir)?;
    let enabled = LanguagesFile::load(&settings.languages_file)?.enabled_languages();
    let code = fs::read_to_string(args.file).with_context(|| format!("Failed to read {}", args.file.display()))?;
    let store = RedisStore::connect(&settings.redis_url).await?;

    let intake = Intake {
        catalog: &catalog,
        enabled_languages: &enabled,
        limits: &settings.limits,
        policy: settings.queue_policy,
    };
    let request = EnqueueRequest {
        user_id: args.user.to_string(),
        challenge_id: args.challenge.to_string(),
        language: args.language.to_string(),
        code,
        mode: args.mode,
    };

    match service::enqueue(&store, &intake, request).await {
        Ok(id) => {
            println!("✅ Queued submission {}", id);
            Ok(())
        }
        Err(service::EnqueueError::UnknownChallenge(id)) => {
            let known: Vec<&str> = catalog.ids().collect();
            bail!("Unknown challenge '{}'. Loaded challenges: {}", id, known.join(", "))
        }
        Err(e) => Err(e.into()),
    }
}

/// Print a submission's status, optionally polling until it is terminal
pub async fn status(settings: &Settings, id: &str, user: Option<&str>, admin: bool, wait: bool) -> Result<()> {
    let id = Uuid::parse_str(id).context("Invalid submission id")?;
    let viewer = match (admin, user) {
        (true, _) => Viewer::Admin,
        (false, Some(user)) => Viewer::User(user.to_string()),
        (false, None) => Viewer::Anonymous,
    };
    let store = RedisStore::connect(&settings.redis_url).await?;

    loop {
        let Some(view) = service::get_status(&store, id, &viewer).await? else {
            bail!("Submission {} not found", id);
        };
        if !wait || view.status.is_terminal() {
            println!("{}", serde_json::to_string_pretty(&view)?);
            return Ok(());
        }
        eprintln!("⏳ {} ({})", view.status, id);
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_styles() {
        let function = detection(Language::Python, "solve", "def solve(a, b):\n    return a + b\n");
        assert_eq!(function.style, HarnessStyle::Function);
        assert_eq!(function.support_files, vec!["solution.py".to_string()]);

        let input = detection(Language::Python, "solve", "a = int(input())\nprint(a * 2)\n");
        assert_eq!(input.style, HarnessStyle::Input);
        assert!(input.support_files.is_empty());

        let compiled = detection(Language::Java, "solve", "public class Main { static int solve() { return 1; } }");
        assert_eq!(compiled.style, HarnessStyle::Input);
    }

    #[test]
    fn test_challenge_files_in_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.json"), "{}").unwrap();
        fs::write(dir.path().join("a.json"), "{}").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();

        let files = challenge_files(dir.path()).unwrap();
        let names: Vec<_> = files.iter().map(|p| p.file_name().unwrap().to_owned()).collect();
        assert_eq!(names, vec!["a.json", "b.json"]);
    }

    #[test]
    fn test_validate_repository_challenges() {
        validate_challenge(Path::new("../../challenges")).unwrap();
    }

    #[test]
    fn test_validate_reports_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.json"), r#"{"function_name": "", "test_cases": []}"#).unwrap();
        assert!(validate_challenge(dir.path()).is_err());
    }
}
