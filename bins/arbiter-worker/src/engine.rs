/// Sandbox Engine - Build and Run Untrusted Programs
///
/// **Core Responsibility:**
/// Turn a harnessed program into an artifact once, then run that artifact
/// once per test case and classify each run into an `ExecutionOutcome`.
///
/// **Critical Architectural Boundary:**
/// - Engine knows HOW to execute (process sandbox, rlimits, namespaces)
/// - Engine does NOT know scoring rules
/// - Engine does NOT evaluate correctness
/// - Engine returns raw outcomes for the Evaluator to judge
///
/// **Safety Guarantees:**
/// - Every compile and every run happens in a fresh private directory that is
///   removed on drop, whatever the exit path
/// - Every spawn holds a limiter permit for its whole lifetime
/// - Hard wall-clock timeout kills the whole process group
/// - With filesystem isolation, a program can only write inside its own
///   directory
/// - Memory verdicts come from the sandbox's measurements, never from the
///   signal alone
/// - Host paths never reach participant-visible messages
/// - Infrastructure faults come back as `Err`, never as participant outcomes

use crate::config::{LanguageConfigManager, WorkerSettings};
use crate::languages::{adapter_for, CommandSpec, LanguageAdapter, SourceLayout};
use crate::limiter::ExecutionLimiter;
use crate::metrics;
use crate::sandbox::{self, ChildLimits, ChildSetup, Finished, Invocation};
use anyhow::{bail, Context, Result};
use arbiter_common::harness::HarnessedProgram;
use arbiter_common::types::{ExecutionOutcome, Language};
use lazy_static::lazy_static;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info, warn};

const MIB: u64 = 1024 * 1024;
/// Output ceiling for compiler diagnostics
const COMPILE_OUTPUT_LIMIT: usize = 64 * 1024;
/// Largest file a compiler may write
const COMPILE_FILE_LIMIT: u64 = 256 * MIB;
/// Characters of stderr kept in a runtime error message
const MESSAGE_TAIL_CHARS: usize = 4096;
const SANDBOX_MAX_PROCESSES: u64 = 256;
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

lazy_static! {
    /// gcc / javac `error:`, mcs `error CS1002:`
    static ref COMPILER_ERROR: Regex = Regex::new(r"\berror(?:\s+CS\d+)?:").expect("valid compiler error pattern");
}

/// Per-run resource limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub time_limit: Duration,
    pub memory_limit_mb: u64,
}

/// Sandbox knobs that come from the worker environment.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub workspace_root: PathBuf,
    pub output_limit_bytes: usize,
    pub isolate_network: bool,
    pub isolate_filesystem: bool,
    pub sandbox_user: Option<(u32, u32)>,
}

impl EngineSettings {
    pub fn from_worker(settings: &WorkerSettings) -> Self {
        Self {
            workspace_root: settings.workspace_root.clone(),
            output_limit_bytes: settings.output_limit_bytes,
            isolate_network: settings.isolate_network,
            isolate_filesystem: settings.isolate_filesystem,
            sandbox_user: settings.sandbox_uid.zip(settings.sandbox_gid.or(settings.sandbox_uid)),
        }
    }
}

/// A built program, ready to be copied into a run directory.
///
/// Holds the build directory; dropping the artifact removes it.
#[derive(Debug)]
pub struct Artifact {
    language: Language,
    layout: SourceLayout,
    build_dir: TempDir,
}

#[derive(Debug)]
pub enum Build {
    Ready(Artifact),
    /// Participant-visible compiler diagnostics
    Failed(String),
}

pub struct SandboxEngine {
    languages: Arc<LanguageConfigManager>,
    limiter: ExecutionLimiter,
    settings: EngineSettings,
    base_path: String,
}

/// Removes host-specific directory prefixes from participant-visible text.
fn scrub(text: &str, dirs: &[&Path]) -> String {
    let mut scrubbed = text.to_string();
    for dir in dirs {
        let dir = dir.display().to_string();
        if dir.is_empty() {
            continue;
        }
        scrubbed = scrubbed.replace(&format!("{}/", dir), "").replace(&dir, ".");
    }
    scrubbed
}

fn tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

/// Copy every regular file and directory under `from` into `to`.
fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Hand a directory tree over to the sandbox user.
fn chown_tree(path: &Path, uid: u32, gid: u32) -> std::io::Result<()> {
    std::os::unix::fs::chown(path, Some(uid), Some(gid))?;
    if path.is_dir() {
        for entry in fs::read_dir(path)? {
            chown_tree(&entry?.path(), uid, gid)?;
        }
    }
    Ok(())
}

impl SandboxEngine {
    pub fn new(languages: Arc<LanguageConfigManager>, limiter: ExecutionLimiter, mut settings: EngineSettings) -> Result<Self> {
        fs::create_dir_all(&settings.workspace_root).with_context(|| {
            format!("Failed to create workspace root {}", settings.workspace_root.display())
        })?;
        // Sandboxed programs only ever see the resolved path
        settings.workspace_root = fs::canonicalize(&settings.workspace_root)
            .with_context(|| format!("Failed to resolve workspace root {}", settings.workspace_root.display()))?;
        Ok(Self {
            languages,
            limiter,
            settings,
            base_path: std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string()),
        })
    }

    pub fn limiter(&self) -> &ExecutionLimiter {
        &self.limiter
    }

    /// Run a trivial command under the configured isolation.
    pub async fn verify_isolation(&self) -> Result<()> {
        let dir = self.new_dir("check-")?;
        let command = CommandSpec::new("/bin/sh").args(["-c", "exit 0"]);
        let base_env = self.base_env(dir.path());
        let finished = {
            let _permit = self.limiter.acquire().await?;
            sandbox::run(Invocation {
                command: &command,
                dir: dir.path(),
                base_env: &base_env,
                stdin: Vec::new(),
                wall_limit: Duration::from_secs(5),
                output_limit: 1024,
                setup: self.child_setup(ChildLimits {
                    memory_bytes: None,
                    memory_rlimit: None,
                    cpu_seconds: 5,
                    file_size_bytes: 0,
                    max_processes: None,
                }),
                scratch: None,
            })
            .await?
        };
        if !finished.status.success() {
            bail!("Sandbox self-check exited with {}: {}", finished.status, finished.stderr_text().trim());
        }
        Ok(())
    }

    /// Default limits for a language, overridden per challenge by the caller.
    pub fn default_limits(&self, language: Language) -> Result<Limits> {
        let config = self.languages.get_config(language)?;
        Ok(Limits {
            time_limit: Duration::from_millis(config.timeout_ms),
            memory_limit_mb: config.memory_limit_mb,
        })
    }

    fn new_dir(&self, prefix: &str) -> Result<TempDir> {
        let dir = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(&self.settings.workspace_root)
            .context("Failed to create sandbox directory")?;
        if let Some((uid, gid)) = self.settings.sandbox_user {
            chown_tree(dir.path(), uid, gid).context("Failed to hand sandbox directory to sandbox user")?;
        }
        Ok(dir)
    }

    fn base_env(&self, dir: &Path) -> Vec<(String, String)> {
        let dir = dir.display().to_string();
        vec![
            ("PATH".to_string(), self.base_path.clone()),
            ("HOME".to_string(), dir.clone()),
            ("TMPDIR".to_string(), dir),
            ("LANG".to_string(), "C.UTF-8".to_string()),
        ]
    }

    fn child_setup(&self, limits: ChildLimits) -> ChildSetup {
        ChildSetup {
            limits: ChildLimits {
                max_processes: self.settings.sandbox_user.map(|_| SANDBOX_MAX_PROCESSES),
                ..limits
            },
            isolate_network: self.settings.isolate_network,
            isolate_filesystem: self.settings.isolate_filesystem,
            user: self.settings.sandbox_user,
        }
    }

    /// Write sources and run the compile (or syntax check) step.
    ///
    /// ## Arguments
    /// * `program` - Harnessed program from the harness detector
    ///
    /// ## Returns
    /// `Build::Ready` with the artifact, or `Build::Failed` with diagnostics
    #[tracing::instrument(skip(self, program), fields(language = %program.language, style = %program.style))]
    pub async fn build(&self, program: &HarnessedProgram) -> Result<Build> {
        let adapter = adapter_for(program.language);
        let config = self.languages.get_config(program.language)?;

        let build_dir = self.new_dir("build-")?;
        let layout = SourceLayout {
            entry_file: adapter.entry_file(&program.entry, config),
            support_files: program.support.iter().map(|f| f.name.clone()).collect(),
        };
        fs::write(build_dir.path().join(&layout.entry_file), &program.entry).context("Failed to write entry source")?;
        for file in &program.support {
            fs::write(build_dir.path().join(&file.name), &file.contents).context("Failed to write support source")?;
        }
        if let Some((uid, gid)) = self.settings.sandbox_user {
            chown_tree(build_dir.path(), uid, gid).context("Failed to hand sources to sandbox user")?;
        }

        let Some(command) = adapter.compile_command(config, &layout) else {
            return Ok(Build::Ready(Artifact {
                language: program.language,
                layout,
                build_dir,
            }));
        };

        let compile_limit = Duration::from_millis(config.compile_timeout_ms);
        let base_env = self.base_env(build_dir.path());
        let finished = {
            let _permit = self.limiter.acquire().await?;
            sandbox::run(Invocation {
                command: &command,
                dir: build_dir.path(),
                base_env: &base_env,
                stdin: Vec::new(),
                wall_limit: compile_limit,
                output_limit: COMPILE_OUTPUT_LIMIT,
                setup: self.child_setup(ChildLimits {
                    memory_bytes: None,
                    memory_rlimit: None,
                    cpu_seconds: compile_limit.as_secs() + 1,
                    file_size_bytes: COMPILE_FILE_LIMIT,
                    max_processes: None,
                }),
                scratch: None,
            })
            .await?
        };
        metrics::EXECUTION_DURATION
            .with_label_values(&[program.language.as_str(), "compile"])
            .observe(finished.duration.as_secs_f64());

        let diagnostics = scrub(
            format!("{}{}", finished.stderr_text(), finished.stdout_text()).trim(),
            &[build_dir.path(), &self.settings.workspace_root],
        );

        let failure = if finished.timed_out {
            Some(format!("Compilation timed out after {}ms", config.compile_timeout_ms))
        } else if !finished.status.success() || COMPILER_ERROR.is_match(&diagnostics) {
            Some(if diagnostics.is_empty() {
                "Compilation failed".to_string()
            } else {
                diagnostics
            })
        } else {
            match adapter.artifact(&layout) {
                Some(name) if !build_dir.path().join(&name).exists() => {
                    Some(format!("Compilation produced no {}", name))
                }
                _ => None,
            }
        };

        info!(
            compilation_time_ms = finished.duration.as_millis() as u64,
            success = failure.is_none(),
            "Compilation finished"
        );

        Ok(match failure {
            Some(message) => {
                metrics::EXECUTIONS_TOTAL
                    .with_label_values(&[program.language.as_str(), "compile_error"])
                    .inc();
                Build::Failed(message)
            }
            None => Build::Ready(Artifact {
                language: program.language,
                layout,
                build_dir,
            }),
        })
    }

    /// Run a built artifact once against one test input.
    #[tracing::instrument(
        skip(self, artifact, stdin_lines),
        fields(language = %artifact.language, time_limit_ms = limits.time_limit.as_millis() as u64)
    )]
    pub async fn run(&self, artifact: &Artifact, stdin_lines: &[String], limits: Limits) -> Result<ExecutionOutcome> {
        let adapter = adapter_for(artifact.language);
        let config = self.languages.get_config(artifact.language)?;

        let run_dir = self.new_dir("run-")?;
        copy_tree(artifact.build_dir.path(), run_dir.path()).context("Failed to stage artifact")?;
        if let Some((uid, gid)) = self.settings.sandbox_user {
            chown_tree(run_dir.path(), uid, gid).context("Failed to hand artifact to sandbox user")?;
        }

        let command = adapter.run_command(config, &artifact.layout, limits.memory_limit_mb);
        let memory_bytes = (limits.memory_limit_mb + config.runtime_overhead_mb) * MIB;
        let mut stdin = stdin_lines.join("\n");
        stdin.push('\n');
        let base_env = self.base_env(run_dir.path());
        let run_path = run_dir.path().to_path_buf();

        let finished = {
            let _permit = self.limiter.acquire().await?;
            sandbox::run(Invocation {
                command: &command,
                dir: &run_path,
                base_env: &base_env,
                stdin: stdin.into_bytes(),
                wall_limit: limits.time_limit,
                output_limit: self.settings.output_limit_bytes,
                setup: self.child_setup(ChildLimits {
                    memory_bytes: Some(memory_bytes),
                    memory_rlimit: adapter.memory_rlimit(),
                    cpu_seconds: limits.time_limit.as_secs() + 1,
                    file_size_bytes: self.settings.output_limit_bytes as u64,
                    max_processes: None,
                }),
                scratch: Some(run_dir),
            })
            .await?
        };

        let outcome = classify(
            adapter,
            &finished,
            &[&run_path, artifact.build_dir.path(), &self.settings.workspace_root],
        );

        metrics::EXECUTIONS_TOTAL
            .with_label_values(&[artifact.language.as_str(), outcome.label()])
            .inc();
        metrics::EXECUTION_DURATION
            .with_label_values(&[artifact.language.as_str(), "run"])
            .observe(finished.duration.as_secs_f64());

        match &outcome {
            ExecutionOutcome::Success { .. } => debug!(duration_ms = outcome.duration_ms(), "Run succeeded"),
            other => warn!(outcome = other.label(), duration_ms = other.duration_ms(), "Run did not succeed"),
        }
        Ok(outcome)
    }

    /// Build and run in one step.
    pub async fn execute(&self, program: &HarnessedProgram, stdin_lines: &[String], limits: Limits) -> Result<ExecutionOutcome> {
        match self.build(program).await? {
            Build::Ready(artifact) => self.run(&artifact, stdin_lines, limits).await,
            Build::Failed(message) => Ok(ExecutionOutcome::CompileError { message }),
        }
    }
}

/// Map a finished process to an outcome.
///
/// A SIGKILL on its own says nothing: it is a time verdict only when the CPU
/// budget is spent, and a memory verdict only with the watchdog's kill, a
/// measured peak at the ceiling or a runtime's out-of-memory report.
fn classify(adapter: &dyn LanguageAdapter, finished: &Finished, dirs: &[&Path]) -> ExecutionOutcome {
    let duration_ms = finished.duration.as_millis() as u64;
    if finished.timed_out {
        return ExecutionOutcome::Timeout { duration_ms };
    }
    if finished.memory_killed {
        return ExecutionOutcome::MemoryExceeded { duration_ms };
    }

    let signal = finished.signal();
    if signal == Some(libc::SIGXCPU) || (signal == Some(libc::SIGKILL) && finished.cpu_exhausted()) {
        return ExecutionOutcome::Timeout { duration_ms };
    }

    let stderr = finished.stderr_text();
    let out_of_memory = finished.over_memory() || adapter.oom_markers().iter().any(|marker| stderr.contains(marker));
    if out_of_memory && !finished.status.success() {
        return ExecutionOutcome::MemoryExceeded { duration_ms };
    }

    let stdout = finished.stdout_text();
    if !finished.status.success() {
        let trimmed = stderr.trim();
        let message = if !trimmed.is_empty() {
            scrub(tail(trimmed, MESSAGE_TAIL_CHARS), dirs)
        } else if let Some(signal) = finished.signal() {
            format!("Killed by {}", sandbox::signal_name(signal))
        } else {
            format!("Exited with code {}", finished.status.code().unwrap_or(-1))
        };
        return ExecutionOutcome::RuntimeError {
            message,
            stdout,
            duration_ms,
        };
    }

    ExecutionOutcome::Success {
        stdout,
        stderr: scrub(&stderr, dirs),
        exit_code: 0,
        duration_ms,
        truncated: finished.stdout_truncated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    const LIMIT: u64 = 128 * MIB;

    fn finished(raw_status: i32) -> Finished {
        Finished {
            stdout: Vec::new(),
            stderr: Vec::new(),
            stdout_truncated: false,
            status: ExitStatus::from_raw(raw_status),
            timed_out: false,
            memory_killed: false,
            peak_memory_bytes: 2 * MIB,
            cpu_time: Duration::from_millis(20),
            duration: Duration::from_millis(25),
            limits: ChildLimits {
                memory_bytes: Some(LIMIT),
                memory_rlimit: None,
                cpu_seconds: 3,
                file_size_bytes: MIB,
                max_processes: None,
            },
        }
    }

    fn classify_native(finished: &Finished) -> ExecutionOutcome {
        classify(adapter_for(Language::C), finished, &[])
    }

    #[test]
    fn test_plain_sigkill_is_a_runtime_error() {
        match classify_native(&finished(libc::SIGKILL)) {
            ExecutionOutcome::RuntimeError { message, .. } => assert_eq!(message, "Killed by SIGKILL"),
            other => panic!("expected runtime error, got {:?}", other),
        }
    }

    #[test]
    fn test_cpu_hard_limit_kill_is_a_timeout() {
        let mut killed = finished(libc::SIGKILL);
        killed.cpu_time = Duration::from_millis(4010);
        assert!(matches!(classify_native(&killed), ExecutionOutcome::Timeout { .. }));
        assert!(matches!(classify_native(&finished(libc::SIGXCPU)), ExecutionOutcome::Timeout { .. }));
    }

    #[test]
    fn test_memory_evidence_decides_memory_exceeded() {
        let mut watched = finished(libc::SIGKILL);
        watched.memory_killed = true;
        assert!(matches!(classify_native(&watched), ExecutionOutcome::MemoryExceeded { .. }));

        // Died between samples with a peak at the ceiling
        let mut segv = finished(libc::SIGSEGV);
        segv.peak_memory_bytes = LIMIT;
        assert!(matches!(classify_native(&segv), ExecutionOutcome::MemoryExceeded { .. }));

        match classify_native(&finished(libc::SIGSEGV)) {
            ExecutionOutcome::RuntimeError { message, .. } => assert_eq!(message, "Killed by SIGSEGV"),
            other => panic!("expected runtime error, got {:?}", other),
        }
    }

    #[test]
    fn test_runtime_oom_report_is_memory_exceeded() {
        let mut thrown = finished(1 << 8);
        thrown.stderr = b"terminate called after throwing an instance of 'std::bad_alloc'".to_vec();
        assert!(matches!(
            classify(adapter_for(Language::Cpp), &thrown, &[]),
            ExecutionOutcome::MemoryExceeded { .. }
        ));
    }

    #[test]
    fn test_successful_run_is_not_reclassified() {
        let mut ok = finished(0);
        ok.peak_memory_bytes = LIMIT;
        ok.stdout = b"3\n".to_vec();
        match classify_native(&ok) {
            ExecutionOutcome::Success { stdout, .. } => assert_eq!(stdout, "3\n"),
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[test]
    fn test_scrub_removes_workspace_paths() {
        let dir = Path::new("/tmp/arbiter/run-abc123");
        let text = "Traceback:\n  File \"/tmp/arbiter/run-abc123/main.py\", line 3\n cwd=/tmp/arbiter/run-abc123";
        let scrubbed = scrub(text, &[dir]);
        assert!(!scrubbed.contains("/tmp/arbiter"));
        assert!(scrubbed.contains("\"main.py\""));
        assert!(scrubbed.ends_with("cwd=."));
    }

    #[test]
    fn test_tail_keeps_last_characters() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 3), "ab");
        assert_eq!(tail("ééé", 2), "éé");
    }

    #[test]
    fn test_compiler_error_pattern() {
        assert!(COMPILER_ERROR.is_match("main.c:1:1: error: expected ';'"));
        assert!(COMPILER_ERROR.is_match("main.cs(3,1): error CS1525: Unexpected symbol"));
        assert!(!COMPILER_ERROR.is_match("main.c:2:5: warning: unused variable 'error_count'"));
    }

    #[test]
    fn test_copy_tree() {
        let from = tempfile::tempdir().unwrap();
        let to = tempfile::tempdir().unwrap();
        fs::create_dir(from.path().join("pkg")).unwrap();
        fs::write(from.path().join("Main.class"), b"x").unwrap();
        fs::write(from.path().join("pkg/Helper.class"), b"y").unwrap();

        copy_tree(from.path(), to.path()).unwrap();
        assert!(to.path().join("Main.class").exists());
        assert_eq!(fs::read(to.path().join("pkg/Helper.class")).unwrap(), b"y");
    }
}
