/// Language Adapters - per-language build and run recipes
///
/// **Core Responsibility:**
/// Translate a harnessed program plus its `languages.json` entry into the
/// concrete commands the sandbox runs: entry file name, optional compile
/// step, run command, memory rlimit flavour and out-of-memory markers.
///
/// **Critical Properties:**
/// - Adapters never touch the filesystem or spawn processes; the engine does
/// - Tool paths and extra flags always come from configuration
/// - Interpreted languages use their "compile" step as a syntax check so parse
///   errors surface as `compile_error`

mod c_cpp;
mod csharp;
mod java;
mod javascript;
mod python;

use arbiter_common::config::LanguageConfig;
use arbiter_common::types::Language;

/// A program invocation relative to the sandbox working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Which rlimit also carries the memory ceiling.
///
/// The sandbox's resident-memory watchdog enforces the ceiling for every
/// language. Native code gets no rlimit on top, so an oversized allocation is
/// killed as it is touched instead of turning into a NULL dereference.
/// Managed runtimes reserve large virtual regions up front and are capped on
/// the data segment, plus a heap flag; Python on address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRlimit {
    AddressSpace,
    Data,
}

/// Source file names written into the build directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLayout {
    pub entry_file: String,
    pub support_files: Vec<String>,
}

pub trait LanguageAdapter: Send + Sync {
    fn language(&self) -> Language;

    /// File name the entry source is written under.
    fn entry_file(&self, entry_source: &str, config: &LanguageConfig) -> String {
        let _ = entry_source;
        format!("main.{}", config.execution.file_extension)
    }

    /// Compile (or syntax check) command, `None` when there is nothing to build.
    fn compile_command(&self, config: &LanguageConfig, layout: &SourceLayout) -> Option<CommandSpec>;

    /// File the compile step must leave behind.
    fn artifact(&self, layout: &SourceLayout) -> Option<String> {
        let _ = layout;
        None
    }

    fn run_command(&self, config: &LanguageConfig, layout: &SourceLayout, memory_limit_mb: u64) -> CommandSpec;

    fn memory_rlimit(&self) -> Option<MemoryRlimit> {
        None
    }

    /// Stderr fragments that mean the runtime ran out of memory.
    fn oom_markers(&self) -> &'static [&'static str] {
        &[]
    }
}

static PYTHON: python::Python = python::Python;
static JAVASCRIPT: javascript::JavaScript = javascript::JavaScript;
static JAVA: java::Java = java::Java;
static C: c_cpp::Native = c_cpp::Native::C;
static CPP: c_cpp::Native = c_cpp::Native::Cpp;
static CSHARP: csharp::CSharp = csharp::CSharp;

pub fn adapter_for(language: Language) -> &'static dyn LanguageAdapter {
    match language {
        Language::Python => &PYTHON,
        Language::JavaScript => &JAVASCRIPT,
        Language::Java => &JAVA,
        Language::C => &C,
        Language::Cpp => &CPP,
        Language::CSharp => &CSHARP,
    }
}

/// Configured command plus its configured arguments.
fn configured(command: &str, args: &[String]) -> CommandSpec {
    CommandSpec::new(command).args(args.iter().cloned())
}

#[cfg(test)]
pub(crate) mod test_support {
    use arbiter_common::config::LanguagesFile;
    use arbiter_common::config::LanguageConfig;
    use arbiter_common::types::Language;
    use std::path::Path;

    pub fn config_for(language: Language) -> LanguageConfig {
        let file = LanguagesFile::load(Path::new("../../config/languages.json")).unwrap();
        file.languages
            .into_iter()
            .find(|c| c.language().ok() == Some(language))
            .unwrap()
    }
}
