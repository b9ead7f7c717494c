use super::{configured, CommandSpec, LanguageAdapter, MemoryRlimit, SourceLayout};
use arbiter_common::config::LanguageConfig;
use arbiter_common::types::Language;

pub struct Python;

impl LanguageAdapter for Python {
    fn language(&self) -> Language {
        Language::Python
    }

    fn compile_command(&self, config: &LanguageConfig, layout: &SourceLayout) -> Option<CommandSpec> {
        let compilation = config.compilation.as_ref()?;
        Some(
            configured(&compilation.command, &compilation.args)
                .args(["-m", "py_compile"])
                .arg(layout.entry_file.as_str())
                .args(layout.support_files.iter().cloned()),
        )
    }

    fn run_command(&self, config: &LanguageConfig, layout: &SourceLayout, _memory_limit_mb: u64) -> CommandSpec {
        configured(&config.execution.command, &config.execution.args)
            .arg(layout.entry_file.as_str())
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONIOENCODING", "utf-8")
    }

    fn memory_rlimit(&self) -> Option<MemoryRlimit> {
        Some(MemoryRlimit::AddressSpace)
    }

    fn oom_markers(&self) -> &'static [&'static str] {
        &["MemoryError"]
    }
}
