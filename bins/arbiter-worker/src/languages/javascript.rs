use super::{configured, CommandSpec, LanguageAdapter, MemoryRlimit, SourceLayout};
use arbiter_common::config::LanguageConfig;
use arbiter_common::types::Language;

pub struct JavaScript;

impl LanguageAdapter for JavaScript {
    fn language(&self) -> Language {
        Language::JavaScript
    }

    /// `node --check` accepts a single file; in function style that is the
    /// participant's module, otherwise the entry itself.
    fn compile_command(&self, config: &LanguageConfig, layout: &SourceLayout) -> Option<CommandSpec> {
        let compilation = config.compilation.as_ref()?;
        let target = layout.support_files.first().unwrap_or(&layout.entry_file);
        Some(
            configured(&compilation.command, &compilation.args)
                .arg("--check")
                .arg(target.as_str()),
        )
    }

    fn run_command(&self, config: &LanguageConfig, layout: &SourceLayout, memory_limit_mb: u64) -> CommandSpec {
        CommandSpec::new(config.execution.command.as_str())
            .arg(format!("--max-old-space-size={}", memory_limit_mb))
            .args(config.execution.args.iter().cloned())
            .arg(layout.entry_file.as_str())
    }

    fn memory_rlimit(&self) -> Option<MemoryRlimit> {
        Some(MemoryRlimit::Data)
    }

    fn oom_markers(&self) -> &'static [&'static str] {
        &["JavaScript heap out of memory", "Allocation failed"]
    }
}
