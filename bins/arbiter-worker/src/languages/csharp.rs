use super::{configured, CommandSpec, LanguageAdapter, MemoryRlimit, SourceLayout};
use arbiter_common::config::LanguageConfig;
use arbiter_common::types::Language;

const ASSEMBLY: &str = "solution.exe";

pub struct CSharp;

impl LanguageAdapter for CSharp {
    fn language(&self) -> Language {
        Language::CSharp
    }

    fn compile_command(&self, config: &LanguageConfig, layout: &SourceLayout) -> Option<CommandSpec> {
        let compilation = config.compilation.as_ref()?;
        Some(
            configured(&compilation.command, &compilation.args)
                .arg(format!("-out:{}", ASSEMBLY))
                .arg(layout.entry_file.as_str()),
        )
    }

    fn artifact(&self, _layout: &SourceLayout) -> Option<String> {
        Some(ASSEMBLY.to_string())
    }

    fn run_command(&self, config: &LanguageConfig, _layout: &SourceLayout, memory_limit_mb: u64) -> CommandSpec {
        configured(&config.execution.command, &config.execution.args)
            .arg(ASSEMBLY)
            .env("MONO_GC_PARAMS", format!("max-heap-size={}m", memory_limit_mb))
    }

    fn memory_rlimit(&self) -> Option<MemoryRlimit> {
        Some(MemoryRlimit::Data)
    }

    fn oom_markers(&self) -> &'static [&'static str] {
        &["System.OutOfMemoryException"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::languages::test_support::config_for;

    #[test]
    fn test_csharp_commands() {
        let config = config_for(Language::CSharp);
        let layout = SourceLayout {
            entry_file: CSharp.entry_file("", &config),
            support_files: vec![],
        };
        let compile = CSharp.compile_command(&config, &layout).unwrap();
        assert_eq!(compile.program, "mcs");
        assert!(compile.args.contains(&"-out:solution.exe".to_string()));

        let run = CSharp.run_command(&config, &layout, 128);
        assert_eq!(run.program, "mono");
        assert_eq!(run.args, vec!["solution.exe"]);
        assert_eq!(run.env[0].1, "max-heap-size=128m");
    }
}
