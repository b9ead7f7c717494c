use super::{configured, CommandSpec, LanguageAdapter, SourceLayout};
use arbiter_common::config::LanguageConfig;
use arbiter_common::types::Language;

const BINARY: &str = "solution";

/// C and C++ share everything but the compiler and source extension.
pub enum Native {
    C,
    Cpp,
}

impl LanguageAdapter for Native {
    fn language(&self) -> Language {
        match self {
            Native::C => Language::C,
            Native::Cpp => Language::Cpp,
        }
    }

    fn compile_command(&self, config: &LanguageConfig, layout: &SourceLayout) -> Option<CommandSpec> {
        let compilation = config.compilation.as_ref()?;
        let command = configured(&compilation.command, &compilation.args)
            .args(["-o", BINARY])
            .arg(layout.entry_file.as_str());
        Some(match self {
            Native::C => command.arg("-lm"),
            Native::Cpp => command,
        })
    }

    fn artifact(&self, _layout: &SourceLayout) -> Option<String> {
        Some(BINARY.to_string())
    }

    fn run_command(&self, config: &LanguageConfig, _layout: &SourceLayout, _memory_limit_mb: u64) -> CommandSpec {
        configured(&config.execution.command, &config.execution.args)
    }

    fn oom_markers(&self) -> &'static [&'static str] {
        match self {
            Native::C => &[],
            Native::Cpp => &["std::bad_alloc"],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::languages::test_support::config_for;

    #[test]
    fn test_native_commands() {
        let config = config_for(Language::C);
        let layout = SourceLayout {
            entry_file: Native::C.entry_file("int main(){}", &config),
            support_files: vec![],
        };
        assert_eq!(layout.entry_file, "main.c");

        let compile = Native::C.compile_command(&config, &layout).unwrap();
        assert_eq!(compile.program, "gcc");
        assert!(compile.args.contains(&"-lm".to_string()));
        assert_eq!(Native::C.artifact(&layout).as_deref(), Some("solution"));
        assert_eq!(Native::C.run_command(&config, &layout, 64).program, "./solution");
        assert_eq!(Native::C.memory_rlimit(), None);
    }

    #[test]
    fn test_cpp_uses_its_own_compiler() {
        let config = config_for(Language::Cpp);
        let layout = SourceLayout {
            entry_file: Native::Cpp.entry_file("", &config),
            support_files: vec![],
        };
        let compile = Native::Cpp.compile_command(&config, &layout).unwrap();
        assert_eq!(compile.program, "g++");
        assert_eq!(compile.args.last().map(String::as_str), Some("main.cpp"));
    }
}
