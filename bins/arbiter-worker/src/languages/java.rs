use super::{configured, CommandSpec, LanguageAdapter, MemoryRlimit, SourceLayout};
use arbiter_common::config::LanguageConfig;
use arbiter_common::types::Language;
use lazy_static::lazy_static;
use regex::Regex;

const DEFAULT_CLASS: &str = "Main";

lazy_static! {
    static ref PUBLIC_CLASS: Regex =
        Regex::new(r"(?m)^\s*public\s+(?:(?:final|abstract|static)\s+)*class\s+([A-Za-z_$][A-Za-z0-9_$]*)")
            .expect("valid public class pattern");
}

pub struct Java;

/// Name of the public class, which javac requires to match the file name.
fn main_class(source: &str) -> &str {
    PUBLIC_CLASS
        .captures(source)
        .and_then(|c| c.get(1))
        .map_or(DEFAULT_CLASS, |m| m.as_str())
}

fn class_of(layout: &SourceLayout) -> &str {
    layout.entry_file.strip_suffix(".java").unwrap_or(DEFAULT_CLASS)
}

impl LanguageAdapter for Java {
    fn language(&self) -> Language {
        Language::Java
    }

    fn entry_file(&self, entry_source: &str, _config: &LanguageConfig) -> String {
        format!("{}.java", main_class(entry_source))
    }

    fn compile_command(&self, config: &LanguageConfig, layout: &SourceLayout) -> Option<CommandSpec> {
        let compilation = config.compilation.as_ref()?;
        Some(
            configured(&compilation.command, &compilation.args)
                .arg("-J-XX:-UsePerfData")
                .args(["-d", "."])
                .arg(layout.entry_file.as_str()),
        )
    }

    fn artifact(&self, layout: &SourceLayout) -> Option<String> {
        Some(format!("{}.class", class_of(layout)))
    }

    fn run_command(&self, config: &LanguageConfig, layout: &SourceLayout, memory_limit_mb: u64) -> CommandSpec {
        CommandSpec::new(config.execution.command.as_str())
            .arg(format!("-Xmx{}m", memory_limit_mb))
            // hsperfdata lives in /tmp, which the sandbox mounts read-only
            .arg("-XX:-UsePerfData")
            .args(config.execution.args.iter().cloned())
            .args(["-cp", "."])
            .arg(class_of(layout))
    }

    fn memory_rlimit(&self) -> Option<MemoryRlimit> {
        Some(MemoryRlimit::Data)
    }

    fn oom_markers(&self) -> &'static [&'static str] {
        &["java.lang.OutOfMemoryError"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::languages::test_support::config_for;

    #[test]
    fn test_main_class_detection() {
        assert_eq!(main_class("public class Solution {\n}"), "Solution");
        assert_eq!(main_class("public final class App { }"), "App");
        assert_eq!(main_class("class Helper {}\n"), "Main");
        assert_eq!(main_class("// public class Nope\nimport java.util.*;"), "Main");
    }

    #[test]
    fn test_java_commands() {
        let config = config_for(Language::Java);
        let layout = SourceLayout {
            entry_file: Java.entry_file("public class Solution {}", &config),
            support_files: vec![],
        };
        assert_eq!(layout.entry_file, "Solution.java");
        assert_eq!(Java.artifact(&layout).as_deref(), Some("Solution.class"));

        let compile = Java.compile_command(&config, &layout).unwrap();
        assert_eq!(compile.program, "javac");
        assert_eq!(compile.args.last().map(String::as_str), Some("Solution.java"));

        let run = Java.run_command(&config, &layout, 256);
        assert_eq!(run.args[0], "-Xmx256m");
        assert!(run.args.contains(&"-XX:-UsePerfData".to_string()));
        assert_eq!(run.args.last().map(String::as_str), Some("Solution"));
    }
}
