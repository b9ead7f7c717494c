/// Harness Detector - decides how a submission is driven
///
/// **Core Responsibility:**
/// Inspect interpreted-language source for a top-level definition of the
/// challenge function and pick a harness style:
/// - Function style: the submission becomes a support module and a generated
///   driver calls the function with JSON-decoded arguments, printing the JSON
///   encoding of the return value
/// - Input style: the submission runs unmodified and reads its inputs from stdin
///
/// **Critical Properties:**
/// - Static inspection only, the code is never executed here
/// - Strings and comments are masked before matching, so a function name
///   inside a string literal does not count
/// - Unbalanced brackets or unterminated strings fall back to input style; the
///   real parse error surfaces later as an execution outcome
/// - Compiled languages always use input style

use crate::challenge::is_identifier;
use crate::types::{HarnessStyle, Language};
use regex::Regex;
use serde_json::Value;

/// Module name the submission is written under in function style
pub const SOLUTION_MODULE: &str = "solution";

const PYTHON_DRIVER: &str = r#"import json
import sys

_stdout = sys.stdout
sys.stdout = sys.stderr

import solution


def _main():
    line = sys.stdin.readline()
    args = json.loads(line) if line.strip() else []
    result = solution.__FUNCTION__(*args)
    sys.stdout = _stdout
    sys.stdout.write(json.dumps(result) + "\n")
    sys.stdout.flush()


if __name__ == "__main__":
    _main()
"#;

const JAVASCRIPT_DRIVER: &str = r#"'use strict';
const fs = require('fs');
const path = require('path');
const vm = require('vm');

const stdoutWrite = process.stdout.write.bind(process.stdout);
console.log = (...args) => console.error(...args);
console.info = console.log;
globalThis.require = require;
globalThis.module = { exports: {} };
globalThis.exports = globalThis.module.exports;

vm.runInThisContext(fs.readFileSync(path.join(__dirname, 'solution.js'), 'utf8'), { filename: 'solution.js' });
const target = vm.runInThisContext('typeof __FUNCTION__ === "function" ? __FUNCTION__ : module.exports.__FUNCTION__');

const line = fs.readFileSync(0, 'utf8').split('\n')[0] || '';
const args = line.trim() ? JSON.parse(line) : [];
Promise.resolve(target(...args)).then(
  (result) => stdoutWrite(JSON.stringify(result === undefined ? null : result) + '\n'),
  (err) => {
    console.error(err && err.stack ? err.stack : String(err));
    process.exitCode = 1;
  },
);
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub name: String,
    pub contents: String,
}

/// Program text ready for a language adapter.
///
/// `entry` is written under the adapter's entry file name; `support` files are
/// written next to it with the names given here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessedProgram {
    pub language: Language,
    pub style: HarnessStyle,
    pub entry: String,
    pub support: Vec<SourceFile>,
}

/// Source with string and comment bodies blanked out.
struct Masked {
    text: String,
    /// Bracket depth at the start of each line; `None` when the line starts
    /// inside a string or comment
    line_depths: Vec<Option<usize>>,
}

#[derive(Debug, PartialEq, Eq)]
struct Unbalanced;

fn mask_python(code: &str) -> Result<Masked, Unbalanced> {
    let chars: Vec<char> = code.chars().collect();
    let mut out = String::with_capacity(code.len());
    let mut line_depths = vec![Some(0)];
    let mut depth: usize = 0;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    out.push(' ');
                    i += 1;
                }
                continue;
            }
            '\'' | '"' => {
                let triple = i + 2 < chars.len() && chars[i + 1] == c && chars[i + 2] == c;
                let width = if triple { 3 } else { 1 };
                for _ in 0..width {
                    out.push(' ');
                }
                i += width;
                loop {
                    if i >= chars.len() {
                        return Err(Unbalanced);
                    }
                    let ch = chars[i];
                    if ch == '\\' {
                        out.push(' ');
                        if i + 1 < chars.len() {
                            out.push(if chars[i + 1] == '\n' { '\n' } else { ' ' });
                            if chars[i + 1] == '\n' {
                                line_depths.push(None);
                            }
                        }
                        i += 2;
                        continue;
                    }
                    if ch == '\n' {
                        if !triple {
                            return Err(Unbalanced);
                        }
                        out.push('\n');
                        line_depths.push(None);
                        i += 1;
                        continue;
                    }
                    if ch == c && (!triple || (i + 2 < chars.len() && chars[i + 1] == c && chars[i + 2] == c)) {
                        for _ in 0..width {
                            out.push(' ');
                        }
                        i += width;
                        break;
                    }
                    out.push(' ');
                    i += 1;
                }
                continue;
            }
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.checked_sub(1).ok_or(Unbalanced)?,
            '\n' => line_depths.push(Some(depth)),
            _ => {}
        }
        out.push(c);
        i += 1;
    }

    if depth != 0 {
        return Err(Unbalanced);
    }
    Ok(Masked { text: out, line_depths })
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum JsState {
    Code,
    Template,
}

fn mask_javascript(code: &str) -> Result<Masked, Unbalanced> {
    let chars: Vec<char> = code.chars().collect();
    let mut out = String::with_capacity(code.len());
    let mut line_depths = vec![Some(0)];
    let mut depth: usize = 0;
    let mut state = JsState::Code;
    // Depths at which an open `${` returns to its template literal
    let mut templates: Vec<usize> = Vec::new();
    let mut last_significant: Option<char> = None;
    let mut i = 0;

    let newline = |out: &mut String, line_depths: &mut Vec<Option<usize>>, depth: Option<usize>| {
        out.push('\n');
        line_depths.push(depth);
    };

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if state == JsState::Template {
            match c {
                '\\' => {
                    out.push_str("  ");
                    i += 2;
                }
                '`' => {
                    out.push(' ');
                    state = JsState::Code;
                    last_significant = Some('`');
                    i += 1;
                }
                '$' if next == Some('{') => {
                    out.push_str("  ");
                    templates.push(depth);
                    depth += 1;
                    state = JsState::Code;
                    last_significant = Some('{');
                    i += 2;
                }
                '\n' => {
                    newline(&mut out, &mut line_depths, None);
                    i += 1;
                }
                _ => {
                    out.push(' ');
                    i += 1;
                }
            }
            continue;
        }

        match c {
            '/' if next == Some('/') => {
                while i < chars.len() && chars[i] != '\n' {
                    out.push(' ');
                    i += 1;
                }
                continue;
            }
            '/' if next == Some('*') => {
                out.push_str("  ");
                i += 2;
                loop {
                    if i >= chars.len() {
                        return Err(Unbalanced);
                    }
                    if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
                        out.push_str("  ");
                        i += 2;
                        break;
                    }
                    if chars[i] == '\n' {
                        newline(&mut out, &mut line_depths, None);
                    } else {
                        out.push(' ');
                    }
                    i += 1;
                }
                continue;
            }
            '/' if last_significant.map_or(true, |p| "(,=:[!&|?{};+-*%<>~^".contains(p)) => {
                // Regex literal
                out.push(' ');
                i += 1;
                let mut in_class = false;
                loop {
                    match chars.get(i) {
                        None | Some('\n') => return Err(Unbalanced),
                        Some('\\') => {
                            out.push_str("  ");
                            i += 2;
                            continue;
                        }
                        Some('[') => in_class = true,
                        Some(']') => in_class = false,
                        Some('/') if !in_class => {
                            out.push(' ');
                            i += 1;
                            break;
                        }
                        _ => {}
                    }
                    out.push(' ');
                    i += 1;
                }
                last_significant = Some('/');
                continue;
            }
            '\'' | '"' => {
                out.push(' ');
                i += 1;
                loop {
                    match chars.get(i) {
                        None | Some('\n') => return Err(Unbalanced),
                        Some('\\') => {
                            out.push_str("  ");
                            i += 2;
                        }
                        Some(&ch) if ch == c => {
                            out.push(' ');
                            i += 1;
                            break;
                        }
                        _ => {
                            out.push(' ');
                            i += 1;
                        }
                    }
                }
                last_significant = Some(c);
                continue;
            }
            '`' => {
                out.push(' ');
                state = JsState::Template;
                i += 1;
                continue;
            }
            '(' | '[' | '{' => depth += 1,
            '}' if templates.last() == Some(&(depth.wrapping_sub(1))) => {
                templates.pop();
                depth -= 1;
                out.push(' ');
                state = JsState::Template;
                i += 1;
                continue;
            }
            ')' | ']' | '}' => depth = depth.checked_sub(1).ok_or(Unbalanced)?,
            '\n' => {
                newline(&mut out, &mut line_depths, Some(depth));
                i += 1;
                continue;
            }
            _ => {}
        }
        if !c.is_whitespace() {
            last_significant = Some(c);
        }
        out.push(c);
        i += 1;
    }

    if depth != 0 || state == JsState::Template {
        return Err(Unbalanced);
    }
    Ok(Masked { text: out, line_depths })
}

fn top_level_match(masked: &Masked, pattern: &Regex) -> bool {
    masked
        .text
        .split('\n')
        .zip(masked.line_depths.iter())
        .any(|(line, depth)| *depth == Some(0) && pattern.is_match(line))
}

/// Detect which harness style a submission needs.
///
/// ## Arguments
/// * `language` - Submission language
/// * `code` - Participant source
/// * `function_name` - Challenge entry function
///
/// ## Returns
/// `Function` only for interpreted languages that define the function at top level
pub fn detect_style(language: Language, code: &str, function_name: &str) -> HarnessStyle {
    if !language.is_interpreted() || !is_identifier(function_name) {
        return HarnessStyle::Input;
    }
    let name = regex::escape(function_name);

    let found = match language {
        Language::Python => {
            let pattern = format!(r"^(?:async\s+def\s+|def\s+){name}\s*\(|^{name}\s*=\s*lambda\b");
            match (mask_python(code), Regex::new(&pattern)) {
                (Ok(masked), Ok(re)) => top_level_match(&masked, &re),
                _ => false,
            }
        }
        Language::JavaScript => {
            let pattern = format!(
                r"^\s*(?:export\s+)?(?:async\s+)?function\s*\*?\s*{name}\s*\(|^\s*(?:export\s+)?(?:const|let|var)\s+{name}\s*="
            );
            match (mask_javascript(code), Regex::new(&pattern)) {
                (Ok(masked), Ok(re)) => top_level_match(&masked, &re),
                _ => false,
            }
        }
        _ => false,
    };

    if found {
        HarnessStyle::Function
    } else {
        HarnessStyle::Input
    }
}

/// Wrap a submission for execution.
pub fn prepare(language: Language, code: &str, function_name: &str) -> HarnessedProgram {
    let style = detect_style(language, code, function_name);

    let (entry, support) = match (style, language) {
        (HarnessStyle::Function, Language::Python) => (
            PYTHON_DRIVER.replace("__FUNCTION__", function_name),
            vec![SourceFile {
                name: format!("{}.py", SOLUTION_MODULE),
                contents: code.to_string(),
            }],
        ),
        (HarnessStyle::Function, Language::JavaScript) => (
            JAVASCRIPT_DRIVER.replace("__FUNCTION__", function_name),
            vec![SourceFile {
                name: format!("{}.js", SOLUTION_MODULE),
                contents: code.to_string(),
            }],
        ),
        _ => (code.to_string(), Vec::new()),
    };

    HarnessedProgram {
        language,
        style: if support.is_empty() { HarnessStyle::Input } else { style },
        entry,
        support,
    }
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        nested => nested.to_string(),
    }
}

/// Render one input value as a single stdin line.
///
/// Strings are written verbatim, numbers canonically, booleans as
/// `true`/`false`, null as an empty line, arrays as space-separated scalars
/// and anything nested deeper as compact JSON.
pub fn render_line(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Array(items) => items.iter().map(render_scalar).collect::<Vec<_>>().join(" "),
        other => render_scalar(other),
    }
}

/// Stdin lines for one test case.
pub fn stdin_lines(style: HarnessStyle, inputs: &[Value]) -> Vec<String> {
    match style {
        HarnessStyle::Function => vec![Value::Array(inputs.to_vec()).to_string()],
        HarnessStyle::Input => inputs.iter().map(render_line).collect(),
    }
}

/// Textual form of an expected value for input-style comparison.
pub fn expected_text(value: &Value) -> String {
    render_line(value)
}
