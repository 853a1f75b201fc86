//! Architectural Enforcement
//!
//! Source scanners backing the integration tests that enforce relay's
//! architectural rules:
//! - No blocking `std::thread::sleep` in production code (async paths use
//!   `tokio::time::sleep`)
//! - No `.unwrap()` / `.expect(` in production code; errors propagate
//!
//! Code after the first `#[cfg(test)]` in a file is treated as test code,
//! matching the layout used throughout the workspace.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// A forbidden pattern with the reason it is forbidden
#[derive(Clone, Copy, Debug)]
pub struct Rule {
    /// Short rule name
    pub name: &'static str,
    /// Substrings that violate the rule
    pub patterns: &'static [&'static str],
}

/// Blocking sleeps stall the runtime's worker threads
pub const NO_BLOCKING_SLEEP: Rule = Rule {
    name: "no-blocking-sleep",
    patterns: &["std::thread::sleep", "thread::sleep("],
};

/// Production code propagates errors instead of panicking
pub const NO_PANICKING_UNWRAP: Rule = Rule {
    name: "no-panicking-unwrap",
    patterns: &[".unwrap()", ".expect("],
};

/// One rule violation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Violation {
    /// Rule that was broken
    pub rule: &'static str,
    /// File containing the violation
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// The offending line, trimmed
    pub text: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} [{}] {}",
            self.path.display(),
            self.line,
            self.rule,
            self.text
        )
    }
}

/// Check one file's source text against `rules`
pub fn scan_source(path: &Path, source: &str, rules: &[Rule]) -> Vec<Violation> {
    let mut violations = Vec::new();

    for (index, line) in source.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.starts_with("#[cfg(test)]") {
            break;
        }
        if trimmed.starts_with("//") {
            continue;
        }
        for rule in rules {
            if rule.patterns.iter().any(|p| trimmed.contains(p)) {
                violations.push(Violation {
                    rule: rule.name,
                    path: path.to_path_buf(),
                    line: index + 1,
                    text: trimmed.to_string(),
                });
            }
        }
    }

    violations
}

/// Check every `.rs` file under `root` against `rules`
///
/// Unreadable files are reported as errors.
pub fn scan_dir(root: &Path, rules: &[Rule]) -> std::io::Result<Vec<Violation>> {
    let mut violations = Vec::new();

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::other)?;
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().is_none_or(|ext| ext != "rs") {
            continue;
        }
        let source = fs::read_to_string(path)?;
        violations.extend(scan_source(path, &source, rules));
    }

    Ok(violations)
}

/// Production source roots of the workspace, relative to this crate
pub fn production_roots() -> Vec<PathBuf> {
    let workspace = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    vec![
        workspace.join("relay/core/src"),
        workspace.join("relay/cli/src"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(source: &str) -> Vec<Violation> {
        scan_source(
            Path::new("sample.rs"),
            source,
            &[NO_BLOCKING_SLEEP, NO_PANICKING_UNWRAP],
        )
    }

    #[test]
    fn test_flags_blocking_sleep() {
        let found = scan("fn f() {\n    std::thread::sleep(d);\n}\n");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].rule, "no-blocking-sleep");
        assert_eq!(found[0].line, 2);
    }

    #[test]
    fn test_flags_unwrap_and_expect() {
        let found =
            scan("let a = x.unwrap();\nlet b = y.expect(\"set\");\nlet c = z.unwrap_or(1);\n");
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|v| v.rule == "no-panicking-unwrap"));
    }

    #[test]
    fn test_ignores_comments_and_test_modules() {
        let source = concat!(
            "// x.unwrap() is fine here\n",
            "fn f() {}\n",
            "\n",
            "#[cfg(test)]\n",
            "mod tests {\n",
            "    fn t() { x.unwrap(); }\n",
            "}\n",
        );
        assert!(scan(source).is_empty());
    }

    #[test]
    fn test_tokio_sleep_is_allowed() {
        assert!(scan("tokio::time::sleep(delay).await;\n").is_empty());
    }
}
