//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles
//! across the workspace's production code:
//! - No sleep() calls (wait on I/O, timers or cancellation instead)
//! - No `unwrap()`/`expect()` outside tests (propagate errors)
//!
//! The helpers here scan source text line by line. Everything from the first
//! `#[cfg(test)]` line of a file onwards is treated as test code.

use std::fs;
use std::path::{Path, PathBuf};

/// Production source directories, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["streamchat/core/src", "streamchat/daemon/src"];

/// Workspace root, derived from this crate's manifest directory
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// All `.rs` files under the production directories
#[must_use]
pub fn production_files() -> Vec<PathBuf> {
    let root = workspace_root();
    PRODUCTION_DIRS
        .iter()
        .map(|dir| root.join(dir))
        .filter(|dir| dir.exists())
        .flat_map(|dir| {
            walkdir::WalkDir::new(dir)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
                .map(walkdir::DirEntry::into_path)
        })
        .collect()
}

/// Lines before the file's test module, paired with 1-based line numbers
#[must_use]
pub fn production_lines(content: &str) -> Vec<(usize, &str)> {
    content
        .lines()
        .enumerate()
        .take_while(|(_, line)| !line.trim_start().starts_with("#[cfg(test)]"))
        .map(|(idx, line)| (idx + 1, line))
        .collect()
}

/// Code portion of a line, without a trailing `//` comment
#[must_use]
pub fn code_part(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// Whether a line of code calls a sleep function
#[must_use]
pub fn calls_sleep(line: &str) -> bool {
    let code = code_part(line);
    code.contains("::sleep(") || code.contains(".sleep(")
}

/// Whether a line of code panics on `None`/`Err`
#[must_use]
pub fn calls_unwrap(line: &str) -> bool {
    let code = code_part(line);
    code.contains(".unwrap()") || code.contains(".expect(")
}

/// Scan every production file, reporting `path:line - code` per match
#[must_use]
pub fn find_violations(matches: fn(&str) -> bool) -> Vec<String> {
    let mut violations = Vec::new();
    for path in production_files() {
        let Ok(content) = fs::read_to_string(&path) else {
            continue;
        };
        for (line_number, line) in production_lines(&content) {
            if matches(line) {
                violations.push(format!(
                    "{}:{} - {}",
                    path.display(),
                    line_number,
                    line.trim()
                ));
            }
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_detection() {
        assert!(calls_sleep("    tokio::time::sleep(Duration::from_millis(10)).await;"));
        assert!(calls_sleep("std::thread::sleep(d);"));
        assert!(!calls_sleep("    // tokio::time::sleep(d) is forbidden"));
        assert!(!calls_sleep("    ticker.tick().await;"));
    }

    #[test]
    fn test_unwrap_detection() {
        assert!(calls_unwrap("let x = y.unwrap();"));
        assert!(calls_unwrap("let x = y.expect(\"present\");"));
        assert!(!calls_unwrap("let x = y.unwrap_or_default();"));
        assert!(!calls_unwrap("let x = y.unwrap_or(0); // not .unwrap()"));
    }

    #[test]
    fn test_test_module_is_excluded() {
        let source = "fn a() {}\nfn b() {}\n#[cfg(test)]\nmod tests { fn c() { x.unwrap(); } }\n";
        let lines = production_lines(source);
        assert_eq!(lines, vec![(1, "fn a() {}"), (2, "fn b() {}")]);
    }

    #[test]
    fn test_workspace_root_contains_sources() {
        assert!(workspace_root().join("streamchat/core/src/lib.rs").exists());
        assert!(!production_files().is_empty());
    }
}
