//! Session-protocol validator.
//!
//! Runs ten checks against a session-log markdown file and returns a
//! structured report. Exit-code discipline belongs to the hook layer;
//! this module is a pure function over the file contents.

use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub checks: Vec<CheckResult>,
}

impl ValidationReport {
    pub fn failed_names(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.name.clone())
            .collect()
    }
}

/// Validate a session log file. Missing file fails the first check and
/// short-circuits the content checks (they cannot be evaluated).
pub fn validate_session_log(path: &Path) -> ValidationReport {
    let mut checks = Vec::new();

    let exists = path.is_file();
    checks.push(check("file_exists", exists, || {
        format!("no file at {}", path.display())
    }));
    if !exists {
        return ValidationReport {
            valid: false,
            checks,
        };
    }

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    checks.push(check(
        "filename_format",
        filename_matches(&filename),
        || format!("expected YYYY-MM-DD-session-NN[-topic].md, got {filename}"),
    ));

    let content = std::fs::read_to_string(path).unwrap_or_default();

    for section in ["Protocol Compliance", "Decisions", "Outcome"] {
        let present = has_section(&content, section);
        checks.push(check(
            &format!("section_{}", section.to_lowercase().replace(' ', "_")),
            present,
            || format!("missing section '{section}'"),
        ));
    }

    let unchecked_musts: Vec<&str> = content
        .lines()
        .filter(|l| {
            let t = l.trim_start();
            t.starts_with("- [ ]") && t.contains("MUST")
        })
        .collect();
    checks.push(check("must_items_checked", unchecked_musts.is_empty(), || {
        format!("{} unchecked MUST item(s)", unchecked_musts.len())
    }));

    checks.push(check(
        "brain_mcp_evidence",
        content.contains("brain-mcp") || has_section(&content, "Brain MCP Evidence"),
        || "no Brain-MCP evidence block".to_string(),
    ));

    checks.push(check(
        "git_branch_documented",
        field_value(&content, "Branch:").is_some(),
        || "no 'Branch:' line".to_string(),
    ));

    let sha_ok = field_value(&content, "Commit:")
        .map(|v| is_commit_sha(&v))
        .unwrap_or(false);
    checks.push(check("commit_sha_recorded", sha_ok, || {
        "no commit SHA, or a placeholder".to_string()
    }));

    checks.push(check("markdown_lint", lint_markdown(&content), || {
        "markdown lint failed (H1 heading and balanced code fences required)".to_string()
    }));

    let valid = checks.iter().all(|c| c.passed);
    ValidationReport { valid, checks }
}

fn check(name: &str, passed: bool, detail: impl FnOnce() -> String) -> CheckResult {
    CheckResult {
        name: name.to_string(),
        passed,
        detail: if passed { None } else { Some(detail()) },
    }
}

/// True for filenames shaped `YYYY-MM-DD-session-NN[-topic].md`.
pub fn is_session_log_filename(filename: &str) -> bool {
    filename_matches(filename)
}

/// `YYYY-MM-DD-session-NN[-topic].md`
fn filename_matches(filename: &str) -> bool {
    let Some(stem) = filename.strip_suffix(".md") else {
        return false;
    };
    let parts: Vec<&str> = stem.splitn(6, '-').collect();
    if parts.len() < 5 {
        return false;
    }
    let digits = |s: &str, n: usize| s.len() == n && s.chars().all(|c| c.is_ascii_digit());
    digits(parts[0], 4)
        && digits(parts[1], 2)
        && digits(parts[2], 2)
        && parts[3] == "session"
        && digits(parts[4], 2)
}

fn has_section(content: &str, section: &str) -> bool {
    content.lines().any(|l| {
        let t = l.trim_start();
        t.starts_with('#') && t.trim_start_matches('#').trim().eq_ignore_ascii_case(section)
    })
}

fn field_value(content: &str, field: &str) -> Option<String> {
    content.lines().find_map(|l| {
        let t = l.trim().trim_start_matches(['-', '*']).trim();
        let rest = t.strip_prefix(field)?.trim();
        let rest = rest.trim_matches('`').trim();
        (!rest.is_empty()).then(|| rest.to_string())
    })
}

fn is_commit_sha(value: &str) -> bool {
    let v = value.trim();
    (7..=40).contains(&v.len()) && v.chars().all(|c| c.is_ascii_hexdigit())
}

fn lint_markdown(content: &str) -> bool {
    let starts_with_h1 = content
        .lines()
        .find(|l| !l.trim().is_empty())
        .map(|l| l.starts_with("# "))
        .unwrap_or(false);
    let fences = content
        .lines()
        .filter(|l| l.trim_start().starts_with("```"))
        .count();
    starts_with_h1 && fences % 2 == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const GOOD_LOG: &str = "\
# Session 2026-08-29

## Protocol Compliance
- [x] MUST load bootstrap context
- [x] MUST record decisions

## Decisions
- [decision] switched chunker to whitespace boundaries

## Outcome
Done.

Branch: feature/search-depth
Commit: 4f2c1a9e

```brain-mcp
search(\"chunker\", {mode: \"hybrid\"})
```
";

    fn write_log(name: &str, content: &str) -> (TempDir, std::path::PathBuf) {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(name);
        std::fs::write(&path, content).unwrap();
        (tmp, path)
    }

    #[test]
    fn good_log_passes_all_checks() {
        let (_tmp, path) = write_log("2026-08-29-session-01-search.md", GOOD_LOG);
        let report = validate_session_log(&path);
        assert!(report.valid, "failed: {:?}", report.failed_names());
        assert_eq!(report.checks.len(), 10);
    }

    #[test]
    fn missing_file_fails_fast() {
        let report = validate_session_log(Path::new("/nonexistent/log.md"));
        assert!(!report.valid);
        assert_eq!(report.checks.len(), 1);
    }

    #[test]
    fn bad_filename_rejected() {
        let (_tmp, path) = write_log("notes.md", GOOD_LOG);
        let report = validate_session_log(&path);
        assert!(report.failed_names().contains(&"filename_format".to_string()));
    }

    #[test]
    fn unchecked_must_item_fails() {
        let bad = GOOD_LOG.replace("- [x] MUST load", "- [ ] MUST load");
        let (_tmp, path) = write_log("2026-08-29-session-02.md", &bad);
        let report = validate_session_log(&path);
        assert!(report
            .failed_names()
            .contains(&"must_items_checked".to_string()));
    }

    #[test]
    fn placeholder_commit_sha_fails() {
        let bad = GOOD_LOG.replace("4f2c1a9e", "TBD");
        let (_tmp, path) = write_log("2026-08-29-session-03.md", &bad);
        let report = validate_session_log(&path);
        assert!(report
            .failed_names()
            .contains(&"commit_sha_recorded".to_string()));
    }

    #[test]
    fn missing_section_fails() {
        let bad = GOOD_LOG.replace("## Outcome", "## Wrapup");
        let (_tmp, path) = write_log("2026-08-29-session-04.md", &bad);
        let report = validate_session_log(&path);
        assert!(report.failed_names().contains(&"section_outcome".to_string()));
    }

    #[test]
    fn filename_with_topic_ok() {
        assert!(filename_matches("2026-01-02-session-07-refactor-config.md"));
        assert!(filename_matches("2026-01-02-session-07.md"));
        assert!(!filename_matches("2026-1-02-session-07.md"));
        assert!(!filename_matches("session-07.md"));
    }
}
