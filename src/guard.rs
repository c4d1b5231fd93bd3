//! Input guard for query strings.
//!
//! Queries are bounded and screened for pattern probing before they
//! reach the keyword or semantic channels. The guard fails closed: a
//! query crossing the probe threshold is rejected outright and logged.

const MAX_QUERY_CHARS: usize = 1024;

/// Probe score at which a query is rejected.
const PROBE_THRESHOLD: u32 = 3;

/// Fragments that indicate path or injection probing rather than a
/// search. Each occurrence contributes to the probe score.
const PROBE_PATTERNS: &[&str] = &[
    "../",
    "..\\",
    "/etc/",
    "/proc/",
    "c:\\windows",
    "drop table",
    "union select",
    "; --",
    "<script",
    "${",
];

/// Validate a query string. Returns the rejection reason on failure.
pub fn check_query(query: &str) -> Result<(), String> {
    if query.chars().count() > MAX_QUERY_CHARS {
        return Err(format!(
            "query exceeds {MAX_QUERY_CHARS} characters"
        ));
    }
    if query.contains('\0') {
        return Err("query contains NUL byte".to_string());
    }
    if query
        .chars()
        .any(|c| c.is_control() && c != '\n' && c != '\t')
    {
        return Err("query contains control characters".to_string());
    }

    let lowered = query.to_lowercase();
    let score: u32 = PROBE_PATTERNS
        .iter()
        .map(|p| lowered.matches(p).count() as u32)
        .sum();
    if score >= PROBE_THRESHOLD {
        return Err(format!("query looks like pattern probing (score {score})"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinary_queries_pass() {
        assert!(check_query("how does the embedding pipeline retry").is_ok());
        assert!(check_query("feature status IN_PROGRESS").is_ok());
        // A single suspicious fragment is below the threshold.
        assert!(check_query("what does ../relative mean in config").is_ok());
    }

    #[test]
    fn oversized_query_rejected() {
        let q = "a".repeat(MAX_QUERY_CHARS + 1);
        assert!(check_query(&q).is_err());
    }

    #[test]
    fn nul_and_control_rejected() {
        assert!(check_query("abc\0def").is_err());
        assert!(check_query("abc\x07def").is_err());
        assert!(check_query("multi\nline\tok").is_ok());
    }

    #[test]
    fn probing_crosses_threshold() {
        assert!(check_query("../../../etc/passwd").is_err());
        assert!(check_query("'; drop table notes; union select ; --").is_err());
    }
}
