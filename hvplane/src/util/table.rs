//! Positional-column parsing for host enumeration output.
//!
//! Host tools print whitespace-delimited tables. Callers pick fields by
//! column index rather than by header name.

/// Split `output` into rows of whitespace-separated fields, skipping the
/// first line and blank lines.
pub fn data_rows(output: &str) -> Vec<Vec<&str>> {
    output
        .lines()
        .skip(1)
        .map(|line| line.split_whitespace().collect::<Vec<_>>())
        .filter(|fields| !fields.is_empty())
        .collect()
}

/// Like [`data_rows`] but keeps the first line.
pub fn all_rows(output: &str) -> Vec<Vec<&str>> {
    output
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>())
        .filter(|fields| !fields.is_empty())
        .collect()
}

/// Last whitespace-separated token of the first non-empty line.
pub fn last_token(output: &str) -> Option<&str> {
    output
        .lines()
        .find(|l| !l.trim().is_empty())
        .and_then(|l| l.split_whitespace().last())
}
