//! Cheap text similarity used for cautious deduplication.
//!
//! Similarity is token-set Jaccard over lowercase alphanumeric tokens. It is a
//! heuristic: two lessons with the same words in a different order are
//! identical to it.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9]+").expect("valid token regex"));

/// Matches `context=foo`, `game_name: "foo"`, `[game=foo]` and similar.
static SCOPE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(?:context|game_name|game)\s*[=:]\s*["']?([A-Za-z0-9_.\-/]+)"#)
        .expect("valid scope regex")
});

/// Scope assigned to text that declares none.
pub const GLOBAL_SCOPE: &str = "global";

pub fn tokens(text: &str) -> HashSet<String> {
    TOKEN_RE
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

/// Token-set Jaccard similarity in `[0, 1]`. Two empty texts are identical.
pub fn jaccard(a: &str, b: &str) -> f64 {
    let ta = tokens(a);
    let tb = tokens(b);
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    let inter = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    inter as f64 / union as f64
}

/// Best-effort context tag extracted from lesson text, lowercased.
/// Falls back to [`GLOBAL_SCOPE`].
pub fn scope_key(text: &str) -> String {
    SCOPE_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim_end_matches(['.', ',']).to_lowercase())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| GLOBAL_SCOPE.to_string())
}
