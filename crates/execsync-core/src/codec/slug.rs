//! URL-safe slug derivation.

use once_cell::sync::Lazy;
use regex::Regex;

static STRIP: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s-]").expect("valid strip regex"));
static SEPARATORS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\s_-]+").expect("valid separator regex"));

/// Fallback key for titles with no sluggable characters.
pub const EMPTY_SLUG: &str = "untitled";

/// Lower-case, drop punctuation, join words with single hyphens.
///
/// ```
/// use execsync_core::codec::slugify;
/// assert_eq!(slugify("DE Shaw TPM Role"), "de-shaw-tpm-role");
/// ```
pub fn slugify(text: &str) -> String {
    let lowered = text.trim().to_lowercase();
    let stripped = STRIP.replace_all(&lowered, "");
    let joined = SEPARATORS.replace_all(&stripped, "-");
    let slug = joined.trim_matches('-');
    if slug.is_empty() {
        EMPTY_SLUG.to_string()
    } else {
        slug.to_string()
    }
}

/// Append `-2`, `-3`, … to `base` until `taken` reports the candidate free.
pub fn unique_slug(base: &str, mut taken: impl FnMut(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    let mut suffix = 2;
    loop {
        let candidate = format!("{}-{}", base, suffix);
        if !taken(&candidate) {
            return candidate;
        }
        suffix += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Learn Rust"), "learn-rust");
        assert_eq!(slugify("  Ship v2.0 -- now! "), "ship-v20-now");
        assert_eq!(slugify("snake_case_title"), "snake-case-title");
        assert_eq!(slugify("Café Notes"), "café-notes");
        assert_eq!(slugify("---"), EMPTY_SLUG);
    }

    #[test]
    fn test_unique_slug_suffixes() {
        let mut taken: HashSet<String> = HashSet::new();
        for _ in 0..3 {
            let slug = unique_slug("learn-rust", |s| taken.contains(s));
            taken.insert(slug);
        }
        let mut all: Vec<_> = taken.into_iter().collect();
        all.sort();
        assert_eq!(all, vec!["learn-rust", "learn-rust-2", "learn-rust-3"]);
    }
}
