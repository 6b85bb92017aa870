//! Person name normalization and fuzzy comparison.

use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

/// Honorifics dropped before comparison, lowercase and without dots.
const TITLES: &[&str] = &["mr", "mrs", "ms", "miss", "dr", "prof", "sir", "madam"];

/// Apostrophe-like characters deleted outright, so `O'Brien` becomes `obrien`.
const APOSTROPHES: &[char] = &['\'', '\u{2019}', '\u{2018}', '\u{02BC}', '`', '\u{00B4}'];

/// Canonical comparison form of a person name.
///
/// Case-folds, strips diacritics, deletes apostrophes, turns every other
/// non-alphanumeric character into a separator, drops honorific titles, and
/// collapses whitespace.
pub fn normalize_name(name: &str) -> String {
    let folded: String = name
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .filter(|c| !APOSTROPHES.contains(c))
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    folded
        .split_whitespace()
        .filter(|token| !TITLES.contains(token))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Similarity of two normalized names in [0, 1], independent of token order.
///
/// Tokens are sorted and rejoined, then scored with [`indel_ratio`].
pub fn token_sort_ratio(a: &str, b: &str) -> f64 {
    let sorted = |s: &str| {
        let mut tokens: Vec<&str> = s.split_whitespace().collect();
        tokens.sort_unstable();
        tokens.join(" ")
    };
    indel_ratio(&sorted(a), &sorted(b))
}

/// `2 * LCS / (len(a) + len(b))` over chars; two empty strings score 1.
///
/// Only insertions and deletions count, so a dropped letter costs less than
/// under Levenshtein distance.
#[allow(clippy::cast_precision_loss)]
pub fn indel_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }

    // Single-row LCS table over `b`.
    let mut row = vec![0usize; b.len() + 1];
    for ca in &a {
        let mut diagonal = 0;
        for (j, cb) in b.iter().enumerate() {
            let above = row[j + 1];
            row[j + 1] = if ca == cb { diagonal + 1 } else { above.max(row[j]) };
            diagonal = above;
        }
    }
    (2 * row[b.len()]) as f64 / total as f64
}

/// Outcome of comparing two raw names.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NameComparison {
    /// One side normalized to nothing.
    Unknown,
    Compared { matched: bool, score: f64 },
}

/// Normalize both names and compare them against `threshold`.
pub fn compare_names(a: &str, b: &str, threshold: f64) -> NameComparison {
    let left = normalize_name(a);
    let right = normalize_name(b);
    if left.is_empty() || right.is_empty() {
        return NameComparison::Unknown;
    }
    let score = token_sort_ratio(&left, &right);
    NameComparison::Compared {
        matched: score >= threshold,
        score,
    }
}
