//! Shared lexical helpers for deterministic, I/O-free scoring.
//!
//! Retrieval, the knowledge provider, and the lesson critic all score text
//! the same way: lowercase alphanumeric tokens and Jaccard overlap. Keeping
//! one implementation means their scores stay comparable.

use std::collections::BTreeSet;

/// Split text into a set of lowercase alphanumeric tokens.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    let mut tokens = BTreeSet::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            current.extend(ch.to_lowercase());
        } else if !current.is_empty() {
            tokens.insert(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.insert(current);
    }
    tokens
}

/// Jaccard similarity over token sets. Empty sides score 0.0.
pub fn jaccard(a: &str, b: &str) -> f64 {
    let ta = tokenize(a);
    let tb = tokenize(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let intersection = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    intersection as f64 / union as f64
}

/// Collapse text to lowercase alphanumeric tokens joined by single spaces.
///
/// This is the normalization used for lesson rule identity, so any change
/// here changes every stored `lesson_id`.
pub fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_space = true;
        }
    }
    out
}

/// Clamp a float into an inclusive range.
pub fn clamp(value: f64, low: f64, high: f64) -> f64 {
    value.max(low).min(high)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_lowercases_and_splits_on_punctuation() {
        let tokens = tokenize("LOAD \"sales.csv\" -> total=sum(amount)");
        assert!(tokens.contains("load"));
        assert!(tokens.contains("sales"));
        assert!(tokens.contains("sum"));
        assert!(!tokens.contains("->"));
    }

    #[test]
    fn jaccard_is_symmetric_and_bounded() {
        let a = "TALLY region total sum amount";
        let b = "tally uses arrow syntax total sum";
        let left = jaccard(a, b);
        let right = jaccard(b, a);
        assert!((left - right).abs() < f64::EPSILON);
        assert!(left > 0.0 && left < 1.0);
        assert!((jaccard("", a) - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn normalize_text_is_stable_under_punctuation_noise() {
        assert_eq!(
            normalize_text("LOAD requires a QUOTED path!"),
            "load requires a quoted path"
        );
        assert_eq!(normalize_text("  "), "");
    }
}
