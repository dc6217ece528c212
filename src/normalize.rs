//! Comparison-key normalization for school names.
//!
//! Both the roster keys and the free-text `school` fields on visit records
//! go through [`normalize`] before any comparison, so a stray BOM pasted
//! from a spreadsheet or a double space never defeats an exact match.
//! Lowercasing is a no-op for Hangul but matters for the occasional
//! Latin-script school name.

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

/// BOM and zero-width characters that show up in copy-pasted CSV cells.
static ZERO_WIDTH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\x{200B}-\x{200D}\x{FEFF}]").unwrap());

/// Token boundary: anything outside ASCII alphanumerics and Hangul syllables.
static TOKEN_SPLIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^0-9a-z\x{AC00}-\x{D7AF}]+").unwrap());

/// Produce the canonical comparison key for a raw school-name string.
///
/// Removes BOM/zero-width characters, applies Unicode NFC, collapses
/// whitespace runs to a single space, trims, and lowercases. Idempotent:
/// `normalize(normalize(s)) == normalize(s)`.
pub fn normalize(s: &str) -> String {
    let cleaned = ZERO_WIDTH.replace_all(s, "");
    let composed: String = cleaned.nfc().collect();
    composed
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Split a string into comparison tokens (normalized first).
/// Runs of characters outside `[0-9a-z가-힣]` separate tokens.
pub fn tokens(s: &str) -> Vec<String> {
    TOKEN_SPLIT
        .split(&normalize(s))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}
