//! Similarity scoring between free-text school names and roster keys.
//!
//! Four escalating strategies, first confident hit wins:
//! 1. normalized exact match            => 1.0
//! 2. substring containment             => 0.95
//! 3. token overlap (Jaccard, if any)   => 0.6 + 0.4 * |inter| / |union|
//! 4. Levenshtein ratio                 => 1 - dist / max(len)
//!
//! The Levenshtein pass only runs while the best score so far is below
//! [`LEVENSHTEIN_GATE`]; a strong token-overlap hit is not second-guessed.
//! This is the single consolidated matcher behind every backfill path.

use rustc_hash::FxHashSet;

use crate::models::{MatchStrategy, RegionMap};
use crate::normalize::{normalize, tokens};

// ============================================================================
// Score Constants
// ============================================================================

/// Minimum score at which a match is applied, unless the caller overrides.
pub const DEFAULT_THRESHOLD: f64 = 0.75;

/// Fixed score for substring containment between normalized names.
pub const SUBSTRING_SCORE: f64 = 0.95;

/// Below this, the Levenshtein fallback is still consulted.
const LEVENSHTEIN_GATE: f64 = 0.85;

// ============================================================================
// Candidate
// ============================================================================

/// Best roster candidate found for one free-text name.
#[derive(Clone, Debug)]
pub struct Candidate {
    /// The (normalized) roster key that won.
    pub key: String,
    pub score: f64,
    pub strategy: MatchStrategy,
}

// ============================================================================
// Scoring
// ============================================================================

/// Similarity ratio from Levenshtein distance over normalized inputs
/// (0.0 to 1.0, counted in chars).
pub fn levenshtein_ratio(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - strsim::levenshtein(a, b) as f64 / max_len as f64
}

/// Jaccard overlap of unique comparison tokens.
/// `None` when either side has no tokens or the intersection is empty.
fn token_overlap(a_tokens: &FxHashSet<String>, b: &str) -> Option<f64> {
    if a_tokens.is_empty() {
        return None;
    }
    let b_tokens: FxHashSet<String> = tokens(b).into_iter().collect();
    if b_tokens.is_empty() {
        return None;
    }
    let inter = a_tokens.intersection(&b_tokens).count();
    if inter == 0 {
        return None;
    }
    let union = a_tokens.union(&b_tokens).count();
    Some(inter as f64 / union as f64)
}

/// Score a single name/key pair, returning the score and winning strategy.
pub fn score_pair(name: &str, key: &str) -> (f64, MatchStrategy) {
    let a = normalize(name);
    let b = normalize(key);

    if !a.is_empty() && a == b {
        return (1.0, MatchStrategy::NormalizedExact);
    }
    if !a.is_empty() && !b.is_empty() && (a.contains(&b) || b.contains(&a)) {
        return (SUBSTRING_SCORE, MatchStrategy::Substring);
    }

    let a_tokens: FxHashSet<String> = tokens(&a).into_iter().collect();
    let mut best = (0.0, MatchStrategy::Levenshtein);
    if let Some(overlap) = token_overlap(&a_tokens, &b) {
        best = (0.6 + 0.4 * overlap, MatchStrategy::TokenOverlap);
    }
    if best.0 < LEVENSHTEIN_GATE {
        let sim = levenshtein_ratio(&a, &b);
        if sim > best.0 {
            best = (sim, MatchStrategy::Levenshtein);
        }
    }
    best
}

/// Find the best roster candidate for a free-text school name.
///
/// Returns `None` only for an empty name or empty roster; callers compare
/// the returned score against their acceptance threshold.
pub fn best_match(school: &str, roster: &RegionMap) -> Option<Candidate> {
    let ns = normalize(school);
    if ns.is_empty() || roster.is_empty() {
        return None;
    }

    // 1. exact key lookup (roster keys are already normalized)
    if roster.contains_key(&ns) {
        return Some(Candidate {
            key: ns,
            score: 1.0,
            strategy: MatchStrategy::NormalizedExact,
        });
    }

    // 2. substring containment; every hit scores the same, take the first
    let mut best: Option<Candidate> = None;
    for key in roster.keys() {
        if key.is_empty() {
            continue;
        }
        if ns.contains(key.as_str()) || key.contains(&ns) {
            best = Some(Candidate {
                key: key.clone(),
                score: SUBSTRING_SCORE,
                strategy: MatchStrategy::Substring,
            });
            break;
        }
    }

    // 3. best token overlap across the roster
    if best.is_none() {
        let name_tokens: FxHashSet<String> = tokens(&ns).into_iter().collect();
        for key in roster.keys() {
            if let Some(overlap) = token_overlap(&name_tokens, key) {
                let score = 0.6 + 0.4 * overlap;
                if best.as_ref().map_or(true, |b| score > b.score) {
                    best = Some(Candidate {
                        key: key.clone(),
                        score,
                        strategy: MatchStrategy::TokenOverlap,
                    });
                }
            }
        }
    }

    // 4. Levenshtein fallback while nothing confident was found
    if best.as_ref().map_or(true, |b| b.score < LEVENSHTEIN_GATE) {
        for key in roster.keys() {
            let sim = levenshtein_ratio(&ns, key);
            if best.as_ref().map_or(sim > 0.0, |b| sim > b.score) {
                best = Some(Candidate {
                    key: key.clone(),
                    score: sim,
                    strategy: MatchStrategy::Levenshtein,
                });
            }
        }
    }

    best
}
