//! Core data models for the region backfill.
//!
//! Struct definitions shared across the roster loader, the matching drivers
//! and the store layer.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

// ============================================================================
// Type Aliases
// ============================================================================

/// Roster mapping: normalized school name -> region label.
pub type RegionMap = FxHashMap<String, String>;

// ============================================================================
// Target Records
// ============================================================================

/// Flat per-subject visit record (the `visit_entries` collection).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VisitEntry {
    pub id: String,
    pub staff: String,
    pub school: String,
    pub region: String,
    pub teacher: String,
    pub subject: String,
    /// ISO date or datetime string; empty when unknown.
    pub visit_date: String,
    pub source_doc: Option<String>,
    pub source_visit_index: Option<i64>,
    pub source_subject_index: Option<i64>,
    pub migrated_at: Option<String>,
}

/// Aggregated parent document (the `visits` collection). The embedded visit
/// list is stored as a single JSON value and always rewritten whole.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VisitDoc {
    pub id: String,
    #[serde(default)]
    pub staff: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub visits: Vec<EmbeddedVisit>,
}

/// One visit inside an aggregated document. Newer documents carry a
/// `subjects` list; legacy ones put a single subject/teacher inline.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EmbeddedVisit {
    #[serde(default)]
    pub school: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub visit_date: String,
    #[serde(default)]
    pub subjects: Vec<SubjectNote>,
    // legacy inline fields, used when `subjects` is empty
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub teacher: String,
}

/// Per-subject meeting notes inside an embedded visit.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SubjectNote {
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub teacher: String,
    #[serde(default)]
    pub contact: String,
    #[serde(default)]
    pub meetings: Vec<String>,
    #[serde(default)]
    pub conversation: String,
    #[serde(default)]
    pub follow_up: String,
}

// ============================================================================
// Match Results
// ============================================================================

/// Which scorer strategy produced a match. Retained on every planned change
/// so dry-run output stays auditable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    NormalizedExact,
    Substring,
    TokenOverlap,
    Levenshtein,
}

impl MatchStrategy {
    pub fn label(self) -> &'static str {
        match self {
            MatchStrategy::NormalizedExact => "normalized exact",
            MatchStrategy::Substring => "substring",
            MatchStrategy::TokenOverlap => "token overlap",
            MatchStrategy::Levenshtein => "levenshtein",
        }
    }
}

/// Ephemeral result of matching one record against the roster. Only the
/// `region` value is ever written back to the store.
#[derive(Clone, Debug, Serialize)]
pub struct PlannedChange {
    pub record_id: String,
    pub school: String,
    pub matched_key: String,
    pub region: String,
    pub score: f64,
    pub strategy: MatchStrategy,
}

// ============================================================================
// Cost Model
// ============================================================================

/// Advisory per-operation pricing, USD per 100k operations. Defaults match
/// the Firestore list prices the original tooling assumed; override via
/// `--price-reads` / `--price-writes`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CostModel {
    pub per_100k_reads: f64,
    pub per_100k_writes: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            per_100k_reads: 0.06,
            per_100k_writes: 0.18,
        }
    }
}

impl CostModel {
    pub fn estimate(&self, reads: u64, writes: u64) -> f64 {
        reads as f64 * (self.per_100k_reads / 100_000.0)
            + writes as f64 * (self.per_100k_writes / 100_000.0)
    }
}

// ============================================================================
// Run Statistics
// ============================================================================

/// Aggregate counters for one backfill run.
#[derive(Default, Debug, Clone, Serialize)]
pub struct BackfillStats {
    pub scanned: usize,
    pub already_mapped: usize,
    pub filtered_out: usize,
    pub planned: usize,
    pub updated: usize,
    pub no_confident_match: usize,
    /// Confident matches whose roster row carries no region to fill.
    pub empty_roster_region: usize,
    pub read_errors: usize,

    // per-strategy counts for accepted matches
    pub exact_matches: usize,
    pub substring_matches: usize,
    pub token_overlap_matches: usize,
    pub levenshtein_matches: usize,

    pub reads: u64,
    pub writes: u64,
    pub estimated_cost_usd: f64,
    pub elapsed_seconds: f64,
}

impl BackfillStats {
    pub fn record_strategy(&mut self, strategy: MatchStrategy) {
        match strategy {
            MatchStrategy::NormalizedExact => self.exact_matches += 1,
            MatchStrategy::Substring => self.substring_matches += 1,
            MatchStrategy::TokenOverlap => self.token_overlap_matches += 1,
            MatchStrategy::Levenshtein => self.levenshtein_matches += 1,
        }
    }

    /// Log stats to stderr in JSON format.
    pub fn log_phase(&self, phase: &str) {
        if let Ok(json) = serde_json::to_string_pretty(self) {
            eprintln!("[STATS:{}]\n{}", phase, json);
        }
    }
}

/// Full result of a backfill pass: counters plus the capped change sample.
/// In dry-run mode `sample` holds planned (unapplied) changes.
#[derive(Debug, Clone, Serialize)]
pub struct BackfillReport {
    pub collection: String,
    pub dry_run: bool,
    pub stats: BackfillStats,
    pub sample: Vec<PlannedChange>,
}

impl BackfillReport {
    /// Write the report to a JSON file.
    pub fn write_to_file(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
