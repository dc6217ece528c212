//! Region backfill driver.
//!
//! Pages through the target collections, scores each unmapped school name
//! against the roster, and either reports the planned changes (dry-run,
//! the default) or applies them as bounded batch writes. Execution is
//! strictly sequential: one page read, then the page's batched writes,
//! then the checkpoint, then the next page.
//!
//! A record whose region is already populated is never touched, whatever
//! the scorer says. That gate also makes apply runs idempotent: a second
//! pass over the same data plans zero updates.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use chrono::NaiveDate;

use crate::checkpoint::{self, Checkpoint};
use crate::models::{
    BackfillReport, BackfillStats, CostModel, EmbeddedVisit, PlannedChange, RegionMap,
};
use crate::progress::{create_spinner, log_progress};
use crate::scoring::{best_match, DEFAULT_THRESHOLD};
use crate::store::{VisitStore, MAX_BATCH_WRITES};

// ============================================================================
// Options
// ============================================================================

#[derive(Clone, Debug)]
pub struct BackfillOptions {
    /// Report planned changes without mutating. Default.
    pub dry_run: bool,
    /// Scorer acceptance cutoff in [0, 1].
    pub threshold: f64,
    pub page_size: usize,
    pub batch_size: usize,
    /// Stop after examining this many records.
    pub scan_limit: Option<usize>,
    /// Only consider visits on or after this date; undated records are kept.
    pub since: Option<NaiveDate>,
    /// Scope the run to one staff member.
    pub staff: Option<String>,
    /// Cap on the change sample carried in the report.
    pub sample_limit: usize,
    pub checkpoint_file: Option<PathBuf>,
    pub resume: bool,
    pub costs: CostModel,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self {
            dry_run: true,
            threshold: DEFAULT_THRESHOLD,
            page_size: 500,
            batch_size: MAX_BATCH_WRITES,
            scan_limit: None,
            since: None,
            staff: None,
            sample_limit: 200,
            checkpoint_file: None,
            resume: false,
            costs: CostModel::default(),
        }
    }
}

impl BackfillOptions {
    fn clamped_batch(&self) -> usize {
        self.batch_size.clamp(1, MAX_BATCH_WRITES)
    }
}

/// Parse the leading `YYYY-MM-DD` of an ISO date or datetime string.
pub(crate) fn parse_visit_date(s: &str) -> Option<NaiveDate> {
    let head = s.trim().get(..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

fn before_since(date_str: &str, since: Option<NaiveDate>) -> bool {
    match (since, parse_visit_date(date_str)) {
        (Some(since), Some(d)) => d < since,
        _ => false,
    }
}

/// Resolve the resume cursor for a collection, if any. A missing or
/// unreadable checkpoint starts from the beginning (with a warning),
/// matching the recoverable-failure ladder.
fn resume_cursor(opts: &BackfillOptions, collection: &str) -> Option<String> {
    if !opts.resume {
        return None;
    }
    let path = opts.checkpoint_file.as_ref()?;
    match checkpoint::load(path) {
        Ok(Some(cp)) if cp.collection == collection => {
            eprintln!("Resuming {} after {}", collection, cp.last_doc_id);
            Some(cp.last_doc_id)
        }
        Ok(Some(cp)) => {
            eprintln!(
                "warning: checkpoint is for '{}', scanning {} from the beginning",
                cp.collection, collection
            );
            None
        }
        Ok(None) => None,
        Err(e) => {
            eprintln!("warning: could not read checkpoint, starting from the beginning: {:#}", e);
            None
        }
    }
}

// ============================================================================
// Flat Entries
// ============================================================================

/// Backfill missing regions on the flat `visit_entries` collection.
pub fn backfill_entries(
    store: &mut VisitStore,
    roster: &RegionMap,
    opts: &BackfillOptions,
) -> Result<BackfillReport> {
    let start = Instant::now();
    let reads_before = store.reads();
    let writes_before = store.writes();

    let mut stats = BackfillStats::default();
    let mut sample: Vec<PlannedChange> = Vec::new();
    let mut cursor = resume_cursor(opts, "visit_entries");
    let batch_limit = opts.clamped_batch();
    let spinner = create_spinner("Scanning visit_entries");
    let mut done = false;

    while !done {
        let page = store.entry_page(cursor.as_deref(), opts.page_size)?;
        if page.is_empty() {
            break;
        }
        // id of the last record actually examined; the scan limit can stop
        // mid-page, and the checkpoint must not advance past unscanned rows
        let mut page_last: Option<String> = None;
        let mut page_updates: Vec<(String, String)> = Vec::new();

        for entry in &page {
            if opts.scan_limit.is_some_and(|limit| stats.scanned >= limit) {
                done = true;
                break;
            }
            stats.scanned += 1;
            page_last = Some(entry.id.clone());
            spinner.set_message(format!("Scanning visit_entries ({})", stats.scanned));
            log_progress("backfill:entries", stats.scanned as u64, 1000);

            if opts.staff.as_deref().is_some_and(|s| s != entry.staff) {
                stats.filtered_out += 1;
                continue;
            }
            if before_since(&entry.visit_date, opts.since) {
                stats.filtered_out += 1;
                continue;
            }
            if entry.school.trim().is_empty() {
                stats.filtered_out += 1;
                continue;
            }
            if !entry.region.trim().is_empty() {
                stats.already_mapped += 1;
                continue;
            }

            match best_match(&entry.school, roster) {
                Some(c) if c.score >= opts.threshold => {
                    let region = roster[&c.key].clone();
                    if region.is_empty() {
                        // roster row had the school but no region to fill
                        stats.empty_roster_region += 1;
                        continue;
                    }
                    stats.planned += 1;
                    stats.record_strategy(c.strategy);
                    if sample.len() < opts.sample_limit {
                        sample.push(PlannedChange {
                            record_id: entry.id.clone(),
                            school: entry.school.clone(),
                            matched_key: c.key,
                            region: region.clone(),
                            score: c.score,
                            strategy: c.strategy,
                        });
                    }
                    if !opts.dry_run {
                        page_updates.push((entry.id.clone(), region));
                    }
                }
                _ => stats.no_confident_match += 1,
            }
        }

        if !opts.dry_run {
            // a failed batch commit aborts the run; the checkpoint still
            // points at the last fully committed page
            for chunk in page_updates.chunks(batch_limit) {
                store.update_entry_regions(chunk)?;
                stats.updated += chunk.len();
            }
            if let (Some(cp_path), Some(last_id)) = (&opts.checkpoint_file, &page_last) {
                let mut cp = Checkpoint::new("visit_entries", last_id);
                cp.committed = stats.updated as u64;
                checkpoint::save(cp_path, &cp)?;
            }
        }
        match page_last {
            Some(id) => cursor = Some(id),
            None => break,
        }
    }

    spinner.finish_with_message(format!(
        "visit_entries: scanned {}, planned {}",
        stats.scanned, stats.planned
    ));

    stats.reads = store.reads() - reads_before;
    stats.writes = store.writes() - writes_before;
    stats.estimated_cost_usd = opts.costs.estimate(stats.reads, stats.writes);
    stats.elapsed_seconds = start.elapsed().as_secs_f64();

    Ok(BackfillReport {
        collection: "visit_entries".to_string(),
        dry_run: opts.dry_run,
        stats,
        sample,
    })
}

// ============================================================================
// Aggregated Documents
// ============================================================================

/// Backfill missing regions inside aggregated `visits` documents. A changed
/// document has its whole embedded list rewritten in one update.
///
/// `scanned` counts documents; the match tallies (`already_mapped`,
/// `planned`, `no_confident_match`) count embedded visit slots.
pub fn backfill_docs(
    store: &mut VisitStore,
    roster: &RegionMap,
    opts: &BackfillOptions,
) -> Result<BackfillReport> {
    let start = Instant::now();
    let reads_before = store.reads();
    let writes_before = store.writes();

    let mut stats = BackfillStats::default();
    let mut sample: Vec<PlannedChange> = Vec::new();
    let mut cursor = resume_cursor(opts, "visits");
    let batch_limit = opts.clamped_batch();
    let spinner = create_spinner("Scanning visits");
    let mut done = false;

    while !done {
        let page = store.doc_page(cursor.as_deref(), opts.page_size)?;
        if page.is_empty() {
            break;
        }
        let mut page_last: Option<String> = None;
        let mut doc_updates: Vec<(String, String)> = Vec::new();

        for raw in &page {
            if opts.scan_limit.is_some_and(|limit| stats.scanned >= limit) {
                done = true;
                break;
            }
            stats.scanned += 1;
            page_last = Some(raw.id.clone());
            spinner.set_message(format!("Scanning visits ({})", stats.scanned));
            log_progress("backfill:visits", stats.scanned as u64, 1000);

            if opts.staff.as_deref().is_some_and(|s| s != raw.staff) {
                stats.filtered_out += 1;
                continue;
            }

            let mut visits: Vec<EmbeddedVisit> = match serde_json::from_str(&raw.visits_json) {
                Ok(v) => v,
                Err(e) => {
                    // per-record failure: log, count, keep scanning
                    eprintln!(
                        "warning: skipping visits doc {}: bad embedded list: {}",
                        raw.id, e
                    );
                    stats.read_errors += 1;
                    continue;
                }
            };

            let mut changed = false;
            for (vi, v) in visits.iter_mut().enumerate() {
                if before_since(&v.visit_date, opts.since) {
                    continue;
                }
                if v.school.trim().is_empty() {
                    continue;
                }
                if !v.region.trim().is_empty() {
                    stats.already_mapped += 1;
                    continue;
                }
                match best_match(&v.school, roster) {
                    Some(c) if c.score >= opts.threshold => {
                        let region = roster[&c.key].clone();
                        if region.is_empty() {
                            stats.empty_roster_region += 1;
                            continue;
                        }
                        stats.planned += 1;
                        stats.record_strategy(c.strategy);
                        if sample.len() < opts.sample_limit {
                            sample.push(PlannedChange {
                                record_id: format!("{}#{}", raw.id, vi),
                                school: v.school.clone(),
                                matched_key: c.key,
                                region: region.clone(),
                                score: c.score,
                                strategy: c.strategy,
                            });
                        }
                        if !opts.dry_run {
                            v.region = region;
                            changed = true;
                        }
                    }
                    _ => stats.no_confident_match += 1,
                }
            }

            if changed {
                doc_updates.push((raw.id.clone(), serde_json::to_string(&visits)?));
            }
        }

        if !opts.dry_run {
            for chunk in doc_updates.chunks(batch_limit) {
                store.replace_doc_visits(chunk)?;
                stats.updated += chunk.len();
            }
            if let (Some(cp_path), Some(last_id)) = (&opts.checkpoint_file, &page_last) {
                let mut cp = Checkpoint::new("visits", last_id);
                cp.committed = stats.updated as u64;
                checkpoint::save(cp_path, &cp)?;
            }
        }
        match page_last {
            Some(id) => cursor = Some(id),
            None => break,
        }
    }

    spinner.finish_with_message(format!(
        "visits: scanned {}, planned {}",
        stats.scanned, stats.planned
    ));

    stats.reads = store.reads() - reads_before;
    stats.writes = store.writes() - writes_before;
    stats.estimated_cost_usd = opts.costs.estimate(stats.reads, stats.writes);
    stats.elapsed_seconds = start.elapsed().as_secs_f64();

    Ok(BackfillReport {
        collection: "visits".to_string(),
        dry_run: opts.dry_run,
        stats,
        sample,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MatchStrategy, VisitDoc, VisitEntry};
    use crate::normalize::normalize;

    fn roster() -> RegionMap {
        [("서울고등학교", "서울"), ("과천고등학교", "경기")]
            .iter()
            .map(|(k, v)| (normalize(k), v.to_string()))
            .collect()
    }

    fn entry(id: &str, school: &str, region: &str) -> VisitEntry {
        VisitEntry {
            id: id.to_string(),
            school: school.to_string(),
            region: region.to_string(),
            ..Default::default()
        }
    }

    fn apply_opts() -> BackfillOptions {
        BackfillOptions {
            dry_run: false,
            page_size: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_exact_match_fills_region() {
        let mut store = VisitStore::open_in_memory().unwrap();
        store.insert_entries(&[entry("e1", "서울고등학교", "")]).unwrap();

        let report = backfill_entries(&mut store, &roster(), &apply_opts()).unwrap();
        assert_eq!(report.stats.planned, 1);
        assert_eq!(report.stats.updated, 1);
        assert_eq!(report.sample[0].score, 1.0);
        assert_eq!(report.sample[0].strategy, MatchStrategy::NormalizedExact);
        assert_eq!(store.get_entry("e1").unwrap().unwrap().region, "서울");
    }

    #[test]
    fn test_substring_match_fills_region() {
        let mut store = VisitStore::open_in_memory().unwrap();
        store.insert_entries(&[entry("e1", "과천고", "")]).unwrap();

        let report = backfill_entries(&mut store, &roster(), &apply_opts()).unwrap();
        assert_eq!(report.stats.planned, 1);
        assert_eq!(report.sample[0].strategy, MatchStrategy::Substring);
        assert!((report.sample[0].score - 0.95).abs() < 1e-9);
        assert_eq!(store.get_entry("e1").unwrap().unwrap().region, "경기");
    }

    #[test]
    fn test_unknown_school_left_unmapped() {
        let mut store = VisitStore::open_in_memory().unwrap();
        store.insert_entries(&[entry("e1", "존재하지않는학교", "")]).unwrap();

        let report = backfill_entries(&mut store, &roster(), &apply_opts()).unwrap();
        assert_eq!(report.stats.planned, 0);
        assert_eq!(report.stats.no_confident_match, 1);
        assert_eq!(store.get_entry("e1").unwrap().unwrap().region, "");
    }

    #[test]
    fn test_populated_region_never_touched() {
        let mut store = VisitStore::open_in_memory().unwrap();
        store.insert_entries(&[entry("e1", "서울고등학교", "대구")]).unwrap();

        let report = backfill_entries(&mut store, &roster(), &apply_opts()).unwrap();
        assert_eq!(report.stats.planned, 0);
        assert_eq!(report.stats.already_mapped, 1);
        assert_eq!(store.get_entry("e1").unwrap().unwrap().region, "대구");
    }

    #[test]
    fn test_dry_run_issues_zero_writes() {
        let mut store = VisitStore::open_in_memory().unwrap();
        let batch: Vec<VisitEntry> = (0..10)
            .map(|i| entry(&format!("e{:02}", i), "서울고등학교", ""))
            .collect();
        store.insert_entries(&batch).unwrap();

        let opts = BackfillOptions {
            page_size: 3,
            ..Default::default()
        };
        assert!(opts.dry_run);
        let report = backfill_entries(&mut store, &roster(), &opts).unwrap();
        assert_eq!(report.stats.planned, 10);
        assert_eq!(report.stats.writes, 0);
        assert_eq!(store.get_entry("e00").unwrap().unwrap().region, "");
    }

    #[test]
    fn test_second_run_updates_nothing() {
        let mut store = VisitStore::open_in_memory().unwrap();
        store
            .insert_entries(&[
                entry("e1", "서울고등학교", ""),
                entry("e2", "과천고", ""),
                entry("e3", "존재하지않는학교", ""),
            ])
            .unwrap();

        let first = backfill_entries(&mut store, &roster(), &apply_opts()).unwrap();
        assert_eq!(first.stats.updated, 2);

        let second = backfill_entries(&mut store, &roster(), &apply_opts()).unwrap();
        assert_eq!(second.stats.updated, 0);
        assert_eq!(second.stats.already_mapped, 2);
        assert_eq!(second.stats.no_confident_match, 1);
    }

    #[test]
    fn test_staff_and_since_filters() {
        let mut store = VisitStore::open_in_memory().unwrap();
        let mut old = entry("e1", "서울고등학교", "");
        old.visit_date = "2024-01-15".to_string();
        old.staff = "김영희".to_string();
        let mut recent = entry("e2", "과천고등학교", "");
        recent.visit_date = "2025-06-01T10:00:00Z".to_string();
        recent.staff = "박철수".to_string();
        store.insert_entries(&[old, recent]).unwrap();

        let opts = BackfillOptions {
            dry_run: false,
            since: Some(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()),
            staff: Some("박철수".to_string()),
            ..Default::default()
        };
        let report = backfill_entries(&mut store, &roster(), &opts).unwrap();
        assert_eq!(report.stats.filtered_out, 1);
        assert_eq!(report.stats.updated, 1);
        assert_eq!(store.get_entry("e1").unwrap().unwrap().region, "");
        assert_eq!(store.get_entry("e2").unwrap().unwrap().region, "경기");
    }

    #[test]
    fn test_scan_limit_stops_early() {
        let mut store = VisitStore::open_in_memory().unwrap();
        let batch: Vec<VisitEntry> = (0..10)
            .map(|i| entry(&format!("e{:02}", i), "서울고등학교", ""))
            .collect();
        store.insert_entries(&batch).unwrap();

        let opts = BackfillOptions {
            scan_limit: Some(4),
            page_size: 3,
            ..Default::default()
        };
        let report = backfill_entries(&mut store, &roster(), &opts).unwrap();
        assert_eq!(report.stats.scanned, 4);
    }

    #[test]
    fn test_docs_backfill_rewrites_embedded_list() {
        let mut store = VisitStore::open_in_memory().unwrap();
        let doc = VisitDoc {
            id: "d1".to_string(),
            visits: vec![
                EmbeddedVisit {
                    school: "서울고등학교".to_string(),
                    region: String::new(),
                    ..Default::default()
                },
                EmbeddedVisit {
                    school: "과천고등학교".to_string(),
                    region: "경기".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        store.insert_docs(&[doc]).unwrap();

        let report = backfill_docs(&mut store, &roster(), &apply_opts()).unwrap();
        assert_eq!(report.stats.planned, 1);
        assert_eq!(report.stats.already_mapped, 1);
        assert_eq!(report.stats.updated, 1);
        assert_eq!(report.sample[0].record_id, "d1#0");

        let page = store.doc_page(None, 10).unwrap();
        let visits: Vec<EmbeddedVisit> = serde_json::from_str(&page[0].visits_json).unwrap();
        assert_eq!(visits[0].region, "서울");
        assert_eq!(visits[1].region, "경기");
    }

    #[test]
    fn test_docs_bad_json_is_skipped() {
        let mut store = VisitStore::open_in_memory().unwrap();
        store
            .insert_docs(&[VisitDoc {
                id: "good".to_string(),
                visits: vec![EmbeddedVisit {
                    school: "서울고등학교".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }])
            .unwrap();
        // corrupt one document directly
        store
            .insert_docs(&[VisitDoc {
                id: "bad".to_string(),
                ..Default::default()
            }])
            .unwrap();
        store
            .replace_doc_visits(&[("bad".to_string(), "not valid json".to_string())])
            .unwrap();

        let report = backfill_docs(&mut store, &roster(), &apply_opts()).unwrap();
        assert_eq!(report.stats.read_errors, 1);
        assert_eq!(report.stats.updated, 1);
    }

    #[test]
    fn test_checkpoint_written_and_resumed() {
        let dir = std::env::temp_dir().join("cmass-backfill-test");
        std::fs::create_dir_all(&dir).unwrap();
        let cp_path = dir.join(format!("cp-{}.json", std::process::id()));
        std::fs::remove_file(&cp_path).ok();

        let mut store = VisitStore::open_in_memory().unwrap();
        store
            .insert_entries(&[entry("e1", "서울고등학교", ""), entry("e2", "과천고", "")])
            .unwrap();

        let opts = BackfillOptions {
            dry_run: false,
            checkpoint_file: Some(cp_path.clone()),
            ..Default::default()
        };
        backfill_entries(&mut store, &roster(), &opts).unwrap();

        let cp = checkpoint::load(&cp_path).unwrap().unwrap();
        assert_eq!(cp.collection, "visit_entries");
        assert_eq!(cp.last_doc_id, "e2");

        // resuming after the final id scans nothing
        let opts = BackfillOptions {
            resume: true,
            ..opts
        };
        let report = backfill_entries(&mut store, &roster(), &opts).unwrap();
        assert_eq!(report.stats.scanned, 0);

        std::fs::remove_file(&cp_path).ok();
    }

    #[test]
    fn test_scan_limit_checkpoints_last_scanned_record() {
        let dir = std::env::temp_dir().join("cmass-backfill-test");
        std::fs::create_dir_all(&dir).unwrap();
        let cp_path = dir.join(format!("cp-limit-{}.json", std::process::id()));
        std::fs::remove_file(&cp_path).ok();

        let mut store = VisitStore::open_in_memory().unwrap();
        let batch: Vec<VisitEntry> = (0..5)
            .map(|i| entry(&format!("e{}", i), "서울고등학교", ""))
            .collect();
        store.insert_entries(&batch).unwrap();

        // the limit stops the scan mid-page; the checkpoint must record the
        // last record examined, not the page boundary
        let opts = BackfillOptions {
            dry_run: false,
            page_size: 4,
            scan_limit: Some(2),
            checkpoint_file: Some(cp_path.clone()),
            ..Default::default()
        };
        let first = backfill_entries(&mut store, &roster(), &opts).unwrap();
        assert_eq!(first.stats.scanned, 2);

        let cp = checkpoint::load(&cp_path).unwrap().unwrap();
        assert_eq!(cp.last_doc_id, "e1");

        let opts = BackfillOptions {
            scan_limit: None,
            resume: true,
            ..opts
        };
        let second = backfill_entries(&mut store, &roster(), &opts).unwrap();
        assert_eq!(second.stats.scanned, 3);
        assert_eq!(store.get_entry("e2").unwrap().unwrap().region, "서울");
        assert_eq!(store.get_entry("e4").unwrap().unwrap().region, "서울");

        std::fs::remove_file(&cp_path).ok();
    }

    #[test]
    fn test_empty_roster_region_counted_separately() {
        let mut store = VisitStore::open_in_memory().unwrap();
        store.insert_entries(&[entry("e1", "미정고등학교", "")]).unwrap();
        let mut r = roster();
        r.insert(normalize("미정고등학교"), String::new());

        let report = backfill_entries(&mut store, &r, &apply_opts()).unwrap();
        assert_eq!(report.stats.empty_roster_region, 1);
        assert_eq!(report.stats.no_confident_match, 0);
        assert_eq!(report.stats.planned, 0);
        assert_eq!(store.get_entry("e1").unwrap().unwrap().region, "");
    }

    #[test]
    fn test_parse_visit_date() {
        assert_eq!(
            parse_visit_date("2025-06-01T10:00:00Z"),
            NaiveDate::from_ymd_opt(2025, 6, 1)
        );
        assert_eq!(parse_visit_date("2025-06-01"), NaiveDate::from_ymd_opt(2025, 6, 1));
        assert_eq!(parse_visit_date(""), None);
        assert_eq!(parse_visit_date("어제"), None);
    }
}
