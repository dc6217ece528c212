//! One-time migration that flattens aggregated `visits` documents into the
//! per-subject `visit_entries` collection.
//!
//! Every (document, visit index, subject index) triple maps to one flat
//! entry under a deterministic id, so re-running the migration targets the
//! same ids instead of minting duplicates. `--idempotent` adds existence
//! probes before writing; a previously written manifest skips the probes
//! entirely for ids it already lists.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rustc_hash::FxHashSet;
use serde::Serialize;

use crate::backfill::parse_visit_date;
use crate::checkpoint::{self, Checkpoint};
use crate::models::{CostModel, EmbeddedVisit, SubjectNote, VisitEntry};
use crate::progress::{create_spinner, log_progress};
use crate::store::{VisitStore, MAX_BATCH_WRITES};

/// Stable id for the flat entry derived from one subject of one visit.
pub fn deterministic_id(doc_id: &str, visit_index: usize, subject_index: usize) -> String {
    format!("{}_{}_{}", doc_id, visit_index, subject_index)
}

// ============================================================================
// Options and Stats
// ============================================================================

#[derive(Clone, Debug)]
pub struct MigrateOptions {
    /// Report what would be written without mutating. Default.
    pub dry_run: bool,
    /// Probe for existing entries before writing instead of blind upserts.
    pub idempotent: bool,
    /// Only migrate visits on or after this date; undated visits are kept.
    pub since: Option<NaiveDate>,
    pub page_size: usize,
    pub batch_size: usize,
    pub scan_limit: Option<usize>,
    /// Ledger of already-written ids; skips probes for listed ids.
    pub manifest_file: Option<PathBuf>,
    pub checkpoint_file: Option<PathBuf>,
    pub resume: bool,
    pub sample_limit: usize,
    pub costs: CostModel,
}

impl Default for MigrateOptions {
    fn default() -> Self {
        Self {
            dry_run: true,
            idempotent: false,
            since: None,
            page_size: 500,
            batch_size: MAX_BATCH_WRITES,
            scan_limit: None,
            manifest_file: None,
            checkpoint_file: None,
            resume: false,
            sample_limit: 200,
            costs: CostModel::default(),
        }
    }
}

#[derive(Default, Debug, Clone, Serialize)]
pub struct MigrateStats {
    pub docs_scanned: usize,
    pub entries_identified: usize,
    pub skipped_since: usize,
    pub skipped_manifest: usize,
    pub skipped_existing: usize,
    pub written: usize,
    pub read_errors: usize,
    pub reads: u64,
    pub writes: u64,
    pub estimated_cost_usd: f64,
    pub elapsed_seconds: f64,
}

impl MigrateStats {
    pub fn log_phase(&self, phase: &str) {
        if let Ok(json) = serde_json::to_string_pretty(self) {
            eprintln!("[STATS:{}]\n{}", phase, json);
        }
    }
}

/// Result of a migration pass. In dry-run mode `sample` holds entries that
/// would have been written.
#[derive(Debug, Clone, Serialize)]
pub struct MigrateReport {
    pub dry_run: bool,
    pub stats: MigrateStats,
    pub sample: Vec<VisitEntry>,
}

impl MigrateReport {
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

// ============================================================================
// Manifest
// ============================================================================

/// Ids already migrated in earlier runs. Stored as a JSON array; an
/// unreadable manifest degrades to an empty one with a warning, since the
/// idempotent probes still prevent duplicates.
struct Manifest {
    path: Option<PathBuf>,
    order: Vec<String>,
    seen: FxHashSet<String>,
}

impl Manifest {
    fn load(path: Option<&Path>) -> Self {
        let mut m = Manifest {
            path: path.map(Path::to_path_buf),
            order: Vec::new(),
            seen: FxHashSet::default(),
        };
        let Some(path) = path else { return m };
        if !path.exists() {
            return m;
        }
        match std::fs::read_to_string(path)
            .map_err(anyhow::Error::from)
            .and_then(|raw| serde_json::from_str::<Vec<String>>(&raw).map_err(Into::into))
        {
            Ok(ids) => {
                for id in ids {
                    if m.seen.insert(id.clone()) {
                        m.order.push(id);
                    }
                }
            }
            Err(e) => eprintln!(
                "warning: could not read manifest {}, continuing without it: {:#}",
                path.display(),
                e
            ),
        }
        m
    }

    fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    /// Add newly written ids and persist (temp file, then rename).
    fn record(&mut self, ids: &[String]) -> Result<()> {
        for id in ids {
            if self.seen.insert(id.clone()) {
                self.order.push(id.clone());
            }
        }
        let Some(path) = &self.path else { return Ok(()) };
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&self.order)?;
        std::fs::write(&tmp, json)
            .with_context(|| format!("failed to write manifest temp file {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to replace manifest file {}", path.display()))?;
        Ok(())
    }
}

// ============================================================================
// Driver
// ============================================================================

fn resume_cursor(opts: &MigrateOptions) -> Option<String> {
    if !opts.resume {
        return None;
    }
    let path = opts.checkpoint_file.as_ref()?;
    match checkpoint::load(path) {
        Ok(Some(cp)) if cp.collection == "migrate" => {
            eprintln!("Resuming migration after {}", cp.last_doc_id);
            Some(cp.last_doc_id)
        }
        Ok(Some(cp)) => {
            eprintln!(
                "warning: checkpoint is for '{}', migrating from the beginning",
                cp.collection
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

/// Flatten one visit into entries, one per subject. Legacy visits without a
/// subjects list become a single entry from the inline fields.
fn flatten_visit(
    doc_id: &str,
    doc_staff: &str,
    doc_created_at: &str,
    vi: usize,
    visit: &EmbeddedVisit,
    migrated_at: &str,
) -> Vec<VisitEntry> {
    let legacy;
    let subjects: &[SubjectNote] = if visit.subjects.is_empty() {
        legacy = [SubjectNote {
            subject: visit.subject.clone(),
            teacher: visit.teacher.clone(),
            ..Default::default()
        }];
        &legacy
    } else {
        &visit.subjects
    };

    let visit_date = if visit.visit_date.is_empty() {
        doc_created_at
    } else {
        &visit.visit_date
    };

    subjects
        .iter()
        .enumerate()
        .map(|(si, s)| VisitEntry {
            id: deterministic_id(doc_id, vi, si),
            staff: doc_staff.to_string(),
            school: visit.school.clone(),
            region: visit.region.clone(),
            teacher: s.teacher.clone(),
            subject: s.subject.clone(),
            visit_date: visit_date.to_string(),
            source_doc: Some(doc_id.to_string()),
            source_visit_index: Some(vi as i64),
            source_subject_index: Some(si as i64),
            migrated_at: Some(migrated_at.to_string()),
        })
        .collect()
}

/// Run the flattening migration over all aggregated documents.
pub fn migrate_docs(store: &mut VisitStore, opts: &MigrateOptions) -> Result<MigrateReport> {
    let start = Instant::now();
    let reads_before = store.reads();
    let writes_before = store.writes();

    let mut stats = MigrateStats::default();
    let mut sample: Vec<VisitEntry> = Vec::new();
    let mut manifest = Manifest::load(opts.manifest_file.as_deref());
    let mut cursor = resume_cursor(opts);
    let batch_limit = opts.batch_size.clamp(1, MAX_BATCH_WRITES);
    let migrated_at = chrono::Utc::now().to_rfc3339();
    let spinner = create_spinner("Migrating visits");
    let mut done = false;
    // probes the dry run would issue in idempotent mode
    let mut projected_probe_reads: u64 = 0;

    while !done {
        let page = store.doc_page(cursor.as_deref(), opts.page_size)?;
        if page.is_empty() {
            break;
        }
        // id of the last document actually examined; the scan limit can
        // stop mid-page, and the checkpoint must not skip unscanned docs
        let mut page_last: Option<String> = None;
        let mut candidates: Vec<VisitEntry> = Vec::new();

        for raw in &page {
            if opts.scan_limit.is_some_and(|limit| stats.docs_scanned >= limit) {
                done = true;
                break;
            }
            stats.docs_scanned += 1;
            page_last = Some(raw.id.clone());
            spinner.set_message(format!("Migrating visits ({})", stats.docs_scanned));
            log_progress("migrate", stats.docs_scanned as u64, 1000);

            let visits: Vec<EmbeddedVisit> = match serde_json::from_str(&raw.visits_json) {
                Ok(v) => v,
                Err(e) => {
                    eprintln!(
                        "warning: skipping visits doc {}: bad embedded list: {}",
                        raw.id, e
                    );
                    stats.read_errors += 1;
                    continue;
                }
            };

            for (vi, visit) in visits.iter().enumerate() {
                let entries =
                    flatten_visit(&raw.id, &raw.staff, &raw.created_at, vi, visit, &migrated_at);
                for entry in entries {
                    stats.entries_identified += 1;
                    if opts
                        .since
                        .is_some_and(|since| parse_visit_date(&entry.visit_date).is_some_and(|d| d < since))
                    {
                        stats.skipped_since += 1;
                        continue;
                    }
                    if manifest.contains(&entry.id) {
                        stats.skipped_manifest += 1;
                        continue;
                    }
                    candidates.push(entry);
                }
            }
        }

        // idempotent mode probes for existing entries; the dry run only
        // projects what those probes would cost
        let mut to_write = candidates;
        if opts.idempotent && !to_write.is_empty() {
            if opts.dry_run {
                projected_probe_reads += to_write.len() as u64;
            } else {
                let ids: Vec<String> = to_write.iter().map(|e| e.id.clone()).collect();
                let exists = store.entries_exist(&ids)?;
                let mut kept = Vec::with_capacity(to_write.len());
                for (entry, exists) in to_write.into_iter().zip(exists) {
                    if exists {
                        stats.skipped_existing += 1;
                    } else {
                        kept.push(entry);
                    }
                }
                to_write = kept;
            }
        }

        for entry in &to_write {
            if sample.len() < opts.sample_limit {
                sample.push(entry.clone());
            }
        }

        if opts.dry_run {
            stats.written += to_write.len();
        } else {
            let mut tail_indices: Option<(Option<i64>, Option<i64>)> = None;
            for chunk in to_write.chunks(batch_limit) {
                store.insert_entries(chunk)?;
                stats.written += chunk.len();
                let ids: Vec<String> = chunk.iter().map(|e| e.id.clone()).collect();
                manifest.record(&ids)?;
                let tail = &chunk[chunk.len() - 1];
                tail_indices = Some((tail.source_visit_index, tail.source_subject_index));
            }
            // checkpoint at the page boundary: a crash mid-page re-scans the
            // page on resume, and the deterministic ids make that harmless
            if let (Some(cp_path), Some(last_id)) = (&opts.checkpoint_file, &page_last) {
                let mut cp = Checkpoint::new("migrate", last_id);
                if let Some((vi, si)) = tail_indices {
                    cp.last_visit_index = vi.map(|i| i as usize);
                    cp.last_subject_index = si.map(|i| i as usize);
                }
                cp.committed = stats.written as u64;
                checkpoint::save(cp_path, &cp)?;
            }
        }
        match page_last {
            Some(id) => cursor = Some(id),
            None => break,
        }
    }

    spinner.finish_with_message(format!(
        "visits: scanned {}, {} {} entries",
        stats.docs_scanned,
        if opts.dry_run { "would write" } else { "wrote" },
        stats.written
    ));

    stats.reads = store.reads() - reads_before;
    stats.writes = store.writes() - writes_before;
    let projected_writes = if opts.dry_run {
        stats.written as u64
    } else {
        stats.writes
    };
    stats.estimated_cost_usd = opts
        .costs
        .estimate(stats.reads + projected_probe_reads, projected_writes);
    stats.elapsed_seconds = start.elapsed().as_secs_f64();

    Ok(MigrateReport {
        dry_run: opts.dry_run,
        stats,
        sample,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VisitDoc;

    fn seed(store: &mut VisitStore) {
        let docs = vec![
            VisitDoc {
                id: "doc1".to_string(),
                staff: "김영희".to_string(),
                created_at: "2025-03-01T09:00:00Z".to_string(),
                visits: vec![
                    EmbeddedVisit {
                        school: "서울고등학교".to_string(),
                        region: "서울".to_string(),
                        visit_date: "2025-03-02".to_string(),
                        subjects: vec![
                            SubjectNote {
                                subject: "수학".to_string(),
                                teacher: "이선생".to_string(),
                                ..Default::default()
                            },
                            SubjectNote {
                                subject: "영어".to_string(),
                                teacher: "박선생".to_string(),
                                ..Default::default()
                            },
                        ],
                        ..Default::default()
                    },
                    // legacy shape: inline subject, no subjects list
                    EmbeddedVisit {
                        school: "과천고등학교".to_string(),
                        subject: "국어".to_string(),
                        teacher: "최선생".to_string(),
                        ..Default::default()
                    },
                ],
            },
            VisitDoc {
                id: "doc2".to_string(),
                staff: "박철수".to_string(),
                created_at: "2024-01-01T09:00:00Z".to_string(),
                visits: vec![EmbeddedVisit {
                    school: "부산고등학교".to_string(),
                    visit_date: "2024-01-05".to_string(),
                    ..Default::default()
                }],
            },
        ];
        store.insert_docs(&docs).unwrap();
    }

    #[test]
    fn test_deterministic_id_format() {
        assert_eq!(deterministic_id("abc", 2, 0), "abc_2_0");
    }

    #[test]
    fn test_dry_run_identifies_without_writing() {
        let mut store = VisitStore::open_in_memory().unwrap();
        seed(&mut store);
        let writes_before = store.writes();

        let report = migrate_docs(&mut store, &MigrateOptions::default()).unwrap();
        assert!(report.dry_run);
        assert_eq!(report.stats.docs_scanned, 2);
        assert_eq!(report.stats.entries_identified, 4);
        assert_eq!(report.stats.written, 4);
        assert_eq!(store.writes(), writes_before);
        assert!(store.get_entry("doc1_0_0").unwrap().is_none());
    }

    #[test]
    fn test_apply_writes_flat_entries() {
        let mut store = VisitStore::open_in_memory().unwrap();
        seed(&mut store);

        let opts = MigrateOptions {
            dry_run: false,
            ..Default::default()
        };
        let report = migrate_docs(&mut store, &opts).unwrap();
        assert_eq!(report.stats.written, 4);

        let e = store.get_entry("doc1_0_1").unwrap().unwrap();
        assert_eq!(e.staff, "김영희");
        assert_eq!(e.school, "서울고등학교");
        assert_eq!(e.region, "서울");
        assert_eq!(e.subject, "영어");
        assert_eq!(e.teacher, "박선생");
        assert_eq!(e.visit_date, "2025-03-02");
        assert_eq!(e.source_doc.as_deref(), Some("doc1"));
        assert_eq!(e.source_visit_index, Some(0));
        assert_eq!(e.source_subject_index, Some(1));
        assert!(e.migrated_at.is_some());

        // legacy inline subject became its own entry
        let legacy = store.get_entry("doc1_1_0").unwrap().unwrap();
        assert_eq!(legacy.subject, "국어");
        assert_eq!(legacy.teacher, "최선생");

        // dateless visit falls back to the document timestamp
        let dated = store.get_entry("doc1_1_0").unwrap().unwrap();
        assert_eq!(dated.visit_date, "2025-03-01T09:00:00Z");
    }

    #[test]
    fn test_idempotent_second_run_writes_nothing() {
        let mut store = VisitStore::open_in_memory().unwrap();
        seed(&mut store);

        let opts = MigrateOptions {
            dry_run: false,
            idempotent: true,
            ..Default::default()
        };
        let first = migrate_docs(&mut store, &opts).unwrap();
        assert_eq!(first.stats.written, 4);
        assert_eq!(first.stats.skipped_existing, 0);

        let second = migrate_docs(&mut store, &opts).unwrap();
        assert_eq!(second.stats.written, 0);
        assert_eq!(second.stats.skipped_existing, 4);
    }

    #[test]
    fn test_manifest_skips_probe_reads() {
        let dir = std::env::temp_dir().join("cmass-migrate-test");
        std::fs::create_dir_all(&dir).unwrap();
        let manifest = dir.join(format!("manifest-{}.json", std::process::id()));
        std::fs::remove_file(&manifest).ok();

        let mut store = VisitStore::open_in_memory().unwrap();
        seed(&mut store);

        let opts = MigrateOptions {
            dry_run: false,
            idempotent: true,
            manifest_file: Some(manifest.clone()),
            ..Default::default()
        };
        migrate_docs(&mut store, &opts).unwrap();

        // every id is in the manifest now, so the second run issues only
        // the page reads and no existence probes
        let reads_before = store.reads();
        let second = migrate_docs(&mut store, &opts).unwrap();
        assert_eq!(second.stats.skipped_manifest, 4);
        assert_eq!(second.stats.written, 0);
        assert_eq!(store.reads() - reads_before, 2);

        std::fs::remove_file(&manifest).ok();
    }

    #[test]
    fn test_since_filter() {
        let mut store = VisitStore::open_in_memory().unwrap();
        seed(&mut store);

        let opts = MigrateOptions {
            dry_run: false,
            since: Some(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()),
            ..Default::default()
        };
        let report = migrate_docs(&mut store, &opts).unwrap();
        // doc2's 2024 visit is excluded
        assert_eq!(report.stats.skipped_since, 1);
        assert_eq!(report.stats.written, 3);
        assert!(store.get_entry("doc2_0_0").unwrap().is_none());
    }

    #[test]
    fn test_bad_doc_counted_and_skipped() {
        let mut store = VisitStore::open_in_memory().unwrap();
        seed(&mut store);
        store
            .insert_docs(&[VisitDoc {
                id: "doc0-bad".to_string(),
                ..Default::default()
            }])
            .unwrap();
        store
            .replace_doc_visits(&[("doc0-bad".to_string(), "{broken".to_string())])
            .unwrap();

        let opts = MigrateOptions {
            dry_run: false,
            ..Default::default()
        };
        let report = migrate_docs(&mut store, &opts).unwrap();
        assert_eq!(report.stats.read_errors, 1);
        assert_eq!(report.stats.written, 4);
    }

    #[test]
    fn test_rerun_preserves_backfilled_region() {
        use crate::backfill::{backfill_entries, BackfillOptions};
        use crate::models::RegionMap;
        use crate::normalize::normalize;

        let mut store = VisitStore::open_in_memory().unwrap();
        store
            .insert_docs(&[VisitDoc {
                id: "doc1".to_string(),
                visits: vec![EmbeddedVisit {
                    school: "서울고등학교".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }])
            .unwrap();

        let opts = MigrateOptions {
            dry_run: false,
            ..Default::default()
        };
        migrate_docs(&mut store, &opts).unwrap();
        assert_eq!(store.get_entry("doc1_0_0").unwrap().unwrap().region, "");

        let roster: RegionMap = [("서울고등학교", "서울")]
            .iter()
            .map(|(k, v)| (normalize(k), v.to_string()))
            .collect();
        let backfill_opts = BackfillOptions {
            dry_run: false,
            ..Default::default()
        };
        backfill_entries(&mut store, &roster, &backfill_opts).unwrap();
        assert_eq!(store.get_entry("doc1_0_0").unwrap().unwrap().region, "서울");

        // rerunning without the existence skip targets the same ids but
        // must not reset fields that changed after the first write
        migrate_docs(&mut store, &opts).unwrap();
        assert_eq!(store.get_entry("doc1_0_0").unwrap().unwrap().region, "서울");
    }

    #[test]
    fn test_scan_limit_checkpoints_last_scanned_doc() {
        let dir = std::env::temp_dir().join("cmass-migrate-test");
        std::fs::create_dir_all(&dir).unwrap();
        let cp_path = dir.join(format!("cp-limit-{}.json", std::process::id()));
        std::fs::remove_file(&cp_path).ok();

        let mut store = VisitStore::open_in_memory().unwrap();
        seed(&mut store);

        let opts = MigrateOptions {
            dry_run: false,
            scan_limit: Some(1),
            checkpoint_file: Some(cp_path.clone()),
            ..Default::default()
        };
        let first = migrate_docs(&mut store, &opts).unwrap();
        assert_eq!(first.stats.docs_scanned, 1);

        let cp = checkpoint::load(&cp_path).unwrap().unwrap();
        assert_eq!(cp.last_doc_id, "doc1");

        let opts = MigrateOptions {
            scan_limit: None,
            resume: true,
            ..opts
        };
        let second = migrate_docs(&mut store, &opts).unwrap();
        assert_eq!(second.stats.docs_scanned, 1);
        assert!(store.get_entry("doc2_0_0").unwrap().is_some());

        std::fs::remove_file(&cp_path).ok();
    }

    #[test]
    fn test_dry_run_projects_probe_cost() {
        let mut store = VisitStore::open_in_memory().unwrap();
        seed(&mut store);

        let plain = migrate_docs(&mut store, &MigrateOptions::default()).unwrap();
        let idempotent = migrate_docs(
            &mut store,
            &MigrateOptions {
                idempotent: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(idempotent.stats.estimated_cost_usd > plain.stats.estimated_cost_usd);
    }
}
