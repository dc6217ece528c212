//! SQLite-backed visit store.
//!
//! Mirrors the production document layout: a flat `visit_entries`
//! collection and aggregated `visits` documents holding their embedded
//! visit list as a single JSON value. Reads are keyset-paginated by id
//! (the document-store equivalent of ordering by name and starting after
//! a cursor); writes go through one transaction per batch, all-or-nothing.
//!
//! Every method counts the document reads and writes it performs, so
//! drivers can report operation totals and dry-run tests can assert that
//! zero writes were issued.

use std::path::Path;

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection};

use crate::models::{VisitDoc, VisitEntry};

/// Per-transaction write limit of the backing store. Drivers must chunk
/// their commits so no batch exceeds this.
pub const MAX_BATCH_WRITES: usize = 400;

/// Chunk size for existence probes (kept well under the batch limit).
const EXISTS_CHUNK: usize = 200;

/// Raw aggregated document row; the embedded list is left as JSON text so
/// callers can treat a malformed document as a per-record parse error
/// instead of failing the page.
#[derive(Clone, Debug)]
pub struct RawDoc {
    pub id: String,
    pub staff: String,
    pub created_at: String,
    pub visits_json: String,
}

pub struct VisitStore {
    conn: Connection,
    reads: u64,
    writes: u64,
}

impl VisitStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open visit database at {}", path.display()))?;
        Self::from_conn(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_conn(Connection::open_in_memory()?)
    }

    fn from_conn(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;

            CREATE TABLE IF NOT EXISTS visit_entries (
                id TEXT PRIMARY KEY,
                staff TEXT NOT NULL DEFAULT '',
                school TEXT NOT NULL DEFAULT '',
                region TEXT NOT NULL DEFAULT '',
                teacher TEXT NOT NULL DEFAULT '',
                subject TEXT NOT NULL DEFAULT '',
                visit_date TEXT NOT NULL DEFAULT '',
                source_doc TEXT,
                source_visit_index INTEGER,
                source_subject_index INTEGER,
                migrated_at TEXT
            );

            CREATE TABLE IF NOT EXISTS visits (
                id TEXT PRIMARY KEY,
                staff TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL DEFAULT '',
                visits_json TEXT NOT NULL DEFAULT '[]'
            );",
        )?;
        Ok(Self {
            conn,
            reads: 0,
            writes: 0,
        })
    }

    /// Document reads issued so far.
    pub fn reads(&self) -> u64 {
        self.reads
    }

    /// Document writes issued so far.
    pub fn writes(&self) -> u64 {
        self.writes
    }

    // ------------------------------------------------------------------
    // Paginated reads
    // ------------------------------------------------------------------

    /// One page of flat entries, ordered by id, starting after `after`.
    pub fn entry_page(&mut self, after: Option<&str>, limit: usize) -> Result<Vec<VisitEntry>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, staff, school, region, teacher, subject, visit_date,
                    source_doc, source_visit_index, source_subject_index, migrated_at
             FROM visit_entries
             WHERE id > ?1
             ORDER BY id
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![after.unwrap_or(""), limit as i64], |row| {
            Ok(VisitEntry {
                id: row.get(0)?,
                staff: row.get(1)?,
                school: row.get(2)?,
                region: row.get(3)?,
                teacher: row.get(4)?,
                subject: row.get(5)?,
                visit_date: row.get(6)?,
                source_doc: row.get(7)?,
                source_visit_index: row.get(8)?,
                source_subject_index: row.get(9)?,
                migrated_at: row.get(10)?,
            })
        })?;
        let page: Vec<VisitEntry> = rows.collect::<rusqlite::Result<_>>()?;
        self.reads += page.len() as u64;
        Ok(page)
    }

    /// One page of aggregated documents, ordered by id, embedded list raw.
    pub fn doc_page(&mut self, after: Option<&str>, limit: usize) -> Result<Vec<RawDoc>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, staff, created_at, visits_json
             FROM visits
             WHERE id > ?1
             ORDER BY id
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![after.unwrap_or(""), limit as i64], |row| {
            Ok(RawDoc {
                id: row.get(0)?,
                staff: row.get(1)?,
                created_at: row.get(2)?,
                visits_json: row.get(3)?,
            })
        })?;
        let page: Vec<RawDoc> = rows.collect::<rusqlite::Result<_>>()?;
        self.reads += page.len() as u64;
        Ok(page)
    }

    // ------------------------------------------------------------------
    // Batched writes
    // ------------------------------------------------------------------

    /// Fill regions on flat entries: one transaction for the whole batch.
    /// The guard clause re-checks emptiness at write time so a populated
    /// region is never overwritten.
    pub fn update_entry_regions(&mut self, batch: &[(String, String)]) -> Result<()> {
        if batch.len() > MAX_BATCH_WRITES {
            bail!("batch of {} exceeds the write limit of {}", batch.len(), MAX_BATCH_WRITES);
        }
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "UPDATE visit_entries SET region = ?2
                 WHERE id = ?1 AND (region IS NULL OR region = '')",
            )?;
            for (id, region) in batch {
                stmt.execute(params![id, region])?;
            }
        }
        tx.commit().context("entry region batch commit failed")?;
        self.writes += batch.len() as u64;
        Ok(())
    }

    /// Rewrite the whole embedded visit list of each document in the batch.
    pub fn replace_doc_visits(&mut self, batch: &[(String, String)]) -> Result<()> {
        if batch.len() > MAX_BATCH_WRITES {
            bail!("batch of {} exceeds the write limit of {}", batch.len(), MAX_BATCH_WRITES);
        }
        let tx = self.conn.transaction()?;
        {
            let mut stmt =
                tx.prepare_cached("UPDATE visits SET visits_json = ?2 WHERE id = ?1")?;
            for (id, visits_json) in batch {
                stmt.execute(params![id, visits_json])?;
            }
        }
        tx.commit().context("aggregated visits batch commit failed")?;
        self.writes += batch.len() as u64;
        Ok(())
    }

    /// Insert flat entries, one transaction per call. An id that already
    /// exists is left untouched: migrated entries carry deterministic ids,
    /// and a rerun must not reset fields (like a backfilled region) that
    /// changed after the first write.
    pub fn insert_entries(&mut self, batch: &[VisitEntry]) -> Result<()> {
        if batch.len() > MAX_BATCH_WRITES {
            bail!("batch of {} exceeds the write limit of {}", batch.len(), MAX_BATCH_WRITES);
        }
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO visit_entries
                 (id, staff, school, region, teacher, subject, visit_date,
                  source_doc, source_visit_index, source_subject_index, migrated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for e in batch {
                stmt.execute(params![
                    e.id,
                    e.staff,
                    e.school,
                    e.region,
                    e.teacher,
                    e.subject,
                    e.visit_date,
                    e.source_doc,
                    e.source_visit_index,
                    e.source_subject_index,
                    e.migrated_at,
                ])?;
            }
        }
        tx.commit().context("entry insert batch commit failed")?;
        self.writes += batch.len() as u64;
        Ok(())
    }

    /// Insert aggregated documents (test seeding and fixtures).
    pub fn insert_docs(&mut self, batch: &[VisitDoc]) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO visits (id, staff, created_at, visits_json)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for d in batch {
                let json = serde_json::to_string(&d.visits)?;
                stmt.execute(params![d.id, d.staff, d.created_at, json])?;
            }
        }
        tx.commit()?;
        self.writes += batch.len() as u64;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Existence probes
    // ------------------------------------------------------------------

    /// Which of the given entry ids already exist, in input order.
    /// Counts one read per probed id, as the backing store would bill it.
    pub fn entries_exist(&mut self, ids: &[String]) -> Result<Vec<bool>> {
        let mut found = rustc_hash::FxHashSet::default();
        for chunk in ids.chunks(EXISTS_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!(
                "SELECT id FROM visit_entries WHERE id IN ({})",
                placeholders
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params_from_iter(chunk.iter()),
                |row| row.get::<_, String>(0),
            )?;
            for id in rows {
                found.insert(id?);
            }
        }
        self.reads += ids.len() as u64;
        Ok(ids.iter().map(|id| found.contains(id)).collect())
    }

    /// Fetch one entry by id (diagnostics and tests).
    pub fn get_entry(&mut self, id: &str) -> Result<Option<VisitEntry>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, staff, school, region, teacher, subject, visit_date,
                    source_doc, source_visit_index, source_subject_index, migrated_at
             FROM visit_entries WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], |row| {
            Ok(VisitEntry {
                id: row.get(0)?,
                staff: row.get(1)?,
                school: row.get(2)?,
                region: row.get(3)?,
                teacher: row.get(4)?,
                subject: row.get(5)?,
                visit_date: row.get(6)?,
                source_doc: row.get(7)?,
                source_visit_index: row.get(8)?,
                source_subject_index: row.get(9)?,
                migrated_at: row.get(10)?,
            })
        })?;
        let entry = rows.next().transpose()?;
        self.reads += 1;
        Ok(entry)
    }
}
