//! Roster loading: fetch the staff/school CSV and build the region map.
//!
//! The roster is the authoritative school-name -> region mapping, exported
//! from the sales staff sheet and hosted next to the app. Column positions
//! drift between exports, so headers are resolved once against a declared
//! table of known label fragments rather than probed per access.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

use crate::csv::parse_csv;
use crate::models::RegionMap;
use crate::normalize::normalize;

// ============================================================================
// Source
// ============================================================================

/// Where the roster CSV lives: a local file or a hosted URL.
#[derive(Clone, Debug)]
pub enum RosterSource {
    Path(PathBuf),
    Url(String),
}

impl RosterSource {
    pub fn parse(s: &str) -> Self {
        if s.starts_with("http://") || s.starts_with("https://") {
            RosterSource::Url(s.to_string())
        } else {
            RosterSource::Path(PathBuf::from(s))
        }
    }
}

impl std::fmt::Display for RosterSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RosterSource::Path(p) => write!(f, "{}", p.display()),
            RosterSource::Url(u) => write!(f, "{}", u),
        }
    }
}

/// Fetch the raw roster CSV text. Failure here is fatal for the run.
pub fn fetch_roster_text(source: &RosterSource) -> Result<String> {
    match source {
        RosterSource::Path(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read roster CSV at {}", path.display())),
        RosterSource::Url(url) => {
            let resp = reqwest::blocking::get(url)
                .with_context(|| format!("failed to fetch roster CSV from {}", url))?
                .error_for_status()
                .with_context(|| format!("roster CSV fetch returned an error status: {}", url))?;
            resp.text()
                .with_context(|| format!("failed to read roster CSV body from {}", url))
        }
    }
}

// ============================================================================
// Header Detection
// ============================================================================

/// Known header label fragments per canonical column, matched
/// case-insensitively as substrings.
const SCHOOL_LABELS: &[&str] = &["학교명", "학교", "school"];
const REGION_LABELS: &[&str] = &["지역", "region"];

/// Resolved column positions for the roster CSV.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RosterColumns {
    pub school: usize,
    pub region: usize,
}

fn find_column(header: &[String], labels: &[&str]) -> Option<usize> {
    header.iter().position(|h| {
        let h = h.trim().to_lowercase();
        labels.iter().any(|label| h.contains(label))
    })
}

/// Resolve the school and region columns from the header row.
/// Missing columns are a setup error; we never guess a mapping.
pub fn detect_columns(header: &[String]) -> Result<RosterColumns> {
    let school = find_column(header, SCHOOL_LABELS);
    let region = find_column(header, REGION_LABELS);
    match (school, region) {
        (Some(school), Some(region)) => Ok(RosterColumns { school, region }),
        _ => bail!(
            "roster CSV missing expected columns (school, region); header: {:?}",
            header
        ),
    }
}

// ============================================================================
// Region Map
// ============================================================================

/// Build the normalized school -> region map from raw CSV text.
///
/// Multiple raw rows may normalize to the same key; the last occurrence
/// wins, and a conflicting duplicate is logged as a warning (known source
/// ambiguity, not fatal).
pub fn build_region_map(csv_text: &str) -> Result<RegionMap> {
    let rows = parse_csv(csv_text);
    let header = rows.first().context("roster CSV is empty")?;
    let cols = detect_columns(header)?;

    let mut map = RegionMap::default();
    for row in &rows[1..] {
        if row.len() <= cols.school.max(cols.region) {
            continue;
        }
        let school = row[cols.school].trim();
        let region = row[cols.region].trim();
        if school.is_empty() {
            continue;
        }
        let key = normalize(school);
        if let Some(prev) = map.get(&key) {
            if prev != region {
                eprintln!(
                    "warning: roster key '{}' maps to both '{}' and '{}'; keeping the last",
                    key, prev, region
                );
            }
        }
        map.insert(key, region.to_string());
    }
    Ok(map)
}

/// Fetch and build in one step.
pub fn load_roster(source: &RosterSource) -> Result<RegionMap> {
    let text = fetch_roster_text(source)?;
    build_region_map(&text)
}

// ============================================================================
// TTL Cache
// ============================================================================

/// Region map cached with a TTL. An explicit object (not a module global)
/// so request handlers can take it by reference and tests can reset it.
pub struct RosterCache {
    source: RosterSource,
    ttl: Duration,
    data: Option<RegionMap>,
    last_loaded_at: Option<Instant>,
}

impl RosterCache {
    pub fn new(source: RosterSource, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            data: None,
            last_loaded_at: None,
        }
    }

    fn stale(&self) -> bool {
        match (&self.data, self.last_loaded_at) {
            (Some(_), Some(at)) => at.elapsed() >= self.ttl,
            _ => true,
        }
    }

    /// Return the cached map, reloading from the source when stale.
    pub fn get(&mut self) -> Result<&RegionMap> {
        if self.stale() {
            let map = load_roster(&self.source)?;
            self.data = Some(map);
            self.last_loaded_at = Some(Instant::now());
        }
        Ok(self.data.as_ref().unwrap())
    }

    /// Drop the cached map; the next `get` reloads.
    pub fn invalidate(&mut self) {
        self.data = None;
        self.last_loaded_at = None;
    }
}
