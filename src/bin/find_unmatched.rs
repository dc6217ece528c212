//! List unmapped school names and how close they come to a roster match.
//!
//! Read-only companion to the backfill: scans entries with an empty region,
//! scores each distinct school name against the roster, and buckets the
//! results into score bands so roster gaps and near-misses are easy to
//! spot before an apply run.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use rustc_hash::FxHashMap;

use cmass_backfill::models::RegionMap;
use cmass_backfill::roster::{load_roster, RosterSource};
use cmass_backfill::scoring::{best_match, Candidate};
use cmass_backfill::store::VisitStore;

#[derive(Parser)]
#[command(name = "find-unmatched")]
#[command(about = "List unmapped school names with their closest roster candidates")]
struct Args {
    /// Visit database
    db: PathBuf,

    /// Roster CSV: a local path or an http(s) URL
    #[arg(long)]
    roster: String,

    /// Examples to print per score band
    #[arg(long, default_value = "10")]
    sample: usize,

    #[arg(long, default_value = "500")]
    page_size: usize,
}

struct Band {
    label: &'static str,
    min: f64,
    schools: Vec<(String, usize, Option<Candidate>)>,
}

fn bands() -> Vec<Band> {
    vec![
        Band { label: "0.95+ (substring or exact)", min: 0.95, schools: Vec::new() },
        Band { label: "0.85 - 0.95", min: 0.85, schools: Vec::new() },
        Band { label: "0.75 - 0.85 (accepted at default threshold)", min: 0.75, schools: Vec::new() },
        Band { label: "below 0.75 (no confident match)", min: f64::NEG_INFINITY, schools: Vec::new() },
    ]
}

/// Distinct unmapped school names with occurrence counts.
fn collect_unmapped(store: &mut VisitStore, page_size: usize) -> Result<FxHashMap<String, usize>> {
    let mut counts: FxHashMap<String, usize> = FxHashMap::default();
    let mut cursor: Option<String> = None;
    loop {
        let page = store.entry_page(cursor.as_deref(), page_size)?;
        let Some(last) = page.last() else { break };
        let last_id = last.id.clone();
        for entry in page {
            if entry.region.trim().is_empty() && !entry.school.trim().is_empty() {
                *counts.entry(entry.school).or_insert(0) += 1;
            }
        }
        cursor = Some(last_id);
    }
    Ok(counts)
}

fn bucket(counts: FxHashMap<String, usize>, roster: &RegionMap) -> Vec<Band> {
    let mut bands = bands();
    for (school, count) in counts {
        let candidate = best_match(&school, roster);
        let score = candidate.as_ref().map_or(f64::NEG_INFINITY, |c| c.score);
        if let Some(band) = bands.iter_mut().find(|b| score >= b.min) {
            band.schools.push((school, count, candidate));
        }
    }
    for band in &mut bands {
        // most frequent first
        band.schools.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    }
    bands
}

fn main() -> Result<()> {
    let args = Args::parse();

    let source = RosterSource::parse(&args.roster);
    eprintln!("Loading roster from {}", source);
    let roster = load_roster(&source)?;
    eprintln!("Roster loaded: {} schools", roster.len());

    let mut store = VisitStore::open(&args.db)?;
    let counts = collect_unmapped(&mut store, args.page_size)?;
    let total: usize = counts.values().sum();
    let distinct = counts.len();
    let bands = bucket(counts, &roster);

    println!(
        "{} unmapped entries across {} distinct school names\n",
        total, distinct
    );
    for band in &bands {
        let entries: usize = band.schools.iter().map(|(_, n, _)| n).sum();
        println!(
            "{}: {} names, {} entries",
            band.label,
            band.schools.len(),
            entries
        );
        for (school, count, candidate) in band.schools.iter().take(args.sample) {
            match candidate {
                Some(c) => println!(
                    "  {} (x{}) -> {} [{:.3}, {}]",
                    school,
                    count,
                    c.key,
                    c.score,
                    c.strategy.label()
                ),
                None => println!("  {} (x{}) -> no candidate", school, count),
            }
        }
        if band.schools.len() > args.sample {
            println!("  ... and {} more", band.schools.len() - args.sample);
        }
        println!();
    }
    Ok(())
}
