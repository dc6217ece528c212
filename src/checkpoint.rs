//! Batch checkpointing for resumable runs.
//!
//! After each committed batch the driver persists its position (parent id
//! plus positional indices) so a killed run can continue with `--resume`
//! without reprocessing earlier pages. Saves are atomic: write to a temp
//! file, then rename over the target.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Last-processed position of a batch run over one collection.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub collection: String,
    pub last_doc_id: String,
    #[serde(default)]
    pub last_visit_index: Option<usize>,
    #[serde(default)]
    pub last_subject_index: Option<usize>,
    #[serde(default)]
    pub committed: u64,
    #[serde(default)]
    pub timestamp: String,
}

impl Checkpoint {
    pub fn new(collection: &str, last_doc_id: &str) -> Self {
        Self {
            collection: collection.to_string(),
            last_doc_id: last_doc_id.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            ..Default::default()
        }
    }
}

/// Load a checkpoint; `Ok(None)` when the file does not exist.
pub fn load(path: &Path) -> Result<Option<Checkpoint>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read checkpoint file {}", path.display()))?;
    let cp = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse checkpoint file {}", path.display()))?;
    Ok(Some(cp))
}

/// Persist a checkpoint atomically (temp file, then rename).
pub fn save(path: &Path, cp: &Checkpoint) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(cp)?;
    std::fs::write(&tmp, json)
        .with_context(|| format!("failed to write checkpoint temp file {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace checkpoint file {}", path.display()))?;
    Ok(())
}

/// Verify the checkpoint location is usable before starting a long run.
/// An unwritable checkpoint directory is a setup error, not something to
/// discover after the first committed batch.
pub fn ensure_writable(path: &Path) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => std::path::PathBuf::from("."),
    };
    if !parent.is_dir() {
        bail!(
            "checkpoint directory {} does not exist",
            parent.display()
        );
    }
    let probe = parent.join(format!(".cmass-checkpoint-probe-{}", std::process::id()));
    std::fs::write(&probe, b"probe")
        .with_context(|| format!("checkpoint directory {} is not writable", parent.display()))?;
    std::fs::remove_file(&probe).ok();
    Ok(())
}
