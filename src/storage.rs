use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::model::SpeedResult;

/// Maximum number of runs kept on disk.
pub const HISTORY_LIMIT: usize = 10;

/// Envelope written by [`HistoryStore::export`].
#[derive(Debug, Serialize, Deserialize)]
pub struct ExportEnvelope {
    #[serde(with = "time::serde::rfc3339")]
    pub exported_at: OffsetDateTime,
    pub results: Vec<SpeedResult>,
}

/// Bounded on-disk history of completed runs.
///
/// The backing file is a JSON array, oldest run first, never longer than
/// [`HISTORY_LIMIT`]. The path is injectable so tests and the CLI can point
/// the store anywhere.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn at_default() -> Self {
        Self::new(default_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored runs, oldest first.
    ///
    /// A missing, unreadable, or corrupt file loads as an empty history so a
    /// bad disk state can never wedge the dashboard.
    pub fn load(&self) -> Vec<SpeedResult> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                log::debug!("history not loaded from {}: {e}", self.path.display());
                return Vec::new();
            }
        };
        let mut entries: Vec<SpeedResult> = match serde_json::from_slice(&raw) {
            Ok(entries) => entries,
            Err(e) => {
                log::debug!("history file {} is not valid: {e}", self.path.display());
                return Vec::new();
            }
        };
        if entries.len() > HISTORY_LIMIT {
            entries.drain(..entries.len() - HISTORY_LIMIT);
        }
        entries
    }

    /// Append one run, trimming the oldest entries beyond [`HISTORY_LIMIT`].
    pub fn append(&self, result: &SpeedResult) -> Result<()> {
        let mut entries = self.load();
        entries.push(result.clone());
        if entries.len() > HISTORY_LIMIT {
            entries.drain(..entries.len() - HISTORY_LIMIT);
        }
        self.write_entries(&entries)
    }

    /// Write the full history plus an export timestamp to `dest`.
    ///
    /// The store itself is not touched.
    pub fn export(&self, dest: &Path) -> Result<()> {
        let envelope = ExportEnvelope {
            exported_at: OffsetDateTime::now_utc(),
            results: self.load(),
        };
        let json = serde_json::to_vec_pretty(&envelope).context("serialize export")?;
        fs::write(dest, json).with_context(|| format!("write export {}", dest.display()))?;
        Ok(())
    }

    // Whole-file replace: readers only ever observe the previous or the new
    // array, never a partial write.
    fn write_entries(&self, entries: &[SpeedResult]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create history dir {}", parent.display()))?;
            }
        }
        let json = serde_json::to_vec_pretty(entries).context("serialize history")?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("write history {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replace history {}", self.path.display()))?;
        Ok(())
    }
}

/// Fixed per-user history location, overridable via `--history-file`.
pub fn default_path() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("speedline")
        .join("history.json")
}
