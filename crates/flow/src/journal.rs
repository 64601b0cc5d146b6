//! Write-through change journal.
//!
//! Every state change is appended as one JSON line and flushed before the
//! step that caused it returns, so a crash between two snapshots loses at
//! most the line being written. Records carry full values and replay as
//! last-write-wins, which makes replaying a record the snapshot already
//! contains harmless.
//!
//! A snapshot compacts the journal: [`Journal::rotate`] moves the live file
//! aside before the snapshot is captured and [`Journal::discard_rotated`]
//! drops it once the snapshot is on disk.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use campaign_core::types::{EngagementType, Lead};
use campaign_core::CampaignResult;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{CampaignStats, CampaignStatus, FlowDefinition, RecipientCursor};

/// One journaled change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalEntry {
    Flow {
        definition: FlowDefinition,
    },
    Campaign {
        campaign_id: Uuid,
        status: CampaignStatus,
    },
    Lead {
        lead: Lead,
    },
    Cursor {
        cursor: RecipientCursor,
    },
    /// Campaign totals after a change, plus the idempotency key and unique
    /// pair the change consumed, if any.
    Stats {
        campaign_id: Uuid,
        stats: CampaignStats,
        #[serde(default)]
        applied_key: Option<(String, DateTime<Utc>)>,
        #[serde(default)]
        unique: Option<(String, EngagementType)>,
    },
    /// An engagement key whose routing has finished.
    SeenKey {
        key: String,
        at: DateTime<Utc>,
    },
}

/// Append-only JSON-lines journal next to the snapshot file.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    rotated: PathBuf,
    sync: bool,
    writer: Mutex<BufWriter<File>>,
}

impl Journal {
    /// Opens (or creates) the journal belonging to `snapshot_path`.
    /// With `sync` set every append is also fsynced.
    pub fn open(snapshot_path: impl AsRef<Path>, sync: bool) -> CampaignResult<Self> {
        let path = Self::path_for(snapshot_path.as_ref());
        let rotated = path.with_extension("journal.prev");
        let writer = Mutex::new(BufWriter::new(open_append(&path)?));
        debug!(path = %path.display(), "Journal opened");
        Ok(Self {
            path,
            rotated,
            sync,
            writer,
        })
    }

    /// `state.json` journals to `state.journal`.
    pub fn path_for(snapshot_path: &Path) -> PathBuf {
        snapshot_path.with_extension("journal")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one entry and flushes it to the file.
    pub fn append(&self, entry: &JournalEntry) -> CampaignResult<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut writer = self.writer.lock();
        writer.write_all(&line)?;
        writer.flush()?;
        if self.sync {
            writer.get_ref().sync_data()?;
        }
        metrics::counter!("flow.journal_appends").increment(1);
        Ok(())
    }

    /// Appends `entry`, logging instead of failing the caller. Used where
    /// the in-memory change has already been made.
    pub fn record(&self, entry: &JournalEntry) {
        if let Err(e) = self.append(entry) {
            metrics::counter!("flow.journal_errors").increment(1);
            warn!(path = %self.path.display(), error = %e, "Journal append failed");
        }
    }

    /// Moves the live journal aside and starts a fresh one. Every change
    /// recorded before this returns is already applied in memory, so a
    /// snapshot captured afterwards covers the rotated file.
    pub fn rotate(&self) -> CampaignResult<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;

        if self.rotated.exists() {
            // The previous compaction never finished; keep both generations.
            let pending = std::fs::read(&self.path)?;
            let mut older = open_append(&self.rotated)?;
            older.write_all(&pending)?;
            older.sync_data()?;
            std::fs::remove_file(&self.path)?;
        } else {
            std::fs::rename(&self.path, &self.rotated)?;
        }

        *writer = BufWriter::new(open_append(&self.path)?);
        Ok(())
    }

    /// Drops the rotated generation once a snapshot covering it is durable.
    pub fn discard_rotated(&self) -> CampaignResult<()> {
        match std::fs::remove_file(&self.rotated) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads the rotated generation (if any) followed by the live file, in
    /// append order. A torn final line is dropped.
    pub fn replay(snapshot_path: impl AsRef<Path>) -> CampaignResult<Vec<JournalEntry>> {
        let path = Self::path_for(snapshot_path.as_ref());
        let mut entries = read_entries(&path.with_extension("journal.prev"))?;
        entries.extend(read_entries(&path)?);
        Ok(entries)
    }
}

fn open_append(path: &Path) -> CampaignResult<File> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

fn read_entries(path: &Path) -> CampaignResult<Vec<JournalEntry>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut entries = Vec::new();
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                warn!(path = %path.display(), line = number + 1, error = %e, "Skipping unreadable journal line");
            }
        }
    }
    Ok(entries)
}
