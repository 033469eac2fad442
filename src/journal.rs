use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::store::CacheKind;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    InProgress,
    Completed,
    Failed,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CommitLogEntry {
    pub timestamp: String,
    pub kind: CacheKind,
    pub uid: String,
    pub name: String,
    pub status: CommitStatus,
    pub bytes: u64,
    pub error: Option<String>,
}

impl CommitLogEntry {
    pub fn new(kind: CacheKind, uid: &str, name: &str, status: CommitStatus, bytes: u64, error: Option<String>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            kind,
            uid: uid.to_string(),
            name: name.to_string(),
            status,
            bytes,
            error,
        }
    }
}

/// Append-only JSONL record of commit attempts
pub struct CommitJournal {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CommitJournal {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add_entry(&self, entry: &CommitLogEntry) -> Result<()> {
        let _guard = self.write_lock.lock();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("Failed to open commit journal")?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_log(&self) -> Result<Vec<CommitLogEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path).context("Failed to open commit journal for reading")?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: CommitLogEntry = serde_json::from_str(&line)
                .with_context(|| format!("Corrupt journal line: {line}"))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Keys whose latest journal status is not `Completed`
    pub fn unsettled(&self) -> Result<Vec<(CacheKind, String)>> {
        let mut latest: BTreeMap<(CacheKind, String), CommitStatus> = BTreeMap::new();
        for e in self.read_log()? {
            latest.insert((e.kind, e.uid), e.status);
        }
        Ok(latest
            .into_iter()
            .filter(|(_, s)| *s != CommitStatus::Completed)
            .map(|(k, _)| k)
            .collect())
    }
}
