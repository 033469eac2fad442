//! Local cache store
//!
//! Entries live in three independent namespaces ([`CacheKind`]). Every
//! mutation happens under one short lock; no lock is held across an await.

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::codec::Payload;
use crate::error::CacheResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    Asset,
    Fs,
    Settings,
}

impl CacheKind {
    /// Flush order
    pub const ALL: [CacheKind; 3] = [CacheKind::Asset, CacheKind::Fs, CacheKind::Settings];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKind::Asset => "asset",
            CacheKind::Fs => "fs",
            CacheKind::Settings => "settings",
        }
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryMeta {
    pub is_dirty: bool,
    /// Unix millis of the last local write (wall clock, never bumped)
    pub modified: u64,
    /// Store-wide write sequence; tells a commit snapshot from a newer write
    pub version: u64,
    pub commit_in_flight: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub uid: String,
    pub name: String,
    pub payload: Payload,
    pub meta: EntryMeta,
}

/// Partial metadata override; `None` leaves a field as is
#[derive(Debug, Clone, Copy, Default)]
pub struct MetaUpdate {
    pub is_dirty: Option<bool>,
    pub modified: Option<u64>,
}

/// Outcome of trying to claim an entry for commit
#[derive(Debug, Clone, PartialEq)]
pub enum BeginCommit {
    /// Claimed; the snapshot is what must be pushed
    Started(CacheEntry),
    InFlight,
    Clean,
    Missing,
}

type Key = (CacheKind, String);

#[derive(Default)]
struct Inner {
    entries: HashMap<Key, CacheEntry>,
    seq: u64,
}

impl Inner {
    /// Wall-clock millis plus the next write sequence number
    fn stamp(&mut self) -> (u64, u64) {
        self.seq += 1;
        (Utc::now().timestamp_millis().max(0) as u64, self.seq)
    }
}

#[derive(Default)]
pub struct LocalStore {
    inner: Mutex<Inner>,
}

fn key(kind: CacheKind, uid: &str) -> Key {
    (kind, uid.to_string())
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: CacheKind, uid: &str) -> Option<CacheEntry> {
        self.inner.lock().entries.get(&key(kind, uid)).cloned()
    }

    pub fn contains(&self, kind: CacheKind, uid: &str) -> bool {
        self.inner.lock().entries.contains_key(&key(kind, uid))
    }

    /// Insert a clean mirror of remote data unless a local entry appeared
    /// meanwhile. Returns whatever entry is present afterwards.
    pub fn populate(&self, kind: CacheKind, uid: &str, name: &str, payload: Payload) -> CacheEntry {
        let mut inner = self.inner.lock();
        let (modified, version) = inner.stamp();
        inner
            .entries
            .entry(key(kind, uid))
            .or_insert_with(|| CacheEntry {
                uid: uid.to_string(),
                name: name.to_string(),
                payload,
                meta: EntryMeta {
                    is_dirty: false,
                    modified,
                    version,
                    commit_in_flight: false,
                },
            })
            .clone()
    }

    /// Atomically compute and store a new payload from the current entry.
    ///
    /// `f` returning `Ok(None)` leaves the store untouched; an error also
    /// leaves it untouched. On write the entry is dirty and freshly stamped.
    pub fn write_with<F>(&self, kind: CacheKind, uid: &str, name: &str, f: F) -> CacheResult<Option<CacheEntry>>
    where
        F: FnOnce(Option<&CacheEntry>) -> CacheResult<Option<Payload>>,
    {
        let mut inner = self.inner.lock();
        let k = key(kind, uid);
        let Some(payload) = f(inner.entries.get(&k))? else {
            return Ok(None);
        };
        let (modified, version) = inner.stamp();
        let in_flight = inner
            .entries
            .get(&k)
            .is_some_and(|e| e.meta.commit_in_flight);
        let entry = CacheEntry {
            uid: uid.to_string(),
            name: name.to_string(),
            payload,
            meta: EntryMeta {
                is_dirty: true,
                modified,
                version,
                commit_in_flight: in_flight,
            },
        };
        inner.entries.insert(k, entry.clone());
        Ok(Some(entry))
    }

    pub fn remove(&self, kind: CacheKind, uid: &str) -> Option<CacheEntry> {
        self.inner.lock().entries.remove(&key(kind, uid))
    }

    /// Drop a clean, idle entry. Dirty or committing entries are kept.
    pub fn evict(&self, kind: CacheKind, uid: &str) -> bool {
        let mut inner = self.inner.lock();
        let k = key(kind, uid);
        match inner.entries.get(&k) {
            Some(e) if !e.meta.is_dirty && !e.meta.commit_in_flight => {
                inner.entries.remove(&k);
                true
            }
            _ => false,
        }
    }

    /// Point-in-time matches, sorted by uid. The predicate sees a snapshot,
    /// so writes during iteration are never observed half-applied.
    pub fn filter<P>(&self, kind: CacheKind, mut pred: P) -> Vec<CacheEntry>
    where
        P: FnMut(&str, &EntryMeta, &Payload) -> bool,
    {
        let snapshot: Vec<CacheEntry> = {
            let inner = self.inner.lock();
            inner
                .entries
                .iter()
                .filter(|((k, _), _)| *k == kind)
                .map(|(_, e)| e.clone())
                .collect()
        };
        let mut out: Vec<CacheEntry> = snapshot
            .into_iter()
            .filter(|e| pred(&e.uid, &e.meta, &e.payload))
            .collect();
        out.sort_by(|a, b| a.uid.cmp(&b.uid));
        out
    }

    pub fn dirty_count(&self, kind: CacheKind) -> usize {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|((k, _), e)| *k == kind && e.meta.is_dirty)
            .count()
    }

    pub fn len(&self, kind: CacheKind) -> usize {
        self.inner
            .lock()
            .entries
            .keys()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn update_meta(&self, kind: CacheKind, uid: &str, update: MetaUpdate) -> bool {
        let mut inner = self.inner.lock();
        let Some(e) = inner.entries.get_mut(&key(kind, uid)) else {
            return false;
        };
        if let Some(d) = update.is_dirty {
            e.meta.is_dirty = d;
        }
        if let Some(m) = update.modified {
            e.meta.modified = m;
        }
        true
    }

    pub fn try_begin_commit(&self, kind: CacheKind, uid: &str) -> BeginCommit {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(&key(kind, uid)) {
            None => BeginCommit::Missing,
            Some(e) if e.meta.commit_in_flight => BeginCommit::InFlight,
            Some(e) if !e.meta.is_dirty => BeginCommit::Clean,
            Some(e) => {
                e.meta.commit_in_flight = true;
                BeginCommit::Started(e.clone())
            }
        }
    }

    /// Release the commit claim. The entry turns clean only when the commit
    /// succeeded and no write landed since the snapshot at `snapshot_version`.
    pub fn finish_commit(&self, kind: CacheKind, uid: &str, snapshot_version: u64, success: bool) -> bool {
        let mut inner = self.inner.lock();
        let Some(e) = inner.entries.get_mut(&key(kind, uid)) else {
            return false;
        };
        e.meta.commit_in_flight = false;
        if success && e.meta.version == snapshot_version {
            e.meta.is_dirty = false;
            return true;
        }
        false
    }

    pub fn clear(&self, kind: CacheKind) {
        self.inner.lock().entries.retain(|(k, _), _| *k != kind);
    }

    pub fn clear_all(&self) {
        self.inner.lock().entries.clear();
    }
}
