//! Commit completion callbacks and the two-phase item progress protocol

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::CacheError;
use crate::store::CacheKind;

/// Identifies a committed entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub uid: String,
    pub name: String,
}

pub type CommitResult = Result<CommitInfo, CacheError>;

pub type CommitCallback = Box<dyn FnOnce(&CommitResult) + Send>;

/// Batch progress: one `Estimation` up front, then one `Progress` per item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemProgress {
    Estimation { items: usize },
    Progress { uid: String, name: String },
}

impl ItemProgress {
    pub fn item(uid: impl Into<String>, name: impl Into<String>) -> Self {
        ItemProgress::Progress {
            uid: uid.into(),
            name: name.into(),
        }
    }
}

pub type ProgressFn<'a> = &'a (dyn Fn(ItemProgress) + Send + Sync);

/// Per-chunk progress of a single upload or download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    pub chunk_id: u64,
    pub completed: u64,
    pub total: u64,
}

pub type ChunkProgressFn<'a> = &'a (dyn Fn(ChunkProgress) + Send + Sync);

pub(crate) fn report(progress: Option<ProgressFn<'_>>, event: ItemProgress) {
    if let Some(cb) = progress {
        cb(event);
    }
}

/// Callbacks waiting for the next commit of a key.
///
/// Shared by handle between the scheduler (which owns it) and the client
/// (which fires it when a remote write settles).
#[derive(Clone, Default)]
pub struct CommitCallbacks {
    inner: Arc<Mutex<HashMap<(CacheKind, String), Vec<CommitCallback>>>>,
}

impl CommitCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: CacheKind, uid: &str, cb: CommitCallback) {
        self.inner
            .lock()
            .entry((kind, uid.to_string()))
            .or_default()
            .push(cb);
    }

    pub fn pending(&self, kind: CacheKind, uid: &str) -> usize {
        self.inner
            .lock()
            .get(&(kind, uid.to_string()))
            .map_or(0, Vec::len)
    }

    /// Take every callback for the key and invoke it with `result`.
    /// Callbacks run after the registry lock is released.
    pub fn call_and_clear(&self, kind: CacheKind, uid: &str, result: &CommitResult) -> usize {
        let taken = self.inner.lock().remove(&(kind, uid.to_string()));
        let Some(callbacks) = taken else {
            return 0;
        };
        let n = callbacks.len();
        for cb in callbacks {
            cb(result);
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn callbacks_fire_once_then_clear() {
        let registry = CommitCallbacks::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let hits = hits.clone();
            registry.register(
                CacheKind::Asset,
                "u",
                Box::new(move |r: &CommitResult| {
                    assert!(r.is_ok());
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        assert_eq!(registry.pending(CacheKind::Asset, "u"), 2);

        let ok = Ok(CommitInfo {
            uid: "u".into(),
            name: "n".into(),
        });
        assert_eq!(registry.call_and_clear(CacheKind::Asset, "u", &ok), 2);
        assert_eq!(registry.call_and_clear(CacheKind::Asset, "u", &ok), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn kinds_do_not_share_keys() {
        let registry = CommitCallbacks::new();
        registry.register(CacheKind::Settings, "fs", Box::new(|_| {}));
        assert_eq!(registry.pending(CacheKind::Fs, "fs"), 0);
        assert_eq!(registry.pending(CacheKind::Settings, "fs"), 1);
    }

    #[test]
    fn callback_may_register_again() {
        let registry = CommitCallbacks::new();
        let inner = registry.clone();
        registry.register(
            CacheKind::Fs,
            "fs",
            Box::new(move |_| inner.register(CacheKind::Fs, "fs", Box::new(|_| {}))),
        );
        let err = Err(CacheError::Config("x".into()));
        registry.call_and_clear(CacheKind::Fs, "fs", &err);
        assert_eq!(registry.pending(CacheKind::Fs, "fs"), 1);
    }
}
