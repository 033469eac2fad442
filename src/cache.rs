//! Read-through / write-behind cache over assets, the filesystem tree and
//! settings.
//!
//! Reads try the local store first, then the remote. Writes land locally
//! (merged per [`WriteMode`]) and are committed either immediately or on
//! the next flush.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::activity::ActivityTracker;
use crate::callbacks::{self, CommitCallback, CommitCallbacks, ItemProgress, ProgressFn};
use crate::client::AssetClient;
use crate::codec::{Payload, ValueType};
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::journal::CommitJournal;
use crate::logger::{NoopLogger, TextLogger, TransferLogger};
use crate::merge::{self, WriteMode};
use crate::protocol::{FS_KEY, FS_NAME};
use crate::remote::Canister;
use crate::scheduler::{CommitScheduler, ErrorFn, FlushSummary};
use crate::store::{CacheEntry, CacheKind, EntryMeta, LocalStore, MetaUpdate};
use crate::worker_pool::WorkerPool;

#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    /// Store (dirty) and return an empty value when neither side has one
    pub create_if_missing: bool,
    /// A cached value of another shape reads as absent
    pub expected: ValueType,
}

impl GetOptions {
    pub fn expect(expected: ValueType) -> Self {
        Self {
            create_if_missing: false,
            expected,
        }
    }

    pub fn or_create(mut self) -> Self {
        self.create_if_missing = true;
        self
    }
}

#[derive(Default)]
pub struct PutOptions {
    pub mode: WriteMode,
    /// `None` uses the configured default
    pub lazy_commit: Option<bool>,
    /// Drop the write when the cached entry is at least this recent
    pub data_modified: Option<u64>,
    /// Fired when the next commit of this key settles
    pub callback: Option<CommitCallback>,
}

impl PutOptions {
    pub fn mode(mode: WriteMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    pub fn eager(mut self) -> Self {
        self.lazy_commit = Some(false);
        self
    }

    pub fn lazy(mut self) -> Self {
        self.lazy_commit = Some(true);
        self
    }

    pub fn modified_hint(mut self, modified: u64) -> Self {
        self.data_modified = Some(modified);
        self
    }

    pub fn on_commit(mut self, cb: CommitCallback) -> Self {
        self.callback = Some(cb);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutReport {
    /// Size of the value now cached, after merging
    pub size: usize,
    /// False when the write was dropped as stale
    pub stored: bool,
    /// True when the entry is clean after an eager commit
    pub committed: bool,
}

pub struct CacheManager {
    store: Arc<LocalStore>,
    client: Arc<AssetClient>,
    scheduler: CommitScheduler,
    lazy_default: bool,
}

impl CacheManager {
    /// Build the full stack from `config`. Must run inside a tokio runtime.
    pub fn new(canister: Arc<dyn Canister>, config: &CacheConfig) -> CacheResult<Self> {
        let logger: Arc<dyn TransferLogger> = match &config.log_file {
            Some(path) => Arc::new(
                TextLogger::new(path)
                    .map_err(|e| CacheError::Config(format!("event log {}: {e}", path.display())))?,
            ),
            None => Arc::new(NoopLogger),
        };
        Self::with_logger(canister, config, logger)
    }

    pub fn with_logger(
        canister: Arc<dyn Canister>,
        config: &CacheConfig,
        logger: Arc<dyn TransferLogger>,
    ) -> CacheResult<Self> {
        let pool = WorkerPool::new(
            Arc::clone(&canister),
            config.effective_pool_size(),
            config.rpc_timeout_ms,
        );
        let callbacks = CommitCallbacks::new();
        let client = Arc::new(
            AssetClient::new(canister, pool, callbacks.clone(), config.chunk_size).with_logger(logger),
        );
        let store = Arc::new(LocalStore::new());
        let mut scheduler = CommitScheduler::new(Arc::clone(&store), Arc::clone(&client), callbacks);
        if let Some(path) = &config.journal_path {
            let journal = CommitJournal::new(path)
                .map_err(|e| CacheError::Config(format!("journal {}: {e}", path.display())))?;
            scheduler = scheduler.with_journal(journal);
        }
        Ok(Self {
            store,
            client,
            scheduler,
            lazy_default: config.lazy_commit,
        })
    }

    pub fn client(&self) -> &AssetClient {
        &self.client
    }

    pub fn activity(&self) -> &Arc<ActivityTracker> {
        self.client.activity()
    }

    pub fn journal(&self) -> Option<&CommitJournal> {
        self.scheduler.journal()
    }

    async fn fetch_remote(&self, kind: CacheKind, uid: &str) -> CacheResult<(String, Payload)> {
        match kind {
            CacheKind::Asset => {
                let fetched = self.client.fetch_asset(uid, None).await?;
                Ok((fetched.info.name, fetched.payload))
            }
            CacheKind::Fs => {
                let tree = self.client.fetch_filesystem().await?;
                Ok((FS_NAME.to_string(), Payload::from(tree)))
            }
            CacheKind::Settings => {
                let value = self.client.fetch_setting(uid).await?;
                Ok((uid.to_string(), Payload::from(value)))
            }
        }
    }

    /// Cached value, else the remote value (cached clean), else an empty
    /// dirty default when asked to create one.
    pub async fn get(&self, kind: CacheKind, uid: &str, opts: GetOptions) -> Option<Payload> {
        let narrow = |p: Payload| opts.expected.matches(&p).then_some(p);
        if let Some(entry) = self.store.get(kind, uid) {
            return narrow(entry.payload);
        }
        match self.fetch_remote(kind, uid).await {
            Ok((name, payload)) => return narrow(self.store.populate(kind, uid, &name, payload).payload),
            Err(e) => debug!(%kind, uid, error = %e, "read-through miss"),
        }
        if !opts.create_if_missing {
            return None;
        }
        let empty = opts.expected.empty_value();
        let created = self
            .store
            .write_with(kind, uid, uid, |cur| Ok(cur.is_none().then_some(empty)));
        if let Err(e) = created {
            warn!(%kind, uid, error = %e, "could not create default entry");
        }
        self.store.get(kind, uid).and_then(|e| narrow(e.payload))
    }

    /// Write `data` merged onto the current value.
    ///
    /// The merge baseline is the cached value, or the remote value when
    /// nothing is cached and `mode` is not overwrite. A type mismatch leaves
    /// the cache untouched. With an eager commit the local write stands even
    /// when the commit fails; the entry then stays dirty and the error is
    /// returned.
    pub async fn put(
        &self,
        kind: CacheKind,
        uid: &str,
        name: &str,
        data: Payload,
        opts: PutOptions,
    ) -> CacheResult<PutReport> {
        let PutOptions {
            mode,
            lazy_commit,
            data_modified,
            callback,
        } = opts;
        let data = data.normalized();

        let remote_base = if mode != WriteMode::Overwrite && !self.store.contains(kind, uid) {
            self.fetch_remote(kind, uid).await.ok().map(|(_, p)| p)
        } else {
            None
        };

        let written = self.store.write_with(kind, uid, name, |cur| {
            if let (Some(hint), Some(cur)) = (data_modified, cur) {
                if cur.meta.modified >= hint {
                    return Ok(None);
                }
            }
            let base = cur.map(|c| &c.payload).or(remote_base.as_ref());
            merge::merge(base, data, mode).map(Some)
        })?;

        let Some(entry) = written else {
            debug!(%kind, uid, hint = ?data_modified, "stale write dropped");
            let size = self.store.get(kind, uid).map_or(0, |e| e.payload.size());
            return Ok(PutReport {
                size,
                stored: false,
                committed: false,
            });
        };

        let size = entry.payload.size();
        if let Some(cb) = callback {
            self.scheduler.register_callback(kind, uid, cb);
        }
        if lazy_commit.unwrap_or(self.lazy_default) {
            return Ok(PutReport {
                size,
                stored: true,
                committed: false,
            });
        }

        self.scheduler.commit_one(kind, uid).await?;
        let committed = self.store.get(kind, uid).is_some_and(|e| !e.meta.is_dirty);
        Ok(PutReport {
            size,
            stored: true,
            committed,
        })
    }

    /// Point-in-time selection of entries
    pub fn filter<P>(&self, kind: CacheKind, pred: P) -> Vec<CacheEntry>
    where
        P: FnMut(&str, &EntryMeta, &Payload) -> bool,
    {
        self.store.filter(kind, pred)
    }

    /// Drop the local entry, then delete it remotely. The local removal
    /// stands even when the remote delete fails; the failure is logged and
    /// returned.
    pub async fn remove(&self, kind: CacheKind, uid: &str) -> CacheResult<Option<CacheEntry>> {
        let removed = self.store.remove(kind, uid);
        let remote = match kind {
            CacheKind::Asset => self.client.delete_asset(uid).await,
            CacheKind::Settings => self.client.delete_setting(uid).await,
            // The tree itself is never deleted remotely
            CacheKind::Fs => Ok(()),
        };
        if let Err(e) = remote {
            warn!(%kind, uid, error = %e, "remote delete failed");
            self.client.logger().error("remove", uid, &e.to_string());
            return Err(e);
        }
        Ok(removed)
    }

    /// Commit one entry (when `uid` is given) or every dirty entry of `kind`
    pub async fn flush(&self, kind: CacheKind, uid: Option<&str>, progress: Option<ProgressFn<'_>>) -> CacheResult<FlushSummary> {
        match uid {
            Some(uid) => {
                let ran = self.scheduler.flush_one(kind, uid, progress).await?;
                Ok(FlushSummary {
                    committed: usize::from(ran),
                    failed: 0,
                })
            }
            None => self.scheduler.flush_kind(kind, progress, None).await,
        }
    }

    pub async fn commit_all_dirty(
        &self,
        kind: CacheKind,
        progress: Option<ProgressFn<'_>>,
        on_error: Option<ErrorFn<'_>>,
    ) -> CacheResult<FlushSummary> {
        self.scheduler.flush_kind(kind, progress, on_error).await
    }

    pub async fn flush_all(&self, progress: Option<ProgressFn<'_>>, on_error: Option<ErrorFn<'_>>) -> CacheResult<FlushSummary> {
        self.scheduler.flush_all(progress, on_error).await
    }

    /// Forget a clean entry locally. Dirty or committing entries stay.
    pub fn evict(&self, kind: CacheKind, uid: &str) -> bool {
        self.store.evict(kind, uid)
    }

    pub fn clear_all(&self) {
        self.store.clear_all();
    }

    pub fn in_cache(&self, kind: CacheKind, uid: &str) -> bool {
        self.store.contains(kind, uid)
    }

    pub fn entry(&self, kind: CacheKind, uid: &str) -> Option<CacheEntry> {
        self.store.get(kind, uid)
    }

    pub fn dirty_count(&self, kind: CacheKind) -> usize {
        self.store.dirty_count(kind)
    }

    pub fn dirty_count_all(&self) -> usize {
        CacheKind::ALL.iter().map(|k| self.store.dirty_count(*k)).sum()
    }

    pub fn update_meta(&self, kind: CacheKind, uid: &str, update: MetaUpdate) -> bool {
        self.store.update_meta(kind, uid, update)
    }

    /// Cached filesystem tree, fetched and cached clean on a miss
    pub async fn get_fs(&self) -> CacheResult<Value> {
        if let Some(entry) = self.store.get(CacheKind::Fs, FS_KEY) {
            return entry.payload.to_json().ok_or(CacheError::TypeMismatch {
                stored: entry.payload.type_name(),
                given: "Json",
            });
        }
        let tree = self.client.fetch_filesystem().await?;
        self.store
            .populate(CacheKind::Fs, FS_KEY, FS_NAME, Payload::from(tree.clone()));
        Ok(tree)
    }

    pub async fn put_fs(&self, tree: Value, opts: PutOptions) -> CacheResult<PutReport> {
        self.put(CacheKind::Fs, FS_KEY, FS_NAME, Payload::from(tree), opts)
            .await
    }

    /// Read many settings through the cache. Settings found nowhere are left
    /// out; every key still reports progress.
    pub async fn get_settings(&self, keys: &[String], progress: Option<ProgressFn<'_>>) -> BTreeMap<String, Value> {
        callbacks::report(progress, ItemProgress::Estimation { items: keys.len() });
        let reads = futures::future::join_all(keys.iter().map(|key| async move {
            let value = self
                .get(CacheKind::Settings, key, GetOptions::default())
                .await
                .and_then(|p| p.to_json());
            callbacks::report(progress, ItemProgress::item(key, key));
            (key.clone(), value)
        }))
        .await;
        reads
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect()
    }
}
