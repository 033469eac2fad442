//! Commit scheduler and dirty tracker
//!
//! Per key: Clean -> Dirty (local write) -> Committing (claimed) -> Clean on
//! ack, or back to Dirty on failure. A key is claimed by at most one commit
//! at a time. Anyone else who wants to commit it waits for the claim to be
//! released and then re-checks. A write that lands mid-commit keeps the
//! entry dirty for the next pass.

use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::callbacks::{self, CommitCallback, CommitCallbacks, CommitInfo, CommitResult, ItemProgress, ProgressFn};
use crate::client::AssetClient;
use crate::error::{CacheError, CacheResult};
use crate::journal::{CommitJournal, CommitLogEntry, CommitStatus};
use crate::logger::TransferLogger;
use crate::protocol::FS_NAME;
use crate::store::{BeginCommit, CacheEntry, CacheKind, LocalStore};

/// Receives per-item commit failures during a flush
pub type ErrorFn<'a> = &'a (dyn Fn(CacheKind, &str, &CacheError) + Send + Sync);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub committed: usize,
    pub failed: usize,
}

impl FlushSummary {
    fn absorb(&mut self, other: FlushSummary) {
        self.committed += other.committed;
        self.failed += other.failed;
    }
}

pub struct CommitScheduler {
    store: Arc<LocalStore>,
    client: Arc<AssetClient>,
    callbacks: CommitCallbacks,
    settled: Notify,
    journal: Option<CommitJournal>,
}

fn display_name(kind: CacheKind, entry: &CacheEntry) -> &str {
    if kind == CacheKind::Fs {
        FS_NAME
    } else {
        &entry.name
    }
}

fn as_json(entry: &CacheEntry) -> CacheResult<Value> {
    entry.payload.to_json().ok_or(CacheError::TypeMismatch {
        stored: entry.payload.type_name(),
        given: "Json",
    })
}

impl CommitScheduler {
    /// `callbacks` holds the per-key commit callbacks fired on release
    pub fn new(store: Arc<LocalStore>, client: Arc<AssetClient>, callbacks: CommitCallbacks) -> Self {
        Self {
            store,
            client,
            callbacks,
            settled: Notify::new(),
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: CommitJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn journal(&self) -> Option<&CommitJournal> {
        self.journal.as_ref()
    }

    fn logger(&self) -> &Arc<dyn TransferLogger> {
        self.client.logger()
    }

    pub fn register_callback(&self, kind: CacheKind, uid: &str, cb: CommitCallback) {
        self.callbacks.register(kind, uid, cb);
    }

    /// Claim a dirty entry for commit, waiting out any commit already in
    /// flight for it. `None` once the entry is clean or gone.
    async fn claim(&self, kind: CacheKind, uid: &str) -> Option<CacheEntry> {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not lost
            notified.as_mut().enable();
            match self.store.try_begin_commit(kind, uid) {
                BeginCommit::Started(entry) => return Some(entry),
                BeginCommit::InFlight => {
                    debug!(%kind, uid, "commit in flight, waiting");
                    notified.await;
                }
                BeginCommit::Clean | BeginCommit::Missing => return None,
            }
        }
    }

    /// Settle a claimed entry: update its state first, then fire the
    /// callbacks registered for it.
    fn release(&self, kind: CacheKind, entry: &CacheEntry, res: &CacheResult<()>) {
        let cleaned = self
            .store
            .finish_commit(kind, &entry.uid, entry.meta.version, res.is_ok());
        self.settled.notify_waiters();
        self.record(kind, entry, res);
        let outcome: CommitResult = match res {
            Ok(()) => Ok(CommitInfo {
                uid: entry.uid.clone(),
                name: display_name(kind, entry).to_string(),
            }),
            Err(e) => Err(e.clone()),
        };
        self.callbacks.call_and_clear(kind, &entry.uid, &outcome);
        match res {
            Ok(()) => {
                self.logger().commit_done(kind, &entry.uid);
                debug!(%kind, uid = %entry.uid, cleaned, "commit settled");
            }
            Err(e) => warn!(%kind, uid = %entry.uid, error = %e, "commit failed, entry stays dirty"),
        }
    }

    fn record(&self, kind: CacheKind, entry: &CacheEntry, res: &CacheResult<()>) {
        let Some(journal) = &self.journal else {
            return;
        };
        let (status, error) = match res {
            Ok(()) => (CommitStatus::Completed, None),
            Err(e) => (CommitStatus::Failed, Some(e.to_string())),
        };
        let bytes = entry.payload.size() as u64;
        if let Err(e) = journal.add_entry(&CommitLogEntry::new(kind, &entry.uid, &entry.name, status, bytes, error)) {
            warn!(error = %e, "commit journal write failed");
        }
    }

    fn record_start(&self, kind: CacheKind, entry: &CacheEntry) {
        if let Some(journal) = &self.journal {
            let start = CommitLogEntry::new(
                kind,
                &entry.uid,
                &entry.name,
                CommitStatus::InProgress,
                entry.payload.size() as u64,
                None,
            );
            if let Err(e) = journal.add_entry(&start) {
                warn!(error = %e, "commit journal write failed");
            }
        }
    }

    async fn push(&self, kind: CacheKind, entry: &CacheEntry) -> CacheResult<()> {
        match kind {
            CacheKind::Asset => self
                .client
                .push_asset(&entry.uid, &entry.name, &entry.payload, true, None)
                .await
                .map(|_| ()),
            CacheKind::Fs => self.client.push_filesystem(&as_json(entry)?).await,
            CacheKind::Settings => self.client.push_setting(&entry.uid, &as_json(entry)?).await,
        }
    }

    /// Push a claimed entry and release it
    async fn commit_claimed(&self, kind: CacheKind, entry: &CacheEntry) -> CacheResult<()> {
        self.record_start(kind, entry);
        let res = self.push(kind, entry).await;
        self.release(kind, entry, &res);
        res
    }

    /// Commit one key now if it is dirty. Returns whether a commit ran.
    pub async fn commit_one(&self, kind: CacheKind, uid: &str) -> CacheResult<bool> {
        let Some(entry) = self.claim(kind, uid).await else {
            return Ok(false);
        };
        self.commit_claimed(kind, &entry).await.map(|_| true)
    }

    /// Commit a single entry, reporting `Estimation{1}` and one `Progress`.
    /// Nothing is reported when the entry turns out clean once claimed.
    pub async fn flush_one(&self, kind: CacheKind, uid: &str, progress: Option<ProgressFn<'_>>) -> CacheResult<bool> {
        let Some(entry) = self.claim(kind, uid).await else {
            return Ok(false);
        };
        callbacks::report(progress, ItemProgress::Estimation { items: 1 });
        self.commit_claimed(kind, &entry).await?;
        callbacks::report(progress, ItemProgress::item(uid, display_name(kind, &entry)));
        Ok(true)
    }

    async fn claim_dirty(&self, kind: CacheKind) -> Vec<CacheEntry> {
        let dirty = self.store.filter(kind, |_, meta, _| meta.is_dirty);
        let mut claimed = Vec::with_capacity(dirty.len());
        for e in dirty {
            if let Some(entry) = self.claim(kind, &e.uid).await {
                claimed.push(entry);
            }
        }
        claimed
    }

    /// Commit every dirty entry of `kind`. Every item is attempted; failures
    /// go to `on_error` when given, otherwise the first one is returned after
    /// the pass.
    pub async fn flush_kind(
        &self,
        kind: CacheKind,
        progress: Option<ProgressFn<'_>>,
        on_error: Option<ErrorFn<'_>>,
    ) -> CacheResult<FlushSummary> {
        let (summary, first_err) = self.run_kind(kind, progress, on_error).await;
        first_err.map_or(Ok(summary), Err)
    }

    async fn run_kind(
        &self,
        kind: CacheKind,
        progress: Option<ProgressFn<'_>>,
        on_error: Option<ErrorFn<'_>>,
    ) -> (FlushSummary, Option<CacheError>) {
        let claimed = self.claim_dirty(kind).await;
        if claimed.is_empty() {
            return (FlushSummary::default(), None);
        }
        callbacks::report(progress, ItemProgress::Estimation { items: claimed.len() });
        // Each entry settles as soon as its own push finishes
        let results = futures::future::join_all(claimed.iter().map(|entry| async move {
            let res = self.commit_claimed(kind, entry).await;
            if res.is_ok() {
                callbacks::report(progress, ItemProgress::item(&entry.uid, display_name(kind, entry)));
            }
            res
        }))
        .await;
        let outcomes: Vec<(CacheEntry, CacheResult<()>)> = claimed.into_iter().zip(results).collect();

        let mut summary = FlushSummary::default();
        let mut first_err = None;
        for (entry, res) in &outcomes {
            match res {
                Ok(()) => summary.committed += 1,
                Err(e) => {
                    summary.failed += 1;
                    match on_error {
                        Some(cb) => cb(kind, &entry.uid, e),
                        None => {
                            if first_err.is_none() {
                                first_err = Some(e.clone());
                            }
                        }
                    }
                }
            }
        }
        debug!(%kind, committed = summary.committed, failed = summary.failed, "kind flushed");
        (summary, first_err)
    }

    /// Flush every kind in order asset, fs, settings.
    ///
    /// Reports one `Estimation` with the total dirty count, then one
    /// `Progress` per committed entry. Without `on_error` the first failing
    /// kind stops the flush and its first error is returned.
    pub async fn flush_all(&self, progress: Option<ProgressFn<'_>>, on_error: Option<ErrorFn<'_>>) -> CacheResult<FlushSummary> {
        let started = Instant::now();
        let total: usize = CacheKind::ALL.iter().map(|k| self.store.dirty_count(*k)).sum();
        callbacks::report(progress, ItemProgress::Estimation { items: total });
        let forward = |p: ItemProgress| {
            if matches!(p, ItemProgress::Progress { .. }) {
                callbacks::report(progress, p);
            }
        };

        let mut summary = FlushSummary::default();
        for kind in CacheKind::ALL {
            let (s, err) = self.run_kind(kind, Some(&forward), on_error).await;
            summary.absorb(s);
            if let Some(e) = err {
                self.logger().flush_done(
                    summary.committed as u64,
                    summary.failed as u64,
                    started.elapsed().as_secs_f64(),
                );
                return Err(e);
            }
        }
        let secs = started.elapsed().as_secs_f64();
        self.logger()
            .flush_done(summary.committed as u64, summary.failed as u64, secs);
        info!(committed = summary.committed, failed = summary.failed, secs, "flush complete");
        Ok(summary)
    }
}
