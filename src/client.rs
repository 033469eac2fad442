//! Remote asset protocol client
//!
//! Uploads run initiate -> add-chunk (fanned out over the worker pool,
//! chunk `i` on worker `i % N`) -> commit. Downloads run fetch-info ->
//! fetch-chunk, reassembled by chunk id. Settings, filesystem and profile
//! calls are single round trips made directly on the canister.
//!
//! Nothing here retries. Remote errors come back untouched.

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::activity::{ActivityState, ActivityTarget, ActivityTracker, Direction};
use crate::callbacks::{
    self, ChunkProgress, ChunkProgressFn, CommitCallbacks, CommitInfo, CommitResult, ItemProgress, ProgressFn,
};
use crate::chunking::{self, TransferSession};
use crate::codec::{self, Payload};
use crate::error::{CacheError, CacheResult, TransportError};
use crate::logger::{NoopLogger, TransferLogger};
use crate::protocol::{FS_KEY, FS_NAME};
use crate::remote::{Canister, ContentChunk, ContentInfo, UserInfo, UserProfile};
use crate::store::CacheKind;
use crate::worker_pool::{TaskOutput, WorkerPool, WorkerTask};

/// One whole-asset upload in a batch
#[derive(Debug, Clone, PartialEq)]
pub struct AssetUpload {
    pub uid: String,
    pub name: String,
    pub payload: Payload,
    pub overwrite: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedAsset {
    pub info: ContentInfo,
    pub payload: Payload,
}

/// Everything a new user starts with
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub profile: UserProfile,
    pub filesystem: Option<Value>,
    pub settings: BTreeMap<String, Value>,
    pub assets: Vec<AssetUpload>,
}

pub struct AssetClient {
    canister: Arc<dyn Canister>,
    pool: WorkerPool,
    callbacks: CommitCallbacks,
    activity: Arc<ActivityTracker>,
    logger: Arc<dyn TransferLogger>,
    chunk_size: usize,
}

impl AssetClient {
    pub fn new(canister: Arc<dyn Canister>, pool: WorkerPool, callbacks: CommitCallbacks, chunk_size: usize) -> Self {
        Self {
            canister,
            pool,
            callbacks,
            activity: Arc::new(ActivityTracker::new()),
            logger: Arc::new(NoopLogger),
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn TransferLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_activity(mut self, activity: Arc<ActivityTracker>) -> Self {
        self.activity = activity;
        self
    }

    pub fn activity(&self) -> &Arc<ActivityTracker> {
        &self.activity
    }

    pub fn logger(&self) -> &Arc<dyn TransferLogger> {
        &self.logger
    }

    pub fn callbacks(&self) -> &CommitCallbacks {
        &self.callbacks
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn settle(&self, kind: CacheKind, uid: &str, name: &str, res: &CacheResult<()>) -> CommitResult {
        let outcome = match res {
            Ok(()) => Ok(CommitInfo {
                uid: uid.to_string(),
                name: name.to_string(),
            }),
            Err(e) => Err(e.clone()),
        };
        self.callbacks.call_and_clear(kind, uid, &outcome);
        outcome
    }

    fn failed(&self, context: &str, uid: &str, err: &CacheError) {
        warn!(uid, error = %err, "{context} failed");
        self.activity.set_state(uid, ActivityState::Failed);
        self.logger.error(context, uid, &err.to_string());
    }

    // ---- assets ----

    /// Upload one asset and fire the callbacks registered for its uid.
    /// Returns the encoded byte size.
    pub async fn store_asset(
        &self,
        uid: &str,
        name: &str,
        payload: &Payload,
        overwrite: bool,
        on_chunk: Option<ChunkProgressFn<'_>>,
    ) -> CacheResult<u64> {
        let res = self.push_asset(uid, name, payload, overwrite, on_chunk).await;
        self.settle(CacheKind::Asset, uid, name, &res.as_ref().map(|_| ()).map_err(Clone::clone));
        res
    }

    /// Upload without firing callbacks; the commit scheduler settles them
    /// once the cache entry itself has settled.
    pub(crate) async fn push_asset(
        &self,
        uid: &str,
        name: &str,
        payload: &Payload,
        overwrite: bool,
        on_chunk: Option<ChunkProgressFn<'_>>,
    ) -> CacheResult<u64> {
        let res = self.upload(uid, name, payload, overwrite, on_chunk).await;
        if let Err(e) = &res {
            self.failed("upload", uid, e);
        }
        res
    }

    async fn upload(
        &self,
        uid: &str,
        name: &str,
        payload: &Payload,
        overwrite: bool,
        on_chunk: Option<ChunkProgressFn<'_>>,
    ) -> CacheResult<u64> {
        let started = Instant::now();
        let encoded = codec::encode(payload);
        let size = encoded.bytes.len() as u64;
        let total = chunking::total_chunks(encoded.bytes.len(), self.chunk_size);
        let info = ContentInfo {
            uid: uid.to_string(),
            name: name.to_string(),
            size,
            total_chunks: total,
            dtype: encoded.dtype.clone(),
        };

        self.activity.begin(
            uid,
            Direction::Upload,
            ActivityTarget::Asset {
                info: Some(info.clone()),
                processed_chunks: 0,
            },
            ActivityState::Init,
        );
        self.logger.upload_start(uid, name, total);
        debug!(uid, name, size, total, dtype = %info.dtype, "initiate upload");

        self.canister.initiate_upload(&info, overwrite).await?;
        self.activity.set_state(uid, ActivityState::Processing);

        let workers = self.pool.size();
        let mut pending = FuturesUnordered::new();
        for (id, slice) in chunking::split(&encoded.bytes, self.chunk_size) {
            let task = WorkerTask::UploadChunk {
                uid: uid.to_string(),
                chunk: ContentChunk {
                    chunk_id: id,
                    chunk: slice.to_vec(),
                },
            };
            let handle = self.pool.submit(id as usize % workers, task);
            pending.push(async move { (id, handle.await) });
        }

        let mut session = TransferSession::new(uid, total, encoded.dtype);
        while let Some((id, res)) = pending.next().await {
            match res {
                Ok(_) => {
                    session.mark_ok(id)?;
                    self.activity.inc_processed_chunks(uid);
                    if let Some(cb) = on_chunk {
                        cb(ChunkProgress {
                            chunk_id: id,
                            completed: session.completed() as u64,
                            total,
                        });
                    }
                }
                Err(e) => {
                    debug!(uid, chunk = id, error = %e, "chunk upload failed");
                    session.mark_error(id, e);
                }
            }
        }
        if let Some(e) = session.first_error() {
            return Err(e.clone());
        }

        self.canister.commit_upload(uid).await?;
        self.activity.set_state(uid, ActivityState::Success);
        self.logger.upload_done(uid, size);
        info!(uid, size, chunks = total, elapsed_ms = started.elapsed().as_millis() as u64, "asset stored");
        Ok(size)
    }

    pub async fn fetch_asset(&self, uid: &str, on_chunk: Option<ChunkProgressFn<'_>>) -> CacheResult<FetchedAsset> {
        let res = self.download(uid, on_chunk).await;
        if let Err(e) = &res {
            self.failed("download", uid, e);
        }
        res
    }

    async fn download(&self, uid: &str, on_chunk: Option<ChunkProgressFn<'_>>) -> CacheResult<FetchedAsset> {
        self.activity.begin(
            uid,
            Direction::Download,
            ActivityTarget::Asset {
                info: None,
                processed_chunks: 0,
            },
            ActivityState::Init,
        );
        let info = self.canister.fetch_asset_info(uid).await?;
        self.activity.set_info(uid, info.clone());
        self.activity.set_state(uid, ActivityState::Processing);
        debug!(uid, total = info.total_chunks, dtype = %info.dtype, "fetch asset");

        let workers = self.pool.size();
        let mut pending = FuturesUnordered::new();
        for id in 0..info.total_chunks {
            let task = WorkerTask::DownloadChunk {
                uid: uid.to_string(),
                chunk_id: id,
            };
            let handle = self.pool.submit(id as usize % workers, task);
            pending.push(async move { (id, handle.await) });
        }

        let mut session = TransferSession::for_download(uid, info.total_chunks, info.dtype.clone());
        while let Some((id, res)) = pending.next().await {
            match res {
                Ok(TaskOutput::Downloaded(chunk)) => {
                    session.store_part(id, chunk.chunk)?;
                    self.activity.inc_processed_chunks(uid);
                    if let Some(cb) = on_chunk {
                        cb(ChunkProgress {
                            chunk_id: id,
                            completed: session.completed() as u64,
                            total: info.total_chunks,
                        });
                    }
                }
                Ok(TaskOutput::Uploaded(_)) => {
                    session.mark_error(
                        id,
                        TransportError::Preprocess("download task answered as upload".into()).into(),
                    );
                }
                Err(e) => {
                    debug!(uid, chunk = id, error = %e, "chunk download failed");
                    session.mark_error(id, e);
                }
            }
        }

        let bytes = session.reassemble()?;
        let size = bytes.len() as u64;
        let payload = codec::decode(bytes, &info.dtype)?;
        self.activity.set_state(uid, ActivityState::Success);
        self.logger.download_done(uid, size);
        Ok(FetchedAsset { info, payload })
    }

    /// Upload many assets concurrently. A uid repeated in `items` is uploaded
    /// once; every occurrence gets that upload's result. Results follow the
    /// input order and one failure never affects another asset.
    pub async fn store_assets_batch(&self, items: &[AssetUpload], progress: Option<ProgressFn<'_>>) -> Vec<CommitResult> {
        callbacks::report(progress, ItemProgress::Estimation { items: items.len() });
        let mut first_of: HashMap<&str, usize> = HashMap::new();
        let mut unique = Vec::new();
        for (i, item) in items.iter().enumerate() {
            if !first_of.contains_key(item.uid.as_str()) {
                first_of.insert(item.uid.as_str(), i);
                unique.push(item);
            }
        }

        let outcomes = futures::future::join_all(unique.into_iter().map(|item| async move {
            let res = self
                .store_asset(&item.uid, &item.name, &item.payload, item.overwrite, None)
                .await
                .map(|_| CommitInfo {
                    uid: item.uid.clone(),
                    name: item.name.clone(),
                });
            if res.is_ok() {
                callbacks::report(progress, ItemProgress::item(&item.uid, &item.name));
            }
            (item.uid.as_str(), res)
        }))
        .await;
        let by_uid: HashMap<&str, CommitResult> = outcomes.into_iter().collect();

        items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let res = by_uid
                    .get(item.uid.as_str())
                    .cloned()
                    .unwrap_or_else(|| Err(CacheError::Config(format!("no outcome for \"{}\"", item.uid))));
                if first_of.get(item.uid.as_str()) != Some(&i) && res.is_ok() {
                    callbacks::report(progress, ItemProgress::item(&item.uid, &item.name));
                }
                res
            })
            .collect()
    }

    /// Download many assets concurrently, deduplicating repeated uids
    pub async fn fetch_asset_batch(&self, uids: &[String], progress: Option<ProgressFn<'_>>) -> Vec<CacheResult<FetchedAsset>> {
        callbacks::report(progress, ItemProgress::Estimation { items: uids.len() });
        let mut unique: Vec<&str> = Vec::new();
        for uid in uids {
            if !unique.contains(&uid.as_str()) {
                unique.push(uid);
            }
        }
        let outcomes = futures::future::join_all(unique.into_iter().map(|uid| async move {
            let res = self.fetch_asset(uid, None).await;
            if let Ok(a) = &res {
                callbacks::report(progress, ItemProgress::item(uid, &a.info.name));
            }
            (uid, res)
        }))
        .await;
        let by_uid: HashMap<&str, CacheResult<FetchedAsset>> = outcomes.into_iter().collect();
        uids.iter()
            .map(|uid| {
                by_uid
                    .get(uid.as_str())
                    .cloned()
                    .unwrap_or_else(|| Err(CacheError::Config(format!("no outcome for \"{uid}\""))))
            })
            .collect()
    }

    pub async fn delete_asset(&self, uid: &str) -> CacheResult<()> {
        self.canister.delete_asset(uid).await?;
        debug!(uid, "asset deleted");
        Ok(())
    }

    // ---- settings ----

    pub async fn store_setting(&self, key: &str, value: &Value) -> CacheResult<()> {
        let res = self.push_setting(key, value).await;
        self.settle(CacheKind::Settings, key, key, &res);
        res
    }

    pub(crate) async fn push_setting(&self, key: &str, value: &Value) -> CacheResult<()> {
        self.activity.begin(
            key,
            Direction::Upload,
            ActivityTarget::Setting { key: key.to_string() },
            ActivityState::Processing,
        );
        let res = self
            .canister
            .set_setting(key, value.to_string())
            .await
            .map_err(CacheError::from);
        match &res {
            Ok(()) => self.activity.set_state(key, ActivityState::Success),
            Err(e) => self.failed("store setting", key, e),
        }
        res
    }

    /// Store every setting concurrently; one `Progress` per stored key
    pub async fn store_setting_batch(
        &self,
        settings: &BTreeMap<String, Value>,
        progress: Option<ProgressFn<'_>>,
    ) -> BTreeMap<String, CommitResult> {
        callbacks::report(progress, ItemProgress::Estimation { items: settings.len() });
        let outcomes = futures::future::join_all(settings.iter().map(|(key, value)| async move {
            let res = self.store_setting(key, value).await.map(|_| CommitInfo {
                uid: key.clone(),
                name: key.clone(),
            });
            if res.is_ok() {
                callbacks::report(progress, ItemProgress::item(key, key));
            }
            (key.clone(), res)
        }))
        .await;
        outcomes.into_iter().collect()
    }

    pub async fn fetch_setting(&self, key: &str) -> CacheResult<Value> {
        self.activity.begin(
            key,
            Direction::Download,
            ActivityTarget::Setting { key: key.to_string() },
            ActivityState::Processing,
        );
        let res = async {
            let json = self.canister.get_setting(key).await?;
            Ok::<_, CacheError>(serde_json::from_str::<Value>(&json)?)
        }
        .await;
        match &res {
            Ok(_) => self.activity.set_state(key, ActivityState::Success),
            Err(e) => self.failed("fetch setting", key, e),
        }
        res
    }

    /// Fetch several settings. Repeated keys are fetched once; keys that are
    /// missing or unparsable are left out of the result.
    pub async fn fetch_setting_batch(&self, keys: &[String], progress: Option<ProgressFn<'_>>) -> BTreeMap<String, Value> {
        callbacks::report(progress, ItemProgress::Estimation { items: keys.len() });
        let mut unique: Vec<&str> = Vec::new();
        for key in keys {
            if unique.contains(&key.as_str()) {
                callbacks::report(progress, ItemProgress::item(key, key));
            } else {
                unique.push(key);
            }
        }
        let outcomes = futures::future::join_all(unique.into_iter().map(|key| async move {
            let res = self.fetch_setting(key).await.ok();
            if res.is_some() {
                callbacks::report(progress, ItemProgress::item(key, key));
            }
            (key.to_string(), res)
        }))
        .await;
        outcomes
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect()
    }

    pub async fn delete_setting(&self, key: &str) -> CacheResult<()> {
        self.canister.delete_setting(key).await?;
        Ok(())
    }

    // ---- filesystem ----

    pub async fn store_filesystem(&self, tree: &Value) -> CacheResult<()> {
        let res = self.push_filesystem(tree).await;
        self.settle(CacheKind::Fs, FS_KEY, FS_NAME, &res);
        res
    }

    pub(crate) async fn push_filesystem(&self, tree: &Value) -> CacheResult<()> {
        self.activity.begin(FS_KEY, Direction::Upload, ActivityTarget::Filesystem, ActivityState::Processing);
        let res = self
            .canister
            .set_filesystem(tree.to_string())
            .await
            .map_err(CacheError::from);
        match &res {
            Ok(()) => self.activity.set_state(FS_KEY, ActivityState::Success),
            Err(e) => self.failed("store filesystem", FS_KEY, e),
        }
        res
    }

    pub async fn fetch_filesystem(&self) -> CacheResult<Value> {
        self.activity.begin(FS_KEY, Direction::Download, ActivityTarget::Filesystem, ActivityState::Processing);
        let res = async {
            let json = self.canister.get_filesystem().await?;
            Ok::<_, CacheError>(serde_json::from_str::<Value>(&json)?)
        }
        .await;
        match &res {
            Ok(_) => self.activity.set_state(FS_KEY, ActivityState::Success),
            Err(e) => self.failed("fetch filesystem", FS_KEY, e),
        }
        res
    }

    // ---- user ----

    pub async fn fetch_user_profile(&self) -> CacheResult<UserInfo> {
        Ok(self.canister.get_user_profile().await?)
    }

    pub async fn update_user_profile(&self, profile: &UserProfile) -> CacheResult<()> {
        Ok(self.canister.set_user_profile(profile).await?)
    }

    /// Register the user with its initial filesystem, then push its settings
    /// and assets. Setting and asset failures are reported per item and do
    /// not undo the registration.
    pub async fn create_user(&self, user: &NewUser, progress: Option<ProgressFn<'_>>) -> CacheResult<Vec<CommitResult>> {
        callbacks::report(
            progress,
            ItemProgress::Estimation {
                items: 2 + user.settings.len() + user.assets.len(),
            },
        );
        let fs_json = user.filesystem.as_ref().map(Value::to_string);
        self.canister.create_user(&user.profile, fs_json).await?;
        callbacks::report(progress, ItemProgress::item("user", &user.profile.firstname));
        callbacks::report(progress, ItemProgress::item(FS_KEY, FS_NAME));
        info!(settings = user.settings.len(), assets = user.assets.len(), "user created");

        let forward = |p: ItemProgress| {
            if matches!(p, ItemProgress::Progress { .. }) {
                callbacks::report(progress, p);
            }
        };
        let mut outcomes: Vec<CommitResult> = self
            .store_setting_batch(&user.settings, Some(&forward))
            .await
            .into_values()
            .collect();
        outcomes.extend(self.store_assets_batch(&user.assets, Some(&forward)).await);
        Ok(outcomes)
    }
}
