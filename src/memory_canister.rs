//! In-process canister
//!
//! Implements the remote surface with the documented remote-side semantics
//! (initiate -> add chunk -> commit, chunk-count validation, overwrite
//! checks). Used as the backend of the demo binary and as the test double:
//! it records every call and supports fault injection, artificial latency
//! and a gate that holds write-finalizing calls.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::chunking;
use crate::codec::{self, Payload};
use crate::error::{RemoteError, RemoteErrorKind, RemoteResult};
use crate::remote::{Canister, ChunkId, ContentChunk, ContentInfo, UserInfo, UserProfile};

/// One recorded remote call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    InitiateUpload { uid: String, size: u64, total_chunks: u64, dtype: String, overwrite: bool },
    AddChunk { uid: String, chunk_id: ChunkId, chunk: Vec<u8> },
    CommitUpload { uid: String },
    FetchAssetInfo { uid: String },
    FetchChunk { uid: String, chunk_id: ChunkId },
    DeleteAsset { uid: String },
    GetSetting { key: String },
    SetSetting { key: String, json: String },
    DeleteSetting { key: String },
    GetFilesystem,
    SetFilesystem { json: String },
    GetUserProfile,
    SetUserProfile,
    CreateUser,
}

struct StoredAsset {
    info: ContentInfo,
    chunks: Vec<Vec<u8>>,
}

struct PendingUpload {
    info: ContentInfo,
    chunks: BTreeMap<ChunkId, Vec<u8>>,
}

#[derive(Default)]
struct Faults {
    chunks: HashSet<(String, ChunkId)>,
    commits: HashSet<String>,
    settings: HashSet<String>,
    deletes: bool,
    filesystem: bool,
}

#[derive(Default)]
struct State {
    assets: HashMap<String, StoredAsset>,
    pending: HashMap<String, PendingUpload>,
    settings: HashMap<String, String>,
    filesystem: Option<String>,
    user: Option<UserInfo>,
    calls: Vec<RemoteCall>,
    faults: Faults,
}

#[derive(Default)]
pub struct MemoryCanister {
    state: Mutex<State>,
    latency: Duration,
    gate: Mutex<Option<Arc<Semaphore>>>,
    writes_in_flight: AtomicUsize,
    peak_writes_in_flight: AtomicUsize,
}

fn injected(kind: RemoteErrorKind, what: &str) -> RemoteError {
    RemoteError::new(kind, format!("injected failure: {what}"))
}

impl MemoryCanister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps for `latency` before touching state
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    async fn round_trip(&self, call: RemoteCall) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.state.lock().calls.push(call);
    }

    /// Wait on the write gate (if held) while counting concurrent writes
    async fn gated_write(&self) -> WriteGuard<'_> {
        let n = self.writes_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_writes_in_flight.fetch_max(n, Ordering::SeqCst);
        let gate = self.gate.lock().clone();
        if let Some(sem) = gate {
            // A closed gate lets everyone through
            if let Ok(permit) = sem.acquire().await {
                permit.forget();
            }
        }
        WriteGuard { canister: self }
    }

    // ---- fault injection & gating ----

    pub fn fail_chunk(&self, uid: &str, chunk_id: ChunkId) {
        self.state.lock().faults.chunks.insert((uid.to_string(), chunk_id));
    }

    pub fn fail_commit(&self, uid: &str) {
        self.state.lock().faults.commits.insert(uid.to_string());
    }

    pub fn fail_setting(&self, key: &str) {
        self.state.lock().faults.settings.insert(key.to_string());
    }

    pub fn fail_deletes(&self, on: bool) {
        self.state.lock().faults.deletes = on;
    }

    pub fn fail_filesystem(&self, on: bool) {
        self.state.lock().faults.filesystem = on;
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults = Faults::default();
    }

    /// Block write-finalizing calls (initiate, set setting, set filesystem)
    pub fn hold_writes(&self) {
        *self.gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let exactly `n` held writes proceed
    pub fn release_writes(&self, n: usize) {
        if let Some(sem) = self.gate.lock().as_ref() {
            sem.add_permits(n);
        }
    }

    /// Drop the gate entirely
    pub fn open_writes(&self) {
        if let Some(sem) = self.gate.lock().take() {
            sem.close();
        }
    }

    /// Highest number of write-finalizing calls observed at once
    pub fn peak_writes_in_flight(&self) -> usize {
        self.peak_writes_in_flight.load(Ordering::SeqCst)
    }

    // ---- introspection ----

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn count_calls(&self, pred: impl Fn(&RemoteCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| pred(c)).count()
    }

    /// Committed asset info and its reassembled bytes
    pub fn asset(&self, uid: &str) -> Option<(ContentInfo, Vec<u8>)> {
        let state = self.state.lock();
        state
            .assets
            .get(uid)
            .map(|a| (a.info.clone(), a.chunks.concat()))
    }

    pub fn setting(&self, key: &str) -> Option<String> {
        self.state.lock().settings.get(key).cloned()
    }

    pub fn filesystem(&self) -> Option<String> {
        self.state.lock().filesystem.clone()
    }

    /// Place a committed asset directly, bypassing the protocol
    pub fn seed_asset(&self, uid: &str, name: &str, payload: &Payload, chunk_size: usize) {
        let encoded = codec::encode(payload);
        let chunks: Vec<Vec<u8>> = chunking::split(&encoded.bytes, chunk_size)
            .map(|(_, c)| c.to_vec())
            .collect();
        let info = ContentInfo {
            uid: uid.to_string(),
            name: name.to_string(),
            size: encoded.bytes.len() as u64,
            total_chunks: chunks.len() as u64,
            dtype: encoded.dtype,
        };
        self.state
            .lock()
            .assets
            .insert(uid.to_string(), StoredAsset { info, chunks });
    }

    pub fn seed_setting(&self, key: &str, json: &str) {
        self.state.lock().settings.insert(key.to_string(), json.to_string());
    }

    pub fn seed_filesystem(&self, json: &str) {
        self.state.lock().filesystem = Some(json.to_string());
    }
}

struct WriteGuard<'a> {
    canister: &'a MemoryCanister,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.canister.writes_in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Canister for MemoryCanister {
    async fn initiate_upload(&self, info: &ContentInfo, overwrite: bool) -> RemoteResult<()> {
        let _write = self.gated_write().await;
        self.round_trip(RemoteCall::InitiateUpload {
            uid: info.uid.clone(),
            size: info.size,
            total_chunks: info.total_chunks,
            dtype: info.dtype.clone(),
            overwrite,
        })
        .await;
        let mut state = self.state.lock();
        if !overwrite && state.assets.contains_key(&info.uid) {
            return Err(RemoteError::new(
                RemoteErrorKind::AssetAlreadyExists,
                format!("asset \"{}\" already exists", info.uid),
            ));
        }
        state.pending.insert(
            info.uid.clone(),
            PendingUpload {
                info: info.clone(),
                chunks: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn add_chunk(&self, uid: &str, chunk: ContentChunk) -> RemoteResult<()> {
        self.round_trip(RemoteCall::AddChunk {
            uid: uid.to_string(),
            chunk_id: chunk.chunk_id,
            chunk: chunk.chunk.clone(),
        })
        .await;
        let mut state = self.state.lock();
        if state.faults.chunks.contains(&(uid.to_string(), chunk.chunk_id)) {
            return Err(injected(RemoteErrorKind::AssetOutOfBoundAccess, "add chunk"));
        }
        let pending = state.pending.get_mut(uid).ok_or_else(|| {
            RemoteError::new(
                RemoteErrorKind::AssetInitialize,
                format!("upload for \"{uid}\" was never initiated"),
            )
        })?;
        if chunk.chunk_id >= pending.info.total_chunks {
            return Err(RemoteError::new(
                RemoteErrorKind::AssetOutOfBoundAccess,
                format!(
                    "chunk {} out of bounds ({} declared)",
                    chunk.chunk_id, pending.info.total_chunks
                ),
            ));
        }
        pending.chunks.insert(chunk.chunk_id, chunk.chunk);
        Ok(())
    }

    async fn commit_upload(&self, uid: &str) -> RemoteResult<()> {
        self.round_trip(RemoteCall::CommitUpload { uid: uid.to_string() }).await;
        let mut state = self.state.lock();
        if state.faults.commits.contains(uid) {
            return Err(injected(RemoteErrorKind::AssetCommit, "commit"));
        }
        let pending = state.pending.remove(uid).ok_or_else(|| {
            RemoteError::new(
                RemoteErrorKind::AssetInitialize,
                format!("no pending upload for \"{uid}\""),
            )
        })?;
        let received = pending.chunks.len() as u64;
        if received != pending.info.total_chunks {
            return Err(RemoteError::new(
                RemoteErrorKind::AssetCommit,
                format!(
                    "received {received} of {} chunks",
                    pending.info.total_chunks
                ),
            ));
        }
        let asset = StoredAsset {
            info: pending.info,
            chunks: pending.chunks.into_values().collect(),
        };
        state.assets.insert(uid.to_string(), asset);
        Ok(())
    }

    async fn fetch_asset_info(&self, uid: &str) -> RemoteResult<ContentInfo> {
        self.round_trip(RemoteCall::FetchAssetInfo { uid: uid.to_string() }).await;
        let state = self.state.lock();
        state
            .assets
            .get(uid)
            .map(|a| a.info.clone())
            .ok_or_else(|| RemoteError::not_found(uid))
    }

    async fn fetch_chunk(&self, uid: &str, chunk_id: ChunkId) -> RemoteResult<ContentChunk> {
        self.round_trip(RemoteCall::FetchChunk {
            uid: uid.to_string(),
            chunk_id,
        })
        .await;
        let state = self.state.lock();
        if state.faults.chunks.contains(&(uid.to_string(), chunk_id)) {
            return Err(injected(RemoteErrorKind::AssetOutOfBoundAccess, "fetch chunk"));
        }
        let asset = state.assets.get(uid).ok_or_else(|| RemoteError::not_found(uid))?;
        let chunk = asset.chunks.get(chunk_id as usize).ok_or_else(|| {
            RemoteError::new(
                RemoteErrorKind::AssetOutOfBoundAccess,
                format!("chunk {chunk_id} out of bounds for \"{uid}\""),
            )
        })?;
        Ok(ContentChunk {
            chunk_id,
            chunk: chunk.clone(),
        })
    }

    async fn delete_asset(&self, uid: &str) -> RemoteResult<()> {
        self.round_trip(RemoteCall::DeleteAsset { uid: uid.to_string() }).await;
        let mut state = self.state.lock();
        if state.faults.deletes {
            return Err(injected(RemoteErrorKind::Fetch, "delete"));
        }
        state
            .assets
            .remove(uid)
            .map(|_| ())
            .ok_or_else(|| RemoteError::not_found(uid))
    }

    async fn get_setting(&self, key: &str) -> RemoteResult<String> {
        self.round_trip(RemoteCall::GetSetting { key: key.to_string() }).await;
        let state = self.state.lock();
        state.settings.get(key).cloned().ok_or_else(|| {
            RemoteError::new(RemoteErrorKind::Fetch, format!("no setting \"{key}\""))
        })
    }

    async fn set_setting(&self, key: &str, json: String) -> RemoteResult<()> {
        let _write = self.gated_write().await;
        self.round_trip(RemoteCall::SetSetting {
            key: key.to_string(),
            json: json.clone(),
        })
        .await;
        let mut state = self.state.lock();
        if state.faults.settings.contains(key) {
            return Err(injected(RemoteErrorKind::Fetch, "set setting"));
        }
        state.settings.insert(key.to_string(), json);
        Ok(())
    }

    async fn delete_setting(&self, key: &str) -> RemoteResult<()> {
        self.round_trip(RemoteCall::DeleteSetting { key: key.to_string() }).await;
        let mut state = self.state.lock();
        if state.faults.deletes {
            return Err(injected(RemoteErrorKind::Fetch, "delete setting"));
        }
        state.settings.remove(key);
        Ok(())
    }

    async fn get_filesystem(&self) -> RemoteResult<String> {
        self.round_trip(RemoteCall::GetFilesystem).await;
        let state = self.state.lock();
        state
            .filesystem
            .clone()
            .ok_or_else(|| RemoteError::new(RemoteErrorKind::Fetch, "filesystem not initialized"))
    }

    async fn set_filesystem(&self, json: String) -> RemoteResult<()> {
        let _write = self.gated_write().await;
        self.round_trip(RemoteCall::SetFilesystem { json: json.clone() }).await;
        let mut state = self.state.lock();
        if state.faults.filesystem {
            return Err(injected(RemoteErrorKind::Fetch, "set filesystem"));
        }
        state.filesystem = Some(json);
        Ok(())
    }

    async fn get_user_profile(&self) -> RemoteResult<UserInfo> {
        self.round_trip(RemoteCall::GetUserProfile).await;
        self.state
            .lock()
            .user
            .clone()
            .ok_or_else(|| RemoteError::new(RemoteErrorKind::UserDoesNotExist, "no user registered"))
    }

    async fn set_user_profile(&self, profile: &UserProfile) -> RemoteResult<()> {
        self.round_trip(RemoteCall::SetUserProfile).await;
        let mut state = self.state.lock();
        match state.user.as_mut() {
            Some(user) => {
                user.profile = profile.clone();
                Ok(())
            }
            None => Err(RemoteError::new(
                RemoteErrorKind::UserDoesNotExist,
                "no user registered",
            )),
        }
    }

    async fn create_user(&self, profile: &UserProfile, filesystem: Option<String>) -> RemoteResult<()> {
        self.round_trip(RemoteCall::CreateUser).await;
        let mut state = self.state.lock();
        if state.user.is_some() {
            return Err(RemoteError::new(
                RemoteErrorKind::UserAlreadyExists,
                "user already registered",
            ));
        }
        state.user = Some(UserInfo {
            uid: codec::random_uid(),
            profile: profile.clone(),
        });
        if filesystem.is_some() {
            state.filesystem = filesystem;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(uid: &str, chunks: u64) -> ContentInfo {
        ContentInfo {
            uid: uid.into(),
            name: "n".into(),
            size: chunks,
            total_chunks: chunks,
            dtype: "x/y".into(),
        }
    }

    #[tokio::test]
    async fn commit_validates_chunk_count() {
        let c = MemoryCanister::new();
        c.initiate_upload(&info("a", 2), false).await.unwrap();
        c.add_chunk("a", ContentChunk { chunk_id: 0, chunk: vec![1] }).await.unwrap();
        let err = c.commit_upload("a").await.unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::AssetCommit);
        assert!(c.asset("a").is_none());
    }

    #[tokio::test]
    async fn initiate_without_overwrite_rejects_existing() {
        let c = MemoryCanister::new();
        c.seed_asset("a", "n", &Payload::from("x"), 4);
        let err = c.initiate_upload(&info("a", 1), false).await.unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::AssetAlreadyExists);
        c.initiate_upload(&info("a", 1), true).await.unwrap();
    }

    #[tokio::test]
    async fn chunk_out_of_bounds() {
        let c = MemoryCanister::new();
        c.initiate_upload(&info("a", 1), false).await.unwrap();
        let err = c
            .add_chunk("a", ContentChunk { chunk_id: 1, chunk: vec![1] })
            .await
            .unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::AssetOutOfBoundAccess);
    }

    #[tokio::test]
    async fn create_user_only_once() {
        let c = MemoryCanister::new();
        let p = UserProfile {
            firstname: "Ada".into(),
            ..Default::default()
        };
        c.create_user(&p, Some("{}".into())).await.unwrap();
        assert_eq!(c.filesystem().as_deref(), Some("{}"));
        let err = c.create_user(&p, None).await.unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::UserAlreadyExists);
        assert_eq!(c.get_user_profile().await.unwrap().profile, p);
    }
}
