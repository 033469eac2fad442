//! The remote RPC surface (the canister)
//!
//! One method is one round trip. Implementations return the remote error
//! union verbatim; the client layer never retries.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RemoteResult;

pub type ChunkId = u64;

/// Asset descriptor exchanged at initiate/fetch-info time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentInfo {
    pub uid: String,
    pub name: String,
    pub size: u64,
    pub total_chunks: u64,
    pub dtype: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentChunk {
    pub chunk_id: ChunkId,
    pub chunk: Vec<u8>,
}

/// User profile as stored remotely
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserProfile {
    pub firstname: String,
    pub lastname: String,
    /// Serialized avatar descriptor, if any
    pub avatar: Option<String>,
}

/// Profile as returned by the remote, with its assigned uid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub uid: String,
    #[serde(flatten)]
    pub profile: UserProfile,
}

#[async_trait]
pub trait Canister: Send + Sync {
    async fn initiate_upload(&self, info: &ContentInfo, overwrite: bool) -> RemoteResult<()>;
    async fn add_chunk(&self, uid: &str, chunk: ContentChunk) -> RemoteResult<()>;
    /// Finalize an upload; the remote checks the received chunk count
    async fn commit_upload(&self, uid: &str) -> RemoteResult<()>;
    async fn fetch_asset_info(&self, uid: &str) -> RemoteResult<ContentInfo>;
    async fn fetch_chunk(&self, uid: &str, chunk_id: ChunkId) -> RemoteResult<ContentChunk>;
    async fn delete_asset(&self, uid: &str) -> RemoteResult<()>;

    async fn get_setting(&self, key: &str) -> RemoteResult<String>;
    async fn set_setting(&self, key: &str, json: String) -> RemoteResult<()>;
    async fn delete_setting(&self, key: &str) -> RemoteResult<()>;

    async fn get_filesystem(&self) -> RemoteResult<String>;
    async fn set_filesystem(&self, json: String) -> RemoteResult<()>;

    async fn get_user_profile(&self) -> RemoteResult<UserInfo>;
    async fn set_user_profile(&self, profile: &UserProfile) -> RemoteResult<()>;
    async fn create_user(&self, profile: &UserProfile, filesystem: Option<String>) -> RemoteResult<()>;
}
