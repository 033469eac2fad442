//! canistore
//!
//! Local write-behind cache over a chunked remote asset store. Assets,
//! the filesystem tree and settings are cached locally, tracked as dirty,
//! and committed to the canister with at most one commit in flight per key.

pub mod activity;
pub mod cache;
pub mod callbacks;
pub mod chunking;
pub mod cli;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod journal;
pub mod logger;
pub mod logging;
pub mod memory_canister;
pub mod merge;
pub mod progress;
pub mod protocol;
pub mod remote;
pub mod scheduler;
pub mod store;
pub mod worker_pool;

pub use cache::{CacheManager, GetOptions, PutOptions, PutReport};
pub use codec::{Blob, Payload, ValueType};
pub use config::CacheConfig;
pub use error::{CacheError, CacheResult, RemoteError, RemoteErrorKind, TransportError};
pub use merge::WriteMode;
pub use remote::Canister;
pub use store::CacheKind;
