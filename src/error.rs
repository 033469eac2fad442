//! Error taxonomy for the cache and transfer layers
//!
//! Every error renders as `kind(message)` so the UI can surface it verbatim.
//! Protocol errors come from the remote union, transport errors mean the
//! request never reached (or never came back from) the remote, and type
//! mismatches are local merge failures that never leave the process.

use std::fmt;
use thiserror::Error;

/// Remote-declared error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteErrorKind {
    AssetOutOfBoundAccess,
    AssetCommit,
    UserAlreadyExists,
    AssetInitialize,
    Anonymous,
    AssetNotFound,
    UserDoesNotExist,
    AssetAlreadyExists,
    Fetch,
}

impl RemoteErrorKind {
    /// Name of the variant as the remote declares it
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AssetOutOfBoundAccess => "assetOutOfBoundAccess",
            Self::AssetCommit => "assetCommit",
            Self::UserAlreadyExists => "userAlreadyExists",
            Self::AssetInitialize => "assetInitialize",
            Self::Anonymous => "anonymous",
            Self::AssetNotFound => "assetNotFound",
            Self::UserDoesNotExist => "userDoesnotExist",
            Self::AssetAlreadyExists => "assetAlreadyExists",
            Self::Fetch => "fetch",
        }
    }
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error returned by the remote service
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}({message})")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(uid: &str) -> Self {
        Self::new(RemoteErrorKind::AssetNotFound, format!("no asset with uid \"{uid}\""))
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Failures that happen before or around a remote call, never inside it
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("cancelled(task was cancelled before it started)")]
    Cancelled,

    #[error("preprocess({0})")]
    Preprocess(String),

    #[error("workerUnavailable(worker {0} is not running)")]
    WorkerUnavailable(usize),

    #[error("timeout({method} exceeded {ms} ms)")]
    Timeout { method: &'static str, ms: u64 },
}

/// Chunk codec failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("parse({0})")]
    Parse(String),
}

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        CodecError::Parse(e.to_string())
    }
}

/// Umbrella error for everything the cache layer can report
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("typeMismatch(stored type found to be \"{stored}\", but given type found to be \"{given}\")")]
    TypeMismatch {
        stored: &'static str,
        given: &'static str,
    },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("config({0})")]
    Config(String),
}

impl CacheError {
    /// Short kind tag, the part before the parenthesis
    pub fn kind(&self) -> &'static str {
        match self {
            CacheError::Remote(e) => e.kind.as_str(),
            CacheError::Transport(TransportError::Cancelled) => "cancelled",
            CacheError::Transport(TransportError::Preprocess(_)) => "preprocess",
            CacheError::Transport(TransportError::WorkerUnavailable(_)) => "workerUnavailable",
            CacheError::Transport(TransportError::Timeout { .. }) => "timeout",
            CacheError::TypeMismatch { .. } => "typeMismatch",
            CacheError::Codec(_) => "parse",
            CacheError::Config(_) => "config",
        }
    }

    /// True when the remote explicitly rejected the request
    pub fn is_remote(&self) -> bool {
        matches!(self, CacheError::Remote(_))
    }

    pub fn remote_kind(&self) -> Option<RemoteErrorKind> {
        match self {
            CacheError::Remote(e) => Some(e.kind),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Codec(e.into())
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
