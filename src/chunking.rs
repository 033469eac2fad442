//! Chunk math and per-transfer bookkeeping
//!
//! Shared by upload and download paths so that slicing and reassembly
//! agree on boundaries.

use std::ops::Range;

use crate::error::{CacheError, TransportError};

/// Number of chunks for a payload of `len` bytes (ceiling division)
pub fn total_chunks(len: usize, chunk_size: usize) -> u64 {
    let chunk_size = chunk_size.max(1);
    len.div_ceil(chunk_size) as u64
}

/// Byte range covered by chunk `index`, or `None` past the end
pub fn chunk_range(index: u64, len: usize, chunk_size: usize) -> Option<Range<usize>> {
    let chunk_size = chunk_size.max(1);
    let start = (index as usize).checked_mul(chunk_size)?;
    if start >= len {
        return None;
    }
    Some(start..len.min(start + chunk_size))
}

/// Non-overlapping contiguous slices in index order
pub fn split(bytes: &[u8], chunk_size: usize) -> impl Iterator<Item = (u64, &[u8])> {
    bytes
        .chunks(chunk_size.max(1))
        .enumerate()
        .map(|(i, c)| (i as u64, c))
}

/// Outcome of a single chunk within a session
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkState {
    Pending,
    Ok,
    Error(CacheError),
}

/// Ephemeral state of one chunked upload or download
#[derive(Debug)]
pub struct TransferSession {
    pub uid: String,
    pub total_chunks: u64,
    pub dtype: String,
    states: Vec<ChunkState>,
    parts: Vec<Option<Vec<u8>>>,
}

impl TransferSession {
    pub fn new(uid: impl Into<String>, total_chunks: u64, dtype: impl Into<String>) -> Self {
        let n = total_chunks as usize;
        Self {
            uid: uid.into(),
            total_chunks,
            dtype: dtype.into(),
            states: vec![ChunkState::Pending; n],
            parts: Vec::new(),
        }
    }

    /// Session that also collects downloaded bytes by chunk id
    pub fn for_download(uid: impl Into<String>, total_chunks: u64, dtype: impl Into<String>) -> Self {
        let mut s = Self::new(uid, total_chunks, dtype);
        s.parts = vec![None; total_chunks as usize];
        s
    }

    fn slot(&self, index: u64) -> Result<usize, CacheError> {
        let i = index as usize;
        if i >= self.states.len() {
            return Err(TransportError::Preprocess(format!(
                "chunk {index} out of range for \"{}\" ({} chunks)",
                self.uid, self.total_chunks
            ))
            .into());
        }
        Ok(i)
    }

    pub fn mark_ok(&mut self, index: u64) -> Result<(), CacheError> {
        let i = self.slot(index)?;
        self.states[i] = ChunkState::Ok;
        Ok(())
    }

    /// Store a downloaded chunk at its own index, regardless of arrival order
    pub fn store_part(&mut self, index: u64, bytes: Vec<u8>) -> Result<(), CacheError> {
        let i = self.slot(index)?;
        if self.parts.len() != self.states.len() {
            return Err(TransportError::Preprocess("session was not opened for download".into()).into());
        }
        self.parts[i] = Some(bytes);
        self.states[i] = ChunkState::Ok;
        Ok(())
    }

    pub fn mark_error(&mut self, index: u64, err: CacheError) {
        if let Some(s) = self.states.get_mut(index as usize) {
            *s = ChunkState::Error(err);
        }
    }

    pub fn completed(&self) -> usize {
        self.states.iter().filter(|s| matches!(s, ChunkState::Ok)).count()
    }

    pub fn is_complete(&self) -> bool {
        self.states.iter().all(|s| matches!(s, ChunkState::Ok))
    }

    /// Lowest-index chunk error, if any
    pub fn first_error(&self) -> Option<&CacheError> {
        self.states.iter().find_map(|s| match s {
            ChunkState::Error(e) => Some(e),
            _ => None,
        })
    }

    pub fn states(&self) -> &[ChunkState] {
        &self.states
    }

    /// Concatenate downloaded parts in chunk-id order
    pub fn reassemble(self) -> Result<Vec<u8>, CacheError> {
        if let Some(e) = self.first_error() {
            return Err(e.clone());
        }
        let mut out = Vec::with_capacity(self.parts.iter().flatten().map(Vec::len).sum());
        for (i, part) in self.parts.into_iter().enumerate() {
            match part {
                Some(bytes) => out.extend_from_slice(&bytes),
                None => {
                    return Err(TransportError::Preprocess(format!(
                        "chunk {i} of \"{}\" never arrived",
                        self.uid
                    ))
                    .into())
                }
            }
        }
        Ok(out)
    }
}
