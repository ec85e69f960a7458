//! In-memory chunk source, used for tests and small replays.

use super::{Chunk, ChunkSource, SourceError, SourceRow};
use crate::core::LabEventRow;
use std::collections::VecDeque;

/// Serves pre-built chunks in order.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    chunks: VecDeque<Chunk>,
}

impl MemorySource {
    /// Split `rows` into chunks of `chunk_size` rows.
    pub fn new(rows: Vec<LabEventRow>, chunk_size: usize) -> Result<Self, SourceError> {
        if chunk_size == 0 {
            return Err(SourceError::ZeroChunkSize);
        }
        let rows: Vec<SourceRow> = rows.into_iter().map(SourceRow::from).collect();
        let chunks = rows.chunks(chunk_size).map(|c| c.to_vec()).collect();
        Ok(Self { chunks })
    }

    /// Serve the given chunks exactly as provided.
    pub fn from_chunks(chunks: Vec<Chunk>) -> Self {
        Self {
            chunks: chunks.into(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.chunks.len()
    }
}

impl ChunkSource for MemorySource {
    fn next_chunk(&mut self) -> Result<Option<Chunk>, SourceError> {
        Ok(self.chunks.pop_front())
    }
}
