//! Chunked event sources for the lab aggregation engine.
//!
//! A source hands out bounded chunks of raw lab rows in whatever order the
//! underlying table stores them. A source-level error is fatal; a row that
//! cannot be decoded is handed on as an undecodable row instead.

pub mod csv_events;
pub mod memory;
pub mod prefetch;
pub mod tables;

use crate::core::LabEventRow;
use std::path::PathBuf;
use thiserror::Error;

pub use csv_events::CsvLabEvents;
pub use memory::MemorySource;
pub use prefetch::PrefetchSource;

/// One unit of work pulled from a source.
pub type Chunk = Vec<SourceRow>;

/// A row as delivered by a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRow {
    Event(LabEventRow),
    /// The record was read but could not be decoded into fields
    Undecodable,
}

impl From<LabEventRow> for SourceRow {
    fn from(row: LabEventRow) -> Self {
        SourceRow::Event(row)
    }
}

/// Fatal errors raised while reading an event source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("read failed at record {record}: {message}")]
    Read { record: u64, message: String },
    #[error("event source is missing required column `{0}`")]
    MissingColumn(&'static str),
    #[error("chunk size must be at least 1")]
    ZeroChunkSize,
    #[error("reader thread stopped unexpectedly")]
    Disconnected,
}

/// A sequential source of lab event chunks.
pub trait ChunkSource {
    /// Return the next chunk, or `None` once the source is exhausted.
    fn next_chunk(&mut self) -> Result<Option<Chunk>, SourceError>;
}

impl<S: ChunkSource + ?Sized> ChunkSource for Box<S> {
    fn next_chunk(&mut self) -> Result<Option<Chunk>, SourceError> {
        (**self).next_chunk()
    }
}
