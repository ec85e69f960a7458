//! CSV lab event reader (MIMIC-IV `labevents.csv` layout).
//!
//! Columns are located by header name and any extra columns are ignored.
//! Records are read as raw bytes so a badly encoded row only costs that row.

use super::{Chunk, ChunkSource, SourceError, SourceRow};
use crate::core::LabEventRow;
use csv::{ByteRecord, Reader, ReaderBuilder};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::debug;

/// Column positions of the fields the engine needs.
#[derive(Debug, Clone, Copy)]
struct Columns {
    subject_id: usize,
    hadm_id: Option<usize>,
    itemid: usize,
    charttime: usize,
    valuenum: usize,
}

impl Columns {
    fn locate(headers: &ByteRecord) -> Result<Self, SourceError> {
        let find = |name: &str| headers.iter().position(|h| trim_bytes(h) == name.as_bytes());
        let require = |name: &'static str| find(name).ok_or(SourceError::MissingColumn(name));
        Ok(Self {
            subject_id: require("subject_id")?,
            hadm_id: find("hadm_id"),
            itemid: require("itemid")?,
            charttime: require("charttime")?,
            valuenum: require("valuenum")?,
        })
    }
}

fn trim_bytes(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// Reads lab events from CSV in fixed-size chunks.
pub struct CsvLabEvents<R: Read = File> {
    reader: Reader<R>,
    columns: Columns,
    chunk_size: usize,
    record: ByteRecord,
    records_read: u64,
    exhausted: bool,
}

impl CsvLabEvents<File> {
    /// Open a lab event file. Failing to open or to read the header is fatal.
    pub fn open(path: impl AsRef<Path>, chunk_size: usize) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| SourceError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), chunk_size, "opened lab event source");
        Self::from_reader(file, chunk_size)
    }
}

impl<R: Read> CsvLabEvents<R> {
    pub fn from_reader(input: R, chunk_size: usize) -> Result<Self, SourceError> {
        if chunk_size == 0 {
            return Err(SourceError::ZeroChunkSize);
        }
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(input);
        let headers = reader
            .byte_headers()
            .map_err(|e| SourceError::Read {
                record: 0,
                message: e.to_string(),
            })?
            .clone();
        let columns = Columns::locate(&headers)?;
        Ok(Self {
            reader,
            columns,
            chunk_size,
            record: ByteRecord::new(),
            records_read: 0,
            exhausted: false,
        })
    }

    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    fn decode(&self) -> SourceRow {
        let field = |idx: usize| -> Option<String> {
            let bytes = self.record.get(idx).unwrap_or(b"");
            std::str::from_utf8(bytes).ok().map(|s| s.trim().to_string())
        };
        let hadm_id = match self.columns.hadm_id {
            Some(idx) => field(idx),
            None => Some(String::new()),
        };
        match (
            field(self.columns.subject_id),
            hadm_id,
            field(self.columns.itemid),
            field(self.columns.charttime),
            field(self.columns.valuenum),
        ) {
            (Some(subject_id), Some(hadm_id), Some(itemid), Some(charttime), Some(valuenum)) => {
                SourceRow::Event(LabEventRow {
                    subject_id,
                    hadm_id,
                    itemid,
                    charttime,
                    valuenum,
                })
            }
            _ => SourceRow::Undecodable,
        }
    }
}

impl<R: Read> ChunkSource for CsvLabEvents<R> {
    fn next_chunk(&mut self) -> Result<Option<Chunk>, SourceError> {
        if self.exhausted {
            return Ok(None);
        }
        let mut chunk = Vec::with_capacity(self.chunk_size);
        while chunk.len() < self.chunk_size {
            match self.reader.read_byte_record(&mut self.record) {
                Ok(true) => {
                    self.records_read += 1;
                    chunk.push(self.decode());
                }
                Ok(false) => {
                    self.exhausted = true;
                    break;
                }
                Err(e) if e.is_io_error() => {
                    return Err(SourceError::Read {
                        record: self.records_read + 1,
                        message: e.to_string(),
                    });
                }
                Err(_) => {
                    self.records_read += 1;
                    chunk.push(SourceRow::Undecodable);
                }
            }
        }
        if chunk.is_empty() {
            Ok(None)
        } else {
            Ok(Some(chunk))
        }
    }
}
