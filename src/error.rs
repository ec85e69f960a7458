//! Error types shared across the feature pipeline.
//!
//! Only fatal conditions live here. Row-level problems (bad timestamps,
//! non-numeric values, unknown items) are classified as
//! [`RowRejection`](crate::core::RowRejection) and never surface as errors.

use crate::config::ConfigError;
use crate::source::SourceError;
use std::path::PathBuf;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = FeatureError> = std::result::Result<T, E>;

/// A fatal error that aborts the whole run.
#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{table} table is missing required column `{column}`")]
    MissingColumn { table: &'static str, column: &'static str },
    #[error("malformed {table} row {row}: {reason}")]
    MalformedRow {
        table: &'static str,
        row: u64,
        reason: String,
    },
    #[error("event source failed: {0}")]
    Source(#[from] SourceError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("run cancelled before the event source was exhausted")]
    Cancelled,
}

impl FeatureError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FeatureError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn csv(path: impl Into<PathBuf>, source: csv::Error) -> Self {
        FeatureError::Csv {
            path: path.into(),
            source,
        }
    }
}
