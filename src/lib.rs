//! Hosp Features - longitudinal feature extraction from hospital event logs.
//!
//! This library builds one feature row per patient from diagnoses, procedures,
//! prescriptions and lab measurements, using only what was recorded before
//! the patient's final admission. Lab measurements are summarized twice: over
//! time windows ending at the final admission, and over the patient's prior
//! admissions.
//!
//! # Guarantees
//!
//! - **Bounded memory**: lab events are streamed in fixed-size chunks and
//!   folded into fixed-size running statistics; raw values are never kept
//! - **Order independence**: results do not depend on chunk size or on the
//!   order of events in the source
//! - **Explicit missing values**: an empty window is missing, never zero
//! - **All or nothing**: a fatal error or cancellation writes no output
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Hosp Features                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌──────────────┐         │
//! │  │   Item      │   │   Window    │   │ Chunk Source │         │
//! │  │  Resolver   │   │ Boundaries  │   │ (CSV, thread)│         │
//! │  └──────┬──────┘   └──────┬──────┘   └──────┬───────┘         │
//! │         └─────────────────┼─────────────────┘                 │
//! │                           ▼                                   │
//! │                   ┌───────────────┐      ┌─────────────┐      │
//! │                   │   Streaming   │─────▶│   Run Log   │      │
//! │                   │  Aggregator   │      └─────────────┘      │
//! │                   └───────┬───────┘                           │
//! │                           ▼                                   │
//! │  ┌─────────────┐   ┌───────────────┐                          │
//! │  │   History   │   │    Feature    │                          │
//! │  │  Features   │   │ Materializer  │                          │
//! │  └──────┬──────┘   └───────┬───────┘                          │
//! │         └────────┬─────────┘                                  │
//! │                  ▼                                            │
//! │           ┌─────────────┐                                     │
//! │           │    Merge    │──▶ CSV / JSONL                      │
//! │           └─────────────┘                                     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use hosp_features::{create_shared_log, Config, Pipeline};
//! use std::sync::atomic::AtomicBool;
//! use std::sync::Arc;
//!
//! let config = Config::load().expect("Failed to load config");
//! let pipeline = Pipeline::new(config, create_shared_log(), Arc::new(AtomicBool::new(false)));
//!
//! let output = pipeline.run().expect("Feature run failed");
//! println!("{} rows written", output.merged_rows);
//! ```

pub mod cohort;
pub mod config;
pub mod core;
pub mod error;
pub mod history;
pub mod merge;
pub mod output;
pub mod pipeline;
pub mod run_log;
pub mod source;

// Re-export key types at crate root for convenience
pub use cohort::{Cohort, CohortRecord};
pub use config::{Config, ConfigError};
pub use crate::core::{
    materialize, AggregationScope, AggregationState, FeatureTable, FeatureValue, ItemResolver,
    LabObservation, RowRejection, StreamingAggregator,
};
pub use error::{FeatureError, Result};
pub use merge::merge_tables;
pub use output::{read_table, write_table, OutputFormat};
pub use pipeline::{HistoryKind, Pipeline, RunOutput};
pub use run_log::{create_shared_log, create_shared_log_with_persistence, RunLog, RunStats, SharedRunLog};
pub use source::{ChunkSource, CsvLabEvents, MemorySource, PrefetchSource, SourceError};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
