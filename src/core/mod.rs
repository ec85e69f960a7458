//! Core of the lab aggregation engine.
//!
//! This module contains:
//! - Item resolution from raw item ids to canonical lab names
//! - Per-subject window boundary calculation
//! - The streaming aggregator and its fixed-size running statistics
//! - Feature materialization into one row per subject

pub mod abnormality;
pub mod aggregator;
pub mod boundaries;
pub mod materialize;
pub mod resolver;
pub mod stats;
pub mod types;

// Re-export commonly used types
pub use abnormality::{AbnormalityPanel, AbnormalityRule, Comparison, FlagRule};
pub use aggregator::{
    AggregationScope, AggregationState, BucketKey, ChunkOutcome, CounterKey, StreamingAggregator,
    PRIOR_WINDOW,
};
pub use boundaries::{BoundaryTable, SubjectBoundaries, WindowSet};
pub use materialize::{
    materialize, sanitize_name, FeatureRow, FeatureTable, FeatureValue, SUBJECT_ID_COLUMN,
};
pub use resolver::{ItemMap, ItemResolver, LabId, LabItem};
pub use stats::{LabBucket, RunningStats};
pub use types::{
    parse_timestamp, parse_value, AdmissionId, ItemId, LabEventRow, LabObservation, RowRejection,
    SubjectId,
};
