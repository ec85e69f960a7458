//! Run statistics for a feature extraction run.
//!
//! Counters are atomic so the prefetching reader thread and the folding thread
//! can record into the same log. Nothing about individual subjects is kept.

use crate::core::RowRejection;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

const REJECTION_KINDS: usize = RowRejection::ALL.len();

/// Statistics for the current run.
#[derive(Debug)]
pub struct RunLog {
    run_id: Uuid,
    /// Chunks pulled from the event source
    chunks_read: AtomicU64,
    /// Rows pulled from the event source
    rows_read: AtomicU64,
    /// Rows folded into at least one window
    rows_accepted: AtomicU64,
    /// Bucket updates, one per (row, window) pair
    window_updates: AtomicU64,
    /// Excluded rows, indexed by `RowRejection::index`
    rejections: [AtomicU64; REJECTION_KINDS],
    /// Cohort subjects without a usable reference time
    subjects_without_reference: AtomicU64,
    /// Feature rows written to disk
    rows_written: AtomicU64,
    started_at: DateTime<Utc>,
    persist_path: Option<PathBuf>,
}

impl RunLog {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            chunks_read: AtomicU64::new(0),
            rows_read: AtomicU64::new(0),
            rows_accepted: AtomicU64::new(0),
            window_updates: AtomicU64::new(0),
            rejections: std::array::from_fn(|_| AtomicU64::new(0)),
            subjects_without_reference: AtomicU64::new(0),
            rows_written: AtomicU64::new(0),
            started_at: Utc::now(),
            persist_path: None,
        }
    }

    /// Create a run log that [`RunLog::save`] writes to `path`.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut log = Self::new();
        log.persist_path = Some(path);
        log
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn record_chunk(&self, rows: u64) {
        self.chunks_read.fetch_add(1, Ordering::Relaxed);
        self.rows_read.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn record_accepted(&self, windows: u64) {
        self.rows_accepted.fetch_add(1, Ordering::Relaxed);
        self.window_updates.fetch_add(windows, Ordering::Relaxed);
    }

    pub fn record_rejection(&self, reason: RowRejection) {
        self.rejections[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_subjects_without_reference(&self, count: u64) {
        self.subjects_without_reference
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_rows_written(&self, count: u64) {
        self.rows_written.fetch_add(count, Ordering::Relaxed);
    }

    pub fn rejected(&self, reason: RowRejection) -> u64 {
        self.rejections[reason.index()].load(Ordering::Relaxed)
    }

    /// Get the current statistics.
    pub fn stats(&self) -> RunStats {
        let rejections = RowRejection::ALL
            .iter()
            .map(|&r| (r.as_str().to_string(), self.rejected(r)))
            .filter(|(_, n)| *n > 0)
            .collect();
        RunStats {
            run_id: self.run_id,
            chunks_read: self.chunks_read.load(Ordering::Relaxed),
            rows_read: self.rows_read.load(Ordering::Relaxed),
            rows_accepted: self.rows_accepted.load(Ordering::Relaxed),
            window_updates: self.window_updates.load(Ordering::Relaxed),
            rejections,
            subjects_without_reference: self.subjects_without_reference.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            started_at: self.started_at,
            duration_secs: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        self.stats().summary()
    }

    /// Save stats to disk.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let json = serde_json::to_string_pretty(&self.stats()).map_err(std::io::Error::other)?;
            std::fs::write(path, json)?;
        }
        Ok(())
    }

    /// Load the stats persisted by a previous run.
    pub fn load_last(path: &std::path::Path) -> Result<RunStats, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(std::io::Error::other)
    }
}

impl Default for RunLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of run statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStats {
    pub run_id: Uuid,
    pub chunks_read: u64,
    pub rows_read: u64,
    pub rows_accepted: u64,
    pub window_updates: u64,
    pub rejections: BTreeMap<String, u64>,
    pub subjects_without_reference: u64,
    pub rows_written: u64,
    pub started_at: DateTime<Utc>,
    pub duration_secs: u64,
}

impl RunStats {
    pub fn rows_rejected(&self) -> u64 {
        self.rejections.values().sum()
    }

    pub fn summary(&self) -> String {
        let mut out = format!(
            "Run {}:\n\
             - Chunks read: {}\n\
             - Rows read: {}\n\
             - Rows accepted: {}\n\
             - Window updates: {}\n\
             - Rows excluded: {}\n",
            self.run_id,
            self.chunks_read,
            self.rows_read,
            self.rows_accepted,
            self.window_updates,
            self.rows_rejected(),
        );
        for (reason, count) in &self.rejections {
            out.push_str(&format!("    {reason}: {count}\n"));
        }
        out.push_str(&format!(
            "- Subjects without reference time: {}\n\
             - Feature rows written: {}\n\
             - Duration: {} seconds",
            self.subjects_without_reference, self.rows_written, self.duration_secs
        ));
        out
    }
}

/// Thread-safe shared run log.
pub type SharedRunLog = Arc<RunLog>;

/// Create a new shared run log.
pub fn create_shared_log() -> SharedRunLog {
    Arc::new(RunLog::new())
}

/// Create a new shared run log with persistence.
pub fn create_shared_log_with_persistence(path: PathBuf) -> SharedRunLog {
    Arc::new(RunLog::with_persistence(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_log_counting() {
        let log = RunLog::new();

        log.record_chunk(10);
        log.record_chunk(5);
        log.record_accepted(3);
        log.record_rejection(RowRejection::BadValue);
        log.record_rejection(RowRejection::BadValue);
        log.record_rejection(RowRejection::UntrackedSubject);

        let stats = log.stats();
        assert_eq!(stats.chunks_read, 2);
        assert_eq!(stats.rows_read, 15);
        assert_eq!(stats.rows_accepted, 1);
        assert_eq!(stats.window_updates, 3);
        assert_eq!(stats.rejections["bad_value"], 2);
        assert_eq!(stats.rows_rejected(), 3);
        assert!(!stats.rejections.contains_key("bad_timestamp"));
    }

    #[test]
    fn test_summary_format() {
        let log = RunLog::new();
        log.record_rejection(RowRejection::AfterReference);
        let summary = log.summary();

        assert!(summary.contains("Rows read"));
        assert!(summary.contains("after_reference: 1"));
        assert!(summary.contains("Subjects without reference time"));
    }

    #[test]
    fn test_save_and_load_last() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("last_run.json");
        let log = RunLog::with_persistence(path.clone());
        log.record_chunk(4);
        log.record_rows_written(2);
        log.save().unwrap();

        let loaded = RunLog::load_last(&path).unwrap();
        assert_eq!(loaded.run_id, log.run_id());
        assert_eq!(loaded.rows_read, 4);
        assert_eq!(loaded.rows_written, 2);
    }
}
