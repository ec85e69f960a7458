//! End-to-end orchestration: cohort, lab features, prior admission lab
//! features, history features, merge.
//!
//! Every table is built in memory and written only once complete; a fatal
//! error or cancellation before that leaves no output for the table.

use crate::cohort::Cohort;
use crate::config::Config;
use crate::core::{
    materialize, AbnormalityPanel, BoundaryTable, FeatureTable, ItemResolver, LabItem,
    StreamingAggregator,
};
use crate::error::{FeatureError, Result};
use crate::history::{diagnosis_features, medication_features, procedure_features};
use crate::merge::merge_tables;
use crate::output::write_table;
use crate::run_log::SharedRunLog;
use crate::source::tables::{read_records, RowPolicy};
use crate::source::{ChunkSource, CsvLabEvents, PrefetchSource};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Base names of the tables written by [`Pipeline::run`].
pub const LAB_TABLE: &str = "labs";
pub const PRIOR_LAB_TABLE: &str = "prior_labs";
pub const DIAGNOSES_TABLE: &str = "diagnoses";
pub const PROCEDURES_TABLE: &str = "procedures";
pub const MEDICATIONS_TABLE: &str = "medications";
pub const MERGED_TABLE: &str = "hosp_features";

/// Which history tables to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryKind {
    Diagnoses,
    Procedures,
    Medications,
}

impl HistoryKind {
    pub const ALL: [HistoryKind; 3] = [
        HistoryKind::Diagnoses,
        HistoryKind::Procedures,
        HistoryKind::Medications,
    ];

    pub fn table_name(self) -> &'static str {
        match self {
            HistoryKind::Diagnoses => DIAGNOSES_TABLE,
            HistoryKind::Procedures => PROCEDURES_TABLE,
            HistoryKind::Medications => MEDICATIONS_TABLE,
        }
    }
}

/// Files produced by a full run.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub files: Vec<PathBuf>,
    pub merged_rows: usize,
    pub merged_columns: usize,
}

/// Runs the feature pipeline with one configuration.
pub struct Pipeline {
    config: Config,
    log: SharedRunLog,
    cancel: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(config: Config, log: SharedRunLog, cancel: Arc<AtomicBool>) -> Self {
        Self {
            config,
            log,
            cancel,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.load(Ordering::SeqCst) {
            Err(FeatureError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn load_cohort(&self) -> Result<Cohort> {
        Cohort::load(&self.config.paths.cohort)
    }

    /// Reference items and a chunked reader over the configured event file,
    /// prefetching on a background thread when `prefetch_depth > 0`.
    fn lab_inputs(&self) -> Result<(Vec<LabItem>, Box<dyn ChunkSource>)> {
        let paths = &self.config.paths;
        let items: Vec<LabItem> =
            read_records(&paths.lab_items, "lab items", &["itemid", "label"], RowPolicy::Skip)?;
        let events = CsvLabEvents::open(&paths.lab_events, self.config.labs.chunk_size)?;

        let depth = self.config.labs.prefetch_depth;
        let source: Box<dyn ChunkSource> = if depth > 0 {
            Box::new(PrefetchSource::spawn(events, depth))
        } else {
            Box::new(events)
        };
        Ok((items, source))
    }

    /// Lab features from the configured item table and event file.
    pub fn lab_features(&self, cohort: &Cohort) -> Result<FeatureTable> {
        let (items, source) = self.lab_inputs()?;
        self.lab_features_from_source(cohort, items, source)
    }

    /// Lab features from an arbitrary chunk source.
    pub fn lab_features_from_source<S: ChunkSource>(
        &self,
        cohort: &Cohort,
        items: Vec<LabItem>,
        source: S,
    ) -> Result<FeatureTable> {
        self.config.validate()?;
        let labs = &self.config.labs;

        let items = ItemResolver::new(&labs.keywords).resolve(items);
        let windows = self.config.window_set();
        let boundaries = BoundaryTable::compute(cohort.reference_times(), &windows);
        info!(
            subjects = cohort.len(),
            with_reference = boundaries.subject_count(),
            without_reference = boundaries.rejected().len(),
            windows = ?windows.days(),
            "computed window boundaries"
        );
        let panel = AbnormalityPanel::new(&labs.rules, &labs.flags, &items);

        let aggregator = StreamingAggregator::new(items, boundaries, panel, self.log.clone());
        self.aggregate(cohort, aggregator, source)
    }

    /// Lab features over each subject's prior admissions, from the
    /// configured item table and event file.
    pub fn prior_lab_features(&self, cohort: &Cohort) -> Result<FeatureTable> {
        let (items, source) = self.lab_inputs()?;
        self.prior_lab_features_from_source(cohort, items, source)
    }

    /// Prior admission lab features from an arbitrary chunk source.
    pub fn prior_lab_features_from_source<S: ChunkSource>(
        &self,
        cohort: &Cohort,
        items: Vec<LabItem>,
        source: S,
    ) -> Result<FeatureTable> {
        self.config.validate()?;
        let labs = &self.config.labs;

        let items = ItemResolver::new(&labs.keywords).resolve(items);
        let prior = cohort.prior_admission_index();
        info!(
            subjects = cohort.len(),
            prior_admissions = prior.len(),
            "indexed prior admissions"
        );
        let panel = AbnormalityPanel::new(&labs.rules, &labs.flags, &items);

        let aggregator = StreamingAggregator::prior_admissions(items, panel, prior, self.log.clone());
        self.aggregate(cohort, aggregator, source)
    }

    fn aggregate<S: ChunkSource>(
        &self,
        cohort: &Cohort,
        aggregator: StreamingAggregator,
        mut source: S,
    ) -> Result<FeatureTable> {
        let mut aggregator = aggregator.with_tracked_subjects(cohort.subjects().iter().copied());
        let chunks = aggregator.consume(&mut source, &self.cancel)?;
        info!(chunks, "event source exhausted");

        Ok(materialize(aggregator.finish(), cohort.subjects()))
    }

    /// One history table from its configured input file.
    pub fn history_features(&self, cohort: &Cohort, kind: HistoryKind) -> Result<FeatureTable> {
        self.check_cancelled()?;
        let paths = &self.config.paths;
        let history = &self.config.history;
        match kind {
            HistoryKind::Diagnoses => diagnosis_features(cohort, &paths.diagnoses, &history.conditions),
            HistoryKind::Procedures => {
                procedure_features(cohort, &paths.procedures, &history.procedure_groups)
            }
            HistoryKind::Medications => {
                medication_features(cohort, &paths.prescriptions, &history.drug_classes)
            }
        }
    }

    /// Path of a named output table under the output directory.
    pub fn output_path(&self, name: &str) -> PathBuf {
        self.config
            .paths
            .output_dir
            .join(format!("{name}.{}", self.config.output.format.extension()))
    }

    /// Write a table under the output directory.
    pub fn write(&self, name: &str, table: &FeatureTable) -> Result<PathBuf> {
        self.check_cancelled()?;
        let path = self.output_path(name);
        let output = &self.config.output;
        let rows = write_table(table, &path, output.format, &output.missing_marker)?;
        self.log.record_rows_written(rows);
        Ok(path)
    }

    /// Build every table, then write each one and the merged table.
    pub fn run(&self) -> Result<RunOutput> {
        self.config.validate()?;
        let cohort = self.load_cohort()?;

        let mut names = vec![LAB_TABLE, PRIOR_LAB_TABLE];
        let mut tables = vec![self.lab_features(&cohort)?, self.prior_lab_features(&cohort)?];
        for kind in HistoryKind::ALL {
            names.push(kind.table_name());
            tables.push(self.history_features(&cohort, kind)?);
        }
        let merged = merge_tables(&tables);

        let mut output = RunOutput {
            merged_rows: merged.len(),
            merged_columns: merged.columns.len(),
            ..RunOutput::default()
        };
        for (name, table) in names.iter().zip(&tables) {
            output.files.push(self.write(name, table)?);
        }
        output.files.push(self.write(MERGED_TABLE, &merged)?);
        Ok(output)
    }
}
