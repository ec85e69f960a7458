//! Feature materialization: aggregation state to one row per subject.
//!
//! Buckets are removed from the state as rows are built, so peak memory does
//! not double at the end of the run.

use crate::core::aggregator::{AggregationState, BucketKey, PRIOR_WINDOW};
use crate::core::boundaries::{WindowIdx, WindowSet};
use crate::core::resolver::LabId;
use crate::core::stats::LabBucket;
use crate::core::types::SubjectId;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

/// Name of the join key column shared by every feature table.
pub const SUBJECT_ID_COLUMN: &str = "subject_id";

/// One cell of a feature table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    /// No data to compute the feature from. Distinct from zero.
    Missing,
    Int(i64),
    Float(f64),
    Text(String),
}

impl FeatureValue {
    pub fn is_missing(&self) -> bool {
        matches!(self, FeatureValue::Missing)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FeatureValue::Int(v) => Some(*v as f64),
            FeatureValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Render the cell for delimited output, using `missing` for absent values.
    pub fn render(&self, missing: &str) -> String {
        match self {
            FeatureValue::Missing => missing.to_string(),
            other => other.to_string(),
        }
    }
}

impl From<Option<f64>> for FeatureValue {
    fn from(value: Option<f64>) -> Self {
        value.map_or(FeatureValue::Missing, FeatureValue::Float)
    }
}

impl From<u64> for FeatureValue {
    fn from(value: u64) -> Self {
        FeatureValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<bool> for FeatureValue {
    fn from(value: bool) -> Self {
        FeatureValue::Int(i64::from(value))
    }
}

impl fmt::Display for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureValue::Missing => Ok(()),
            FeatureValue::Int(v) => write!(f, "{v}"),
            FeatureValue::Float(v) => write!(f, "{v}"),
            FeatureValue::Text(v) => f.write_str(v),
        }
    }
}

/// One output row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub subject_id: SubjectId,
    /// One value per column of the owning table, in column order
    pub values: Vec<FeatureValue>,
}

/// A rectangular feature table keyed on subject id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureTable {
    /// Feature column names, excluding the subject id key
    pub columns: Vec<String>,
    pub rows: Vec<FeatureRow>,
}

impl FeatureTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Append a row. Panics in debug builds if the row is not rectangular.
    pub fn push(&mut self, subject_id: SubjectId, values: Vec<FeatureValue>) {
        debug_assert_eq!(values.len(), self.columns.len());
        self.rows.push(FeatureRow { subject_id, values });
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn row(&self, subject_id: SubjectId) -> Option<&FeatureRow> {
        self.rows.iter().find(|r| r.subject_id == subject_id)
    }

    /// Look up one cell by subject and column name.
    pub fn value(&self, subject_id: SubjectId, column: &str) -> Option<&FeatureValue> {
        let idx = self.column_index(column)?;
        self.row(subject_id).and_then(|r| r.values.get(idx))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Header including the key column.
    pub fn header(&self) -> Vec<&str> {
        std::iter::once(SUBJECT_ID_COLUMN)
            .chain(self.columns.iter().map(String::as_str))
            .collect()
    }
}

/// Turn a canonical lab name into a column-safe identifier.
///
/// `"urea nitrogen"` becomes `urea_nitrogen`; runs of other characters collapse
/// into one underscore.
pub fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending && !out.is_empty() {
                out.push('_');
            }
            pending = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending = true;
        }
    }
    out
}

const LAB_STATS: [&str; 5] = ["count", "avg", "min", "max", "std"];
const PRIOR_STATS: [&str; 4] = ["avg", "min", "max", "std"];

/// Windowed lab column names, in emission order. Names are sanitized here.
pub fn window_columns<S: AsRef<str>>(
    windows: &WindowSet,
    labs: &[S],
    rules: &[S],
    flags: &[S],
) -> Vec<String> {
    let labs: Vec<String> = labs.iter().map(|l| sanitize_name(l.as_ref())).collect();
    let mut columns = Vec::new();
    for w in windows.indices() {
        let p = windows.label(w);
        columns.push(format!("{p}_count_labevents"));
        columns.push(format!("{p}_count_unique_labs"));
        for lab in &labs {
            for stat in LAB_STATS {
                columns.push(format!("{p}_{lab}_{stat}"));
            }
            columns.push(format!("{p}_last_{lab}"));
        }
        for rule in rules {
            columns.push(format!("{p}_count_{}", sanitize_name(rule.as_ref())));
        }
        for flag in flags {
            columns.push(format!("{p}_flag_{}", sanitize_name(flag.as_ref())));
        }
    }
    columns
}

/// Prior-admission lab column names, in emission order.
pub fn prior_columns<S: AsRef<str>>(labs: &[S], rules: &[S], flags: &[S]) -> Vec<String> {
    let labs: Vec<String> = labs.iter().map(|l| sanitize_name(l.as_ref())).collect();
    let mut columns = vec![
        "count_prior_labevents".to_string(),
        "count_unique_labs_tested_prior".to_string(),
    ];
    for lab in &labs {
        for stat in PRIOR_STATS {
            columns.push(format!("{lab}_prior_{stat}"));
        }
    }
    for lab in &labs {
        columns.push(format!("last_{lab}_value_prior"));
    }
    for rule in rules {
        columns.push(format!("count_prior_{}", sanitize_name(rule.as_ref())));
    }
    for flag in flags {
        columns.push(format!("flag_{}_prior", sanitize_name(flag.as_ref())));
    }
    columns
}

/// Output column names for the given state, in emission order.
pub fn lab_columns(state: &AggregationState) -> Vec<String> {
    let rules: Vec<&str> = state.panel.rules().iter().map(|r| r.name.as_str()).collect();
    let flags: Vec<&str> = state.panel.flags().iter().map(|(f, _)| f.name.as_str()).collect();
    let labs: Vec<&str> = state.items.labs().iter().map(String::as_str).collect();
    if state.is_prior_scope() {
        prior_columns(&labs, &rules, &flags)
    } else {
        window_columns(state.boundaries.windows(), &labs, &rules, &flags)
    }
}

fn push_bucket(values: &mut Vec<FeatureValue>, bucket: Option<&LabBucket>) {
    match bucket {
        Some(b) => {
            values.push(b.stats.count().into());
            values.push(b.stats.mean().into());
            values.push(b.stats.min().into());
            values.push(b.stats.max().into());
            values.push(b.stats.std_dev().into());
            values.push(b.last_value().into());
        }
        None => {
            values.push(FeatureValue::Int(0));
            values.extend(std::iter::repeat(FeatureValue::Missing).take(5));
        }
    }
}

fn window_values(
    state: &mut AggregationState,
    subject: SubjectId,
    window: WindowIdx,
    labs: &[LabId],
    values: &mut Vec<FeatureValue>,
) {
    let buckets: Vec<Option<LabBucket>> = labs
        .iter()
        .map(|&lab| {
            state.buckets.remove(&BucketKey {
                subject,
                window,
                lab,
            })
        })
        .collect();

    let total: u64 = buckets.iter().flatten().map(|b| b.stats.count()).sum();
    let unique = buckets.iter().flatten().filter(|b| !b.stats.is_empty()).count() as u64;
    values.push(total.into());
    values.push(unique.into());
    for bucket in &buckets {
        push_bucket(values, bucket.as_ref());
    }

    push_counters(state, subject, window, values);
}

fn push_counters(
    state: &AggregationState,
    subject: SubjectId,
    window: WindowIdx,
    values: &mut Vec<FeatureValue>,
) {
    let counters: Vec<u64> = (0..state.panel.rules().len())
        .map(|r| state.counter(subject, window, r as u16))
        .collect();
    values.extend(counters.iter().map(|&c| FeatureValue::from(c)));
    for (flag, counter) in state.panel.flags() {
        let count = counter.map_or(0, |c| counters[c as usize]);
        values.push((count >= flag.min_count).into());
    }
}

fn prior_values(
    state: &mut AggregationState,
    subject: SubjectId,
    labs: &[LabId],
    values: &mut Vec<FeatureValue>,
) {
    let buckets: Vec<Option<LabBucket>> = labs
        .iter()
        .map(|&lab| {
            state.buckets.remove(&BucketKey {
                subject,
                window: PRIOR_WINDOW,
                lab,
            })
        })
        .collect();

    let total: u64 = buckets.iter().flatten().map(|b| b.stats.count()).sum();
    let unique = buckets.iter().flatten().filter(|b| !b.stats.is_empty()).count() as u64;
    values.push(total.into());
    values.push(unique.into());
    for bucket in &buckets {
        let stats = bucket.as_ref().map(|b| b.stats);
        values.push(stats.and_then(|s| s.mean()).into());
        values.push(stats.and_then(|s| s.min()).into());
        values.push(stats.and_then(|s| s.max()).into());
        values.push(stats.and_then(|s| s.std_dev()).into());
    }
    for bucket in &buckets {
        values.push(bucket.as_ref().and_then(LabBucket::last_value).into());
    }
    push_counters(state, subject, PRIOR_WINDOW, values);
}

/// Build the lab feature table, one row per subject in `subjects` order.
///
/// Subjects without a reference time get missing in every windowed column.
/// Under the prior-admission scope every subject gets counts, zero when it
/// had no prior lab events.
pub fn materialize(mut state: AggregationState, subjects: &[SubjectId]) -> FeatureTable {
    let columns = lab_columns(&state);
    let width = columns.len();
    let labs: Vec<LabId> = state.items.lab_ids().collect();

    if state.is_prior_scope() {
        let mut table = FeatureTable::new(columns);
        for &subject in subjects {
            let mut values = Vec::with_capacity(width);
            prior_values(&mut state, subject, &labs, &mut values);
            table.push(subject, values);
        }
        info!(
            rows = table.len(),
            columns = width,
            undrained_buckets = state.buckets.len(),
            "materialized prior admission lab features"
        );
        return table;
    }

    let windows: Vec<WindowIdx> = state.boundaries.windows().indices().collect();

    let mut table = FeatureTable::new(columns);
    let mut without_reference = 0usize;
    for &subject in subjects {
        let mut values = Vec::with_capacity(width);
        if state.boundaries.get(subject).is_some() {
            for &window in &windows {
                window_values(&mut state, subject, window, &labs, &mut values);
            }
        } else {
            without_reference += 1;
            values.resize(width, FeatureValue::Missing);
        }
        table.push(subject, values);
    }

    info!(
        rows = table.len(),
        columns = width,
        without_reference,
        undrained_buckets = state.buckets.len(),
        "materialized lab features"
    );
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::abnormality::{AbnormalityPanel, AbnormalityRule, Comparison, FlagRule};
    use crate::core::aggregator::StreamingAggregator;
    use crate::core::boundaries::{BoundaryTable, WindowSet};
    use crate::core::resolver::{ItemResolver, LabItem};
    use crate::core::types::LabObservation;
    use crate::run_log::create_shared_log;
    use chrono::{Duration, NaiveDate, NaiveDateTime};
    use statrs::statistics::Statistics;

    fn day(n: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2150, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            + Duration::days(n)
    }

    fn aggregator() -> StreamingAggregator {
        let items = ItemResolver::new(["creatinine", "urea nitrogen", "hemoglobin"]).resolve(vec![
            LabItem::new(50912, "Creatinine"),
            LabItem::new(51006, "Urea Nitrogen"),
            LabItem::new(51222, "Hemoglobin"),
        ]);
        let windows = WindowSet::new([30, 7]);
        let boundaries =
            BoundaryTable::compute([(1, Some(day(100))), (2, Some(day(100))), (3, None)], &windows);
        let rules = vec![AbnormalityRule::new(
            "chronic_anemia",
            "hemoglobin",
            Comparison::Below,
            10.0,
        )];
        let flags = vec![FlagRule::new("chronic_anemia", "chronic_anemia", 2)];
        let panel = AbnormalityPanel::new(&rules, &flags, &items);
        StreamingAggregator::new(items, boundaries, panel, create_shared_log())
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("urea nitrogen"), "urea_nitrogen");
        assert_eq!(sanitize_name("White Blood  Cells"), "white_blood_cells");
        assert_eq!(sanitize_name(" pH (arterial) "), "ph_arterial");
    }

    #[test]
    fn test_column_layout() {
        let state = aggregator().finish();
        let columns = lab_columns(&state);
        assert_eq!(columns[0], "window_30d_count_labevents");
        assert_eq!(columns[1], "window_30d_count_unique_labs");
        assert_eq!(columns[2], "window_30d_creatinine_count");
        assert_eq!(columns[7], "window_30d_last_creatinine");
        assert_eq!(columns[8], "window_30d_urea_nitrogen_count");
        assert!(columns.contains(&"window_7d_count_chronic_anemia".to_string()));
        assert_eq!(columns.last().unwrap(), "window_7d_flag_chronic_anemia");
        // 2 totals + 3 labs * 6 + 1 counter + 1 flag, per window
        assert_eq!(columns.len(), 2 * 22);
    }

    #[test]
    fn test_scenario_rows() {
        let mut agg = aggregator();
        agg.observe(&LabObservation::new(1, 50912, day(95), 1.0)).unwrap();
        agg.observe(&LabObservation::new(1, 50912, day(80), 0.5)).unwrap();
        let table = materialize(agg.finish(), &[1, 2, 3]);

        assert_eq!(table.len(), 3);
        assert_eq!(table.value(1, "window_30d_creatinine_count"), Some(&FeatureValue::Int(2)));
        assert_eq!(table.value(1, "window_30d_creatinine_avg"), Some(&FeatureValue::Float(0.75)));
        assert_eq!(table.value(1, "window_30d_last_creatinine"), Some(&FeatureValue::Float(1.0)));
        assert_eq!(table.value(1, "window_30d_count_labevents"), Some(&FeatureValue::Int(2)));
        assert_eq!(table.value(1, "window_30d_count_unique_labs"), Some(&FeatureValue::Int(1)));

        // no urea nitrogen at all: count 0, everything else missing
        assert_eq!(table.value(1, "window_30d_urea_nitrogen_count"), Some(&FeatureValue::Int(0)));
        for stat in ["avg", "min", "max", "std"] {
            let column = format!("window_30d_urea_nitrogen_{stat}");
            assert_eq!(table.value(1, &column), Some(&FeatureValue::Missing));
        }
        assert_eq!(table.value(1, "window_30d_last_urea_nitrogen"), Some(&FeatureValue::Missing));

        // subject 2 has a reference but no data
        assert_eq!(table.value(2, "window_7d_count_labevents"), Some(&FeatureValue::Int(0)));
        assert_eq!(table.value(2, "window_7d_count_chronic_anemia"), Some(&FeatureValue::Int(0)));
        assert_eq!(table.value(2, "window_7d_creatinine_avg"), Some(&FeatureValue::Missing));

        // subject 3 has no reference: every column missing
        let row = table.row(3).unwrap();
        assert!(row.values.iter().all(FeatureValue::is_missing));
    }

    #[test]
    fn test_flag_and_std() {
        let mut agg = aggregator();
        let values = [12.0, 9.0, 8.0, 11.0];
        for (i, &v) in values.iter().enumerate() {
            agg.observe(&LabObservation::new(2, 51222, day(96 + i as i64), v)).unwrap();
        }
        let table = materialize(agg.finish(), &[2]);

        assert_eq!(table.value(2, "window_7d_count_chronic_anemia"), Some(&FeatureValue::Int(2)));
        assert_eq!(table.value(2, "window_7d_flag_chronic_anemia"), Some(&FeatureValue::Int(1)));

        let expected = values.iter().population_std_dev();
        let std = table.value(2, "window_7d_hemoglobin_std").and_then(FeatureValue::as_f64).unwrap();
        assert!((std - expected).abs() < 1e-12);
    }

    #[test]
    fn test_rows_are_rectangular_and_in_cohort_order() {
        let table = materialize(aggregator().finish(), &[3, 1, 2]);
        let order: Vec<SubjectId> = table.rows.iter().map(|r| r.subject_id).collect();
        assert_eq!(order, vec![3, 1, 2]);
        assert!(table.rows.iter().all(|r| r.values.len() == table.columns.len()));
    }

    fn prior_aggregator() -> StreamingAggregator {
        let items = ItemResolver::new(["creatinine", "sodium", "hemoglobin"]).resolve(vec![
            LabItem::new(50912, "Creatinine"),
            LabItem::new(50983, "Sodium"),
            LabItem::new(51222, "Hemoglobin"),
        ]);
        let rules = vec![
            AbnormalityRule::new("chronic_anemia", "hemoglobin", Comparison::Below, 10.0),
            AbnormalityRule::new("severe_hyponatremia", "sodium", Comparison::Below, 125.0),
        ];
        let flags = vec![FlagRule::new("chronic_anemia", "chronic_anemia", 2)];
        let panel = AbnormalityPanel::new(&rules, &flags, &items);
        let prior = std::collections::HashMap::from([(10, 1), (20, 2)]);
        StreamingAggregator::prior_admissions(items, panel, prior, create_shared_log())
            .with_tracked_subjects([1, 2, 3])
    }

    #[test]
    fn test_prior_column_layout() {
        let columns = lab_columns(&prior_aggregator().finish());
        assert_eq!(
            columns,
            vec![
                "count_prior_labevents",
                "count_unique_labs_tested_prior",
                "creatinine_prior_avg",
                "creatinine_prior_min",
                "creatinine_prior_max",
                "creatinine_prior_std",
                "sodium_prior_avg",
                "sodium_prior_min",
                "sodium_prior_max",
                "sodium_prior_std",
                "hemoglobin_prior_avg",
                "hemoglobin_prior_min",
                "hemoglobin_prior_max",
                "hemoglobin_prior_std",
                "last_creatinine_value_prior",
                "last_sodium_value_prior",
                "last_hemoglobin_value_prior",
                "count_prior_chronic_anemia",
                "count_prior_severe_hyponatremia",
                "flag_chronic_anemia_prior",
            ]
        );
    }

    #[test]
    fn test_prior_rows() {
        let mut agg = prior_aggregator();
        for (i, v) in [9.0, 8.5, 12.0].into_iter().enumerate() {
            let obs = LabObservation::new(1, 51222, day(i as i64), v).with_admission(10);
            agg.observe(&obs).unwrap();
        }
        agg.observe(&LabObservation::new(1, 50983, day(4), 120.0).with_admission(10))
            .unwrap();
        let table = materialize(agg.finish(), &[1, 2, 3]);

        assert_eq!(table.value(1, "count_prior_labevents"), Some(&FeatureValue::Int(4)));
        assert_eq!(table.value(1, "count_unique_labs_tested_prior"), Some(&FeatureValue::Int(2)));
        assert_eq!(table.value(1, "hemoglobin_prior_min"), Some(&FeatureValue::Float(8.5)));
        assert_eq!(table.value(1, "last_hemoglobin_value_prior"), Some(&FeatureValue::Float(12.0)));
        assert_eq!(table.value(1, "count_prior_severe_hyponatremia"), Some(&FeatureValue::Int(1)));
        assert_eq!(table.value(1, "flag_chronic_anemia_prior"), Some(&FeatureValue::Int(1)));
        assert_eq!(table.value(1, "creatinine_prior_avg"), Some(&FeatureValue::Missing));

        // no prior lab events: zero counts, missing statistics
        for subject in [2, 3] {
            assert_eq!(table.value(subject, "count_prior_labevents"), Some(&FeatureValue::Int(0)));
            assert_eq!(table.value(subject, "flag_chronic_anemia_prior"), Some(&FeatureValue::Int(0)));
            assert_eq!(table.value(subject, "last_sodium_value_prior"), Some(&FeatureValue::Missing));
        }
    }

    #[test]
    fn test_missing_serializes_as_null() {
        let values = vec![FeatureValue::Missing, FeatureValue::Int(3), FeatureValue::Float(0.5)];
        assert_eq!(serde_json::to_string(&values).unwrap(), "[null,3,0.5]");
        assert_eq!(FeatureValue::Missing.render("NA"), "NA");
    }
}
