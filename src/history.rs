//! Diagnosis, procedure and medication history features.
//!
//! Each table is scanned once. A row contributes only when its admission is a
//! prior admission of a cohort subject, i.e. admitted strictly before that
//! subject's reference admission. Every cohort subject gets a row.

use crate::cohort::{Admission, Cohort};
use crate::core::materialize::{sanitize_name, FeatureTable, FeatureValue};
use crate::core::types::{AdmissionId, SubjectId};
use crate::error::Result;
use crate::source::tables::{for_each_record, RowPolicy};
use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::info;

/// A named set of code prefixes or drug keywords.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeGroup {
    pub name: String,
    pub patterns: Vec<String>,
}

impl CodeGroup {
    pub fn new(name: impl Into<String>, patterns: &[&str]) -> Self {
        Self {
            name: name.into(),
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// ICD match: the code starts with one of the patterns.
    pub fn matches_prefix(&self, code: &str) -> bool {
        self.patterns.iter().any(|p| code.starts_with(p.as_str()))
    }

    /// Drug match: the lower-cased name contains one of the patterns.
    pub fn matches_substring(&self, drug_lower: &str) -> bool {
        self.patterns
            .iter()
            .any(|p| drug_lower.contains(p.to_lowercase().as_str()))
    }

    fn column(&self) -> String {
        sanitize_name(&self.name)
    }
}

/// A diagnosis or procedure row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodedRecord {
    pub subject_id: SubjectId,
    pub hadm_id: AdmissionId,
    #[serde(default)]
    pub icd_code: String,
}

/// A prescription row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrescriptionRecord {
    pub subject_id: SubjectId,
    pub hadm_id: AdmissionId,
    #[serde(default)]
    pub drug: String,
}

const CODED_COLUMNS: [&str; 3] = ["subject_id", "hadm_id", "icd_code"];
const PRESCRIPTION_COLUMNS: [&str; 3] = ["subject_id", "hadm_id", "drug"];

/// Whole days from `from` to `to`, rounded toward negative infinity.
fn whole_days(from: NaiveDateTime, to: NaiveDateTime) -> i64 {
    (to - from).num_seconds().div_euclid(86_400)
}

/// Whole days divided by 365, rounded to 2 decimals.
fn years_between(from: NaiveDateTime, to: NaiveDateTime) -> f64 {
    let years = whole_days(from, to) as f64 / 365.0;
    (years * 100.0).round() / 100.0
}

fn mean<I: IntoIterator<Item = u64>>(values: I) -> Option<f64> {
    let (sum, n) = values
        .into_iter()
        .fold((0u64, 0u64), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum as f64 / n as f64)
}

/// Prior admissions of every cohort subject, resolved once per scan.
struct PriorAdmissions<'a> {
    cohort: &'a Cohort,
    owner: HashMap<AdmissionId, SubjectId>,
}

impl<'a> PriorAdmissions<'a> {
    fn new(cohort: &'a Cohort) -> Self {
        Self {
            cohort,
            owner: cohort.prior_admission_index(),
        }
    }

    /// Whether `hadm_id` is a prior admission of `subject`.
    fn is_prior(&self, subject: SubjectId, hadm_id: AdmissionId) -> bool {
        self.owner.get(&hadm_id) == Some(&subject)
    }

    fn admit_time(&self, subject: SubjectId, hadm_id: AdmissionId) -> Option<NaiveDateTime> {
        self.cohort
            .admissions(subject)
            .iter()
            .find(|a| a.hadm_id == hadm_id)
            .and_then(|a| a.admittime)
    }

    /// Latest admit time among `hadm_ids`, or earliest when `earliest` is set.
    fn extreme_admit(
        &self,
        subject: SubjectId,
        hadm_ids: &HashSet<AdmissionId>,
        earliest: bool,
    ) -> Option<NaiveDateTime> {
        let times = hadm_ids.iter().filter_map(|&h| self.admit_time(subject, h));
        if earliest {
            times.min()
        } else {
            times.max()
        }
    }
}

/// Outcome counters of one history scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanCounts {
    pub used: u64,
    pub not_prior: u64,
    pub malformed: u64,
}

#[derive(Debug, Default)]
struct DiagnosisState {
    codes: HashSet<String>,
    per_admission: HashMap<AdmissionId, u64>,
    conditions: Vec<HashSet<AdmissionId>>,
}

/// Accumulates diagnosis history for the cohort.
pub struct DiagnosisHistory<'a> {
    prior: PriorAdmissions<'a>,
    conditions: &'a [CodeGroup],
    state: HashMap<SubjectId, DiagnosisState>,
    counts: ScanCounts,
}

impl<'a> DiagnosisHistory<'a> {
    pub fn new(cohort: &'a Cohort, conditions: &'a [CodeGroup]) -> Self {
        Self {
            prior: PriorAdmissions::new(cohort),
            conditions,
            state: HashMap::new(),
            counts: ScanCounts::default(),
        }
    }

    pub fn observe(&mut self, record: &CodedRecord) {
        let code = record.icd_code.trim();
        if code.is_empty() {
            self.counts.malformed += 1;
            return;
        }
        if !self.prior.is_prior(record.subject_id, record.hadm_id) {
            self.counts.not_prior += 1;
            return;
        }
        self.counts.used += 1;
        let conditions = self.conditions;
        let state = self
            .state
            .entry(record.subject_id)
            .or_insert_with(|| DiagnosisState {
                conditions: vec![HashSet::new(); conditions.len()],
                ..DiagnosisState::default()
            });
        state.codes.insert(code.to_string());
        *state.per_admission.entry(record.hadm_id).or_insert(0) += 1;
        for (i, group) in conditions.iter().enumerate() {
            if group.matches_prefix(code) {
                state.conditions[i].insert(record.hadm_id);
            }
        }
    }

    pub fn counts(&self) -> ScanCounts {
        self.counts
    }

    fn columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = [
            "count_prior_admissions",
            "count_unique_diagnoses_prior",
            "avg_diagnoses_per_prior_admission",
            "time_since_last_admission_days",
            "admission_frequency_last_year",
        ]
        .iter()
        .map(|c| c.to_string())
        .collect();
        for group in self.conditions {
            columns.push(format!("flag_history_{}", group.column()));
        }
        for group in self.conditions {
            let name = group.column();
            columns.push(format!("count_prior_admissions_with_{name}"));
            columns.push(format!("time_since_first_diagnosis_{name}_years"));
        }
        columns
    }

    pub fn finish(self) -> FeatureTable {
        let cohort = self.prior.cohort;
        let mut table = FeatureTable::new(self.columns());
        let empty = DiagnosisState {
            conditions: vec![HashSet::new(); self.conditions.len()],
            ..DiagnosisState::default()
        };

        for &subject in cohort.subjects() {
            let state = self.state.get(&subject).unwrap_or(&empty);
            let prior: Vec<&Admission> = cohort.prior_admissions(subject);
            let reference = cohort.reference_time(subject);

            let last_discharge = prior.iter().filter_map(|a| a.dischtime).max();
            let since_last = match (reference, last_discharge) {
                (Some(r), Some(d)) => FeatureValue::Int(whole_days(d, r)),
                _ => FeatureValue::Missing,
            };
            let last_year = reference.map_or(0, |r| {
                let start = r
                    .checked_sub_signed(Duration::days(365))
                    .unwrap_or(NaiveDateTime::MIN);
                prior
                    .iter()
                    .filter(|a| a.admittime.is_some_and(|t| t >= start))
                    .count()
            });

            let mut values = vec![
                FeatureValue::from(prior.len() as u64),
                FeatureValue::from(state.codes.len() as u64),
                mean(state.per_admission.values().copied()).into(),
                since_last,
                FeatureValue::from(last_year as u64),
            ];
            for hadms in &state.conditions {
                values.push((!hadms.is_empty()).into());
            }
            for hadms in &state.conditions {
                values.push(FeatureValue::from(hadms.len() as u64));
                let first = self.prior.extreme_admit(subject, hadms, true);
                values.push(match (reference, first) {
                    (Some(r), Some(f)) => FeatureValue::Float(years_between(f, r)),
                    _ => FeatureValue::Missing,
                });
            }
            table.push(subject, values);
        }
        table
    }
}

#[derive(Debug, Default)]
struct ProcedureState {
    rows: u64,
    codes: HashSet<String>,
    admissions: HashSet<AdmissionId>,
    groups: Vec<HashSet<AdmissionId>>,
}

/// Accumulates procedure history for the cohort.
pub struct ProcedureHistory<'a> {
    prior: PriorAdmissions<'a>,
    groups: &'a [CodeGroup],
    state: HashMap<SubjectId, ProcedureState>,
    counts: ScanCounts,
}

impl<'a> ProcedureHistory<'a> {
    pub fn new(cohort: &'a Cohort, groups: &'a [CodeGroup]) -> Self {
        Self {
            prior: PriorAdmissions::new(cohort),
            groups,
            state: HashMap::new(),
            counts: ScanCounts::default(),
        }
    }

    pub fn observe(&mut self, record: &CodedRecord) {
        let code = record.icd_code.trim();
        if code.is_empty() {
            self.counts.malformed += 1;
            return;
        }
        if !self.prior.is_prior(record.subject_id, record.hadm_id) {
            self.counts.not_prior += 1;
            return;
        }
        self.counts.used += 1;
        let groups = self.groups;
        let state = self
            .state
            .entry(record.subject_id)
            .or_insert_with(|| ProcedureState {
                groups: vec![HashSet::new(); groups.len()],
                ..ProcedureState::default()
            });
        state.rows += 1;
        state.codes.insert(code.to_string());
        state.admissions.insert(record.hadm_id);
        for (i, group) in groups.iter().enumerate() {
            if group.matches_prefix(code) {
                state.groups[i].insert(record.hadm_id);
            }
        }
    }

    pub fn counts(&self) -> ScanCounts {
        self.counts
    }

    fn columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = [
            "count_prior_procedures",
            "count_unique_procedures_prior",
            "count_prior_admissions_with_procedure",
            "flag_procedure_in_last_prior_admission",
        ]
        .iter()
        .map(|c| c.to_string())
        .collect();
        for group in self.groups {
            columns.push(format!("flag_history_{}", group.column()));
        }
        for group in self.groups {
            columns.push(format!("time_since_last_{}_years", group.column()));
        }
        columns
    }

    pub fn finish(self) -> FeatureTable {
        let cohort = self.prior.cohort;
        let mut table = FeatureTable::new(self.columns());
        let empty = ProcedureState {
            groups: vec![HashSet::new(); self.groups.len()],
            ..ProcedureState::default()
        };

        for &subject in cohort.subjects() {
            let state = self.state.get(&subject).unwrap_or(&empty);
            let reference = cohort.reference_time(subject);
            let last_prior = cohort.prior_admissions(subject).last().map(|a| a.hadm_id);

            let mut values = vec![
                FeatureValue::from(state.rows),
                FeatureValue::from(state.codes.len() as u64),
                FeatureValue::from(state.admissions.len() as u64),
                last_prior
                    .is_some_and(|h| state.admissions.contains(&h))
                    .into(),
            ];
            for hadms in &state.groups {
                values.push((!hadms.is_empty()).into());
            }
            for hadms in &state.groups {
                let latest = self.prior.extreme_admit(subject, hadms, false);
                values.push(match (reference, latest) {
                    (Some(r), Some(l)) => FeatureValue::Float(years_between(l, r)),
                    _ => FeatureValue::Missing,
                });
            }
            table.push(subject, values);
        }
        table
    }
}

#[derive(Debug, Default)]
struct MedicationState {
    rows: u64,
    drugs: HashSet<String>,
    per_admission: HashMap<AdmissionId, HashSet<String>>,
    classes: Vec<HashSet<AdmissionId>>,
}

/// Accumulates medication history for the cohort.
pub struct MedicationHistory<'a> {
    prior: PriorAdmissions<'a>,
    classes: &'a [CodeGroup],
    state: HashMap<SubjectId, MedicationState>,
    counts: ScanCounts,
}

impl<'a> MedicationHistory<'a> {
    pub fn new(cohort: &'a Cohort, classes: &'a [CodeGroup]) -> Self {
        Self {
            prior: PriorAdmissions::new(cohort),
            classes,
            state: HashMap::new(),
            counts: ScanCounts::default(),
        }
    }

    pub fn observe(&mut self, record: &PrescriptionRecord) {
        let drug = record.drug.trim();
        if drug.is_empty() {
            self.counts.malformed += 1;
            return;
        }
        if !self.prior.is_prior(record.subject_id, record.hadm_id) {
            self.counts.not_prior += 1;
            return;
        }
        self.counts.used += 1;
        let classes = self.classes;
        let state = self
            .state
            .entry(record.subject_id)
            .or_insert_with(|| MedicationState {
                classes: vec![HashSet::new(); classes.len()],
                ..MedicationState::default()
            });
        state.rows += 1;
        state.drugs.insert(drug.to_string());
        state
            .per_admission
            .entry(record.hadm_id)
            .or_default()
            .insert(drug.to_string());
        let lower = drug.to_lowercase();
        for (i, class) in classes.iter().enumerate() {
            if class.matches_substring(&lower) {
                state.classes[i].insert(record.hadm_id);
            }
        }
    }

    pub fn counts(&self) -> ScanCounts {
        self.counts
    }

    fn columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = [
            "count_prior_prescriptions",
            "count_unique_drugs_prior",
            "avg_drugs_per_prior_admission",
        ]
        .iter()
        .map(|c| c.to_string())
        .collect();
        for class in self.classes {
            let name = class.column();
            columns.push(format!("flag_history_on_{name}"));
            columns.push(format!("count_prior_admissions_on_{name}"));
            columns.push(format!("flag_on_{name}_last_prior_admission"));
        }
        columns
    }

    pub fn finish(self) -> FeatureTable {
        let cohort = self.prior.cohort;
        let mut table = FeatureTable::new(self.columns());
        let empty = MedicationState {
            classes: vec![HashSet::new(); self.classes.len()],
            ..MedicationState::default()
        };

        for &subject in cohort.subjects() {
            let state = self.state.get(&subject).unwrap_or(&empty);
            let prior = cohort.prior_admissions(subject);
            let last_prior = prior.last().map(|a| a.hadm_id);

            let avg = if prior.is_empty() {
                FeatureValue::Float(0.0)
            } else {
                mean(state.per_admission.values().map(|d| d.len() as u64)).into()
            };
            let mut values = vec![
                FeatureValue::from(state.rows),
                FeatureValue::from(state.drugs.len() as u64),
                avg,
            ];
            for hadms in &state.classes {
                values.push((!hadms.is_empty()).into());
                values.push(FeatureValue::from(hadms.len() as u64));
                values.push(last_prior.is_some_and(|h| hadms.contains(&h)).into());
            }
            table.push(subject, values);
        }
        table
    }
}

fn log_scan(table: &'static str, counts: ScanCounts, skipped: u64, rows: usize) {
    info!(
        table,
        used = counts.used,
        not_prior = counts.not_prior,
        malformed = counts.malformed + skipped,
        rows,
        "built history features"
    );
}

/// Diagnosis history features from a `diagnoses_icd` CSV.
pub fn diagnosis_features(
    cohort: &Cohort,
    path: &Path,
    conditions: &[CodeGroup],
) -> Result<FeatureTable> {
    let mut history = DiagnosisHistory::new(cohort, conditions);
    let skipped = for_each_record(path, "diagnoses", &CODED_COLUMNS, RowPolicy::Skip, |r| {
        history.observe(&r)
    })?;
    let counts = history.counts();
    let table = history.finish();
    log_scan("diagnoses", counts, skipped, table.len());
    Ok(table)
}

/// Procedure history features from a `procedures_icd` CSV.
pub fn procedure_features(
    cohort: &Cohort,
    path: &Path,
    groups: &[CodeGroup],
) -> Result<FeatureTable> {
    let mut history = ProcedureHistory::new(cohort, groups);
    let skipped = for_each_record(path, "procedures", &CODED_COLUMNS, RowPolicy::Skip, |r| {
        history.observe(&r)
    })?;
    let counts = history.counts();
    let table = history.finish();
    log_scan("procedures", counts, skipped, table.len());
    Ok(table)
}

/// Medication history features from a `prescriptions` CSV.
pub fn medication_features(
    cohort: &Cohort,
    path: &Path,
    classes: &[CodeGroup],
) -> Result<FeatureTable> {
    let mut history = MedicationHistory::new(cohort, classes);
    let skipped = for_each_record(
        path,
        "prescriptions",
        &PRESCRIPTION_COLUMNS,
        RowPolicy::Skip,
        |r| history.observe(&r),
    )?;
    let counts = history.counts();
    let table = history.finish();
    log_scan("prescriptions", counts, skipped, table.len());
    Ok(table)
}
