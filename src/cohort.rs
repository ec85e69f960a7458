//! Cohort table: admissions per subject and the derived reference admission.
//!
//! The cohort is produced upstream (admission/patient join, labeling) and is
//! trusted: a row with a non-integer id aborts the load.

use crate::core::types::{parse_timestamp, AdmissionId, SubjectId};
use crate::error::Result;
use crate::source::tables::{for_each_record, RowPolicy};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{info, warn};

const REQUIRED_COLUMNS: [&str; 4] = ["subject_id", "hadm_id", "admittime", "dischtime"];

/// One row of the cohort CSV.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CohortRecord {
    pub subject_id: SubjectId,
    pub hadm_id: AdmissionId,
    #[serde(default)]
    pub admittime: Option<String>,
    #[serde(default)]
    pub dischtime: Option<String>,
}

impl CohortRecord {
    pub fn new(subject_id: SubjectId, hadm_id: AdmissionId, admittime: &str, dischtime: &str) -> Self {
        let text = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Self {
            subject_id,
            hadm_id,
            admittime: text(admittime),
            dischtime: text(dischtime),
        }
    }
}

/// An admission with parsed times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub hadm_id: AdmissionId,
    pub admittime: Option<NaiveDateTime>,
    pub dischtime: Option<NaiveDateTime>,
}

/// Admissions grouped by subject, in first-seen subject order.
#[derive(Debug, Clone, Default)]
pub struct Cohort {
    subjects: Vec<SubjectId>,
    admissions: HashMap<SubjectId, Vec<Admission>>,
}

impl Cohort {
    /// Load the cohort CSV.
    pub fn load(path: &Path) -> Result<Self> {
        let mut records: Vec<CohortRecord> = Vec::new();
        for_each_record(path, "cohort", &REQUIRED_COLUMNS, RowPolicy::Strict, |r| {
            records.push(r)
        })?;
        let cohort = Self::from_records(records);
        info!(
            path = %path.display(),
            subjects = cohort.len(),
            admissions = cohort.admission_count(),
            "loaded cohort"
        );
        Ok(cohort)
    }

    /// Build a cohort from rows. Repeated (subject, admission) pairs keep the first row.
    pub fn from_records(records: impl IntoIterator<Item = CohortRecord>) -> Self {
        let mut cohort = Self::default();
        let mut seen: HashSet<(SubjectId, AdmissionId)> = HashSet::new();
        let mut duplicates = 0usize;

        for record in records {
            if !seen.insert((record.subject_id, record.hadm_id)) {
                duplicates += 1;
                continue;
            }
            let admissions = cohort.admissions.entry(record.subject_id).or_insert_with(|| {
                cohort.subjects.push(record.subject_id);
                Vec::new()
            });
            admissions.push(Admission {
                hadm_id: record.hadm_id,
                admittime: record.admittime.as_deref().and_then(parse_timestamp),
                dischtime: record.dischtime.as_deref().and_then(parse_timestamp),
            });
        }
        if duplicates > 0 {
            warn!(duplicates, "ignored repeated cohort admissions");
        }
        cohort
    }

    /// Subjects in first-seen order. This is the output row order.
    pub fn subjects(&self) -> &[SubjectId] {
        &self.subjects
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    pub fn admission_count(&self) -> usize {
        self.admissions.values().map(Vec::len).sum()
    }

    pub fn is_tracked(&self, subject: SubjectId) -> bool {
        self.admissions.contains_key(&subject)
    }

    pub fn admissions(&self, subject: SubjectId) -> &[Admission] {
        self.admissions.get(&subject).map_or(&[], Vec::as_slice)
    }

    /// The subject's chronologically last admission. Admissions with an
    /// unparseable admit time are never chosen; among equal admit times the
    /// later row wins.
    pub fn reference_admission(&self, subject: SubjectId) -> Option<&Admission> {
        self.admissions(subject)
            .iter()
            .filter(|a| a.admittime.is_some())
            .max_by_key(|a| a.admittime)
    }

    pub fn reference_time(&self, subject: SubjectId) -> Option<NaiveDateTime> {
        self.reference_admission(subject).and_then(|a| a.admittime)
    }

    /// (subject, reference time) for every subject, in cohort order.
    pub fn reference_times(&self) -> impl Iterator<Item = (SubjectId, Option<NaiveDateTime>)> + '_ {
        self.subjects.iter().map(|&s| (s, self.reference_time(s)))
    }

    /// Admissions admitted strictly before the reference admission, oldest first.
    pub fn prior_admissions(&self, subject: SubjectId) -> Vec<&Admission> {
        let Some(reference) = self.reference_time(subject) else {
            return Vec::new();
        };
        let mut prior: Vec<&Admission> = self
            .admissions(subject)
            .iter()
            .filter(|a| a.admittime.is_some_and(|t| t < reference))
            .collect();
        prior.sort_by_key(|a| a.admittime);
        prior
    }

    /// Prior admission id to owning subject, across the whole cohort.
    pub fn prior_admission_index(&self) -> HashMap<AdmissionId, SubjectId> {
        self.subjects
            .iter()
            .flat_map(|&s| self.prior_admissions(s).into_iter().map(move |a| (a.hadm_id, s)))
            .collect()
    }
}
