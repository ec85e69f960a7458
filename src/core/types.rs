//! Event and identifier types for the lab aggregation engine.
//!
//! Raw rows carry the text exactly as it was read; parsing happens inside the
//! aggregator so that a malformed row is excluded instead of failing a chunk.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type SubjectId = u64;
pub type AdmissionId = u64;
pub type ItemId = u32;

/// Timestamp layouts accepted for chart and admission times.
const DATETIME_FORMATS: [&str; 5] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%Y/%m/%d %H:%M:%S",
];

/// Parse a hospital timestamp. Returns `None` for anything unparseable.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    for format in DATETIME_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(ts);
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Parse a numeric lab value. Non-finite values count as non-numeric.
pub fn parse_value(raw: &str) -> Option<f64> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

/// One lab event row as read from the event source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabEventRow {
    pub subject_id: String,
    pub hadm_id: String,
    pub itemid: String,
    pub charttime: String,
    pub valuenum: String,
}

impl LabEventRow {
    pub fn new(
        subject_id: impl Into<String>,
        itemid: impl Into<String>,
        charttime: impl Into<String>,
        valuenum: impl Into<String>,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            hadm_id: String::new(),
            itemid: itemid.into(),
            charttime: charttime.into(),
            valuenum: valuenum.into(),
        }
    }

    pub fn with_admission(mut self, hadm_id: impl Into<String>) -> Self {
        self.hadm_id = hadm_id.into();
        self
    }
}

/// A lab observation whose fields have all been parsed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabObservation {
    pub subject_id: SubjectId,
    /// Admission the event was charted under, when the row names one
    pub hadm_id: Option<AdmissionId>,
    pub item_id: ItemId,
    pub charttime: NaiveDateTime,
    pub value: f64,
}

impl LabObservation {
    pub fn new(subject_id: SubjectId, item_id: ItemId, charttime: NaiveDateTime, value: f64) -> Self {
        Self {
            subject_id,
            hadm_id: None,
            item_id,
            charttime,
            value,
        }
    }

    pub fn with_admission(mut self, hadm_id: AdmissionId) -> Self {
        self.hadm_id = Some(hadm_id);
        self
    }
}

/// Why a row or observation was excluded from aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowRejection {
    /// Subject id column is not an integer
    MalformedSubject,
    /// Subject is not part of the cohort
    UntrackedSubject,
    /// Subject is in the cohort but has no usable reference time
    MissingReference,
    /// Item id is malformed or has no canonical lab name
    UnresolvedItem,
    /// Chart time is missing or unparseable
    BadTimestamp,
    /// Value is missing or non-numeric
    BadValue,
    /// Chart time is later than the subject's reference time
    AfterReference,
    /// Chart time is earlier than every window cutoff
    BeforeWindows,
    /// Record could not be decoded from the source (bad encoding, bad shape)
    Undecodable,
    /// Admission is missing or is not one of the subject's prior admissions
    NotPriorAdmission,
}

impl RowRejection {
    pub const ALL: [RowRejection; 10] = [
        RowRejection::MalformedSubject,
        RowRejection::UntrackedSubject,
        RowRejection::MissingReference,
        RowRejection::UnresolvedItem,
        RowRejection::BadTimestamp,
        RowRejection::BadValue,
        RowRejection::AfterReference,
        RowRejection::BeforeWindows,
        RowRejection::Undecodable,
        RowRejection::NotPriorAdmission,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RowRejection::MalformedSubject => "malformed_subject",
            RowRejection::UntrackedSubject => "untracked_subject",
            RowRejection::MissingReference => "missing_reference",
            RowRejection::UnresolvedItem => "unresolved_item",
            RowRejection::BadTimestamp => "bad_timestamp",
            RowRejection::BadValue => "bad_value",
            RowRejection::AfterReference => "after_reference",
            RowRejection::BeforeWindows => "before_windows",
            RowRejection::Undecodable => "undecodable",
            RowRejection::NotPriorAdmission => "not_prior_admission",
        }
    }
}

impl fmt::Display for RowRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = NaiveDate::from_ymd_opt(2180, 5, 6)
            .unwrap()
            .and_hms_opt(22, 23, 0)
            .unwrap();
        assert_eq!(parse_timestamp("2180-05-06 22:23:00"), Some(expected));
        assert_eq!(parse_timestamp("2180-05-06T22:23:00"), Some(expected));
        assert_eq!(parse_timestamp(" 2180-05-06 22:23 "), Some(expected));
        assert_eq!(
            parse_timestamp("2180-05-06"),
            NaiveDate::from_ymd_opt(2180, 5, 6).unwrap().and_hms_opt(0, 0, 0)
        );
    }

    #[test]
    fn test_parse_timestamp_rejects_garbage() {
        assert_eq!(parse_timestamp(""), None);
        assert_eq!(parse_timestamp("not a date"), None);
        assert_eq!(parse_timestamp("2180-13-40 10:00:00"), None);
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("1.5"), Some(1.5));
        assert_eq!(parse_value(" 12 "), Some(12.0));
        assert_eq!(parse_value(""), None);
        assert_eq!(parse_value("___"), None);
        assert_eq!(parse_value("NaN"), None);
        assert_eq!(parse_value("inf"), None);
    }

    #[test]
    fn test_rejection_indices_are_dense() {
        for (i, reason) in RowRejection::ALL.iter().enumerate() {
            assert_eq!(reason.index(), i);
        }
    }
}
