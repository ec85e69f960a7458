//! Window boundaries relative to each subject's reference time.
//!
//! A window of `d` days covers `[reference - d days, reference]`, both ends
//! inclusive. Windows overlap but never share state, and no ordering between
//! window lengths is assumed.

use crate::core::types::SubjectId;
use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Position of a window within the configured window list.
pub type WindowIdx = u16;

/// The configured window lengths, in configuration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSet {
    days: Vec<u32>,
}

impl WindowSet {
    /// Build a window set. Zero-length and repeated windows are dropped;
    /// configuration validation reports them before this point.
    pub fn new(days: impl IntoIterator<Item = u32>) -> Self {
        let mut unique: Vec<u32> = Vec::new();
        for d in days {
            if d > 0 && !unique.contains(&d) {
                unique.push(d);
            }
        }
        Self { days: unique }
    }

    pub fn days(&self) -> &[u32] {
        &self.days
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    pub fn position(&self, days: u32) -> Option<WindowIdx> {
        self.days.iter().position(|&d| d == days).map(|i| i as WindowIdx)
    }

    pub fn days_at(&self, idx: WindowIdx) -> u32 {
        self.days[idx as usize]
    }

    /// Column prefix for a window, e.g. `window_30d`.
    pub fn label(&self, idx: WindowIdx) -> String {
        format!("window_{}d", self.days_at(idx))
    }

    pub fn indices(&self) -> impl Iterator<Item = WindowIdx> {
        (0..self.days.len()).map(|i| i as WindowIdx)
    }
}

/// Reference time and per-window cutoffs for one subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectBoundaries {
    reference: NaiveDateTime,
    cutoffs: Vec<NaiveDateTime>,
}

impl SubjectBoundaries {
    pub fn new(reference: NaiveDateTime, windows: &WindowSet) -> Self {
        let cutoffs = windows
            .days()
            .iter()
            .map(|&d| {
                reference
                    .checked_sub_signed(Duration::days(i64::from(d)))
                    .unwrap_or(NaiveDateTime::MIN)
            })
            .collect();
        Self { reference, cutoffs }
    }

    pub fn reference(&self) -> NaiveDateTime {
        self.reference
    }

    pub fn cutoff(&self, idx: WindowIdx) -> NaiveDateTime {
        self.cutoffs[idx as usize]
    }

    pub fn is_after_reference(&self, at: NaiveDateTime) -> bool {
        at > self.reference
    }

    /// Check if a timestamp falls within window `idx`.
    pub fn contains(&self, idx: WindowIdx, at: NaiveDateTime) -> bool {
        at >= self.cutoff(idx) && at <= self.reference
    }

    /// Windows containing `at`, each tested on its own cutoff.
    pub fn windows_containing(&self, at: NaiveDateTime) -> impl Iterator<Item = WindowIdx> + '_ {
        let in_range = at <= self.reference;
        self.cutoffs
            .iter()
            .enumerate()
            .filter(move |(_, &cutoff)| in_range && at >= cutoff)
            .map(|(i, _)| i as WindowIdx)
    }
}

/// Subject -> window -> cutoff, plus the subjects that had to be rejected.
#[derive(Debug, Clone)]
pub struct BoundaryTable {
    windows: WindowSet,
    subjects: HashMap<SubjectId, SubjectBoundaries>,
    rejected: HashSet<SubjectId>,
}

impl BoundaryTable {
    /// Compute cutoffs for every subject. A subject whose reference time is
    /// missing is rejected rather than given a default.
    pub fn compute<I>(references: I, windows: &WindowSet) -> Self
    where
        I: IntoIterator<Item = (SubjectId, Option<NaiveDateTime>)>,
    {
        let mut subjects = HashMap::new();
        let mut rejected = HashSet::new();
        for (subject, reference) in references {
            match reference {
                Some(reference) => {
                    subjects.insert(subject, SubjectBoundaries::new(reference, windows));
                }
                None => {
                    rejected.insert(subject);
                }
            }
        }
        Self {
            windows: windows.clone(),
            subjects,
            rejected,
        }
    }

    /// Same as [`BoundaryTable::compute`] but from raw reference text.
    pub fn from_raw<'a, I>(references: I, windows: &WindowSet) -> Self
    where
        I: IntoIterator<Item = (SubjectId, Option<&'a str>)>,
    {
        Self::compute(
            references
                .into_iter()
                .map(|(s, raw)| (s, raw.and_then(crate::core::types::parse_timestamp))),
            windows,
        )
    }

    pub fn windows(&self) -> &WindowSet {
        &self.windows
    }

    pub fn get(&self, subject: SubjectId) -> Option<&SubjectBoundaries> {
        self.subjects.get(&subject)
    }

    /// Cutoff for a subject and a window length in days.
    pub fn cutoff(&self, subject: SubjectId, days: u32) -> Option<NaiveDateTime> {
        let idx = self.windows.position(days)?;
        self.get(subject).map(|b| b.cutoff(idx))
    }

    pub fn is_rejected(&self, subject: SubjectId) -> bool {
        self.rejected.contains(&subject)
    }

    pub fn rejected(&self) -> &HashSet<SubjectId> {
        &self.rejected
    }

    pub fn subject_count(&self) -> usize {
        self.subjects.len()
    }
}
