//! Streaming lab aggregation over bounded chunks.
//!
//! State is a flat map keyed by (subject, window, lab) holding fixed-size
//! running statistics, plus a flat map of abnormality counters keyed by
//! (subject, window, rule). Every update depends only on the observation and
//! the state of its own bucket, so results do not depend on chunk size or on
//! the order in which chunks arrive, apart from which of several observations
//! sharing the latest timestamp becomes the last value.
//!
//! The same engine also aggregates over prior admissions instead of time
//! windows: every observation charted under one of the subject's earlier
//! admissions lands in a single bucket per lab, whatever its chart time.

use crate::core::abnormality::{AbnormalityPanel, RuleIdx};
use crate::core::boundaries::{BoundaryTable, WindowIdx, WindowSet};
use crate::core::resolver::{ItemMap, LabId};
use crate::core::stats::LabBucket;
use crate::core::types::{
    parse_timestamp, parse_value, AdmissionId, ItemId, LabEventRow, LabObservation, RowRejection,
    SubjectId,
};
use crate::error::{FeatureError, Result};
use crate::run_log::SharedRunLog;
use crate::source::{Chunk, ChunkSource, SourceRow};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Window index used for every bucket of the prior-admission scope.
pub const PRIOR_WINDOW: WindowIdx = 0;

/// What each observation is aggregated against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AggregationScope {
    /// Time windows ending at each subject's reference time
    #[default]
    Windows,
    /// All events charted under a prior admission, keyed admission -> subject
    PriorAdmissions(HashMap<AdmissionId, SubjectId>),
}

/// Composite key of one running-statistics bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey {
    pub subject: SubjectId,
    pub window: WindowIdx,
    pub lab: LabId,
}

/// Composite key of one abnormality counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CounterKey {
    pub subject: SubjectId,
    pub window: WindowIdx,
    pub rule: RuleIdx,
}

/// Per-chunk tally returned by [`StreamingAggregator::process_chunk`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkOutcome {
    pub rows: u64,
    pub accepted: u64,
    pub rejected: u64,
}

/// Accumulated state, read-only once the stream is exhausted.
#[derive(Debug)]
pub struct AggregationState {
    pub scope: AggregationScope,
    pub items: ItemMap,
    pub boundaries: BoundaryTable,
    pub panel: AbnormalityPanel,
    pub buckets: HashMap<BucketKey, LabBucket>,
    pub counters: HashMap<CounterKey, u64>,
}

impl AggregationState {
    pub fn bucket(&self, subject: SubjectId, window: WindowIdx, lab: LabId) -> Option<&LabBucket> {
        self.buckets.get(&BucketKey {
            subject,
            window,
            lab,
        })
    }

    pub fn counter(&self, subject: SubjectId, window: WindowIdx, rule: RuleIdx) -> u64 {
        self.counters
            .get(&CounterKey {
                subject,
                window,
                rule,
            })
            .copied()
            .unwrap_or(0)
    }

    /// Number of distinct subjects with at least one bucket in `window`.
    pub fn subjects_in_window(&self, window: WindowIdx) -> usize {
        self.buckets
            .keys()
            .filter(|k| k.window == window)
            .map(|k| k.subject)
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn is_prior_scope(&self) -> bool {
        matches!(self.scope, AggregationScope::PriorAdmissions(_))
    }
}

/// Folds lab observations into per-(subject, window, lab) state.
pub struct StreamingAggregator {
    state: AggregationState,
    tracked: HashSet<SubjectId>,
    log: SharedRunLog,
}

impl StreamingAggregator {
    /// Create an aggregator for the subjects in `boundaries` (including the
    /// ones it rejected, which stay tracked but never aggregate).
    pub fn new(
        items: ItemMap,
        boundaries: BoundaryTable,
        panel: AbnormalityPanel,
        log: SharedRunLog,
    ) -> Self {
        let rejected = boundaries.rejected().len() as u64;
        if rejected > 0 {
            log.record_subjects_without_reference(rejected);
        }
        Self {
            state: AggregationState {
                scope: AggregationScope::Windows,
                items,
                boundaries,
                panel,
                buckets: HashMap::new(),
                counters: HashMap::new(),
            },
            tracked: HashSet::new(),
            log,
        }
    }

    /// Create an aggregator over prior admissions. `prior` maps each prior
    /// admission id to its subject; events under any other admission, or
    /// under none, are excluded.
    pub fn prior_admissions(
        items: ItemMap,
        panel: AbnormalityPanel,
        prior: HashMap<AdmissionId, SubjectId>,
        log: SharedRunLog,
    ) -> Self {
        let boundaries =
            BoundaryTable::compute(Vec::<(SubjectId, Option<_>)>::new(), &WindowSet::new(Vec::new()));
        let tracked: HashSet<SubjectId> = prior.values().copied().collect();
        let mut aggregator = Self::new(items, boundaries, panel, log);
        aggregator.tracked = tracked;
        aggregator.state.scope = AggregationScope::PriorAdmissions(prior);
        aggregator
    }

    /// Restrict aggregation to an explicit cohort. Without this, the subjects
    /// known to the boundary table are the tracked set.
    pub fn with_tracked_subjects(mut self, subjects: impl IntoIterator<Item = SubjectId>) -> Self {
        self.tracked = subjects.into_iter().collect();
        self
    }

    fn is_tracked(&self, subject: SubjectId) -> bool {
        if self.tracked.is_empty() {
            self.state.boundaries.get(subject).is_some()
                || self.state.boundaries.is_rejected(subject)
        } else {
            self.tracked.contains(&subject)
        }
    }

    pub fn state(&self) -> &AggregationState {
        &self.state
    }

    /// Parse a raw row into an observation, applying the discard rules in order:
    /// subject, item, timestamp, value.
    pub fn parse_row(&self, row: &LabEventRow) -> std::result::Result<LabObservation, RowRejection> {
        let subject: SubjectId = row
            .subject_id
            .trim()
            .parse()
            .map_err(|_| RowRejection::MalformedSubject)?;
        if !self.is_tracked(subject) {
            return Err(RowRejection::UntrackedSubject);
        }
        let item: ItemId = row
            .itemid
            .trim()
            .parse()
            .map_err(|_| RowRejection::UnresolvedItem)?;
        if self.state.items.lab_id(item).is_none() {
            return Err(RowRejection::UnresolvedItem);
        }
        let charttime = parse_timestamp(&row.charttime).ok_or(RowRejection::BadTimestamp)?;
        let value = parse_value(&row.valuenum).ok_or(RowRejection::BadValue)?;
        let mut obs = LabObservation::new(subject, item, charttime, value);
        obs.hadm_id = row.hadm_id.trim().parse().ok();
        Ok(obs)
    }

    /// Buckets an accepted observation belongs to, under the current scope.
    fn windows_for(&self, obs: &LabObservation) -> std::result::Result<Vec<WindowIdx>, RowRejection> {
        match &self.state.scope {
            AggregationScope::PriorAdmissions(prior) => {
                match obs.hadm_id.and_then(|h| prior.get(&h)) {
                    Some(&owner) if owner == obs.subject_id => Ok(vec![PRIOR_WINDOW]),
                    _ => Err(RowRejection::NotPriorAdmission),
                }
            }
            AggregationScope::Windows => {
                let bounds = self
                    .state
                    .boundaries
                    .get(obs.subject_id)
                    .ok_or(RowRejection::MissingReference)?;
                if bounds.is_after_reference(obs.charttime) {
                    return Err(RowRejection::AfterReference);
                }
                let windows: Vec<WindowIdx> = bounds.windows_containing(obs.charttime).collect();
                if windows.is_empty() {
                    return Err(RowRejection::BeforeWindows);
                }
                Ok(windows)
            }
        }
    }

    /// Fold one observation into every bucket it belongs to: each window
    /// containing it, or the single prior-admission bucket.
    ///
    /// Returns the number of buckets updated.
    pub fn observe(&mut self, obs: &LabObservation) -> std::result::Result<usize, RowRejection> {
        if !self.is_tracked(obs.subject_id) {
            return Err(RowRejection::UntrackedSubject);
        }
        let lab = self
            .state
            .items
            .lab_id(obs.item_id)
            .ok_or(RowRejection::UnresolvedItem)?;
        let windows = self.windows_for(obs)?;

        let rules: Vec<RuleIdx> = self.state.panel.matching(lab, obs.value).collect();
        for &window in &windows {
            self.state
                .buckets
                .entry(BucketKey {
                    subject: obs.subject_id,
                    window,
                    lab,
                })
                .or_default()
                .observe(obs.charttime, obs.value);

            for &rule in &rules {
                *self
                    .state
                    .counters
                    .entry(CounterKey {
                        subject: obs.subject_id,
                        window,
                        rule,
                    })
                    .or_insert(0) += 1;
            }
        }
        Ok(windows.len())
    }

    /// Parse and fold one raw row, recording the outcome in the run log.
    pub fn process_row(&mut self, row: &SourceRow) -> bool {
        let outcome = match row {
            SourceRow::Event(row) => self.parse_row(row).and_then(|obs| self.observe(&obs)),
            SourceRow::Undecodable => Err(RowRejection::Undecodable),
        };
        match outcome {
            Ok(windows) => {
                self.log.record_accepted(windows as u64);
                true
            }
            Err(reason) => {
                self.log.record_rejection(reason);
                false
            }
        }
    }

    /// Fold a whole chunk. Malformed rows are excluded, never fatal.
    pub fn process_chunk(&mut self, chunk: &Chunk) -> ChunkOutcome {
        let mut outcome = ChunkOutcome {
            rows: chunk.len() as u64,
            ..ChunkOutcome::default()
        };
        for row in chunk {
            if self.process_row(row) {
                outcome.accepted += 1;
            } else {
                outcome.rejected += 1;
            }
        }
        self.log.record_chunk(outcome.rows);
        outcome
    }

    /// Drain `source`, one chunk at a time. `cancel` is checked between chunks.
    pub fn consume<S: ChunkSource>(&mut self, source: &mut S, cancel: &AtomicBool) -> Result<u64> {
        let mut chunks = 0u64;
        loop {
            if cancel.load(Ordering::SeqCst) {
                return Err(FeatureError::Cancelled);
            }
            let Some(chunk) = source.next_chunk()? else {
                break;
            };
            chunks += 1;
            let outcome = self.process_chunk(&chunk);
            debug!(
                chunk = chunks,
                rows = outcome.rows,
                accepted = outcome.accepted,
                rejected = outcome.rejected,
                buckets = self.state.buckets.len(),
                "folded chunk"
            );
        }
        Ok(chunks)
    }

    /// Finish the stream and hand the state to the materializer.
    pub fn finish(self) -> AggregationState {
        if self.state.is_prior_scope() {
            info!(
                subjects_with_labs = self.state.subjects_in_window(PRIOR_WINDOW),
                buckets = self.state.buckets.len(),
                "prior admission labs aggregated"
            );
            return self.state;
        }
        let windows = self.state.boundaries.windows();
        for window in windows.indices() {
            let with_labs = self.state.subjects_in_window(window);
            let with_counts = self
                .state
                .counters
                .keys()
                .filter(|k| k.window == window)
                .map(|k| k.subject)
                .collect::<HashSet<_>>()
                .len();
            info!(
                window = %windows.label(window),
                subjects_with_labs = with_labs,
                subjects_with_abnormal_counts = with_counts,
                "window aggregated"
            );
        }
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::abnormality::{AbnormalityRule, Comparison};
    use crate::core::boundaries::WindowSet;
    use crate::core::resolver::{ItemResolver, LabItem};
    use crate::run_log::create_shared_log;
    use crate::source::MemorySource;
    use chrono::{Duration, NaiveDate, NaiveDateTime};

    const CREATININE: &str = "50912";
    const HEMOGLOBIN: &str = "51222";

    fn base() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2150, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn day(n: i64) -> NaiveDateTime {
        base() + Duration::days(n)
    }

    fn ts(t: NaiveDateTime) -> String {
        t.format("%Y-%m-%d %H:%M:%S").to_string()
    }

    fn aggregator(windows: &[u32]) -> StreamingAggregator {
        let items = ItemResolver::new(["creatinine", "hemoglobin"]).resolve(vec![
            LabItem::new(50912, "Creatinine"),
            LabItem::new(51222, "Hemoglobin"),
        ]);
        let windows = WindowSet::new(windows.iter().copied());
        let boundaries = BoundaryTable::compute([(1, Some(day(100))), (2, None)], &windows);
        let rules = vec![AbnormalityRule::new("low_hgb", "hemoglobin", Comparison::Below, 10.0)];
        let panel = AbnormalityPanel::new(&rules, &[], &items);
        StreamingAggregator::new(items, boundaries, panel, create_shared_log())
    }

    fn row(subject: &str, item: &str, at: NaiveDateTime, value: f64) -> LabEventRow {
        LabEventRow::new(subject, item, ts(at), value.to_string())
    }

    fn run(windows: &[u32], rows: Vec<LabEventRow>, chunk_size: usize) -> AggregationState {
        let mut agg = aggregator(windows);
        let mut source = MemorySource::new(rows, chunk_size).unwrap();
        agg.consume(&mut source, &AtomicBool::new(false)).unwrap();
        agg.finish()
    }

    #[test]
    fn test_scenario_thirty_day_window() {
        let rows = vec![
            row("1", CREATININE, day(95), 1.0),
            row("1", CREATININE, day(80), 0.5),
        ];
        let state = run(&[30, 7], rows, 1);
        let creat = state.items.lab_by_name("creatinine").unwrap();

        let w30 = state.bucket(1, 0, creat).unwrap();
        assert_eq!(w30.stats.count(), 2);
        assert!((w30.stats.mean().unwrap() - 0.75).abs() < 1e-12);
        assert_eq!(w30.last_value(), Some(1.0));

        // day 80 is before the 7-day cutoff (day 93); day 95 is inside it
        let w7 = state.bucket(1, 1, creat).unwrap();
        assert_eq!(w7.stats.count(), 1);
        assert_eq!(w7.last_value(), Some(1.0));
    }

    #[test]
    fn test_window_with_no_observations_has_no_bucket() {
        let rows = vec![
            row("1", CREATININE, day(90), 1.0),
            row("1", CREATININE, day(80), 0.5),
        ];
        let state = run(&[30, 7], rows, 2);
        let creat = state.items.lab_by_name("creatinine").unwrap();
        assert_eq!(state.bucket(1, 0, creat).unwrap().stats.count(), 2);
        assert!(state.bucket(1, 1, creat).is_none());
    }

    #[test]
    fn test_boundary_exactness() {
        let mut agg = aggregator(&[7]);
        let creat_item = 50912;
        let cutoff = day(93);

        assert_eq!(agg.observe(&LabObservation::new(1, creat_item, cutoff, 1.0)), Ok(1));
        assert_eq!(
            agg.observe(&LabObservation::new(1, creat_item, cutoff - Duration::seconds(1), 1.0)),
            Err(RowRejection::BeforeWindows)
        );
        assert_eq!(agg.observe(&LabObservation::new(1, creat_item, day(100), 1.0)), Ok(1));
        assert_eq!(
            agg.observe(&LabObservation::new(1, creat_item, day(100) + Duration::seconds(1), 1.0)),
            Err(RowRejection::AfterReference)
        );
    }

    #[test]
    fn test_discard_rules() {
        let agg = aggregator(&[30]);
        let ok = row("1", CREATININE, day(99), 1.0);
        assert!(agg.parse_row(&ok).is_ok());

        let mut bad = ok.clone();
        bad.subject_id = "abc".into();
        assert_eq!(agg.parse_row(&bad), Err(RowRejection::MalformedSubject));

        let mut bad = ok.clone();
        bad.subject_id = "99".into();
        assert_eq!(agg.parse_row(&bad), Err(RowRejection::UntrackedSubject));

        let mut bad = ok.clone();
        bad.itemid = "11111".into();
        assert_eq!(agg.parse_row(&bad), Err(RowRejection::UnresolvedItem));

        let mut bad = ok.clone();
        bad.charttime = "yesterday".into();
        assert_eq!(agg.parse_row(&bad), Err(RowRejection::BadTimestamp));

        let mut bad = ok;
        bad.valuenum = "___".into();
        assert_eq!(agg.parse_row(&bad), Err(RowRejection::BadValue));
    }

    #[test]
    fn test_subject_without_reference_is_tracked_but_excluded() {
        let mut agg = aggregator(&[30]);
        let chunk: Chunk = vec![row("2", CREATININE, day(99), 1.0).into()];
        let outcome = agg.process_chunk(&chunk);
        assert_eq!(outcome.rejected, 1);
        assert!(agg.state().buckets.is_empty());
    }

    #[test]
    fn test_malformed_rows_do_not_abort() {
        let rows = vec![
            row("1", CREATININE, day(99), 1.0),
            LabEventRow::new("1", CREATININE, "", "2.0"),
            LabEventRow::new("1", CREATININE, ts(day(98)), "n/a"),
            row("1", CREATININE, day(97), 3.0),
        ];
        let mut agg = aggregator(&[30]);
        let mut chunks: Vec<Chunk> = vec![rows.into_iter().map(SourceRow::from).collect()];
        chunks[0].push(SourceRow::Undecodable);
        let mut source = MemorySource::from_chunks(chunks);
        agg.consume(&mut source, &AtomicBool::new(false)).unwrap();

        let state = agg.finish();
        let creat = state.items.lab_by_name("creatinine").unwrap();
        assert_eq!(state.bucket(1, 0, creat).unwrap().stats.count(), 2);
    }

    #[test]
    fn test_abnormality_counter_independent_of_chunking() {
        let values = [12.0, 9.0, 8.0, 11.0];
        for chunk_size in [1, 2, 3, 4, 10] {
            let rows = values
                .iter()
                .enumerate()
                .map(|(i, &v)| row("1", HEMOGLOBIN, day(90 + i as i64), v))
                .collect();
            let state = run(&[30, 7], rows, chunk_size);
            assert_eq!(state.counter(1, 0, 0), 2, "chunk size {chunk_size}");
            // days 90..=93: only day 93 is inside the 7-day window, value 11 is normal
            assert_eq!(state.counter(1, 1, 0), 0, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn test_last_value_regardless_of_order() {
        let t1 = row("1", CREATININE, day(91), 1.0);
        let t2 = row("1", CREATININE, day(92), 2.0);
        let t3 = row("1", CREATININE, day(93), 3.0);
        let orders = [
            vec![t1.clone(), t2.clone(), t3.clone()],
            vec![t3.clone(), t2.clone(), t1.clone()],
            vec![t2.clone(), t3.clone(), t1.clone()],
            vec![t3, t1, t2],
        ];
        for rows in orders {
            let state = run(&[30], rows, 1);
            let creat = state.items.lab_by_name("creatinine").unwrap();
            assert_eq!(state.bucket(1, 0, creat).unwrap().last_value(), Some(3.0));
        }
    }

    fn prior_aggregator() -> StreamingAggregator {
        let items = ItemResolver::new(["creatinine", "hemoglobin"]).resolve(vec![
            LabItem::new(50912, "Creatinine"),
            LabItem::new(51222, "Hemoglobin"),
        ]);
        let rules = vec![AbnormalityRule::new("low_hgb", "hemoglobin", Comparison::Below, 10.0)];
        let panel = AbnormalityPanel::new(&rules, &[], &items);
        // subject 1: admission 10 is prior, 11 is the reference admission
        // subject 2: admission 20 is prior
        let prior = HashMap::from([(10, 1), (20, 2)]);
        StreamingAggregator::prior_admissions(items, panel, prior, create_shared_log())
            .with_tracked_subjects([1, 2, 3])
    }

    #[test]
    fn test_prior_scope_keeps_only_prior_admission_rows() {
        let mut agg = prior_aggregator();
        let chunk: Chunk = vec![
            row("1", CREATININE, day(5), 1.0).with_admission("10").into(),
            row("1", CREATININE, day(6), 3.0).with_admission("10").into(),
            // reference admission
            row("1", CREATININE, day(99), 9.0).with_admission("11").into(),
            // no admission recorded
            row("1", CREATININE, day(7), 9.0).into(),
            // another subject's prior admission
            row("1", CREATININE, day(8), 9.0).with_admission("20").into(),
            row("3", CREATININE, day(8), 9.0).with_admission("30").into(),
        ];
        let outcome = agg.process_chunk(&chunk);
        assert_eq!(outcome.accepted, 2);
        assert_eq!(outcome.rejected, 4);

        let state = agg.finish();
        assert!(state.is_prior_scope());
        let creat = state.items.lab_by_name("creatinine").unwrap();
        let bucket = state.bucket(1, PRIOR_WINDOW, creat).unwrap();
        assert_eq!(bucket.stats.count(), 2);
        assert_eq!(bucket.last_value(), Some(3.0));
        assert!(state.buckets.keys().all(|k| k.subject == 1));
    }

    #[test]
    fn test_prior_scope_ignores_chart_time() {
        let mut agg = prior_aggregator();
        // charted after the reference time, still under a prior admission
        let obs = LabObservation::new(2, 51222, day(500), 8.0).with_admission(20);
        assert_eq!(agg.observe(&obs), Ok(1));

        let reference = LabObservation::new(1, 51222, day(50), 8.0).with_admission(11);
        assert_eq!(agg.observe(&reference), Err(RowRejection::NotPriorAdmission));

        let state = agg.finish();
        assert_eq!(state.counter(2, PRIOR_WINDOW, 0), 1);
        assert_eq!(state.counter(1, PRIOR_WINDOW, 0), 0);
    }

    #[test]
    fn test_parse_row_reads_admission() {
        let agg = aggregator(&[30]);
        let obs = agg.parse_row(&row("1", CREATININE, day(99), 1.0).with_admission(" 11 ")).unwrap();
        assert_eq!(obs.hadm_id, Some(11));
        let obs = agg.parse_row(&row("1", CREATININE, day(99), 1.0)).unwrap();
        assert_eq!(obs.hadm_id, None);
    }

    #[test]
    fn test_cancellation_stops_before_next_chunk() {
        let mut agg = aggregator(&[30]);
        let mut source = MemorySource::new(vec![row("1", CREATININE, day(99), 1.0)], 1).unwrap();
        let cancel = AtomicBool::new(true);
        assert!(matches!(
            agg.consume(&mut source, &cancel),
            Err(FeatureError::Cancelled)
        ));
        assert!(agg.state().buckets.is_empty());
    }
}
