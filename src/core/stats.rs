//! Fixed-size running statistics for one (subject, window, lab) bucket.
//!
//! Values are never retained. Variance is tracked with Welford's update so the
//! population standard deviation stays stable for long series of similar values.

use chrono::NaiveDateTime;

/// Count, sum, min, max and second moment of a stream of values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunningStats {
    count: u64,
    sum: f64,
    welford_mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl Default for RunningStats {
    fn default() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            welford_mean: 0.0,
            m2: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl RunningStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one value into the statistics.
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        let delta = value - self.welford_mean;
        self.welford_mean += delta / self.count as f64;
        self.m2 += delta * (value - self.welford_mean);
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    /// Population variance (denominator = count).
    pub fn population_variance(&self) -> Option<f64> {
        (self.count > 0).then(|| (self.m2 / self.count as f64).max(0.0))
    }

    /// Population standard deviation (denominator = count, not count - 1).
    ///
    /// Output features describe every observation in the window rather than a
    /// sample of them, so a single observation has a deviation of 0.
    pub fn std_dev(&self) -> Option<f64> {
        self.population_variance().map(f64::sqrt)
    }
}

/// The most recent observation seen for a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LastValue {
    pub at: NaiveDateTime,
    pub value: f64,
}

/// Everything accumulated for one (subject, window, lab) bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LabBucket {
    pub stats: RunningStats,
    pub last: Option<LastValue>,
}

impl LabBucket {
    /// Fold an observation into the bucket.
    ///
    /// The stored last value is replaced only by a strictly later timestamp, so
    /// among equal timestamps the first one processed is kept.
    pub fn observe(&mut self, at: NaiveDateTime, value: f64) {
        self.stats.push(value);
        match self.last {
            Some(ref last) if at <= last.at => {}
            _ => self.last = Some(LastValue { at, value }),
        }
    }

    pub fn last_value(&self) -> Option<f64> {
        self.last.map(|l| l.value)
    }
}
