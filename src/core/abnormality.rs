//! Clinical threshold predicates and the flags derived from their counts.

use crate::core::resolver::{ItemMap, LabId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// Comparison direction of a threshold predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    /// value < threshold
    Below,
    /// value <= threshold
    AtOrBelow,
    /// value > threshold
    Above,
    /// value >= threshold
    AtOrAbove,
}

impl Comparison {
    pub fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Below => value < threshold,
            Comparison::AtOrBelow => value <= threshold,
            Comparison::Above => value > threshold,
            Comparison::AtOrAbove => value >= threshold,
        }
    }
}

/// A named counter incremented by every observation of `lab` meeting the threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbnormalityRule {
    pub name: String,
    pub lab: String,
    pub comparison: Comparison,
    pub threshold: f64,
}

impl AbnormalityRule {
    pub fn new(
        name: impl Into<String>,
        lab: impl Into<String>,
        comparison: Comparison,
        threshold: f64,
    ) -> Self {
        Self {
            name: name.into(),
            lab: lab.into(),
            comparison,
            threshold,
        }
    }

    pub fn matches(&self, value: f64) -> bool {
        self.comparison.holds(value, self.threshold)
    }
}

/// A 0/1 feature that is set once a counter reaches `min_count` in a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagRule {
    pub name: String,
    pub counter: String,
    pub min_count: u64,
}

impl FlagRule {
    pub fn new(name: impl Into<String>, counter: impl Into<String>, min_count: u64) -> Self {
        Self {
            name: name.into(),
            counter: counter.into(),
            min_count,
        }
    }
}

/// Position of a rule within the configured rule list.
pub type RuleIdx = u16;

/// Rules bound to resolved lab ids, ready for per-observation evaluation.
#[derive(Debug, Clone, Default)]
pub struct AbnormalityPanel {
    rules: Vec<AbnormalityRule>,
    flags: Vec<(FlagRule, Option<RuleIdx>)>,
    by_lab: HashMap<LabId, Vec<RuleIdx>>,
}

impl AbnormalityPanel {
    pub fn new(rules: &[AbnormalityRule], flags: &[FlagRule], items: &ItemMap) -> Self {
        let mut by_lab: HashMap<LabId, Vec<RuleIdx>> = HashMap::new();
        for (idx, rule) in rules.iter().enumerate() {
            match items.lab_by_name(&rule.lab) {
                Some(lab) => by_lab.entry(lab).or_default().push(idx as RuleIdx),
                None => warn!(rule = %rule.name, lab = %rule.lab, "abnormality rule names an unresolved lab; it will never fire"),
            }
        }

        let flags = flags
            .iter()
            .map(|flag| {
                let counter = rules
                    .iter()
                    .position(|r| r.name == flag.counter)
                    .map(|i| i as RuleIdx);
                (flag.clone(), counter)
            })
            .collect();

        Self {
            rules: rules.to_vec(),
            flags,
            by_lab,
        }
    }

    pub fn rules(&self) -> &[AbnormalityRule] {
        &self.rules
    }

    /// Flag rules paired with the index of the counter they read.
    pub fn flags(&self) -> &[(FlagRule, Option<RuleIdx>)] {
        &self.flags
    }

    /// Rules for `lab` that `value` satisfies. Rules are not mutually exclusive.
    pub fn matching(&self, lab: LabId, value: f64) -> impl Iterator<Item = RuleIdx> + '_ {
        self.by_lab
            .get(&lab)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
            .iter()
            .copied()
            .filter(move |&idx| self.rules[idx as usize].matches(value))
    }
}
