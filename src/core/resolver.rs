//! Item resolution: raw lab item ids to canonical lab names.
//!
//! A label qualifies only when its normalized text equals a keyword exactly.
//! Substring matching would let "glucose" also claim "glucose, csf".

use crate::core::types::ItemId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

/// Interned canonical lab name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LabId(pub u16);

impl LabId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One row of the reference item table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabItem {
    #[serde(rename = "itemid")]
    pub item_id: ItemId,
    #[serde(default)]
    pub label: String,
}

impl LabItem {
    pub fn new(item_id: ItemId, label: impl Into<String>) -> Self {
        Self {
            item_id,
            label: label.into(),
        }
    }
}

/// Case normalization shared by labels and keywords.
pub fn normalize_label(label: &str) -> String {
    label.trim().to_lowercase()
}

/// Resolves reference item tables against a keyword list.
#[derive(Debug, Clone)]
pub struct ItemResolver {
    keywords: Vec<String>,
    positions: HashMap<String, usize>,
}

impl ItemResolver {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ordered = Vec::new();
        let mut positions = HashMap::new();
        for keyword in keywords {
            let keyword = normalize_label(keyword.as_ref());
            if keyword.is_empty() || positions.contains_key(&keyword) {
                continue;
            }
            positions.insert(keyword.clone(), ordered.len());
            ordered.push(keyword);
        }
        Self {
            keywords: ordered,
            positions,
        }
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    /// Build the item map. Duplicate item ids keep their first-seen label,
    /// even when that label does not qualify.
    pub fn resolve<I>(&self, items: I) -> ItemMap
    where
        I: IntoIterator<Item = LabItem>,
    {
        let mut seen: HashSet<ItemId> = HashSet::new();
        let mut matched: Vec<(ItemId, usize)> = Vec::new();
        let mut scanned = 0usize;

        for item in items {
            scanned += 1;
            if !seen.insert(item.item_id) {
                continue;
            }
            if let Some(&pos) = self.positions.get(&normalize_label(&item.label)) {
                matched.push((item.item_id, pos));
            }
        }

        // Lab ids follow keyword order, restricted to keywords that matched.
        let mut used: Vec<usize> = matched.iter().map(|&(_, pos)| pos).collect();
        used.sort_unstable();
        used.dedup();
        let lab_of_keyword: HashMap<usize, LabId> = used
            .iter()
            .enumerate()
            .map(|(i, &pos)| (pos, LabId(i as u16)))
            .collect();

        let labs: Vec<String> = used.iter().map(|&pos| self.keywords[pos].clone()).collect();
        let by_item: HashMap<ItemId, LabId> = matched
            .into_iter()
            .map(|(item, pos)| (item, lab_of_keyword[&pos]))
            .collect();

        if by_item.is_empty() {
            warn!(
                scanned,
                keywords = self.keywords.len(),
                "no lab items matched any keyword"
            );
        } else {
            info!(
                scanned,
                items = by_item.len(),
                labs = labs.len(),
                "resolved lab items"
            );
        }

        ItemMap { by_item, labs }
    }
}

/// Many-to-one mapping from item id to canonical lab name.
#[derive(Debug, Clone, Default)]
pub struct ItemMap {
    by_item: HashMap<ItemId, LabId>,
    labs: Vec<String>,
}

impl ItemMap {
    pub fn lab_id(&self, item: ItemId) -> Option<LabId> {
        self.by_item.get(&item).copied()
    }

    pub fn lab_name(&self, item: ItemId) -> Option<&str> {
        self.lab_id(item).map(|id| self.name(id))
    }

    pub fn name(&self, lab: LabId) -> &str {
        &self.labs[lab.index()]
    }

    pub fn lab_by_name(&self, name: &str) -> Option<LabId> {
        let name = normalize_label(name);
        self.labs
            .iter()
            .position(|l| *l == name)
            .map(|i| LabId(i as u16))
    }

    /// Canonical names that resolved at least one item, in keyword order.
    pub fn labs(&self) -> &[String] {
        &self.labs
    }

    pub fn lab_ids(&self) -> impl Iterator<Item = LabId> + '_ {
        (0..self.labs.len()).map(|i| LabId(i as u16))
    }

    /// Item ids mapped to a lab, sorted ascending.
    pub fn items_for(&self, lab: LabId) -> Vec<ItemId> {
        let mut items: Vec<ItemId> = self
            .by_item
            .iter()
            .filter(|(_, &l)| l == lab)
            .map(|(&item, _)| item)
            .collect();
        items.sort_unstable();
        items
    }

    pub fn len(&self) -> usize {
        self.by_item.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_item.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_table() -> Vec<LabItem> {
        vec![
            LabItem::new(50931, "Glucose"),
            LabItem::new(50809, "GLUCOSE"),
            LabItem::new(51790, "Glucose, CSF"),
            LabItem::new(50912, "Creatinine"),
            LabItem::new(51222, "Hemoglobin"),
            LabItem::new(51000, "Triglycerides"),
        ]
    }

    #[test]
    fn test_exact_match_is_many_to_one() {
        let resolver = ItemResolver::new(["glucose", "creatinine"]);
        let map = resolver.resolve(reference_table());

        assert_eq!(map.lab_name(50931), Some("glucose"));
        assert_eq!(map.lab_name(50809), Some("glucose"));
        assert_eq!(map.lab_name(50912), Some("creatinine"));
        assert_eq!(map.items_for(map.lab_by_name("glucose").unwrap()), vec![50809, 50931]);
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn test_substring_labels_do_not_match() {
        let resolver = ItemResolver::new(["glucose"]);
        let map = resolver.resolve(reference_table());
        assert_eq!(map.lab_name(51790), None);
    }

    #[test]
    fn test_duplicate_item_keeps_first_label() {
        let resolver = ItemResolver::new(["creatinine", "sodium"]);
        let map = resolver.resolve(vec![
            LabItem::new(1, "Sodium"),
            LabItem::new(1, "Creatinine"),
            LabItem::new(2, "Potassium"),
            LabItem::new(2, "Creatinine"),
        ]);

        assert_eq!(map.lab_name(1), Some("sodium"));
        // first label for item 2 does not qualify, so the later one is ignored
        assert_eq!(map.lab_name(2), None);
        assert_eq!(map.labs(), &["sodium".to_string()]);
    }

    #[test]
    fn test_labs_follow_keyword_order() {
        let resolver = ItemResolver::new(["hemoglobin", "sodium", "glucose", "creatinine"]);
        let map = resolver.resolve(reference_table());
        assert_eq!(map.labs(), &["hemoglobin", "glucose", "creatinine"]);
        assert_eq!(map.lab_by_name("Creatinine"), Some(LabId(2)));
    }

    #[test]
    fn test_zero_matches_is_not_an_error() {
        let resolver = ItemResolver::new(["lactate"]);
        let map = resolver.resolve(reference_table());
        assert!(map.is_empty());
        assert!(map.labs().is_empty());
    }
}
