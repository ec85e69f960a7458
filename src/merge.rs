//! Inner join of feature tables on subject id.

use crate::core::materialize::{FeatureRow, FeatureTable, FeatureValue};
use crate::core::types::SubjectId;
use crate::error::Result;
use crate::output::read_table;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

/// Join `tables` on subject id, keeping the first table's row order.
///
/// Only subjects present in every table survive. A feature column whose name
/// appears in more than one table is ambiguous and is dropped from the result.
/// A subject repeated within one table keeps its first row.
pub fn merge_tables(tables: &[FeatureTable]) -> FeatureTable {
    let Some((first, rest)) = tables.split_first() else {
        return FeatureTable::default();
    };

    let mut occurrences: HashMap<&str, usize> = HashMap::new();
    for table in tables {
        let mut names: Vec<&str> = table.columns.iter().map(String::as_str).collect();
        names.sort_unstable();
        names.dedup();
        for name in names {
            *occurrences.entry(name).or_insert(0) += 1;
        }
    }
    let mut dropped: Vec<&str> = occurrences
        .iter()
        .filter(|&(_, &n)| n > 1)
        .map(|(&name, _)| name)
        .collect();
    dropped.sort_unstable();
    if !dropped.is_empty() {
        warn!(columns = ?dropped, "dropping columns present in more than one table");
    }

    // Per table: indices of the columns that survive.
    let kept: Vec<Vec<usize>> = tables
        .iter()
        .map(|t| {
            t.columns
                .iter()
                .enumerate()
                .filter(|(_, c)| occurrences.get(c.as_str()) == Some(&1))
                .map(|(i, _)| i)
                .collect()
        })
        .collect();
    let columns: Vec<String> = tables
        .iter()
        .zip(&kept)
        .flat_map(|(t, idx)| idx.iter().map(move |&i| t.columns[i].clone()))
        .collect();

    let lookups: Vec<HashMap<SubjectId, &FeatureRow>> = rest
        .iter()
        .map(|t| {
            let mut map = HashMap::with_capacity(t.rows.len());
            for row in &t.rows {
                map.entry(row.subject_id).or_insert(row);
            }
            map
        })
        .collect();

    let mut merged = FeatureTable::new(columns);
    let mut emitted = std::collections::HashSet::new();
    for row in &first.rows {
        if !emitted.insert(row.subject_id) {
            continue;
        }
        let Some(others) = lookups
            .iter()
            .map(|m| m.get(&row.subject_id).copied())
            .collect::<Option<Vec<&FeatureRow>>>()
        else {
            continue;
        };

        let mut values: Vec<FeatureValue> = Vec::with_capacity(merged.columns.len());
        for (r, idx) in std::iter::once(row).chain(others).zip(&kept) {
            values.extend(idx.iter().map(|&i| r.values[i].clone()));
        }
        merged.push(row.subject_id, values);
    }

    info!(
        tables = tables.len(),
        rows = merged.len(),
        columns = merged.columns.len(),
        dropped = dropped.len(),
        "merged feature tables"
    );
    merged
}

/// Read CSV feature tables and merge them.
pub fn merge_files<P: AsRef<Path>>(paths: &[P], missing: &str) -> Result<FeatureTable> {
    let tables = paths
        .iter()
        .map(|p| read_table(p.as_ref(), missing))
        .collect::<Result<Vec<_>>>()?;
    Ok(merge_tables(&tables))
}
