//! Loading of the smaller reference and history tables.
//!
//! These tables are deserialized record by record with `serde`. Required
//! columns are checked against the header before any row is read.

use crate::error::{FeatureError, Result};
use csv::{ReaderBuilder, StringRecord, Trim};
use serde::de::DeserializeOwned;
use std::fs::File;
use std::path::Path;
use tracing::debug;

/// What to do with a row that does not deserialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowPolicy {
    /// Abort the load
    Strict,
    /// Skip the row and count it
    Skip,
}

fn ensure_columns(headers: &StringRecord, table: &'static str, required: &[&'static str]) -> Result<()> {
    for &column in required {
        if !headers.iter().any(|h| h.trim() == column) {
            return Err(FeatureError::MissingColumn { table, column });
        }
    }
    Ok(())
}

/// Stream every record of a CSV table into `visit`.
///
/// Returns the number of rows skipped under [`RowPolicy::Skip`].
pub fn for_each_record<T, F>(
    path: &Path,
    table: &'static str,
    required: &[&'static str],
    policy: RowPolicy,
    mut visit: F,
) -> Result<u64>
where
    T: DeserializeOwned,
    F: FnMut(T),
{
    let file = File::open(path).map_err(|e| FeatureError::io(path, e))?;
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(Trim::All)
        .from_reader(file);
    let headers = reader
        .headers()
        .map_err(|e| FeatureError::csv(path, e))?
        .clone();
    ensure_columns(&headers, table, required)?;

    let mut skipped = 0u64;
    let mut row = 0u64;
    for result in reader.deserialize::<T>() {
        row += 1;
        match result {
            Ok(record) => visit(record),
            Err(e) if e.is_io_error() => return Err(FeatureError::csv(path, e)),
            Err(e) => match policy {
                RowPolicy::Strict => {
                    return Err(FeatureError::MalformedRow {
                        table,
                        row,
                        reason: e.to_string(),
                    })
                }
                RowPolicy::Skip => skipped += 1,
            },
        }
    }
    debug!(table, path = %path.display(), rows = row, skipped, "loaded table");
    Ok(skipped)
}

/// Load a whole table into memory.
pub fn read_records<T: DeserializeOwned>(
    path: &Path,
    table: &'static str,
    required: &[&'static str],
    policy: RowPolicy,
) -> Result<Vec<T>> {
    let mut records = Vec::new();
    for_each_record(path, table, required, policy, |r| records.push(r))?;
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::LabItem;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_read_lab_items() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "d_labitems.csv",
            "itemid,label,fluid,category\n50912,Creatinine,Blood,Chemistry\n50931,Glucose,Blood,Chemistry\n",
        );
        let items: Vec<LabItem> =
            read_records(&path, "lab items", &["itemid", "label"], RowPolicy::Strict).unwrap();
        assert_eq!(items, vec![LabItem::new(50912, "Creatinine"), LabItem::new(50931, "Glucose")]);
    }

    #[test]
    fn test_skip_policy_counts_bad_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "items.csv", "itemid,label\nabc,Creatinine\n50931,Glucose\n");

        let mut seen = Vec::new();
        let skipped = for_each_record(&path, "lab items", &["itemid"], RowPolicy::Skip, |r: LabItem| {
            seen.push(r.item_id)
        })
        .unwrap();
        assert_eq!(skipped, 1);
        assert_eq!(seen, vec![50931]);

        let strict: Result<Vec<LabItem>> = read_records(&path, "lab items", &["itemid"], RowPolicy::Strict);
        assert!(matches!(strict, Err(FeatureError::MalformedRow { row: 1, .. })));
    }

    #[test]
    fn test_missing_column_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "items.csv", "itemid\n1\n");
        let result: Result<Vec<LabItem>> =
            read_records(&path, "lab items", &["itemid", "label"], RowPolicy::Strict);
        assert!(matches!(
            result,
            Err(FeatureError::MissingColumn { column: "label", .. })
        ));
    }
}
