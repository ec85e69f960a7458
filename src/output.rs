//! Feature table output and read-back.
//!
//! Tables are written to a temporary sibling and renamed into place once the
//! last row is flushed, so a failed run never leaves a partial file behind.

use crate::core::materialize::{FeatureRow, FeatureTable, FeatureValue, SUBJECT_ID_COLUMN};
use crate::core::types::SubjectId;
use crate::error::{FeatureError, Result};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// File format of a written feature table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Comma-separated values with a header row
    #[default]
    Csv,
    /// One JSON object per line; missing values are `null`
    Jsonl,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Jsonl => "jsonl",
        }
    }
}

/// Serializes one row as an ordered JSON object.
struct JsonRow<'a> {
    columns: &'a [String],
    row: &'a FeatureRow,
}

impl Serialize for JsonRow<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len() + 1))?;
        map.serialize_entry(SUBJECT_ID_COLUMN, &self.row.subject_id)?;
        for (column, value) in self.columns.iter().zip(&self.row.values) {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn write_csv(table: &FeatureTable, file: File, missing: &str, path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_writer(BufWriter::new(file));
    writer
        .write_record(table.header())
        .map_err(|e| FeatureError::csv(path, e))?;
    for row in &table.rows {
        let record = std::iter::once(row.subject_id.to_string())
            .chain(row.values.iter().map(|v| v.render(missing)));
        writer
            .write_record(record)
            .map_err(|e| FeatureError::csv(path, e))?;
    }
    writer.flush().map_err(|e| FeatureError::io(path, e))
}

fn write_jsonl(table: &FeatureTable, file: File, path: &Path) -> Result<()> {
    let mut writer = BufWriter::new(file);
    for row in &table.rows {
        serde_json::to_writer(
            &mut writer,
            &JsonRow {
                columns: &table.columns,
                row,
            },
        )?;
        writer.write_all(b"\n").map_err(|e| FeatureError::io(path, e))?;
    }
    writer.flush().map_err(|e| FeatureError::io(path, e))
}

/// Write `table` to `path` atomically. Returns the number of rows written.
pub fn write_table(
    table: &FeatureTable,
    path: &Path,
    format: OutputFormat,
    missing: &str,
) -> Result<u64> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| FeatureError::io(parent, e))?;
    }
    let tmp = temp_path(path);
    let file = File::create(&tmp).map_err(|e| FeatureError::io(&tmp, e))?;

    let written = match format {
        OutputFormat::Csv => write_csv(table, file, missing, &tmp),
        OutputFormat::Jsonl => write_jsonl(table, file, &tmp),
    };
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    fs::rename(&tmp, path).map_err(|e| FeatureError::io(path, e))?;

    info!(
        path = %path.display(),
        rows = table.len(),
        columns = table.columns.len() + 1,
        format = format.extension(),
        "wrote feature table"
    );
    Ok(table.len() as u64)
}

/// Parse one CSV cell back into a feature value.
pub fn parse_cell(raw: &str, missing: &str) -> FeatureValue {
    let raw = raw.trim();
    if raw.is_empty() || raw == missing {
        return FeatureValue::Missing;
    }
    if let Ok(v) = raw.parse::<i64>() {
        return FeatureValue::Int(v);
    }
    match raw.parse::<f64>() {
        Ok(v) if v.is_nan() => FeatureValue::Missing,
        Ok(v) => FeatureValue::Float(v),
        Err(_) => FeatureValue::Text(raw.to_string()),
    }
}

/// Read a CSV feature table whose first column is the subject id.
pub fn read_table(path: &Path, missing: &str) -> Result<FeatureTable> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| FeatureError::csv(path, e))?;
    let headers = reader
        .headers()
        .map_err(|e| FeatureError::csv(path, e))?
        .clone();

    let key = headers
        .iter()
        .position(|h| h.trim() == SUBJECT_ID_COLUMN)
        .ok_or(FeatureError::MissingColumn {
            table: "feature",
            column: SUBJECT_ID_COLUMN,
        })?;
    let columns: Vec<String> = headers
        .iter()
        .enumerate()
        .filter(|&(i, _)| i != key)
        .map(|(_, h)| h.trim().to_string())
        .collect();

    let mut table = FeatureTable::new(columns);
    for (i, record) in reader.records().enumerate() {
        let record = record.map_err(|e| FeatureError::csv(path, e))?;
        let subject: SubjectId = record
            .get(key)
            .unwrap_or_default()
            .trim()
            .parse()
            .map_err(|_| FeatureError::MalformedRow {
                table: "feature",
                row: i as u64 + 1,
                reason: format!("bad subject id {:?}", record.get(key).unwrap_or_default()),
            })?;
        let values = (0..record.len())
            .filter(|&c| c != key)
            .map(|c| parse_cell(record.get(c).unwrap_or_default(), missing))
            .collect();
        table.push(subject, values);
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> FeatureTable {
        let mut table = FeatureTable::new(vec!["a_count".into(), "a_avg".into(), "label".into()]);
        table.push(
            1,
            vec![
                FeatureValue::Int(2),
                FeatureValue::Float(0.75),
                FeatureValue::Text("x".into()),
            ],
        );
        table.push(
            2,
            vec![FeatureValue::Int(0), FeatureValue::Missing, FeatureValue::Missing],
        );
        table
    }

    #[test]
    fn test_csv_output_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("labs.csv");
        let written = write_table(&table(), &path, OutputFormat::Csv, "").unwrap();
        assert_eq!(written, 2);
        assert!(!temp_path(&path).exists());

        let text = fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("subject_id,a_count,a_avg,label"));
        assert_eq!(lines.next(), Some("1,2,0.75,x"));
        assert_eq!(lines.next(), Some("2,0,,"));

        assert_eq!(read_table(&path, "").unwrap(), table());
    }

    #[test]
    fn test_missing_marker_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labs.csv");
        write_table(&table(), &path, OutputFormat::Csv, "NA").unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("2,0,NA,NA"));
        assert_eq!(read_table(&path, "NA").unwrap().value(2, "a_avg"), Some(&FeatureValue::Missing));
    }

    #[test]
    fn test_jsonl_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labs.jsonl");
        write_table(&table(), &path, OutputFormat::Jsonl, "").unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], r#"{"subject_id":1,"a_count":2,"a_avg":0.75,"label":"x"}"#);
        assert_eq!(lines[1], r#"{"subject_id":2,"a_count":0,"a_avg":null,"label":null}"#);
    }

    #[test]
    fn test_parse_cell() {
        assert_eq!(parse_cell("", ""), FeatureValue::Missing);
        assert_eq!(parse_cell("NaN", ""), FeatureValue::Missing);
        assert_eq!(parse_cell("3", ""), FeatureValue::Int(3));
        assert_eq!(parse_cell("1.5", ""), FeatureValue::Float(1.5));
        assert_eq!(parse_cell("M", ""), FeatureValue::Text("M".into()));
    }

    #[test]
    fn test_read_requires_subject_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        fs::write(&path, "id,x\n1,2\n").unwrap();
        assert!(matches!(
            read_table(&path, ""),
            Err(FeatureError::MissingColumn { .. })
        ));
    }
}
