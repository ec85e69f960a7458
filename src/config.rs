//! Configuration for the feature pipeline.

use crate::core::abnormality::{AbnormalityRule, Comparison, FlagRule};
use crate::core::boundaries::WindowSet;
use crate::core::materialize::{prior_columns, sanitize_name, window_columns};
use crate::core::resolver::ItemResolver;
use crate::history::CodeGroup;
use crate::output::OutputFormat;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

const APP_DIR: &str = "hosp-features";

/// Main configuration for the feature pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Input tables and output location
    pub paths: PathsConfig,

    /// Lab aggregation settings
    pub labs: LabConfig,

    /// Diagnosis, procedure and medication groupings
    pub history: HistoryConfig,

    /// Output formatting
    pub output: OutputConfig,
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, falling back to defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let config: Config =
                serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let content = serde_json::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.json")
    }

    /// Directory for run state such as the last run's statistics.
    pub fn data_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }

    pub fn last_run_path() -> PathBuf {
        Self::data_path().join("last_run.json")
    }

    /// The configured windows, in configuration order.
    pub fn window_set(&self) -> WindowSet {
        WindowSet::new(self.labs.windows_days.iter().copied())
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let labs = &self.labs;
        if labs.windows_days.is_empty() {
            return Err(ConfigError::Invalid("at least one window is required".into()));
        }
        let mut seen = HashSet::new();
        for &days in &labs.windows_days {
            if days == 0 {
                return Err(ConfigError::Invalid("window lengths must be positive".into()));
            }
            if !seen.insert(days) {
                return Err(ConfigError::Invalid(format!("window of {days} days is listed twice")));
            }
        }
        if labs.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk size must be at least 1".into()));
        }

        let mut names = HashSet::new();
        for rule in &labs.rules {
            if rule.name.trim().is_empty() {
                return Err(ConfigError::Invalid("abnormality rule without a name".into()));
            }
            if !rule.threshold.is_finite() {
                return Err(ConfigError::Invalid(format!(
                    "rule `{}` has a non-finite threshold",
                    rule.name
                )));
            }
            if !names.insert(rule.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "abnormality rule `{}` is defined twice",
                    rule.name
                )));
            }
        }
        for flag in &labs.flags {
            if !names.contains(flag.counter.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "flag `{}` reads unknown counter `{}`",
                    flag.name, flag.counter
                )));
            }
        }
        self.validate_columns()
    }

    /// Every lab column name must be unique once names are sanitized.
    /// Checked against all keywords, as if each one resolved.
    fn validate_columns(&self) -> Result<(), ConfigError> {
        let labs = &self.labs;
        let resolver = ItemResolver::new(&labs.keywords);
        let keywords: Vec<&str> = resolver.keywords().iter().map(String::as_str).collect();
        if let Some(k) = keywords.iter().find(|k| sanitize_name(k).is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "keyword `{k}` does not yield a column name"
            )));
        }
        let rules: Vec<&str> = labs.rules.iter().map(|r| r.name.as_str()).collect();
        let flags: Vec<&str> = labs.flags.iter().map(|f| f.name.as_str()).collect();

        let windowed = window_columns(&self.window_set(), &keywords, &rules, &flags);
        let prior = prior_columns(&keywords, &rules, &flags);
        for columns in [windowed, prior] {
            let mut seen = HashSet::new();
            for column in &columns {
                if !seen.insert(column.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "column `{column}` would be generated twice"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Locations of the input tables and the output directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Cohort table with one row per admission
    pub cohort: PathBuf,
    pub lab_items: PathBuf,
    pub lab_events: PathBuf,
    pub diagnoses: PathBuf,
    pub procedures: PathBuf,
    pub prescriptions: PathBuf,
    /// Directory receiving the feature tables
    pub output_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let hosp = PathBuf::from("data/raw/mimiciv/2.1/hosp");
        Self {
            cohort: PathBuf::from("data/interim/cohort.csv"),
            lab_items: hosp.join("d_labitems.csv"),
            lab_events: hosp.join("labevents.csv"),
            diagnoses: hosp.join("diagnoses_icd.csv"),
            procedures: hosp.join("procedures_icd.csv"),
            prescriptions: hosp.join("prescriptions.csv"),
            output_dir: PathBuf::from("data/processed/hosp"),
        }
    }
}

/// Lab aggregation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabConfig {
    /// Canonical lab names matched exactly against item labels
    pub keywords: Vec<String>,
    /// Window lengths in days, in output order
    pub windows_days: Vec<u32>,
    /// Rows per chunk read from the event source
    pub chunk_size: usize,
    /// Chunks read ahead by the reader thread (0 reads on the folding thread)
    pub prefetch_depth: usize,
    pub rules: Vec<AbnormalityRule>,
    pub flags: Vec<FlagRule>,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            keywords: [
                "creatinine",
                "urea nitrogen",
                "lactate",
                "white blood",
                "hemoglobin",
                "platelet",
                "hematocrit",
                "sodium",
                "potassium",
                "glucose",
                "bicarbonate",
                "bilirubin",
                "albumin",
                "bun",
                "alt",
                "ast",
            ]
            .iter()
            .map(|k| k.to_string())
            .collect(),
            windows_days: vec![365, 180, 90, 30, 7],
            chunk_size: 100_000,
            prefetch_depth: 2,
            rules: vec![
                AbnormalityRule::new("chronic_anemia", "hemoglobin", Comparison::Below, 10.0),
                AbnormalityRule::new("severe_hyponatremia", "sodium", Comparison::Below, 125.0),
                AbnormalityRule::new(
                    "chronic_kidney_disease",
                    "creatinine",
                    Comparison::AtOrAbove,
                    0.3,
                ),
            ],
            flags: vec![FlagRule::new("chronic_anemia", "chronic_anemia", 2)],
        }
    }
}

/// Code groupings for the history features.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Diagnosis conditions (ICD prefixes)
    pub conditions: Vec<CodeGroup>,
    /// Procedure groups (ICD prefixes)
    pub procedure_groups: Vec<CodeGroup>,
    /// Drug classes (case-insensitive name fragments)
    pub drug_classes: Vec<CodeGroup>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            conditions: vec![
                CodeGroup::new("chf", &["428", "I50"]),
                CodeGroup::new("diabetes", &["250", "E08"]),
                CodeGroup::new("ckd", &["585", "N18"]),
                CodeGroup::new(
                    "cancer",
                    &["140", "141", "142", "143", "144", "145", "146", "147", "148", "149", "C00", "C"],
                ),
                CodeGroup::new("copd", &["491", "492", "496", "J44"]),
                CodeGroup::new("liver_disease", &["571", "K7"]),
                CodeGroup::new("mi", &["410", "I21"]),
                CodeGroup::new("stroke", &["434", "436", "I630"]),
                CodeGroup::new("sepsis", &["99591", "99592", "A400", "A41"]),
                CodeGroup::new("aki", &["584", "N17"]),
            ],
            procedure_groups: vec![
                CodeGroup::new("major_surgery", &["361", "352", "815", "8151"]),
                CodeGroup::new("mech_vent", &["967"]),
                CodeGroup::new("dialysis", &["3995", "5498"]),
                CodeGroup::new("biopsy", &["9021", "9022", "9023"]),
            ],
            drug_classes: vec![
                CodeGroup::new("insulin", &["insulin"]),
                CodeGroup::new("diuretics", &["furosemide", "lasix"]),
                CodeGroup::new(
                    "anticoagulants",
                    &["warfarin", "heparin", "apixaban", "rivaroxaban"],
                ),
                CodeGroup::new("steroids", &["prednisone", "methylprednisolone", "dexamethasone"]),
                CodeGroup::new("chemotherapy", &["cyclophosphamide", "doxorubicin", "cisplatin"]),
            ],
        }
    }
}

/// Output formatting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Text written for a missing value in CSV output
    pub missing_marker: String,
    pub format: OutputFormat,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            missing_marker: String::new(),
            format: OutputFormat::Csv,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Parse error in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Serialize error: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.labs.windows_days, vec![365, 180, 90, 30, 7]);
        assert_eq!(config.labs.chunk_size, 100_000);
        assert_eq!(config.labs.keywords.len(), 16);
        assert_eq!(config.labs.rules.len(), 3);
        assert_eq!(config.history.conditions.len(), 10);
        assert_eq!(config.output.format, OutputFormat::Csv);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = Config::default();
        config.labs.windows_days = vec![30, 7];
        config.output.missing_marker = "NA".into();
        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"labs": {"windows_days": [14]}, "output": {"format": "jsonl"}}"#)
            .unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.labs.windows_days, vec![14]);
        assert_eq!(config.labs.chunk_size, 100_000);
        assert_eq!(config.output.format, OutputFormat::Jsonl);
        assert_eq!(config.paths, PathsConfig::default());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = Config::load_from(Path::new("/nonexistent/hosp-features.json")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.labs.windows_days = vec![30, 30];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.labs.windows_days = vec![0];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.labs.chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.labs.rules[0].threshold = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.labs.flags.push(FlagRule::new("x", "no_such_rule", 1));
        assert!(config.validate().is_err());
    }

    fn invalid_message(config: &Config) -> String {
        match config.validate() {
            Err(ConfigError::Invalid(message)) => message,
            other => panic!("expected invalid config, got {other:?}"),
        }
    }

    #[test]
    fn test_keywords_sanitizing_to_same_column_are_rejected() {
        let mut config = Config::default();
        config.labs.keywords.push("white-blood".into());
        let message = invalid_message(&config);
        assert!(message.contains("white_blood"), "{message}");

        // same keyword after normalization is deduplicated, not an error
        let mut config = Config::default();
        config.labs.keywords.push(" White Blood ".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rule_name_colliding_with_fixed_column_is_rejected() {
        let mut config = Config::default();
        config
            .labs
            .rules
            .push(AbnormalityRule::new("unique_labs", "sodium", Comparison::Below, 120.0));
        let message = invalid_message(&config);
        assert!(message.contains("count_unique_labs"), "{message}");

        let mut config = Config::default();
        config
            .labs
            .rules
            .push(AbnormalityRule::new("labevents", "sodium", Comparison::Below, 120.0));
        let message = invalid_message(&config);
        assert!(message.contains("count_labevents"), "{message}");
    }

    #[test]
    fn test_duplicate_flag_names_are_rejected() {
        let mut config = Config::default();
        config.labs.flags.push(FlagRule::new("Chronic Anemia", "chronic_anemia", 3));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_keyword_without_column_characters_is_rejected() {
        let mut config = Config::default();
        config.labs.keywords.push("%%".into());
        assert!(config.validate().is_err());
    }
}
