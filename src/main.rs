//! Hosp Features CLI
//!
//! Longitudinal feature extraction from hospital event logs.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use hosp_features::{
    config::Config,
    create_shared_log_with_persistence,
    merge::merge_files,
    output::{write_table, OutputFormat},
    pipeline::{HistoryKind, Pipeline, LAB_TABLE, MERGED_TABLE, PRIOR_LAB_TABLE},
    RunLog, SharedRunLog, VERSION,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "hosp-features")]
#[command(version = VERSION)]
#[command(about = "Longitudinal feature extraction from hospital event logs", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the per-user config location)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the output directory
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    /// Override the output format
    #[arg(long, global = true, value_enum)]
    format: Option<OutputFormat>,

    /// Override the number of lab event rows per chunk
    #[arg(long, global = true)]
    chunk_size: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the windowed lab feature table
    Labs,

    /// Build the lab feature table over each patient's prior admissions
    PriorLabs,

    /// Build diagnosis, procedure or medication history tables
    History {
        /// Which history table to build
        #[arg(value_enum, default_value = "all")]
        kind: HistoryArg,
    },

    /// Merge CSV feature tables on subject_id
    Merge {
        /// Feature tables to merge, in order
        #[arg(required = true, num_args = 2..)]
        inputs: Vec<PathBuf>,

        /// Where to write the merged table
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Build every table and the merged table
    Run,

    /// Show the effective configuration
    Config,

    /// Write the default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show statistics of the last run
    Stats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum HistoryArg {
    Diagnoses,
    Procedures,
    Medications,
    All,
}

impl HistoryArg {
    fn kinds(self) -> Vec<HistoryKind> {
        match self {
            HistoryArg::Diagnoses => vec![HistoryKind::Diagnoses],
            HistoryArg::Procedures => vec![HistoryKind::Procedures],
            HistoryArg::Medications => vec![HistoryKind::Medications],
            HistoryArg::All => HistoryKind::ALL.to_vec(),
        }
    }
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = dispatch(cli) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn dispatch(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(Config::config_path);

    match cli.command {
        Commands::Config => cmd_config(&load_config(&cli)?, &config_path),
        Commands::InitConfig { force } => cmd_init_config(&config_path, force),
        Commands::Stats => cmd_stats(),
        Commands::Labs => {
            let config = load_config(&cli)?;
            with_pipeline(config, cmd_labs)
        }
        Commands::PriorLabs => {
            let config = load_config(&cli)?;
            with_pipeline(config, cmd_prior_labs)
        }
        Commands::History { kind } => {
            let config = load_config(&cli)?;
            with_pipeline(config, |p| cmd_history(p, kind))
        }
        Commands::Merge { ref inputs, ref output } => {
            let config = load_config(&cli)?;
            cmd_merge(&config, inputs, output.clone())
        }
        Commands::Run => {
            let config = load_config(&cli)?;
            with_pipeline(config, cmd_run)
        }
    }
}

/// Load the configuration file and apply command-line overrides.
fn load_config(cli: &Cli) -> Result<Config> {
    let path = cli.config.clone().unwrap_or_else(Config::config_path);
    let mut config = Config::load_from(&path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;

    if let Some(dir) = &cli.output_dir {
        config.paths.output_dir = dir.clone();
    }
    if let Some(format) = cli.format {
        config.output.format = format;
    }
    if let Some(chunk_size) = cli.chunk_size {
        config.labs.chunk_size = chunk_size;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Run `f` with a pipeline wired to a persisted run log and a Ctrl+C flag.
fn with_pipeline<F>(config: Config, f: F) -> Result<()>
where
    F: FnOnce(&Pipeline) -> Result<()>,
{
    let cancel = Arc::new(AtomicBool::new(false));
    ctrlc_handler(cancel.clone())?;

    let log: SharedRunLog = create_shared_log_with_persistence(Config::last_run_path());
    let pipeline = Pipeline::new(config, log.clone(), cancel);
    let result = f(&pipeline);

    if let Err(e) = log.save() {
        eprintln!("Warning: Could not save run statistics: {e}");
    }
    if result.is_ok() {
        println!();
        println!("{}", log.summary());
    }
    result
}

fn cmd_labs(pipeline: &Pipeline) -> Result<()> {
    let cohort = pipeline.load_cohort().context("failed to load cohort")?;
    let table = pipeline
        .lab_features(&cohort)
        .context("lab feature extraction failed")?;
    let path = pipeline.write(LAB_TABLE, &table)?;
    println!(
        "Lab features: {} subjects, {} columns -> {}",
        table.len(),
        table.columns.len(),
        path.display()
    );
    Ok(())
}

fn cmd_prior_labs(pipeline: &Pipeline) -> Result<()> {
    let cohort = pipeline.load_cohort().context("failed to load cohort")?;
    let table = pipeline
        .prior_lab_features(&cohort)
        .context("prior admission lab feature extraction failed")?;
    let path = pipeline.write(PRIOR_LAB_TABLE, &table)?;
    println!(
        "Prior admission lab features: {} subjects, {} columns -> {}",
        table.len(),
        table.columns.len(),
        path.display()
    );
    Ok(())
}

fn cmd_history(pipeline: &Pipeline, kind: HistoryArg) -> Result<()> {
    let cohort = pipeline.load_cohort().context("failed to load cohort")?;
    for kind in kind.kinds() {
        let name = kind.table_name();
        let table = pipeline
            .history_features(&cohort, kind)
            .with_context(|| format!("{name} history failed"))?;
        let path = pipeline.write(name, &table)?;
        println!(
            "{name}: {} subjects, {} columns -> {}",
            table.len(),
            table.columns.len(),
            path.display()
        );
    }
    Ok(())
}

fn cmd_merge(config: &Config, inputs: &[PathBuf], output: Option<PathBuf>) -> Result<()> {
    let missing = &config.output.missing_marker;
    let merged = merge_files(inputs, missing).context("failed to merge feature tables")?;
    let path = output.unwrap_or_else(|| {
        config
            .paths
            .output_dir
            .join(format!("{MERGED_TABLE}.{}", config.output.format.extension()))
    });
    write_table(&merged, &path, config.output.format, missing)?;
    println!(
        "Merged {} tables: {} subjects, {} columns -> {}",
        inputs.len(),
        merged.len(),
        merged.columns.len(),
        path.display()
    );
    Ok(())
}

fn cmd_run(pipeline: &Pipeline) -> Result<()> {
    println!("Hosp Features v{VERSION}");
    println!();
    let output = pipeline.run().context("feature run failed")?;
    println!(
        "Merged table: {} subjects, {} columns",
        output.merged_rows, output.merged_columns
    );
    for file in &output.files {
        println!("  {}", file.display());
    }
    Ok(())
}

fn cmd_config(config: &Config, path: &std::path::Path) -> Result<()> {
    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", path);
    println!();
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

fn cmd_init_config(path: &std::path::Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Config::default()
        .save_to(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn cmd_stats() -> Result<()> {
    let path = Config::last_run_path();
    if !path.exists() {
        println!("No run statistics recorded yet.");
        return Ok(());
    }
    let stats = RunLog::load_last(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    println!("Last run (started {})", stats.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("{}", stats.summary());
    Ok(())
}

/// Set the cancellation flag on Ctrl+C; the run stops before the next chunk.
fn ctrlc_handler(cancel: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        cancel.store(true, Ordering::SeqCst);
    })
    .context("Error setting Ctrl+C handler")
}
