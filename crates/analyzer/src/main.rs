mod boot;
mod config;
mod error;
mod report;
mod runner;
mod source;

use std::path::PathBuf;
use std::sync::Arc;
use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};

use crate::config::{load_descriptors, AnalyzerSettings, LogFormat};

#[derive(Parser, Debug)]
#[command(
    name = "analyzer",
    version,
    about = "Extracts status-line timelines, startup details and deduplicated warnings/errors from correlator logs"
)]
struct Cli {
    /// Log files, directories to search, or .gz archives
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// JSON or TOML document with userStatusLines/userCharts
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Directory for all output files
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Also write merged warnings/errors as JSON
    #[arg(long)]
    json: bool,

    /// Ignore status lines in the first N percent of each file
    #[arg(long)]
    skip_percent: Option<f64>,

    /// Number of files analyzed at once
    #[arg(long)]
    max_concurrent_files: Option<usize>,

    /// Unique warning/error messages to keep (0 = unlimited)
    #[arg(long)]
    max_unique: Option<usize>,

    /// Sample lines per message and file (0 = unlimited)
    #[arg(long)]
    max_samples: Option<usize>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,

    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

impl Cli {
    /// Flags win over environment and defaults.
    fn apply(&self, settings: &mut AnalyzerSettings) {
        if let Some(dir) = &self.output {
            settings.output_dir = dir.clone();
        }
        settings.json |= self.json;
        if let Some(v) = self.skip_percent {
            settings.skip_percent = v;
        }
        if let Some(v) = self.max_concurrent_files {
            settings.max_concurrent_files = v;
        }
        if let Some(v) = self.max_unique {
            settings.max_unique = v;
        }
        if let Some(v) = self.max_samples {
            settings.max_samples = v;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level = level.clone();
        }
        if let Some(format) = self.log_format {
            settings.logging.format = format;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Phase 1: logging for settings and descriptor loading
    let basic_guard = boot::init_tracing_basic();

    let mut settings = AnalyzerSettings::from_env().context("Failed to load settings")?;
    cli.apply(&mut settings);
    settings.validate().context("Invalid settings")?;

    // Descriptor problems are fatal before any file is read
    let descriptors = load_descriptors(cli.config.as_deref())?;
    let inputs = source::discover(&cli.inputs).context("Failed to find input files")?;

    // Phase 2: the global subscriber
    drop(basic_guard);
    boot::init_tracing(&settings.logging);

    if inputs.is_empty() {
        bail!("No log files found in the given inputs");
    }
    info!(
        files = inputs.len(),
        descriptors = descriptors.len(),
        output = %settings.output_dir.display(),
        max_concurrent = settings.max_concurrent_files,
        "analyzing"
    );

    let run = runner::run(
        inputs,
        Arc::new(descriptors),
        settings.analyze_options(),
        settings.max_concurrent_files,
    )
    .await;

    report::write_all(&settings.output_dir, &run, settings.json, settings.max_unique)
        .context("Failed to write outputs")?;

    if !run.failed.is_empty() {
        warn!(failed = run.failed.len(), "some files could not be analyzed");
        if run.files.is_empty() {
            bail!("None of the {} input files could be analyzed", run.failed.len());
        }
    }
    info!(output = %settings.output_dir.display(), "done");
    Ok(())
}
