use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use engine::dedup::{DEFAULT_MAX_SAMPLES, DEFAULT_MAX_UNIQUE};
use engine::slots::DEFAULT_BUDGET_CEILING;
use engine::{AnalyzeOptions, DedupLimits, DescriptorSet};

const ENV_PREFIX: &str = "ANALYZER";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerSettings {
    pub output_dir: PathBuf,
    /// Also write the merged warnings/errors as JSON
    pub json: bool,
    /// Primary ticks in the first N percent of each file are dropped
    pub skip_percent: f64,
    pub max_concurrent_files: usize,
    pub key_budget_ceiling: usize,
    /// Unique warn/error fingerprints kept per run; 0 = unlimited
    pub max_unique: usize,
    /// Sample lines per fingerprint and file; 0 = unlimited
    pub max_samples: usize,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive when RUST_LOG is unset
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("log_analyzer_output"),
            json: false,
            skip_percent: 0.0,
            max_concurrent_files: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            key_budget_ceiling: DEFAULT_BUDGET_CEILING,
            max_unique: DEFAULT_MAX_UNIQUE,
            max_samples: DEFAULT_MAX_SAMPLES,
            logging: LoggingSettings::default(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "analyzer=info,engine=info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl AnalyzerSettings {
    /// Defaults overridden by `ANALYZER_*` environment variables (a `.env`
    /// file is honoured). Nested keys use a double underscore:
    /// `ANALYZER_LOGGING__FORMAT=json`.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_vars(None)
    }

    /// Like [`from_env`](Self::from_env), reading `vars` instead of the
    /// process environment when given.
    pub fn from_vars(vars: Option<::config::Map<String, String>>) -> Result<Self> {
        let defaults = ::config::Config::try_from(&AnalyzerSettings::default())
            .context("Failed to serialize default settings")?;

        ::config::Config::builder()
            .add_source(defaults)
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(vars),
            )
            .build()
            .context("Failed to build settings")?
            .try_deserialize()
            .context("Failed to deserialize settings")
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..100.0).contains(&self.skip_percent) {
            bail!("skip_percent must be in [0, 100), got {}", self.skip_percent);
        }
        if self.max_concurrent_files == 0 {
            bail!("max_concurrent_files must be > 0");
        }
        if self.key_budget_ceiling == 0 {
            bail!("key_budget_ceiling must be > 0");
        }
        if self.output_dir.as_os_str().is_empty() {
            bail!("output_dir must not be empty");
        }
        Ok(())
    }

    pub fn analyze_options(&self) -> AnalyzeOptions {
        AnalyzeOptions {
            skip_percent: self.skip_percent,
            key_budget_ceiling: self.key_budget_ceiling,
            dedup: DedupLimits {
                max_unique: self.max_unique,
                max_samples: self.max_samples,
            },
        }
    }
}

/// Load and validate the descriptor document at `path`; TOML when the
/// extension says so, JSON otherwise. Without a path only the built-in
/// status line is known.
pub fn load_descriptors(path: Option<&Path>) -> Result<DescriptorSet> {
    let Some(path) = path else {
        return Ok(DescriptorSet::builtin());
    };
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read descriptor config {}", path.display()))?;
    let is_toml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("toml"));
    let set = if is_toml {
        DescriptorSet::from_toml_str(&contents)
    } else {
        DescriptorSet::from_json_str(&contents)
    }
    .with_context(|| format!("Invalid descriptor config {}", path.display()))?;

    tracing::info!(path = %path.display(), descriptors = set.len(), "loaded descriptor config");
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Option<::config::Map<String, String>> {
        Some(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
    }

    // ── Defaults ──────────────────────────────────────────────────────

    #[test]
    fn test_defaults() {
        let s = AnalyzerSettings::default();
        assert_eq!(s.max_unique, 1000);
        assert_eq!(s.max_samples, 5);
        assert_eq!(s.skip_percent, 0.0);
        assert!(!s.json);
        assert!(s.max_concurrent_files > 0);
        assert_eq!(s.logging.format, LogFormat::Pretty);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_empty_environment_gives_defaults() {
        assert_eq!(AnalyzerSettings::from_vars(vars(&[])).unwrap(), AnalyzerSettings::default());
    }

    // ── Environment ───────────────────────────────────────────────────

    #[test]
    fn test_environment_overrides() {
        let s = AnalyzerSettings::from_vars(vars(&[
            ("ANALYZER_OUTPUT_DIR", "/tmp/out"),
            ("ANALYZER_JSON", "true"),
            ("ANALYZER_SKIP_PERCENT", "12.5"),
            ("ANALYZER_MAX_CONCURRENT_FILES", "3"),
            ("ANALYZER_MAX_UNIQUE", "0"),
            ("ANALYZER_LOGGING__FORMAT", "json"),
        ]))
        .unwrap();
        assert_eq!(s.output_dir, PathBuf::from("/tmp/out"));
        assert!(s.json);
        assert_eq!(s.skip_percent, 12.5);
        assert_eq!(s.max_concurrent_files, 3);
        assert_eq!(s.max_unique, 0);
        assert_eq!(s.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_unparseable_value_is_an_error() {
        assert!(AnalyzerSettings::from_vars(vars(&[("ANALYZER_MAX_SAMPLES", "lots")])).is_err());
    }

    // ── Validation ────────────────────────────────────────────────────

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut s = AnalyzerSettings::default();
        s.skip_percent = 100.0;
        assert!(s.validate().is_err());

        let mut s = AnalyzerSettings::default();
        s.max_concurrent_files = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_analyze_options_carry_limits() {
        let mut s = AnalyzerSettings::default();
        s.max_unique = 7;
        s.max_samples = 2;
        s.skip_percent = 10.0;
        let options = s.analyze_options();
        assert_eq!(options.dedup.max_unique, 7);
        assert_eq!(options.dedup.max_samples, 2);
        assert_eq!(options.skip_percent, 10.0);
    }

    // ── Descriptor documents ──────────────────────────────────────────

    #[test]
    fn test_load_descriptors_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("extra.json");
        std::fs::write(&json, r#"{"userStatusLines": {"JMS Status:": {"fieldPrefix": "jms."}}}"#).unwrap();
        let toml = dir.path().join("extra.toml");
        std::fs::write(&toml, "[userStatusLines.\"JMS Status:\"]\nfieldPrefix = \"jms.\"\n").unwrap();

        assert_eq!(load_descriptors(Some(&json)).unwrap().len(), 2);
        assert_eq!(load_descriptors(Some(&toml)).unwrap().len(), 2);
        assert_eq!(load_descriptors(None).unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_descriptor_document_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"userStatusLines": {"X": {"keyRegex": "("}}}"#).unwrap();
        let err = load_descriptors(Some(&path)).unwrap_err();
        assert!(format!("{:#}", err).contains("keyRegex"));
    }
}
