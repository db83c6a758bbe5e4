use std::path::PathBuf;
use serde::Serialize;
use thiserror::Error;

/// A descriptor configuration that cannot be used. Fatal before any file is
/// parsed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid descriptor document: {0}")]
    Parse(String),

    #[error("Status line trigger is empty")]
    EmptyTrigger,

    #[error("Two status lines share the trigger '{0}'")]
    AmbiguousTrigger(String),

    #[error("Invalid keyRegex for '{descriptor}': {reason}")]
    InvalidRegex { descriptor: String, reason: String },

    #[error("keyRegex for '{0}' has no named group 'key'")]
    MissingKeyGroup(String),

    #[error("maxKeysToAllocateColumnsFor for '{0}' must be at least 1")]
    InvalidBudget(String),

    #[error("maxKeysToAllocateColumnsFor for '{0}' requires a keyRegex")]
    BudgetWithoutKey(String),

    #[error("Unknown computed field '{field}' in '{descriptor}'")]
    InvalidComputedField { descriptor: String, field: String },

    #[error("Alias '{alias}' is used twice in '{descriptor}'")]
    DuplicateAlias { descriptor: String, alias: String },
}

/// Failure of one file's pipeline. Other files are unaffected.
#[derive(Debug, Error)]
pub enum AnalyzeError {
    #[error("Failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Degraded-capability conditions recorded on a file's summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileWarning {
    /// Key cardinality exceeded the budget ceiling; the descriptor's columns
    /// are omitted for this file.
    DescriptorDisabled { descriptor: String, budget: usize, ceiling: usize },
    /// Tokens without `key=value` shape were skipped.
    MalformedFields { descriptor: String, lines: usize, tokens: usize },
    MissingStartupStanza,
    /// Statistics need at least two primary status lines.
    TooFewStatusLines { count: usize },
    /// New fingerprints beyond the limit were counted but not retained.
    FingerprintLimitReached { limit: usize },
    /// Secondary records logged after the last primary status line.
    UnattachedSecondaryRecords { count: usize },
}

impl std::fmt::Display for FileWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileWarning::DescriptorDisabled { descriptor, budget, ceiling } => write!(
                f,
                "'{}' disabled: more keys than the ceiling of {} (last budget {})",
                descriptor, ceiling, budget
            ),
            FileWarning::MalformedFields { descriptor, lines, tokens } => write!(
                f,
                "'{}': skipped {} malformed field(s) on {} line(s)",
                descriptor, tokens, lines
            ),
            FileWarning::MissingStartupStanza => {
                write!(f, "no startup stanza; instance metadata unavailable")
            }
            FileWarning::TooFewStatusLines { count } => {
                write!(f, "only {} status line(s); no statistics", count)
            }
            FileWarning::FingerprintLimitReached { limit } => {
                write!(f, "more than {} unique warn/error messages", limit)
            }
            FileWarning::UnattachedSecondaryRecords { count } => {
                write!(f, "{} status line(s) after the last primary status line", count)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_messages() {
        let err = ConfigError::AmbiguousTrigger("JMS Status".into());
        assert_eq!(err.to_string(), "Two status lines share the trigger 'JMS Status'");
        let err = ConfigError::MissingKeyGroup("Receiver".into());
        assert!(err.to_string().contains("'key'"));
    }

    #[test]
    fn test_warning_serializes_with_kind_tag() {
        let w = FileWarning::TooFewStatusLines { count: 1 };
        assert_eq!(
            serde_json::to_string(&w).unwrap(),
            r#"{"kind":"too_few_status_lines","count":1}"#
        );
        assert_eq!(
            serde_json::to_string(&FileWarning::MissingStartupStanza).unwrap(),
            r#"{"kind":"missing_startup_stanza"}"#
        );
    }
}
