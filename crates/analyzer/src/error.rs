use std::path::PathBuf;
use thiserror::Error;
use engine::AnalyzeError;

/// Problems locating or opening input files.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Input not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to list directory {path}: {source}")]
    ListDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Why a single file did not produce a summary. The rest of the run
/// continues without it.
#[derive(Debug, Error)]
pub enum FileError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Analyze(#[from] AnalyzeError),

    #[error("Worker for {name} stopped unexpectedly: {reason}")]
    Worker { name: String, reason: String },
}
