// Status-line extraction and aggregation engine.

// Core infrastructure
pub mod error;
pub mod model;
pub mod line;
pub mod conf;

// Per-line stages
pub mod classify;
pub mod extract;
pub mod slots;
pub mod timeline;
pub mod startup;
pub mod connections;
pub mod dedup;

// Per-file pipeline
pub mod pass;
pub mod driver;
pub mod summary;

pub use conf::DescriptorSet;
pub use dedup::{merge, DedupLimits, MergedReport, Severity};
pub use driver::{analyze_lines, analyze_reader, AnalyzeOptions, FileSummary};
pub use error::{AnalyzeError, ConfigError, FileWarning};
pub use model::Value;
