//! Worker pool — one blocking task per file, bounded by a semaphore.
//!
//! Files share nothing while they are analyzed. Once every worker has
//! finished, the per-file fingerprint tables are merged on this task.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use engine::{analyze_reader, merge, AnalyzeOptions, DescriptorSet, FileSummary, MergedReport};

use crate::error::FileError;
use crate::source::{self, InputFile};

#[derive(Debug)]
pub struct FailedFile {
    pub input: InputFile,
    pub error: FileError,
}

#[derive(Debug)]
pub struct RunOutput {
    /// Successful files, in input order
    pub files: Vec<FileSummary>,
    pub failed: Vec<FailedFile>,
    pub report: MergedReport,
}

fn analyze_file(
    input: &InputFile,
    set: &DescriptorSet,
    options: &AnalyzeOptions,
) -> Result<FileSummary, FileError> {
    let reader = source::open(&input.path)?;
    Ok(analyze_reader(&input.name, &input.path, reader, set, options)?)
}

pub async fn run(
    inputs: Vec<InputFile>,
    set: Arc<DescriptorSet>,
    options: AnalyzeOptions,
    max_concurrent: usize,
) -> RunOutput {
    let started = Instant::now();
    let total = inputs.len();
    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let mut in_flight = JoinSet::new();

    for (index, input) in inputs.into_iter().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        let set = Arc::clone(&set);
        in_flight.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    let error = FileError::Worker { name: input.name.clone(), reason: e.to_string() };
                    return (index, input, Err(error));
                }
            };
            let worker_input = input.clone();
            let result = tokio::task::spawn_blocking(move || analyze_file(&worker_input, &set, &options))
                .await
                .unwrap_or_else(|e| {
                    Err(FileError::Worker { name: input.name.clone(), reason: e.to_string() })
                });
            (index, input, result)
        });
    }

    let mut outcomes = Vec::with_capacity(total);
    while let Some(joined) = in_flight.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            // The task body cannot panic outside spawn_blocking, which is handled above
            Err(e) => error!(error = %e, "file task failed"),
        }
    }
    outcomes.sort_by_key(|(index, _, _)| *index);

    let mut files = Vec::with_capacity(outcomes.len());
    let mut failed = Vec::new();
    for (_, input, result) in outcomes {
        match result {
            Ok(summary) => files.push(summary),
            Err(error) => {
                error!(file = %input.path.display(), error = %error, "file analysis failed");
                failed.push(FailedFile { input, error });
            }
        }
    }

    let report = merge(files.iter().map(|f| &f.fingerprints), options.dedup.max_unique);
    if report.warnings_truncated || report.errors_truncated {
        warn!(
            limit = options.dedup.max_unique,
            "some warning/error fingerprints were left out of the report"
        );
    }
    info!(
        files = files.len(),
        failed = failed.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "all files analyzed"
    );
    RunOutput { files, failed, report }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const BANNER: &str = "2019-04-08 13:00:00.000 ##### [1] - Correlator, version 10.5.0.0, started.";

    fn write_log(dir: &Path, name: &str, lines: &[String]) -> InputFile {
        let path = dir.join(format!("{}.log", name));
        std::fs::write(&path, lines.join("\n")).unwrap();
        InputFile { path, name: name.to_string() }
    }

    fn line(secs: u32, level: &str, message: &str) -> String {
        format!("2019-04-08 13:00:{:02}.000 {:<5} [1] - {}", secs, level, message)
    }

    #[tokio::test]
    async fn test_files_analyzed_in_input_order() {
        let dir = tempfile::tempdir().unwrap();
        let inputs: Vec<InputFile> = (0..4)
            .map(|i| {
                write_log(
                    dir.path(),
                    &format!("f{}", i),
                    &[
                        BANNER.to_string(),
                        line(1, "INFO", &format!("Correlator Status: rx={}", i)),
                        line(2, "INFO", &format!("Correlator Status: rx={}", i + 10)),
                    ],
                )
            })
            .collect();

        let out = run(inputs, Arc::new(DescriptorSet::builtin()), AnalyzeOptions::default(), 2).await;
        let names: Vec<&str> = out.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["f0", "f1", "f2", "f3"]);
        assert!(out.failed.is_empty());
        assert!(out.files.iter().all(|f| f.ticks.len() == 2));
    }

    #[tokio::test]
    async fn test_failed_file_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_log(
            dir.path(),
            "good",
            &[BANNER.to_string(), line(1, "WARN", "Disk is slow")],
        );
        let missing = InputFile { path: dir.path().join("gone.log"), name: "gone".into() };

        let out = run(vec![missing, good], Arc::new(DescriptorSet::builtin()), AnalyzeOptions::default(), 4).await;
        assert_eq!(out.files.len(), 1);
        assert_eq!(out.failed.len(), 1);
        assert_eq!(out.failed[0].input.name, "gone");
        assert!(matches!(out.failed[0].error, FileError::Source(_)));
        // only the good file contributes to the merged report
        assert_eq!(out.report.warnings.len(), 1);
        assert_eq!(out.report.warnings[0].observations[0].file, "good");
    }

    #[tokio::test]
    async fn test_fingerprints_merged_across_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_log(dir.path(), "a", &[BANNER.to_string(), line(1, "ERROR", "Lost connection 17")]);
        let b = write_log(
            dir.path(),
            "b",
            &[
                BANNER.to_string(),
                line(1, "ERROR", "Lost connection 4"),
                line(3, "ERROR", "Lost connection 9"),
            ],
        );

        let out = run(vec![a, b], Arc::new(DescriptorSet::builtin()), AnalyzeOptions::default(), 2).await;
        assert_eq!(out.report.errors.len(), 1);
        assert_eq!(out.report.errors[0].total, 3);
    }
}
