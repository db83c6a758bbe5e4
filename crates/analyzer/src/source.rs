//! Input discovery and opening, including on-the-fly gzip decompression.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use flate2::read::GzDecoder;

use crate::error::SourceError;

const LOG_EXTENSIONS: &[&str] = &[".log", ".out"];
const SKIPPED_SUFFIX: &str = ".input.log";
const GZ_SUFFIX: &str = ".gz";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFile {
    pub path: PathBuf,
    /// Unique per run; used in output file names and reports
    pub name: String,
}

/// Expand `paths` into the files to analyze. Directories are searched
/// recursively for log files; explicitly named files are always taken.
pub fn discover(paths: &[PathBuf]) -> Result<Vec<InputFile>, SourceError> {
    let mut found = Vec::new();
    for path in paths {
        if path.is_dir() {
            walk(path, &mut found)?;
        } else if path.is_file() {
            found.push(path.clone());
        } else {
            return Err(SourceError::NotFound(path.clone()));
        }
    }

    let mut seen_paths = HashSet::new();
    let mut seen_names = HashSet::new();
    let mut inputs = Vec::new();
    for path in found {
        if !seen_paths.insert(path.clone()) {
            continue;
        }
        let base = output_name(&path);
        let mut name = base.clone();
        let mut n = 2;
        while !seen_names.insert(name.clone()) {
            name = format!("{}-{}", base, n);
            n += 1;
        }
        inputs.push(InputFile { path, name });
    }
    tracing::debug!(files = inputs.len(), "discovered inputs");
    Ok(inputs)
}

fn walk(dir: &Path, found: &mut Vec<PathBuf>) -> Result<(), SourceError> {
    let list_err = |source| SourceError::ListDir { path: dir.to_path_buf(), source };
    let mut entries = std::fs::read_dir(dir)
        .map_err(list_err)?
        .map(|e| e.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(list_err)?;
    entries.sort();

    for path in entries {
        if path.is_dir() {
            walk(&path, found)?;
        } else if is_log_file(&path) {
            found.push(path);
        }
    }
    Ok(())
}

/// Whether a file found in a directory should be analyzed.
pub fn is_log_file(path: &Path) -> bool {
    let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let name = file_name.to_ascii_lowercase();
    let name = name.strip_suffix(GZ_SUFFIX).unwrap_or(&name);
    !name.ends_with(SKIPPED_SUFFIX) && LOG_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

/// File name without compression and log suffixes.
pub fn output_name(path: &Path) -> String {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let mut name = file_name.as_str();
    name = name.strip_suffix(GZ_SUFFIX).unwrap_or(name);
    name = name
        .strip_suffix(".output.log")
        .or_else(|| name.strip_suffix(".log"))
        .unwrap_or(name);
    if name.is_empty() {
        file_name
    } else {
        name.to_string()
    }
}

pub fn is_gzip(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("gz"))
}

/// Open a file for line reading, decompressing `.gz` transparently.
pub fn open(path: &Path) -> Result<Box<dyn BufRead + Send>, SourceError> {
    let file = File::open(path).map_err(|source| SourceError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    if is_gzip(path) {
        Ok(Box::new(BufReader::new(GzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, "x\n").unwrap();
        path
    }

    // ── Names ─────────────────────────────────────────────────────────

    #[test]
    fn test_output_name_strips_suffixes() {
        assert_eq!(output_name(Path::new("/a/correlator.log")), "correlator");
        assert_eq!(output_name(Path::new("/a/correlator.output.log")), "correlator");
        assert_eq!(output_name(Path::new("/a/correlator.log.gz")), "correlator");
        assert_eq!(output_name(Path::new("/a/run.out")), "run.out");
    }

    #[test]
    fn test_is_log_file() {
        assert!(is_log_file(Path::new("a.log")));
        assert!(is_log_file(Path::new("a.out")));
        assert!(is_log_file(Path::new("a.log.gz")));
        assert!(!is_log_file(Path::new("a.input.log")));
        assert!(!is_log_file(Path::new("a.txt")));
    }

    // ── Discovery ─────────────────────────────────────────────────────

    #[test]
    fn test_discover_walks_directories_sorted() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "b.log");
        touch(dir.path(), "a.log");
        touch(dir.path(), "nested/c.out");
        touch(dir.path(), "skip.input.log");
        touch(dir.path(), "notes.txt");

        let inputs = discover(&[dir.path().to_path_buf()]).unwrap();
        let names: Vec<&str> = inputs.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c.out"]);
    }

    #[test]
    fn test_explicit_file_taken_regardless_of_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = touch(dir.path(), "notes.txt");
        let inputs = discover(&[path.clone()]).unwrap();
        assert_eq!(inputs, vec![InputFile { path, name: "notes.txt".into() }]);
    }

    #[test]
    fn test_duplicate_names_made_unique() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "x/correlator.log");
        touch(dir.path(), "y/correlator.log");
        let inputs = discover(&[dir.path().to_path_buf()]).unwrap();
        let names: Vec<&str> = inputs.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["correlator", "correlator-2"]);
    }

    #[test]
    fn test_missing_input_is_an_error() {
        let err = discover(&[PathBuf::from("/definitely/not/here.log")]).unwrap_err();
        assert!(matches!(err, SourceError::NotFound(_)));
    }

    // ── Opening ───────────────────────────────────────────────────────

    #[test]
    fn test_open_decompresses_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.log.gz");
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        encoder.write_all(b"line one\nline two\n").unwrap();
        encoder.finish().unwrap();

        let mut text = String::new();
        open(&path).unwrap().read_to_string(&mut text).unwrap();
        assert_eq!(text, "line one\nline two\n");
    }
}
