//! Dedup — group recurring warnings and errors by a normalized fingerprint.
//!
//! Each file's pipeline builds its own [`FingerprintTable`]; [`merge`] folds
//! the finished tables into one report after every file is done.

use std::collections::{BTreeMap, HashMap, VecDeque};
use chrono::NaiveDateTime;
use serde::Serialize;

use crate::line::{Level, LogLine};

/// Quoted or colon-delimited text longer than this is treated as payload.
pub const LONG_TEXT_THRESHOLD: usize = 48;

pub const DEFAULT_MAX_UNIQUE: usize = 1000;
pub const DEFAULT_MAX_SAMPLES: usize = 5;

const ELIDED: &str = "...";
const DIGITS: &str = "___";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warn,
    Error,
}

impl Severity {
    pub fn of(level: Level) -> Option<Severity> {
        match level {
            Level::Warn => Some(Severity::Warn),
            l if l.is_error() => Some(Severity::Error),
            _ => None,
        }
    }
}

/// Normalize a message so that occurrences of the same problem compare equal.
pub fn fingerprint(message: &str) -> String {
    let collapsed = collapse_long_quotes(message);

    let mut segments = collapsed.split(": ");
    let mut out = segments.next().unwrap_or_default().to_string();
    for segment in segments {
        out.push_str(": ");
        if segment.chars().count() > LONG_TEXT_THRESHOLD {
            out.push_str(ELIDED);
        } else {
            out.push_str(segment);
        }
    }

    replace_digit_runs(&strip_bracket_ids(&out))
}

fn collapse_long_quotes(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut rest = message;
    while let Some(open) = rest.find('"') {
        out.push_str(&rest[..=open]);
        let after = &rest[open + 1..];
        match after.find('"') {
            Some(close) => {
                let quoted = &after[..close];
                if quoted.chars().count() > LONG_TEXT_THRESHOLD {
                    out.push_str(ELIDED);
                } else {
                    out.push_str(quoted);
                }
                out.push('"');
                rest = &after[close + 1..];
            }
            None => {
                rest = after;
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-')
}

/// `[12]`, `[com.foo.Monitor:3]` → `[]`
fn strip_bracket_ids(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(open) = rest.find('[') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let id_len: usize = after.chars().take_while(|c| is_id_char(*c)).map(char::len_utf8).sum();
        if id_len > 0 && after[id_len..].starts_with(']') {
            out.push_str("[]");
            rest = &after[id_len + 1..];
        } else {
            out.push('[');
            rest = after;
        }
    }
    out.push_str(rest);
    out
}

/// `[0-9][0-9.]*` → `___`
fn replace_digit_runs(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_run = false;
    for c in s.chars() {
        if c.is_ascii_digit() || (in_run && c == '.') {
            if !in_run {
                out.push_str(DIGITS);
                in_run = true;
            }
        } else {
            in_run = false;
            out.push(c);
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub lineno: usize,
    pub line: String,
    /// Continuation lines logged after it
    pub extra_lines: Vec<String>,
}

/// Keeps the first and the most recent samples.
#[derive(Debug, Clone)]
struct SampleBuffer {
    max: usize,
    head: Vec<Sample>,
    tail: VecDeque<Sample>,
    omitted: u64,
}

impl SampleBuffer {
    fn new(max: usize) -> Self {
        Self { max, head: Vec::new(), tail: VecDeque::new(), omitted: 0 }
    }

    fn head_cap(&self) -> usize {
        self.max.div_ceil(2)
    }

    /// Returns whether `sample` was retained.
    fn push(&mut self, sample: Sample) -> bool {
        if self.max == 0 || self.head.len() < self.head_cap() {
            self.head.push(sample);
            return true;
        }
        let tail_cap = self.max / 2;
        if tail_cap == 0 {
            self.omitted += 1;
            return false;
        }
        if self.tail.len() == tail_cap {
            self.tail.pop_front();
            self.omitted += 1;
        }
        self.tail.push_back(sample);
        true
    }

    fn last_mut(&mut self) -> Option<&mut Sample> {
        match self.tail.back_mut() {
            Some(s) => Some(s),
            None => self.head.last_mut(),
        }
    }

    fn into_vec(self) -> Vec<Sample> {
        self.head.into_iter().chain(self.tail).collect()
    }
}

/// Occurrences of one fingerprint in one file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub file: String,
    pub first_seen: NaiveDateTime,
    pub last_seen: NaiveDateTime,
    pub count: u64,
    pub samples: Vec<Sample>,
    /// Samples discarded from the middle of the run
    pub omitted_samples: u64,
}

#[derive(Debug, Clone)]
struct Entry {
    first_seen: NaiveDateTime,
    last_seen: NaiveDateTime,
    count: u64,
    samples: SampleBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupLimits {
    /// Unique fingerprints per severity; 0 = unlimited
    pub max_unique: usize,
    /// Samples per fingerprint and file; 0 = unlimited
    pub max_samples: usize,
}

impl Default for DedupLimits {
    fn default() -> Self {
        Self {
            max_unique: DEFAULT_MAX_UNIQUE,
            max_samples: DEFAULT_MAX_SAMPLES,
        }
    }
}

#[derive(Debug, Clone)]
struct Last {
    key: (Severity, String),
    level: Level,
    thread: String,
    timestamp: NaiveDateTime,
    /// The occurrence's sample was kept, so continuations can attach to it
    retained: bool,
}

/// Builds one file's fingerprint table, line by line.
#[derive(Debug)]
pub struct MessageDeduplicator {
    file: String,
    limits: DedupLimits,
    entries: HashMap<(Severity, String), Entry>,
    unique: [usize; 2],
    /// Occurrences left out by the unique limit, per severity
    dropped: [u64; 2],
    warns: u64,
    errors: u64,
    last: Option<Last>,
}

impl MessageDeduplicator {
    pub fn new(file: &str, limits: DedupLimits) -> Self {
        Self {
            file: file.to_string(),
            limits,
            entries: HashMap::new(),
            unique: [0, 0],
            dropped: [0, 0],
            warns: 0,
            errors: 0,
            last: None,
        }
    }

    pub fn warns(&self) -> u64 {
        self.warns
    }

    pub fn errors(&self) -> u64 {
        self.errors
    }

    pub fn observe(&mut self, line: &LogLine<'_>) {
        let Some(level) = line.level else {
            self.attach_continuation(line.line);
            return;
        };
        let (Some(severity), Some(timestamp)) = (Severity::of(level), line.timestamp) else {
            self.last = None;
            return;
        };

        if self.folds_into_last(level, line.thread, timestamp) {
            self.attach_continuation(line.line);
            return;
        }

        match severity {
            Severity::Warn => self.warns += 1,
            Severity::Error => self.errors += 1,
        }

        let key = (severity, fingerprint(line.message));
        let slot = severity as usize;
        if !self.entries.contains_key(&key) {
            if self.limits.max_unique > 0 && self.unique[slot] >= self.limits.max_unique {
                if self.dropped[slot] == 0 {
                    tracing::debug!(
                        file = %self.file,
                        severity = ?severity,
                        limit = self.limits.max_unique,
                        "unique warn/error limit reached"
                    );
                }
                self.dropped[slot] += 1;
                self.last = None;
                return;
            }
            self.unique[slot] += 1;
        }

        let max_samples = self.limits.max_samples;
        let entry = self.entries.entry(key.clone()).or_insert_with(|| Entry {
            first_seen: timestamp,
            last_seen: timestamp,
            count: 0,
            samples: SampleBuffer::new(max_samples),
        });
        entry.count += 1;
        entry.first_seen = entry.first_seen.min(timestamp);
        entry.last_seen = entry.last_seen.max(timestamp);
        let retained = entry.samples.push(Sample {
            lineno: line.lineno,
            line: line.line.to_string(),
            extra_lines: Vec::new(),
        });

        self.last = Some(Last {
            key,
            level,
            thread: line.thread.to_string(),
            timestamp,
            retained,
        });
    }

    /// Stops attaching continuation lines to the last warning or error.
    pub fn end_run(&mut self) {
        self.last = None;
    }

    /// Same-thread ERROR lines sharing a timestamp, and same-thread FATAL
    /// lines, belong to the message that started the run.
    fn folds_into_last(&self, level: Level, thread: &str, timestamp: NaiveDateTime) -> bool {
        let Some(last) = &self.last else {
            return false;
        };
        if last.level != level || last.thread != thread {
            return false;
        }
        match level {
            Level::Error => last.timestamp == timestamp,
            Level::Fatal => true,
            _ => false,
        }
    }

    fn attach_continuation(&mut self, text: &str) {
        let Some(last) = &self.last else {
            return;
        };
        if !last.retained {
            return;
        }
        if let Some(sample) = self.entries.get_mut(&last.key).and_then(|e| e.samples.last_mut()) {
            sample.extra_lines.push(text.to_string());
        }
    }

    pub fn finish(self) -> FingerprintTable {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();
        for ((severity, fingerprint), entry) in self.entries {
            let observation = Observation {
                file: self.file.clone(),
                first_seen: entry.first_seen,
                last_seen: entry.last_seen,
                count: entry.count,
                omitted_samples: entry.samples.omitted,
                samples: entry.samples.into_vec(),
            };
            match severity {
                Severity::Warn => warnings.push((fingerprint, observation)),
                Severity::Error => errors.push((fingerprint, observation)),
            }
        }
        let by_count = |a: &(String, Observation), b: &(String, Observation)| {
            b.1.count.cmp(&a.1.count).then_with(|| a.0.cmp(&b.0))
        };
        warnings.sort_by(by_count);
        errors.sort_by(by_count);

        FingerprintTable {
            file: self.file,
            warnings,
            errors,
            warns: self.warns,
            errors_count: self.errors,
            dropped_warnings: self.dropped[Severity::Warn as usize],
            dropped_errors: self.dropped[Severity::Error as usize],
        }
    }
}

/// One file's finished, immutable fingerprint table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FingerprintTable {
    pub file: String,
    pub warnings: Vec<(String, Observation)>,
    pub errors: Vec<(String, Observation)>,
    /// Warning lines, folded lines excluded
    pub warns: u64,
    #[serde(rename = "errors_total")]
    pub errors_count: u64,
    /// Warning occurrences of fingerprints beyond the unique limit
    pub dropped_warnings: u64,
    pub dropped_errors: u64,
}

impl FingerprintTable {
    pub fn of(&self, severity: Severity) -> &[(String, Observation)] {
        match severity {
            Severity::Warn => &self.warnings,
            Severity::Error => &self.errors,
        }
    }

    pub fn dropped(&self, severity: Severity) -> u64 {
        match severity {
            Severity::Warn => self.dropped_warnings,
            Severity::Error => self.dropped_errors,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedFingerprint {
    pub fingerprint: String,
    pub total: u64,
    /// One per file, in the order the files were merged
    pub observations: Vec<Observation>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergedReport {
    pub warnings: Vec<MergedFingerprint>,
    pub errors: Vec<MergedFingerprint>,
    /// Some fingerprints were left out because of the unique limit
    pub warnings_truncated: bool,
    pub errors_truncated: bool,
}

impl MergedReport {
    pub fn of(&self, severity: Severity) -> &[MergedFingerprint] {
        match severity {
            Severity::Warn => &self.warnings,
            Severity::Error => &self.errors,
        }
    }

    pub fn truncated(&self, severity: Severity) -> bool {
        match severity {
            Severity::Warn => self.warnings_truncated,
            Severity::Error => self.errors_truncated,
        }
    }
}

/// Fold per-file tables into the run's report, most frequent first.
pub fn merge<'a, I>(tables: I, max_unique: usize) -> MergedReport
where
    I: IntoIterator<Item = &'a FingerprintTable>,
{
    let mut by_severity: [BTreeMap<&str, Vec<&Observation>>; 2] = [BTreeMap::new(), BTreeMap::new()];
    let mut dropped = [false, false];
    for table in tables {
        for severity in [Severity::Warn, Severity::Error] {
            dropped[severity as usize] |= table.dropped(severity) > 0;
            for (fp, obs) in table.of(severity) {
                by_severity[severity as usize].entry(fp.as_str()).or_default().push(obs);
            }
        }
    }

    let [warns, errors] = by_severity;
    let collect = |map: BTreeMap<&str, Vec<&Observation>>| {
        let mut merged: Vec<MergedFingerprint> = map
            .into_iter()
            .map(|(fp, observations)| MergedFingerprint {
                fingerprint: fp.to_string(),
                total: observations.iter().map(|o| o.count).sum(),
                observations: observations.into_iter().cloned().collect(),
            })
            .collect();
        merged.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.fingerprint.cmp(&b.fingerprint)));
        let truncated = max_unique > 0 && merged.len() > max_unique;
        if truncated {
            merged.truncate(max_unique);
        }
        (merged, truncated)
    };

    let (warnings, warnings_truncated) = collect(warns);
    let (errors, errors_truncated) = collect(errors);
    MergedReport {
        warnings_truncated: warnings_truncated || (dropped[Severity::Warn as usize] && !warnings.is_empty()),
        errors_truncated: errors_truncated || (dropped[Severity::Error as usize] && !errors.is_empty()),
        warnings,
        errors,
    }
}
