//! Line — the raw log-line model.
//!
//! A well-formed line looks like
//! `2019-04-08 13:00:01.111 INFO  [22872] - Correlator Status: sm=1 ...`.
//! Anything else (stack frames, wrapped text) has no level and no timestamp,
//! and its message is the whole line.

use chrono::NaiveDateTime;
use serde::Serialize;

/// Prefixes added by container log collectors; always 14 bytes long.
const CONTAINER_PREFIXES: [&str; 2] = ["[correlator]  ", "[apama-ctrl]  "];

/// Some deployment launchers print their own banner and the server's first
/// startup line on one line: `Running correlator [...] <timestamp> ##### ...`.
const LAUNCHER_PREFIX: &str = "Running correlator [";
const FORCE_MARKER: &str = " ##### ";

const TIMESTAMP_LEN: usize = 23;
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    Crit,
    /// `#####` lines, always logged regardless of the configured level
    Force,
}

impl Level {
    pub fn from_token(token: &str) -> Option<Level> {
        match token {
            "TRACE" => Some(Level::Trace),
            "DEBUG" => Some(Level::Debug),
            "INFO" => Some(Level::Info),
            "WARN" => Some(Level::Warn),
            "ERROR" => Some(Level::Error),
            "FATAL" => Some(Level::Fatal),
            "CRIT" => Some(Level::Crit),
            "#####" => Some(Level::Force),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Level::Error | Level::Fatal | Level::Crit)
    }
}

#[derive(Debug, Clone)]
pub struct LogLine<'a> {
    /// 1-based line number within the file
    pub lineno: usize,
    /// Full line with trailing whitespace and any container prefix removed
    pub line: &'a str,
    pub message: &'a str,
    pub level: Option<Level>,
    pub timestamp: Option<NaiveDateTime>,
    pub thread: &'a str,
}

impl<'a> LogLine<'a> {
    pub fn parse(raw: &'a str, lineno: usize) -> LogLine<'a> {
        let mut line = raw.trim_end();
        for prefix in CONTAINER_PREFIXES {
            if let Some(rest) = line.strip_prefix(prefix) {
                line = rest;
                break;
            }
        }

        let unstructured = LogLine {
            lineno,
            line,
            message: line,
            level: None,
            timestamp: None,
            thread: "",
        };

        if !line.starts_with(|c: char| c.is_ascii_digit()) {
            return match embedded_force_line(line) {
                Some(inner) => match LogLine::parse(inner, lineno) {
                    parsed if parsed.level.is_some() => parsed,
                    _ => unstructured,
                },
                None => unstructured,
            };
        }
        let Some(sep) = line.find(" - ") else {
            return unstructured;
        };

        match split_prefix(&line[..sep]) {
            Some((timestamp, level, thread)) => LogLine {
                lineno,
                line,
                message: &line[sep + 3..],
                level: Some(level),
                timestamp: Some(timestamp),
                thread,
            },
            None => {
                tracing::trace!(lineno, "line starts with a digit but has no valid timestamp/level prefix");
                unstructured
            }
        }
    }

    /// Seconds since the epoch, treating the logged local time as UTC.
    pub fn epoch_secs(&self) -> Option<f64> {
        self.timestamp.map(epoch_secs)
    }
}

pub fn epoch_secs(ts: NaiveDateTime) -> f64 {
    ts.and_utc().timestamp_millis() as f64 / 1000.0
}

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// The server line embedded after a launcher's banner.
fn embedded_force_line(line: &str) -> Option<&str> {
    if !line.starts_with(LAUNCHER_PREFIX) {
        return None;
    }
    let marker = line.find(FORCE_MARKER)?;
    line.get(marker.checked_sub(TIMESTAMP_LEN)?..)
}

fn split_prefix(prefix: &str) -> Option<(NaiveDateTime, Level, &str)> {
    let stamp = prefix.get(..TIMESTAMP_LEN)?;
    let timestamp = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;

    let rest = prefix[TIMESTAMP_LEN..].trim_start();
    let (token, rest) = rest.split_once(' ').unwrap_or((rest, ""));
    let level = Level::from_token(token)?;

    let thread = rest
        .trim_start()
        .strip_prefix('[')
        .and_then(|r| r.split_once(']'))
        .map(|(thread, _)| thread)
        .unwrap_or("");

    Some((timestamp, level, thread))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_line() {
        let line = LogLine::parse(
            "2019-04-08 13:00:01.111 INFO  [22872] - Correlator Status: sm=1 nctx=2",
            7,
        );
        assert_eq!(line.lineno, 7);
        assert_eq!(line.level, Some(Level::Info));
        assert_eq!(line.thread, "22872");
        assert_eq!(line.message, "Correlator Status: sm=1 nctx=2");
        assert_eq!(format_timestamp(&line.timestamp.unwrap()), "2019-04-08 13:00:01.111");
    }

    #[test]
    fn test_parse_force_and_category() {
        let line = LogLine::parse(
            "2019-04-08 13:00:00.000 ##### [140] <com.apama.Main> - Correlator, version 10.5.0.0, started.",
            1,
        );
        assert_eq!(line.level, Some(Level::Force));
        assert_eq!(line.message, "Correlator, version 10.5.0.0, started.");
    }

    #[test]
    fn test_container_prefix_stripped() {
        let line = LogLine::parse("[correlator]  2019-04-08 13:00:01.111 WARN  [1] - careful", 3);
        assert_eq!(line.level, Some(Level::Warn));
        assert_eq!(line.message, "careful");
        assert!(line.line.starts_with("2019-"));
    }

    #[test]
    fn test_unstructured_line() {
        let line = LogLine::parse("\tat com.foo.Bar(Bar.java:12)", 9);
        assert_eq!(line.level, None);
        assert_eq!(line.timestamp, None);
        assert_eq!(line.message, "\tat com.foo.Bar(Bar.java:12)");
    }

    #[test]
    fn test_launcher_banner_yields_embedded_force_line() {
        let line = LogLine::parse(
            "Running correlator [/opt/apama/bin/correlator --port 15903]2019-04-08 13:00:00.000 ##### [140] - Correlator, version 10.5.0.0, started.",
            4,
        );
        assert_eq!(line.level, Some(Level::Force));
        assert_eq!(line.lineno, 4);
        assert_eq!(line.message, "Correlator, version 10.5.0.0, started.");

        let plain = LogLine::parse("Running correlator [x] without a banner", 5);
        assert_eq!(plain.level, None);
    }

    #[test]
    fn test_digit_line_without_valid_prefix() {
        let line = LogLine::parse("12 - not a log line", 2);
        assert_eq!(line.level, None);
        assert_eq!(line.message, "12 - not a log line");
    }

    #[test]
    fn test_unknown_level_is_unstructured() {
        let line = LogLine::parse("2019-04-08 13:00:01.111 CHATTY [1] - hi", 2);
        assert_eq!(line.level, None);
    }

    #[test]
    fn test_epoch_secs_treated_as_utc() {
        let line = LogLine::parse("1970-01-01 00:00:10.500 INFO  [1] - x", 1);
        assert_eq!(line.epoch_secs(), Some(10.5));
    }

    #[test]
    fn test_error_levels() {
        assert!(Level::Error.is_error());
        assert!(Level::Fatal.is_error());
        assert!(Level::Crit.is_error());
        assert!(!Level::Warn.is_error());
    }
}
