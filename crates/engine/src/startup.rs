//! Startup — metadata from the banner the server logs when it starts.
//!
//! A stanza opens at `Correlator, version X, started.` and ends at
//! `Correlator, version X, running`. A stanza that opens after status lines
//! have been seen marks a process restart within the file.

use std::sync::OnceLock;
use chrono::NaiveDateTime;
use grep_matcher::{Captures, Matcher};
use grep_regex::{RegexMatcher, RegexMatcherBuilder};
use serde::Serialize;

use crate::conf::serde_utils::serialize_ordered_map;
use crate::line::{format_timestamp, Level, LogLine};

/// Component names that add nothing to the instance id.
const DEFAULT_COMPONENTS: [&str; 2] = ["correlator", "defaultCorrelator"];

const INPUT_VALUE_PREFIX: &str = "Input value - ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fact {
    Started,
    Running,
    Host,
    Platform,
    Pid,
    Memory,
    CpuCount,
    Component,
    UtcTime,
    CommandLine,
    Jvm,
    License,
    LicenceMaxMemory,
    Shutdown,
}

const FACT_PATTERNS: &[(Fact, &str)] = &[
    (Fact::Started, r"^Correlator, version (?P<version>[^ ]+).*, started\."),
    (Fact::Running, r"^Correlator, version .*, running"),
    (Fact::Host, r"^Running on host '(?P<qualified>(?P<host>[^'.]+)[^']*)'( as user '(?P<user>[^']+)')?"),
    (Fact::Platform, r#"^Running on platform '"?(?P<os>[^"']*)"?"#),
    (Fact::Pid, r"^Running with process Id (?P<pid>[0-9]+)"),
    (Fact::Memory, r"^Running with (?P<mb>[0-9.]+)MB of (available|physical) memory"),
    (Fact::CpuCount, r"^There are (?P<count>[0-9]+) CPU"),
    (Fact::Component, r"^Component ID: (?P<name>.+) \(correlator/(?P<id>[0-9]+)"),
    (
        Fact::UtcTime,
        r"^Current UTC time: (?P<utc>[0-9]{4}-[0-9]{2}-[0-9]{2} [0-9]{2}:[0-9]{2}:[0-9]{2}), local timezone: (?P<tz>.+)",
    ),
    (Fact::CommandLine, r"^Correlator command line: (?P<cmd>.*)"),
    (Fact::Jvm, r"^Java virtual machine created - (?P<jvm>.*)\."),
    (Fact::License, r"^License File: (?P<file>[^ ]+)"),
    (Fact::LicenceMaxMemory, r"^Correlator is restricted to (?P<mb>[0-9.]+) MB of resident memory"),
    (Fact::Shutdown, r"^Shutting down correlator in response to client \([^)]+\) request: (?P<reason>.*)"),
];

fn matchers() -> &'static [(Fact, RegexMatcher)] {
    static MATCHERS: OnceLock<Vec<(Fact, RegexMatcher)>> = OnceLock::new();
    MATCHERS.get_or_init(|| {
        FACT_PATTERNS
            .iter()
            .filter_map(|(fact, pattern)| match RegexMatcherBuilder::new().build(pattern) {
                Ok(m) => Some((*fact, m)),
                Err(e) => {
                    tracing::error!(?fact, error = %e, "startup pattern failed to compile");
                    None
                }
            })
            .collect()
    })
}

/// Named groups of the first fact pattern matching `message`.
struct FactMatch<'a> {
    fact: Fact,
    message: &'a str,
    matcher: &'static RegexMatcher,
    caps: grep_regex::RegexCaptures,
}

impl<'a> FactMatch<'a> {
    fn find(message: &'a str) -> Option<FactMatch<'a>> {
        for (fact, matcher) in matchers() {
            let Ok(mut caps) = matcher.new_captures() else {
                continue;
            };
            if matcher.captures(message.as_bytes(), &mut caps).unwrap_or(false) {
                return Some(FactMatch { fact: *fact, message, matcher, caps });
            }
        }
        None
    }

    fn group(&self, name: &str) -> Option<String> {
        let m = self.caps.get(self.matcher.capture_index(name)?)?;
        self.message.get(m.start()..m.end()).map(str::to_string)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartupStanza {
    pub start_time: Option<String>,
    pub start_line: Option<usize>,
    pub end_time: Option<String>,
    /// Saw the `running` line that ends the stanza
    pub complete: bool,
    pub version: Option<String>,
    pub qualified_host: Option<String>,
    pub host: Option<String>,
    pub user: Option<String>,
    pub os: Option<String>,
    pub pid: Option<u64>,
    pub physical_memory_mb: Option<f64>,
    pub licence_max_memory_mb: Option<f64>,
    pub cpu_count: Option<u32>,
    pub component_name: Option<String>,
    pub physical_id: Option<String>,
    pub utc_time: Option<String>,
    pub timezone_name: Option<String>,
    pub utc_offset_hours: Option<f64>,
    pub utc_offset: Option<String>,
    pub command_line: Option<String>,
    pub jvm_version: Option<String>,
    pub license_file: Option<String>,
    pub shutdown_reason: Option<String>,
    pub shutdown_time: Option<String>,
    /// `key = value` lines, keys lower-cased
    #[serde(serialize_with = "serialize_ordered_map")]
    pub settings: Vec<(String, String)>,
    pub instance: Option<String>,
}

impl StartupStanza {
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings.iter().rev().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// `host:port`, plus `[component]` unless it is a default name.
    pub fn instance(&self) -> String {
        let mut instance = format!(
            "{}:{}",
            self.host.as_deref().unwrap_or("?"),
            self.setting("port").unwrap_or("?")
        );
        if let Some(name) = &self.component_name {
            if !DEFAULT_COMPONENTS.contains(&name.as_str()) {
                instance.push_str(&format!("[{}]", name));
            }
        }
        instance
    }

    /// Smallest of physical memory and the licence limit.
    pub fn usable_memory_mb(&self) -> Option<f64> {
        let physical = self.physical_memory_mb?;
        Some(match self.licence_max_memory_mb {
            Some(limit) => physical.min(limit),
            None => physical,
        })
    }

    fn is_empty(&self) -> bool {
        *self == StartupStanza::default()
    }

    fn apply(&mut self, m: &FactMatch<'_>, timestamp: NaiveDateTime) {
        match m.fact {
            Fact::Started => self.version = m.group("version"),
            Fact::Running => self.complete = true,
            Fact::Host => {
                self.qualified_host = m.group("qualified");
                self.host = m.group("host");
                self.user = m.group("user");
            }
            Fact::Platform => self.os = m.group("os"),
            Fact::Pid => self.pid = m.group("pid").and_then(|v| v.parse().ok()),
            Fact::Memory => self.physical_memory_mb = m.group("mb").and_then(|v| v.parse().ok()),
            Fact::CpuCount => self.cpu_count = m.group("count").and_then(|v| v.parse().ok()),
            Fact::Component => {
                self.component_name = m.group("name");
                self.physical_id = m.group("id");
            }
            Fact::UtcTime => {
                self.timezone_name = m.group("tz");
                if let Some(utc) = m.group("utc") {
                    if let Ok(utc_time) = NaiveDateTime::parse_from_str(&utc, "%Y-%m-%d %H:%M:%S") {
                        let hours = utc_offset_hours(timestamp, utc_time);
                        self.utc_offset_hours = Some(hours);
                        self.utc_offset = Some(format_utc_offset(hours));
                    }
                    self.utc_time = Some(utc);
                }
            }
            Fact::CommandLine => self.command_line = m.group("cmd"),
            Fact::Jvm => self.jvm_version = m.group("jvm"),
            Fact::License => self.license_file = m.group("file"),
            Fact::LicenceMaxMemory => {
                self.licence_max_memory_mb = m.group("mb").and_then(|v| v.parse().ok())
            }
            Fact::Shutdown => {
                self.shutdown_reason = m.group("reason");
                self.shutdown_time = Some(format_timestamp(&timestamp));
            }
        }
    }
}

/// Local minus UTC, rounded to the nearest quarter hour.
fn utc_offset_hours(local: NaiveDateTime, utc: NaiveDateTime) -> f64 {
    let minutes = (local - utc).num_seconds() as f64 / 60.0;
    (minutes / 15.0).round() * 0.25
}

fn format_utc_offset(hours: f64) -> String {
    let total_minutes = (hours.abs() * 60.0).round() as i64;
    format!(
        "UTC{}{:02}:{:02}",
        if hours >= 0.0 { '+' } else { '-' },
        total_minutes / 60,
        total_minutes % 60
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupEvent {
    /// Not a startup line
    Ignored,
    /// A new stanza began; `restart` when status lines preceded it
    Opened { restart: bool },
    Updated,
    /// The stanza's closing line
    Completed,
}

#[derive(Debug, Default)]
pub struct StartupTracker {
    stanzas: Vec<StartupStanza>,
    current: StartupStanza,
    in_stanza: bool,
    seen_levelled: bool,
    seen_status: bool,
}

impl StartupTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Startup lines are force lines, info lines inside a stanza, and the
    /// first levelled line of the file.
    pub fn observe(&mut self, line: &LogLine<'_>) -> StartupEvent {
        let (Some(level), Some(timestamp)) = (line.level, line.timestamp) else {
            return StartupEvent::Ignored;
        };
        let first = !self.seen_levelled;
        self.seen_levelled = true;
        let candidate = level == Level::Force || (self.in_stanza && level == Level::Info) || first;
        if !candidate {
            return StartupEvent::Ignored;
        }

        let message = line.message;
        if let Some(i) = message.find(" = ") {
            if i > 0 {
                let key = message[..i].trim();
                let key = key.strip_prefix(INPUT_VALUE_PREFIX).unwrap_or(key).to_lowercase();
                let value = message[i + 3..].trim().to_string();
                self.current.settings.push((key, value));
                return StartupEvent::Updated;
            }
        }

        let Some(m) = FactMatch::find(message) else {
            return StartupEvent::Ignored;
        };

        match m.fact {
            Fact::Started => {
                let restart = self.seen_status;
                self.open(timestamp, line.lineno);
                self.current.apply(&m, timestamp);
                tracing::debug!(lineno = line.lineno, version = ?self.current.version, restart, "startup stanza opened");
                StartupEvent::Opened { restart }
            }
            Fact::Running => {
                self.in_stanza = false;
                self.current.apply(&m, timestamp);
                StartupEvent::Completed
            }
            _ => {
                self.current.apply(&m, timestamp);
                StartupEvent::Updated
            }
        }
    }

    /// A status line ends any open stanza.
    pub fn status_seen(&mut self) {
        self.seen_status = true;
        self.in_stanza = false;
    }

    pub fn in_stanza(&self) -> bool {
        self.in_stanza
    }

    pub fn current(&self) -> Option<&StartupStanza> {
        (!self.current.is_empty()).then_some(&self.current)
            .or_else(|| self.stanzas.last())
    }

    fn open(&mut self, timestamp: NaiveDateTime, lineno: usize) {
        let started = format_timestamp(&timestamp);
        if !self.current.is_empty() {
            let mut previous = std::mem::take(&mut self.current);
            previous.end_time = Some(started.clone());
            previous.instance = Some(previous.instance());
            self.stanzas.push(previous);
        }
        self.current.start_time = Some(started);
        self.current.start_line = Some(lineno);
        self.in_stanza = true;
        self.seen_status = false;
    }

    /// All stanzas in file order. Settings logged before any stanza opened
    /// form a stanza of their own.
    pub fn finish(mut self) -> Vec<StartupStanza> {
        if !self.current.is_empty() {
            let mut last = self.current;
            last.instance = Some(last.instance());
            self.stanzas.push(last);
        }
        self.stanzas
    }
}
