//! Connections — receiver connect/disconnect events and their running count.
//!
//! Each connection is identified by the address of the server's local
//! object, logged in parentheses after the remote process name. Hosts,
//! clients (physical ids) and connections (logical ids) are numbered in the
//! order they first appear so rows can be labelled `h01 > cli001 > conn001`.

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;
use chrono::NaiveDateTime;
use grep_matcher::{Captures, Matcher};
use grep_regex::{RegexMatcher, RegexMatcherBuilder};
use serde::Serialize;

use crate::line::{format_timestamp, LogLine};

const LINE_PATTERN: &str =
    r"^(?P<prefix>Receiver|Blocking receiver) (?P<process>.+) \((?P<object>(0x|00)[0-9a-fA-F]{4,})\) (?P<message>.+)";
const IDS_PATTERN: &str = r"^\(component ID (?P<physical>[0-9]+)/(?P<logical>[0-9]+)\) (?P<message>.+)$";
const ADDRESS_PATTERN: &str =
    r"^(?P<message>.+) from (?P<host>[0-9]+\.[0-9]+\.[0-9]+\.[0-9]+):(?P<port>[0-9]+) *$";

const CONNECTED: &str = "Receiver connected";
const DISCONNECTED: &str = "Receiver disconnected";

/// Fewer events than this are not worth a listing.
pub const MIN_EVENTS_TO_REPORT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pattern {
    Line,
    Ids,
    Address,
}

fn matcher(pattern: Pattern) -> Option<&'static RegexMatcher> {
    static MATCHERS: OnceLock<Vec<(Pattern, RegexMatcher)>> = OnceLock::new();
    MATCHERS
        .get_or_init(|| {
            [
                (Pattern::Line, LINE_PATTERN),
                (Pattern::Ids, IDS_PATTERN),
                (Pattern::Address, ADDRESS_PATTERN),
            ]
            .into_iter()
            .filter_map(|(p, source)| match RegexMatcherBuilder::new().build(source) {
                Ok(m) => Some((p, m)),
                Err(e) => {
                    tracing::error!(pattern = ?p, error = %e, "connection pattern failed to compile");
                    None
                }
            })
            .collect()
        })
        .iter()
        .find(|(p, _)| *p == pattern)
        .map(|(_, m)| m)
}

/// Named groups of one pattern matched against `text`.
struct Groups<'a> {
    text: &'a str,
    matcher: &'static RegexMatcher,
    caps: grep_regex::RegexCaptures,
}

impl<'a> Groups<'a> {
    fn find(pattern: Pattern, text: &'a str) -> Option<Groups<'a>> {
        let matcher = matcher(pattern)?;
        let mut caps = matcher.new_captures().ok()?;
        if !matcher.captures(text.as_bytes(), &mut caps).ok()? {
            return None;
        }
        Some(Groups { text, matcher, caps })
    }

    fn get(&self, name: &str) -> Option<&'a str> {
        let m = self.caps.get(self.matcher.capture_index(name)?)?;
        self.text.get(m.start()..m.end())
    }
}

/// What is known about one connection object, accumulated over its lines.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub first_seen: NaiveDateTime,
    pub last_seen: NaiveDateTime,
    pub host: Option<String>,
    pub remote_port: Option<String>,
    /// Physical id of the remote client process
    pub client_id: Option<String>,
    /// Logical id of the connection
    pub connection_id: Option<String>,
    /// `h01 > cli001 > conn001`, once host and ids are known
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEvent {
    pub datetime: String,
    #[serde(skip)]
    pub timestamp: NaiveDateTime,
    pub lineno: usize,
    /// Address of the local connection object
    pub connection_ref: String,
    pub remote_process_name: String,
    pub client_id: Option<String>,
    pub connection_id: Option<String>,
    pub message: String,
    /// +1 on connect, -1 on disconnect
    pub connections_delta: i32,
    /// Seconds between the connection's first line and its disconnection
    pub duration_secs: Option<i64>,
}

/// One listing row: an event with the running connection count and the
/// connection's final details filled in.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRow {
    pub datetime: String,
    pub time_delta_secs: i64,
    pub lineno: usize,
    pub host: Option<String>,
    pub remote_process_name: String,
    pub label: Option<String>,
    pub connections: i64,
    pub connections_delta: i32,
    pub duration_secs: Option<i64>,
    pub message: String,
    pub connection_ref: String,
    pub client_id: Option<String>,
    pub connection_id: Option<String>,
}

/// A file's receiver connection history.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionLog {
    pub events: Vec<ConnectionEvent>,
    /// By connection object address
    pub connections: BTreeMap<String, Connection>,
}

impl ConnectionLog {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events in file order with a running count of open connections.
    pub fn rows(&self) -> Vec<ConnectionRow> {
        let mut open = 0i64;
        let mut previous: Option<NaiveDateTime> = None;
        self.events
            .iter()
            .map(|e| {
                open += i64::from(e.connections_delta);
                let time_delta_secs = previous.map_or(0, |p| (e.timestamp - p).num_seconds());
                previous = Some(e.timestamp);
                let info = self.connections.get(&e.connection_ref);
                ConnectionRow {
                    datetime: e.datetime.clone(),
                    time_delta_secs,
                    lineno: e.lineno,
                    host: info.and_then(|c| c.host.clone()),
                    remote_process_name: e.remote_process_name.clone(),
                    label: info.and_then(|c| c.label.clone()),
                    connections: open,
                    connections_delta: e.connections_delta,
                    duration_secs: e.duration_secs,
                    message: e.message.clone(),
                    connection_ref: e.connection_ref.clone(),
                    client_id: e.client_id.clone().or_else(|| info.and_then(|c| c.client_id.clone())),
                    connection_id: e
                        .connection_id
                        .clone()
                        .or_else(|| info.and_then(|c| c.connection_id.clone())),
                }
            })
            .collect()
    }

    /// Most connections open at once.
    pub fn peak(&self) -> i64 {
        self.events
            .iter()
            .scan(0i64, |open, e| {
                *open += i64::from(e.connections_delta);
                Some(*open)
            })
            .max()
            .unwrap_or(0)
            .max(0)
    }
}

#[derive(Debug, Default)]
pub struct ConnectionTracker {
    log: ConnectionLog,
    hosts: HashMap<String, usize>,
    /// Physical id → number within its host
    clients: HashMap<String, usize>,
    clients_per_host: HashMap<String, usize>,
    /// Logical id → number within its client
    logical: HashMap<String, usize>,
    connections_per_client: HashMap<String, usize>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `line` if it is a receiver connection message. Returns whether
    /// it was one.
    pub fn observe(&mut self, line: &LogLine<'_>) -> bool {
        let Some(timestamp) = line.timestamp else {
            return false;
        };
        let Some(found) = Groups::find(Pattern::Line, line.message) else {
            return false;
        };
        let (Some(prefix), Some(process), Some(object), Some(mut message)) =
            (found.get("prefix"), found.get("process"), found.get("object"), found.get("message"))
        else {
            return false;
        };

        let connection = self
            .log
            .connections
            .entry(object.to_string())
            .or_insert_with(|| Connection {
                first_seen: timestamp,
                last_seen: timestamp,
                host: None,
                remote_port: None,
                client_id: None,
                connection_id: None,
                label: None,
            });

        let mut client_id = None;
        let mut connection_id = None;
        if let Some(ids) = Groups::find(Pattern::Ids, message) {
            if let (Some(physical), Some(logical), Some(rest)) = (ids.get("physical"), ids.get("logical"), ids.get("message")) {
                if let Some(previous) = connection.connection_id.as_deref().filter(|p| *p != logical) {
                    tracing::warn!(
                        connection = object,
                        previous,
                        logical,
                        lineno = line.lineno,
                        "connection object reused for another logical connection"
                    );
                }
                connection.client_id = Some(physical.to_string());
                connection.connection_id = Some(logical.to_string());
                client_id = Some(physical.to_string());
                connection_id = Some(logical.to_string());
                message = rest;
            }
        }

        if let Some(address) = Groups::find(Pattern::Address, message) {
            if let (Some(host), Some(port), Some(rest)) = (address.get("host"), address.get("port"), address.get("message")) {
                connection.host = Some(host.to_string());
                connection.remote_port = Some(port.to_string());
                message = rest;
            }
        }

        connection.last_seen = timestamp;
        let first_seen = connection.first_seen;
        let needs_label = connection.label.is_none();
        let ids = match (&connection.host, &connection.client_id, &connection.connection_id) {
            (Some(h), Some(c), Some(l)) if needs_label => Some((h.clone(), c.clone(), l.clone())),
            _ => None,
        };
        if let Some((host, client, logical)) = ids {
            let label = self.label(&host, &client, &logical);
            if let Some(connection) = self.log.connections.get_mut(object) {
                connection.label = Some(label);
            }
        }

        let message = format!("{} {}", prefix, message);
        let (connections_delta, duration_secs) = if message.starts_with(CONNECTED) {
            (1, None)
        } else if message.starts_with(DISCONNECTED) {
            (-1, Some((timestamp - first_seen).num_seconds()))
        } else {
            (0, None)
        };

        self.log.events.push(ConnectionEvent {
            datetime: format_timestamp(&timestamp),
            timestamp,
            lineno: line.lineno,
            connection_ref: object.to_string(),
            remote_process_name: process.to_string(),
            client_id,
            connection_id,
            message,
            connections_delta,
            duration_secs,
        });
        true
    }

    fn label(&mut self, host: &str, client: &str, logical: &str) -> String {
        let next_host = self.hosts.len() + 1;
        let host_num = *self.hosts.entry(host.to_string()).or_insert(next_host);

        let client_num = match self.clients.get(client) {
            Some(n) => *n,
            None => {
                let n = self.clients_per_host.entry(host.to_string()).or_insert(0);
                *n += 1;
                self.clients.insert(client.to_string(), *n);
                *n
            }
        };

        let connection_num = match self.logical.get(logical) {
            Some(n) => *n,
            None => {
                let n = self.connections_per_client.entry(client.to_string()).or_insert(0);
                *n += 1;
                self.logical.insert(logical.to_string(), *n);
                *n
            }
        };

        format!("h{:02} > cli{:03} > conn{:03}", host_num, client_num, connection_num)
    }

    pub fn finish(self) -> ConnectionLog {
        self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observe_all(tracker: &mut ConnectionTracker, lines: &[&str]) -> usize {
        let mut seen = 0;
        for (i, raw) in lines.iter().enumerate() {
            if tracker.observe(&LogLine::parse(raw, i + 1)) {
                seen += 1;
            }
        }
        seen
    }

    const CONNECT_A: &str = "2019-09-25 12:00:00.000 INFO  [1] - Receiver engine_send (0x7efe38000b30) (component ID 111/222) connected from 10.0.0.5:53211";
    const CONNECT_B: &str = "2019-09-25 12:00:05.000 INFO  [1] - Receiver dashboard (00007f1234abcd) (component ID 333/444) connected from 10.0.0.5:53212";
    const SLOW_A: &str = "2019-09-25 12:00:20.000 INFO  [1] - Blocking receiver engine_send (0x7efe38000b30) is slow";
    const DISCONNECT_A: &str = "2019-09-25 12:01:00.000 INFO  [1] - Receiver engine_send (0x7efe38000b30) disconnected";

    // ── Parsing ──────────────────────────────────────────────────

    #[test]
    fn test_connect_line_parsed() {
        let mut t = ConnectionTracker::new();
        assert_eq!(observe_all(&mut t, &[CONNECT_A]), 1);
        let log = t.finish();
        let e = &log.events[0];
        assert_eq!(e.connection_ref, "0x7efe38000b30");
        assert_eq!(e.remote_process_name, "engine_send");
        assert_eq!(e.message, "Receiver connected");
        assert_eq!(e.connections_delta, 1);
        assert_eq!(e.client_id.as_deref(), Some("111"));

        let c = &log.connections["0x7efe38000b30"];
        assert_eq!(c.host.as_deref(), Some("10.0.0.5"));
        assert_eq!(c.remote_port.as_deref(), Some("53211"));
        assert_eq!(c.label.as_deref(), Some("h01 > cli001 > conn001"));
    }

    #[test]
    fn test_unrelated_lines_ignored() {
        let mut t = ConnectionTracker::new();
        let n = observe_all(&mut t, &[
            "2019-09-25 12:00:00.000 INFO  [1] - Receiver pool 3: q=1",
            "2019-09-25 12:00:00.000 INFO  [1] - Correlator Status: sm=1",
            "Receiver engine_send (0x7efe38000b30) connected",
        ]);
        assert_eq!(n, 0);
        assert!(t.finish().is_empty());
    }

    // ── Numbering ────────────────────────────────────────────────

    #[test]
    fn test_clients_numbered_within_host() {
        let mut t = ConnectionTracker::new();
        observe_all(&mut t, &[CONNECT_A, CONNECT_B]);
        let log = t.finish();
        assert_eq!(log.connections["00007f1234abcd"].label.as_deref(), Some("h01 > cli002 > conn001"));
    }

    // ── Running count ────────────────────────────────────────────

    #[test]
    fn test_disconnect_duration_and_running_count() {
        let mut t = ConnectionTracker::new();
        observe_all(&mut t, &[CONNECT_A, CONNECT_B, SLOW_A, DISCONNECT_A]);
        let log = t.finish();
        let rows = log.rows();
        let open: Vec<i64> = rows.iter().map(|r| r.connections).collect();
        assert_eq!(open, vec![1, 2, 2, 1]);
        assert_eq!(rows[2].message, "Blocking receiver is slow");
        assert_eq!(rows[2].connections_delta, 0);
        assert_eq!(rows[3].duration_secs, Some(60));
        assert_eq!(rows[3].time_delta_secs, 40);
        // details logged only on the connect line are filled in
        assert_eq!(rows[3].host.as_deref(), Some("10.0.0.5"));
        assert_eq!(rows[3].client_id.as_deref(), Some("111"));
        assert_eq!(log.peak(), 2);
    }
}
