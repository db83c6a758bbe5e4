//! Pass — one complete, pure parse of a file's lines.
//!
//! A pass either completes or stops at the first key that does not fit its
//! keyed descriptor's budget. It owns every piece of state it builds, so a
//! retry with a bigger budget always starts from nothing.

use std::collections::{BTreeMap, HashMap};
use chrono::NaiveDateTime;
use serde::Serialize;

use crate::classify::{Classification, LineClassifier};
use crate::conf::{Computed, DescriptorId, DescriptorSet, LineDescriptor, Role};
use crate::connections::{ConnectionLog, ConnectionTracker};
use crate::dedup::{DedupLimits, FingerprintTable, MessageDeduplicator};
use crate::extract::{tokenize, Extraction, FieldExtractor, Layout, TickContext, Tokens};
use crate::line::{format_timestamp, Level, LogLine};
use crate::model::Value;
use crate::slots::{AllocationOverflow, KeySlotTable, SlotPlan};
use crate::startup::{StartupEvent, StartupStanza, StartupTracker};
use crate::timeline::{ColumnKind, Record, Schema, Tick, TimelineMerger};

pub const COLUMN_DATETIME: &str = "datetime";
pub const COLUMN_EPOCH_SECS: &str = "epoch secs";
pub const COLUMN_LINE_NUM: &str = "line num";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassOptions {
    /// Primary ticks in the first this-many percent of the file are not
    /// emitted. They still feed rates and carried values.
    pub skip_percent: f64,
    pub dedup: DedupLimits,
}

impl Default for PassOptions {
    fn default() -> Self {
        Self { skip_percent: 0.0, dedup: DedupLimits::default() }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Malformed {
    pub lines: usize,
    pub tokens: usize,
}

/// Where the process began swapping, and where it last stopped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwappingSpan {
    pub start_line: usize,
    pub start_time: String,
    /// First non-swapping status line after the last swapping one; absent
    /// when the file ends while still swapping
    pub end_line: Option<usize>,
    pub end_time: Option<String>,
}

#[derive(Debug)]
pub struct PassOutput {
    pub schema: Schema,
    pub ticks: Vec<Tick>,
    /// Secondary records logged after the last primary tick
    pub unattached: usize,
    pub stanzas: Vec<StartupStanza>,
    pub fingerprints: FingerprintTable,
    /// Final tables of every enabled keyed descriptor, by descriptor
    pub key_slots: BTreeMap<DescriptorId, KeySlotTable>,
    pub malformed: BTreeMap<DescriptorId, Malformed>,
    /// Primary status lines seen, including skipped ones
    pub primary_lines: usize,
    /// Startup stanzas that opened after status lines
    pub restarts: usize,
    pub swapping: Option<SwappingSpan>,
    pub connections: ConnectionLog,
    pub start_time: Option<NaiveDateTime>,
    pub end_time: Option<NaiveDateTime>,
}

struct Instance {
    extractor: FieldExtractor,
    /// Schema column per layout column
    columns: Vec<usize>,
    key_column: Option<usize>,
}

/// Columns reserved for every slot of a keyed descriptor.
struct KeyedColumns {
    layout: Layout,
    /// (key column, field columns) per slot
    slots: Vec<(usize, Vec<usize>)>,
}

struct Pass<'d> {
    set: &'d DescriptorSet,
    plan: &'d SlotPlan,
    classifier: LineClassifier<'d>,
    schema: Schema,
    merger: TimelineMerger,
    startup: StartupTracker,
    connections: ConnectionTracker,
    dedup: MessageDeduplicator,
    tables: HashMap<DescriptorId, KeySlotTable>,
    keyed: HashMap<DescriptorId, KeyedColumns>,
    instances: HashMap<(DescriptorId, Option<usize>), Instance>,
    malformed: BTreeMap<DescriptorId, Malformed>,
    primary_lines: usize,
    restarts: usize,
    swapping: Option<SwappingSpan>,
    start_time: Option<NaiveDateTime>,
    end_time: Option<NaiveDateTime>,
}

/// Parse `lines` with the budgets of `plan`.
pub fn run_pass<S: AsRef<str>>(
    lines: &[S],
    file: &str,
    set: &DescriptorSet,
    plan: &SlotPlan,
    options: &PassOptions,
) -> Result<PassOutput, AllocationOverflow> {
    let mut pass = Pass::new(file, set, plan, options);

    let total_bytes: usize = lines.iter().map(|l| l.as_ref().len() + 1).sum();
    let skip_before = total_bytes as f64 * options.skip_percent.clamp(0.0, 100.0) / 100.0;
    let mut offset = 0usize;

    for (i, raw) in lines.iter().enumerate() {
        let raw = raw.as_ref();
        let keep = offset as f64 >= skip_before;
        offset += raw.len() + 1;
        if raw.trim().is_empty() {
            continue;
        }
        pass.line(LogLine::parse(raw, i + 1), keep)?;
    }

    Ok(pass.finish())
}

impl<'d> Pass<'d> {
    fn new(file: &str, set: &'d DescriptorSet, plan: &'d SlotPlan, options: &PassOptions) -> Self {
        let mut schema = Schema::default();
        let primary = set.primary().id;
        schema.add(COLUMN_DATETIME.to_string(), ColumnKind::Meta, primary);
        schema.add(COLUMN_EPOCH_SECS.to_string(), ColumnKind::Meta, primary);
        schema.add(COLUMN_LINE_NUM.to_string(), ColumnKind::Meta, primary);

        Self {
            set,
            plan,
            classifier: LineClassifier::new(set),
            schema,
            merger: TimelineMerger::new(),
            startup: StartupTracker::new(),
            connections: ConnectionTracker::new(),
            dedup: MessageDeduplicator::new(file, options.dedup),
            tables: plan.tables(),
            keyed: HashMap::new(),
            instances: HashMap::new(),
            malformed: BTreeMap::new(),
            primary_lines: 0,
            restarts: 0,
            swapping: None,
            start_time: None,
            end_time: None,
        }
    }

    fn line(&mut self, line: LogLine<'_>, keep: bool) -> Result<(), AllocationOverflow> {
        let Some(timestamp) = line.timestamp else {
            self.dedup.observe(&line);
            return Ok(());
        };
        self.start_time.get_or_insert(timestamp);
        self.end_time = Some(timestamp);

        if let Some(found) = self.classifier.classify(line.message) {
            self.startup.status_seen();
            self.dedup.end_run();
            return self.status(&line, timestamp, found, keep);
        }

        match self.startup.observe(&line) {
            StartupEvent::Opened { restart: true } => {
                self.restarts += 1;
                self.merger.restart();
                let since = line.epoch_secs();
                tracing::info!(lineno = line.lineno, "process restarted; resetting previous status values");
                for instance in self.instances.values_mut() {
                    instance.extractor.reset(since);
                }
            }
            StartupEvent::Ignored if line.level == Some(Level::Info) && !self.startup.in_stanza() => {
                self.connections.observe(&line);
            }
            _ => {}
        }
        self.dedup.observe(&line);
        Ok(())
    }

    fn status(
        &mut self,
        line: &LogLine<'_>,
        timestamp: NaiveDateTime,
        found: Classification<'_>,
        keep: bool,
    ) -> Result<(), AllocationOverflow> {
        let set = self.set;
        let descriptor = set.get(found.descriptor);
        if self.plan.is_disabled(descriptor.id) {
            return Ok(());
        }

        let tokens = tokenize(found.body);
        if tokens.malformed > 0 {
            let m = self.malformed.entry(descriptor.id).or_default();
            m.lines += 1;
            m.tokens += tokens.malformed;
            tracing::debug!(
                descriptor = %descriptor.name,
                lineno = line.lineno,
                skipped = tokens.malformed,
                "malformed status fields"
            );
        }

        let slot = match found.key {
            Some(key) => match self.slot_for(descriptor, key)? {
                Some(slot) => Some(slot),
                None => return Ok(()),
            },
            None => None,
        };

        let ctx = TickContext {
            epoch_secs: crate::line::epoch_secs(timestamp),
            lineno: line.lineno,
            warns_total: self.dedup.warns(),
            errors_total: self.dedup.errors(),
            file_start_secs: self.start_time.map(crate::line::epoch_secs),
        };

        let instance = self.instance(descriptor, slot, &tokens);
        let extraction = instance.extractor.extract(&tokens, &ctx);
        let restarted = extraction.restarted;
        let swapping = swapping_flag(instance, &extraction);
        let mut cells: Vec<(usize, Option<Value>)> = instance
            .columns
            .iter()
            .copied()
            .zip(extraction.values)
            .collect();
        if let (Some(column), Some(key)) = (instance.key_column, found.key) {
            cells.push((column, Some(Value::from(key))));
        }

        let record = Record { epoch_secs: ctx.epoch_secs, lineno: line.lineno, cells };
        match descriptor.role {
            Role::Primary => {
                self.primary_lines += 1;
                if restarted {
                    // counters went backwards without a new startup stanza
                    self.merger.restart();
                }
                if let Some(swapping) = swapping {
                    self.track_swapping(swapping, line.lineno, &timestamp);
                }
                let mut record = record;
                record.cells.extend([
                    (0, Some(Value::Str(format_timestamp(&timestamp)))),
                    (1, Some(Value::Float(ctx.epoch_secs))),
                    (2, Some(Value::Int(line.lineno as i64))),
                ]);
                self.merger.push_primary(record, keep);
            }
            Role::Secondary => self.merger.push_secondary(record),
        }
        Ok(())
    }

    fn track_swapping(&mut self, swapping: bool, lineno: usize, timestamp: &NaiveDateTime) {
        let Some(span) = self.swapping.as_mut() else {
            if swapping {
                tracing::debug!(lineno, "process started swapping");
                self.swapping = Some(SwappingSpan {
                    start_line: lineno,
                    start_time: format_timestamp(timestamp),
                    end_line: None,
                    end_time: None,
                });
            }
            return;
        };
        if swapping {
            span.end_line = None;
            span.end_time = None;
        } else if span.end_line.is_none() {
            span.end_line = Some(lineno);
            span.end_time = Some(format_timestamp(timestamp));
        }
    }

    /// `None` when the descriptor has no table in this pass.
    fn slot_for(
        &mut self,
        descriptor: &LineDescriptor,
        key: &str,
    ) -> Result<Option<usize>, AllocationOverflow> {
        let Some(table) = self.tables.get_mut(&descriptor.id) else {
            return Ok(None);
        };
        table.slot_for(key).map(Some).map_err(|budget| {
            tracing::debug!(
                descriptor = %descriptor.name,
                key,
                budget,
                epoch = table.epoch,
                "keyed status line exceeded its column budget"
            );
            AllocationOverflow {
                descriptor: descriptor.id,
                key: key.to_string(),
                budget,
            }
        })
    }

    /// The extractor for one descriptor instance, creating its columns on
    /// first sight.
    fn instance(
        &mut self,
        descriptor: &LineDescriptor,
        slot: Option<usize>,
        first: &Tokens<'_>,
    ) -> &mut Instance {
        let schema = &mut self.schema;
        let keyed = &mut self.keyed;
        let budget = self.tables.get(&descriptor.id).map(|t| t.budget).unwrap_or(0);

        self.instances
            .entry((descriptor.id, slot))
            .or_insert_with(|| match slot {
                None => {
                    let layout = Layout::discover(descriptor, first);
                    let columns = layout
                        .columns()
                        .iter()
                        .map(|c| {
                            schema.add(
                                format!("{}{}", descriptor.field_prefix, c.alias),
                                c.kind,
                                descriptor.id,
                            )
                        })
                        .collect();
                    Instance {
                        extractor: FieldExtractor::new(descriptor, layout),
                        columns,
                        key_column: None,
                    }
                }
                Some(slot) => {
                    let reserved = keyed
                        .entry(descriptor.id)
                        .or_insert_with(|| reserve_keyed(schema, descriptor, budget, first));
                    let (key_column, columns) = reserved.slots.get(slot).cloned().unwrap_or_default();
                    Instance {
                        extractor: FieldExtractor::new(descriptor, reserved.layout.clone()),
                        columns,
                        key_column: Some(key_column),
                    }
                }
            })
    }

    fn finish(self) -> PassOutput {
        let (ticks, unattached) = self.merger.finish(self.schema.len());
        let key_slots = self.tables.into_iter().collect();
        PassOutput {
            schema: self.schema,
            ticks,
            unattached,
            stanzas: self.startup.finish(),
            fingerprints: self.dedup.finish(),
            key_slots,
            malformed: self.malformed,
            primary_lines: self.primary_lines,
            restarts: self.restarts,
            swapping: self.swapping,
            connections: self.connections.finish(),
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }
}

/// The `is swapping` value of an extraction, when its layout computes one.
fn swapping_flag(instance: &Instance, extraction: &Extraction) -> Option<bool> {
    let i = instance
        .extractor
        .layout()
        .columns()
        .iter()
        .position(|c| matches!(c.computed(), Some(Computed::IsSwapping)))?;
    let value = extraction.values.get(i)?.as_ref()?.as_f64()?;
    Some(value > 0.0)
}

/// Column name prefix of a keyed descriptor's slots.
pub fn keyed_prefix(descriptor: &LineDescriptor) -> String {
    if descriptor.field_prefix.is_empty() {
        format!("{} ", descriptor.trigger)
    } else {
        descriptor.field_prefix.clone()
    }
}

fn reserve_keyed(
    schema: &mut Schema,
    descriptor: &LineDescriptor,
    budget: usize,
    first: &Tokens<'_>,
) -> KeyedColumns {
    let layout = Layout::discover(descriptor, first);
    let prefix = keyed_prefix(descriptor);
    let slots = (0..budget)
        .map(|slot| {
            let key_column = schema.add(format!("{}{}.key", prefix, slot), ColumnKind::SlotKey, descriptor.id);
            let columns = layout
                .columns()
                .iter()
                .map(|c| schema.add(format!("{}{}.{}", prefix, slot, c.alias), c.kind, descriptor.id))
                .collect();
            (key_column, columns)
        })
        .collect();
    tracing::debug!(descriptor = %descriptor.name, budget, fields = layout.len(), "reserved keyed columns");
    KeyedColumns { layout, slots }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set() -> DescriptorSet {
        DescriptorSet::from_json_str(r#"{"userStatusLines": {
            "JMS Status": {"fieldPrefix": "jms.", "field:alias": {"s": "sent"}},
            "Receiver": {"keyRegex": "^Receiver (?P<key>[^ :]+):", "fieldPrefix": "rcv.", "maxKeysToAllocateColumnsFor": 2}
        }}"#).unwrap()
    }

    fn status(secs: u32, body: &str) -> String {
        format!("2019-04-08 13:00:{:02}.000 INFO  [1] - {}", secs, body)
    }

    // ── Columns ──────────────────────────────────────────────────

    #[test]
    fn test_meta_columns_first() {
        let set = set();
        let lines = vec![status(0, "Correlator Status: sm=1 rx=5")];
        let out = run_pass(&lines, "a.log", &set, &SlotPlan::initial(&set), &PassOptions::default()).unwrap();
        let names: Vec<&str> = out.schema.names().take(3).collect();
        assert_eq!(names, vec!["datetime", "epoch secs", "line num"]);
        assert_eq!(out.ticks.len(), 1);
        assert_eq!(out.ticks[0].get(2), Some(&Value::Int(1)));
        assert_eq!(out.ticks[0].get(0), Some(&Value::from("2019-04-08 13:00:00.000")));
    }

    #[test]
    fn test_keyed_columns_reserved_for_whole_budget() {
        let set = set();
        let lines = vec![
            status(0, "Receiver a: q=1"),
            status(1, "Correlator Status: sm=1"),
        ];
        let out = run_pass(&lines, "a.log", &set, &SlotPlan::initial(&set), &PassOptions::default()).unwrap();
        for name in ["rcv.0.key", "rcv.0.q", "rcv.1.key", "rcv.1.q"] {
            assert!(out.schema.position(name).is_some(), "{}", name);
        }
        let tick = &out.ticks[0];
        assert_eq!(tick.get(out.schema.position("rcv.0.key").unwrap()), Some(&Value::from("a")));
        assert_eq!(tick.get(out.schema.position("rcv.1.q").unwrap()), None);
    }

    #[test]
    fn test_overflow_stops_the_pass() {
        let set = set();
        let lines = vec![
            status(0, "Receiver a: q=1"),
            status(1, "Receiver b: q=1"),
            status(2, "Receiver c: q=1"),
        ];
        let err = run_pass(&lines, "a.log", &set, &SlotPlan::initial(&set), &PassOptions::default()).unwrap_err();
        assert_eq!(err.key, "c");
        assert_eq!(err.budget, 2);
    }

    #[test]
    fn test_malformed_tokens_counted() {
        let set = set();
        let lines = vec![status(0, "Correlator Status: sm=1 junk rx=2")];
        let out = run_pass(&lines, "a.log", &set, &SlotPlan::initial(&set), &PassOptions::default()).unwrap();
        assert_eq!(out.malformed[&DescriptorId(0)], Malformed { lines: 1, tokens: 1 });
        assert!(out.schema.position("rx=received").is_some());
    }

    // ── Skip percent ─────────────────────────────────────────────

    #[test]
    fn test_skip_percent_drops_early_ticks() {
        let set = set();
        let lines: Vec<String> = (0..10)
            .map(|i| status(i, &format!("Correlator Status: rx={}", 100 + i * 10)))
            .collect();
        let options = PassOptions { skip_percent: 50.0, ..Default::default() };
        let out = run_pass(&lines, "a.log", &set, &SlotPlan::initial(&set), &options).unwrap();
        assert_eq!(out.ticks.len(), 5);
        assert_eq!(out.primary_lines, 10);
        // The first kept tick still has a rate from the skipped one before it
        let rate = out.schema.position("rx /sec").unwrap();
        assert_eq!(out.ticks[0].get(rate), Some(&Value::Float(10.0)));
    }

    // ── Restarts ─────────────────────────────────────────────────

    #[test]
    fn test_restart_stanza_resets_rates() {
        let set = set();
        let lines = vec![
            "2019-04-08 13:00:00.000 ##### [1] - Correlator, version 10.3, started.".to_string(),
            status(1, "Correlator Status: rx=100"),
            status(2, "Correlator Status: rx=200"),
            "2019-04-08 13:00:03.000 ##### [1] - Correlator, version 10.3, started.".to_string(),
            status(4, "Correlator Status: rx=300"),
        ];
        let out = run_pass(&lines, "a.log", &set, &SlotPlan::initial(&set), &PassOptions::default()).unwrap();
        assert_eq!(out.restarts, 1);
        assert_eq!(out.stanzas.len(), 2);
        let rate = out.schema.position("rx /sec").unwrap();
        let rates: Vec<Option<&Value>> = out.ticks.iter().map(|t| t.get(rate)).collect();
        assert_eq!(rates, vec![None, Some(&Value::Float(100.0)), None]);
        let segments: Vec<usize> = out.ticks.iter().map(|t| t.segment).collect();
        assert_eq!(segments, vec![0, 0, 1]);
        let interval = out.schema.position("interval secs").unwrap();
        assert_eq!(out.ticks[2].get(interval), Some(&Value::Float(1.0)));
    }

    #[test]
    fn test_swapping_span_tracks_last_episode() {
        let set = set();
        let lines = vec![
            status(0, "Correlator Status: sm=1 si=0 so=0"),
            status(1, "Correlator Status: sm=1 si=3 so=0"),
            status(2, "Correlator Status: sm=1 si=0 so=0"),
            status(3, "Correlator Status: sm=1 si=0 so=0"),
            status(4, "Correlator Status: sm=1 si=0 so=2"),
            status(5, "Correlator Status: sm=1 si=0 so=0"),
        ];
        let out = run_pass(&lines, "a.log", &set, &SlotPlan::initial(&set), &PassOptions::default()).unwrap();
        let span = out.swapping.unwrap();
        assert_eq!(span.start_line, 2);
        assert_eq!(span.end_line, Some(6));
        assert_eq!(span.end_time.as_deref(), Some("2019-04-08 13:00:05.000"));
    }

    #[test]
    fn test_swapping_until_end_of_file() {
        let set = set();
        let lines = vec![
            status(0, "Correlator Status: sm=1 si=0 so=0"),
            status(1, "Correlator Status: sm=1 si=1 so=1"),
        ];
        let out = run_pass(&lines, "a.log", &set, &SlotPlan::initial(&set), &PassOptions::default()).unwrap();
        let span = out.swapping.unwrap();
        assert_eq!(span.start_line, 2);
        assert_eq!(span.end_line, None);

        let quiet = run_pass(&lines[..1], "a.log", &set, &SlotPlan::initial(&set), &PassOptions::default()).unwrap();
        assert!(quiet.swapping.is_none());
    }

    #[test]
    fn test_connections_outside_startup_stanza() {
        let set = set();
        let lines = vec![
            "2019-04-08 13:00:00.000 ##### [1] - Correlator, version 10.3, started.".to_string(),
            "2019-04-08 13:00:00.500 INFO  [1] - Receiver early (0x7efe38000b30) connected from 10.0.0.5:1000".to_string(),
            status(1, "Correlator Status: sm=1"),
            "2019-04-08 13:00:02.000 INFO  [1] - Receiver engine_send (0x7efe38000b31) connected from 10.0.0.5:1001".to_string(),
            "2019-04-08 13:00:03.000 WARN  [1] - Receiver engine_send (0x7efe38000b31) connected from 10.0.0.5:1001".to_string(),
        ];
        let out = run_pass(&lines, "a.log", &set, &SlotPlan::initial(&set), &PassOptions::default()).unwrap();
        assert_eq!(out.connections.events.len(), 1);
        assert_eq!(out.connections.events[0].lineno, 4);
        assert_eq!(out.connections.events[0].remote_process_name, "engine_send");
    }

    #[test]
    fn test_warns_feed_primary_columns() {
        let set = set();
        let lines = vec![
            status(0, "Correlator Status: sm=1"),
            "2019-04-08 13:00:01.000 WARN  [1] - careful".to_string(),
            "2019-04-08 13:00:02.000 WARN  [1] - careful".to_string(),
            status(3, "Correlator Status: sm=1"),
        ];
        let out = run_pass(&lines, "a.log", &set, &SlotPlan::initial(&set), &PassOptions::default()).unwrap();
        let warns = out.schema.position("warns").unwrap();
        assert_eq!(out.ticks[1].get(warns), Some(&Value::Int(2)));
        assert_eq!(out.fingerprints.warns, 2);
        assert_eq!(out.start_time.map(|t| format_timestamp(&t)).as_deref(), Some("2019-04-08 13:00:00.000"));
    }
}
