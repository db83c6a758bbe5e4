//! Timeline — the output table and the merge of status streams onto it.
//!
//! Only primary status lines create ticks. Secondary records wait until the
//! first primary tick at or after their timestamp, then their values are
//! carried forward onto every later tick until replaced. Ticks before a
//! secondary descriptor's first observation have no value for it.
//!
//! Each tick also carries the process segment it belongs to. The segment
//! advances whenever the process restarts, so counters are never compared
//! across a restart.

use std::collections::{HashMap, VecDeque};
use serde::Serialize;

use crate::conf::DescriptorId;
use crate::model::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    /// datetime, epoch secs, line num
    Meta,
    Field,
    /// Monotonic counter that resets when the process restarts
    Counter,
    Computed,
    /// Key held by a keyed descriptor's slot
    SlotKey,
}

impl ColumnKind {
    pub fn is_statistic(&self) -> bool {
        !matches!(self, ColumnKind::Meta | ColumnKind::SlotKey)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
    #[serde(skip)]
    pub descriptor: DescriptorId,
}

/// Ordered, append-only set of output columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Schema {
    columns: Vec<Column>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl Schema {
    /// Index of the column called `name`, appending it if new.
    pub fn add(&mut self, name: String, kind: ColumnKind, descriptor: DescriptorId) -> usize {
        if let Some(i) = self.index.get(&name) {
            return *i;
        }
        let i = self.columns.len();
        self.index.insert(name.clone(), i);
        self.columns.push(Column { name, kind, descriptor });
        i
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// One row of the output table. Every tick of a file has one value per
/// schema column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tick {
    pub epoch_secs: f64,
    pub lineno: usize,
    /// Process restarts seen before this tick
    pub segment: usize,
    pub values: Vec<Option<Value>>,
}

impl Tick {
    pub fn get(&self, column: usize) -> Option<&Value> {
        self.values.get(column).and_then(Option::as_ref)
    }
}

/// Column values contributed by one status line.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub epoch_secs: f64,
    pub lineno: usize,
    /// (schema column, value)
    pub cells: Vec<(usize, Option<Value>)>,
}

#[derive(Debug, Default)]
pub struct TimelineMerger {
    carried: Vec<Option<Value>>,
    pending: VecDeque<Record>,
    ticks: Vec<Tick>,
    segment: usize,
}

impl TimelineMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later ticks belong to a new process segment.
    pub fn restart(&mut self) {
        self.segment += 1;
    }

    pub fn push_secondary(&mut self, record: Record) {
        self.pending.push_back(record);
    }

    /// Attach due secondary records and emit a tick for `record`. With
    /// `keep` false the carried state still advances but no tick is emitted.
    pub fn push_primary(&mut self, record: Record, keep: bool) {
        let mut still_pending = VecDeque::with_capacity(self.pending.len());
        while let Some(secondary) = self.pending.pop_front() {
            if secondary.epoch_secs <= record.epoch_secs {
                for (column, value) in secondary.cells {
                    set(&mut self.carried, column, value);
                }
            } else {
                still_pending.push_back(secondary);
            }
        }
        self.pending = still_pending;

        if !keep {
            return;
        }

        let mut values = self.carried.clone();
        for (column, value) in record.cells {
            set(&mut values, column, value);
        }
        self.ticks.push(Tick {
            epoch_secs: record.epoch_secs,
            lineno: record.lineno,
            segment: self.segment,
            values,
        });
    }

    /// Ticks ordered by time (ties keep line order), each padded to
    /// `schema_len` values, plus the number of secondary records that no
    /// primary tick followed.
    pub fn finish(self, schema_len: usize) -> (Vec<Tick>, usize) {
        let mut ticks = self.ticks;
        for tick in &mut ticks {
            tick.values.resize(schema_len, None);
        }
        ticks.sort_by(|a, b| a.epoch_secs.total_cmp(&b.epoch_secs));
        (ticks, self.pending.len())
    }
}

fn set(values: &mut Vec<Option<Value>>, column: usize, value: Option<Value>) {
    if values.len() <= column {
        values.resize(column + 1, None);
    }
    values[column] = value;
}
