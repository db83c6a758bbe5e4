//! Summary — per-column statistics over a file's ticks.

use serde::Serialize;

use crate::model::Value;
use crate::timeline::{ColumnKind, Schema, Tick};

/// Positions of the snapshot rows, as a percentage of the tick sequence.
pub const SNAPSHOT_PERCENTS: [usize; 5] = [0, 25, 50, 75, 100];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnStats {
    pub column: String,
    /// Ticks with a numeric value
    pub count: usize,
    pub min: f64,
    pub mean: f64,
    pub max: f64,
    /// Line of the tick holding the maximum
    pub max_line: usize,
    /// End minus start; for counters, the sum of increases within each
    /// process segment
    pub delta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub percent: usize,
    pub tick: usize,
    pub epoch_secs: f64,
    pub lineno: usize,
    pub values: Vec<Option<Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub ticks: usize,
    pub stats: Vec<ColumnStats>,
    pub snapshots: Vec<Snapshot>,
}

impl Summary {
    pub fn stat(&self, column: &str) -> Option<&ColumnStats> {
        self.stats.iter().find(|s| s.column == column)
    }
}

/// `None` when there are fewer than two ticks.
pub fn summarize(schema: &Schema, ticks: &[Tick]) -> Option<Summary> {
    if ticks.len() < 2 {
        return None;
    }

    let stats = schema
        .columns()
        .iter()
        .enumerate()
        .filter(|(_, c)| c.kind.is_statistic())
        .filter_map(|(i, c)| column_stats(&c.name, c.kind, i, ticks))
        .collect();

    let last = ticks.len() - 1;
    let snapshots = SNAPSHOT_PERCENTS
        .iter()
        .map(|&percent| {
            let index = last * percent / 100;
            let tick = &ticks[index];
            Snapshot {
                percent,
                tick: index,
                epoch_secs: tick.epoch_secs,
                lineno: tick.lineno,
                values: tick.values.clone(),
            }
        })
        .collect();

    Some(Summary { ticks: ticks.len(), stats, snapshots })
}

fn column_stats(name: &str, kind: ColumnKind, column: usize, ticks: &[Tick]) -> Option<ColumnStats> {
    let series: Vec<(f64, usize, usize)> = ticks
        .iter()
        .filter_map(|t| t.get(column).and_then(Value::as_f64).map(|v| (v, t.lineno, t.segment)))
        .collect();
    let (&(first, first_line, _), &(end, _, _)) = (series.first()?, series.last()?);

    let mut min = first;
    let mut max = first;
    let mut max_line = first_line;
    let mut sum = 0.0;
    for &(v, line, _) in &series {
        min = min.min(v);
        if v > max {
            max = v;
            max_line = line;
        }
        sum += v;
    }

    let delta = match kind {
        ColumnKind::Counter => counter_delta(series.iter().map(|&(v, _, segment)| (segment, v))),
        _ => end - first,
    };

    Some(ColumnStats {
        column: name.to_string(),
        count: series.len(),
        min,
        mean: sum / series.len() as f64,
        max,
        max_line,
        delta,
    })
}

/// Total increase of a counter over `(segment, value)` observations. The
/// sum restarts at every segment boundary and whenever the counter goes down.
pub fn counter_delta(values: impl IntoIterator<Item = (usize, f64)>) -> f64 {
    let mut total = 0.0;
    let mut prev: Option<(usize, f64)> = None;
    for (segment, v) in values {
        if let Some((prev_segment, p)) = prev {
            if segment == prev_segment && v >= p {
                total += v - p;
            }
        }
        prev = Some((segment, v));
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::DescriptorId;

    fn table(kind: ColumnKind, values: &[Option<Value>]) -> (Schema, Vec<Tick>) {
        let mut schema = Schema::default();
        schema.add("line num".into(), ColumnKind::Meta, DescriptorId(0));
        schema.add("rx".into(), kind, DescriptorId(0));
        let ticks = values
            .iter()
            .enumerate()
            .map(|(i, v)| Tick {
                epoch_secs: i as f64,
                lineno: (i + 1) * 10,
                segment: 0,
                values: vec![Some(Value::Int(i as i64)), v.clone()],
            })
            .collect();
        (schema, ticks)
    }

    fn ints(values: &[i64]) -> Vec<Option<Value>> {
        values.iter().map(|v| Some(Value::Int(*v))).collect()
    }

    // ── Delta ────────────────────────────────────────────────────

    #[test]
    fn test_counter_delta_across_restart() {
        assert_eq!(counter_delta([(0, 100.0), (0, 150.0), (0, 20.0), (0, 80.0)]), 110.0);
        assert_eq!(counter_delta([(0, 5.0)]), 0.0);
    }

    #[test]
    fn test_counter_delta_splits_at_segment_boundary() {
        // the restarted process starts above the old value
        assert_eq!(counter_delta([(0, 100.0), (0, 150.0), (1, 200.0), (1, 260.0)]), 110.0);
    }

    #[test]
    fn test_counter_column_respects_tick_segments() {
        let (schema, mut ticks) = table(ColumnKind::Counter, &ints(&[100, 150, 200, 260]));
        ticks[2].segment = 1;
        ticks[3].segment = 1;
        let s = summarize(&schema, &ticks).unwrap();
        assert_eq!(s.stat("rx").unwrap().delta, 110.0);
    }

    #[test]
    fn test_counter_column_uses_segment_sum() {
        let (schema, ticks) = table(ColumnKind::Counter, &ints(&[100, 150, 20, 80]));
        let s = summarize(&schema, &ticks).unwrap();
        assert_eq!(s.stat("rx").unwrap().delta, 110.0);
    }

    #[test]
    fn test_gauge_column_uses_end_minus_start() {
        let (schema, ticks) = table(ColumnKind::Field, &ints(&[100, 150, 20, 80]));
        let s = summarize(&schema, &ticks).unwrap();
        assert_eq!(s.stat("rx").unwrap().delta, -20.0);
    }

    // ── Min / mean / max ─────────────────────────────────────────

    #[test]
    fn test_mean_excludes_absent_and_strings() {
        let values = vec![
            Some(Value::Int(2)),
            None,
            Some(Value::from("n/a")),
            Some(Value::Float(4.0)),
        ];
        let (schema, ticks) = table(ColumnKind::Field, &values);
        let s = summarize(&schema, &ticks).unwrap();
        let rx = s.stat("rx").unwrap();
        assert_eq!(rx.count, 2);
        assert_eq!(rx.mean, 3.0);
        assert_eq!((rx.min, rx.max), (2.0, 4.0));
        assert_eq!(rx.max_line, 40);
    }

    #[test]
    fn test_meta_columns_skipped() {
        let (schema, ticks) = table(ColumnKind::Field, &ints(&[1, 2]));
        let s = summarize(&schema, &ticks).unwrap();
        assert!(s.stat("line num").is_none());
    }

    #[test]
    fn test_all_absent_column_has_no_stats() {
        let (schema, ticks) = table(ColumnKind::Field, &[None, None]);
        let s = summarize(&schema, &ticks).unwrap();
        assert!(s.stat("rx").is_none());
    }

    // ── Snapshots ────────────────────────────────────────────────

    #[test]
    fn test_snapshots_start_middle_end() {
        let (schema, ticks) = table(ColumnKind::Field, &ints(&[0, 1, 2, 3, 4, 5, 6, 7, 8]));
        let s = summarize(&schema, &ticks).unwrap();
        let at: Vec<usize> = s.snapshots.iter().map(|p| p.tick).collect();
        assert_eq!(at, vec![0, 2, 4, 6, 8]);
        assert_eq!(s.snapshots[4].lineno, 90);
    }

    #[test]
    fn test_too_few_ticks() {
        let (schema, ticks) = table(ColumnKind::Field, &ints(&[1]));
        assert!(summarize(&schema, &ticks).is_none());
    }
}
