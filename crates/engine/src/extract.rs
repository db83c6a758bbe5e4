//! Extract — turn the body of a status line into column values.
//!
//! Each descriptor instance (a plain descriptor, or one slot of a keyed
//! descriptor) owns a [`FieldExtractor`] holding the previous observation so
//! that rates and deltas can be derived from consecutive lines.

use std::collections::{HashMap, HashSet};

use crate::conf::{Computed, LineDescriptor};
use crate::model::Value;
use crate::timeline::ColumnKind;

/// `key=value` pairs of one status line in the order they were logged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tokens<'a> {
    pub pairs: Vec<(&'a str, Value)>,
    /// Tokens skipped because they had no `key=value` shape
    pub malformed: usize,
}

impl<'a> Tokens<'a> {
    /// Last value logged for `raw`.
    pub fn get(&self, raw: &str) -> Option<&Value> {
        self.pairs.iter().rev().find(|(k, _)| *k == raw).map(|(_, v)| v)
    }

    fn number(&self, raw: &str) -> Option<f64> {
        self.get(raw).and_then(Value::as_f64)
    }
}

/// Split a status-line body into `key=value` pairs.
///
/// Double-quoted values are kept verbatim as strings. Unquoted values have
/// thousands separators removed and are coerced with [`Value::parse`].
pub fn tokenize(body: &str) -> Tokens<'_> {
    let bytes = body.as_bytes();
    let mut tokens = Tokens::default();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i].is_ascii_whitespace() {
            i += 1;
            continue;
        }

        let start = i;
        while i < bytes.len() && bytes[i] != b'=' && !bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i == start || i >= bytes.len() || bytes[i] != b'=' {
            while i < bytes.len() && !bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            tokens.malformed += 1;
            continue;
        }
        let key = &body[start..i];
        i += 1;

        if bytes.get(i) == Some(&b'"') {
            let value_start = i + 1;
            let value_end = body[value_start..]
                .find('"')
                .map(|n| value_start + n)
                .unwrap_or(bytes.len());
            tokens.pairs.push((key, Value::Str(body[value_start..value_end].to_string())));
            i = (value_end + 1).min(bytes.len());
        } else {
            let value_start = i;
            while i < bytes.len() && !bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            let raw = &body[value_start..i];
            let value = if raw.contains(',') {
                Value::parse(&raw.replace(',', ""))
            } else {
                Value::parse(raw)
            };
            tokens.pairs.push((key, value));
        }
    }

    tokens
}

#[derive(Debug, Clone, PartialEq)]
enum Source {
    Raw { raw: String, scale: Option<f64> },
    Computed(Computed),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayoutColumn {
    pub alias: String,
    pub kind: ColumnKind,
    source: Source,
}

impl LayoutColumn {
    pub fn computed(&self) -> Option<&Computed> {
        match &self.source {
            Source::Computed(c) => Some(c),
            Source::Raw { .. } => None,
        }
    }
}

/// Columns contributed by one descriptor, fixed by its first occurrence.
#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    columns: Vec<LayoutColumn>,
    /// Raw names this layout reads
    known: HashSet<String>,
}

impl Layout {
    /// Declared fields present in `first` (and computed fields whose sources
    /// are present) in declaration order, then undeclared fields under their
    /// raw names in logged order.
    pub fn discover(descriptor: &LineDescriptor, first: &Tokens<'_>) -> Layout {
        let mut columns = Vec::new();
        let mut known = HashSet::new();

        for spec in &descriptor.fields {
            match &spec.computed {
                Some(computed) => {
                    let present = match computed {
                        Computed::Rate { source } | Computed::Delta { source, .. } => {
                            first.get(source).is_some()
                        }
                        Computed::IsSwapping => first.get("si").is_some() && first.get("so").is_some(),
                        _ => true,
                    };
                    if present {
                        columns.push(LayoutColumn {
                            alias: spec.alias.clone(),
                            kind: ColumnKind::Computed,
                            source: Source::Computed(computed.clone()),
                        });
                    }
                }
                None => {
                    known.insert(spec.raw.clone());
                    if first.get(&spec.raw).is_some() {
                        columns.push(LayoutColumn {
                            alias: spec.alias.clone(),
                            kind: raw_kind(descriptor, &spec.raw),
                            source: Source::Raw { raw: spec.raw.clone(), scale: spec.scale },
                        });
                    }
                }
            }
        }

        let mut aliases: HashSet<String> = columns.iter().map(|c| c.alias.clone()).collect();
        for (raw, _) in &first.pairs {
            if known.contains(*raw) || !aliases.insert(raw.to_string()) {
                continue;
            }
            known.insert(raw.to_string());
            columns.push(LayoutColumn {
                alias: raw.to_string(),
                kind: raw_kind(descriptor, raw),
                source: Source::Raw { raw: raw.to_string(), scale: None },
            });
        }

        for spec in &descriptor.fields {
            match &spec.computed {
                Some(Computed::IsSwapping) => {
                    known.insert("si".to_string());
                    known.insert("so".to_string());
                }
                Some(c) => {
                    if let Some(source) = c.source() {
                        known.insert(source.to_string());
                    }
                }
                None => {}
            }
        }

        Layout { columns, known }
    }

    pub fn columns(&self) -> &[LayoutColumn] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

fn raw_kind(descriptor: &LineDescriptor, raw: &str) -> ColumnKind {
    if descriptor.is_counter(raw) {
        ColumnKind::Counter
    } else {
        ColumnKind::Field
    }
}

/// Per-line facts that computed fields depend on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickContext {
    pub epoch_secs: f64,
    pub lineno: usize,
    /// Warnings logged in the file so far
    pub warns_total: u64,
    pub errors_total: u64,
    /// Time of the first timestamped line of the file
    pub file_start_secs: Option<f64>,
}

#[derive(Debug, Clone)]
struct Snapshot {
    epoch_secs: f64,
    lineno: usize,
    warns_total: u64,
    errors_total: u64,
    numbers: HashMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    /// One value per layout column
    pub values: Vec<Option<Value>>,
    /// A counter went backwards since the previous observation
    pub restarted: bool,
}

#[derive(Debug)]
pub struct FieldExtractor {
    descriptor: String,
    counters: Vec<String>,
    layout: Layout,
    prev: Option<Snapshot>,
    /// Reference time for the first interval after a reset
    anchor_secs: Option<f64>,
    dropped: HashSet<String>,
}

impl FieldExtractor {
    pub fn new(descriptor: &LineDescriptor, layout: Layout) -> Self {
        Self {
            descriptor: descriptor.name.clone(),
            counters: descriptor.counters().map(str::to_string).collect(),
            layout,
            prev: None,
            anchor_secs: None,
            dropped: HashSet::new(),
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Forget the previous observation; the process restarted at `since_secs`.
    pub fn reset(&mut self, since_secs: Option<f64>) {
        self.prev = None;
        self.anchor_secs = since_secs;
    }

    pub fn extract(&mut self, tokens: &Tokens<'_>, ctx: &TickContext) -> Extraction {
        for (raw, _) in &tokens.pairs {
            if !self.layout.known.contains(*raw) && self.dropped.insert(raw.to_string()) {
                tracing::debug!(
                    descriptor = %self.descriptor,
                    field = %raw,
                    lineno = ctx.lineno,
                    "field not present in first status line; dropped"
                );
            }
        }

        let restarted = match &self.prev {
            Some(prev) => self.counters.iter().any(|c| {
                matches!((tokens.number(c), prev.numbers.get(c)), (Some(now), Some(before)) if now < *before)
            }),
            None => false,
        };
        if restarted {
            tracing::debug!(
                descriptor = %self.descriptor,
                lineno = ctx.lineno,
                "counter decreased; treating as process restart"
            );
        }
        let counters_prev = if restarted { None } else { self.prev.as_ref() };

        let values = self
            .layout
            .columns
            .iter()
            .map(|col| match &col.source {
                Source::Raw { raw, scale } => match (tokens.get(raw), scale) {
                    (Some(v), Some(scale)) => Some(match v.as_f64() {
                        Some(n) => Value::Float(n * scale),
                        None => v.clone(),
                    }),
                    (v, None) => v.cloned(),
                    (None, _) => None,
                },
                Source::Computed(computed) => self.compute(computed, tokens, ctx, counters_prev),
            })
            .collect();

        self.prev = Some(Snapshot {
            epoch_secs: ctx.epoch_secs,
            lineno: ctx.lineno,
            warns_total: ctx.warns_total,
            errors_total: ctx.errors_total,
            numbers: tokens
                .pairs
                .iter()
                .filter_map(|(k, v)| v.as_f64().map(|n| (k.to_string(), n)))
                .collect(),
        });

        Extraction { values, restarted }
    }

    /// Rates and deltas compare against `counters_prev`, which is `None` on
    /// the first observation and right after a restart.
    fn compute(
        &self,
        computed: &Computed,
        tokens: &Tokens<'_>,
        ctx: &TickContext,
        counters_prev: Option<&Snapshot>,
    ) -> Option<Value> {
        let prev = self.prev.as_ref();
        let dt = prev
            .map(|p| ctx.epoch_secs - p.epoch_secs)
            .filter(|dt| *dt > 0.0);
        let change = |source: &str| {
            let now = tokens.number(source)?;
            let before = counters_prev?.numbers.get(source)?;
            Some(now - before)
        };

        match computed {
            Computed::Rate { source } => Some(Value::Float(change(source)? / dt?)),
            Computed::Delta { source, scale } => Some(Value::Float(change(source)? * scale)),
            Computed::IntervalSecs => match prev {
                Some(p) => Some(Value::Float(ctx.epoch_secs - p.epoch_secs)),
                None => {
                    let anchor = self.anchor_secs.or(ctx.file_start_secs)?;
                    Some(Value::Float(ctx.epoch_secs - anchor))
                }
            },
            Computed::ErrorsSinceLast => {
                prev.map(|p| Value::Int(ctx.errors_total.saturating_sub(p.errors_total) as i64))
            }
            Computed::WarnsSinceLast => {
                prev.map(|p| Value::Int(ctx.warns_total.saturating_sub(p.warns_total) as i64))
            }
            Computed::LogLinesPerSec => {
                let p = prev?;
                Some(Value::Float(ctx.lineno.saturating_sub(p.lineno) as f64 / dt?))
            }
            Computed::IsSwapping => {
                let swapped = tokens.number("si")? + tokens.number("so")?;
                Some(Value::Int(i64::from(swapped > 0.0)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::{DescriptorId, DescriptorSet};

    fn ctx(epoch_secs: f64, lineno: usize) -> TickContext {
        TickContext {
            epoch_secs,
            lineno,
            warns_total: 0,
            errors_total: 0,
            file_start_secs: Some(0.0),
        }
    }

    fn jms() -> DescriptorSet {
        DescriptorSet::from_json_str(r#"{"userStatusLines": {
            "JMS Status": {"field:alias": {"s": "sent", "=s /sec": "sent /sec", "=q delta": "queue growth", "q": ""}}
        }}"#).unwrap()
    }

    fn column<'a>(layout: &Layout, e: &'a Extraction, alias: &str) -> Option<&'a Value> {
        let i = layout.columns().iter().position(|c| c.alias == alias)?;
        e.values[i].as_ref()
    }

    // ── Tokenizer ────────────────────────────────────────────────

    #[test]
    fn test_tokenize_status_body() {
        let t = tokenize(r#"sm=11 nctx=1 lcn="<none>" lct=0.0 rx=1,234,567"#);
        assert_eq!(t.malformed, 0);
        assert_eq!(t.get("sm"), Some(&Value::Int(11)));
        assert_eq!(t.get("lcn"), Some(&Value::from("<none>")));
        assert_eq!(t.get("lct"), Some(&Value::Float(0.0)));
        assert_eq!(t.get("rx"), Some(&Value::Int(1234567)));
    }

    #[test]
    fn test_tokenize_quoted_values_keep_spaces_and_commas() {
        let t = tokenize(r#"srn="a, b" n="12""#);
        assert_eq!(t.get("srn"), Some(&Value::from("a, b")));
        assert_eq!(t.get("n"), Some(&Value::from("12")));
    }

    #[test]
    fn test_tokenize_skips_malformed() {
        let t = tokenize("a=1 garbage =2 b=2");
        assert_eq!(t.malformed, 2);
        assert_eq!(t.pairs.len(), 2);
        assert_eq!(t.get("b"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_tokenize_unterminated_quote() {
        let t = tokenize(r#"a="open ended"#);
        assert_eq!(t.get("a"), Some(&Value::from("open ended")));
    }

    // ── Layout ───────────────────────────────────────────────────

    #[test]
    fn test_layout_declared_then_undeclared() {
        let set = jms();
        let d = set.get(DescriptorId(1));
        let layout = Layout::discover(d, &tokenize("extra=1 q=2 s=5"));
        let aliases: Vec<&str> = layout.columns().iter().map(|c| c.alias.as_str()).collect();
        assert_eq!(aliases, vec!["sent", "sent /sec", "queue growth", "q", "extra"]);
        assert_eq!(layout.columns()[0].kind, ColumnKind::Counter);
        assert_eq!(layout.columns()[1].kind, ColumnKind::Computed);
        assert_eq!(layout.columns()[4].kind, ColumnKind::Field);
    }

    #[test]
    fn test_layout_omits_computed_without_source() {
        let set = jms();
        let layout = Layout::discover(set.get(DescriptorId(1)), &tokenize("q=2"));
        let aliases: Vec<&str> = layout.columns().iter().map(|c| c.alias.as_str()).collect();
        assert_eq!(aliases, vec!["queue growth", "q"]);
    }

    #[test]
    fn test_primary_layout_scales_memory() {
        let set = DescriptorSet::builtin();
        let primary = set.primary();
        let first = tokenize("pm=2048 vm=4096 si=0.0 so=0.0 rx=1");
        let layout = Layout::discover(primary, &first);
        let mut ex = FieldExtractor::new(primary, layout.clone());
        let e = ex.extract(&first, &ctx(10.0, 5));
        assert_eq!(column(&layout, &e, "pm=resident MB"), Some(&Value::Float(2.0)));
        assert_eq!(column(&layout, &e, "vm=virtual MB"), Some(&Value::Float(4.0)));
        assert_eq!(column(&layout, &e, "is swapping"), Some(&Value::Int(0)));
        assert_eq!(column(&layout, &e, "interval secs"), Some(&Value::Float(10.0)));
        assert_eq!(column(&layout, &e, "rx /sec"), None);
        assert_eq!(column(&layout, &e, "errors"), None);
    }

    // ── Computed fields ──────────────────────────────────────────

    #[test]
    fn test_rate_absent_first_then_delta_over_time() {
        let set = jms();
        let d = set.get(DescriptorId(1));
        let first = tokenize("s=100 q=5");
        let layout = Layout::discover(d, &first);
        let mut ex = FieldExtractor::new(d, layout.clone());

        let e = ex.extract(&first, &ctx(0.0, 1));
        assert_eq!(column(&layout, &e, "sent /sec"), None);
        assert_eq!(column(&layout, &e, "queue growth"), None);
        assert!(!e.restarted);

        let e = ex.extract(&tokenize("s=150 q=2"), &ctx(5.0, 2));
        assert_eq!(column(&layout, &e, "sent /sec"), Some(&Value::Float(10.0)));
        assert_eq!(column(&layout, &e, "queue growth"), Some(&Value::Float(-3.0)));
    }

    #[test]
    fn test_rate_suppressed_after_counter_decrease() {
        let set = jms();
        let d = set.get(DescriptorId(1));
        let first = tokenize("s=100");
        let mut ex = FieldExtractor::new(d, Layout::discover(d, &first));
        let layout = ex.layout().clone();
        ex.extract(&first, &ctx(0.0, 1));

        let e = ex.extract(&tokenize("s=20"), &ctx(5.0, 2));
        assert!(e.restarted);
        assert_eq!(column(&layout, &e, "sent /sec"), None);

        let e = ex.extract(&tokenize("s=80"), &ctx(10.0, 3));
        assert!(!e.restarted);
        assert_eq!(column(&layout, &e, "sent /sec"), Some(&Value::Float(12.0)));
    }

    #[test]
    fn test_rate_absent_when_time_does_not_advance() {
        let set = jms();
        let d = set.get(DescriptorId(1));
        let first = tokenize("s=100");
        let mut ex = FieldExtractor::new(d, Layout::discover(d, &first));
        let layout = ex.layout().clone();
        ex.extract(&first, &ctx(3.0, 1));
        let e = ex.extract(&tokenize("s=110"), &ctx(3.0, 2));
        assert_eq!(column(&layout, &e, "sent /sec"), None);
    }

    #[test]
    fn test_reset_forgets_previous() {
        let set = jms();
        let d = set.get(DescriptorId(1));
        let first = tokenize("s=100");
        let mut ex = FieldExtractor::new(d, Layout::discover(d, &first));
        let layout = ex.layout().clone();
        ex.extract(&first, &ctx(0.0, 1));
        ex.reset(Some(8.0));
        let e = ex.extract(&tokenize("s=200"), &ctx(10.0, 9));
        assert_eq!(column(&layout, &e, "sent /sec"), None);
    }

    #[test]
    fn test_errors_warns_and_line_rate() {
        let set = DescriptorSet::builtin();
        let primary = set.primary();
        let first = tokenize("sm=1");
        let layout = Layout::discover(primary, &first);
        let mut ex = FieldExtractor::new(primary, layout.clone());
        ex.extract(&first, &TickContext { warns_total: 1, errors_total: 2, ..ctx(0.0, 10) });
        let e = ex.extract(
            &tokenize("sm=1"),
            &TickContext { warns_total: 4, errors_total: 2, ..ctx(5.0, 60) },
        );
        assert_eq!(column(&layout, &e, "warns"), Some(&Value::Int(3)));
        assert_eq!(column(&layout, &e, "errors"), Some(&Value::Int(0)));
        assert_eq!(column(&layout, &e, "log lines /sec"), Some(&Value::Float(10.0)));
        assert_eq!(column(&layout, &e, "interval secs"), Some(&Value::Float(5.0)));
    }

    #[test]
    fn test_late_field_dropped() {
        let set = jms();
        let d = set.get(DescriptorId(1));
        let first = tokenize("s=1");
        let mut ex = FieldExtractor::new(d, Layout::discover(d, &first));
        ex.extract(&first, &ctx(0.0, 1));
        let e = ex.extract(&tokenize("s=2 surprise=9"), &ctx(1.0, 2));
        assert_eq!(e.values.len(), ex.layout().len());
    }
}
