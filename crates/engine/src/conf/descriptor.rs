//! Descriptor — validated, immutable status-line descriptors.

use std::collections::HashSet;
use grep_matcher::Matcher;
use grep_regex::{RegexMatcher, RegexMatcherBuilder};

use super::builtin::{KB_PER_MB, PRIMARY_COLUMNS, PRIMARY_KB_FIELDS, PRIMARY_TRIGGER};
use super::model::{DescriptorConfig, StatusLineConfig};
use crate::error::ConfigError;

/// Initial column budget of a keyed descriptor that does not declare one.
pub const DEFAULT_MAX_KEYS: usize = 10;

/// Name of the capture group holding the resource key.
pub const KEY_GROUP: &str = "key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Defines the tick cadence
    Primary,
    /// Carried forward onto primary ticks
    Secondary,
}

#[derive(Debug, Clone)]
pub enum DescriptorKind {
    Simple,
    Keyed(KeyedSpec),
}

#[derive(Debug, Clone)]
pub struct KeyedSpec {
    pub pattern: String,
    pub matcher: RegexMatcher,
    /// Capture index of the `key` group
    pub key_group: usize,
    pub initial_budget: usize,
}

/// Derived field computed from the current and previous observation of the
/// same descriptor instance.
#[derive(Debug, Clone, PartialEq)]
pub enum Computed {
    /// Δsource / Δtime
    Rate { source: String },
    /// (source - previous source) × scale
    Delta { source: String, scale: f64 },
    /// Seconds since the previous observation (or since the file started)
    IntervalSecs,
    ErrorsSinceLast,
    WarnsSinceLast,
    LogLinesPerSec,
    /// 1 when `si + so > 0`
    IsSwapping,
}

impl Computed {
    /// Parse a computed-field marker, i.e. the raw name without its leading `=`.
    pub fn parse(marker: &str) -> Option<Computed> {
        let marker = marker.trim();
        match marker {
            "interval secs" => return Some(Computed::IntervalSecs),
            "errors" => return Some(Computed::ErrorsSinceLast),
            "warns" => return Some(Computed::WarnsSinceLast),
            "log lines /sec" => return Some(Computed::LogLinesPerSec),
            "is swapping" => return Some(Computed::IsSwapping),
            _ => {}
        }
        let source_of = |s: &str| {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        };
        if let Some(src) = marker.strip_suffix(" /sec") {
            return source_of(src).map(|source| Computed::Rate { source });
        }
        if let Some(src) = marker.strip_suffix(" delta MB") {
            return source_of(src).map(|source| Computed::Delta { source, scale: 1.0 / KB_PER_MB });
        }
        if let Some(src) = marker.strip_suffix(" delta") {
            return source_of(src).map(|source| Computed::Delta { source, scale: 1.0 });
        }
        None
    }

    /// Raw field this value is derived from, if any.
    pub fn source(&self) -> Option<&str> {
        match self {
            Computed::Rate { source } | Computed::Delta { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub raw: String,
    pub alias: String,
    pub computed: Option<Computed>,
    /// Multiplier applied to the raw numeric value (kB → MB)
    pub scale: Option<f64>,
}

impl FieldSpec {
    fn new(raw: &str, alias: &str) -> Result<Self, String> {
        let alias = if alias.is_empty() || alias == "=" {
            raw.trim_start_matches('=').to_string()
        } else {
            alias.to_string()
        };
        let computed = match raw.strip_prefix('=') {
            Some(marker) => Some(Computed::parse(marker).ok_or_else(|| raw.to_string())?),
            None => None,
        };
        Ok(Self { raw: raw.to_string(), alias, computed, scale: None })
    }
}

#[derive(Debug, Clone)]
pub struct LineDescriptor {
    pub id: DescriptorId,
    /// Trigger as configured
    pub name: String,
    /// Trigger with any trailing separator removed
    pub trigger: String,
    pub role: Role,
    pub kind: DescriptorKind,
    pub field_prefix: String,
    pub fields: Vec<FieldSpec>,
}

impl LineDescriptor {
    pub fn is_keyed(&self) -> bool {
        matches!(self.kind, DescriptorKind::Keyed(_))
    }

    pub fn keyed(&self) -> Option<&KeyedSpec> {
        match &self.kind {
            DescriptorKind::Keyed(spec) => Some(spec),
            DescriptorKind::Simple => None,
        }
    }

    pub fn field(&self, raw: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.raw == raw)
    }

    /// Raw fields that are sources of rates. These are monotonically
    /// increasing counters; a decrease means the process restarted.
    pub fn counters(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().filter_map(|f| match &f.computed {
            Some(Computed::Rate { source }) => Some(source.as_str()),
            _ => None,
        })
    }

    pub fn is_counter(&self, raw: &str) -> bool {
        self.counters().any(|c| c == raw)
    }
}

/// The immutable descriptor configuration for a whole run.
#[derive(Debug, Clone)]
pub struct DescriptorSet {
    descriptors: Vec<LineDescriptor>,
    user_charts: serde_json::Value,
}

impl DescriptorSet {
    /// Only the standard status line.
    pub fn builtin() -> Self {
        Self {
            descriptors: vec![primary_descriptor()],
            user_charts: serde_json::Value::Null,
        }
    }

    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        Self::from_config(DescriptorConfig::from_json_str(s)?)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Self::from_config(DescriptorConfig::from_toml_str(s)?)
    }

    /// Validate a configuration document. Any problem is fatal.
    pub fn from_config(config: DescriptorConfig) -> Result<Self, ConfigError> {
        let mut set = Self::builtin();
        let mut triggers: HashSet<String> = HashSet::new();
        triggers.insert(normalize_trigger(PRIMARY_TRIGGER));

        for (name, line) in config.user_status_lines {
            let trigger = normalize_trigger(&name);
            if trigger.is_empty() {
                return Err(ConfigError::EmptyTrigger);
            }
            if !triggers.insert(trigger.clone()) {
                return Err(ConfigError::AmbiguousTrigger(trigger));
            }
            let id = DescriptorId(set.descriptors.len());
            let descriptor = user_descriptor(id, name, trigger, line)?;
            tracing::debug!(
                descriptor = %descriptor.name,
                keyed = descriptor.is_keyed(),
                fields = descriptor.fields.len(),
                "registered user status line"
            );
            set.descriptors.push(descriptor);
        }

        set.user_charts = config.user_charts;
        Ok(set)
    }

    pub fn primary(&self) -> &LineDescriptor {
        &self.descriptors[0]
    }

    pub fn get(&self, id: DescriptorId) -> &LineDescriptor {
        &self.descriptors[id.0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &LineDescriptor> {
        self.descriptors.iter()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn user_charts(&self) -> &serde_json::Value {
        &self.user_charts
    }
}

/// Strip whitespace and an optional trailing `:` separator.
pub fn normalize_trigger(trigger: &str) -> String {
    let t = trigger.trim();
    t.strip_suffix(':').unwrap_or(t).trim_end().to_string()
}

fn primary_descriptor() -> LineDescriptor {
    let fields = PRIMARY_COLUMNS
        .iter()
        .filter_map(|(raw, alias)| FieldSpec::new(raw, alias).ok())
        .map(|mut f| {
            if PRIMARY_KB_FIELDS.contains(&f.raw.as_str()) {
                f.scale = Some(1.0 / KB_PER_MB);
            }
            f
        })
        .collect();

    LineDescriptor {
        id: DescriptorId(0),
        name: format!("{}:", PRIMARY_TRIGGER),
        trigger: PRIMARY_TRIGGER.to_string(),
        role: Role::Primary,
        kind: DescriptorKind::Simple,
        field_prefix: String::new(),
        fields,
    }
}

fn user_descriptor(
    id: DescriptorId,
    name: String,
    trigger: String,
    line: StatusLineConfig,
) -> Result<LineDescriptor, ConfigError> {
    let mut fields = Vec::with_capacity(line.field_alias.len());
    let mut aliases = HashSet::new();
    for (raw, alias) in &line.field_alias {
        let spec = FieldSpec::new(raw, alias).map_err(|field| ConfigError::InvalidComputedField {
            descriptor: name.clone(),
            field,
        })?;
        if !aliases.insert(spec.alias.clone()) {
            return Err(ConfigError::DuplicateAlias {
                descriptor: name,
                alias: spec.alias,
            });
        }
        fields.push(spec);
    }

    let kind = match line.key_regex {
        Some(pattern) => {
            let budget = line.max_keys_to_allocate_columns_for.unwrap_or(DEFAULT_MAX_KEYS);
            if budget == 0 {
                return Err(ConfigError::InvalidBudget(name));
            }
            let matcher = RegexMatcherBuilder::new()
                .build(&pattern)
                .map_err(|e| ConfigError::InvalidRegex {
                    descriptor: name.clone(),
                    reason: e.to_string(),
                })?;
            let key_group = matcher
                .capture_index(KEY_GROUP)
                .ok_or_else(|| ConfigError::MissingKeyGroup(name.clone()))?;
            DescriptorKind::Keyed(KeyedSpec {
                pattern,
                matcher,
                key_group,
                initial_budget: budget,
            })
        }
        None => {
            if line.max_keys_to_allocate_columns_for.is_some() {
                return Err(ConfigError::BudgetWithoutKey(name));
            }
            DescriptorKind::Simple
        }
    };

    Ok(LineDescriptor {
        id,
        name,
        trigger,
        role: Role::Secondary,
        kind,
        field_prefix: line.field_prefix.unwrap_or_default(),
        fields,
    })
}
