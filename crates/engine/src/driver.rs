//! Driver — run passes over a file until one completes.
//!
//! `Idle → Parsing → (AllocationOverflow → Parsing)* → Completed`. Each
//! overflow doubles the offending descriptor's budget in a new epoch; past
//! the ceiling the descriptor is disabled for this file instead.

use std::io::BufRead;
use std::path::Path;
use std::time::Instant;
use serde::Serialize;

use crate::conf::{DescriptorId, DescriptorSet};
use crate::connections::ConnectionLog;
use crate::dedup::{DedupLimits, FingerprintTable};
use crate::error::{AnalyzeError, FileWarning};
use crate::line::format_timestamp;
use crate::pass::{keyed_prefix, run_pass, PassOptions, PassOutput, SwappingSpan};
use crate::slots::{AllocationOverflow, Escalation, SlotPlan, DEFAULT_BUDGET_CEILING};
use crate::startup::StartupStanza;
use crate::summary::{summarize, Summary};
use crate::timeline::{Schema, Tick};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalyzeOptions {
    pub skip_percent: f64,
    /// Keyed descriptors whose budget would exceed this are disabled
    pub key_budget_ceiling: usize,
    pub dedup: DedupLimits,
}

impl Default for AnalyzeOptions {
    fn default() -> Self {
        Self {
            skip_percent: 0.0,
            key_budget_ceiling: DEFAULT_BUDGET_CEILING,
            dedup: DedupLimits::default(),
        }
    }
}

#[derive(Debug)]
pub enum ParseState {
    Idle,
    Parsing { epoch: u32 },
    AllocationOverflow(AllocationOverflow),
    Completed(Box<PassOutput>),
}

/// Final key → slot assignment of one keyed descriptor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeySlots {
    pub descriptor: String,
    pub column_prefix: String,
    pub budget: usize,
    pub epoch: u32,
    /// Keys by slot index
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileSummary {
    pub name: String,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub stanzas: Vec<StartupStanza>,
    pub schema: Schema,
    pub ticks: Vec<Tick>,
    pub summary: Option<Summary>,
    pub fingerprints: FingerprintTable,
    pub key_slots: Vec<KeySlots>,
    pub warnings: Vec<FileWarning>,
    pub warn_count: u64,
    pub error_count: u64,
    pub status_lines: usize,
    pub restarts: usize,
    pub swapping: Option<SwappingSpan>,
    pub connections: ConnectionLog,
    /// Passes needed to complete the file
    pub passes: u32,
}

impl FileSummary {
    /// Instance id from the first startup stanza.
    pub fn instance(&self) -> Option<String> {
        self.stanzas.first().map(StartupStanza::instance)
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.schema.position(name)
    }
}

/// Analyze one file's lines end to end.
pub fn analyze_lines<S: AsRef<str>>(
    name: &str,
    lines: &[S],
    set: &DescriptorSet,
    options: &AnalyzeOptions,
) -> FileSummary {
    let started = Instant::now();
    let pass_options = PassOptions {
        skip_percent: options.skip_percent,
        dedup: options.dedup,
    };

    let mut plan = SlotPlan::initial(set);
    let mut warnings = Vec::new();
    let mut passes = 0u32;
    let mut state = ParseState::Idle;

    let output = loop {
        state = match state {
            ParseState::Idle => ParseState::Parsing { epoch: plan.epoch },
            ParseState::Parsing { epoch } => {
                passes += 1;
                tracing::trace!(file = %name, epoch, "parsing");
                match run_pass(lines, name, set, &plan, &pass_options) {
                    Ok(output) => ParseState::Completed(Box::new(output)),
                    Err(overflow) => ParseState::AllocationOverflow(overflow),
                }
            }
            ParseState::AllocationOverflow(overflow) => {
                let descriptor = &set.get(overflow.descriptor).name;
                match plan.escalate(&overflow, options.key_budget_ceiling) {
                    Escalation::Retry { budget } => {
                        tracing::info!(
                            file = %name,
                            descriptor = %descriptor,
                            key = %overflow.key,
                            old_budget = overflow.budget,
                            new_budget = budget,
                            epoch = plan.epoch,
                            "too many keys; re-parsing with a larger budget"
                        );
                    }
                    Escalation::Disabled { budget } => {
                        tracing::warn!(
                            file = %name,
                            descriptor = %descriptor,
                            budget,
                            ceiling = options.key_budget_ceiling,
                            "too many keys; descriptor disabled for this file"
                        );
                        warnings.push(FileWarning::DescriptorDisabled {
                            descriptor: descriptor.clone(),
                            budget,
                            ceiling: options.key_budget_ceiling,
                        });
                    }
                }
                ParseState::Parsing { epoch: plan.epoch }
            }
            ParseState::Completed(output) => break *output,
        };
    };

    let summary = build_summary(name, set, options, output, warnings, passes);
    tracing::info!(
        file = %name,
        ticks = summary.ticks.len(),
        warns = summary.warn_count,
        errors = summary.error_count,
        passes,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "file analyzed"
    );
    summary
}

/// Read `reader` to the end (invalid UTF-8 replaced) and analyze it.
pub fn analyze_reader<R: BufRead>(
    name: &str,
    path: &Path,
    mut reader: R,
    set: &DescriptorSet,
    options: &AnalyzeOptions,
) -> Result<FileSummary, AnalyzeError> {
    let mut lines = Vec::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf).map_err(|source| AnalyzeError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        if n == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf);
        lines.push(line.trim_end_matches(['\n', '\r']).to_string());
    }
    tracing::debug!(file = %name, lines = lines.len(), "read file");
    Ok(analyze_lines(name, &lines, set, options))
}

fn build_summary(
    name: &str,
    set: &DescriptorSet,
    options: &AnalyzeOptions,
    output: PassOutput,
    mut warnings: Vec<FileWarning>,
    passes: u32,
) -> FileSummary {
    for (id, m) in &output.malformed {
        warnings.push(FileWarning::MalformedFields {
            descriptor: set.get(*id).name.clone(),
            lines: m.lines,
            tokens: m.tokens,
        });
    }
    if output.stanzas.iter().all(|s| s.start_time.is_none()) {
        tracing::warn!(file = %name, "no startup stanza found; instance metadata unavailable");
        warnings.push(FileWarning::MissingStartupStanza);
    }

    let summary = summarize(&output.schema, &output.ticks);
    if summary.is_none() {
        tracing::warn!(file = %name, ticks = output.ticks.len(), "fewer than two status lines; no statistics");
        warnings.push(FileWarning::TooFewStatusLines { count: output.ticks.len() });
    }
    if output.fingerprints.dropped_warnings + output.fingerprints.dropped_errors > 0 {
        warnings.push(FileWarning::FingerprintLimitReached {
            limit: options.dedup.max_unique,
        });
    }
    if output.unattached > 0 {
        warnings.push(FileWarning::UnattachedSecondaryRecords { count: output.unattached });
    }

    let key_slots = output
        .key_slots
        .iter()
        .map(|(id, table)| key_slots(set, *id, table))
        .collect();

    FileSummary {
        name: name.to_string(),
        start_time: output.start_time.as_ref().map(format_timestamp),
        end_time: output.end_time.as_ref().map(format_timestamp),
        stanzas: output.stanzas,
        schema: output.schema,
        ticks: output.ticks,
        summary,
        warn_count: output.fingerprints.warns,
        error_count: output.fingerprints.errors_count,
        fingerprints: output.fingerprints,
        key_slots,
        warnings,
        status_lines: output.primary_lines,
        restarts: output.restarts,
        swapping: output.swapping,
        connections: output.connections,
        passes,
    }
}

fn key_slots(set: &DescriptorSet, id: DescriptorId, table: &crate::slots::KeySlotTable) -> KeySlots {
    let descriptor = set.get(id);
    KeySlots {
        descriptor: descriptor.name.clone(),
        column_prefix: keyed_prefix(descriptor),
        budget: table.budget,
        epoch: table.epoch,
        keys: table.keys().to_vec(),
    }
}
