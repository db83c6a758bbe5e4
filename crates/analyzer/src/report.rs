//! Output writers for one run: per-file JSON documents, the merged
//! warning/error listings and the overview.

use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::Serialize;

use engine::connections::{ConnectionRow, MIN_EVENTS_TO_REPORT};
use engine::dedup::{MergedFingerprint, Observation, Sample};
use engine::driver::KeySlots;
use engine::line::format_timestamp;
use engine::startup::StartupStanza;
use engine::summary::Summary;
use engine::timeline::{Schema, Tick};
use engine::{FileSummary, FileWarning, MergedReport, Severity};

use crate::runner::{FailedFile, RunOutput};

const MB_PER_GB: f64 = 1024.0;

#[derive(Serialize)]
struct StatusDocument<'a> {
    file: &'a str,
    columns: &'a Schema,
    ticks: &'a [Tick],
}

#[derive(Serialize)]
struct SummaryDocument<'a> {
    file: &'a str,
    instance: Option<String>,
    start_time: Option<&'a str>,
    end_time: Option<&'a str>,
    status_lines: usize,
    restarts: usize,
    passes: u32,
    warn_count: u64,
    error_count: u64,
    warnings: &'a [FileWarning],
    key_slots: &'a [KeySlots],
    summary: &'a Summary,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionDocument<'a> {
    file: &'a str,
    peak_connections: i64,
    rows: Vec<ConnectionRow>,
}

#[derive(Serialize)]
struct StanzaDocument<'a> {
    file: &'a str,
    stanzas: &'a [StartupStanza],
}

/// Write every output of the run into `dir`; returns the files written.
pub fn write_all(dir: &Path, run: &RunOutput, json: bool, max_unique: usize) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory {}", dir.display()))?;

    let mut written = Vec::new();
    for file in &run.files {
        if !file.ticks.is_empty() {
            let path = dir.join(format!("status.{}.json", file.name));
            write_json(&path, &StatusDocument { file: &file.name, columns: &file.schema, ticks: &file.ticks })?;
            written.push(path);
        }
        if let Some(summary) = &file.summary {
            let path = dir.join(format!("summary_status.{}.json", file.name));
            write_json(
                &path,
                &SummaryDocument {
                    file: &file.name,
                    instance: file.instance(),
                    start_time: file.start_time.as_deref(),
                    end_time: file.end_time.as_deref(),
                    status_lines: file.status_lines,
                    restarts: file.restarts,
                    passes: file.passes,
                    warn_count: file.warn_count,
                    error_count: file.error_count,
                    warnings: &file.warnings,
                    key_slots: &file.key_slots,
                    summary,
                },
            )?;
            written.push(path);
        }
        if !file.stanzas.is_empty() {
            let path = dir.join(format!("startup_stanza.{}.json", file.name));
            write_json(&path, &StanzaDocument { file: &file.name, stanzas: &file.stanzas })?;
            written.push(path);
        }
        if file.connections.events.len() >= MIN_EVENTS_TO_REPORT {
            let path = dir.join(format!("receiver_connections.{}.json", file.name));
            write_json(
                &path,
                &ConnectionDocument {
                    file: &file.name,
                    peak_connections: file.connections.peak(),
                    rows: file.connections.rows(),
                },
            )?;
            written.push(path);
        }
    }

    for (severity, file_name) in [(Severity::Warn, "logged_warnings.txt"), (Severity::Error, "logged_errors.txt")] {
        match render_fingerprints(&run.files, &run.report, severity, max_unique) {
            Some(text) => {
                let path = dir.join(file_name);
                write_text(&path, &text)?;
                written.push(path);
            }
            None => tracing::info!(kind = kind_name(severity), "none found in any file"),
        }
    }

    if json {
        let path = dir.join("logged_warnings_errors.json");
        write_json(&path, &run.report)?;
        written.push(path);
    }

    let path = dir.join("overview.txt");
    write_text(&path, &render_overview(&run.files, &run.failed))?;
    written.push(path);

    tracing::info!(dir = %dir.display(), files = written.len(), "wrote outputs");
    Ok(written)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut out = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut out, value)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    out.flush().with_context(|| format!("Failed to write {}", path.display()))
}

fn write_text(path: &Path, text: &str) -> Result<()> {
    std::fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))
}

fn kind_name(severity: Severity) -> &'static str {
    match severity {
        Severity::Warn => "warnings",
        Severity::Error => "errors",
    }
}

fn format_range(first: &NaiveDateTime, last: &NaiveDateTime) -> String {
    if first.date() == last.date() {
        format!("{} to {}", format_timestamp(first), last.format("%H:%M:%S%.3f"))
    } else {
        format!("{} to {}", format_timestamp(first), format_timestamp(last))
    }
}

fn write_sample(out: &mut String, prefix: &str, sample: &Sample) {
    let _ = writeln!(out, "{}{}", prefix, sample.line);
    for extra in &sample.extra_lines {
        let _ = writeln!(out, "{}{}", " ".repeat(prefix.len()), extra);
    }
}

fn write_observations(out: &mut String, merged: &MergedFingerprint) {
    for obs in &merged.observations {
        if obs.count == 1 {
            let _ = writeln!(out, "      1x at   {} in {}", format_timestamp(&obs.first_seen), obs.file);
        } else {
            let _ = writeln!(
                out,
                "      {}x {} in {}",
                obs.count,
                format_range(&obs.first_seen, &obs.last_seen),
                obs.file
            );
        }
    }
    for obs in &merged.observations {
        write_examples(out, obs);
    }
}

fn write_examples(out: &mut String, obs: &Observation) {
    let _ = writeln!(out, "      Examples from {}:", obs.file);
    for sample in &obs.samples {
        write_sample(out, &format!("       line {} : ", sample.lineno), sample);
    }
    if obs.omitted_samples > 0 {
        let _ = writeln!(out, "       ({} more not shown)", obs.omitted_samples);
    }
}

/// Text listing of one severity's merged fingerprints, or `None` when no
/// file logged any.
pub fn render_fingerprints(
    files: &[FileSummary],
    report: &MergedReport,
    severity: Severity,
    max_unique: usize,
) -> Option<String> {
    let merged = report.of(severity);
    if merged.is_empty() {
        return None;
    }
    let kind = kind_name(severity);
    let mut out = String::new();

    for file in files {
        let count = match severity {
            Severity::Warn => file.warn_count,
            Severity::Error => file.error_count,
        };
        let _ = writeln!(out, "{} {} in {}", count, kind, file.name);
    }
    out.push('\n');

    if report.truncated(severity) {
        let _ = writeln!(
            out,
            "WARNING: Some messages are NOT included in this file due to the limit of {} unique messages\n",
            max_unique
        );
    }
    let _ = writeln!(
        out,
        "Summary of {}, most frequent first, with number of occurrences of each normalized message indicated by 'xN':\n",
        kind
    );

    for fp in merged {
        let prefix = format!("--- {}x: ", fp.total);
        match (fp.total, fp.observations.as_slice()) {
            (1, [obs]) if !obs.samples.is_empty() => {
                let sample = &obs.samples[0];
                write_sample(&mut out, &prefix, sample);
                let _ = writeln!(out, "      in {} line {}", obs.file, sample.lineno);
            }
            _ => {
                let _ = writeln!(out, "{}{}", prefix, fp.fingerprint);
                write_observations(&mut out, fp);
            }
        }
        out.push('\n');
    }
    Some(out)
}

fn overview_key(file: &FileSummary) -> (String, Option<String>, String) {
    (
        file.instance().unwrap_or_else(|| "?".to_string()),
        file.start_time.clone(),
        file.name.clone(),
    )
}

fn field(out: &mut String, key: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "  {:15} {}", key, value);
}

fn write_stanza(out: &mut String, index: usize, stanza: &StartupStanza) {
    field(out, "Instance:", stanza.instance());
    let mut pid = stanza.pid.map_or_else(|| "?".to_string(), |p| p.to_string());
    if index > 0 {
        let _ = write!(
            pid,
            " restart #{} at {} (line {})",
            index + 1,
            stanza.start_time.as_deref().unwrap_or("?"),
            stanza.start_line.map_or_else(|| "?".to_string(), |l| l.to_string())
        );
    }
    field(out, "Process id:", pid);
    field(
        out,
        "Version:",
        format!(
            "{}; running on {}",
            stanza.version.as_deref().unwrap_or("?"),
            stanza.os.as_deref().unwrap_or("?")
        ),
    );
    let mut tz = stanza.utc_offset.clone().unwrap_or_else(|| "?".to_string());
    if let Some(name) = &stanza.timezone_name {
        let _ = write!(tz, " ({})", name);
    }
    field(out, "Log timezone:", tz);
    if let Some(cpus) = stanza.cpu_count {
        field(out, "Hardware:", format!("{} CPUs", cpus));
    }
    if let Some(physical) = stanza.physical_memory_mb {
        let mut memory = format!("{:.1} GB physical memory", physical / MB_PER_GB);
        if let Some(usable) = stanza.usable_memory_mb().filter(|u| *u != physical) {
            memory = format!("{:.1} GB usable, {}", usable / MB_PER_GB, memory);
        }
        field(out, "Memory:", memory);
    }
    if let Some(time) = &stanza.shutdown_time {
        field(
            out,
            "Clean shutdown:",
            format!("Requested at {} (reason: {})", time, stanza.shutdown_reason.as_deref().unwrap_or("?")),
        );
    }
    out.push('\n');
}

fn write_statistics(out: &mut String, file: &FileSummary, summary: &Summary) {
    let _ = writeln!(out, "  Logged errors = {}, warnings = {}", file.error_count, file.warn_count);

    if let (Some(rx), Some(tx)) = (summary.stat("rx /sec"), summary.stat("tx /sec")) {
        let _ = writeln!(
            out,
            "  Received event rate mean = {:.1} /sec (max = {:.1} /sec), sent mean = {:.1} /sec (max = {:.1} /sec)",
            rx.mean, rx.max, tx.mean, tx.max
        );
    }

    let usable = file.stanzas.first().and_then(StartupStanza::usable_memory_mb);
    if let Some(pm) = summary.stat("pm=resident MB") {
        let final_mb = file
            .column("pm=resident MB")
            .and_then(|i| summary.snapshots.last()?.values.get(i)?.as_ref()?.as_f64());
        let _ = writeln!(
            out,
            "  Correlator resident memory mean = {:.3} GB, final = {}",
            pm.mean / MB_PER_GB,
            final_mb.map_or_else(|| "?".to_string(), |mb| format!("{:.3} GB", mb / MB_PER_GB))
        );
        let share = usable
            .filter(|u| *u > 0.0)
            .map(|u| format!(" (={:.0}% of {:.1} GB usable)", 100.0 * pm.max / u, u / MB_PER_GB))
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "  Correlator resident memory max  = {:.3} GB{}, at line {}",
            pm.max / MB_PER_GB,
            share,
            pm.max_line
        );
    }

    if let Some(swapping) = summary.stat("is swapping") {
        if swapping.max == 0.0 {
            let _ = writeln!(out, "  Swapping occurrences = none");
        } else {
            let mut text = format!("  Swapping occurrences = {:.2}% of log file", 100.0 * swapping.mean);
            if let Some(span) = &file.swapping {
                let _ = write!(
                    text,
                    ", {} to {}, beginning at line {}",
                    span.start_time,
                    span.end_time.as_deref().unwrap_or("end"),
                    span.start_line
                );
            }
            let _ = writeln!(out, "{}", text);
        }
    }

    if !file.connections.is_empty() {
        let _ = writeln!(
            out,
            "  Receiver connection events = {}, most connected at once = {}",
            file.connections.events.len(),
            file.connections.peak()
        );
    }

    if let (Some(iq), Some(oq)) = (summary.stat("iq=queued input"), summary.stat("oq=queued output")) {
        let mut queued = format!("  Queued input max = {}", iq.max);
        if iq.max > 0.0 {
            let _ = write!(queued, " (line {})", iq.max_line);
        }
        let _ = writeln!(out, "{}, queued output max = {}", queued, oq.max);
    }
    out.push('\n');
}

/// Human-readable summary of every file, grouped by instance and then
/// ordered by start time.
pub fn render_overview(files: &[FileSummary], failed: &[FailedFile]) -> String {
    let mut ordered: Vec<&FileSummary> = files.iter().collect();
    ordered.sort_by_key(|f| overview_key(f));

    let mut out = String::new();
    for file in ordered {
        let _ = writeln!(out, "- {}", file.name);
        let (Some(start), Some(end)) = (&file.start_time, &file.end_time) else {
            let _ = writeln!(out, "  Not a valid log file\n");
            continue;
        };
        let _ = writeln!(out, "  {} to {}\n", start, end);

        if file.stanzas.is_empty() {
            let _ = writeln!(out, "  No startup stanza present in this file!\n");
        }
        for (index, stanza) in file.stanzas.iter().enumerate() {
            write_stanza(&mut out, index, stanza);
        }
        for warning in &file.warnings {
            if !matches!(warning, FileWarning::MissingStartupStanza) {
                let _ = writeln!(out, "  Note: {}", warning);
            }
        }

        match &file.summary {
            Some(summary) => write_statistics(&mut out, file, summary),
            None => {
                let _ = writeln!(out, "  Logged errors = {}, warnings = {}\n", file.error_count, file.warn_count);
            }
        }
    }

    for failure in failed {
        let _ = writeln!(out, "- {}", failure.input.name);
        let _ = writeln!(out, "  Failed: {}\n", failure.error);
    }
    out
}
