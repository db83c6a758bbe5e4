//! Builtin — the standard correlator status line.

/// Trigger of the primary status line; its ticks define the timeline cadence.
pub const PRIMARY_TRIGGER: &str = "Correlator Status";

/// Very old servers log the primary status line as `Status: sm=...`.
pub const LEGACY_PRIMARY_TRIGGER: &str = "Status: ";
pub(crate) const LEGACY_PRIMARY_FIRST_FIELD: &str = "sm=";

pub const KB_PER_MB: f64 = 1024.0;

/// Raw key → display alias, in default column order. Keys starting with `=`
/// are computed. An empty alias keeps the raw name. Keys present in a status
/// line but missing here are appended after these with their raw names.
pub(crate) const PRIMARY_COLUMNS: &[(&str, &str)] = &[
    ("=interval secs", ""),
    // queues first
    ("iq", "iq=queued input"),
    ("icq", "icq=queued input public"),
    ("oq", "oq=queued output"),
    ("rq", "rq=queued route"),
    ("runq", "runq=queued ctxs"),
    ("nc", "nc=ext+int consumers"),
    // rx/tx
    ("=rx /sec", ""),
    ("=tx /sec", ""),
    ("=rt /sec", ""),
    ("rx", "rx=received"),
    ("tx", "tx=sent"),
    ("rt", "rt=routed"),
    // things that take memory
    ("sm", "sm=monitor instances"),
    ("nctx", "nctx=contexts"),
    ("ls", "ls=listeners"),
    ("pm", "pm=resident MB"),
    ("vm", "vm=virtual MB"),
    ("jvm", "jvm=Java MB"),
    ("=pm delta MB", ""),
    ("=vm delta MB", ""),
    ("=jvm delta MB", ""),
    // swapping
    ("si", "si=swap pages read /sec"),
    ("so", "so=swap pages written /sec"),
    ("=is swapping", ""),
    // log messages since the previous status line
    ("=errors", ""),
    ("=warns", ""),
    ("=log lines /sec", ""),
    // slowest context and consumer; names are strings so they go last
    ("lcn", "lcn=slowest ctx"),
    ("lcq", "lcq=slowest ctx input queue"),
    ("lct", "lct=slowest ctx latency secs"),
    ("srn", "srn=slowest consumer/plugin"),
    ("srq", "srq=slowest consumer/plugin queue"),
];

/// Raw keys logged in kB but reported in MB.
pub(crate) const PRIMARY_KB_FIELDS: &[&str] = &["pm", "vm"];
