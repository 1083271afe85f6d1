//! Prometheus registry and run counters.
//!
//! The tool is a one-shot batch, so nothing is scraped: the registry can be
//! dumped to a file for node_exporter's textfile collector at the end of a run.

use std::path::Path;

use once_cell::sync::Lazy;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounter, Opts, Registry, TextEncoder};

use crate::errors::PatchError;

/// Global registry under crate namespace
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("vm_patch_metrics".into()), None)
        .expect("failed to create Prometheus registry")
});

fn counter(name: &str, help: &str) -> IntCounter {
    let c = IntCounter::with_opts(Opts::new(name, help)).expect("counter opts");
    REGISTRY.register(Box::new(c.clone())).expect("register counter");
    c
}

/// Series read from the export file
pub static SERIES_PROCESSED: Lazy<IntCounter> =
    Lazy::new(|| counter("series_processed_total", "Series decoded during excision"));

/// Series that lost at least one point
pub static SERIES_PATCHED: Lazy<IntCounter> =
    Lazy::new(|| counter("series_patched_total", "Series with points removed"));

/// Points dropped across all series
pub static POINTS_REMOVED: Lazy<IntCounter> =
    Lazy::new(|| counter("points_removed_total", "Samples removed from the bad window"));

/// Bytes received from the export endpoint
pub static EXPORTED_BYTES: Lazy<IntCounter> =
    Lazy::new(|| counter("exported_bytes_total", "Bytes written to the export file"));

/// Wall time of each pipeline stage
pub static STAGE_HISTOGRAM: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new("stage_duration_seconds", "Duration of each pipeline stage");
    let h = HistogramVec::new(opts, &["stage"]).expect("histogram opts");
    REGISTRY.register(Box::new(h.clone())).expect("register histogram");
    h
});

/// Encode all metrics as text
pub fn gather_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let mf = REGISTRY.gather();
    encoder.encode(&mf, &mut buffer).expect("failed to encode");
    String::from_utf8(buffer).expect("invalid utf8")
}

/// Write the text exposition to `path`.
pub fn write_textfile(path: &Path) -> Result<(), PatchError> {
    std::fs::write(path, gather_metrics()).map_err(PatchError::io(path))
}
