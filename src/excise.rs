//! excise.rs
//!
//! Removes samples recorded inside a bad time window from exported series.
//!
//! A series is assumed to contain at most one contiguous run of bad samples
//! (a single outage). The excised range is the envelope from the first bad
//! sample to the last one, so good samples interleaved inside that envelope
//! are dropped as well, and two separate bad runs are removed together with
//! everything between them.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::errors::PatchError;
use crate::metrics::{POINTS_REMOVED, SERIES_PATCHED, SERIES_PROCESSED};
use crate::series::{write_record, RecordReader, SeriesRecord};

/// Window of bad samples. Both bounds are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl TimeWindow {
    pub fn new(start_ms: i64, end_ms: i64) -> Self {
        TimeWindow { start_ms, end_ms }
    }

    pub fn from_datetimes(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        TimeWindow::new(start.timestamp_millis(), end.timestamp_millis())
    }

    /// `start < t < end`
    pub fn contains(&self, t: i64) -> bool {
        t > self.start_ms && t < self.end_ms
    }
}

/// Index range `[first_bad, last_bad)` spanning every bad timestamp.
///
/// With no bad timestamps the range is empty and sits at `timestamps.len()`.
pub fn bad_range(timestamps: &[i64], window: TimeWindow) -> Range<usize> {
    let len = timestamps.len();
    let mut first_bad = len;
    let mut last_bad = len;

    for (i, &t) in timestamps.iter().enumerate() {
        if window.contains(t) {
            last_bad = i + 1;
            if first_bad == len {
                first_bad = i;
            }
        }
    }

    first_bad..last_bad
}

/// Build the patched record: everything before the bad range followed by
/// everything after it, copied into freshly allocated buffers.
pub fn excise_record(record: &SeriesRecord, window: TimeWindow) -> (SeriesRecord, usize) {
    let bad = bad_range(&record.timestamps, window);
    let removed = bad.len();
    let keep = record.len() - removed;

    let mut values = Vec::with_capacity(keep);
    values.extend_from_slice(&record.values[..bad.start]);
    values.extend_from_slice(&record.values[bad.end..]);

    let mut timestamps = Vec::with_capacity(keep);
    timestamps.extend_from_slice(&record.timestamps[..bad.start]);
    timestamps.extend_from_slice(&record.timestamps[bad.end..]);

    let patched = SeriesRecord {
        metric: record.metric.clone(),
        values,
        timestamps,
    };
    (patched, removed)
}

/// Totals for one excision pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExciseSummary {
    pub series: usize,
    pub patched: usize,
    pub points_removed: usize,
}

/// Decode, excise and re-encode every record from `reader` into `writer`,
/// one record at a time. Unchanged records are written through as well.
pub fn excise_stream<R: Read, W: Write>(
    reader: R,
    writer: &mut W,
    window: TimeWindow,
) -> Result<ExciseSummary, PatchError> {
    let mut summary = ExciseSummary::default();

    for next in RecordReader::new(reader) {
        let (record_no, record) = next?;
        let (patched, removed) = excise_record(&record, window);

        if removed > 0 {
            debug!(
                record  = record_no,
                metric  = record.name().unwrap_or("<unnamed>"),
                removed = removed,
                kept    = patched.len(),
                "Excised bad points"
            );
            summary.patched += 1;
            summary.points_removed += removed;
        }
        summary.series += 1;

        write_record(writer, record_no, &patched)?;
    }

    SERIES_PROCESSED.inc_by(summary.series as u64);
    SERIES_PATCHED.inc_by(summary.patched as u64);
    POINTS_REMOVED.inc_by(summary.points_removed as u64);

    Ok(summary)
}

/// Excise `input` into `output`.
///
/// Writes go to a `.tmp` sibling which is renamed over `output` once complete,
/// so a crash mid-run never leaves a half-written file at `output`.
pub fn excise_file(
    input: &Path,
    output: &Path,
    window: TimeWindow,
) -> Result<ExciseSummary, PatchError> {
    let tmp = tmp_path(output);

    let source = File::open(input).map_err(PatchError::io(input))?;
    let sink = File::create(&tmp).map_err(PatchError::io(&tmp))?;

    let mut writer = BufWriter::new(sink);
    let summary = excise_stream(BufReader::new(source), &mut writer, window)?;

    let sink = writer
        .into_inner()
        .map_err(|e| PatchError::Io(tmp.clone(), e.into_error()))?;
    sink.sync_all().map_err(PatchError::io(&tmp))?;
    drop(sink);

    fs::rename(&tmp, output).map_err(PatchError::io(output))?;
    Ok(summary)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map, Value};

    fn record(timestamps: &[i64]) -> SeriesRecord {
        let mut metric = Map::new();
        metric.insert("__name__".into(), Value::from("temperature"));
        SeriesRecord {
            metric,
            values: timestamps.iter().map(|&t| Some(t as f64 * 10.0)).collect(),
            timestamps: timestamps.to_vec(),
        }
    }

    #[test]
    fn removes_contiguous_bad_run() {
        let input = record(&[1, 5, 10, 15, 20]);
        let window = TimeWindow::new(4, 16);

        assert_eq!(bad_range(&input.timestamps, window), 1..4);

        let (out, removed) = excise_record(&input, window);
        assert_eq!(removed, 3);
        assert_eq!(out.timestamps, vec![1, 20]);
        assert_eq!(out.values, vec![Some(10.0), Some(200.0)]);
        assert_eq!(out.metric, input.metric);
    }

    #[test]
    fn window_outside_series_is_identity() {
        let input = record(&[1, 2, 3]);
        let window = TimeWindow::new(100, 200);

        assert_eq!(bad_range(&input.timestamps, window), 3..3);
        let (out, removed) = excise_record(&input, window);
        assert_eq!(removed, 0);
        assert_eq!(out, input);
    }

    #[test]
    fn empty_series_stays_empty() {
        let input = record(&[]);
        let (out, removed) = excise_record(&input, TimeWindow::new(0, 10));
        assert_eq!(removed, 0);
        assert!(out.timestamps.is_empty());
        assert!(out.values.is_empty());
    }

    #[test]
    fn all_points_bad() {
        let input = record(&[5, 6, 7]);
        let (out, removed) = excise_record(&input, TimeWindow::new(0, 10));
        assert_eq!(removed, 3);
        assert!(out.timestamps.is_empty());
        assert!(out.values.is_empty());
    }

    #[test]
    fn bounds_are_exclusive() {
        let input = record(&[4, 5, 16]);
        let (out, removed) = excise_record(&input, TimeWindow::new(4, 16));
        assert_eq!(removed, 1);
        assert_eq!(out.timestamps, vec![4, 16]);
    }

    #[test]
    fn second_pass_is_a_noop() {
        let window = TimeWindow::new(4, 16);
        let (once, _) = excise_record(&record(&[1, 5, 10, 15, 20, 25]), window);
        let (twice, removed) = excise_record(&once, window);
        assert_eq!(removed, 0);
        assert_eq!(twice, once);
    }

    #[test]
    fn separate_bad_runs_remove_the_whole_envelope() {
        // 5 and 30 are bad; 45 is good but sits between them.
        let window = TimeWindow::new(0, 40);
        let input = record(&[5, 45, 30, 50]);
        let (out, removed) = excise_record(&input, window);
        assert_eq!(bad_range(&input.timestamps, window), 0..3);
        assert_eq!(removed, 3);
        assert_eq!(out.timestamps, vec![50]);
        assert_eq!(out.values, vec![Some(500.0)]);
    }

    #[test]
    fn lengths_stay_aligned() {
        let window = TimeWindow::new(3, 8);
        for n in 0..12 {
            let ts: Vec<i64> = (0..n).collect();
            let input = record(&ts);
            let bad = bad_range(&input.timestamps, window);
            let (out, removed) = excise_record(&input, window);
            assert_eq!(out.values.len(), out.timestamps.len());
            assert_eq!(removed, bad.len());
            assert_eq!(out.values.len(), input.values.len() - bad.len());
        }
    }

    #[test]
    fn stream_writes_every_record() {
        let input = format!(
            "{}\n{}\n",
            json!({"metric": {"__name__": "a"}, "values": [1.0, 2.0, 3.0], "timestamps": [1, 5, 20]}),
            json!({"metric": {"__name__": "b"}, "values": [1.0], "timestamps": [100]}),
        );
        let mut out = Vec::new();
        let summary =
            excise_stream(input.as_bytes(), &mut out, TimeWindow::new(4, 16)).unwrap();

        assert_eq!(
            summary,
            ExciseSummary {
                series: 2,
                patched: 1,
                points_removed: 1
            }
        );

        let written: Vec<SeriesRecord> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(written.len(), 2);
        assert_eq!(written[0].timestamps, vec![1, 20]);
        assert_eq!(written[0].values, vec![Some(1.0), Some(3.0)]);
        assert_eq!(written[1].timestamps, vec![100]);
    }

    #[test]
    fn null_samples_are_kept_or_dropped_by_timestamp() {
        let input = concat!(
            r#"{"metric":{"__name__":"up"},"values":[null,1,null,1,null],"timestamps":[1,5,10,15,20]}"#,
            "\n",
        );
        let mut out = Vec::new();
        let summary = excise_stream(input.as_bytes(), &mut out, TimeWindow::new(4, 16)).unwrap();
        assert_eq!(summary.points_removed, 3);

        let written: SeriesRecord =
            serde_json::from_str(String::from_utf8(out).unwrap().trim()).unwrap();
        assert_eq!(written.timestamps, vec![1, 20]);
        assert_eq!(written.values, vec![None, None]);
    }

    #[test]
    fn stream_stops_on_malformed_record() {
        let input = "{\"metric\":{},\"values\":[1],\"timestamps\":[1]}\nnot json\n";
        let mut out = Vec::new();
        let err = excise_stream(input.as_bytes(), &mut out, TimeWindow::new(0, 10)).unwrap_err();
        assert!(matches!(err, PatchError::Decode(2, _)));
    }

    #[test]
    fn file_is_replaced_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("metrics.jsonl");
        let output = dir.path().join("update.jsonl");
        fs::write(
            &input,
            "{\"metric\":{\"__name__\":\"x\"},\"values\":[1,2],\"timestamps\":[1,5]}\n",
        )
        .unwrap();
        fs::write(&output, "stale").unwrap();

        let summary = excise_file(&input, &output, TimeWindow::new(4, 16)).unwrap();
        assert_eq!(summary.points_removed, 1);

        let written = fs::read_to_string(&output).unwrap();
        let record: SeriesRecord = serde_json::from_str(written.trim()).unwrap();
        assert_eq!(record.timestamps, vec![1]);
        assert!(!tmp_path(&output).exists());
    }

    #[test]
    fn missing_input_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = excise_file(
            &dir.path().join("absent.jsonl"),
            &dir.path().join("out.jsonl"),
            TimeWindow::new(0, 1),
        )
        .unwrap_err();
        assert!(matches!(err, PatchError::Io(..)));
    }
}
