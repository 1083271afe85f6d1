//! series.rs
//!
//! One exported time series, as VictoriaMetrics writes it to `/api/v1/export`
//! and reads it back from `/api/v1/import`:
//!
//! ```json
//! {"metric":{"__name__":"up","job":"node"},"values":[1,1],"timestamps":[1700000000000,1700000015000]}
//! ```

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::PatchError;

/// Reserved label carrying the metric name.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// A single series record: its label set plus index-aligned samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesRecord {
    /// Label name → value, including `__name__`.
    pub metric: Map<String, Value>,

    /// Sample values, aligned with `timestamps`. NaN samples (staleness
    /// markers) are exported as `null` and must be written back as `null`.
    pub values: Vec<Option<f64>>,

    /// Sample times in milliseconds since the epoch, non-decreasing.
    pub timestamps: Vec<i64>,
}

impl SeriesRecord {
    /// Metric name from the `__name__` label, if present.
    pub fn name(&self) -> Option<&str> {
        self.metric.get(METRIC_NAME_LABEL).and_then(Value::as_str)
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// Streaming decoder over a newline-delimited record file.
///
/// Yields `(record_number, record)` with 1-based numbering. Only one record is
/// held in memory at a time. Whitespace between records (blank lines) is
/// skipped; a record whose arrays disagree in length is rejected.
pub struct RecordReader<R: Read> {
    inner: serde_json::StreamDeserializer<'static, serde_json::de::IoRead<R>, SeriesRecord>,
    count: usize,
}

impl<R: Read> RecordReader<R> {
    pub fn new(reader: R) -> Self {
        RecordReader {
            inner: serde_json::Deserializer::from_reader(reader).into_iter(),
            count: 0,
        }
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<(usize, SeriesRecord), PatchError>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.inner.next()?;
        self.count += 1;
        let record_no = self.count;

        Some(
            next.map_err(|e| PatchError::Decode(record_no, e))
                .and_then(|record| {
                    if record.values.len() != record.timestamps.len() {
                        return Err(PatchError::LengthMismatch {
                            record: record_no,
                            values: record.values.len(),
                            timestamps: record.timestamps.len(),
                        });
                    }
                    Ok((record_no, record))
                }),
        )
    }
}

/// Encode one record as a single JSON line.
pub fn write_record<W: Write>(
    writer: &mut W,
    record_no: usize,
    record: &SeriesRecord,
) -> Result<(), PatchError> {
    serde_json::to_writer(&mut *writer, record).map_err(|e| PatchError::Encode(record_no, e))?;
    writer
        .write_all(b"\n")
        .map_err(|e| PatchError::Encode(record_no, serde_json::Error::io(e)))
}
