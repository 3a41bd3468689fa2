// InfluxDB line protocol encoding
//
// One line per group of `average_points` frames:
//
//   LIVE_MEASUREMENTS channel_data="[1.5,0.25,3.0]" 1700000000000000000
//
// Groups are fixed by time index: frames `k*n .. (k+1)*n` of the file share a
// line no matter how the records were batched. The field value is the
// per-channel mean of the selected stream, rounded to two decimals, one slot
// per channel of the file in ascending order. A channel with no surviving
// record in the group is written as `null` so the others keep their position.
// The timestamp is the mean frame time in nanoseconds.

use crate::error::{Result, UploadError};
use crate::types::{Batch, Record, StreamKind};

pub const FIELD_KEY: &str = "channel_data";

#[derive(Debug, Clone)]
pub struct LineEncoder {
    measurement: String,
    escaped_measurement: String,
    stream: StreamKind,
    average_points: usize,
}

impl LineEncoder {
    pub fn new(measurement: &str, stream: StreamKind, average_points: usize) -> Result<Self> {
        if measurement.trim().is_empty() {
            return Err(UploadError::InvalidParameter(
                "measurement name must not be empty".to_string(),
            ));
        }
        if average_points == 0 {
            return Err(UploadError::InvalidParameter(
                "average points must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            measurement: measurement.to_string(),
            escaped_measurement: escape_measurement(measurement),
            stream,
            average_points,
        })
    }

    pub fn stream(&self) -> StreamKind {
        self.stream
    }

    pub fn measurement_name(&self) -> &str {
        &self.measurement
    }

    pub fn average_points(&self) -> usize {
        self.average_points
    }

    pub fn lines(&self, batch: &Batch) -> Vec<String> {
        let frames = split_frames(&batch.records);
        let width = frames
            .iter()
            .flat_map(|frame| frame.iter())
            .map(|r| r.channel as usize + 1)
            .max()
            .unwrap_or(0)
            .max(batch.channels);

        let mut lines = Vec::new();
        let mut start = 0;
        while start < frames.len() {
            let key = self.group_key(frames[start]);
            let end = frames[start..]
                .iter()
                .position(|frame| self.group_key(frame) != key)
                .map_or(frames.len(), |n| start + n);
            lines.push(self.encode_group(&frames[start..end], width));
            start = end;
        }
        lines
    }

    pub fn encode(&self, batch: &Batch) -> String {
        self.lines(batch).join("\n")
    }

    fn group_key(&self, frame: &[Record]) -> u64 {
        frame[0].index / self.average_points as u64
    }

    fn encode_group(&self, frames: &[&[Record]], width: usize) -> String {
        let mut sums = vec![(0.0, 0usize); width];
        let mut ts_sum = 0.0;
        for frame in frames {
            ts_sum += frame[0].timestamp;
            for record in frame.iter() {
                let slot = &mut sums[record.channel as usize];
                slot.0 += record.field(self.stream);
                slot.1 += 1;
            }
        }

        let values: Vec<String> = sums
            .iter()
            .map(|(sum, n)| match n {
                0 => "null".to_string(),
                n => format_float(round2(sum / *n as f64)),
            })
            .collect();
        let timestamp_ns = (ts_sum / frames.len() as f64 * 1e9) as i64;

        format!(
            "{} {}=\"{}\" {}",
            self.escaped_measurement,
            FIELD_KEY,
            escape_string_field(&format!("[{}]", values.join(","))),
            timestamp_ns
        )
    }
}

/// Split a frame-ordered slice into runs sharing one time index
fn split_frames(records: &[Record]) -> Vec<&[Record]> {
    let mut frames = Vec::new();
    let mut start = 0;
    for i in 1..=records.len() {
        if i == records.len() || records[i].index != records[start].index {
            if i > start {
                frames.push(&records[start..i]);
            }
            start = i;
        }
    }
    frames
}

/// Frames averaged into each uploaded line, at least one
pub fn points_per_upload(upload_interval: f64, data_point_interval: f64) -> Result<usize> {
    if !(data_point_interval > 0.0) || !(upload_interval > 0.0) {
        return Err(UploadError::InvalidParameter(format!(
            "intervals must be positive (upload {}, data point {})",
            upload_interval, data_point_interval
        )));
    }
    Ok(((upload_interval / data_point_interval) as usize).max(1))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round_ties_even() / 100.0
}

/// Shortest round-trip rendering; whole numbers keep a trailing `.0`
pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let text = format!("{}", value);
    if text.contains('.') || text.contains('e') {
        text
    } else {
        format!("{}.0", text)
    }
}

pub fn escape_measurement(name: &str) -> String {
    name.replace(',', "\\,").replace(' ', "\\ ")
}

pub fn escape_string_field(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
