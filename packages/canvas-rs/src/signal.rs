// I/Q to amplitude / phase / frequency-delta conversion
//
// Readers hand raw (I, Q) pairs to a `SampleDeriver`, which turns them into
// records. The deriver keeps the previous phase of every channel so the
// frequency delta can be computed without looking back into the file.

use crate::types::Record;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::f64::consts::PI;

pub fn amplitude(i: f64, q: f64) -> f64 {
    i.hypot(q)
}

pub fn phase(i: f64, q: f64) -> f64 {
    q.atan2(i)
}

/// Wrap a phase difference into (-π, π]
pub fn wrap_phase(delta: f64) -> f64 {
    let mut wrapped = (delta + PI).rem_euclid(2.0 * PI) - PI;
    if wrapped <= -PI {
        wrapped += 2.0 * PI;
    }
    wrapped
}

/// Where record timestamps come from
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TimestampMode {
    /// Use the timestamps stored in the file
    Actual,
    /// `start + index * interval` seconds
    Synthetic { start: f64, interval: f64 },
}

impl Default for TimestampMode {
    fn default() -> Self {
        TimestampMode::Actual
    }
}

impl TimestampMode {
    /// Synthetic timestamps starting now, the uploader's historical default
    pub fn synthetic_from_now(interval: f64) -> Self {
        let now = chrono::Utc::now();
        TimestampMode::Synthetic {
            start: now.timestamp() as f64 + now.timestamp_subsec_micros() as f64 / 1e6,
            interval,
        }
    }

    pub fn resolve(&self, index: u64, file_timestamp: f64) -> f64 {
        match *self {
            TimestampMode::Actual => file_timestamp,
            TimestampMode::Synthetic { start, interval } => start + index as f64 * interval,
        }
    }
}

/// Per-channel offsets subtracted when centering is enabled
#[derive(Debug, Clone, Default)]
pub struct ChannelOffsets {
    amplitude: HashMap<u32, f64>,
    phase: HashMap<u32, f64>,
}

impl ChannelOffsets {
    pub fn new(amplitude: HashMap<u32, f64>, phase: HashMap<u32, f64>) -> Self {
        Self { amplitude, phase }
    }

    pub fn amplitude(&self, channel: u32) -> f64 {
        self.amplitude.get(&channel).copied().unwrap_or(0.0)
    }

    pub fn phase(&self, channel: u32) -> f64 {
        self.phase.get(&channel).copied().unwrap_or(0.0)
    }
}

#[derive(Debug, Default)]
pub struct SampleDeriver {
    previous: HashMap<u32, (f64, f64)>,
    offsets: Option<ChannelOffsets>,
}

impl SampleDeriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_offsets(offsets: ChannelOffsets) -> Self {
        Self {
            previous: HashMap::new(),
            offsets: Some(offsets),
        }
    }

    /// Forget the previous phases, as after a jump in the stream
    pub fn reset(&mut self) {
        self.previous.clear();
    }

    /// Build the record for one (I, Q) sample.
    ///
    /// The frequency delta is taken from the raw phase, before any centering
    /// offset, so centering never changes it.
    pub fn derive(&mut self, index: u64, timestamp: f64, channel: u32, i: f64, q: f64) -> Record {
        let raw_phase = phase(i, q);
        let frequency_delta = match self.previous.insert(channel, (raw_phase, timestamp)) {
            Some((prev_phase, prev_ts)) if timestamp > prev_ts => {
                wrap_phase(raw_phase - prev_phase) / (2.0 * PI * (timestamp - prev_ts))
            }
            _ => 0.0,
        };

        let mut amp = amplitude(i, q);
        let mut ph = raw_phase;
        if let Some(offsets) = &self.offsets {
            amp -= offsets.amplitude(channel);
            ph -= offsets.phase(channel);
        }

        Record {
            index,
            timestamp,
            channel,
            amplitude: amp,
            phase: ph,
            frequency_delta,
        }
    }
}
