// Running min/max statistics for the inspection view
//
// A `Summary` is updated one record at a time and never needs the whole file.
// Memory grows with the number of channels only.

use crate::types::{Record, StreamKind};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Where an extreme value was observed
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub channel: u32,
    pub index: u64,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldRange {
    pub min: f64,
    pub max: f64,
    pub min_at: Location,
    pub max_at: Location,
}

impl FieldRange {
    fn first(value: f64, at: Location) -> Self {
        Self {
            min: value,
            max: value,
            min_at: at,
            max_at: at,
        }
    }

    fn observe(&mut self, value: f64, at: Location) {
        if value < self.min {
            self.min = value;
            self.min_at = at;
        }
        if value > self.max {
            self.max = value;
            self.max_at = at;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MinMax {
    pub min: f64,
    pub max: f64,
}

impl MinMax {
    fn observe(slot: &mut Option<MinMax>, value: f64) {
        match slot {
            Some(mm) => {
                mm.min = mm.min.min(value);
                mm.max = mm.max.max(value);
            }
            None => *slot = Some(MinMax { min: value, max: value }),
        }
    }
}

/// Per-channel extremes of every field
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelRange {
    pub amplitude: Option<MinMax>,
    pub phase: Option<MinMax>,
    pub frequency_delta: Option<MinMax>,
}

impl ChannelRange {
    fn get(&self, kind: StreamKind) -> Option<MinMax> {
        match kind {
            StreamKind::Amplitude => self.amplitude,
            StreamKind::Phase => self.phase,
            StreamKind::FrequencyDelta => self.frequency_delta,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub records: u64,
    pub amplitude: Option<FieldRange>,
    pub phase: Option<FieldRange>,
    pub frequency_delta: Option<FieldRange>,
    pub channels: BTreeMap<u32, ChannelRange>,
}

impl Summary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, record: &Record) {
        let at = Location {
            channel: record.channel,
            index: record.index,
            timestamp: record.timestamp,
        };
        self.records += 1;

        for (slot, value) in [
            (&mut self.amplitude, record.amplitude),
            (&mut self.phase, record.phase),
            (&mut self.frequency_delta, record.frequency_delta),
        ] {
            match slot {
                Some(range) => range.observe(value, at),
                None => *slot = Some(FieldRange::first(value, at)),
            }
        }

        let channel = self.channels.entry(record.channel).or_default();
        MinMax::observe(&mut channel.amplitude, record.amplitude);
        MinMax::observe(&mut channel.phase, record.phase);
        MinMax::observe(&mut channel.frequency_delta, record.frequency_delta);
    }

    pub fn range(&self, kind: StreamKind) -> Option<&FieldRange> {
        match kind {
            StreamKind::Amplitude => self.amplitude.as_ref(),
            StreamKind::Phase => self.phase.as_ref(),
            StreamKind::FrequencyDelta => self.frequency_delta.as_ref(),
        }
    }

    /// Mean of the per-channel minima and maxima, shown next to the global
    /// extremes in the inspection view
    pub fn average_extremes(&self, kind: StreamKind) -> Option<MinMax> {
        let ranges: Vec<MinMax> = self
            .channels
            .values()
            .filter_map(|c| c.get(kind))
            .collect();
        if ranges.is_empty() {
            return None;
        }
        let n = ranges.len() as f64;
        Some(MinMax {
            min: ranges.iter().map(|r| r.min).sum::<f64>() / n,
            max: ranges.iter().map(|r| r.max).sum::<f64>() / n,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }
}

/// Shared view of the active file's summary for the front-end
#[derive(Debug, Clone, Default)]
pub struct SummaryHandle {
    inner: Arc<RwLock<Summary>>,
}

impl SummaryHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, summary: &Summary) {
        *self.inner.write() = summary.clone();
    }

    pub fn reset(&self) {
        *self.inner.write() = Summary::default();
    }

    pub fn snapshot(&self) -> Summary {
        self.inner.read().clone()
    }
}
