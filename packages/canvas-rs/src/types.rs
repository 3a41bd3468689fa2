use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Identifier assigned to a file when it is enqueued
pub type EntryId = Uuid;

/// One sample of one sensor channel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Time index (column of the source array)
    pub index: u64,
    /// Seconds since the Unix epoch
    pub timestamp: f64,
    /// 0-based sensor channel
    pub channel: u32,
    pub amplitude: f64,
    /// Radians in (-π, π]
    pub phase: f64,
    /// Instantaneous frequency deviation in Hz
    pub frequency_delta: f64,
}

impl Record {
    pub fn field(&self, kind: StreamKind) -> f64 {
        match kind {
            StreamKind::Amplitude => self.amplitude,
            StreamKind::Phase => self.phase,
            StreamKind::FrequencyDelta => self.frequency_delta,
        }
    }
}

/// Bounded, frame-aligned group of records sent to a transport in one call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub entry_id: EntryId,
    pub sequence: u64,
    pub records: Vec<Record>,
    /// Channel count of the source file; encoded frames always carry this
    /// many values even when some records were dropped
    #[serde(default)]
    pub channels: usize,
}

impl Batch {
    pub fn new(entry_id: EntryId, sequence: u64, records: Vec<Record>) -> Self {
        let channels = records
            .iter()
            .map(|r| r.channel as usize + 1)
            .max()
            .unwrap_or(0);
        Self {
            entry_id,
            sequence,
            records,
            channels,
        }
    }

    /// Widen the frame to `channels`; never narrower than the records present
    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = self.channels.max(channels);
        self
    }

    /// Time index of the last record
    pub fn last_index(&self) -> Option<u64> {
        self.records.last().map(|r| r.index)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of distinct time indices in the batch
    pub fn num_frames(&self) -> usize {
        let mut frames = 0;
        let mut last = None;
        for record in &self.records {
            if last != Some(record.index) {
                frames += 1;
                last = Some(record.index);
            }
        }
        frames
    }
}

/// Field published to the viewer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Amplitude,
    Phase,
    FrequencyDelta,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Amplitude => "AMPLITUDES",
            StreamKind::Phase => "PHASES",
            StreamKind::FrequencyDelta => "FREQUENCY_DELTAS",
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared on-disk format of a data file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    /// NumPy array: row 0 timestamps, rows 1.. complex I/Q per sensor
    Npy,
    /// Text rows `timestamp,channel,i,q`
    Csv,
}

impl FileFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "npy" => Some(FileFormat::Npy),
            "csv" | "txt" => Some(FileFormat::Csv),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }

    pub fn supported_extensions() -> Vec<&'static str> {
        vec!["npy", "csv", "txt"]
    }
}

/// Processing state of a queued file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Pending,
    Active,
    Exhausted,
    Failed,
    UserSwitched,
}

impl FileState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FileState::Exhausted | FileState::Failed | FileState::UserSwitched
        )
    }
}

/// What a reader learned from a file's header
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_path: PathBuf,
    pub format: FileFormat,
    pub file_size: u64,
    pub num_channels: Option<usize>,
    pub num_samples: Option<usize>,
    pub dtype: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(index: u64, channel: u32) -> Record {
        Record {
            index,
            timestamp: index as f64,
            channel,
            amplitude: 1.0,
            phase: 0.5,
            frequency_delta: -2.0,
        }
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(FileFormat::from_path(Path::new("a.npy")), Some(FileFormat::Npy));
        assert_eq!(FileFormat::from_path(Path::new("a.NPY")), Some(FileFormat::Npy));
        assert_eq!(FileFormat::from_path(Path::new("a.csv")), Some(FileFormat::Csv));
        assert_eq!(FileFormat::from_path(Path::new("a.txt")), Some(FileFormat::Csv));
        assert_eq!(FileFormat::from_path(Path::new("a.edf")), None);
        assert_eq!(FileFormat::from_path(Path::new("noext")), None);
    }

    #[test]
    fn test_batch_frames() {
        let batch = Batch::new(
            Uuid::new_v4(),
            0,
            vec![record(0, 0), record(0, 1), record(1, 0), record(1, 1), record(2, 0)],
        );
        assert_eq!(batch.len(), 5);
        assert_eq!(batch.num_frames(), 3);
        assert_eq!(batch.channels, 2);
        assert_eq!(batch.last_index(), Some(2));
    }

    #[test]
    fn test_batch_width_covers_dropped_channels() {
        let batch = Batch::new(Uuid::new_v4(), 0, vec![record(0, 1)]).with_channels(4);
        assert_eq!(batch.channels, 4);
        let narrowed = Batch::new(Uuid::new_v4(), 0, vec![record(0, 5)]).with_channels(2);
        assert_eq!(narrowed.channels, 6);
    }

    #[test]
    fn test_record_field_selection() {
        let r = record(3, 2);
        assert_eq!(r.field(StreamKind::Amplitude), 1.0);
        assert_eq!(r.field(StreamKind::Phase), 0.5);
        assert_eq!(r.field(StreamKind::FrequencyDelta), -2.0);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!FileState::Pending.is_terminal());
        assert!(!FileState::Active.is_terminal());
        assert!(FileState::Exhausted.is_terminal());
        assert!(FileState::Failed.is_terminal());
        assert!(FileState::UserSwitched.is_terminal());
    }
}
