/// File Reader Module
///
/// Streams detector files record by record. Each on-disk format implements
/// `RecordSource`; `FileReader` wraps a source and adds what every format
/// shares: the malformed-record policy, frame-aligned batching, the running
/// summary and the handle guard that keeps the resource count honest.
use crate::error::{Result, UploadError};
use crate::resources::{HandleGuard, ResourceTracker};
use crate::signal::{ChannelOffsets, TimestampMode};
use crate::summary::Summary;
use crate::types::{Batch, EntryId, FileFormat, FileMetadata, Record};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use uuid::Uuid;

pub mod csv;
pub mod npy;

pub use self::csv::CsvSource;
pub use self::npy::NpySource;

pub const DEFAULT_BATCH_SIZE: usize = 1024;

/// A lazy, forward-only producer of records from one file
pub trait RecordSource: Send {
    /// Next record, `Ok(None)` once the file is exhausted.
    ///
    /// A `MalformedRecord` error consumes the offending record; calling again
    /// continues with the one after it.
    fn next_record(&mut self) -> Result<Option<Record>>;

    fn metadata(&self) -> &FileMetadata;

    /// Records currently held in memory by the source
    fn buffered(&self) -> usize;

    /// Reposition so the next record is the first one of time index `index`.
    /// Seeking past the end leaves the source exhausted.
    fn seek(&mut self, index: u64) -> Result<()>;
}

/// What to do with a record that cannot be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MalformedPolicy {
    /// Log a warning, count it and continue with the next record
    #[default]
    Skip,
    /// Fail the whole file
    Abort,
}

#[derive(Debug, Clone)]
pub struct ReaderOptions {
    pub batch_size: usize,
    pub malformed: MalformedPolicy,
    pub timestamps: TimestampMode,
    /// Subtract each channel's mean amplitude and phase
    pub center: bool,
    /// Frames folded into one published line; batches end on a multiple of it
    pub group_frames: usize,
    /// Time index the first batch starts at
    pub start_index: u64,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            malformed: MalformedPolicy::Skip,
            timestamps: TimestampMode::Actual,
            center: false,
            group_frames: 1,
            start_index: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderStats {
    pub records_read: u64,
    pub records_skipped: u64,
    /// Largest number of records held at once (pending batch plus source window)
    pub peak_buffered: usize,
}

fn open_source(
    path: &Path,
    format: FileFormat,
    options: &ReaderOptions,
    offsets: Option<ChannelOffsets>,
) -> Result<Box<dyn RecordSource>> {
    match format {
        FileFormat::Npy => Ok(Box::new(NpySource::open(
            path,
            options.batch_size,
            options.timestamps,
            offsets,
        )?)),
        FileFormat::Csv => Ok(Box::new(CsvSource::open(path, options.timestamps, offsets)?)),
    }
}

/// Open a reader for `path`, holding one handle from `tracker` until dropped
pub fn open_reader(
    path: &Path,
    format: FileFormat,
    options: &ReaderOptions,
    tracker: &ResourceTracker,
) -> Result<FileReader> {
    if options.batch_size == 0 {
        return Err(UploadError::InvalidParameter(
            "batch size must be at least 1".to_string(),
        ));
    }

    let offsets = if options.center {
        Some(channel_means(path, format, options, tracker)?)
    } else {
        None
    };

    let guard = tracker.acquire();
    let mut source = open_source(path, format, options, offsets)?;
    if options.start_index > 0 {
        source.seek(options.start_index)?;
    }
    debug!(
        "Opened {:?} reader for {} at index {} ({} handles open)",
        format,
        path.display(),
        options.start_index,
        tracker.open_handles()
    );

    Ok(FileReader {
        channels: source.metadata().num_channels.unwrap_or(0),
        source,
        options: options.clone(),
        summary: Summary::new(),
        stats: ReaderStats::default(),
        lookahead: None,
        sequence: 0,
        entry_id: Uuid::nil(),
        _guard: guard,
    })
}

/// Pre-scan pass computing per-channel means for centering.
///
/// Runs a second source over the file so the streaming pass never has to
/// hold more than one batch.
fn channel_means(
    path: &Path,
    format: FileFormat,
    options: &ReaderOptions,
    tracker: &ResourceTracker,
) -> Result<ChannelOffsets> {
    let _guard = tracker.acquire();
    let mut source = open_source(path, format, options, None)?;
    let mut sums: HashMap<u32, (f64, f64, u64)> = HashMap::new();

    loop {
        match source.next_record() {
            Ok(Some(record)) => {
                let entry = sums.entry(record.channel).or_insert((0.0, 0.0, 0));
                entry.0 += record.amplitude;
                entry.1 += record.phase;
                entry.2 += 1;
            }
            Ok(None) => break,
            Err(UploadError::MalformedRecord { .. })
                if options.malformed == MalformedPolicy::Skip =>
            {
                continue
            }
            Err(e) => return Err(e),
        }
    }

    let mut amplitude = HashMap::with_capacity(sums.len());
    let mut phase = HashMap::with_capacity(sums.len());
    for (channel, (amp_sum, phase_sum, count)) in sums {
        amplitude.insert(channel, amp_sum / count as f64);
        phase.insert(channel, phase_sum / count as f64);
    }
    debug!("Centering offsets computed for {} channels", amplitude.len());
    Ok(ChannelOffsets::new(amplitude, phase))
}

pub struct FileReader {
    source: Box<dyn RecordSource>,
    options: ReaderOptions,
    summary: Summary,
    stats: ReaderStats,
    lookahead: Option<Record>,
    /// Widest frame seen so far, or the header's channel count
    channels: usize,
    sequence: u64,
    entry_id: EntryId,
    _guard: HandleGuard,
}

impl FileReader {
    /// Tag the batches this reader produces with a queue entry
    pub fn for_entry(mut self, entry_id: EntryId) -> Self {
        self.entry_id = entry_id;
        self
    }

    pub fn entry_id(&self) -> EntryId {
        self.entry_id
    }

    pub fn metadata(&self) -> &FileMetadata {
        self.source.metadata()
    }

    pub fn summary(&self) -> &Summary {
        &self.summary
    }

    pub fn stats(&self) -> ReaderStats {
        self.stats
    }

    pub fn options(&self) -> &ReaderOptions {
        &self.options
    }

    pub fn next_record(&mut self) -> Result<Option<Record>> {
        if let Some(record) = self.lookahead.take() {
            return Ok(Some(record));
        }

        loop {
            match self.source.next_record() {
                Ok(Some(record)) => {
                    self.summary.observe(&record);
                    self.stats.records_read += 1;
                    self.channels = self.channels.max(record.channel as usize + 1);
                    return Ok(Some(record));
                }
                Ok(None) => return Ok(None),
                Err(err @ UploadError::MalformedRecord { .. }) => match self.options.malformed {
                    MalformedPolicy::Skip => {
                        warn!("{}: {}", self.source.metadata().file_path.display(), err);
                        self.stats.records_skipped += 1;
                    }
                    MalformedPolicy::Abort => return Err(err),
                },
                Err(err) => return Err(err),
            }
        }
    }

    /// Next batch of up to `batch_size` records, extended so the last frame
    /// and the last line group (`group_frames` frames, counted from index 0)
    /// are complete. `Ok(None)` once the file is exhausted.
    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        let batch_size = self.options.batch_size;
        let group = self.options.group_frames.max(1) as u64;
        let mut records = Vec::with_capacity(batch_size);

        while records.len() < batch_size {
            match self.next_record()? {
                Some(record) => records.push(record),
                None => break,
            }
        }

        if let Some(last_group) = records.last().map(|r| r.index / group) {
            while let Some(record) = self.next_record()? {
                if record.index / group == last_group {
                    records.push(record);
                } else {
                    self.lookahead = Some(record);
                    break;
                }
            }
        }

        let buffered = records.len() + self.source.buffered();
        self.stats.peak_buffered = self.stats.peak_buffered.max(buffered);

        if records.is_empty() {
            return Ok(None);
        }

        let batch =
            Batch::new(self.entry_id, self.sequence, records).with_channels(self.channels);
        self.sequence += 1;
        Ok(Some(batch))
    }

    /// Continue from time index `index`; the next batch starts there.
    /// Sequence numbers keep counting.
    pub fn seek(&mut self, index: u64) -> Result<()> {
        self.lookahead = None;
        self.source.seek(index)?;
        debug!(
            "{} repositioned to index {}",
            self.source.metadata().file_path.display(),
            index
        );
        Ok(())
    }

    pub fn records(&mut self) -> Records<'_> {
        Records {
            reader: self,
            done: false,
        }
    }
}

impl std::fmt::Debug for FileReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileReader")
            .field("file", &self.source.metadata().file_path)
            .field("entry_id", &self.entry_id)
            .field("stats", &self.stats)
            .finish()
    }
}

/// Iterator over the remaining records; stops after the first error
pub struct Records<'a> {
    reader: &'a mut FileReader,
    done: bool,
}

impl Iterator for Records<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
