use super::RecordSource;
use crate::error::{Result, UploadError};
use crate::npy::NpyHeader;
use crate::signal::{ChannelOffsets, SampleDeriver, TimestampMode};
use crate::types::{FileFormat, FileMetadata, Record};
use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::Path;

/// NumPy detector file reader
///
/// Expects a 2-D array of shape `(1 + channels, samples)`: row 0 holds the
/// timestamps, the remaining rows the I/Q samples of each sensor. Only a
/// window of columns is resident; it is refilled by seeking, so C and
/// Fortran ordered arrays are both streamed.
#[derive(Debug)]
pub struct NpySource {
    file: BufReader<File>,
    header: NpyHeader,
    metadata: FileMetadata,
    rows: usize,
    channels: usize,
    samples: usize,
    /// Row-major `rows x window_len` block of (re, im) pairs
    window: Vec<(f64, f64)>,
    window_columns: usize,
    window_start: usize,
    window_len: usize,
    column: usize,
    channel: usize,
    deriver: SampleDeriver,
    timestamps: TimestampMode,
}

impl NpySource {
    pub fn open(
        path: &Path,
        batch_size: usize,
        timestamps: TimestampMode,
        offsets: Option<ChannelOffsets>,
    ) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let header = NpyHeader::read_from(&mut file)?;

        let (rows, samples) = match header.shape.as_slice() {
            [rows, samples] => (*rows, *samples),
            other => {
                return Err(UploadError::UnsupportedFormat(format!(
                    "expected a 2-D array, found shape {:?}",
                    other
                )))
            }
        };
        if rows < 2 {
            return Err(UploadError::UnsupportedFormat(format!(
                "expected a timestamp row and at least one sensor row, found {} row(s)",
                rows
            )));
        }

        let expected = rows
            .checked_mul(samples)
            .and_then(|n| n.checked_mul(header.dtype.item_size()))
            .and_then(|n| u64::try_from(n).ok())
            .and_then(|n| n.checked_add(header.data_offset))
            .ok_or_else(|| {
                UploadError::UnsupportedFormat(format!(
                    "shape ({}, {}) is too large to address",
                    rows, samples
                ))
            })?;
        if file_size < expected {
            return Err(UploadError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "{} is truncated: header promises {} bytes, file has {}",
                    path.display(),
                    expected,
                    file_size
                ),
            )));
        }

        let channels = rows - 1;
        let metadata = FileMetadata {
            file_path: path.to_path_buf(),
            format: FileFormat::Npy,
            file_size,
            num_channels: Some(channels),
            num_samples: Some(samples),
            dtype: Some(header.dtype.descr()),
        };
        let deriver = match offsets {
            Some(offsets) => SampleDeriver::with_offsets(offsets),
            None => SampleDeriver::new(),
        };

        Ok(Self {
            file: BufReader::new(file),
            header,
            metadata,
            rows,
            channels,
            samples,
            window: Vec::new(),
            window_columns: (batch_size / channels).max(1),
            window_start: 0,
            window_len: 0,
            column: 0,
            channel: 0,
            deriver,
            timestamps,
        })
    }

    /// Load the columns following the current window. Returns false at the
    /// end of the array.
    fn fill_window(&mut self) -> Result<bool> {
        self.window_start += self.window_len;
        self.window_len = 0;
        if self.window_start >= self.samples {
            return Ok(false);
        }

        let len = self.window_columns.min(self.samples - self.window_start);
        let item = self.header.dtype.item_size() as u64;
        let dtype = self.header.dtype;
        self.window.clear();
        self.window.resize(self.rows * len, (0.0, 0.0));

        if self.header.fortran_order {
            // Columns are contiguous
            let offset = self.header.data_offset + (self.window_start * self.rows) as u64 * item;
            self.file.seek(SeekFrom::Start(offset))?;
            for col in 0..len {
                for row in 0..self.rows {
                    self.window[row * len + col] = dtype.read_element(&mut self.file)?;
                }
            }
        } else {
            for row in 0..self.rows {
                let offset = self.header.data_offset
                    + (row * self.samples + self.window_start) as u64 * item;
                self.file.seek(SeekFrom::Start(offset))?;
                for col in 0..len {
                    self.window[row * len + col] = dtype.read_element(&mut self.file)?;
                }
            }
        }

        self.window_len = len;
        self.column = 0;
        self.channel = 0;
        Ok(true)
    }
}

impl RecordSource for NpySource {
    fn next_record(&mut self) -> Result<Option<Record>> {
        if self.channel == self.channels {
            self.channel = 0;
            self.column += 1;
        }
        if self.column >= self.window_len && !self.fill_window()? {
            return Ok(None);
        }

        let len = self.window_len;
        let col = self.column;
        let channel = self.channel;
        self.channel += 1;

        let index = (self.window_start + col) as u64;
        let (file_ts, _) = self.window[col];
        let (i, q) = self.window[(channel + 1) * len + col];
        let location = || format!("sample {}, channel {}", index, channel);

        if !i.is_finite() || !q.is_finite() {
            return Err(UploadError::malformed(
                location(),
                format!("non-finite I/Q value ({}, {})", i, q),
            ));
        }
        if self.timestamps == TimestampMode::Actual && !file_ts.is_finite() {
            return Err(UploadError::malformed(
                location(),
                format!("non-finite timestamp {}", file_ts),
            ));
        }

        let timestamp = self.timestamps.resolve(index, file_ts);
        Ok(Some(
            self.deriver
                .derive(index, timestamp, channel as u32, i, q),
        ))
    }

    fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    fn buffered(&self) -> usize {
        self.channels * self.window_len
    }

    fn seek(&mut self, index: u64) -> Result<()> {
        self.window_start = usize::try_from(index)
            .unwrap_or(usize::MAX)
            .min(self.samples);
        self.window_len = 0;
        self.column = 0;
        self.channel = 0;
        self.deriver.reset();
        Ok(())
    }
}
