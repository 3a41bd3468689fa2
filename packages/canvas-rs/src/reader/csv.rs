use super::RecordSource;
use crate::error::{Result, UploadError};
use crate::signal::{ChannelOffsets, SampleDeriver, TimestampMode};
use crate::types::{FileFormat, FileMetadata, Record};
use ::csv::{ByteRecord, ReaderBuilder, Trim};
use log::debug;
use std::fs::File;
use std::path::Path;
use std::str::FromStr;

/// CSV detector file reader
///
/// One sample per row: `timestamp,channel,i,q`. A leading header row, `#`
/// comments and blank lines are ignored. Rows sharing a timestamp form one
/// frame; the time index advances whenever the timestamp changes.
pub struct CsvSource {
    reader: ::csv::Reader<File>,
    row: ByteRecord,
    metadata: FileMetadata,
    deriver: SampleDeriver,
    timestamps: TimestampMode,
    first_row: bool,
    index: u64,
    last_timestamp: Option<f64>,
    /// Rows before this time index are read but not returned
    skip_below: u64,
}

impl CsvSource {
    pub fn open(
        path: &Path,
        timestamps: TimestampMode,
        offsets: Option<ChannelOffsets>,
    ) -> Result<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .comment(Some(b'#'))
            .trim(Trim::All)
            .from_reader(file);

        Ok(Self {
            reader,
            row: ByteRecord::new(),
            metadata: FileMetadata {
                file_path: path.to_path_buf(),
                format: FileFormat::Csv,
                file_size,
                num_channels: None,
                num_samples: None,
                dtype: None,
            },
            deriver: match offsets {
                Some(offsets) => SampleDeriver::with_offsets(offsets),
                None => SampleDeriver::new(),
            },
            timestamps,
            first_row: true,
            index: 0,
            last_timestamp: None,
            skip_below: 0,
        })
    }

    fn parse_row(&mut self, line: u64) -> Result<Record> {
        let location = format!("line {}", line);
        if self.row.len() != 4 {
            return Err(UploadError::malformed(
                location,
                format!("expected 4 fields, found {}", self.row.len()),
            ));
        }

        let timestamp: f64 = field(&self.row, 0, "timestamp", &location)?;
        let channel: u32 = field(&self.row, 1, "channel", &location)?;
        let i: f64 = field(&self.row, 2, "i", &location)?;
        let q: f64 = field(&self.row, 3, "q", &location)?;

        if !timestamp.is_finite() {
            return Err(UploadError::malformed(
                location,
                format!("non-finite timestamp {}", timestamp),
            ));
        }
        if !i.is_finite() || !q.is_finite() {
            return Err(UploadError::malformed(
                location,
                format!("non-finite I/Q value ({}, {})", i, q),
            ));
        }

        match self.last_timestamp {
            Some(last) if last == timestamp => {}
            Some(_) => {
                self.index += 1;
                self.last_timestamp = Some(timestamp);
            }
            None => self.last_timestamp = Some(timestamp),
        }

        let resolved = self.timestamps.resolve(self.index, timestamp);
        Ok(self.deriver.derive(self.index, resolved, channel, i, q))
    }
}

fn field<T: FromStr>(row: &ByteRecord, idx: usize, name: &str, location: &str) -> Result<T> {
    let raw = std::str::from_utf8(&row[idx])
        .map_err(|_| UploadError::malformed(location, format!("{} is not valid UTF-8", name)))?;
    raw.parse::<T>()
        .map_err(|_| UploadError::malformed(location, format!("invalid {} '{}'", name, raw)))
}

fn map_csv_error(err: ::csv::Error) -> UploadError {
    let location = err
        .position()
        .map(|p| format!("line {}", p.line()))
        .unwrap_or_else(|| "unknown line".to_string());
    match err.into_kind() {
        ::csv::ErrorKind::Io(e) => UploadError::Io(e),
        other => UploadError::malformed(location, format!("{:?}", other)),
    }
}

impl RecordSource for CsvSource {
    fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            if !self
                .reader
                .read_byte_record(&mut self.row)
                .map_err(map_csv_error)?
            {
                return Ok(None);
            }
            let line = self.row.position().map(|p| p.line()).unwrap_or(0);

            if self.first_row {
                self.first_row = false;
                let first = self
                    .row
                    .get(0)
                    .and_then(|f| std::str::from_utf8(f).ok())
                    .unwrap_or("");
                if first.parse::<f64>().is_err() {
                    debug!("Skipping header row at line {}", line);
                    continue;
                }
            }

            match self.parse_row(line) {
                Ok(record) if record.index < self.skip_below => continue,
                // a bad row can only land one frame past the last good one
                Err(UploadError::MalformedRecord { .. })
                    if self.index + 1 < self.skip_below =>
                {
                    continue
                }
                other => return other.map(Some),
            }
        }
    }

    fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    fn buffered(&self) -> usize {
        1
    }

    /// Rows carry no index of their own, so this rewinds and counts frames
    /// forward from the top of the file.
    fn seek(&mut self, index: u64) -> Result<()> {
        self.reader
            .seek(::csv::Position::new())
            .map_err(map_csv_error)?;
        self.first_row = true;
        self.index = 0;
        self.last_timestamp = None;
        self.skip_below = index;
        self.deriver.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(body: &str) -> (tempfile::TempDir, CsvSource) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        std::fs::write(&path, body).unwrap();
        let source = CsvSource::open(&path, TimestampMode::Actual, None).unwrap();
        (dir, source)
    }

    #[test]
    fn test_header_comments_and_frames() {
        let (_dir, mut src) = source(
            "# detector run 7\ntimestamp,channel,i,q\n10.0,0,3,4\n10.0,1,0,1\n\n10.5,0,1,0\n",
        );
        let a = src.next_record().unwrap().unwrap();
        let b = src.next_record().unwrap().unwrap();
        let c = src.next_record().unwrap().unwrap();
        assert!(src.next_record().unwrap().is_none());

        assert_eq!((a.index, a.channel), (0, 0));
        assert!((a.amplitude - 5.0).abs() < 1e-12);
        assert_eq!((b.index, b.channel), (0, 1));
        assert_eq!((c.index, c.channel), (1, 0));
        assert_eq!(c.timestamp, 10.5);
        assert_eq!(src.metadata().format, FileFormat::Csv);
    }

    #[test]
    fn test_malformed_rows_report_line_and_resume() {
        let (_dir, mut src) = source("1,0,1,0\n1,0,x,0\n2,0,1\n3,0,1,0\n");
        assert!(src.next_record().unwrap().is_some());

        let err = src.next_record().unwrap_err();
        assert!(err.to_string().contains("line 2"), "{}", err);
        assert!(err.to_string().contains("invalid i 'x'"));

        let err = src.next_record().unwrap_err();
        assert!(err.to_string().contains("expected 4 fields, found 3"));

        let next = src.next_record().unwrap().unwrap();
        assert_eq!(next.timestamp, 3.0);
        assert_eq!(next.index, 1);
    }

    #[test]
    fn test_non_finite_values_are_malformed() {
        let (_dir, mut src) = source("1,0,NaN,0\n2,0,1,inf\n");
        assert!(matches!(
            src.next_record(),
            Err(UploadError::MalformedRecord { .. })
        ));
        assert!(matches!(
            src.next_record(),
            Err(UploadError::MalformedRecord { .. })
        ));
        assert!(src.next_record().unwrap().is_none());
    }

    #[test]
    fn test_negative_channel_rejected() {
        let (_dir, mut src) = source("1,-1,1,0\n");
        let err = src.next_record().unwrap_err();
        assert!(err.to_string().contains("invalid channel"));
    }
}
