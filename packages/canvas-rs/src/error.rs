use thiserror::Error;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Malformed record at {location}: {reason}")]
    MalformedRecord { location: String, reason: String },

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Transport rejected batch: {0}")]
    TransportRejected(String),

    #[error("Upload queue is empty")]
    QueueEmpty,

    #[error("No file is currently active")]
    NoActiveFile,

    #[error("Queue entry not found: {0}")]
    EntryNotFound(String),

    #[error("Upload cancelled")]
    Cancelled,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    pub fn malformed(location: impl Into<String>, reason: impl Into<String>) -> Self {
        UploadError::MalformedRecord {
            location: location.into(),
            reason: reason.into(),
        }
    }

    /// Errors worth another attempt after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UploadError::TransportUnavailable(_))
    }

    /// Errors that end the file they occurred in but leave the queue usable.
    pub fn is_file_level(&self) -> bool {
        matches!(
            self,
            UploadError::UnsupportedFormat(_)
                | UploadError::MalformedRecord { .. }
                | UploadError::TransportRejected(_)
                | UploadError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, UploadError>;
