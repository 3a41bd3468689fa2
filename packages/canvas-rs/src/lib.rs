pub mod types;
pub mod error;
pub mod signal;
pub mod summary;
pub mod resources;
pub mod npy;
pub mod reader;
pub mod queue;
pub mod line_protocol;
pub mod retry;
pub mod transport;
pub mod session;
pub mod config;
pub mod mapping;
pub mod synth;

pub use types::*;
pub use error::{Result, UploadError};
pub use summary::{Summary, SummaryHandle};
pub use resources::ResourceTracker;
pub use reader::{open_reader, FileReader, MalformedPolicy, ReaderOptions};
pub use queue::{FileEntry, FileQueue, QueueOptions, QueueSnapshot};
pub use line_protocol::LineEncoder;
pub use retry::RetryPolicy;
pub use transport::{create_transport, Transport, TransportConfig};
pub use session::{SessionConfig, SessionEvent, SessionHandle, SessionReport, UploadSession};
pub use config::{ConfigError, UploaderConfig};
