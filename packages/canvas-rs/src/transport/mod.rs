// Pluggable upload transports
//
// A `Transport` delivers batches to wherever the canvas element reads from.
// New destinations are added by:
// 1. Implementing the Transport trait
// 2. Adding a variant to TransportConfig
// 3. Constructing it in `create_transport`
//
// Current implementations:
// - Direct: Grafana Live push API, straight to the viewer
// - Database: InfluxDB 1.x HTTP write endpoint
// - Live: paces any other transport to one send per upload interval
// - Memory: in-process sink for dry runs and tests

mod grafana;
mod influx;
mod memory;
mod paced;

pub use grafana::GrafanaLiveTransport;
pub use influx::InfluxTransport;
pub use memory::{FailureKind, MemorySink, MemoryTransport};
pub use paced::PacedTransport;

use crate::error::{Result, UploadError};
use crate::line_protocol::LineEncoder;
use crate::types::Batch;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_TIMEOUT_MS: u64 = 3000;

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

/// Destination of an upload session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransportConfig {
    /// Push straight to a Grafana Live stream
    #[serde(rename = "direct")]
    Direct {
        /// Grafana base URL, e.g. `http://localhost:3000`
        url: String,
        /// Stream id under `/api/live/push/`
        stream: String,
        #[serde(default)]
        token: Option<String>,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },

    /// Write into an InfluxDB 1.x database read by the dashboard
    #[serde(rename = "database")]
    Database {
        host: String,
        port: u16,
        database: String,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
        /// Drop the measurement when the connection is opened
        #[serde(default)]
        clear: bool,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },

    /// Pace another transport for near-real-time display
    #[serde(rename = "live")]
    Live {
        interval_ms: u64,
        inner: Box<TransportConfig>,
    },

    /// Keep batches in memory
    #[serde(rename = "memory")]
    Memory,
}

impl TransportConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportConfig::Direct { .. } => "direct",
            TransportConfig::Database { .. } => "database",
            TransportConfig::Live { .. } => "live",
            TransportConfig::Memory => "memory",
        }
    }
}

/// Destination for batches
///
/// Implementations open lazily: `send` on a closed transport opens it first.
/// The session closes the transport when it tears down.
#[async_trait]
pub trait Transport: Send {
    /// Establish and verify the connection
    async fn open(&mut self) -> Result<()>;

    /// Deliver one batch
    async fn send(&mut self, batch: &Batch) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    fn name(&self) -> &str;

    /// Frames the transport folds into one published line. Batches handed
    /// to `send` should not split such a group.
    fn frames_per_line(&self) -> usize {
        1
    }

    /// Whether sends are spaced in time; the session then hands over one
    /// line's worth of frames per send.
    fn is_paced(&self) -> bool {
        false
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn open(&mut self) -> Result<()> {
        (**self).open().await
    }

    async fn send(&mut self, batch: &Batch) -> Result<()> {
        (**self).send(batch).await
    }

    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn frames_per_line(&self) -> usize {
        (**self).frames_per_line()
    }

    fn is_paced(&self) -> bool {
        (**self).is_paced()
    }
}

/// Build a transport from configuration.
///
/// `cancel` interrupts pacing sleeps of live transports.
pub fn create_transport(
    config: &TransportConfig,
    encoder: LineEncoder,
    cancel: CancellationToken,
) -> Result<Box<dyn Transport>> {
    match config {
        TransportConfig::Direct {
            url,
            stream,
            token,
            timeout_ms,
        } => Ok(Box::new(GrafanaLiveTransport::new(
            url,
            stream,
            token.clone(),
            Duration::from_millis(*timeout_ms),
            encoder,
        )?)),

        TransportConfig::Database {
            host,
            port,
            database,
            username,
            password,
            clear,
            timeout_ms,
        } => {
            let mut transport = InfluxTransport::new(
                host,
                *port,
                database,
                Duration::from_millis(*timeout_ms),
                encoder,
            )?
            .with_clear(*clear);
            if let (Some(user), Some(pass)) = (username, password) {
                transport = transport.with_credentials(user, pass);
            }
            Ok(Box::new(transport))
        }

        TransportConfig::Live { interval_ms, inner } => {
            if *interval_ms == 0 {
                return Err(UploadError::InvalidParameter(
                    "live upload interval must be positive".to_string(),
                ));
            }
            let inner = create_transport(inner, encoder, cancel.clone())?;
            Ok(Box::new(PacedTransport::new(
                inner,
                Duration::from_millis(*interval_ms),
                cancel,
            )))
        }

        TransportConfig::Memory => Ok(Box::new(
            MemoryTransport::new(MemorySink::new()).with_encoder(encoder),
        )),
    }
}

/// Map a request failure to a transport error
pub(crate) fn request_error(context: &str, err: reqwest::Error) -> UploadError {
    if err.is_builder() {
        UploadError::InvalidParameter(format!("{}: {}", context, err))
    } else {
        UploadError::TransportUnavailable(format!("{}: {}", context, err))
    }
}

/// Turn a non-success response into an error: 5xx, 408 and 429 may clear up
/// on their own, every other status is a rejection.
pub(crate) async fn check_status(
    context: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = format!("{} returned {}: {}", context, status, body.trim());
    if status.is_server_error()
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
    {
        Err(UploadError::TransportUnavailable(message))
    } else {
        Err(UploadError::TransportRejected(message))
    }
}
