use super::Transport;
use crate::error::{Result, UploadError};
use crate::types::Batch;
use async_trait::async_trait;
use log::trace;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Live mode: forwards to an inner transport at most once per interval.
///
/// The interval is measured from the start of one send to the start of the
/// next, so slow sends eat into the wait instead of adding to it.
pub struct PacedTransport<T: Transport> {
    inner: T,
    interval: Duration,
    next_slot: Option<Instant>,
    cancel: CancellationToken,
    name: String,
}

impl<T: Transport> PacedTransport<T> {
    pub fn new(inner: T, interval: Duration, cancel: CancellationToken) -> Self {
        let name = format!("live({})", inner.name());
        Self {
            inner,
            interval,
            next_slot: None,
            cancel,
            name,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: Transport> Transport for PacedTransport<T> {
    async fn open(&mut self) -> Result<()> {
        self.inner.open().await
    }

    async fn send(&mut self, batch: &Batch) -> Result<()> {
        if let Some(slot) = self.next_slot {
            trace!("Waiting for next upload slot");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(UploadError::Cancelled),
                _ = tokio::time::sleep_until(slot) => {}
            }
        }
        let started = Instant::now();
        self.inner.send(batch).await?;
        self.next_slot = Some(started + self.interval);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.next_slot = None;
        self.inner.close().await
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn frames_per_line(&self) -> usize {
        self.inner.frames_per_line()
    }

    fn is_paced(&self) -> bool {
        true
    }
}
