use super::Transport;
use crate::error::{Result, UploadError};
use crate::line_protocol::LineEncoder;
use crate::types::Batch;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Failure a `MemorySink` can be told to produce on upcoming sends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Unavailable,
    Rejected,
}

#[derive(Debug, Default)]
struct SinkState {
    batches: Vec<Batch>,
    lines: Vec<String>,
    failures: VecDeque<FailureKind>,
    attempts: u64,
    opens: u64,
    closes: u64,
}

/// Shared view of everything a `MemoryTransport` received
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<SinkState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<Batch> {
        self.state.lock().batches.clone()
    }

    /// Encoded lines, when the transport has an encoder
    pub fn lines(&self) -> Vec<String> {
        self.state.lock().lines.clone()
    }

    pub fn record_count(&self) -> usize {
        self.state.lock().batches.iter().map(Batch::len).sum()
    }

    /// Make the next `count` sends fail with `kind`
    pub fn fail_next(&self, kind: FailureKind, count: usize) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state.failures.push_back(kind);
        }
    }

    /// Send calls, failed ones included
    pub fn attempts(&self) -> u64 {
        self.state.lock().attempts
    }

    pub fn opens(&self) -> u64 {
        self.state.lock().opens
    }

    pub fn closes(&self) -> u64 {
        self.state.lock().closes
    }
}

pub struct MemoryTransport {
    sink: MemorySink,
    encoder: Option<LineEncoder>,
    send_delay: Option<Duration>,
    open: bool,
}

impl MemoryTransport {
    pub fn new(sink: MemorySink) -> Self {
        Self {
            sink,
            encoder: None,
            send_delay: None,
            open: false,
        }
    }

    pub fn with_encoder(mut self, encoder: LineEncoder) -> Self {
        self.encoder = Some(encoder);
        self
    }

    /// Simulate a slow destination
    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = Some(delay);
        self
    }

    pub fn sink(&self) -> &MemorySink {
        &self.sink
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&mut self) -> Result<()> {
        if !self.open {
            self.sink.state.lock().opens += 1;
            self.open = true;
        }
        Ok(())
    }

    async fn send(&mut self, batch: &Batch) -> Result<()> {
        if !self.open {
            self.open().await?;
        }
        if let Some(delay) = self.send_delay {
            tokio::time::sleep(delay).await;
        }

        let lines = self.encoder.as_ref().map(|e| e.lines(batch));
        let mut state = self.sink.state.lock();
        state.attempts += 1;
        match state.failures.pop_front() {
            Some(FailureKind::Unavailable) => Err(UploadError::TransportUnavailable(
                "injected outage".to_string(),
            )),
            Some(FailureKind::Rejected) => Err(UploadError::TransportRejected(
                "injected rejection".to_string(),
            )),
            None => {
                state.batches.push(batch.clone());
                if let Some(lines) = lines {
                    state.lines.extend(lines);
                }
                Ok(())
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.open {
            self.sink.state.lock().closes += 1;
            self.open = false;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn name(&self) -> &str {
        "memory"
    }

    fn frames_per_line(&self) -> usize {
        self.encoder.as_ref().map_or(1, LineEncoder::average_points)
    }
}
