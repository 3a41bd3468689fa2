// Upload session - drives files from the queue through a transport
//
// The session manages:
// - File lifecycle (activate, stream, finish, fail, switch)
// - A blocking producer task per file that reads batches into a bounded channel
// - The async consumer that delivers batches with retry and backoff
// - Pause / resume / step / seek / skip / switch / cancel signals from the
//   front-end
// - Event broadcast and the live summary of the active file
//
// Cancellation is cooperative: every file gets a child token of the session
// token and the producer checks it between batches, never mid-record.
// Batches the producer read ahead before an interruption are carried over
// and delivered first if the same file resumes.

use crate::error::{Result, UploadError};
use crate::queue::{FileEntry, FileQueue, PendingOpen, QueueOptions, QueueSnapshot};
use crate::reader::{FileReader, ReaderStats};
use crate::retry::{send_with_retry, RetryPolicy};
use crate::summary::{Summary, SummaryHandle};
use crate::transport::Transport;
use crate::types::{Batch, EntryId, FileState};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub queue: QueueOptions,
    /// Batches buffered between the reader and the transport
    pub queue_depth: usize,
    pub retry: RetryPolicy,
    pub event_capacity: usize,
    /// Keep running on an empty queue until more files arrive or the
    /// session is cancelled
    pub wait_for_files: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue: QueueOptions::default(),
            queue_depth: 4,
            retry: RetryPolicy::default(),
            event_capacity: 1024,
            wait_for_files: false,
        }
    }
}

/// Events broadcast to the front-end
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    FileActivated {
        entry_id: EntryId,
        path: PathBuf,
        /// File handles open just before this file's reader was opened
        open_handles_before: usize,
    },
    BatchSent {
        entry_id: EntryId,
        sequence: u64,
        records: usize,
        total_records: u64,
        /// Time index of the last frame in the batch
        last_index: u64,
    },
    Seeked {
        entry_id: EntryId,
        index: u64,
    },
    Retrying {
        entry_id: EntryId,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    FileFinished {
        entry_id: EntryId,
        path: PathBuf,
        state: FileState,
        records_sent: u64,
        records_skipped: u64,
        error: Option<String>,
    },
    Paused,
    Resumed,
    QueueEmpty,
    Cancelled,
    Fatal {
        error: String,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionReport {
    pub files_completed: usize,
    pub files_failed: usize,
    pub files_switched: usize,
    pub batches_sent: u64,
    pub records_sent: u64,
    pub records_skipped: u64,
    pub retries: u64,
    /// Largest number of records any reader held at once
    pub peak_buffered: usize,
    pub cancelled: bool,
}

#[derive(Debug)]
enum Command {
    SwitchTo(EntryId),
    Skip(EntryId),
    Seek { entry_id: EntryId, index: u64 },
    Step,
}

/// How streaming of the active file ended
#[derive(Debug)]
enum Outcome {
    Exhausted,
    Failed(UploadError),
    Switched(EntryId),
    Skipped,
    Seek(u64),
    Cancelled,
    Fatal(UploadError),
}

#[derive(Debug, Clone, Copy)]
enum Next {
    Advance,
    Switch(EntryId),
    /// Keep streaming the active file
    Resume,
}

/// Cloneable control surface for a running session
#[derive(Clone)]
pub struct SessionHandle {
    queue: Arc<Mutex<FileQueue>>,
    commands: mpsc::UnboundedSender<Command>,
    pause: Arc<watch::Sender<bool>>,
    cancel: CancellationToken,
    summary: SummaryHandle,
    events: broadcast::Sender<SessionEvent>,
    enqueued: Arc<Notify>,
}

impl SessionHandle {
    pub fn enqueue(&self, path: impl AsRef<Path>) -> Result<EntryId> {
        self.enqueue_at(path, 0)
    }

    /// Enqueue a file that starts streaming at time index `start_index`
    pub fn enqueue_at(&self, path: impl AsRef<Path>, start_index: u64) -> Result<EntryId> {
        let id = self.queue.lock().enqueue_at(path, start_index)?;
        self.enqueued.notify_one();
        Ok(id)
    }

    pub fn dequeue(&self, id: EntryId) -> Result<FileEntry> {
        self.queue.lock().dequeue(id)
    }

    /// Abandon the active file and continue with `id`
    pub fn switch_to(&self, id: EntryId) -> Result<()> {
        if !self.queue.lock().contains_pending(id) {
            return Err(UploadError::EntryNotFound(id.to_string()));
        }
        self.send_command(Command::SwitchTo(id))
    }

    /// Abandon the active file and continue with the next pending one
    pub fn skip(&self) -> Result<()> {
        let id = self.queue.lock().current()?.id;
        self.send_command(Command::Skip(id))
    }

    /// Continue the active file from time index `index`. Read-ahead batches
    /// are discarded; a paused session stays paused.
    pub fn seek(&self, index: u64) -> Result<()> {
        let entry_id = self.queue.lock().current()?.id;
        self.send_command(Command::Seek { entry_id, index })
    }

    /// Deliver exactly one batch while paused. With a paced transport a
    /// batch is one published line.
    pub fn step(&self) -> Result<()> {
        if !self.is_paused() {
            return Err(UploadError::InvalidParameter(
                "stepping requires a paused session".to_string(),
            ));
        }
        self.send_command(Command::Step)
    }

    pub fn pause(&self) {
        if !self.pause.send_replace(true) {
            info!("Upload paused");
            self.emit(SessionEvent::Paused);
        }
    }

    pub fn resume(&self) {
        if self.pause.send_replace(false) {
            info!("Upload resumed");
            self.emit(SessionEvent::Resumed);
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.pause.borrow()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Running summary of the active (or last) file
    pub fn summary(&self) -> Summary {
        self.summary.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn queue_snapshot(&self) -> QueueSnapshot {
        self.queue.lock().snapshot()
    }

    pub fn open_handles(&self) -> usize {
        self.queue.lock().open_handles()
    }

    fn send_command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| UploadError::InvalidParameter("session is no longer running".to_string()))
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

pub struct UploadSession {
    handle: SessionHandle,
    commands: mpsc::UnboundedReceiver<Command>,
    pause_rx: watch::Receiver<bool>,
    transport: Box<dyn Transport>,
    config: SessionConfig,
    /// Read ahead from the active file but not yet delivered
    carried: VecDeque<Result<Batch>>,
    /// Reader stats of the active file, folded into the report when it ends
    active_stats: ReaderStats,
    /// One batch may pass while paused
    step: bool,
}

impl UploadSession {
    pub fn new(config: SessionConfig, transport: Box<dyn Transport>) -> Self {
        Self::with_cancel(config, transport, CancellationToken::new())
    }

    /// Use an existing token, e.g. the one a paced transport listens to.
    ///
    /// Batches are aligned to the transport's line groups; a paced transport
    /// gets exactly one line per batch so each interval publishes one line.
    pub fn with_cancel(
        mut config: SessionConfig,
        transport: Box<dyn Transport>,
        cancel: CancellationToken,
    ) -> Self {
        let group_frames = transport.frames_per_line().max(1);
        config.queue.reader.group_frames = group_frames;
        if transport.is_paced() {
            debug!(
                "{} is paced, sending one line of {} frames per batch",
                transport.name(),
                group_frames
            );
            config.queue.reader.batch_size = 1;
        }

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (pause_tx, pause_rx) = watch::channel(false);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let handle = SessionHandle {
            queue: Arc::new(Mutex::new(FileQueue::new(config.queue.clone()))),
            commands: commands_tx,
            pause: Arc::new(pause_tx),
            cancel,
            summary: SummaryHandle::new(),
            events,
            enqueued: Arc::new(Notify::new()),
        };

        Self {
            handle,
            commands,
            pause_rx,
            transport,
            config,
            carried: VecDeque::new(),
            active_stats: ReaderStats::default(),
            step: false,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Upload every queued file.
    ///
    /// Returns the report when the queue runs dry or the session is
    /// cancelled, and an error when the transport stays unavailable past the
    /// retry policy.
    pub async fn run(self) -> Result<SessionReport> {
        let (report, result) = self.run_with_report().await;
        result.map(|()| report)
    }

    /// Like `run`, but the counts gathered up to a fatal error are returned
    /// alongside it.
    pub async fn run_with_report(mut self) -> (SessionReport, Result<()>) {
        info!("Upload session starting via {}", self.transport.name());
        let mut report = SessionReport::default();
        let result = self.run_files(&mut report).await;

        if let Err(err) = self.transport.close().await {
            warn!("Closing {} failed: {}", self.transport.name(), err);
        }

        let result = match result {
            Ok(()) => {
                info!(
                    "Upload session finished: {} files, {} records",
                    report.files_completed, report.records_sent
                );
                Ok(())
            }
            Err(UploadError::Cancelled) => {
                info!("Upload session cancelled");
                report.cancelled = true;
                self.handle.emit(SessionEvent::Cancelled);
                Ok(())
            }
            Err(err) => {
                error!(
                    "Upload session failed after {} records: {}",
                    report.records_sent, err
                );
                self.handle.emit(SessionEvent::Fatal {
                    error: err.to_string(),
                });
                Err(err)
            }
        };
        (report, result)
    }

    async fn run_files(&mut self, report: &mut SessionReport) -> Result<()> {
        let mut next = Next::Advance;

        loop {
            if self.handle.cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }

            let target = match next {
                Next::Resume => None,
                Next::Advance => Some(None),
                Next::Switch(id) => Some(Some(id)),
            };
            if let Some(target) = target {
                match self.activate(target, report).await {
                    Ok(()) => {}
                    Err(UploadError::QueueEmpty) => {
                        self.handle.emit(SessionEvent::QueueEmpty);
                        if !self.config.wait_for_files {
                            return Ok(());
                        }
                        next = self.wait_for_files().await?;
                        continue;
                    }
                    Err(UploadError::EntryNotFound(id)) => {
                        let active = self.handle.queue.lock().current().is_ok();
                        warn!("Switch target {} is no longer queued", id);
                        next = if active { Next::Resume } else { Next::Advance };
                        continue;
                    }
                    Err(err) if err.is_file_level() => {
                        report.files_failed += 1;
                        let failed = self.handle.queue.lock().history().back().cloned();
                        if let Some(entry) = failed {
                            self.emit_finished(&entry, 0);
                        }
                        next = Next::Advance;
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            }

            next = match self.stream_active(report).await? {
                Outcome::Exhausted => {
                    let entry = self.handle.queue.lock().finish_current()?;
                    report.files_completed += 1;
                    self.retire(&entry, report);
                    Next::Advance
                }
                Outcome::Failed(err) => {
                    error!("Upload of active file failed: {}", err);
                    let entry = self.handle.queue.lock().fail_current(&err)?;
                    report.files_failed += 1;
                    self.retire(&entry, report);
                    Next::Advance
                }
                Outcome::Skipped => {
                    let entry = self.handle.queue.lock().skip_current()?;
                    report.files_switched += 1;
                    self.retire(&entry, report);
                    Next::Advance
                }
                // The active entry is retired only once the target is
                // confirmed, so a stale switch resumes it
                Outcome::Switched(id) => Next::Switch(id),
                Outcome::Seek(index) => match self.seek_active(index).await {
                    Ok(()) => Next::Resume,
                    Err(err) if err.is_file_level() => {
                        error!("Repositioning active file failed: {}", err);
                        let entry = self.handle.queue.lock().fail_current(&err)?;
                        report.files_failed += 1;
                        self.retire(&entry, report);
                        Next::Advance
                    }
                    Err(err) => return Err(err),
                },
                Outcome::Cancelled => {
                    let finished = self.handle.queue.lock().skip_current();
                    if let Ok(entry) = finished {
                        self.retire(&entry, report);
                    }
                    return Err(UploadError::Cancelled);
                }
                Outcome::Fatal(err) => {
                    let finished = self.handle.queue.lock().fail_current(&err);
                    if let Ok(entry) = finished {
                        self.retire(&entry, report);
                    }
                    return Err(err);
                }
            };
        }
    }

    /// Take the next entry (or `target`) off the queue and open its reader
    /// without holding the queue lock.
    async fn activate(
        &mut self,
        target: Option<EntryId>,
        report: &mut SessionReport,
    ) -> Result<()> {
        let pending: PendingOpen = {
            let mut queue = self.handle.queue.lock();
            match target {
                Some(id) => queue.prepare_switch(id)?,
                None => queue.prepare_advance()?,
            }
        };
        if let Some(previous) = pending.replaced().cloned() {
            match previous.state {
                FileState::Exhausted => report.files_completed += 1,
                _ => report.files_switched += 1,
            }
            self.retire(&previous, report);
        }

        debug!("Opening {}", pending.entry().path.display());
        let opened = tokio::task::spawn_blocking(move || pending.open())
            .await
            .map_err(|e| task_failed("open", e))?;
        let activation = self.handle.queue.lock().install(opened)?;

        self.handle.summary.reset();
        self.handle.emit(SessionEvent::FileActivated {
            entry_id: activation.entry.id,
            path: activation.entry.path.clone(),
            open_handles_before: activation.handles_before_open,
        });
        Ok(())
    }

    /// Account for a file that left the active slot
    fn retire(&mut self, entry: &FileEntry, report: &mut SessionReport) {
        let stats = std::mem::take(&mut self.active_stats);
        report.records_skipped += stats.records_skipped;
        report.peak_buffered = report.peak_buffered.max(stats.peak_buffered);
        self.carried.clear();
        self.emit_finished(entry, stats.records_skipped);
    }

    async fn seek_active(&mut self, index: u64) -> Result<()> {
        self.carried.clear();
        let (mut reader, entry_id) = {
            let mut queue = self.handle.queue.lock();
            let id = queue.current()?.id;
            (queue.checkout_reader()?, id)
        };

        let (reader, result) = tokio::task::spawn_blocking(move || {
            let result = reader.seek(index);
            (reader, result)
        })
        .await
        .map_err(|e| task_failed("seek", e))?;
        self.handle.queue.lock().checkin_reader(reader);
        result?;

        info!("Active file repositioned to index {}", index);
        self.handle.emit(SessionEvent::Seeked { entry_id, index });
        Ok(())
    }

    /// Stream the active file until it ends or something interrupts it. The
    /// reader is back in the queue when this returns.
    async fn stream_active(&mut self, report: &mut SessionReport) -> Result<Outcome> {
        let (reader, entry_id) = {
            let mut queue = self.handle.queue.lock();
            let id = queue.current()?.id;
            (queue.checkout_reader()?, id)
        };

        let file_cancel = self.handle.cancel.child_token();
        let (tx, mut rx) = mpsc::channel(self.config.queue_depth.max(1));
        let producer = spawn_producer(reader, tx, file_cancel.clone(), self.handle.summary.clone());

        let mut outcome = loop {
            if let Some(outcome) = self.wait_while_paused(entry_id).await {
                break outcome;
            }

            let item = tokio::select! {
                biased;
                _ = self.handle.cancel.cancelled() => break Outcome::Cancelled,
                Some(command) = self.commands.recv() => {
                    match self.handle_command(command, entry_id) {
                        Some(outcome) => break outcome,
                        None => continue,
                    }
                }
                item = next_item(&mut self.carried, &mut rx) => item,
            };

            match item {
                None => break Outcome::Exhausted,
                Some(Err(err)) => break Outcome::Failed(err),
                Some(Ok(batch)) => match self.deliver(&batch, report).await {
                    Ok(()) => {}
                    Err(UploadError::Cancelled) => break Outcome::Cancelled,
                    Err(err) if err.is_retryable() => break Outcome::Fatal(err),
                    Err(err) if err.is_file_level() => break Outcome::Failed(err),
                    Err(err) => break Outcome::Fatal(err),
                },
            }
        };

        // Unblock the producer and keep what it already read
        file_cancel.cancel();
        while let Some(item) = rx.recv().await {
            self.carried.push_back(item);
        }
        if !self.carried.is_empty() {
            debug!("Carrying {} read-ahead batches of {}", self.carried.len(), entry_id);
        }

        match producer.await {
            Ok(reader) => {
                self.active_stats = reader.stats();
                self.handle.summary.publish(reader.summary());
                self.handle.queue.lock().checkin_reader(reader);
            }
            Err(join_err) => {
                error!("Reader task for {} died: {}", entry_id, join_err);
                if matches!(outcome, Outcome::Exhausted) {
                    outcome = Outcome::Failed(task_failed("reader", join_err));
                }
            }
        }

        debug!("Streaming {} ended: {:?}", entry_id, outcome);
        Ok(outcome)
    }

    async fn deliver(&mut self, batch: &Batch, report: &mut SessionReport) -> Result<()> {
        let events = self.handle.events.clone();
        let entry_id = batch.entry_id;
        let mut retries = 0u64;

        let result = send_with_retry(
            self.transport.as_mut(),
            batch,
            &self.config.retry,
            &self.handle.cancel,
            |attempt, err, delay| {
                retries += 1;
                let _ = events.send(SessionEvent::Retrying {
                    entry_id,
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                    error: err.to_string(),
                });
            },
        )
        .await;
        report.retries += retries;
        result?;

        report.batches_sent += 1;
        report.records_sent += batch.len() as u64;

        let total_records = {
            let mut queue = self.handle.queue.lock();
            queue.record_sent(batch.len() as u64);
            queue.current().map(|e| e.records_sent).unwrap_or(0)
        };
        self.handle.emit(SessionEvent::BatchSent {
            entry_id,
            sequence: batch.sequence,
            records: batch.len(),
            total_records,
            last_index: batch.last_index().unwrap_or_default(),
        });
        Ok(())
    }

    /// Block while paused. Returns an outcome if the file is interrupted in
    /// the meantime.
    async fn wait_while_paused(&mut self, entry_id: EntryId) -> Option<Outcome> {
        loop {
            if !*self.pause_rx.borrow_and_update() {
                self.step = false;
                return None;
            }
            if std::mem::take(&mut self.step) {
                debug!("Stepping one batch");
                return None;
            }
            tokio::select! {
                biased;
                _ = self.handle.cancel.cancelled() => return Some(Outcome::Cancelled),
                Some(command) = self.commands.recv() => {
                    if let Some(outcome) = self.handle_command(command, entry_id) {
                        return Some(outcome);
                    }
                }
                changed = self.pause_rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// Idle on an empty queue until a file is enqueued or a switch arrives
    async fn wait_for_files(&mut self) -> Result<Next> {
        info!("Queue empty, waiting for files");
        loop {
            tokio::select! {
                biased;
                _ = self.handle.cancel.cancelled() => return Err(UploadError::Cancelled),
                Some(command) = self.commands.recv() => {
                    if let Command::SwitchTo(id) = command {
                        return Ok(Next::Switch(id));
                    }
                }
                _ = self.handle.enqueued.notified() => return Ok(Next::Advance),
            }
        }
    }

    /// Apply a front-end command to the active file. Returns the outcome
    /// when streaming has to stop.
    fn handle_command(&mut self, command: Command, active: EntryId) -> Option<Outcome> {
        match command {
            Command::Step => {
                if *self.pause_rx.borrow() {
                    self.step = true;
                }
                None
            }
            Command::SwitchTo(id) if !self.handle.queue.lock().contains_pending(id) => {
                warn!("Ignoring switch to {}, no longer queued", id);
                None
            }
            other => interrupt(other, active),
        }
    }

    fn emit_finished(&self, entry: &FileEntry, records_skipped: u64) {
        info!(
            "{} finished as {:?} ({} records sent)",
            entry.path.display(),
            entry.state,
            entry.records_sent
        );
        self.handle.emit(SessionEvent::FileFinished {
            entry_id: entry.id,
            path: entry.path.clone(),
            state: entry.state,
            records_sent: entry.records_sent,
            records_skipped,
            error: entry.error.clone(),
        });
    }
}

fn interrupt(command: Command, active: EntryId) -> Option<Outcome> {
    match command {
        Command::Skip(id) if id == active => Some(Outcome::Skipped),
        Command::SwitchTo(id) if id != active => Some(Outcome::Switched(id)),
        Command::Seek { entry_id, index } if entry_id == active => Some(Outcome::Seek(index)),
        other => {
            debug!("Ignoring stale command {:?}", other);
            None
        }
    }
}

/// Carried-over batches first, then whatever the producer sends
async fn next_item(
    carried: &mut VecDeque<Result<Batch>>,
    rx: &mut mpsc::Receiver<Result<Batch>>,
) -> Option<Result<Batch>> {
    match carried.pop_front() {
        Some(item) => Some(item),
        None => rx.recv().await,
    }
}

fn task_failed(what: &str, err: tokio::task::JoinError) -> UploadError {
    UploadError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("{} task failed: {}", what, err),
    ))
}

/// Read batches on a blocking thread until the file ends, the channel closes
/// or `cancel` fires. Hands the reader back when done.
fn spawn_producer(
    mut reader: FileReader,
    tx: mpsc::Sender<Result<Batch>>,
    cancel: CancellationToken,
    summary: SummaryHandle,
) -> JoinHandle<FileReader> {
    tokio::task::spawn_blocking(move || {
        while !cancel.is_cancelled() {
            match reader.next_batch() {
                Ok(Some(batch)) => {
                    summary.publish(reader.summary());
                    if tx.blocking_send(Ok(batch)).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    summary.publish(reader.summary());
                    let _ = tx.blocking_send(Err(err));
                    break;
                }
            }
        }
        reader
    })
}
