use crate::error::{Result, UploadError};
use crate::reader::{open_reader, FileReader, ReaderOptions};
use crate::resources::ResourceTracker;
use crate::types::{EntryId, FileFormat, FileState};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// A file known to the queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub id: EntryId,
    pub path: PathBuf,
    pub format: FileFormat,
    pub state: FileState,
    pub enqueued_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub records_sent: u64,
    /// Time index streaming begins at
    #[serde(default)]
    pub start_index: u64,
}

/// Result of activating a file
#[derive(Debug, Clone)]
pub struct Activation {
    pub entry: FileEntry,
    /// Handles held just before the new reader was opened
    pub handles_before_open: usize,
}

/// An entry taken off the queue whose reader is not open yet.
///
/// Opening can be slow (centering pre-scans the whole file), so it happens
/// outside the queue: `prepare_*` under the lock, `open` without it, then
/// `install` under the lock again.
#[derive(Debug)]
pub struct PendingOpen {
    entry: FileEntry,
    /// Entry that was active before and has just been retired
    replaced: Option<FileEntry>,
    options: ReaderOptions,
    tracker: ResourceTracker,
    handles_before_open: usize,
}

impl PendingOpen {
    pub fn entry(&self) -> &FileEntry {
        &self.entry
    }

    pub fn replaced(&self) -> Option<&FileEntry> {
        self.replaced.as_ref()
    }

    /// Open the reader; blocking
    pub fn open(self) -> OpenedFile {
        let reader = open_reader(&self.entry.path, self.entry.format, &self.options, &self.tracker)
            .map(|reader| reader.for_entry(self.entry.id));
        OpenedFile {
            entry: self.entry,
            handles_before_open: self.handles_before_open,
            reader,
        }
    }
}

/// Outcome of `PendingOpen::open`, handed back to `FileQueue::install`
#[derive(Debug)]
pub struct OpenedFile {
    entry: FileEntry,
    handles_before_open: usize,
    reader: Result<FileReader>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub active: Option<FileEntry>,
    /// Entry whose reader is being opened
    pub opening: Option<FileEntry>,
    pub pending: Vec<FileEntry>,
    pub history: Vec<FileEntry>,
    pub open_handles: usize,
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub reader: ReaderOptions,
    /// Finished entries kept for display
    pub history_limit: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            reader: ReaderOptions::default(),
            history_limit: 100,
        }
    }
}

struct ActiveFile {
    entry: FileEntry,
    /// `None` while lent to the pipeline
    reader: Option<FileReader>,
}

/// Ordered list of files to upload.
///
/// Exactly one entry is active at a time and owns the only open reader;
/// every transition out of the active state drops that reader before
/// anything else is opened.
pub struct FileQueue {
    pending: VecDeque<FileEntry>,
    active: Option<ActiveFile>,
    opening: Option<FileEntry>,
    history: VecDeque<FileEntry>,
    tracker: ResourceTracker,
    options: QueueOptions,
}

impl FileQueue {
    pub fn new(options: QueueOptions) -> Self {
        Self::with_tracker(options, ResourceTracker::new())
    }

    pub fn with_tracker(options: QueueOptions, tracker: ResourceTracker) -> Self {
        Self {
            pending: VecDeque::new(),
            active: None,
            opening: None,
            history: VecDeque::new(),
            tracker,
            options,
        }
    }

    pub fn enqueue(&mut self, path: impl AsRef<Path>) -> Result<EntryId> {
        self.enqueue_at(path, 0)
    }

    /// Enqueue a file that starts streaming at time index `start_index`
    pub fn enqueue_at(&mut self, path: impl AsRef<Path>, start_index: u64) -> Result<EntryId> {
        let path = path.as_ref();
        let format = FileFormat::from_path(path).ok_or_else(|| {
            UploadError::UnsupportedFormat(format!(
                "{} (supported extensions: {})",
                path.display(),
                FileFormat::supported_extensions().join(", ")
            ))
        })?;

        let entry = FileEntry {
            id: Uuid::new_v4(),
            path: path.to_path_buf(),
            format,
            state: FileState::Pending,
            enqueued_at: Utc::now(),
            finished_at: None,
            error: None,
            records_sent: 0,
            start_index,
        };
        let id = entry.id;
        info!("Enqueued {} as {} (start index {})", path.display(), id, start_index);
        self.pending.push_back(entry);
        Ok(id)
    }

    /// Remove a pending entry
    pub fn dequeue(&mut self, id: EntryId) -> Result<FileEntry> {
        if let Some(pos) = self.pending.iter().position(|e| e.id == id) {
            if let Some(entry) = self.pending.remove(pos) {
                info!("Dequeued {}", entry.path.display());
                return Ok(entry);
            }
        }
        if self.active.as_ref().map(|a| a.entry.id) == Some(id) {
            return Err(UploadError::InvalidParameter(format!(
                "entry {} is active; skip or switch away from it instead",
                id
            )));
        }
        Err(UploadError::EntryNotFound(id.to_string()))
    }

    pub fn current(&self) -> Result<&FileEntry> {
        self.active
            .as_ref()
            .map(|a| &a.entry)
            .ok_or(UploadError::NoActiveFile)
    }

    /// Finish the active entry as exhausted and activate the next pending one
    pub fn advance(&mut self) -> Result<Activation> {
        let pending = self.prepare_advance()?;
        self.install(pending.open())
    }

    /// First half of `advance`: retire the active entry and take the next
    /// pending one, leaving its reader to be opened by the caller
    pub fn prepare_advance(&mut self) -> Result<PendingOpen> {
        self.ensure_not_opening()?;
        let replaced = self.finish(FileState::Exhausted, None);
        let next = self.pending.pop_front().ok_or(UploadError::QueueEmpty)?;
        Ok(self.begin_open(next, replaced))
    }

    /// First half of `switch_to`. An unknown target leaves the active entry
    /// untouched.
    pub fn prepare_switch(&mut self, id: EntryId) -> Result<PendingOpen> {
        self.ensure_not_opening()?;
        let pos = self
            .pending
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| UploadError::EntryNotFound(id.to_string()))?;
        let target = self
            .pending
            .remove(pos)
            .ok_or_else(|| UploadError::EntryNotFound(id.to_string()))?;

        let replaced = self.finish(FileState::UserSwitched, None);
        Ok(self.begin_open(target, replaced))
    }

    /// Second half of an activation: make the opened file active, or record
    /// it as failed
    pub fn install(&mut self, opened: OpenedFile) -> Result<Activation> {
        let OpenedFile {
            mut entry,
            handles_before_open,
            reader,
        } = opened;
        if self.opening.as_ref().map(|e| e.id) == Some(entry.id) {
            self.opening = None;
        }

        match reader {
            Ok(reader) => {
                entry.state = FileState::Active;
                info!("Activated {} ({})", entry.path.display(), entry.id);
                self.active = Some(ActiveFile {
                    entry: entry.clone(),
                    reader: Some(reader),
                });
                Ok(Activation {
                    entry,
                    handles_before_open,
                })
            }
            Err(err) => {
                warn!("Failed to open {}: {}", entry.path.display(), err);
                entry.state = FileState::Failed;
                entry.error = Some(err.to_string());
                entry.finished_at = Some(Utc::now());
                self.push_history(entry);
                Err(err)
            }
        }
    }

    /// Mark the active entry exhausted without activating another
    pub fn finish_current(&mut self) -> Result<FileEntry> {
        self.finish(FileState::Exhausted, None)
            .ok_or(UploadError::NoActiveFile)
    }

    pub fn fail_current(&mut self, err: &UploadError) -> Result<FileEntry> {
        self.finish(FileState::Failed, Some(err.to_string()))
            .ok_or(UploadError::NoActiveFile)
    }

    pub fn skip_current(&mut self) -> Result<FileEntry> {
        self.finish(FileState::UserSwitched, None)
            .ok_or(UploadError::NoActiveFile)
    }

    /// User-initiated switch to a pending entry
    pub fn switch_to(&mut self, id: EntryId) -> Result<Activation> {
        let pending = self.prepare_switch(id)?;
        self.install(pending.open())
    }

    /// Lend the active reader to the pipeline
    pub fn checkout_reader(&mut self) -> Result<FileReader> {
        let active = self.active.as_mut().ok_or(UploadError::NoActiveFile)?;
        active.reader.take().ok_or_else(|| {
            UploadError::InvalidParameter(format!(
                "reader for {} is already checked out",
                active.entry.path.display()
            ))
        })
    }

    /// Return a lent reader. Readers for entries that are no longer active
    /// are dropped, releasing their handle.
    pub fn checkin_reader(&mut self, reader: FileReader) {
        match self.active.as_mut() {
            Some(active) if active.entry.id == reader.entry_id() && active.reader.is_none() => {
                active.reader = Some(reader);
            }
            _ => debug!("Dropping reader for inactive entry {}", reader.entry_id()),
        }
    }

    pub fn record_sent(&mut self, records: u64) {
        if let Some(active) = self.active.as_mut() {
            active.entry.records_sent += records;
        }
    }

    pub fn pending(&self) -> &VecDeque<FileEntry> {
        &self.pending
    }

    pub fn history(&self) -> &VecDeque<FileEntry> {
        &self.history
    }

    pub fn contains_pending(&self, id: EntryId) -> bool {
        self.pending.iter().any(|e| e.id == id)
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.opening.is_none() && self.pending.is_empty()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            active: self.active.as_ref().map(|a| a.entry.clone()),
            opening: self.opening.clone(),
            pending: self.pending.iter().cloned().collect(),
            history: self.history.iter().cloned().collect(),
            open_handles: self.tracker.open_handles(),
        }
    }

    pub fn open_handles(&self) -> usize {
        self.tracker.open_handles()
    }

    pub fn tracker(&self) -> &ResourceTracker {
        &self.tracker
    }

    fn ensure_not_opening(&self) -> Result<()> {
        match &self.opening {
            Some(entry) => Err(UploadError::InvalidParameter(format!(
                "{} is still being opened",
                entry.path.display()
            ))),
            None => Ok(()),
        }
    }

    fn begin_open(&mut self, entry: FileEntry, replaced: Option<FileEntry>) -> PendingOpen {
        let options = ReaderOptions {
            start_index: entry.start_index,
            ..self.options.reader.clone()
        };
        self.opening = Some(entry.clone());
        PendingOpen {
            entry,
            replaced,
            options,
            tracker: self.tracker.clone(),
            handles_before_open: self.tracker.open_handles(),
        }
    }

    /// Move the active entry to history, dropping its reader first
    fn finish(&mut self, state: FileState, error: Option<String>) -> Option<FileEntry> {
        let ActiveFile { mut entry, reader } = self.active.take()?;
        drop(reader);

        entry.state = state;
        entry.error = error;
        entry.finished_at = Some(Utc::now());
        debug!(
            "{} finished as {:?} after {} records",
            entry.path.display(),
            state,
            entry.records_sent
        );
        self.push_history(entry.clone());
        Some(entry)
    }

    fn push_history(&mut self, entry: FileEntry) {
        self.history.push_back(entry);
        while self.history.len() > self.options.history_limit {
            self.history.pop_front();
        }
    }
}
