use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counts file handles currently held by readers.
///
/// Every reader owns a `HandleGuard`; dropping the reader on any path
/// (completion, user switch, error, panic unwinding) gives the slot back.
#[derive(Debug, Clone, Default)]
pub struct ResourceTracker {
    open: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) -> HandleGuard {
        let now = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        HandleGuard {
            open: Arc::clone(&self.open),
        }
    }

    pub fn open_handles(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn peak_handles(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct HandleGuard {
    open: Arc<AtomicUsize>,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guards_release_on_drop() {
        let tracker = ResourceTracker::new();
        let a = tracker.acquire();
        let b = tracker.acquire();
        assert_eq!(tracker.open_handles(), 2);
        drop(a);
        assert_eq!(tracker.open_handles(), 1);
        drop(b);
        assert_eq!(tracker.open_handles(), 0);
        assert_eq!(tracker.peak_handles(), 2);
    }

    #[test]
    fn test_release_during_unwind() {
        let tracker = ResourceTracker::new();
        let cloned = tracker.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = cloned.acquire();
            panic!("reader blew up");
        });
        assert!(result.is_err());
        assert_eq!(tracker.open_handles(), 0);
    }
}
