use std::sync::atomic::{AtomicU64, Ordering};

use super::packet::Progress;

/// Row and byte counters shared between engine workers and the protocol thread.
///
/// Workers add with [`update`](Self::update) from any thread. The protocol thread drains the
/// counters with [`take`](Self::take), which swaps both to zero, so every increment is
/// reported exactly once.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    rows_processed: AtomicU64,
    bytes_processed: AtomicU64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, rows: u64, bytes: u64) {
        self.rows_processed.fetch_add(rows, Ordering::Relaxed);
        self.bytes_processed.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Returns the delta accumulated since the previous call and resets it.
    pub fn take(&self) -> Progress {
        Progress {
            rows: self.rows_processed.swap(0, Ordering::Relaxed),
            bytes: self.bytes_processed.swap(0, Ordering::Relaxed),
        }
    }

    /// Current pending delta, without resetting.
    pub fn pending(&self) -> Progress {
        Progress {
            rows: self.rows_processed.load(Ordering::Relaxed),
            bytes: self.bytes_processed.load(Ordering::Relaxed),
        }
    }
}
