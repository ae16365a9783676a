//! Log batching - coalesces rapid log arrivals into timed batches.

use std::time::{Duration, Instant};

use devmgr_core::LogEntry;

/// Default batch flush interval
pub const BATCH_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Batches log lines so the listener is called at most once per interval
///
/// A busy logcat produces thousands of lines per second. Delivering each one
/// separately would swamp whatever sits behind the listener, so lines are
/// held and released at a fixed cadence regardless of volume.
#[derive(Debug)]
pub struct LogBatcher {
    /// Pending log entries awaiting flush
    pending: Vec<LogEntry>,
    /// Timestamp of last flush
    last_flush: Instant,
    interval: Duration,
}

impl Default for LogBatcher {
    fn default() -> Self {
        Self::new(BATCH_FLUSH_INTERVAL)
    }
}

impl LogBatcher {
    pub fn new(interval: Duration) -> Self {
        Self {
            pending: Vec::new(),
            last_flush: Instant::now(),
            interval,
        }
    }

    /// Add a log entry to the batch
    ///
    /// Returns true if the batch should be flushed now
    pub fn add(&mut self, entry: LogEntry) -> bool {
        self.pending.push(entry);
        self.should_flush()
    }

    /// Non-empty and the interval since the last flush has passed
    pub fn should_flush(&self) -> bool {
        !self.pending.is_empty() && self.last_flush.elapsed() >= self.interval
    }

    /// Flush and return pending entries
    ///
    /// Resets the flush timer and returns all pending entries.
    pub fn flush(&mut self) -> Vec<LogEntry> {
        self.last_flush = Instant::now();
        std::mem::take(&mut self.pending)
    }

    /// Check if there are pending entries
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Get count of pending entries
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Time until next scheduled flush (for event loop timing)
    pub fn time_until_flush(&self) -> Duration {
        self.interval.saturating_sub(self.last_flush.elapsed())
    }
}
