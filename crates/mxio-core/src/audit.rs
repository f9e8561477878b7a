//! Bounded audit trail
//!
//! A lock-free ring of timestamped faults observed by workers, kept for
//! post-mortem diagnosis without crashing the worker that saw them.
//! Workers push; any thread may drain. When full, the oldest entry is
//! evicted.

use crossbeam_queue::ArrayQueue;

use crate::clock::millis_now;

/// One recorded fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    /// Monotonic millis at which the fault was observed.
    pub at_ms: u64,
    /// Index of the worker that observed it.
    pub worker: usize,
    pub message: String,
}

/// Bounded, timestamped fault ring.
pub struct AuditLog {
    ring: ArrayQueue<AuditEntry>,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        AuditLog {
            ring: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// Record a fault, evicting the oldest entry if the ring is full.
    pub fn record(&self, worker: usize, message: impl Into<String>) {
        self.ring.force_push(AuditEntry {
            at_ms: millis_now(),
            worker,
            message: message.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Remove and return everything recorded so far, oldest first.
    pub fn drain(&self) -> Vec<AuditEntry> {
        let mut out = Vec::with_capacity(self.ring.len());
        while let Some(entry) = self.ring.pop() {
            out.push(entry);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_drain() {
        let log = AuditLog::new(8);
        log.record(0, "first");
        log.record(1, "second");
        let entries = log.drain();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "first");
        assert_eq!(entries[0].worker, 0);
        assert_eq!(entries[1].message, "second");
        assert!(log.is_empty());
    }

    #[test]
    fn test_evicts_oldest_beyond_capacity() {
        let log = AuditLog::new(2);
        log.record(0, "a");
        log.record(0, "b");
        log.record(0, "c");
        let entries = log.drain();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "b");
        assert_eq!(entries[1].message, "c");
    }
}
