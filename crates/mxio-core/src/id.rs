//! Session identifier type

use core::fmt;

/// Unique identifier for a session.
///
/// Packs the owning worker index into the high 16 bits and a per-worker
/// sequence number into the low 48 bits. Workers hand out ids from their
/// own counter, so no process-global state is needed to keep ids unique.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SessionId(u64);

const WORKER_SHIFT: u32 = 48;
const SEQ_MASK: u64 = (1 << WORKER_SHIFT) - 1;

impl SessionId {
    /// Create an id from a worker index and that worker's sequence number.
    #[inline]
    pub const fn new(worker: usize, seq: u64) -> Self {
        SessionId(((worker as u64) << WORKER_SHIFT) | (seq & SEQ_MASK))
    }

    /// Index of the worker that owns this session.
    #[inline]
    pub const fn worker(self) -> usize {
        (self.0 >> WORKER_SHIFT) as usize
    }

    /// Per-worker sequence number.
    #[inline]
    pub const fn seq(self) -> u64 {
        self.0 & SEQ_MASK
    }

    /// Get the raw packed value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<SessionId> for u64 {
    #[inline]
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({}.{})", self.worker(), self.seq())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i/o-{}-{}", self.worker(), self.seq())
    }
}
