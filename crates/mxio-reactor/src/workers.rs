//! Worker pool and selector strategy
//!
//! Distributes new connect requests and accepted sockets across a fixed
//! set of single-core reactors with nothing but an atomic counter on the
//! hot path: a masked increment when the worker count is a power of two,
//! a modulo increment otherwise. The chosen worker's status is checked
//! before handoff so work is never dropped into a dead queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mxio_core::{ReactorError, ReactorResult};

use crate::worker::WorkerShared;

pub(crate) struct IoWorkers {
    handles: Vec<Arc<WorkerShared>>,
    cursor: AtomicUsize,
    /// `Some(count - 1)` when the count is a power of two.
    mask: Option<usize>,
}

impl IoWorkers {
    /// `start_offset` lets two facades sharing one machine avoid both
    /// starting their rotation at worker 0.
    pub(crate) fn new(handles: Vec<Arc<WorkerShared>>, start_offset: usize) -> Self {
        debug_assert!(!handles.is_empty());
        let count = handles.len();
        let mask = if count.is_power_of_two() {
            Some(count - 1)
        } else {
            None
        };
        IoWorkers {
            handles,
            cursor: AtomicUsize::new(start_offset),
            mask,
        }
    }

    /// Pick the next worker in rotation. Fails fast with
    /// [`ReactorError::ShutDown`] when that worker no longer accepts
    /// work.
    pub(crate) fn next(&self) -> ReactorResult<&Arc<WorkerShared>> {
        let tick = self.cursor.fetch_add(1, Ordering::Relaxed);
        let index = match self.mask {
            Some(mask) => tick & mask,
            None => tick % self.handles.len(),
        };
        let handle = &self.handles[index];
        if !handle.accepts_work() {
            return Err(ReactorError::ShutDown);
        }
        Ok(handle)
    }

    pub(crate) fn handles(&self) -> &[Arc<WorkerShared>] {
        &self.handles
    }
}
