//! Readiness poller
//!
//! Thin wrapper over `mio::Poll` keyed by the worker's session arena
//! index: `Token(key)` in, arena key out. The poller instance is touched
//! only by its owning worker thread; the `Waker` is the one cross-thread
//! primitive, used to cut a blocking wait short when work is queued.

use std::io;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};

use mxio_core::InterestSet;

/// Token reserved for the cross-thread waker.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

/// Map an interest mask to the OS-level readiness interest, if any.
///
/// CONNECT rides write readiness, ACCEPT rides read readiness. An empty
/// mask has no OS representation; callers deregister instead.
pub(crate) fn map_interest(mask: InterestSet) -> Option<Interest> {
    match (mask.wants_read(), mask.wants_write()) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

pub(crate) struct Poller {
    poll: Poll,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Poller { poll: Poll::new()? })
    }

    /// Create the waker other threads use to interrupt this poller.
    pub(crate) fn waker(&self) -> io::Result<Waker> {
        Waker::new(self.poll.registry(), WAKE_TOKEN)
    }

    pub(crate) fn register(
        &self,
        source: &mut impl Source,
        key: usize,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().register(source, Token(key), interest)
    }

    pub(crate) fn reregister(
        &self,
        source: &mut impl Source,
        key: usize,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(source, Token(key), interest)
    }

    pub(crate) fn deregister(&self, source: &mut impl Source) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// One bounded readiness wait. Retries internally on EINTR.
    pub(crate) fn poll(&mut self, events: &mut Events, timeout: Duration) -> io::Result<()> {
        loop {
            match self.poll.poll(events, Some(timeout)) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }
}
