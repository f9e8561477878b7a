//! Channel state machine
//!
//! One slab entry per connection, tagged by phase and matched
//! exhaustively at every readiness dispatch:
//!
//! ```text
//!  Connecting ──► Socks ──► Data ──► (removed)
//!       │           │         │
//!       └───────────┴─────────┴──► closed on error/timeout/cancel
//! ```
//!
//! Channel methods never touch the poller or the slab; they return a
//! [`Verdict`] and the owning worker applies the side effects.

pub(crate) mod connecting;
pub(crate) mod data;
pub(crate) mod socks;

use std::net::SocketAddr;

use mxio_core::{Attachment, NamedEndpoint, ReactorError, SessionFuture};

pub(crate) use connecting::ConnectingChannel;
pub(crate) use data::DataChannel;
pub(crate) use socks::SocksChannel;

/// An in-flight outbound connection attempt.
pub(crate) struct ConnectRequest {
    /// The logical target the caller asked for.
    pub(crate) endpoint: NamedEndpoint,
    /// Where the TCP connect actually goes (the proxy address when a
    /// SOCKS proxy is configured).
    pub(crate) connect_addr: SocketAddr,
    /// Resolved target address, when resolution happened locally.
    pub(crate) remote: Option<SocketAddr>,
    /// Optional explicit local bind address.
    pub(crate) local: Option<SocketAddr>,
    /// Monotonic millis after which the attempt times out.
    pub(crate) deadline_ms: u64,
    pub(crate) attachment: Option<Attachment>,
    pub(crate) future: SessionFuture,
}

/// One registered connection, in whatever phase it currently is.
pub(crate) enum Channel {
    Connecting(ConnectingChannel),
    Socks(SocksChannel),
    Data(DataChannel),
    /// Placeholder while a transition moves state out of the slab slot.
    Tombstone,
}

/// What the worker should do with a channel after an event.
pub(crate) enum Verdict {
    /// Keep going; re-sync poller interest.
    Continue,
    /// Negotiation finished; advance to the next phase.
    Promote,
    /// Remove the channel.
    Close(CloseReason),
}

pub(crate) enum CloseReason {
    /// Orderly close (drained, graceful shutdown finished).
    Graceful,
    /// Hard abort: zero-linger close, no protocol goodbyes.
    Immediate,
    /// Failed: resolve the pending future / fire the exception callback
    /// with this cause, then close.
    Error(ReactorError),
}
