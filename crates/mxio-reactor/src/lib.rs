//! # mxio-reactor
//!
//! The MXIO reactor implementation: a fixed pool of worker threads, each
//! owning one readiness poller and driving many connections through a
//! connect → (SOCKS5) → data-ready channel state machine.
//!
//! The contracts this crate implements (sessions, event handlers, errors,
//! configuration) live in `mxio-core`; applications normally depend on
//! the `mxio` facade crate instead of this one.
//!
//! ## Modules
//!
//! - `poller` - mio wrapper keyed by session arena index
//! - `session` - `IoSession`, the per-connection record and handle
//! - `channel` - channel state machine (connect / SOCKS5 / data)
//! - `worker` - single-core reactor event loop
//! - `acceptor` - accept-only worker and listener endpoints
//! - `workers` - worker pool and round-robin selector
//! - `reactor` - connecting/listening multi-core facades
//! - `session_pool` - per-endpoint coalescing session pool

pub mod acceptor;
pub(crate) mod channel;
pub(crate) mod poller;
pub mod reactor;
pub mod session;
pub mod session_pool;
pub(crate) mod worker;
pub(crate) mod workers;

pub use acceptor::ListenerEndpoint;
pub use reactor::{ConnectingIoReactor, ListeningIoReactor};
pub use session::IoSession;
pub use session_pool::{PoolConnector, SessionPool};
