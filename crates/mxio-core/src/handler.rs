//! Session and event-handler contracts
//!
//! The reactor drives sessions; applications supply an [`EventHandler`]
//! per session through an [`EventHandlerFactory`]. Every callback is
//! invoked on the session's owning worker thread only, never
//! concurrently for the same session, and `connected` fires exactly once
//! before any `input_ready`/`output_ready`.

use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::command::{Command, CommandPriority};
use crate::error::{ReactorError, ReactorResult};
use crate::future::IoFuture;
use crate::id::SessionId;
use crate::interest::InterestSet;
use crate::secure::SecureLayer;
use crate::status::{CloseMode, SessionStatus};

/// Opaque payload handed from a connect/listen call to the handler factory.
pub type Attachment = Box<dyn Any + Send + Sync>;

/// Shared handle to a session.
pub type SessionHandle = Arc<dyn Session>;

/// Future resolving to an established session.
pub type SessionFuture = IoFuture<SessionHandle>;

/// The per-connection handle exposed to application code.
///
/// A session is owned by exactly one worker for its whole life; methods
/// here are safe to call from any thread, and mutations that touch the
/// poller (interest changes, closes, command submission) are published
/// to the owning worker and applied on its thread.
pub trait Session: Send + Sync + std::fmt::Debug {
    fn id(&self) -> SessionId;

    fn status(&self) -> SessionStatus;

    fn local_addr(&self) -> SocketAddr;

    fn remote_addr(&self) -> SocketAddr;

    /// Currently requested readiness interest.
    fn event_mask(&self) -> InterestSet;

    /// Add bits to the interest mask. Ignored once the session is closed.
    fn set_event(&self, mask: InterestSet);

    /// Remove bits from the interest mask.
    fn clear_event(&self, mask: InterestSet);

    /// Read available bytes. Returns `Ok(0)` at end of stream and
    /// `ErrorKind::WouldBlock` when nothing is buffered.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write bytes; may write fewer than requested.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Enqueue a command. Requests output interest so the owning worker
    /// picks the command up on the next writability event.
    fn enqueue(&self, command: Command, priority: CommandPriority);

    /// Take the next queued application command, if any.
    fn poll_command(&self) -> Option<Command>;

    /// Per-session idle timeout; zero means "never times out".
    fn socket_timeout(&self) -> Duration;

    fn set_socket_timeout(&self, timeout: Duration);

    /// Monotonic millis of the last observed read readiness.
    fn last_read_ms(&self) -> u64;

    fn last_write_ms(&self) -> u64;

    fn last_event_ms(&self) -> u64;

    /// Graceful close. Equivalent to `close_mode(CloseMode::Graceful)`.
    fn close(&self);

    /// Close with an explicit mode. Immediate close hard-aborts the
    /// transport (zero-linger).
    fn close_mode(&self, mode: CloseMode);

    /// Swap in a new event handler after a protocol switch. Permitted
    /// exactly once per session.
    ///
    /// # Panics
    ///
    /// Panics on a second upgrade attempt.
    fn upgrade_handler(&self, handler: Box<dyn EventHandler>);

    /// Layer a TLS engine over the transport. Subsequent `read`/`write`
    /// calls move application bytes through the layer; readiness events
    /// drive its handshake first. Permitted exactly once per session.
    ///
    /// # Panics
    ///
    /// Panics if the session already has a secure layer.
    fn start_secure(&self, layer: Box<dyn SecureLayer>);
}

/// Application-side I/O event callbacks.
///
/// Returning `Err` from a callback routes the error through the worker's
/// fault policy: the session is closed (after an `exception` callback),
/// or the worker terminates, per configuration.
pub trait EventHandler: Send {
    /// The session is connected and ready for I/O. Fires exactly once,
    /// after any proxy/TLS negotiation, before any other callback.
    fn connected(&mut self, session: &SessionHandle) -> ReactorResult<()>;

    /// The session has input pending. Readiness notification is
    /// edge-style: read until `WouldBlock`, or no further notification
    /// arrives for data already buffered by the OS.
    fn input_ready(&mut self, session: &SessionHandle) -> ReactorResult<()>;

    /// The session can accept output.
    fn output_ready(&mut self, session: &SessionHandle) -> ReactorResult<()> {
        let _ = session;
        Ok(())
    }

    /// The session has been idle past its socket timeout. The default
    /// closes the session; override to extend it instead.
    fn timeout(&mut self, session: &SessionHandle, idle: Duration) -> ReactorResult<()> {
        let _ = idle;
        session.close();
        Ok(())
    }

    /// An I/O or protocol error terminated the session.
    fn exception(&mut self, session: &SessionHandle, cause: &ReactorError) {
        let _ = (session, cause);
    }

    /// Terminal notification; the session is fully closed.
    fn disconnected(&mut self, session: &SessionHandle) {
        let _ = session;
    }
}

/// Produces the event handler for a newly data-ready session.
pub trait EventHandlerFactory: Send + Sync {
    fn create(
        &self,
        session: &SessionHandle,
        attachment: Option<&Attachment>,
    ) -> Box<dyn EventHandler>;
}

/// Closure adapter for [`EventHandlerFactory`].
pub struct FnHandlerFactory<F>(pub F);

impl<F> EventHandlerFactory for FnHandlerFactory<F>
where
    F: Fn(&SessionHandle, Option<&Attachment>) -> Box<dyn EventHandler> + Send + Sync,
{
    fn create(
        &self,
        session: &SessionHandle,
        attachment: Option<&Attachment>,
    ) -> Box<dyn EventHandler> {
        (self.0)(session, attachment)
    }
}
