//! Opaque TLS layer seam
//!
//! The reactor never implements cryptography. A [`SecureLayer`] wraps an
//! external TLS engine; the data channel only drives its state machine:
//! pump records on readiness, loop application dispatch while decrypted
//! data is buffered, and force-close a half-finished close handshake
//! that outlives the session timeout.

use std::io;

/// Raw byte transport the layer encrypts/decrypts over. Blanket-implemented
/// for anything readable and writable (the session's socket).
pub trait Transport: io::Read + io::Write {}

impl<T: io::Read + io::Write + ?Sized> Transport for T {}

/// One TLS engine instance layered between a socket and the application.
///
/// All methods are called on the session's owning worker thread. Every
/// operation must be non-blocking and resumable: a handshake step that
/// cannot finish returns `Ok` and continues on a later readiness event.
pub trait SecureLayer: Send {
    /// Pump inbound records after the transport reported readability.
    /// Drives the handshake when one is in progress.
    fn process_read(&mut self, transport: &mut dyn Transport) -> io::Result<()>;

    /// Flush pending outbound records after the transport reported
    /// writability. Drives the handshake when one is in progress.
    fn process_write(&mut self, transport: &mut dyn Transport) -> io::Result<()>;

    /// Read decrypted application bytes buffered by earlier
    /// `process_read` calls.
    fn read_app(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Encrypt and queue application bytes, flushing what the transport
    /// will take.
    fn write_app(&mut self, transport: &mut dyn Transport, buf: &[u8]) -> io::Result<usize>;

    /// Decrypted application bytes are buffered and ready.
    ///
    /// One OS readiness notification may surface zero, one or many
    /// application records; the data channel re-dispatches `input_ready`
    /// while this stays true.
    fn app_input_available(&self) -> bool;

    /// Encrypted bytes are queued waiting for transport writability.
    fn wants_write(&self) -> bool;

    /// The initial handshake has not completed yet.
    fn is_handshaking(&self) -> bool;

    /// Begin (or continue) the close handshake. Returns `Ok(true)` once
    /// the peer's close record has also been consumed and the session can
    /// be released cleanly.
    fn initiate_close(&mut self, transport: &mut dyn Transport) -> io::Result<bool>;

    /// Monotonic millis at which an outbound close was sent while the
    /// inbound close is still outstanding. The data channel force-closes
    /// the session when this outlives the session timeout.
    fn close_pending_since(&self) -> Option<u64>;
}
