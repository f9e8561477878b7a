//! Data-ready channel
//!
//! Dispatches raw readiness to the application's event handler. When a
//! secure layer is installed, readiness is routed through it first: the
//! handshake is pumped, and one OS-level read readiness may surface
//! zero, one or repeated `input_ready` calls while decrypted data stays
//! buffered. A close handshake that cannot finish is bounded by the
//! session timeout and force-closed.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use mxio_core::{
    CloseMode, EventHandler, InterestSet, ReactorError, ReactorResult, Session, SessionHandle,
};

use crate::poller::{map_interest, Poller};
use crate::session::IoSession;

use super::{CloseReason, Verdict};

pub(crate) struct DataChannel {
    pub(crate) session: Arc<IoSession>,
    handle: SessionHandle,
    handler: Box<dyn EventHandler>,
    /// Interest last applied to the poller.
    registered: InterestSet,
    os_registered: bool,
    close_in_progress: bool,
}

impl DataChannel {
    pub(crate) fn new(session: Arc<IoSession>, handler: Box<dyn EventHandler>) -> Self {
        let handle: SessionHandle = session.clone();
        DataChannel {
            session,
            handle,
            handler,
            // Forces the first sync_interest to reconcile with the OS.
            registered: InterestSet::NONE,
            os_registered: true,
            close_in_progress: false,
        }
    }

    pub(crate) fn fire_connected(&mut self) -> ReactorResult<()> {
        self.handler.connected(&self.handle)
    }

    pub(crate) fn fire_exception(&mut self, cause: &ReactorError) {
        self.handler.exception(&self.handle, cause);
    }

    pub(crate) fn fire_disconnected(&mut self) {
        self.handler.disconnected(&self.handle);
    }

    /// Swap in a handler left by `Session::upgrade_handler`.
    pub(crate) fn install_upgrade(&mut self) {
        if let Some(handler) = self.session.take_pending_upgrade() {
            self.handler = handler;
        }
    }

    /// Reconcile the poller registration with the session's interest.
    pub(crate) fn sync_interest(&mut self, poller: &Poller, key: usize) -> io::Result<()> {
        let desired = self.session.event_mask();
        let was_registered = self.os_registered;
        match map_interest(desired) {
            Some(interest) => {
                if desired == self.registered && was_registered {
                    return Ok(());
                }
                self.session.with_stream(|stream| {
                    if was_registered {
                        poller.reregister(stream, key, interest)
                    } else {
                        poller.register(stream, key, interest)
                    }
                })?;
                self.os_registered = true;
            }
            None => {
                // No interest at all: drop out of the poller entirely.
                if was_registered {
                    self.session.with_stream(|stream| poller.deregister(stream))?;
                    self.os_registered = false;
                }
            }
        }
        self.registered = desired;
        Ok(())
    }

    pub(crate) fn on_event(&mut self, readable: bool, writable: bool, now: u64) -> Verdict {
        self.install_upgrade();
        if self.close_in_progress {
            return self.drive_close();
        }
        if readable {
            if let Err(e) = self.on_readable(now) {
                return Verdict::Close(CloseReason::Error(e));
            }
        }
        if writable {
            match self.on_writable(now) {
                Ok(Some(mode)) => return self.begin_close(mode),
                Ok(None) => {}
                Err(e) => return Verdict::Close(CloseReason::Error(e)),
            }
        }
        // A handler may have requested a close from inside a callback.
        if let Some(mode) = self.session.close_requested() {
            return self.begin_close(mode);
        }
        Verdict::Continue
    }

    /// Start closing. Graceful close with a secure layer keeps the
    /// channel alive until the close handshake completes (or times out).
    pub(crate) fn begin_close(&mut self, mode: CloseMode) -> Verdict {
        match mode {
            CloseMode::Immediate => Verdict::Close(CloseReason::Immediate),
            CloseMode::Graceful => {
                if self.session.has_secure() {
                    self.drive_close()
                } else {
                    Verdict::Close(CloseReason::Graceful)
                }
            }
        }
    }

    /// Idle timeout from the sweep. A half-complete close handshake is
    /// force-closed; otherwise the application decides (the default
    /// handler implementation closes the session).
    pub(crate) fn on_timeout(&mut self, idle: Duration) -> Verdict {
        if self.close_in_progress {
            return Verdict::Close(CloseReason::Immediate);
        }
        if let Err(e) = self.handler.timeout(&self.handle, idle) {
            return Verdict::Close(CloseReason::Error(e));
        }
        if let Some(mode) = self.session.close_requested() {
            return self.begin_close(mode);
        }
        Verdict::Continue
    }

    fn drive_close(&mut self) -> Verdict {
        self.close_in_progress = true;
        match self.session.secure_close_step() {
            // No layer (or exchange finished): release cleanly.
            Ok(None) | Ok(Some(true)) => Verdict::Close(CloseReason::Graceful),
            Ok(Some(false)) => {
                // Waiting on the peer's close record.
                self.session
                    .set_event(InterestSet::INPUT.with(InterestSet::OUTPUT));
                Verdict::Continue
            }
            Err(e) => Verdict::Close(CloseReason::Error(e.into())),
        }
    }

    fn on_readable(&mut self, now: u64) -> ReactorResult<()> {
        self.session.touch_read(now);
        let secured = self.session.secure_process_read()?;
        if secured {
            // Decrypted records may be buffered; keep dispatching while
            // the handler makes progress on them.
            loop {
                if !self.session.secure_app_input_available() {
                    break;
                }
                let before = self.session.read_counter();
                self.handler.input_ready(&self.handle)?;
                if self.session.read_counter() == before {
                    break;
                }
            }
            if self.session.secure_wants_write() {
                self.session.set_event(InterestSet::OUTPUT);
            }
        } else {
            self.handler.input_ready(&self.handle)?;
        }
        Ok(())
    }

    fn on_writable(&mut self, now: u64) -> ReactorResult<Option<CloseMode>> {
        self.session.touch_write(now);
        if let Some(mode) = self.session.pop_head_shutdown() {
            return Ok(Some(mode));
        }
        self.session.secure_process_write()?;
        if self.session.event_mask().contains(InterestSet::OUTPUT) {
            self.handler.output_ready(&self.handle)?;
        }
        if let Some(mode) = self.session.pop_head_shutdown() {
            return Ok(Some(mode));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerShared;
    use mxio_core::clock::millis_now;
    use mxio_core::{AuditLog, ReactorResult, SecureLayer, Transport};
    use std::io::Write as _;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Identity "TLS" engine: ciphertext is plaintext, but the buffering
    /// and close-handshake protocol behave like a real record layer.
    struct FakeLayer {
        inbound: Vec<u8>,
        close_pending_at: Option<u64>,
    }

    impl FakeLayer {
        fn new() -> Box<Self> {
            Box::new(FakeLayer {
                inbound: Vec::new(),
                close_pending_at: None,
            })
        }
    }

    impl SecureLayer for FakeLayer {
        fn process_read(&mut self, transport: &mut dyn Transport) -> io::Result<()> {
            let mut buf = [0u8; 1024];
            loop {
                match transport.read(&mut buf) {
                    Ok(0) => return Ok(()),
                    Ok(n) => self.inbound.extend_from_slice(&buf[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
        }

        fn process_write(&mut self, _transport: &mut dyn Transport) -> io::Result<()> {
            Ok(())
        }

        fn read_app(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.inbound.is_empty() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.inbound.len());
            buf[..n].copy_from_slice(&self.inbound[..n]);
            self.inbound.drain(..n);
            Ok(n)
        }

        fn write_app(&mut self, transport: &mut dyn Transport, buf: &[u8]) -> io::Result<usize> {
            transport.write(buf)
        }

        fn app_input_available(&self) -> bool {
            !self.inbound.is_empty()
        }

        fn wants_write(&self) -> bool {
            false
        }

        fn is_handshaking(&self) -> bool {
            false
        }

        fn initiate_close(&mut self, _transport: &mut dyn Transport) -> io::Result<bool> {
            // Outbound close sent; the peer in these tests never answers.
            if self.close_pending_at.is_none() {
                self.close_pending_at = Some(millis_now());
            }
            Ok(false)
        }

        fn close_pending_since(&self) -> Option<u64> {
            self.close_pending_at
        }
    }

    /// Reads at most `chunk` bytes per `input_ready` call.
    struct ChunkReader {
        chunk: usize,
        calls: Arc<AtomicUsize>,
        total: Arc<AtomicUsize>,
    }

    impl mxio_core::EventHandler for ChunkReader {
        fn connected(&mut self, _: &SessionHandle) -> ReactorResult<()> {
            Ok(())
        }

        fn input_ready(&mut self, session: &SessionHandle) -> ReactorResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.chunk == 0 {
                // Deliberately makes no progress.
                return Ok(());
            }
            let mut buf = vec![0u8; self.chunk];
            if let Ok(n) = session.read(&mut buf) {
                self.total.fetch_add(n, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    fn data_channel(chunk: usize) -> (DataChannel, std::net::TcpStream, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = std::net::TcpStream::connect(addr).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();

        let poller = crate::poller::Poller::new().unwrap();
        let waker = poller.waker().unwrap();
        let shared = Arc::new(WorkerShared::new(0, waker, Arc::new(AuditLog::new(8))));
        let session = IoSession::new(
            mxio_core::SessionId::new(0, 1),
            0,
            mio::net::TcpStream::from_std(accepted),
            Duration::ZERO,
            shared,
        )
        .unwrap();
        session.start_secure(FakeLayer::new());

        let calls = Arc::new(AtomicUsize::new(0));
        let total = Arc::new(AtomicUsize::new(0));
        let handler = Box::new(ChunkReader {
            chunk,
            calls: calls.clone(),
            total: total.clone(),
        });
        (DataChannel::new(session, handler), peer, calls, total)
    }

    #[test]
    fn test_one_readiness_event_dispatches_repeatedly() {
        let (mut channel, mut peer, calls, total) = data_channel(3);
        peer.write_all(b"nine byte").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let verdict = channel.on_event(true, false, millis_now());
        assert!(matches!(verdict, Verdict::Continue));
        // 9 buffered bytes, 3 per call: three application dispatches for
        // one OS readiness notification.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(total.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn test_no_progress_handler_does_not_spin() {
        let (mut channel, mut peer, calls, _total) = data_channel(0);
        peer.write_all(b"stuck").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let verdict = channel.on_event(true, false, millis_now());
        assert!(matches!(verdict, Verdict::Continue));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(channel.session.secure_app_input_available());
    }

    #[test]
    fn test_half_complete_close_is_force_closed_on_timeout() {
        let (mut channel, _peer, _calls, _total) = data_channel(3);

        // Graceful close with a peer that never sends its close record.
        let verdict = channel.begin_close(CloseMode::Graceful);
        assert!(matches!(verdict, Verdict::Continue));
        assert!(channel.session.secure_close_pending_since().is_some());

        // The sweep escalates to a hard close instead of leaving the
        // connection half-open.
        let verdict = channel.on_timeout(Duration::from_secs(1));
        assert!(matches!(verdict, Verdict::Close(CloseReason::Immediate)));
    }
}
