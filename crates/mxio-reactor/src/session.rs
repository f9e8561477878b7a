//! Session implementation
//!
//! `IoSession` is the per-connection record: the socket, readiness
//! interest, activity timestamps, the command queue and the upgrade-once
//! handler slot. Exactly one worker owns a session for its whole life;
//! methods callable from other threads never touch the poller directly.
//! They update atomics or locked slots, publish the session's arena
//! token to the owning worker's update queue and wake its poller, and
//! the worker applies the change on its own thread.
//!
//! Lock order where both are taken: `secure` before `stream`.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::net::TcpStream;
use parking_lot::Mutex;

use mxio_core::clock::millis_now;
use mxio_core::{
    AtomicSessionStatus, CloseMode, Command, CommandPriority, EventHandler, InterestSet,
    SecureLayer, Session, SessionId, SessionStatus,
};

use crate::worker::WorkerShared;

/// One established transport-level connection.
pub struct IoSession {
    id: SessionId,
    token: usize,
    local: SocketAddr,
    remote: SocketAddr,
    stream: Mutex<Option<TcpStream>>,
    secure: Mutex<Option<Box<dyn SecureLayer>>>,
    secured: AtomicBool,
    status: AtomicSessionStatus,
    /// 0 = no close requested, 1 = graceful, 2 = immediate.
    close_request: AtomicU8,
    interest: AtomicU8,
    last_read: AtomicU64,
    last_write: AtomicU64,
    last_event: AtomicU64,
    socket_timeout_ms: AtomicU64,
    /// Total bytes handed to the application; lets the data channel
    /// detect a handler that made no progress on buffered input.
    read_count: AtomicU64,
    commands: Mutex<VecDeque<Command>>,
    upgrade: Mutex<Option<Box<dyn EventHandler>>>,
    upgraded: AtomicBool,
    worker: Arc<WorkerShared>,
}

impl IoSession {
    pub(crate) fn new(
        id: SessionId,
        token: usize,
        stream: TcpStream,
        socket_timeout: Duration,
        worker: Arc<WorkerShared>,
    ) -> io::Result<Arc<IoSession>> {
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;
        let now = millis_now();
        Ok(Arc::new(IoSession {
            id,
            token,
            local,
            remote,
            stream: Mutex::new(Some(stream)),
            secure: Mutex::new(None),
            secured: AtomicBool::new(false),
            status: AtomicSessionStatus::new(SessionStatus::Active),
            close_request: AtomicU8::new(0),
            interest: AtomicU8::new(InterestSet::INPUT.bits()),
            last_read: AtomicU64::new(now),
            last_write: AtomicU64::new(now),
            last_event: AtomicU64::new(now),
            socket_timeout_ms: AtomicU64::new(socket_timeout.as_millis() as u64),
            read_count: AtomicU64::new(0),
            commands: Mutex::new(VecDeque::new()),
            upgrade: Mutex::new(None),
            upgraded: AtomicBool::new(false),
            worker,
        }))
    }

    // ── Owner-thread operations ──────────────────────────────────────

    /// Run `f` against the raw socket (poller registration, direct I/O).
    pub(crate) fn with_stream<R>(
        &self,
        f: impl FnOnce(&mut TcpStream) -> io::Result<R>,
    ) -> io::Result<R> {
        let mut guard = self.stream.lock();
        match guard.as_mut() {
            Some(stream) => f(stream),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Release the socket: optional zero-linger abort, deregister, drop.
    /// After this the session is `CLOSED` and no further I/O is possible.
    pub(crate) fn release(&self, poller: &crate::poller::Poller, immediate: bool) {
        let mut guard = self.stream.lock();
        if let Some(mut stream) = guard.take() {
            if immediate {
                abort_linger(&stream);
            }
            let _ = poller.deregister(&mut stream);
        }
        self.status.set(SessionStatus::Closed);
    }

    pub(crate) fn touch_read(&self, now: u64) {
        self.last_read.store(now, Ordering::Relaxed);
        self.last_event.store(now, Ordering::Relaxed);
    }

    pub(crate) fn touch_write(&self, now: u64) {
        self.last_write.store(now, Ordering::Relaxed);
        self.last_event.store(now, Ordering::Relaxed);
    }

    pub(crate) fn read_counter(&self) -> u64 {
        self.read_count.load(Ordering::Relaxed)
    }

    /// Pending close requested via `close`/`close_mode`, if any.
    pub(crate) fn close_requested(&self) -> Option<CloseMode> {
        match self.close_request.load(Ordering::Acquire) {
            0 => None,
            1 => Some(CloseMode::Graceful),
            _ => Some(CloseMode::Immediate),
        }
    }

    /// Take a handler swapped in by `upgrade_handler`, if one is waiting.
    pub(crate) fn take_pending_upgrade(&self) -> Option<Box<dyn EventHandler>> {
        self.upgrade.lock().take()
    }

    /// Pop a shutdown command sitting at the head of the queue.
    /// Application commands stay put for `poll_command`.
    pub(crate) fn pop_head_shutdown(&self) -> Option<CloseMode> {
        let mut queue = self.commands.lock();
        match queue.front() {
            Some(Command::Shutdown(mode)) => {
                let mode = *mode;
                queue.pop_front();
                Some(mode)
            }
            _ => None,
        }
    }

    // ── Secure layer plumbing (owner thread) ─────────────────────────

    pub(crate) fn has_secure(&self) -> bool {
        self.secured.load(Ordering::Acquire)
    }

    /// Pump inbound records. Returns false when no layer is installed.
    pub(crate) fn secure_process_read(&self) -> io::Result<bool> {
        let mut secure = self.secure.lock();
        let Some(layer) = secure.as_mut() else {
            return Ok(false);
        };
        let mut guard = self.stream.lock();
        let stream = guard.as_mut().ok_or(io::ErrorKind::NotConnected)?;
        layer.process_read(stream)?;
        Ok(true)
    }

    /// Flush outbound records. Returns false when no layer is installed.
    pub(crate) fn secure_process_write(&self) -> io::Result<bool> {
        let mut secure = self.secure.lock();
        let Some(layer) = secure.as_mut() else {
            return Ok(false);
        };
        let mut guard = self.stream.lock();
        let stream = guard.as_mut().ok_or(io::ErrorKind::NotConnected)?;
        layer.process_write(stream)?;
        Ok(true)
    }

    pub(crate) fn secure_app_input_available(&self) -> bool {
        match self.secure.lock().as_ref() {
            Some(layer) => layer.app_input_available(),
            None => false,
        }
    }

    pub(crate) fn secure_wants_write(&self) -> bool {
        match self.secure.lock().as_ref() {
            Some(layer) => layer.wants_write(),
            None => false,
        }
    }

    /// Drive the close handshake one step. `None` when no layer is
    /// installed, `Some(true)` once the exchange has finished.
    pub(crate) fn secure_close_step(&self) -> io::Result<Option<bool>> {
        let mut secure = self.secure.lock();
        let Some(layer) = secure.as_mut() else {
            return Ok(None);
        };
        let mut guard = self.stream.lock();
        let stream = guard.as_mut().ok_or(io::ErrorKind::NotConnected)?;
        Ok(Some(layer.initiate_close(stream)?))
    }

    pub(crate) fn secure_close_pending_since(&self) -> Option<u64> {
        self.secure
            .lock()
            .as_ref()
            .and_then(|layer| layer.close_pending_since())
    }
}

impl Session for IoSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn status(&self) -> SessionStatus {
        self.status.get()
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn event_mask(&self) -> InterestSet {
        InterestSet::from_bits(self.interest.load(Ordering::Acquire))
    }

    fn set_event(&self, mask: InterestSet) {
        if self.status.get() == SessionStatus::Closed {
            return;
        }
        self.interest.fetch_or(mask.bits(), Ordering::AcqRel);
        self.worker.schedule_update(self.token);
    }

    fn clear_event(&self, mask: InterestSet) {
        if self.status.get() == SessionStatus::Closed {
            return;
        }
        self.interest.fetch_and(!mask.bits(), Ordering::AcqRel);
        self.worker.schedule_update(self.token);
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.status.get() == SessionStatus::Closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let mut secure = self.secure.lock();
        let n = match secure.as_mut() {
            Some(layer) => layer.read_app(buf)?,
            None => {
                let mut guard = self.stream.lock();
                let stream = guard.as_mut().ok_or(io::ErrorKind::NotConnected)?;
                stream.read(buf)?
            }
        };
        if n > 0 {
            self.read_count.fetch_add(n as u64, Ordering::Relaxed);
        }
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if self.status.get() == SessionStatus::Closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let mut secure = self.secure.lock();
        match secure.as_mut() {
            Some(layer) => {
                let mut guard = self.stream.lock();
                let stream = guard.as_mut().ok_or(io::ErrorKind::NotConnected)?;
                layer.write_app(stream, buf)
            }
            None => {
                let mut guard = self.stream.lock();
                let stream = guard.as_mut().ok_or(io::ErrorKind::NotConnected)?;
                stream.write(buf)
            }
        }
    }

    fn enqueue(&self, command: Command, priority: CommandPriority) {
        if self.status.get() == SessionStatus::Closed {
            return;
        }
        {
            let mut queue = self.commands.lock();
            match priority {
                CommandPriority::Normal => queue.push_back(command),
                CommandPriority::Immediate => queue.push_front(command),
            }
        }
        // The owning worker picks commands up on the next writability
        // event.
        self.set_event(InterestSet::OUTPUT);
    }

    fn poll_command(&self) -> Option<Command> {
        let mut queue = self.commands.lock();
        match queue.front() {
            Some(Command::App(_)) => queue.pop_front(),
            _ => None,
        }
    }

    fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms.load(Ordering::Acquire))
    }

    fn set_socket_timeout(&self, timeout: Duration) {
        self.socket_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Release);
    }

    fn last_read_ms(&self) -> u64 {
        self.last_read.load(Ordering::Relaxed)
    }

    fn last_write_ms(&self) -> u64 {
        self.last_write.load(Ordering::Relaxed)
    }

    fn last_event_ms(&self) -> u64 {
        self.last_event.load(Ordering::Relaxed)
    }

    fn close(&self) {
        self.close_mode(CloseMode::Graceful);
    }

    fn close_mode(&self, mode: CloseMode) {
        let want = match mode {
            CloseMode::Graceful => 1,
            CloseMode::Immediate => 2,
        };
        // Immediate overrides graceful; a close never downgrades.
        self.close_request.fetch_max(want, Ordering::AcqRel);
        if self.status.transition(SessionStatus::Active, SessionStatus::Closing)
            || self.status.get() == SessionStatus::Closing
        {
            self.worker.schedule_update(self.token);
        }
    }

    fn upgrade_handler(&self, handler: Box<dyn EventHandler>) {
        if self.upgraded.swap(true, Ordering::AcqRel) {
            panic!("session {} event handler already upgraded", self.id);
        }
        *self.upgrade.lock() = Some(handler);
        self.worker.schedule_update(self.token);
    }

    fn start_secure(&self, layer: Box<dyn SecureLayer>) {
        if self.secured.swap(true, Ordering::AcqRel) {
            panic!("session {} already has a secure layer", self.id);
        }
        *self.secure.lock() = Some(layer);
        // Drive the handshake: most engines want to send first.
        self.set_event(InterestSet::INPUT.with(InterestSet::OUTPUT));
    }
}

impl fmt::Display for IoSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}][{} -> {}]",
            self.id,
            self.status.get(),
            self.local,
            self.remote
        )
    }
}

impl fmt::Debug for IoSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// SO_LINGER=0: close() sends RST and releases the port immediately.
fn abort_linger(stream: &TcpStream) {
    let linger = libc::linger {
        l_onoff: 1,
        l_linger: 0,
    };
    unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &linger as *const libc::linger as *const libc::c_void,
            std::mem::size_of::<libc::linger>() as libc::socklen_t,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerShared;
    use mxio_core::AuditLog;

    fn test_session() -> (Arc<IoSession>, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();

        let poller = crate::poller::Poller::new().unwrap();
        let waker = poller.waker().unwrap();
        let shared = Arc::new(WorkerShared::new(0, waker, Arc::new(AuditLog::new(8))));
        let stream = TcpStream::from_std(accepted);
        let session =
            IoSession::new(SessionId::new(0, 1), 0, stream, Duration::ZERO, shared).unwrap();
        (session, client)
    }

    #[test]
    fn test_command_queue_ordering() {
        let (session, _client) = test_session();
        session.enqueue(Command::app(1u32), CommandPriority::Normal);
        session.enqueue(Command::app(2u32), CommandPriority::Normal);
        session.enqueue(Command::Shutdown(CloseMode::Graceful), CommandPriority::Immediate);

        // The immediate-priority shutdown jumped the queue.
        assert_eq!(session.pop_head_shutdown(), Some(CloseMode::Graceful));
        assert!(session.pop_head_shutdown().is_none());

        let first = session.poll_command().unwrap();
        match first {
            Command::App(payload) => assert_eq!(*payload.downcast::<u32>().unwrap(), 1),
            _ => panic!("expected app command"),
        }
    }

    #[test]
    fn test_enqueue_requests_output_interest() {
        let (session, _client) = test_session();
        assert!(!session.event_mask().contains(InterestSet::OUTPUT));
        session.enqueue(Command::app(()), CommandPriority::Normal);
        assert!(session.event_mask().contains(InterestSet::OUTPUT));
    }

    #[test]
    fn test_close_request_never_downgrades() {
        let (session, _client) = test_session();
        session.close_mode(CloseMode::Immediate);
        session.close_mode(CloseMode::Graceful);
        assert_eq!(session.close_requested(), Some(CloseMode::Immediate));
        assert_eq!(session.status(), SessionStatus::Closing);
    }

    #[test]
    #[should_panic(expected = "already upgraded")]
    fn test_double_upgrade_panics() {
        struct Nop;
        impl EventHandler for Nop {
            fn connected(&mut self, _: &mxio_core::SessionHandle) -> mxio_core::ReactorResult<()> {
                Ok(())
            }
            fn input_ready(
                &mut self,
                _: &mxio_core::SessionHandle,
            ) -> mxio_core::ReactorResult<()> {
                Ok(())
            }
        }
        let (session, _client) = test_session();
        session.upgrade_handler(Box::new(Nop));
        session.upgrade_handler(Box::new(Nop));
    }

    #[test]
    fn test_write_and_read_round_trip() {
        let (session, mut client) = test_session();
        assert_eq!(session.write(b"ping").unwrap(), 4);

        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        client.write_all(b"pong").unwrap();
        // Give loopback a moment to deliver.
        std::thread::sleep(Duration::from_millis(20));
        let n = session.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(session.read_counter(), 4);
    }
}
