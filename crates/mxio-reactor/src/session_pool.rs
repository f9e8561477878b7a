//! Per-endpoint session pool
//!
//! Caches at most one live session and at most one in-flight connect per
//! logical endpoint key. Concurrent requesters for the same key share
//! the single attempt: they queue in FIFO order and settle together,
//! with one shared cause on failure. Cached sessions are revalidated on
//! reuse; a stale one is closed and replaced, never handed back.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use mxio_core::{
    ReactorError, ReactorResult, SessionFuture, SessionHandle, SessionStatus,
};

/// Starts connection attempts on behalf of the pool and judges whether a
/// cached session is still usable.
pub trait PoolConnector<K>: Send + Sync {
    /// Begin connecting to the endpoint behind `key`.
    fn connect(&self, key: &K, timeout: Duration) -> ReactorResult<SessionFuture>;

    /// Liveness check applied before a cached session is reused.
    fn validate(&self, session: &SessionHandle) -> bool {
        session.status() == SessionStatus::Active
    }
}

struct PoolEntry {
    session: Option<SessionHandle>,
    /// The single in-flight attempt for this key, if any.
    connecting: Option<SessionFuture>,
    /// Requesters waiting on the in-flight attempt, resolution order.
    pending: VecDeque<SessionFuture>,
}

impl PoolEntry {
    fn new() -> Self {
        PoolEntry {
            session: None,
            connecting: None,
            pending: VecDeque::new(),
        }
    }
}

/// At-most-one-connect-per-endpoint coalescing pool.
pub struct SessionPool<K, C>
where
    K: Eq + Hash + Clone + Send + 'static,
    C: PoolConnector<K> + 'static,
{
    connector: C,
    entries: Mutex<HashMap<K, PoolEntry>>,
    closed: AtomicBool,
}

impl<K, C> SessionPool<K, C>
where
    K: Eq + Hash + Clone + Send + 'static,
    C: PoolConnector<K> + 'static,
{
    pub fn new(connector: C) -> Arc<Self> {
        Arc::new(SessionPool {
            connector,
            entries: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Get a session for `key`, connecting if necessary. Failures travel
    /// through the returned future, never as a synchronous error.
    pub fn session(self: &Arc<Self>, key: K, connect_timeout: Duration) -> SessionFuture {
        if self.closed.load(Ordering::Acquire) {
            return SessionFuture::failed(ReactorError::ShutDown);
        }

        let future = SessionFuture::new();
        let start_connect = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(key.clone()).or_insert_with(PoolEntry::new);

            if let Some(session) = entry.session.clone() {
                if self.connector.validate(&session) {
                    future.complete(session);
                    return future;
                }
                // Stale: force a fresh connection.
                session.close();
                entry.session = None;
            }

            entry.pending.push_back(future.clone());
            if entry.connecting.is_some() {
                false
            } else {
                // Mark the slot taken before dropping the lock so a
                // concurrent requester cannot start a second attempt.
                entry.connecting = Some(SessionFuture::new());
                true
            }
        };

        if start_connect {
            self.start_connect(key, connect_timeout);
        }
        future
    }

    fn start_connect(self: &Arc<Self>, key: K, connect_timeout: Duration) {
        let attempt = match self.connector.connect(&key, connect_timeout) {
            Ok(attempt) => attempt,
            Err(e) => {
                self.settle(&key, Err(Arc::new(e)));
                return;
            }
        };

        {
            // Keep the real future so close() can cancel it.
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(&key) {
                entry.connecting = Some(attempt.clone());
            }
        }

        let pool = Arc::downgrade(self);
        let watch_key = key.clone();
        attempt.on_complete(move |result| {
            if let Some(pool) = pool.upgrade() {
                pool.settle(&watch_key, result.clone());
            }
        });
    }

    /// Resolve everyone queued on `key` with the outcome of the single
    /// attempt, in enqueue order.
    fn settle(self: &Arc<Self>, key: &K, result: Result<SessionHandle, Arc<ReactorError>>) {
        let (waiters, orphaned) = {
            let mut entries = self.entries.lock();
            match entries.entry(key.clone()) {
                Entry::Occupied(mut occupied) => {
                    let entry = occupied.get_mut();
                    entry.connecting = None;
                    let waiters = std::mem::take(&mut entry.pending);
                    let orphaned = if self.closed.load(Ordering::Acquire) {
                        // Pool closed mid-flight; the new session has no
                        // home.
                        result.as_ref().ok().cloned()
                    } else {
                        if let Ok(session) = &result {
                            entry.session = Some(session.clone());
                        }
                        None
                    };
                    (waiters, orphaned)
                }
                Entry::Vacant(_) => (VecDeque::new(), result.as_ref().ok().cloned()),
            }
        };

        if let Some(session) = orphaned {
            session.close();
        }
        for waiter in waiters {
            match &result {
                Ok(session) => {
                    waiter.complete(session.clone());
                }
                Err(cause) => {
                    waiter.fail_shared(cause.clone());
                }
            }
        }
    }

    /// Number of keys with a cached live session or an attempt in
    /// flight.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the pool: cancel every pending requester and in-flight
    /// attempt, close every cached session. Calls after this fail fast.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let entries: Vec<PoolEntry> = {
            let mut map = self.entries.lock();
            map.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            if let Some(attempt) = entry.connecting {
                attempt.cancel();
            }
            for waiter in entry.pending {
                waiter.cancel();
            }
            if let Some(session) = entry.session {
                session.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mxio_core::{
        Command, CommandPriority, EventHandler, InterestSet, SecureLayer, Session, SessionId,
    };
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;

    /// In-memory session standing in for a real connection.
    #[derive(Debug)]
    struct FakeSession {
        id: SessionId,
        status: mxio_core::AtomicSessionStatus,
    }

    impl FakeSession {
        fn handle(seq: u64) -> SessionHandle {
            Arc::new(FakeSession {
                id: SessionId::new(0, seq),
                status: mxio_core::AtomicSessionStatus::new(SessionStatus::Active),
            })
        }
    }

    impl Session for FakeSession {
        fn id(&self) -> SessionId {
            self.id
        }
        fn status(&self) -> SessionStatus {
            self.status.get()
        }
        fn local_addr(&self) -> SocketAddr {
            "127.0.0.1:0".parse().unwrap()
        }
        fn remote_addr(&self) -> SocketAddr {
            "127.0.0.1:0".parse().unwrap()
        }
        fn event_mask(&self) -> InterestSet {
            InterestSet::NONE
        }
        fn set_event(&self, _: InterestSet) {}
        fn clear_event(&self, _: InterestSet) {}
        fn read(&self, _: &mut [u8]) -> std::io::Result<usize> {
            Ok(0)
        }
        fn write(&self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len())
        }
        fn enqueue(&self, _: Command, _: CommandPriority) {}
        fn poll_command(&self) -> Option<Command> {
            None
        }
        fn socket_timeout(&self) -> Duration {
            Duration::ZERO
        }
        fn set_socket_timeout(&self, _: Duration) {}
        fn last_read_ms(&self) -> u64 {
            0
        }
        fn last_write_ms(&self) -> u64 {
            0
        }
        fn last_event_ms(&self) -> u64 {
            0
        }
        fn close(&self) {
            self.status.set(SessionStatus::Closed);
        }
        fn close_mode(&self, _: mxio_core::CloseMode) {
            self.status.set(SessionStatus::Closed);
        }
        fn upgrade_handler(&self, _: Box<dyn EventHandler>) {}
        fn start_secure(&self, _: Box<dyn SecureLayer>) {}
    }

    /// Connector that records attempts and lets the test settle them.
    struct ManualConnector {
        attempts: Mutex<Vec<SessionFuture>>,
        count: AtomicUsize,
    }

    impl ManualConnector {
        fn new() -> Self {
            ManualConnector {
                attempts: Mutex::new(Vec::new()),
                count: AtomicUsize::new(0),
            }
        }
    }

    impl PoolConnector<String> for ManualConnector {
        fn connect(&self, _key: &String, _timeout: Duration) -> ReactorResult<SessionFuture> {
            self.count.fetch_add(1, Ordering::SeqCst);
            let future = SessionFuture::new();
            self.attempts.lock().push(future.clone());
            Ok(future)
        }
    }

    #[test]
    fn test_concurrent_requests_share_one_attempt() {
        let pool = SessionPool::new(ManualConnector::new());
        let futures: Vec<SessionFuture> = (0..50)
            .map(|_| pool.session("example.org:80".to_string(), Duration::from_secs(5)))
            .collect();

        assert_eq!(pool.connector.count.load(Ordering::SeqCst), 1);

        let session = FakeSession::handle(1);
        let attempt = pool.connector.attempts.lock()[0].clone();
        attempt.complete(session.clone());

        for future in &futures {
            let got = future.wait().unwrap();
            assert_eq!(got.id(), session.id());
        }
    }

    #[test]
    fn test_failure_shares_one_cause() {
        let pool = SessionPool::new(ManualConnector::new());
        let a = pool.session("k".to_string(), Duration::from_secs(5));
        let b = pool.session("k".to_string(), Duration::from_secs(5));

        let attempt = pool.connector.attempts.lock()[0].clone();
        attempt.fail(ReactorError::UnresolvedAddress("k".into()));

        let ea = a.wait().unwrap_err();
        let eb = b.wait().unwrap_err();
        assert!(Arc::ptr_eq(&ea, &eb));
    }

    #[test]
    fn test_cached_session_is_reused() {
        let pool = SessionPool::new(ManualConnector::new());
        let first = pool.session("k".to_string(), Duration::from_secs(5));
        pool.connector.attempts.lock()[0].complete(FakeSession::handle(7));
        let first = first.wait().unwrap();

        let second = pool
            .session("k".to_string(), Duration::from_secs(5))
            .wait()
            .unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(pool.connector.count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stale_session_forces_new_connect() {
        let pool = SessionPool::new(ManualConnector::new());
        let first = pool.session("k".to_string(), Duration::from_secs(5));
        pool.connector.attempts.lock()[0].complete(FakeSession::handle(1));
        let cached = first.wait().unwrap();

        // Kill the cached session; the next request must not get it.
        cached.close();
        let second = pool.session("k".to_string(), Duration::from_secs(5));
        assert_eq!(pool.connector.count.load(Ordering::SeqCst), 2);

        pool.connector.attempts.lock()[1].complete(FakeSession::handle(2));
        assert_ne!(second.wait().unwrap().id(), cached.id());
    }

    #[test]
    fn test_close_drains_pending_with_cancellation() {
        let pool = SessionPool::new(ManualConnector::new());
        let futures: Vec<SessionFuture> = (0..50)
            .map(|_| pool.session("unresolved.invalid:80".to_string(), Duration::from_secs(5)))
            .collect();

        pool.close();

        for future in futures {
            let err = future.wait().unwrap_err();
            assert!(
                matches!(*err, ReactorError::Cancelled | ReactorError::ShutDown),
                "unexpected cause: {}",
                err
            );
        }
        assert!(pool.is_closed());
    }

    #[test]
    fn test_requests_after_close_fail_fast() {
        let pool = SessionPool::new(ManualConnector::new());
        pool.close();
        let future = pool.session("k".to_string(), Duration::from_secs(5));
        assert!(matches!(
            *future.wait().unwrap_err(),
            ReactorError::ShutDown
        ));
        assert_eq!(pool.connector.count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_session_arriving_after_close_is_closed() {
        let pool = SessionPool::new(ManualConnector::new());
        let waiter = pool.session("k".to_string(), Duration::from_secs(5));
        let attempt = pool.connector.attempts.lock()[0].clone();

        pool.close();
        // close() cancelled the attempt; the waiter is settled.
        assert!(waiter.is_done());

        // A racing completion that lost to the cancel leaves everything
        // settled; a session arriving via a fresh settle path is closed.
        let late = FakeSession::handle(9);
        attempt.complete(late.clone());
        pool.settle(&"k".to_string(), Ok(late.clone()));
        assert_eq!(late.status(), SessionStatus::Closed);
    }
}
