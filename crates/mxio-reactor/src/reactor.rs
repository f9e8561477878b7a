//! Multi-core reactor facades
//!
//! Aggregates worker lifecycles behind a single logical reactor:
//! [`ConnectingIoReactor`] for outbound connections, and
//! [`ListeningIoReactor`] which adds one dedicated accept worker in
//! front of the same kind of data-worker pool.
//!
//! Lifecycle: `start()` spawns the worker threads;
//! `initiate_shutdown()` begins a graceful drain without blocking;
//! `await_shutdown(timeout)` waits for the workers to finish;
//! `shutdown(grace)` chains the three-tier protocol
//! initiate → await grace → force; `close()` is a graceful shutdown
//! with the configured grace period.
//!
//! A worker that dies abnormally decrements the active count through a
//! drop guard and leaves a record in the audit trail, so the facade
//! observes the failure instead of silently losing a worker.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use mxio_core::clock::millis_now;
use mxio_core::{
    AtomicReactorStatus, Attachment, AuditLog, EventHandlerFactory, IoFuture, NamedEndpoint,
    ReactorConfig, ReactorError, ReactorResult, ReactorStatus, SessionFuture,
};

use crate::acceptor::{AcceptorReactor, AcceptorShared, ListenRequest, ListenerEndpoint};
use crate::channel::ConnectRequest;
use crate::worker::{SingleCoreReactor, WorkItem, WorkerShared};
use crate::workers::IoWorkers;

// ── Data-worker pool (shared by both facades) ────────────────────────

type ActiveCount = Arc<(Mutex<usize>, Condvar)>;

/// Decrements the active-worker count on thread exit, normal or not.
struct WorkerExitGuard {
    active: ActiveCount,
    shared: Arc<WorkerShared>,
}

impl Drop for WorkerExitGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.shared.audit.record(
                self.shared.index,
                "worker terminated abnormally (panic during dispatch)",
            );
        }
        self.shared.status.advance(ReactorStatus::ShutDown);
        let (count, cond) = &*self.active;
        *count.lock() -= 1;
        cond.notify_all();
    }
}

/// Fixed pool of data workers plus the thread bookkeeping both facades
/// share.
struct WorkerPool {
    config: Arc<ReactorConfig>,
    audit: Arc<AuditLog>,
    workers: Arc<IoWorkers>,
    pending: Mutex<Vec<SingleCoreReactor>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    active: ActiveCount,
    status: AtomicReactorStatus,
}

impl WorkerPool {
    fn new(
        config: Arc<ReactorConfig>,
        factory: Arc<dyn EventHandlerFactory>,
        audit: Arc<AuditLog>,
        start_offset: usize,
    ) -> ReactorResult<Self> {
        let mut loops = Vec::with_capacity(config.worker_count);
        let mut handles = Vec::with_capacity(config.worker_count);
        for index in 0..config.worker_count {
            // A poller that cannot be created is fatal at construction.
            let (reactor, shared) =
                SingleCoreReactor::new(index, config.clone(), factory.clone(), audit.clone())?;
            loops.push(reactor);
            handles.push(shared);
        }
        Ok(WorkerPool {
            config,
            audit,
            workers: Arc::new(IoWorkers::new(handles, start_offset)),
            pending: Mutex::new(loops),
            threads: Mutex::new(Vec::new()),
            active: Arc::new((Mutex::new(0), Condvar::new())),
            status: AtomicReactorStatus::new(ReactorStatus::Inactive),
        })
    }

    fn start(&self) {
        let loops = std::mem::take(&mut *self.pending.lock());
        if loops.is_empty() {
            return;
        }
        let mut threads = self.threads.lock();
        for mut reactor in loops {
            let shared = self.workers.handles()[threads.len()].clone();
            let active = self.active.clone();
            *self.active.0.lock() += 1;
            let name = format!(
                "{}-worker-{}",
                self.config.thread_name_prefix, shared.index
            );
            let handle = std::thread::Builder::new()
                .name(name)
                .spawn(move || {
                    let _guard = WorkerExitGuard { active, shared };
                    reactor.run();
                })
                .expect("failed to spawn reactor worker thread");
            threads.push(handle);
        }
        self.status.transition(ReactorStatus::Inactive, ReactorStatus::Active);
    }

    fn status(&self) -> ReactorStatus {
        self.status.get()
    }

    fn initiate_shutdown(&self) {
        if self.status.advance(ReactorStatus::ShuttingDown) {
            for handle in self.workers.handles() {
                handle.initiate_shutdown();
            }
        }
    }

    fn force_shutdown(&self) {
        self.status.advance(ReactorStatus::ShutDown);
        for handle in self.workers.handles() {
            handle.force_shutdown();
        }
    }

    /// Wait until every worker thread has exited, up to `timeout`.
    fn await_shutdown(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (count, cond) = &*self.active;
        let mut active = count.lock();
        while *active > 0 {
            if cond.wait_until(&mut active, deadline).timed_out() {
                return *active == 0;
            }
        }
        true
    }

    fn join_threads(&self) {
        let threads = std::mem::take(&mut *self.threads.lock());
        for thread in threads {
            let _ = thread.join();
        }
    }

    /// Three-tier shutdown: initiate, await the grace period, force.
    fn shutdown(&self, grace: Duration) {
        self.initiate_shutdown();
        if !self.await_shutdown(grace) {
            self.force_shutdown();
            let _ = self.await_shutdown(Duration::from_secs(5));
        }
        self.status.advance(ReactorStatus::ShutDown);
        self.join_threads();
    }
}

fn deadline_for(timeout: Duration) -> u64 {
    if timeout.is_zero() {
        u64::MAX
    } else {
        millis_now().saturating_add(timeout.as_millis() as u64)
    }
}

fn resolve(endpoint: &NamedEndpoint) -> ReactorResult<SocketAddr> {
    use std::net::ToSocketAddrs;
    let mut addrs = (endpoint.host.as_str(), endpoint.port)
        .to_socket_addrs()
        .map_err(|_| ReactorError::UnresolvedAddress(endpoint.to_string()))?;
    addrs
        .next()
        .ok_or_else(|| ReactorError::UnresolvedAddress(endpoint.to_string()))
}

// ── Connecting facade ────────────────────────────────────────────────

/// Multi-worker reactor for outbound connections.
pub struct ConnectingIoReactor {
    pool: WorkerPool,
}

impl ConnectingIoReactor {
    pub fn new(
        config: ReactorConfig,
        factory: Arc<dyn EventHandlerFactory>,
    ) -> ReactorResult<Self> {
        let config = Arc::new(config);
        let audit = Arc::new(AuditLog::new(config.audit_capacity));
        Ok(ConnectingIoReactor {
            pool: WorkerPool::new(config, factory, audit, 0)?,
        })
    }

    /// Spawn the worker threads.
    pub fn start(&self) {
        self.pool.start();
    }

    /// Request a new outbound session.
    ///
    /// Resolution happens here, before any socket is opened, so an
    /// unresolvable name fails fast. With a SOCKS proxy configured the
    /// name is left to the proxy and the TCP connect goes to the proxy
    /// address instead.
    pub fn connect(
        &self,
        endpoint: NamedEndpoint,
        remote: Option<SocketAddr>,
        local: Option<SocketAddr>,
        timeout: Option<Duration>,
        attachment: Option<Attachment>,
    ) -> ReactorResult<SessionFuture> {
        if !self.pool.status().accepts_work() {
            return Err(ReactorError::ShutDown);
        }
        let timeout = timeout.unwrap_or(self.pool.config.connect_timeout);
        let (connect_addr, resolved) = match &self.pool.config.socks_proxy {
            Some(proxy) => (proxy.proxy, remote),
            None => {
                let addr = match remote {
                    Some(addr) => addr,
                    None => resolve(&endpoint)?,
                };
                (addr, Some(addr))
            }
        };

        let future = SessionFuture::new();
        let request = ConnectRequest {
            endpoint,
            connect_addr,
            remote: resolved,
            local,
            deadline_ms: deadline_for(timeout),
            attachment,
            future: future.clone(),
        };

        let worker = self.pool.workers.next()?;
        // Cancel wakes the owner so the attempt dies promptly.
        let wake = worker.clone();
        future.on_cancel(move || wake.wake());
        worker.submit(WorkItem::Connect(request))?;
        Ok(future)
    }

    pub fn status(&self) -> ReactorStatus {
        self.pool.status()
    }

    pub fn audit(&self) -> Arc<AuditLog> {
        self.pool.audit.clone()
    }

    /// Per-worker status snapshot, worker index order.
    pub fn worker_status(&self) -> Vec<ReactorStatus> {
        self.pool
            .workers
            .handles()
            .iter()
            .map(|h| h.status.get())
            .collect()
    }

    pub fn initiate_shutdown(&self) {
        self.pool.initiate_shutdown();
    }

    pub fn await_shutdown(&self, timeout: Duration) -> bool {
        self.pool.await_shutdown(timeout)
    }

    pub fn shutdown(&self, grace: Duration) {
        self.pool.shutdown(grace);
    }

    /// Graceful shutdown with the configured grace period.
    pub fn close(&self) {
        self.pool.shutdown(self.pool.config.shutdown_grace);
    }
}

impl Drop for ConnectingIoReactor {
    fn drop(&mut self) {
        if !self.pool.status().is_shut_down() {
            self.pool.initiate_shutdown();
            self.pool.force_shutdown();
            self.pool.join_threads();
        }
    }
}

// ── Listening facade ─────────────────────────────────────────────────

/// Multi-worker reactor for inbound connections: one dedicated accept
/// worker feeding a pool of data workers.
pub struct ListeningIoReactor {
    pool: WorkerPool,
    acceptor: Arc<AcceptorShared>,
    acceptor_pending: Mutex<Option<AcceptorReactor>>,
    acceptor_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ListeningIoReactor {
    pub fn new(
        config: ReactorConfig,
        factory: Arc<dyn EventHandlerFactory>,
    ) -> ReactorResult<Self> {
        let config = Arc::new(config);
        let audit = Arc::new(AuditLog::new(config.audit_capacity));
        // Offset 1: the accept distribution does not pile onto the same
        // worker a sibling connecting facade starts with.
        let pool = WorkerPool::new(config.clone(), factory, audit.clone(), 1)?;
        let (acceptor_reactor, acceptor) =
            AcceptorReactor::new(config, pool.workers.clone(), audit)?;
        Ok(ListeningIoReactor {
            pool,
            acceptor,
            acceptor_pending: Mutex::new(Some(acceptor_reactor)),
            acceptor_thread: Mutex::new(None),
        })
    }

    /// Spawn the data workers and the accept worker.
    pub fn start(&self) {
        self.pool.start();
        if let Some(mut acceptor) = self.acceptor_pending.lock().take() {
            let name = format!("{}-acceptor", self.pool.config.thread_name_prefix);
            let handle = std::thread::Builder::new()
                .name(name)
                .spawn(move || acceptor.run())
                .expect("failed to spawn acceptor thread");
            *self.acceptor_thread.lock() = Some(handle);
        }
    }

    /// Bind a new listener endpoint.
    pub fn listen(
        &self,
        addr: SocketAddr,
        attachment: Option<Attachment>,
    ) -> ReactorResult<IoFuture<Arc<ListenerEndpoint>>> {
        let future = IoFuture::new();
        self.acceptor.push(crate::acceptor::AcceptorWork::Listen(ListenRequest {
            addr,
            attachment,
            future: future.clone(),
        }))?;
        Ok(future)
    }

    /// Suspend accepting; bound endpoints stay open.
    pub fn pause(&self) -> ReactorResult<()> {
        self.acceptor.push(crate::acceptor::AcceptorWork::Pause)
    }

    /// Resume accepting after a pause.
    pub fn resume(&self) -> ReactorResult<()> {
        self.acceptor.push(crate::acceptor::AcceptorWork::Resume)
    }

    /// Currently open listener endpoints.
    pub fn endpoints(&self) -> Vec<Arc<ListenerEndpoint>> {
        self.acceptor.endpoints()
    }

    pub fn status(&self) -> ReactorStatus {
        self.pool.status()
    }

    pub fn audit(&self) -> Arc<AuditLog> {
        self.pool.audit.clone()
    }

    pub fn worker_status(&self) -> Vec<ReactorStatus> {
        self.pool
            .workers
            .handles()
            .iter()
            .map(|h| h.status.get())
            .collect()
    }

    pub fn initiate_shutdown(&self) {
        // Stop the intake first, then drain the data workers.
        self.acceptor.initiate_shutdown();
        self.pool.initiate_shutdown();
    }

    pub fn await_shutdown(&self, timeout: Duration) -> bool {
        let drained = self.pool.await_shutdown(timeout);
        if drained {
            if let Some(thread) = self.acceptor_thread.lock().take() {
                let _ = thread.join();
            }
        }
        drained
    }

    pub fn shutdown(&self, grace: Duration) {
        self.initiate_shutdown();
        if !self.pool.await_shutdown(grace) {
            self.acceptor.force_shutdown();
            self.pool.force_shutdown();
            let _ = self.pool.await_shutdown(Duration::from_secs(5));
        }
        self.pool.status.advance(ReactorStatus::ShutDown);
        self.pool.join_threads();
        if let Some(thread) = self.acceptor_thread.lock().take() {
            let _ = thread.join();
        }
    }

    /// Graceful shutdown with the configured grace period.
    pub fn close(&self) {
        self.shutdown(self.pool.config.shutdown_grace);
    }
}

impl Drop for ListeningIoReactor {
    fn drop(&mut self) {
        if !self.pool.status().is_shut_down() {
            self.acceptor.initiate_shutdown();
            self.acceptor.force_shutdown();
            self.pool.initiate_shutdown();
            self.pool.force_shutdown();
            self.pool.join_threads();
            if let Some(thread) = self.acceptor_thread.lock().take() {
                let _ = thread.join();
            }
        }
    }
}
