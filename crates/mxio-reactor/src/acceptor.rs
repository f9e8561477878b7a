//! Accept-only worker
//!
//! The listening facade dedicates one thread to accepting. It owns a
//! slab of bound listeners, drains each accept burst, and hands every
//! accepted socket to a data worker chosen by the round-robin selector.
//! Pausing deregisters the listeners without unbinding them; resuming
//! re-registers them.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_queue::SegQueue;
use mio::net::TcpListener;
use mio::{Events, Interest, Waker};
use parking_lot::Mutex;
use slab::Slab;
use socket2::{Domain, Socket, Type};

use mxio_core::{
    AtomicReactorStatus, Attachment, AuditLog, IoFuture, ReactorConfig, ReactorError,
    ReactorResult, ReactorStatus,
};

use crate::poller::{Poller, WAKE_TOKEN};
use crate::worker::{WorkItem, WorkerShared};
use crate::workers::IoWorkers;

/// Worker index used for acceptor entries in the audit trail.
const ACCEPTOR_AUDIT_INDEX: usize = usize::MAX;

/// One bound server socket, as seen by callers.
pub struct ListenerEndpoint {
    addr: SocketAddr,
    token: usize,
    closed: AtomicBool,
    attachment: Option<Attachment>,
    acceptor: Weak<AcceptorShared>,
}

impl ListenerEndpoint {
    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn attachment(&self) -> Option<&Attachment> {
        self.attachment.as_ref()
    }

    /// Close this endpoint without touching the rest of the reactor.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(acceptor) = self.acceptor.upgrade() {
            let _ = acceptor.push(AcceptorWork::CloseEndpoint(self.token));
        }
    }
}

impl std::fmt::Debug for ListenerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ListenerEndpoint({}, {})",
            self.addr,
            if self.is_closed() { "closed" } else { "open" }
        )
    }
}

/// A request to bind and start accepting on an address.
pub(crate) struct ListenRequest {
    pub(crate) addr: SocketAddr,
    pub(crate) attachment: Option<Attachment>,
    pub(crate) future: IoFuture<Arc<ListenerEndpoint>>,
}

pub(crate) enum AcceptorWork {
    Listen(ListenRequest),
    CloseEndpoint(usize),
    Pause,
    Resume,
}

/// Cross-thread face of the accept worker.
pub(crate) struct AcceptorShared {
    pub(crate) status: AtomicReactorStatus,
    work: SegQueue<AcceptorWork>,
    waker: Waker,
    audit: Arc<AuditLog>,
    /// Open endpoints, maintained by the owner thread.
    endpoints: Mutex<Vec<Arc<ListenerEndpoint>>>,
}

impl AcceptorShared {
    pub(crate) fn push(&self, work: AcceptorWork) -> ReactorResult<()> {
        if !self.status.get().accepts_work() {
            return Err(ReactorError::ShutDown);
        }
        self.work.push(work);
        let _ = self.waker.wake();
        Ok(())
    }

    pub(crate) fn endpoints(&self) -> Vec<Arc<ListenerEndpoint>> {
        self.endpoints.lock().clone()
    }

    pub(crate) fn initiate_shutdown(&self) {
        if self.status.advance(ReactorStatus::ShuttingDown) {
            let _ = self.waker.wake();
        }
    }

    pub(crate) fn force_shutdown(&self) {
        if self.status.advance(ReactorStatus::ShutDown) {
            let _ = self.waker.wake();
        }
    }
}

const EVENTS_CAPACITY: usize = 256;

/// The accept loop. One per listening reactor.
pub(crate) struct AcceptorReactor {
    poller: Poller,
    events: Events,
    listeners: Slab<(TcpListener, Arc<ListenerEndpoint>)>,
    shared: Arc<AcceptorShared>,
    workers: Arc<IoWorkers>,
    config: Arc<ReactorConfig>,
    paused: bool,
}

impl AcceptorReactor {
    pub(crate) fn new(
        config: Arc<ReactorConfig>,
        workers: Arc<IoWorkers>,
        audit: Arc<AuditLog>,
    ) -> io::Result<(Self, Arc<AcceptorShared>)> {
        let poller = Poller::new()?;
        let waker = poller.waker()?;
        let shared = Arc::new(AcceptorShared {
            status: AtomicReactorStatus::new(ReactorStatus::Inactive),
            work: SegQueue::new(),
            waker,
            audit,
            endpoints: Mutex::new(Vec::new()),
        });
        let reactor = AcceptorReactor {
            poller,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listeners: Slab::new(),
            shared: shared.clone(),
            workers,
            config,
            paused: false,
        };
        Ok((reactor, shared))
    }

    pub(crate) fn run(&mut self) {
        if !self
            .shared
            .status
            .transition(ReactorStatus::Inactive, ReactorStatus::Active)
        {
            self.teardown();
            return;
        }
        tracing::debug!("acceptor worker started");

        loop {
            if self.shared.status.get() >= ReactorStatus::ShuttingDown {
                break;
            }
            if let Err(e) = self.poller.poll(&mut self.events, self.config.select_interval) {
                self.shared
                    .audit
                    .record(ACCEPTOR_AUDIT_INDEX, format!("accept wait failed: {}", e));
                break;
            }
            let mut ready: Vec<usize> = Vec::new();
            for event in self.events.iter() {
                if event.token() != WAKE_TOKEN {
                    ready.push(event.token().0);
                }
            }
            for key in ready {
                self.accept_ready(key);
            }
            self.process_work();
        }

        self.teardown();
        tracing::debug!("acceptor worker stopped");
    }

    /// Drain one listener's accept burst, distributing sockets across
    /// the data workers.
    fn accept_ready(&mut self, key: usize) {
        loop {
            let Some((listener, endpoint)) = self.listeners.get_mut(key) else {
                return;
            };
            match listener.accept() {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(self.config.tcp_no_delay);
                    match self.workers.next() {
                        Ok(worker) => {
                            if worker.submit(WorkItem::Accepted { stream, peer }).is_err() {
                                // The chosen worker shut down under us;
                                // nothing owns the socket, drop it.
                                tracing::debug!(%peer, "dropping accepted socket: worker shut down");
                            }
                        }
                        Err(_) => {
                            tracing::debug!(%peer, "dropping accepted socket: pool shut down");
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.shared.audit.record(
                        ACCEPTOR_AUDIT_INDEX,
                        format!("accept failed on {}: {}", endpoint.address(), e),
                    );
                    return;
                }
            }
        }
    }

    fn process_work(&mut self) {
        while let Some(work) = self.shared.work.pop() {
            match work {
                AcceptorWork::Listen(request) => self.begin_listen(request),
                AcceptorWork::CloseEndpoint(token) => self.close_endpoint(token),
                AcceptorWork::Pause => self.pause(),
                AcceptorWork::Resume => self.resume(),
            }
        }
    }

    fn begin_listen(&mut self, request: ListenRequest) {
        let mut listener = match bind_listener(&self.config, request.addr) {
            Ok(listener) => listener,
            Err(e) => {
                request.future.fail(e.into());
                return;
            }
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                request.future.fail(e.into());
                return;
            }
        };

        let entry = self.listeners.vacant_entry();
        let key = entry.key();
        if !self.paused {
            if let Err(e) = self.poller.register(&mut listener, key, Interest::READABLE) {
                request.future.fail(e.into());
                return;
            }
        }
        let endpoint = Arc::new(ListenerEndpoint {
            addr,
            token: key,
            closed: AtomicBool::new(false),
            attachment: request.attachment,
            acceptor: Arc::downgrade(&self.shared),
        });
        entry.insert((listener, endpoint.clone()));
        self.shared.endpoints.lock().push(endpoint.clone());
        tracing::debug!(%addr, "listener endpoint open");
        request.future.complete(endpoint);
    }

    fn close_endpoint(&mut self, token: usize) {
        let Some((mut listener, endpoint)) = self.listeners.try_remove(token) else {
            return;
        };
        if !self.paused {
            let _ = self.poller.deregister(&mut listener);
        }
        endpoint.closed.store(true, Ordering::Release);
        self.shared
            .endpoints
            .lock()
            .retain(|e| e.token != token);
        tracing::debug!(addr = %endpoint.address(), "listener endpoint closed");
    }

    /// Suspend accepting without tearing down bound endpoints.
    fn pause(&mut self) {
        if self.paused {
            return;
        }
        self.paused = true;
        for (_, (listener, _)) in self.listeners.iter_mut() {
            let _ = self.poller.deregister(listener);
        }
        tracing::debug!("accepting paused");
    }

    fn resume(&mut self) {
        if !self.paused {
            return;
        }
        self.paused = false;
        for (key, (listener, _)) in self.listeners.iter_mut() {
            let _ = self.poller.register(listener, key, Interest::READABLE);
        }
        tracing::debug!("accepting resumed");
    }

    fn teardown(&mut self) {
        for (_, (mut listener, endpoint)) in std::mem::replace(&mut self.listeners, Slab::new()) {
            if !self.paused {
                let _ = self.poller.deregister(&mut listener);
            }
            endpoint.closed.store(true, Ordering::Release);
        }
        self.shared.endpoints.lock().clear();

        while let Some(work) = self.shared.work.pop() {
            if let AcceptorWork::Listen(request) = work {
                request.future.fail(ReactorError::ShutDown);
            }
        }
        self.shared.status.set(ReactorStatus::ShutDown);
    }
}

/// Create, configure, bind and start listening.
fn bind_listener(config: &ReactorConfig, addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    if config.so_reuse_addr {
        socket.set_reuse_address(true)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(config.backlog)?;
    Ok(TcpListener::from_std(socket.into()))
}
