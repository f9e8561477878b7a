//! Single-core reactor
//!
//! One OS thread, one poller, one slab of channels. Each loop iteration
//! does four kinds of work:
//!
//! 1. Dispatch readiness events to the owning channels
//! 2. Apply session updates published from other threads (interest
//!    changes, closes, handler upgrades, cancellations)
//! 3. Accept a bounded batch of new work items so already-registered
//!    channels are never starved
//! 4. Sweep per-channel timeouts (at most once per select interval) and
//!    drain the closed queue, firing terminal notifications outside the
//!    dispatch critical section
//!
//! Worker status runs `INACTIVE → ACTIVE → SHUTTING_DOWN → SHUT_DOWN`.
//! Entering `SHUTTING_DOWN` fails connect-phase channels, asks every
//! data channel to close gracefully, and stops accepting work; the loop
//! exits once the channel set drains (or the terminal status is forced).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::SegQueue;
use mio::net::TcpStream;
use mio::{Events, Interest, Waker};
use slab::Slab;

use mxio_core::clock::millis_now;
use mxio_core::{
    AtomicReactorStatus, AuditLog, CloseMode, Command, CommandPriority, EventHandlerFactory,
    FaultPolicy, ReactorConfig, ReactorError, ReactorResult, ReactorStatus, Session, SessionFuture,
    SessionId,
};

use crate::channel::{
    connecting, Channel, CloseReason, ConnectRequest, ConnectingChannel, DataChannel,
    SocksChannel, Verdict,
};
use crate::poller::{Poller, WAKE_TOKEN};
use crate::session::IoSession;

/// New units of work handed to a worker from other threads.
pub(crate) enum WorkItem {
    /// Outbound connect request.
    Connect(ConnectRequest),
    /// Socket accepted by the listening reactor's accept worker.
    Accepted {
        stream: TcpStream,
        peer: SocketAddr,
    },
}

/// Cross-thread face of one worker: status, queues and the waker.
pub(crate) struct WorkerShared {
    pub(crate) index: usize,
    pub(crate) status: AtomicReactorStatus,
    pub(crate) audit: Arc<AuditLog>,
    work: SegQueue<WorkItem>,
    updates: SegQueue<usize>,
    waker: Waker,
}

impl WorkerShared {
    pub(crate) fn new(index: usize, waker: Waker, audit: Arc<AuditLog>) -> Self {
        WorkerShared {
            index,
            status: AtomicReactorStatus::new(ReactorStatus::Inactive),
            audit,
            work: SegQueue::new(),
            updates: SegQueue::new(),
            waker,
        }
    }

    /// Interrupt the owner's blocking wait.
    pub(crate) fn wake(&self) {
        let _ = self.waker.wake();
    }

    /// Publish a session token the owner must look at.
    pub(crate) fn schedule_update(&self, token: usize) {
        self.updates.push(token);
        self.wake();
    }

    pub(crate) fn accepts_work(&self) -> bool {
        self.status.get().accepts_work()
    }

    /// Queue a work item for the owner, failing fast if this worker no
    /// longer accepts work.
    pub(crate) fn submit(&self, item: WorkItem) -> ReactorResult<()> {
        if !self.accepts_work() {
            return Err(ReactorError::ShutDown);
        }
        self.work.push(item);
        self.wake();
        Ok(())
    }

    pub(crate) fn initiate_shutdown(&self) {
        if self.status.advance(ReactorStatus::ShuttingDown) {
            self.wake();
        }
    }

    pub(crate) fn force_shutdown(&self) {
        if self.status.advance(ReactorStatus::ShutDown) {
            self.wake();
        }
    }
}

/// Bound on new work items consumed per loop iteration.
const INTAKE_BATCH: usize = 128;
const EVENTS_CAPACITY: usize = 1024;

/// The per-thread event loop. Constructed on the caller's thread, then
/// moved into (and only ever touched by) its worker thread.
pub(crate) struct SingleCoreReactor {
    poller: Poller,
    events: Events,
    channels: Slab<Channel>,
    shared: Arc<WorkerShared>,
    config: Arc<ReactorConfig>,
    factory: Arc<dyn EventHandlerFactory>,
    /// Fully-closed data channels awaiting their terminal notification.
    closed: Vec<DataChannel>,
    event_buf: Vec<(usize, bool, bool)>,
    session_seq: u64,
    last_sweep_ms: u64,
    drain_started: bool,
}

impl SingleCoreReactor {
    pub(crate) fn new(
        index: usize,
        config: Arc<ReactorConfig>,
        factory: Arc<dyn EventHandlerFactory>,
        audit: Arc<AuditLog>,
    ) -> std::io::Result<(Self, Arc<WorkerShared>)> {
        let poller = Poller::new()?;
        let waker = poller.waker()?;
        let shared = Arc::new(WorkerShared::new(index, waker, audit));
        let reactor = SingleCoreReactor {
            poller,
            events: Events::with_capacity(EVENTS_CAPACITY),
            channels: Slab::new(),
            shared: shared.clone(),
            config,
            factory,
            closed: Vec::new(),
            event_buf: Vec::new(),
            session_seq: 0,
            last_sweep_ms: 0,
            drain_started: false,
        };
        Ok((reactor, shared))
    }

    /// Run the event loop. Blocks until the worker reaches `SHUT_DOWN`.
    pub(crate) fn run(&mut self) {
        if !self
            .shared
            .status
            .transition(ReactorStatus::Inactive, ReactorStatus::Active)
        {
            // Shutdown raced ahead of start.
            self.teardown();
            return;
        }
        tracing::debug!(worker = self.shared.index, "reactor worker started");

        loop {
            match self.shared.status.get() {
                ReactorStatus::ShutDown => break,
                ReactorStatus::ShuttingDown => {
                    if !self.drain_started {
                        self.drain_started = true;
                        self.initiate_session_shutdown();
                    }
                    if self.channels.is_empty() {
                        break;
                    }
                }
                _ => {}
            }

            if let Err(e) = self.poller.poll(&mut self.events, self.config.select_interval) {
                self.shared
                    .audit
                    .record(self.shared.index, format!("readiness wait failed: {}", e));
                break;
            }

            let mut batch = std::mem::take(&mut self.event_buf);
            batch.clear();
            for event in self.events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                let errored = event.is_error();
                batch.push((
                    event.token().0,
                    event.is_readable() || event.is_read_closed() || errored,
                    event.is_writable() || event.is_write_closed() || errored,
                ));
            }
            for &(key, readable, writable) in &batch {
                self.dispatch(key, readable, writable);
            }
            self.event_buf = batch;

            self.process_updates();
            if self.shared.status.get() == ReactorStatus::Active {
                self.process_work();
            }
            self.sweep(millis_now());
            self.drain_closed();
        }

        self.teardown();
        tracing::debug!(worker = self.shared.index, "reactor worker stopped");
    }

    // ── Event dispatch ───────────────────────────────────────────────

    fn dispatch(&mut self, key: usize, readable: bool, writable: bool) {
        let now = millis_now();
        let verdict = match self.channels.get_mut(key) {
            None | Some(Channel::Tombstone) => return,
            Some(Channel::Connecting(c)) => c.check_connected(),
            Some(Channel::Socks(s)) => s.on_event(readable, writable),
            Some(Channel::Data(d)) => d.on_event(readable, writable, now),
        };
        self.apply(key, verdict);
    }

    fn apply(&mut self, key: usize, verdict: Verdict) {
        match verdict {
            Verdict::Continue => self.resync(key),
            Verdict::Promote => self.finish_negotiation(key),
            Verdict::Close(reason) => self.close_channel(key, reason),
        }
    }

    /// Reconcile poller interest after a channel survived an event.
    fn resync(&mut self, key: usize) {
        let result = match self.channels.get_mut(key) {
            Some(Channel::Socks(s)) => s.sync_interest(&self.poller, key),
            Some(Channel::Data(d)) => d.sync_interest(&self.poller, key),
            _ => Ok(()),
        };
        if let Err(e) = result {
            self.close_channel(key, CloseReason::Error(e.into()));
        }
    }

    // ── Cross-thread updates ─────────────────────────────────────────

    fn process_updates(&mut self) {
        while let Some(token) = self.shared.updates.pop() {
            let verdict = match self.channels.get_mut(token) {
                Some(Channel::Data(d)) => {
                    if let Some(mode) = d.session.close_requested() {
                        d.begin_close(mode)
                    } else {
                        d.install_upgrade();
                        Verdict::Continue
                    }
                }
                Some(Channel::Connecting(c)) if c.future_cancelled() => {
                    Verdict::Close(CloseReason::Immediate)
                }
                Some(Channel::Socks(s)) if s.future_cancelled() => {
                    Verdict::Close(CloseReason::Immediate)
                }
                _ => continue,
            };
            self.apply(token, verdict);
        }
    }

    // ── New work intake ──────────────────────────────────────────────

    fn process_work(&mut self) {
        for _ in 0..INTAKE_BATCH {
            let Some(item) = self.shared.work.pop() else {
                break;
            };
            match item {
                WorkItem::Connect(request) => self.begin_connect(request),
                WorkItem::Accepted { stream, peer } => self.begin_accepted(stream, peer),
            }
        }
    }

    fn begin_connect(&mut self, request: ConnectRequest) {
        if request.future.is_done() {
            // Cancelled while queued.
            return;
        }
        let (mut stream, connected) =
            match connecting::open_socket(&self.config, request.connect_addr, request.local) {
                Ok(pair) => pair,
                Err(e) => {
                    request.future.fail(e.into());
                    return;
                }
            };

        let entry = self.channels.vacant_entry();
        let key = entry.key();
        if let Err(e) = self
            .poller
            .register(&mut stream, key, Interest::READABLE | Interest::WRITABLE)
        {
            request.future.fail(e.into());
            return;
        }

        // A late cancel publishes the token so the attempt is aborted
        // promptly instead of waiting out the connect timeout.
        let shared = self.shared.clone();
        request.future.on_cancel(move || shared.schedule_update(key));

        entry.insert(Channel::Connecting(ConnectingChannel::new(stream, request)));
        tracing::trace!(worker = self.shared.index, key, "connect registered");

        if connected {
            // The OS finished the connect synchronously; dispatch the
            // connect event inline.
            self.dispatch(key, false, true);
        }
    }

    fn begin_accepted(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        let entry = self.channels.vacant_entry();
        let key = entry.key();
        if let Err(e) = self.poller.register(&mut stream, key, Interest::READABLE) {
            self.shared.audit.record(
                self.shared.index,
                format!("failed to register accepted socket from {}: {}", peer, e),
            );
            return;
        }
        entry.insert(Channel::Tombstone);
        tracing::trace!(worker = self.shared.index, key, %peer, "accepted socket adopted");
        self.promote_to_data(key, stream, None, None);
    }

    // ── Phase transitions ────────────────────────────────────────────

    /// A connect or SOCKS phase finished; move the slot forward.
    fn finish_negotiation(&mut self, key: usize) {
        let Some(slot) = self.channels.get_mut(key) else {
            return;
        };
        let channel = std::mem::replace(slot, Channel::Tombstone);
        match channel {
            Channel::Connecting(c) => {
                let (stream, request) = c.into_parts();
                match self.config.socks_proxy.clone() {
                    Some(proxy) => match SocksChannel::new(stream, request, &proxy) {
                        Ok(mut socks) => {
                            if let Err(e) = socks.sync_interest(&self.poller, key) {
                                let (mut stream, request) = socks.into_parts();
                                let _ = self.poller.deregister(&mut stream);
                                self.channels.remove(key);
                                request.future.fail(e.into());
                                return;
                            }
                            self.channels[key] = Channel::Socks(socks);
                        }
                        Err((mut stream, request, err)) => {
                            let _ = self.poller.deregister(&mut stream);
                            self.channels.remove(key);
                            request.future.fail(err);
                        }
                    },
                    None => self.promote_with_stream(key, stream, request),
                }
            }
            Channel::Socks(s) => {
                let (stream, request) = s.into_parts();
                self.promote_with_stream(key, stream, request);
            }
            other => {
                // Not a negotiation phase; put it back untouched.
                self.channels[key] = other;
            }
        }
    }

    fn promote_with_stream(&mut self, key: usize, stream: TcpStream, request: ConnectRequest) {
        // The stream stays registered under the same token; hand it to
        // the session and let promotion reconcile interest.
        self.channels[key] = Channel::Tombstone;
        let ConnectRequest {
            attachment, future, ..
        } = request;
        self.promote_to_data(key, stream, attachment, Some(future));
    }

    fn promote_to_data(
        &mut self,
        key: usize,
        stream: TcpStream,
        attachment: Option<mxio_core::Attachment>,
        future: Option<SessionFuture>,
    ) {
        if let Some(f) = &future {
            if f.is_done() {
                // Cancelled during negotiation.
                let mut stream = stream;
                let _ = self.poller.deregister(&mut stream);
                self.channels.remove(key);
                return;
            }
        }

        self.session_seq += 1;
        let id = SessionId::new(self.shared.index, self.session_seq);
        let session = match IoSession::new(
            id,
            key,
            stream,
            self.config.socket_timeout,
            self.shared.clone(),
        ) {
            Ok(session) => session,
            Err(e) => {
                self.channels.remove(key);
                if let Some(f) = future {
                    f.fail(e.into());
                }
                return;
            }
        };

        let handle: mxio_core::SessionHandle = session.clone();
        let handler = self.factory.create(&handle, attachment.as_ref());
        let mut data = DataChannel::new(session, handler);
        if let Err(e) = data.sync_interest(&self.poller, key) {
            data.session.release(&self.poller, false);
            self.channels.remove(key);
            if let Some(f) = future {
                f.fail(e.into());
            }
            return;
        }
        self.channels[key] = Channel::Data(data);
        tracing::trace!(worker = self.shared.index, session = %id, "session data-ready");

        if let Some(f) = future {
            if !f.complete(handle) {
                // Raced a cancel at the finish line.
                self.close_channel(key, CloseReason::Immediate);
                return;
            }
        }

        // Synthetic connect replay: the application sees its own
        // `connected` exactly once, after negotiation.
        let verdict = match self.channels.get_mut(key) {
            Some(Channel::Data(d)) => match d.fire_connected() {
                Ok(()) => Verdict::Continue,
                Err(e) => Verdict::Close(CloseReason::Error(e)),
            },
            _ => return,
        };
        self.apply(key, verdict);
    }

    // ── Closing ──────────────────────────────────────────────────────

    fn close_channel(&mut self, key: usize, reason: CloseReason) {
        let Some(channel) = self.channels.try_remove(key) else {
            return;
        };
        match channel {
            Channel::Connecting(c) => {
                let (mut stream, request) = c.into_parts();
                let _ = self.poller.deregister(&mut stream);
                drop(stream);
                fail_request(request, reason);
            }
            Channel::Socks(s) => {
                let (mut stream, request) = s.into_parts();
                let _ = self.poller.deregister(&mut stream);
                drop(stream);
                fail_request(request, reason);
            }
            Channel::Data(mut d) => {
                if let CloseReason::Error(cause) = &reason {
                    self.shared.audit.record(
                        self.shared.index,
                        format!("session {} fault: {}", d.session.id(), cause),
                    );
                    d.fire_exception(cause);
                    if self.config.fault_policy == FaultPolicy::Terminate {
                        self.shared.force_shutdown();
                    }
                }
                d.session
                    .release(&self.poller, matches!(reason, CloseReason::Immediate));
                self.closed.push(d);
            }
            Channel::Tombstone => {}
        }
    }

    /// Terminal notifications run outside the dispatch critical section.
    fn drain_closed(&mut self) {
        if self.closed.is_empty() {
            return;
        }
        let mut closed = std::mem::take(&mut self.closed);
        for channel in &mut closed {
            channel.fire_disconnected();
        }
    }

    // ── Timeout sweep ────────────────────────────────────────────────

    /// Runs at most once per select interval to bound overhead.
    fn sweep(&mut self, now: u64) {
        let interval = self.config.select_interval.as_millis() as u64;
        if now.saturating_sub(self.last_sweep_ms) < interval {
            return;
        }
        self.last_sweep_ms = now;

        let keys: Vec<usize> = self.channels.iter().map(|(k, _)| k).collect();
        for key in keys {
            let verdict = match self.channels.get_mut(key) {
                Some(Channel::Connecting(c)) => {
                    if c.future_cancelled() {
                        Verdict::Close(CloseReason::Immediate)
                    } else if now >= c.deadline_ms() {
                        Verdict::Close(CloseReason::Error(ReactorError::ConnectTimeout(
                            c.endpoint().clone(),
                        )))
                    } else {
                        Verdict::Continue
                    }
                }
                Some(Channel::Socks(s)) => {
                    if s.future_cancelled() {
                        Verdict::Close(CloseReason::Immediate)
                    } else if now >= s.deadline_ms() {
                        Verdict::Close(CloseReason::Error(ReactorError::ConnectTimeout(
                            s.endpoint().clone(),
                        )))
                    } else {
                        Verdict::Continue
                    }
                }
                Some(Channel::Data(d)) => {
                    let timeout = d.session.socket_timeout().as_millis() as u64;
                    if let Some(since) = d.session.secure_close_pending_since() {
                        // Half-complete close handshake; never leave it
                        // dangling even with idle sweeping disabled.
                        let bound = if timeout > 0 { timeout } else { interval };
                        if now.saturating_sub(since) >= bound {
                            Verdict::Close(CloseReason::Immediate)
                        } else {
                            Verdict::Continue
                        }
                    } else if timeout > 0
                        && now.saturating_sub(d.session.last_read_ms()) >= timeout
                    {
                        let idle = Duration::from_millis(now - d.session.last_read_ms());
                        d.on_timeout(idle)
                    } else {
                        Verdict::Continue
                    }
                }
                _ => Verdict::Continue,
            };
            match verdict {
                Verdict::Continue => {}
                other => self.apply(key, other),
            }
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    /// One-shot notifier when graceful drain begins: connect-phase
    /// channels fail immediately, data channels are asked to close via
    /// an immediate-priority shutdown command.
    fn initiate_session_shutdown(&mut self) {
        let keys: Vec<usize> = self.channels.iter().map(|(k, _)| k).collect();
        for key in keys {
            match self.channels.get(key) {
                Some(Channel::Connecting(_)) | Some(Channel::Socks(_)) => {
                    self.close_channel(key, CloseReason::Error(ReactorError::ShutDown));
                }
                Some(Channel::Data(d)) => {
                    d.session.enqueue(
                        Command::Shutdown(CloseMode::Graceful),
                        CommandPriority::Immediate,
                    );
                }
                _ => {}
            }
        }
    }

    /// Force everything out: hard-close remaining channels, resolve
    /// every queued work item, and land on `SHUT_DOWN`.
    fn teardown(&mut self) {
        let keys: Vec<usize> = self.channels.iter().map(|(k, _)| k).collect();
        for key in keys {
            match self.channels.get(key) {
                Some(Channel::Data(_)) => self.close_channel(key, CloseReason::Immediate),
                Some(_) => self.close_channel(key, CloseReason::Error(ReactorError::ShutDown)),
                None => {}
            }
        }
        self.drain_closed();

        while let Some(item) = self.shared.work.pop() {
            match item {
                WorkItem::Connect(request) => {
                    request.future.fail(ReactorError::ShutDown);
                }
                WorkItem::Accepted { stream, .. } => drop(stream),
            }
        }
        self.shared.status.set(ReactorStatus::ShutDown);
    }
}

fn fail_request(request: ConnectRequest, reason: CloseReason) {
    match reason {
        CloseReason::Error(e) => {
            request.future.fail(e);
        }
        CloseReason::Graceful | CloseReason::Immediate => {
            // Cancellation or shutdown races settle the future first;
            // this is a no-op then.
            request.future.fail(ReactorError::ShutDown);
        }
    }
}
