//! # mxio - Multiplexed I/O Reactor
//!
//! A non-blocking I/O reactor: many concurrent connections driven by a
//! small, fixed pool of worker threads, one readiness poller per thread.
//!
//! ## Features
//!
//! - **Fixed worker pool**: one thread, one poller, many sessions; no
//!   per-connection threads
//! - **Channel state machine**: connecting → SOCKS5-negotiating →
//!   data-ready, matched exhaustively at every dispatch
//! - **Lock-free handoff**: connect requests and accepted sockets reach
//!   workers through lock-free queues plus a poller wakeup
//! - **Integrated timeouts**: idle sweeps run inside the same loop that
//!   dispatches readiness; no separate timer thread
//! - **Three-tier shutdown**: initiate → await grace period → force,
//!   with every pending future resolved
//! - **Session pool**: at most one live session and one in-flight
//!   connect per endpoint, concurrent requesters coalesced
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use mxio::{ConnectingIoReactor, NamedEndpoint, ReactorConfig};
//!
//! let reactor = ConnectingIoReactor::new(
//!     ReactorConfig::default().worker_count(2),
//!     Arc::new(MyHandlerFactory),
//! )?;
//! reactor.start();
//!
//! let future = reactor.connect(
//!     NamedEndpoint::new("example.org", 80),
//!     None, None, None, None,
//! )?;
//! let session = future.wait()?;
//! // ... the handler's callbacks drive the connection from here
//! reactor.close();
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │        connect(), listen(), EventHandler callbacks          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Facade + worker selector                    │
//! │        round-robin handoff, lifecycle orchestration         │
//! └─────────────────────────────────────────────────────────────┘
//!          │                   │                   │
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Worker   │      │  Worker   │      │ Acceptor  │
//!    │ poll loop │      │ poll loop │      │ poll loop │
//!    └───────────┘      └───────────┘      └───────────┘
//!          │                   │                   │
//!          └───────────────────┴───────────────────┘
//!                              ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │        Sessions: connect / SOCKS5 / data channels       │
//!    └─────────────────────────────────────────────────────────┘
//! ```

pub use mxio_core::{
    Attachment, AuditEntry, AuditLog, CloseMode, Command, CommandPriority, EventHandler,
    EventHandlerFactory, FaultPolicy, FnHandlerFactory, InterestSet, IoFuture, NamedEndpoint,
    ReactorConfig, ReactorError, ReactorResult, ReactorStatus, SecureLayer, Session, SessionFuture,
    SessionHandle, SessionId, SessionStatus, SocksError, SocksProxyConfig, Transport,
};
pub use mxio_reactor::{
    ConnectingIoReactor, IoSession, ListenerEndpoint, ListeningIoReactor, PoolConnector,
    SessionPool,
};

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Server side: echo whatever arrives back to the peer.
    struct EchoHandler;

    impl EventHandler for EchoHandler {
        fn connected(&mut self, session: &SessionHandle) -> ReactorResult<()> {
            session.set_event(InterestSet::INPUT);
            Ok(())
        }

        fn input_ready(&mut self, session: &SessionHandle) -> ReactorResult<()> {
            let mut buf = [0u8; 4096];
            loop {
                match session.read(&mut buf) {
                    Ok(0) => {
                        session.close();
                        return Ok(());
                    }
                    Ok(n) => {
                        let mut written = 0;
                        while written < n {
                            written += session.write(&buf[written..n])?;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    /// Client side: send one message, expect it echoed, then close.
    struct ClientHandler {
        payload: &'static [u8],
        received: Arc<Mutex<Vec<u8>>>,
        events: Arc<Mutex<Vec<&'static str>>>,
    }

    impl EventHandler for ClientHandler {
        fn connected(&mut self, session: &SessionHandle) -> ReactorResult<()> {
            self.events.lock().push("connected");
            let mut written = 0;
            while written < self.payload.len() {
                written += session.write(&self.payload[written..])?;
            }
            session.set_event(InterestSet::INPUT);
            Ok(())
        }

        fn input_ready(&mut self, session: &SessionHandle) -> ReactorResult<()> {
            self.events.lock().push("input");
            let mut buf = [0u8; 4096];
            loop {
                match session.read(&mut buf) {
                    Ok(0) => {
                        session.close();
                        return Ok(());
                    }
                    Ok(n) => {
                        let mut received = self.received.lock();
                        received.extend_from_slice(&buf[..n]);
                        if received.len() >= self.payload.len() {
                            session.close();
                            return Ok(());
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                    Err(e) => return Err(e.into()),
                }
            }
        }

        fn disconnected(&mut self, _session: &SessionHandle) {
            self.events.lock().push("disconnected");
        }
    }

    fn small_config() -> ReactorConfig {
        ReactorConfig::default()
            .worker_count(2)
            .select_interval(Duration::from_millis(50))
            .shutdown_grace(Duration::from_secs(2))
    }

    #[test]
    fn test_echo_round_trip_through_both_facades() {
        let server = ListeningIoReactor::new(
            small_config(),
            Arc::new(FnHandlerFactory(|_: &SessionHandle, _: Option<&Attachment>| {
                Box::new(EchoHandler) as Box<dyn EventHandler>
            })),
        )
        .unwrap();
        server.start();
        let endpoint = server
            .listen("127.0.0.1:0".parse().unwrap(), None)
            .unwrap()
            .wait()
            .unwrap();
        let addr = endpoint.address();

        let received = Arc::new(Mutex::new(Vec::new()));
        let events = Arc::new(Mutex::new(Vec::new()));
        let (received2, events2) = (received.clone(), events.clone());
        let client = ConnectingIoReactor::new(
            small_config(),
            Arc::new(FnHandlerFactory(move |_: &SessionHandle, _: Option<&Attachment>| {
                Box::new(ClientHandler {
                    payload: b"hello reactor",
                    received: received2.clone(),
                    events: events2.clone(),
                }) as Box<dyn EventHandler>
            })),
        )
        .unwrap();
        client.start();

        let session = client
            .connect(
                NamedEndpoint::new("127.0.0.1", addr.port()),
                Some(addr),
                None,
                Some(Duration::from_secs(5)),
                None,
            )
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(session.status(), SessionStatus::Active);
        assert_eq!(session.remote_addr(), addr);

        // Wait for the echo to complete.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while received.lock().len() < b"hello reactor".len() {
            assert!(std::time::Instant::now() < deadline, "echo never arrived");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(received.lock().as_slice(), b"hello reactor");

        // `connected` strictly precedes any `input_ready`.
        {
            let seen = events.lock();
            assert_eq!(seen.first(), Some(&"connected"));
            assert!(seen.iter().filter(|e| **e == "connected").count() == 1);
        }

        client.close();
        server.close();
        assert!(client.status().is_shut_down());
        assert!(server.status().is_shut_down());
        assert_eq!(events.lock().last(), Some(&"disconnected"));
    }

    #[test]
    fn test_connect_to_unresolvable_host_fails_fast() {
        let client = ConnectingIoReactor::new(
            small_config(),
            Arc::new(FnHandlerFactory(|_: &SessionHandle, _: Option<&Attachment>| {
                Box::new(EchoHandler) as Box<dyn EventHandler>
            })),
        )
        .unwrap();
        client.start();

        let err = client
            .connect(
                NamedEndpoint::new("host.invalid", 80),
                None,
                None,
                Some(Duration::from_secs(1)),
                None,
            )
            .err()
            .expect("resolution must fail synchronously");
        assert!(matches!(err, ReactorError::UnresolvedAddress(_)));
        client.close();
    }

    #[test]
    fn test_shutdown_rejects_new_work() {
        let client = ConnectingIoReactor::new(
            small_config(),
            Arc::new(FnHandlerFactory(|_: &SessionHandle, _: Option<&Attachment>| {
                Box::new(EchoHandler) as Box<dyn EventHandler>
            })),
        )
        .unwrap();
        client.start();
        client.initiate_shutdown();
        assert!(client.await_shutdown(Duration::from_secs(5)));

        let result = client.connect(
            NamedEndpoint::new("127.0.0.1", 9),
            Some("127.0.0.1:9".parse().unwrap()),
            None,
            None,
            None,
        );
        assert!(matches!(result, Err(ReactorError::ShutDown)));
        for status in client.worker_status() {
            assert!(status.is_shut_down());
        }
        client.close();
    }

    #[test]
    fn test_graceful_shutdown_drains_open_sessions() {
        struct CountingHandler {
            connects: Arc<AtomicUsize>,
            disconnects: Arc<AtomicUsize>,
        }
        impl EventHandler for CountingHandler {
            fn connected(&mut self, session: &SessionHandle) -> ReactorResult<()> {
                self.connects.fetch_add(1, Ordering::SeqCst);
                session.set_event(InterestSet::INPUT);
                Ok(())
            }
            fn input_ready(&mut self, session: &SessionHandle) -> ReactorResult<()> {
                let mut buf = [0u8; 256];
                match session.read(&mut buf) {
                    Ok(0) => session.close(),
                    Ok(_) => {}
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e.into()),
                }
                Ok(())
            }
            fn disconnected(&mut self, _session: &SessionHandle) {
                self.disconnects.fetch_add(1, Ordering::SeqCst);
            }
        }

        let connects = Arc::new(AtomicUsize::new(0));
        let disconnects = Arc::new(AtomicUsize::new(0));
        let (connects2, disconnects2) = (connects.clone(), disconnects.clone());
        let server = ListeningIoReactor::new(
            small_config(),
            Arc::new(FnHandlerFactory(move |_: &SessionHandle, _: Option<&Attachment>| {
                Box::new(CountingHandler {
                    connects: connects2.clone(),
                    disconnects: disconnects2.clone(),
                }) as Box<dyn EventHandler>
            })),
        )
        .unwrap();
        server.start();
        let endpoint = server
            .listen("127.0.0.1:0".parse().unwrap(), None)
            .unwrap()
            .wait()
            .unwrap();

        // Three idle clients hang on the server.
        let clients: Vec<std::net::TcpStream> = (0..3)
            .map(|_| std::net::TcpStream::connect(endpoint.address()).unwrap())
            .collect();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while connects.load(Ordering::SeqCst) < 3 {
            assert!(
                std::time::Instant::now() < deadline,
                "sessions never became ready"
            );
            std::thread::sleep(Duration::from_millis(10));
        }

        server.initiate_shutdown();
        assert!(server.await_shutdown(Duration::from_secs(5)));
        // Every session was drained and notified, none left dangling.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while disconnects.load(Ordering::SeqCst) < 3 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(disconnects.load(Ordering::SeqCst), 3);
        drop(clients);
        server.close();
    }
}
