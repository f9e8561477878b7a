//! MXIO Echo Demo
//!
//! Starts a reactor-driven TCP echo server, fires a burst of client
//! connections at it through a connecting reactor, prints the round-trip
//! count, and shuts both down gracefully.
//!
//! Usage:
//!     cargo run --release -p mxio-echo [port] [clients]
//!
//! With port 0 (the default) the server binds an ephemeral port.
//!
//! Test by hand while it runs:
//!     echo "hello" | nc localhost <port>

use std::io::ErrorKind;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mxio::{
    ConnectingIoReactor, EventHandler, FnHandlerFactory, InterestSet, ListeningIoReactor,
    NamedEndpoint, ReactorConfig, ReactorResult, SessionHandle,
};

const PAYLOAD: &[u8] = b"ping through the reactor\n";

// ── Server side ──────────────────────────────────────────────────────

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

// ── Client side ──────────────────────────────────────────────────────

struct BurstClient {
    received: usize,
    completed: Arc<AtomicUsize>,
}

impl EventHandler for BurstClient {
    fn connected(&mut self, session: &SessionHandle) -> ReactorResult<()> {
        let mut written = 0;
        while written < PAYLOAD.len() {
            written += session.write(&PAYLOAD[written..])?;
        }
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
                    self.received += n;
                    if self.received >= PAYLOAD.len() {
                        self.completed.fetch_add(1, Ordering::SeqCst);
                        session.close();
                        return Ok(());
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let port: u16 = args
        .next()
        .and_then(|a| a.parse().ok())
        .unwrap_or(0);
    let clients: usize = args
        .next()
        .and_then(|a| a.parse().ok())
        .unwrap_or(64);

    let config = ReactorConfig::default()
        .select_interval(Duration::from_millis(100))
        .thread_name_prefix("echo");

    let server = ListeningIoReactor::new(
        config.clone(),
        Arc::new(FnHandlerFactory(|_: &SessionHandle, _: Option<&mxio::Attachment>| {
            Box::new(EchoHandler) as Box<dyn EventHandler>
        })),
    )
    .expect("server reactor construction failed");
    server.start();

    let endpoint = server
        .listen(([127, 0, 0, 1], port).into(), None)
        .expect("listen refused")
        .wait()
        .expect("bind failed");
    let addr = endpoint.address();
    tracing::info!(%addr, "echo server listening");

    let completed = Arc::new(AtomicUsize::new(0));
    let completed2 = completed.clone();
    let client = ConnectingIoReactor::new(
        config,
        Arc::new(FnHandlerFactory(move |_: &SessionHandle, _: Option<&mxio::Attachment>| {
            Box::new(BurstClient {
                received: 0,
                completed: completed2.clone(),
            }) as Box<dyn EventHandler>
        })),
    )
    .expect("client reactor construction failed");
    client.start();

    let start = Instant::now();
    let futures: Vec<_> = (0..clients)
        .map(|_| {
            client
                .connect(
                    NamedEndpoint::new("127.0.0.1", addr.port()),
                    Some(addr),
                    None,
                    Some(Duration::from_secs(5)),
                    None,
                )
                .expect("connect refused")
        })
        .collect();
    for future in futures {
        future.wait().expect("connect failed");
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while completed.load(Ordering::SeqCst) < clients && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    let done = completed.load(Ordering::SeqCst);
    tracing::info!(
        clients = done,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "echo burst finished"
    );

    client.close();
    server.close();

    if done != clients {
        tracing::warn!(expected = clients, done, "some round-trips never completed");
        std::process::exit(1);
    }
}
