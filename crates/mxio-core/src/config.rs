//! Reactor configuration
//!
//! A single immutable snapshot, taken at reactor construction and shared
//! read-only by every worker. Runtime behavior never re-reads mutable
//! global state.

use std::net::SocketAddr;
use std::time::Duration;

/// What a worker does with an error that escapes an event handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPolicy {
    /// Record the fault in the audit trail and close the offending
    /// session; the worker keeps running.
    CloseSession,

    /// Record the fault and terminate the worker. The multi-worker facade
    /// surfaces the termination as a reactor-level failure.
    Terminate,
}

/// Upstream SOCKS5 proxy settings.
///
/// When present, every outbound connect goes through the proxy and the
/// target endpoint is carried inside the SOCKS connect request.
#[derive(Debug, Clone)]
pub struct SocksProxyConfig {
    /// Socket address of the proxy itself.
    pub proxy: SocketAddr,
    /// Username for RFC 1929 sub-negotiation; no sub-negotiation is
    /// offered when absent.
    pub username: Option<String>,
    pub password: Option<String>,
}

impl SocksProxyConfig {
    pub fn new(proxy: SocketAddr) -> Self {
        SocksProxyConfig {
            proxy,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(
        proxy: SocketAddr,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        SocksProxyConfig {
            proxy,
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }
}

/// Reactor configuration snapshot.
///
/// Plain struct with public fields; the chained setters exist for
/// call-site readability:
///
/// ```rust,ignore
/// let config = ReactorConfig::default()
///     .worker_count(4)
///     .socket_timeout(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Upper bound on one blocking readiness wait. Queued work and
    /// timeout sweeps are never starved longer than this.
    pub select_interval: Duration,
    /// How long a graceful shutdown waits before forcing workers out.
    pub shutdown_grace: Duration,
    /// Number of data worker threads.
    pub worker_count: usize,
    /// Default per-session idle timeout. Zero disables idle sweeping.
    pub socket_timeout: Duration,
    /// Timeout for connection establishment including proxy negotiation.
    pub connect_timeout: Duration,
    /// SO_REUSEADDR on listeners.
    pub so_reuse_addr: bool,
    /// SO_LINGER; `None` leaves the OS default.
    pub so_linger: Option<Duration>,
    /// SO_KEEPALIVE on connected sockets.
    pub so_keep_alive: bool,
    /// TCP_NODELAY on connected sockets.
    pub tcp_no_delay: bool,
    /// SO_SNDBUF; `None` leaves the OS default.
    pub snd_buf_size: Option<usize>,
    /// SO_RCVBUF; `None` leaves the OS default.
    pub rcv_buf_size: Option<usize>,
    /// Listen backlog size.
    pub backlog: i32,
    /// Prefix for worker thread names ("<prefix>-worker-N").
    pub thread_name_prefix: String,
    /// Policy for errors escaping event handlers.
    pub fault_policy: FaultPolicy,
    /// Capacity of the bounded audit trail.
    pub audit_capacity: usize,
    /// Optional upstream SOCKS5 proxy.
    pub socks_proxy: Option<SocksProxyConfig>,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        ReactorConfig {
            select_interval: Duration::from_millis(1000),
            shutdown_grace: Duration::from_secs(1),
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            socket_timeout: Duration::ZERO,
            connect_timeout: Duration::from_secs(30),
            so_reuse_addr: true,
            so_linger: None,
            so_keep_alive: false,
            tcp_no_delay: true,
            snd_buf_size: None,
            rcv_buf_size: None,
            backlog: 4096,
            thread_name_prefix: "mxio".into(),
            fault_policy: FaultPolicy::CloseSession,
            audit_capacity: 128,
            socks_proxy: None,
        }
    }
}

impl ReactorConfig {
    pub fn select_interval(mut self, v: Duration) -> Self {
        self.select_interval = v;
        self
    }

    pub fn shutdown_grace(mut self, v: Duration) -> Self {
        self.shutdown_grace = v;
        self
    }

    pub fn worker_count(mut self, v: usize) -> Self {
        self.worker_count = v.max(1);
        self
    }

    pub fn socket_timeout(mut self, v: Duration) -> Self {
        self.socket_timeout = v;
        self
    }

    pub fn connect_timeout(mut self, v: Duration) -> Self {
        self.connect_timeout = v;
        self
    }

    pub fn thread_name_prefix(mut self, v: impl Into<String>) -> Self {
        self.thread_name_prefix = v.into();
        self
    }

    pub fn fault_policy(mut self, v: FaultPolicy) -> Self {
        self.fault_policy = v;
        self
    }

    pub fn socks_proxy(mut self, v: SocksProxyConfig) -> Self {
        self.socks_proxy = Some(v);
        self
    }
}
