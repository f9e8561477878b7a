//! Connect-phase channel
//!
//! Owns a socket whose non-blocking connect is in progress. Socket
//! options come from the immutable config snapshot; an explicit local
//! bind happens before the connect. A connect the OS completes
//! synchronously is dispatched inline by the worker rather than waiting
//! for a readiness round-trip.

use std::io;
use std::net::SocketAddr;

use mio::net::TcpStream;
use socket2::{Domain, Socket, Type};

use mxio_core::{NamedEndpoint, ReactorConfig};

use super::{CloseReason, ConnectRequest, Verdict};

/// Open a non-blocking socket, apply options, optionally bind, and start
/// the connect. Returns the stream and whether the OS finished the
/// connect synchronously.
pub(crate) fn open_socket(
    config: &ReactorConfig,
    remote: SocketAddr,
    local: Option<SocketAddr>,
) -> io::Result<(TcpStream, bool)> {
    let socket = Socket::new(Domain::for_address(remote), Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    if config.tcp_no_delay {
        socket.set_nodelay(true)?;
    }
    if config.so_keep_alive {
        socket.set_keepalive(true)?;
    }
    if let Some(linger) = config.so_linger {
        socket.set_linger(Some(linger))?;
    }
    if let Some(size) = config.snd_buf_size {
        socket.set_send_buffer_size(size)?;
    }
    if let Some(size) = config.rcv_buf_size {
        socket.set_recv_buffer_size(size)?;
    }
    if let Some(addr) = local {
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
    }

    let connected = match socket.connect(&remote.into()) {
        Ok(()) => true,
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => false,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
        Err(e) => return Err(e),
    };

    let stream: std::net::TcpStream = socket.into();
    Ok((TcpStream::from_std(stream), connected))
}

/// Channel driving one non-blocking connect to completion.
pub(crate) struct ConnectingChannel {
    stream: TcpStream,
    request: ConnectRequest,
}

impl ConnectingChannel {
    pub(crate) fn new(stream: TcpStream, request: ConnectRequest) -> Self {
        ConnectingChannel { stream, request }
    }

    pub(crate) fn deadline_ms(&self) -> u64 {
        self.request.deadline_ms
    }

    pub(crate) fn endpoint(&self) -> &NamedEndpoint {
        &self.request.endpoint
    }

    pub(crate) fn future_cancelled(&self) -> bool {
        self.request.future.is_cancelled()
    }

    /// Check whether the in-progress connect has settled.
    ///
    /// Readiness on a connecting socket means the attempt finished one
    /// way or the other; `take_error` distinguishes them.
    pub(crate) fn check_connected(&mut self) -> Verdict {
        match self.stream.take_error() {
            Ok(Some(err)) => Verdict::Close(CloseReason::Error(err.into())),
            Ok(None) => match self.stream.peer_addr() {
                Ok(_) => Verdict::Promote,
                Err(e) if e.kind() == io::ErrorKind::NotConnected => Verdict::Continue,
                Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Verdict::Continue,
                Err(e) => Verdict::Close(CloseReason::Error(e.into())),
            },
            Err(e) => Verdict::Close(CloseReason::Error(e.into())),
        }
    }

    pub(crate) fn into_parts(self) -> (TcpStream, ConnectRequest) {
        (self.stream, self.request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mxio_core::SessionFuture;

    fn request_for(addr: SocketAddr) -> ConnectRequest {
        ConnectRequest {
            endpoint: NamedEndpoint::new("localhost", addr.port()),
            connect_addr: addr,
            remote: Some(addr),
            local: None,
            deadline_ms: u64::MAX,
            attachment: None,
            future: SessionFuture::new(),
        }
    }

    #[test]
    fn test_open_socket_nonblocking_connect() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let config = ReactorConfig::default();
        let (stream, _connected) = open_socket(&config, addr, None).unwrap();
        let mut channel = ConnectingChannel::new(stream, request_for(addr));

        // Loopback connects settle quickly; poll the channel until the
        // handshake is observable.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            match channel.check_connected() {
                Verdict::Promote => break,
                Verdict::Continue => {
                    assert!(std::time::Instant::now() < deadline, "connect never settled");
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Verdict::Close(_) => panic!("loopback connect failed"),
            }
        }

        let (stream, request) = channel.into_parts();
        assert_eq!(stream.peer_addr().unwrap(), addr);
        assert!(!request.future.is_done());
    }

    #[test]
    fn test_open_socket_applies_local_bind() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let config = ReactorConfig::default();
        let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (stream, _) = open_socket(&config, addr, Some(local)).unwrap();
        assert_eq!(stream.local_addr().unwrap().ip(), local.ip());
    }
}
