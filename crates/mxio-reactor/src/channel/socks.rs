//! SOCKS5 negotiation channel
//!
//! Client side of RFC 1928 with optional RFC 1929 username/password
//! sub-negotiation, driven entirely by readiness events:
//!
//! ```text
//!  SendAuth ─► ReceiveAuthMethod ─► [SendUserPass ─► ReceiveAuthReply]
//!      ─► SendConnect ─► ReceiveResponseCode ─► ReceiveAddressType
//!      ─► ReceiveAddress ─► Complete
//! ```
//!
//! One buffer is reused across phases, growing only when a phase needs
//! more room (domain names run up to 255 bytes). Any protocol violation
//! fails the attempt immediately; there is no retry.

use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr};

use mio::net::TcpStream;
use mio::Interest;

use mxio_core::{ReactorError, SocksError, SocksProxyConfig};

use crate::poller::Poller;

use super::{CloseReason, ConnectRequest, Verdict};

const VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const INITIAL_BUF: usize = 32;

/// What goes into the SOCKS connect request: a resolved address, or a
/// name the proxy resolves itself.
enum SocksTarget {
    Ip(SocketAddr),
    Domain(String, u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocksPhase {
    SendAuth,
    ReceiveAuthMethod,
    SendUserPass,
    ReceiveAuthReply,
    SendConnect,
    ReceiveResponseCode,
    ReceiveAddressType,
    ReceiveAddress,
    Complete,
}

impl SocksPhase {
    fn is_send(self) -> bool {
        matches!(
            self,
            SocksPhase::SendAuth | SocksPhase::SendUserPass | SocksPhase::SendConnect
        )
    }
}

/// Channel negotiating one connection through a SOCKS5 proxy.
pub(crate) struct SocksChannel {
    stream: TcpStream,
    request: ConnectRequest,
    username: Option<String>,
    password: Option<String>,
    target: SocksTarget,
    phase: SocksPhase,
    buf: Vec<u8>,
    /// Send phases: next byte to flush. Receive phases: bytes filled.
    pos: usize,
    /// Send phases: bytes staged. Receive phases: bytes needed.
    lim: usize,
    reply_atyp: u8,
    addr_len_known: bool,
}

impl SocksChannel {
    /// Build the negotiating channel. Fails without touching the wire if
    /// the credentials or target cannot be expressed in SOCKS5.
    pub(crate) fn new(
        stream: TcpStream,
        request: ConnectRequest,
        proxy: &SocksProxyConfig,
    ) -> Result<Self, (TcpStream, ConnectRequest, ReactorError)> {
        let target = match request.remote {
            Some(addr) => SocksTarget::Ip(addr),
            None => match request.endpoint.host.parse::<IpAddr>() {
                Ok(ip) => SocksTarget::Ip(SocketAddr::new(ip, request.endpoint.port)),
                Err(_) => {
                    if request.endpoint.host.len() > 255 {
                        let err = SocksError::FieldTooLong {
                            field: "domain name",
                            len: request.endpoint.host.len(),
                        };
                        return Err((stream, request, err.into()));
                    }
                    SocksTarget::Domain(request.endpoint.host.clone(), request.endpoint.port)
                }
            },
        };
        for (field, value) in [
            ("username", proxy.username.as_deref()),
            ("password", proxy.password.as_deref()),
        ] {
            if let Some(value) = value {
                if value.len() > 255 {
                    let err = SocksError::FieldTooLong {
                        field,
                        len: value.len(),
                    };
                    return Err((stream, request, err.into()));
                }
            }
        }

        let mut channel = SocksChannel {
            stream,
            request,
            username: proxy.username.clone(),
            password: proxy.password.clone(),
            target,
            phase: SocksPhase::SendAuth,
            buf: Vec::with_capacity(INITIAL_BUF),
            pos: 0,
            lim: 0,
            reply_atyp: 0,
            addr_len_known: false,
        };
        channel.stage_auth();
        Ok(channel)
    }

    pub(crate) fn deadline_ms(&self) -> u64 {
        self.request.deadline_ms
    }

    pub(crate) fn endpoint(&self) -> &mxio_core::NamedEndpoint {
        &self.request.endpoint
    }

    pub(crate) fn future_cancelled(&self) -> bool {
        self.request.future.is_cancelled()
    }

    pub(crate) fn into_parts(self) -> (TcpStream, ConnectRequest) {
        (self.stream, self.request)
    }

    /// Re-register poller interest for the current phase.
    pub(crate) fn sync_interest(&mut self, poller: &Poller, key: usize) -> io::Result<()> {
        let interest = if self.phase.is_send() {
            Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        poller.reregister(&mut self.stream, key, interest)
    }

    pub(crate) fn on_event(&mut self, readable: bool, writable: bool) -> Verdict {
        if writable {
            match self.on_writable() {
                Verdict::Continue => {}
                other => return other,
            }
        }
        if readable {
            return self.on_readable();
        }
        Verdict::Continue
    }

    // ── Send phases ──────────────────────────────────────────────────

    fn on_writable(&mut self) -> Verdict {
        if !self.phase.is_send() {
            return Verdict::Continue;
        }
        while self.pos < self.lim {
            match self.stream.write(&self.buf[self.pos..self.lim]) {
                Ok(0) => {
                    return Verdict::Close(CloseReason::Error(SocksError::UnexpectedEof.into()))
                }
                Ok(n) => self.pos += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Verdict::Continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Verdict::Close(CloseReason::Error(e.into())),
            }
        }
        // Flushed; turn around and await the proxy's answer.
        self.phase = match self.phase {
            SocksPhase::SendAuth => SocksPhase::ReceiveAuthMethod,
            SocksPhase::SendUserPass => SocksPhase::ReceiveAuthReply,
            _ => SocksPhase::ReceiveResponseCode,
        };
        self.await_bytes(2);
        Verdict::Continue
    }

    // ── Receive phases ───────────────────────────────────────────────

    fn on_readable(&mut self) -> Verdict {
        if self.phase.is_send() || self.phase == SocksPhase::Complete {
            return Verdict::Continue;
        }
        loop {
            // Read exactly what the current step needs; bytes for later
            // steps stay in the socket buffer.
            while self.pos < self.lim {
                match self.stream.read(&mut self.buf[self.pos..self.lim]) {
                    Ok(0) => {
                        return Verdict::Close(CloseReason::Error(
                            SocksError::UnexpectedEof.into(),
                        ))
                    }
                    Ok(n) => self.pos += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Verdict::Continue,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Verdict::Close(CloseReason::Error(e.into())),
                }
            }

            match self.step() {
                Ok(Some(verdict)) => return verdict,
                Ok(None) => continue,
                Err(err) => return Verdict::Close(CloseReason::Error(err.into())),
            }
        }
    }

    /// Interpret one fully-read step. `Ok(None)` means another read step
    /// follows immediately.
    fn step(&mut self) -> Result<Option<Verdict>, SocksError> {
        match self.phase {
            SocksPhase::ReceiveAuthMethod => {
                let (version, method) = (self.buf[0], self.buf[1]);
                if version != VERSION {
                    return Err(SocksError::InvalidVersion {
                        expected: VERSION,
                        got: version,
                    });
                }
                match method {
                    METHOD_NO_AUTH => {
                        self.phase = SocksPhase::SendConnect;
                        self.stage_connect();
                        Ok(Some(Verdict::Continue))
                    }
                    METHOD_USER_PASS
                        if self.username.is_some() && self.password.is_some() =>
                    {
                        self.phase = SocksPhase::SendUserPass;
                        self.stage_user_pass();
                        Ok(Some(Verdict::Continue))
                    }
                    METHOD_NONE_ACCEPTABLE => Err(SocksError::NoAcceptableMethods),
                    other => Err(SocksError::UnsupportedAuthMethod { method: other }),
                }
            }
            SocksPhase::ReceiveAuthReply => {
                let (version, status) = (self.buf[0], self.buf[1]);
                if version != AUTH_VERSION {
                    return Err(SocksError::InvalidVersion {
                        expected: AUTH_VERSION,
                        got: version,
                    });
                }
                if status != 0x00 {
                    return Err(SocksError::AuthRejected { status });
                }
                self.phase = SocksPhase::SendConnect;
                self.stage_connect();
                Ok(Some(Verdict::Continue))
            }
            SocksPhase::ReceiveResponseCode => {
                let (version, code) = (self.buf[0], self.buf[1]);
                if version != VERSION {
                    return Err(SocksError::InvalidVersion {
                        expected: VERSION,
                        got: version,
                    });
                }
                if code != 0x00 {
                    return Err(SocksError::ConnectRejected { code });
                }
                self.phase = SocksPhase::ReceiveAddressType;
                self.await_bytes(2); // reserved byte + address type
                Ok(None)
            }
            SocksPhase::ReceiveAddressType => {
                self.reply_atyp = self.buf[1];
                self.phase = SocksPhase::ReceiveAddress;
                match self.reply_atyp {
                    ATYP_IPV4 => self.await_bytes(4 + 2),
                    ATYP_IPV6 => self.await_bytes(16 + 2),
                    ATYP_DOMAIN => {
                        self.addr_len_known = false;
                        self.await_bytes(1);
                    }
                    other => return Err(SocksError::UnsupportedAddressType { atype: other }),
                }
                Ok(None)
            }
            SocksPhase::ReceiveAddress => {
                if self.reply_atyp == ATYP_DOMAIN && !self.addr_len_known {
                    let len = self.buf[0] as usize;
                    self.addr_len_known = true;
                    self.await_bytes(len + 2);
                    return Ok(None);
                }
                // Bound address and port consumed; the tunnel is up.
                self.phase = SocksPhase::Complete;
                Ok(Some(Verdict::Promote))
            }
            _ => Ok(Some(Verdict::Continue)),
        }
    }

    // ── Buffer staging ───────────────────────────────────────────────

    fn stage_auth(&mut self) {
        self.buf.clear();
        self.buf.push(VERSION);
        if self.username.is_some() && self.password.is_some() {
            self.buf.push(2);
            self.buf.push(METHOD_NO_AUTH);
            self.buf.push(METHOD_USER_PASS);
        } else {
            self.buf.push(1);
            self.buf.push(METHOD_NO_AUTH);
        }
        self.pos = 0;
        self.lim = self.buf.len();
    }

    fn stage_user_pass(&mut self) {
        let username = self.username.clone().unwrap_or_default();
        let password = self.password.clone().unwrap_or_default();
        self.buf.clear();
        self.buf.push(AUTH_VERSION);
        self.buf.push(username.len() as u8);
        self.buf.extend_from_slice(username.as_bytes());
        self.buf.push(password.len() as u8);
        self.buf.extend_from_slice(password.as_bytes());
        self.pos = 0;
        self.lim = self.buf.len();
    }

    fn stage_connect(&mut self) {
        self.buf.clear();
        self.buf.push(VERSION);
        self.buf.push(CMD_CONNECT);
        self.buf.push(0x00); // reserved
        let port = match &self.target {
            SocksTarget::Ip(addr) => {
                match addr.ip() {
                    IpAddr::V4(ip) => {
                        self.buf.push(ATYP_IPV4);
                        self.buf.extend_from_slice(&ip.octets());
                    }
                    IpAddr::V6(ip) => {
                        self.buf.push(ATYP_IPV6);
                        self.buf.extend_from_slice(&ip.octets());
                    }
                }
                addr.port()
            }
            SocksTarget::Domain(host, port) => {
                self.buf.push(ATYP_DOMAIN);
                self.buf.push(host.len() as u8);
                self.buf.extend_from_slice(host.as_bytes());
                *port
            }
        };
        self.buf.extend_from_slice(&port.to_be_bytes());
        self.pos = 0;
        self.lim = self.buf.len();
    }

    /// Arrange to read exactly `need` bytes next, growing the buffer
    /// only when it is too small.
    fn await_bytes(&mut self, need: usize) {
        if self.buf.len() < need {
            self.buf.resize(need, 0);
        }
        self.pos = 0;
        self.lim = need;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mxio_core::{NamedEndpoint, SessionFuture};
    use std::io::{Read as _, Write as _};
    use std::time::{Duration, Instant};

    fn connected_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();
        let (server, _) = listener.accept().unwrap();
        (TcpStream::from_std(client), server)
    }

    fn request_for(target: &str, port: u16) -> ConnectRequest {
        ConnectRequest {
            endpoint: NamedEndpoint::new(target, port),
            connect_addr: "127.0.0.1:1080".parse().unwrap(),
            remote: None,
            local: None,
            deadline_ms: u64::MAX,
            attachment: None,
            future: SessionFuture::new(),
        }
    }

    /// Drive the channel until it leaves `Continue`, with a test deadline.
    fn drive(channel: &mut SocksChannel) -> Verdict {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match channel.on_event(true, true) {
                Verdict::Continue => {
                    assert!(Instant::now() < deadline, "negotiation stalled");
                    std::thread::sleep(Duration::from_millis(2));
                }
                other => return other,
            }
        }
    }

    #[test]
    fn test_no_auth_negotiation_round_trip() {
        let (stream, mut proxy) = connected_pair();
        let config = SocksProxyConfig::new("127.0.0.1:1080".parse().unwrap());
        let mut channel =
            SocksChannel::new(stream, request_for("example.org", 80), &config).unwrap_or_else(
                |_| panic!("channel construction failed"),
            );

        let mock = std::thread::spawn(move || {
            let mut greeting = [0u8; 3];
            proxy.read_exact(&mut greeting).unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            proxy.write_all(&[0x05, 0x00]).unwrap();

            let mut head = [0u8; 5];
            proxy.read_exact(&mut head).unwrap();
            assert_eq!(&head[..4], &[0x05, 0x01, 0x00, 0x03]);
            let len = head[4] as usize;
            let mut rest = vec![0u8; len + 2];
            proxy.read_exact(&mut rest).unwrap();
            assert_eq!(&rest[..len], b"example.org");
            assert_eq!(&rest[len..], &80u16.to_be_bytes());

            proxy
                .write_all(&[0x05, 0x00, 0x00, 0x01, 10, 0, 0, 1, 0x1f, 0x90])
                .unwrap();
        });

        assert!(matches!(drive(&mut channel), Verdict::Promote));
        mock.join().unwrap();

        let (_stream, request) = channel.into_parts();
        assert!(!request.future.is_done());
    }

    #[test]
    fn test_username_password_negotiation() {
        let (stream, mut proxy) = connected_pair();
        let config = SocksProxyConfig::with_credentials(
            "127.0.0.1:1080".parse().unwrap(),
            "u",
            "p",
        );
        let mut channel = SocksChannel::new(stream, request_for("10.0.0.9", 443), &config)
            .unwrap_or_else(|_| panic!("channel construction failed"));

        let mock = std::thread::spawn(move || {
            let mut greeting = [0u8; 4];
            proxy.read_exact(&mut greeting).unwrap();
            assert_eq!(greeting, [0x05, 0x02, 0x00, 0x02]);
            // Pick username/password.
            proxy.write_all(&[0x05, 0x02]).unwrap();

            let mut auth = [0u8; 5];
            proxy.read_exact(&mut auth).unwrap();
            assert_eq!(auth, [0x01, 0x01, b'u', 0x01, b'p']);
            proxy.write_all(&[0x01, 0x00]).unwrap();

            let mut connect = [0u8; 10];
            proxy.read_exact(&mut connect).unwrap();
            assert_eq!(
                connect,
                [0x05, 0x01, 0x00, 0x01, 10, 0, 0, 9, 0x01, 0xbb]
            );
            proxy
                .write_all(&[0x05, 0x00, 0x00, 0x01, 10, 0, 0, 9, 0x01, 0xbb])
                .unwrap();
        });

        assert!(matches!(drive(&mut channel), Verdict::Promote));
        mock.join().unwrap();
    }

    #[test]
    fn test_connect_rejected_maps_reply_code() {
        let (stream, mut proxy) = connected_pair();
        let config = SocksProxyConfig::new("127.0.0.1:1080".parse().unwrap());
        let mut channel = SocksChannel::new(stream, request_for("10.0.0.9", 80), &config)
            .unwrap_or_else(|_| panic!("channel construction failed"));

        let mock = std::thread::spawn(move || {
            let mut greeting = [0u8; 3];
            proxy.read_exact(&mut greeting).unwrap();
            proxy.write_all(&[0x05, 0x00]).unwrap();

            let mut connect = [0u8; 10];
            proxy.read_exact(&mut connect).unwrap();
            // Connection refused.
            proxy
                .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .unwrap();
        });

        match drive(&mut channel) {
            Verdict::Close(CloseReason::Error(ReactorError::Socks(
                SocksError::ConnectRejected { code },
            ))) => assert_eq!(code, 0x05),
            _ => panic!("expected connect-rejected failure"),
        }
        mock.join().unwrap();
    }

    #[test]
    fn test_bad_version_fails_fast() {
        let (stream, mut proxy) = connected_pair();
        let config = SocksProxyConfig::new("127.0.0.1:1080".parse().unwrap());
        let mut channel = SocksChannel::new(stream, request_for("10.0.0.9", 80), &config)
            .unwrap_or_else(|_| panic!("channel construction failed"));

        let mock = std::thread::spawn(move || {
            let mut greeting = [0u8; 3];
            proxy.read_exact(&mut greeting).unwrap();
            // SOCKS4 version byte.
            proxy.write_all(&[0x04, 0x00]).unwrap();
        });

        match drive(&mut channel) {
            Verdict::Close(CloseReason::Error(ReactorError::Socks(
                SocksError::InvalidVersion { expected, got },
            ))) => {
                assert_eq!(expected, 0x05);
                assert_eq!(got, 0x04);
            }
            _ => panic!("expected version violation"),
        }
        mock.join().unwrap();
    }

    #[test]
    fn test_ipv6_connect_request_encoding() {
        let (stream, mut proxy) = connected_pair();
        let config = SocksProxyConfig::new("127.0.0.1:1080".parse().unwrap());
        let mut request = request_for("ignored", 8080);
        request.remote = Some("[2001:db8::1]:8080".parse().unwrap());
        let mut channel = SocksChannel::new(stream, request, &config)
            .unwrap_or_else(|_| panic!("channel construction failed"));

        let mock = std::thread::spawn(move || {
            let mut greeting = [0u8; 3];
            proxy.read_exact(&mut greeting).unwrap();
            proxy.write_all(&[0x05, 0x00]).unwrap();

            let mut connect = [0u8; 4 + 16 + 2];
            proxy.read_exact(&mut connect).unwrap();
            assert_eq!(&connect[..4], &[0x05, 0x01, 0x00, 0x04]);
            let expected: std::net::Ipv6Addr = "2001:db8::1".parse().unwrap();
            assert_eq!(&connect[4..20], &expected.octets());
            assert_eq!(&connect[20..], &8080u16.to_be_bytes());
            proxy
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .unwrap();
        });

        assert!(matches!(drive(&mut channel), Verdict::Promote));
        mock.join().unwrap();
    }
}
