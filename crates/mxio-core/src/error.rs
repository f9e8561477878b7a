//! Error taxonomy for the reactor
//!
//! Callers seeing a failed future get a specific, typed cause so they can
//! distinguish host-resolution failure, connect timeout, proxy negotiation
//! failure and plain I/O failure. Errors local to one session never unwind
//! into the owning worker's loop.

use std::io;

use thiserror::Error;

use crate::endpoint::NamedEndpoint;

/// Result type for reactor operations.
pub type ReactorResult<T> = Result<T, ReactorError>;

/// Errors surfaced through futures, handler callbacks and the audit trail.
#[derive(Debug, Error)]
pub enum ReactorError {
    /// Transport-level I/O failure local to one session.
    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),

    /// Host name (or explicit local address) could not be resolved.
    /// Raised before any socket is opened.
    #[error("address could not be resolved: {0}")]
    UnresolvedAddress(String),

    /// Non-blocking connect (including proxy negotiation) did not finish
    /// within the configured connect timeout.
    #[error("connect to {0} timed out")]
    ConnectTimeout(NamedEndpoint),

    /// Session idle past its socket timeout.
    #[error("socket idle timeout expired")]
    SocketTimeout,

    /// SOCKS5 proxy negotiation failed. Non-retryable.
    #[error("SOCKS negotiation failed: {0}")]
    Socks(#[from] SocksError),

    /// The reactor (or the selected worker) no longer accepts work.
    /// Always synchronous and immediate, never queued.
    #[error("reactor has been shut down")]
    ShutDown,

    /// A pending operation was cancelled by its requester.
    #[error("operation cancelled")]
    Cancelled,

    /// An event handler returned an error or panicked during dispatch.
    #[error("event handler fault: {0}")]
    HandlerFault(String),
}

impl ReactorError {
    /// Check whether this error means "the reactor is gone", as opposed to
    /// a failure local to one connection.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, ReactorError::ShutDown)
    }
}

/// SOCKS5 (RFC 1928 / RFC 1929) client-side protocol violations.
///
/// Every variant is fatal to the connection attempt; there is no retry
/// for protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SocksError {
    #[error("unexpected SOCKS version: expected {expected:#04x}, got {got:#04x}")]
    InvalidVersion { expected: u8, got: u8 },

    #[error("proxy accepted none of the offered authentication methods")]
    NoAcceptableMethods,

    #[error("proxy selected an unsupported authentication method: {method:#04x}")]
    UnsupportedAuthMethod { method: u8 },

    #[error("username/password authentication rejected by proxy: status {status:#04x}")]
    AuthRejected { status: u8 },

    #[error("{field} too long for SOCKS5: {len} bytes (max 255)")]
    FieldTooLong { field: &'static str, len: usize },

    #[error("proxy refused connect request: {}", reply_message(*.code))]
    ConnectRejected { code: u8 },

    #[error("unsupported address type in proxy reply: {atype:#04x}")]
    UnsupportedAddressType { atype: u8 },

    #[error("proxy closed the connection mid-negotiation")]
    UnexpectedEof,
}

/// Map an RFC 1928 reply code to its defined meaning.
pub fn reply_message(code: u8) -> &'static str {
    match code {
        0x00 => "succeeded",
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unassigned reply code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = ReactorError::ShutDown;
        assert_eq!(format!("{}", e), "reactor has been shut down");

        let e = ReactorError::ConnectTimeout(NamedEndpoint::new("example.org", 80));
        assert_eq!(format!("{}", e), "connect to tcp://example.org:80 timed out");
    }

    #[test]
    fn test_socks_error_display() {
        let e = SocksError::ConnectRejected { code: 0x05 };
        assert_eq!(
            format!("{}", e),
            "proxy refused connect request: connection refused"
        );

        let e = SocksError::InvalidVersion {
            expected: 0x05,
            got: 0x04,
        };
        assert_eq!(
            format!("{}", e),
            "unexpected SOCKS version: expected 0x05, got 0x04"
        );
    }

    #[test]
    fn test_socks_error_converts() {
        let e: ReactorError = SocksError::NoAcceptableMethods.into();
        assert!(matches!(e, ReactorError::Socks(_)));
        assert!(!e.is_shutdown());
    }

    #[test]
    fn test_reply_message_mapping() {
        assert_eq!(reply_message(0x00), "succeeded");
        assert_eq!(reply_message(0x08), "address type not supported");
        assert_eq!(reply_message(0xff), "unassigned reply code");
    }
}
