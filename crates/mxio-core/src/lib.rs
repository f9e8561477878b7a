//! # mxio-core
//!
//! Core types and contracts for the MXIO non-blocking I/O reactor.
//!
//! This crate is platform-agnostic and contains no socket code. The
//! reactor implementation (pollers, channels, worker loops) lives in
//! `mxio-reactor`; everything here is the vocabulary both sides of the
//! event-handler boundary share.
//!
//! ## Modules
//!
//! - `id` - Session identifier type
//! - `status` - Session and reactor status enums, close modes
//! - `interest` - Readiness interest bitmask
//! - `endpoint` - Named endpoint (scheme/host/port)
//! - `clock` - Monotonic millisecond clock
//! - `error` - Error taxonomy, including SOCKS5 protocol errors
//! - `config` - Immutable reactor configuration snapshot
//! - `future` - One-shot cancelable completion future
//! - `audit` - Bounded timestamped fault trail
//! - `command` - Session command queue entries
//! - `handler` - Session and event-handler contracts
//! - `secure` - Opaque TLS layer seam

pub mod audit;
pub mod clock;
pub mod command;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod future;
pub mod handler;
pub mod id;
pub mod interest;
pub mod secure;
pub mod status;

// Re-exports for convenience
pub use audit::{AuditEntry, AuditLog};
pub use command::{Command, CommandPriority};
pub use config::{FaultPolicy, ReactorConfig, SocksProxyConfig};
pub use endpoint::NamedEndpoint;
pub use error::{ReactorError, ReactorResult, SocksError};
pub use future::IoFuture;
pub use handler::{
    Attachment, EventHandler, EventHandlerFactory, FnHandlerFactory, Session, SessionFuture,
    SessionHandle,
};
pub use id::SessionId;
pub use interest::InterestSet;
pub use secure::{SecureLayer, Transport};
pub use status::{AtomicReactorStatus, AtomicSessionStatus, CloseMode, ReactorStatus, SessionStatus};
