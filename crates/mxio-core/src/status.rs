//! Session and reactor status types

use core::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Status of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionStatus {
    /// Connected and able to perform I/O
    Active = 0,

    /// Close requested, terminal notifications not yet delivered
    Closing = 1,

    /// Fully closed, file descriptor released
    Closed = 2,
}

impl SessionStatus {
    /// Check if I/O is still permitted on the session.
    #[inline]
    pub const fn is_open(&self) -> bool {
        matches!(self, SessionStatus::Active)
    }

    /// Check if the session has been closed or is on its way out.
    #[inline]
    pub const fn is_closing_or_closed(&self) -> bool {
        matches!(self, SessionStatus::Closing | SessionStatus::Closed)
    }
}

impl From<u8> for SessionStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => SessionStatus::Active,
            1 => SessionStatus::Closing,
            _ => SessionStatus::Closed,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "ACTIVE"),
            SessionStatus::Closing => write!(f, "CLOSING"),
            SessionStatus::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Lifecycle status of a reactor or one of its workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ReactorStatus {
    /// Constructed, worker thread not yet running
    Inactive = 0,

    /// Event loop running, accepting work
    Active = 1,

    /// Graceful drain in progress; no new work accepted
    ShuttingDown = 2,

    /// Terminal; loop has exited (or been told to exit immediately)
    ShutDown = 3,
}

impl ReactorStatus {
    /// Check if new work items may still be submitted.
    #[inline]
    pub const fn accepts_work(&self) -> bool {
        matches!(self, ReactorStatus::Inactive | ReactorStatus::Active)
    }

    /// Check if the reactor has reached its terminal state.
    #[inline]
    pub const fn is_shut_down(&self) -> bool {
        matches!(self, ReactorStatus::ShutDown)
    }
}

impl From<u8> for ReactorStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => ReactorStatus::Inactive,
            1 => ReactorStatus::Active,
            2 => ReactorStatus::ShuttingDown,
            _ => ReactorStatus::ShutDown,
        }
    }
}

impl fmt::Display for ReactorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReactorStatus::Inactive => write!(f, "INACTIVE"),
            ReactorStatus::Active => write!(f, "ACTIVE"),
            ReactorStatus::ShuttingDown => write!(f, "SHUTTING_DOWN"),
            ReactorStatus::ShutDown => write!(f, "SHUT_DOWN"),
        }
    }
}

/// How to tear a connection down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CloseMode {
    /// Attempt protocol-level clean shutdown (e.g. TLS close-notify)
    /// within the grace period.
    Graceful = 0,

    /// Hard-abort the transport (zero-linger close).
    Immediate = 1,
}

impl From<u8> for CloseMode {
    fn from(v: u8) -> Self {
        match v {
            0 => CloseMode::Graceful,
            _ => CloseMode::Immediate,
        }
    }
}

/// Atomic cell holding a [`SessionStatus`].
///
/// Written by the owning worker; readable from any thread.
#[derive(Debug)]
pub struct AtomicSessionStatus(AtomicU8);

impl AtomicSessionStatus {
    pub const fn new(status: SessionStatus) -> Self {
        AtomicSessionStatus(AtomicU8::new(status as u8))
    }

    #[inline]
    pub fn get(&self) -> SessionStatus {
        self.0.load(Ordering::Acquire).into()
    }

    #[inline]
    pub fn set(&self, status: SessionStatus) {
        self.0.store(status as u8, Ordering::Release);
    }

    /// Transition from `from` to `to`. Returns false if the current value
    /// was not `from`.
    #[inline]
    pub fn transition(&self, from: SessionStatus, to: SessionStatus) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Atomic cell holding a [`ReactorStatus`].
#[derive(Debug)]
pub struct AtomicReactorStatus(AtomicU8);

impl AtomicReactorStatus {
    pub const fn new(status: ReactorStatus) -> Self {
        AtomicReactorStatus(AtomicU8::new(status as u8))
    }

    #[inline]
    pub fn get(&self) -> ReactorStatus {
        self.0.load(Ordering::Acquire).into()
    }

    #[inline]
    pub fn set(&self, status: ReactorStatus) {
        self.0.store(status as u8, Ordering::Release);
    }

    /// Transition from `from` to `to`. Returns false if the current value
    /// was not `from`.
    #[inline]
    pub fn transition(&self, from: ReactorStatus, to: ReactorStatus) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Advance to `to` unless the current status is already past it.
    /// Statuses only ever move forward.
    pub fn advance(&self, to: ReactorStatus) -> bool {
        let mut cur = self.0.load(Ordering::Acquire);
        loop {
            if cur >= to as u8 {
                return false;
            }
            match self.0.compare_exchange_weak(
                cur,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(v) => cur = v,
            }
        }
    }
}
