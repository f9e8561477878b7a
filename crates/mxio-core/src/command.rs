//! Session command queue entries

use std::any::Any;

use crate::status::CloseMode;

/// Where a command lands in the session's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandPriority {
    /// Appended to the tail; executed in submission order.
    Normal,
    /// Inserted at the head, ahead of everything queued so far.
    Immediate,
}

/// A unit of work enqueued on a session.
///
/// `Shutdown` commands are interpreted by the reactor's data channel
/// itself; `App` commands are opaque to the reactor and are consumed by
/// the event handler via `Session::poll_command`.
pub enum Command {
    /// Close the session, gracefully or immediately.
    Shutdown(CloseMode),
    /// Application-defined command, delivered to the event handler.
    App(Box<dyn Any + Send>),
}

impl Command {
    /// Convenience constructor for application commands.
    pub fn app(payload: impl Any + Send) -> Self {
        Command::App(Box::new(payload))
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, Command::Shutdown(_))
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Shutdown(mode) => write!(f, "Command::Shutdown({:?})", mode),
            Command::App(_) => write!(f, "Command::App(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_kinds() {
        assert!(Command::Shutdown(CloseMode::Graceful).is_shutdown());
        assert!(!Command::app(42u32).is_shutdown());
    }

    #[test]
    fn test_app_payload_downcast() {
        let cmd = Command::app("ping".to_string());
        match cmd {
            Command::App(payload) => {
                let s = payload.downcast::<String>().unwrap();
                assert_eq!(*s, "ping");
            }
            _ => panic!("expected app command"),
        }
    }
}
