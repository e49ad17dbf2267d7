//! # Error Taxonomy
//!
//! Purpose: Classify every failure a command can end with, so callers can
//! tell a broken connection apart from a bad reply or an impatient caller.
//!
//! ## Design Principles
//! 1. **Classified, Not Stringly**: Each failure mode is its own variant.
//! 2. **Connection Faults Are Explicit**: Only `Connection` implies the
//!    transport was torn down; every other variant leaves it alone.
//! 3. **Diagnosable Timeouts**: A timeout carries the endpoint, the step the
//!    client was in, and the command it was running.
//!
//! ## Propagation Rules
//!
//! - `Protocol`, `CommandFailure`, `Timeout`, `Cancelled`: surfaced as-is.
//! - `Io`: raw transport fault; the engine never returns it from `execute`,
//!   it is always reclassified (cancellation/timeout or `Connection`).
//! - `Connection`: the transport was invalidated and will be re-established
//!   on the next call.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type shared by the respline crates.
pub type RespResult<T> = Result<T, RespError>;

/// Errors surfaced by the respline client.
#[derive(Debug, Error)]
pub enum RespError {
    /// Malformed or unexpected bytes on the wire.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server answered with an error line.
    #[error("command `{command}` failed: {message}")]
    CommandFailure {
        /// Raw error text, without the leading `-`.
        message: String,
        /// Command text that produced the error.
        command: String,
    },

    /// The per-operation timer fired before the command completed.
    #[error("operation timed out after {timeout:?} on {endpoint} while {last_action} (last command: {last_command:?})")]
    Timeout {
        /// Endpoint of the stalled client.
        endpoint: String,
        /// Configured per-operation timeout.
        timeout: Duration,
        /// Step the client was in when the timer fired.
        last_action: &'static str,
        /// Last command admitted by the client, if any.
        last_command: Option<String>,
    },

    /// The caller's own cancellation fired.
    #[error("operation cancelled")]
    Cancelled,

    /// Transport fault; the connection has been torn down.
    #[error("connection to {endpoint} failed: {source}")]
    Connection {
        /// Endpoint the connection was bound to.
        endpoint: String,
        /// Underlying transport fault.
        #[source]
        source: io::Error,
    },

    /// Unclassified transport fault.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RespError {
    /// Builds a protocol error from any displayable message.
    pub fn protocol(message: impl Into<String>) -> Self {
        RespError::Protocol(message.into())
    }

    /// Returns true when this error tore down the connection.
    pub fn is_connection_fault(&self) -> bool {
        matches!(self, RespError::Connection { .. })
    }

    /// Returns true for timer-driven aborts.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RespError::Timeout { .. })
    }

    /// Returns true for caller-driven aborts.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RespError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_variants() {
        assert!(RespError::Cancelled.is_cancelled());
        assert!(!RespError::protocol("bad").is_connection_fault());
        assert!(!RespError::Io(io::Error::other("boom")).is_connection_fault());

        let err = RespError::Connection {
            endpoint: "127.0.0.1:6379".to_string(),
            source: io::Error::from(io::ErrorKind::BrokenPipe),
        };
        assert!(err.is_connection_fault());
        assert!(!err.is_timeout());
    }

    #[test]
    fn command_failure_mentions_command() {
        let err = RespError::CommandFailure {
            message: "ERR unknown command".to_string(),
            command: "FOO".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("FOO"));
        assert!(text.contains("ERR unknown command"));
    }

    #[test]
    fn timeout_mentions_endpoint() {
        let err = RespError::Timeout {
            endpoint: "cache:6379".to_string(),
            timeout: Duration::from_millis(50),
            last_action: "reading reply",
            last_command: Some("PING".to_string()),
        };
        assert!(err.is_timeout());
        assert!(err.to_string().contains("cache:6379"));
    }
}
