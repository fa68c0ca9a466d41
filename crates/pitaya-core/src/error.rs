//! Error types shared by every pitaya crate.
//!
//! `PitayaError` follows the failure taxonomy of the coordination layer:
//!
//! - **Initialization** (`InitializationFailed`): the backend could not be brought
//!   up after the configured retries. Fatal for that connection and surfaced to
//!   whoever asked for it.
//! - **Command** (`CommandFailed`): one operation failed inside the worker. It is
//!   returned as data in an `error` response and never affects other commands.
//! - **Transport timeout** (`Timeout`): no response arrived within the caller's
//!   deadline. Kept distinct from command failures so callers can retry.
//! - **Liveness** (`NotRunning`): the worker is gone. Reported immediately rather
//!   than after a timeout.
//!
//! The remaining variants describe invalid input (unknown modules, out-of-range
//! values), configuration problems and protocol/serialization failures.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using [`PitayaError`].
pub type PitayaResult<T> = std::result::Result<T, PitayaError>;

/// Primary error type for the coordination layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PitayaError {
    /// Backend could not be initialized after all retry attempts.
    #[error("Failed to initialize backend for '{address}' after {attempts} attempt(s): {reason}")]
    InitializationFailed {
        /// Device address that was being opened
        address: String,
        /// Number of attempts made
        attempts: u32,
        /// Last failure reason
        reason: String,
    },

    /// A single command failed inside the worker.
    #[error("Command '{command}' failed: {reason}")]
    CommandFailed {
        /// Command name
        command: String,
        /// Human-readable reason reported by the worker
        reason: String,
    },

    /// No response within the caller-supplied deadline.
    #[error("Command '{command}' timed out after {timeout:?}")]
    Timeout {
        /// Command name
        command: String,
        /// Deadline that expired
        timeout: Duration,
    },

    /// The worker is not running (never started, exited or crashed).
    #[error("Worker is not running: {0}")]
    NotRunning(String),

    /// Backend-level I/O or device failure.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Module name does not exist on the instrument.
    #[error("Unknown module '{0}'")]
    UnknownModule(String),

    /// Command name is not part of the vocabulary.
    #[error("Unknown command '{0}'")]
    UnknownCommand(String),

    /// Signal name cannot be routed or sampled.
    #[error("Unknown signal '{0}'")]
    UnknownSignal(String),

    /// Register is not available on the given module.
    #[error("Register '{register}' is not available on module '{module}'")]
    InvalidRegister {
        /// Module the register was requested on
        module: String,
        /// Register name
        register: String,
    },

    /// A parameter is missing, malformed or out of range.
    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter {
        /// Parameter name
        name: String,
        /// Why the value was rejected
        reason: String,
    },

    /// Operation exists only on another backend kind (e.g. simulator-only).
    #[error("Operation '{operation}' is not supported by the {backend} backend")]
    Unsupported {
        /// Operation name
        operation: String,
        /// Backend kind label
        backend: String,
    },

    /// Configuration is missing or semantically invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Malformed message on the worker channel.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl PitayaError {
    /// Shorthand for [`PitayaError::InvalidParameter`].
    pub fn invalid_parameter(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for [`PitayaError::CommandFailed`].
    pub fn command_failed(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same request could succeed.
    ///
    /// Timeouts are transient; a dead worker or a rejected command is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Backend(_))
    }
}

impl From<serde_json::Error> for PitayaError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<std::io::Error> for PitayaError {
    fn from(err: std::io::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<figment::Error> for PitayaError {
    fn from(err: figment::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_are_human_readable() {
        let err = PitayaError::Timeout {
            command: "scope_acquire".into(),
            timeout: Duration::from_millis(250),
        };
        assert_eq!(
            err.to_string(),
            "Command 'scope_acquire' timed out after 250ms"
        );

        let err = PitayaError::InitializationFailed {
            address: "rp-f0a1.local".into(),
            attempts: 3,
            reason: "connection refused".into(),
        };
        assert!(err.to_string().contains("after 3 attempt(s)"));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(PitayaError::Timeout {
            command: "ping".into(),
            timeout: Duration::from_secs(1),
        }
        .is_transient());
        assert!(!PitayaError::NotRunning("exited".into()).is_transient());
        assert!(!PitayaError::command_failed("pid_configure", "bad gain").is_transient());
    }

    #[test]
    fn test_serde_error_maps_to_protocol() {
        let err: PitayaError = serde_json::from_str::<u32>("\"nope\"").unwrap_err().into();
        assert!(matches!(err, PitayaError::Protocol(_)));
    }
}
