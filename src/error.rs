//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole acquisition
//! stack. Using the `thiserror` crate, it provides a centralized and consistent way to
//! handle the failures that can occur between the driver callback and the merged dataset.
//!
//! ## Error Hierarchy
//!
//! - **`BufferOverrunFatal`**: the double buffer filled while its twin was still being
//!   persisted. Raised on the real-time path and always aborts the session.
//! - **`PersistenceIo`**: a buffer could not be written to storage.
//! - **`HandshakeNotResponding`** / **`HandshakeFault`** / **`HandshakeBusFault`**: the
//!   external motor controller did not acknowledge or reported a fault.
//! - **`Validation`**: merge-time data problems (non-monotonic timestamps, missing enable
//!   column, wrong edge count).
//! - **`Config`** / **`Configuration`**: parse and semantic configuration errors.
//! - **`Driver`**: errors reported by a hardware collaborator.
//!
//! By using `#[from]`, `DaqError` can be created from the underlying error types,
//! simplifying error handling with the `?` operator.

use thiserror::Error;

// =============================================================================
// Driver Errors
// =============================================================================

/// Category of a failure reported by a hardware collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    Initialization,
    Configuration,
    Communication,
    Shutdown,
    Hardware,
    Timeout,
    Unknown,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Initialization => "initialization",
            DriverErrorKind::Configuration => "configuration",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Shutdown => "shutdown",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

#[derive(Error, Debug, Clone)]
#[error("Driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    pub driver_type: String,
    pub kind: DriverErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }
}

/// Phase of the controller handshake that timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// Waiting for the controller to arm after `prepare` was asserted.
    Prepare,
    /// Waiting for the status lines to return to idle after a stop.
    Stop,
}

impl std::fmt::Display for HandshakePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakePhase::Prepare => write!(f, "prepare"),
            HandshakePhase::Stop => write!(f, "stop"),
        }
    }
}

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for the acquisition stack.
///
/// # Error Categories
///
/// 1. **Real-time path** - `BufferOverrunFatal`
///    - Detected inside the driver callback
///    - Recovery: none, the session is aborted and reported
///
/// 2. **Control plane** - `HandshakeNotResponding`, `HandshakeFault`, `HandshakeBusFault`
///    - The fault variants are retried once after a remote reset by the handshake
///      controller; when they reach the orchestrator they are terminal
///
/// 3. **Data plane** - `PersistenceIo`, `Validation`, `Csv`
///    - Abort the save or the merge and are reported, never guessed around
#[derive(Error, Debug)]
pub enum DaqError {
    /// Both halves of a double buffer were owned by the persistence worker when the
    /// active half filled up again.
    #[error("Buffer overrun in task '{task}': persistence is slower than acquisition")]
    BufferOverrunFatal { task: String },

    /// Writing a buffer to storage failed.
    #[error("Persistence I/O error in task '{task}': {source}")]
    PersistenceIo {
        task: String,
        #[source]
        source: std::io::Error,
    },

    /// The remote controller did not answer within the polling bound.
    #[error("Remote controller is not responding ({phase} phase)")]
    HandshakeNotResponding { phase: HandshakePhase },

    /// The remote controller reported a recoverable fault twice in a row.
    #[error("Remote controller fault: check disk space or the runtime license")]
    HandshakeFault,

    /// The remote controller reported a fieldbus fault twice in a row.
    #[error("Remote controller bus fault: the motor drive is not responding")]
    HandshakeBusFault,

    /// Merge-time validation failed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration file parsing failed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// A previous failure is latched and must be cleared before a new start.
    #[error("Session is latched after an error: {0}")]
    SessionLatched(String),

    /// Error reported by the remote controller's file transfer or reset channel.
    #[error("Remote controller error: {0}")]
    Remote(String),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DaqError {
    /// Whether this error latches the session until explicitly cleared.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DaqError::Validation(_) | DaqError::SessionLatched(_))
    }

    /// Wrap an I/O failure of a persistence worker.
    pub fn persistence(task: impl Into<String>, source: std::io::Error) -> Self {
        DaqError::PersistenceIo {
            task: task.into(),
            source,
        }
    }
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrun_message_names_task() {
        let err = DaqError::BufferOverrunFatal {
            task: "analog".into(),
        };
        assert!(err.to_string().contains("analog"));
        assert!(err.is_terminal());
    }

    #[test]
    fn validation_is_not_terminal() {
        assert!(!DaqError::Validation("two rising edges".into()).is_terminal());
    }

    #[test]
    fn driver_error_display() {
        let err: DaqError =
            DriverError::new("mock", DriverErrorKind::Hardware, "line stuck").into();
        assert_eq!(
            err.to_string(),
            "Driver 'mock' hardware error: line stuck"
        );
    }

    #[test]
    fn handshake_timeout_mentions_phase() {
        let err = DaqError::HandshakeNotResponding {
            phase: HandshakePhase::Stop,
        };
        assert!(err.to_string().contains("stop"));
    }
}
