//! Error types and handling for vaultshift
//!
//! Every failure the engine can observe is mapped onto one [`Error`] variant, and
//! every variant belongs to exactly one [`ErrorKind`]. The kind decides what the
//! engine does next: transient errors are retried, authentication errors are
//! routed to the credential coordinator, permanent errors fail a single task and
//! fatal errors abort the run before any worker starts.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Error severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Low severity - operation can continue
    Low,
    /// Medium severity - operation should be retried
    Medium,
    /// High severity - the affected task should be abandoned
    High,
    /// Critical severity - the whole run must stop
    Critical,
}

/// Main error type for vaultshift operations
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Throttling, timeouts and temporary service unavailability
    #[error("Transient service error: {message}")]
    Transient {
        /// Error message reported by the service
        message: String,
    },

    /// Expired or invalid credentials
    #[error("Authentication error: {message}")]
    Auth {
        /// Error message reported by the service
        message: String,
    },

    /// Validation failures, missing resources and unsupported resource types
    #[error("Permanent service error: {message}")]
    Permanent {
        /// Error message reported by the service
        message: String,
    },

    /// I/O operation failed
    #[error("I/O error: {message}")]
    Io {
        /// Error message from the I/O operation
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message describing the configuration issue
        message: String,
    },

    /// The persisted state file could not be parsed
    #[error("State file {path} is corrupt: {message}")]
    StateCorrupt {
        /// Path of the offending state file
        path: PathBuf,
        /// Parser message
        message: String,
    },

    /// The persisted state file was written by an incompatible version
    #[error("State schema version {found} is not supported (expected {expected})")]
    SchemaMismatch {
        /// Version found in the file
        found: u32,
        /// Version this build reads and writes
        expected: u32,
    },

    /// A task was asked to move along an edge its state machine does not have
    #[error("Invalid transition for {item}: {from} -> {to}")]
    InvalidTransition {
        /// Identity of the task's item
        item: String,
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// Operation cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Operation timed out
    #[error("Operation timed out after {seconds} seconds")]
    Timeout {
        /// Number of seconds after which the operation timed out
        seconds: u64,
    },

    /// Generic error with custom message
    #[error("{message}")]
    Other {
        /// Custom error message
        message: String,
    },
}

/// Error kind for categorizing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retry with backoff
    Transient,
    /// Credential problems
    Auth,
    /// Fails the current task only
    Permanent,
    /// Local I/O errors
    Io,
    /// Configuration errors
    Config,
    /// Unreadable or incompatible state file
    State,
    /// Invalid task state transition
    Transition,
    /// Cancellation
    Cancelled,
    /// Timeout
    Timeout,
    /// Other errors
    Other,
}

/// Service error codes that indicate a temporary condition.
const TRANSIENT_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "TooManyRequestsException",
    "RequestLimitExceeded",
    "ServiceUnavailable",
    "ServiceUnavailableException",
    "InternalError",
    "InternalFailure",
    "RequestTimeout",
    "RequestTimeoutException",
];

/// Service error codes that indicate stale or invalid credentials.
const AUTH_CODES: &[&str] = &[
    "ExpiredToken",
    "ExpiredTokenException",
    "InvalidClientTokenId",
    "UnrecognizedClientException",
    "InvalidSignatureException",
];

impl Error {
    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient { .. } => ErrorKind::Transient,
            Self::Auth { .. } => ErrorKind::Auth,
            Self::Permanent { .. } => ErrorKind::Permanent,
            Self::Io { .. } => ErrorKind::Io,
            Self::Config { .. } => ErrorKind::Config,
            Self::StateCorrupt { .. } | Self::SchemaMismatch { .. } => ErrorKind::State,
            Self::InvalidTransition { .. } => ErrorKind::Transition,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Other { .. } => ErrorKind::Other,
        }
    }

    /// Get the error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Transient { .. } | Self::Timeout { .. } => ErrorSeverity::Medium,
            Self::Auth { .. } => ErrorSeverity::Medium,
            Self::Permanent { .. } | Self::Other { .. } => ErrorSeverity::High,
            Self::Io { .. } => ErrorSeverity::High,
            Self::InvalidTransition { .. } => ErrorSeverity::High,
            Self::Config { .. } | Self::StateCorrupt { .. } | Self::SchemaMismatch { .. } => {
                ErrorSeverity::Critical
            }
            Self::Cancelled => ErrorSeverity::Low,
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::Timeout { .. } | Self::Auth { .. }
        )
    }

    /// Check if this error should be retried by the worker that observed it.
    ///
    /// Authentication errors are recoverable but are never retried in place;
    /// they go through the credential coordinator instead.
    pub fn should_retry(&self) -> bool {
        self.is_recoverable() && !self.is_auth()
    }

    /// Check if this is an authentication-class error
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }

    /// Check if this error must abort the run before any worker starts
    pub fn is_fatal(&self) -> bool {
        self.severity() == ErrorSeverity::Critical
    }

    /// Map a remote service error code onto the error taxonomy.
    ///
    /// Unknown codes are treated as permanent.
    pub fn from_service_code(code: &str, message: impl Into<String>) -> Self {
        let message = format!("{}: {}", code, message.into());
        if TRANSIENT_CODES.contains(&code) {
            Self::Transient { message }
        } else if AUTH_CODES.contains(&code) {
            Self::Auth { message }
        } else {
            Self::Permanent { message }
        }
    }

    /// Create a new transient error
    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Create a new authentication error
    pub fn auth<S: Into<String>>(message: S) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Create a new permanent error
    pub fn permanent<S: Into<String>>(message: S) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new state-corruption error
    pub fn state_corrupt<P: Into<PathBuf>, S: Into<String>>(path: P, message: S) -> Self {
        Self::StateCorrupt {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::Other {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::Io {
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    proptest! {
        #[test]
        fn test_unknown_codes_are_permanent(code in "[a-z]{1,12}", message in ".*") {
            let error = Error::from_service_code(&code, message);
            prop_assert_eq!(error.kind(), ErrorKind::Permanent);
            prop_assert!(!error.should_retry());
        }

        #[test]
        fn test_retry_implies_recoverable(message in ".*") {
            for error in [
                Error::transient(message.clone()),
                Error::auth(message.clone()),
                Error::permanent(message.clone()),
                Error::config(message.clone()),
                Error::other(message.clone()),
            ] {
                if error.should_retry() {
                    prop_assert!(error.is_recoverable());
                    prop_assert!(error.severity() <= ErrorSeverity::Medium);
                }
            }
        }
    }

    #[rstest]
    #[case("ThrottlingException", ErrorKind::Transient)]
    #[case("TooManyRequestsException", ErrorKind::Transient)]
    #[case("RequestTimeout", ErrorKind::Transient)]
    #[case("InternalFailure", ErrorKind::Transient)]
    #[case("ExpiredTokenException", ErrorKind::Auth)]
    #[case("InvalidClientTokenId", ErrorKind::Auth)]
    #[case("UnrecognizedClientException", ErrorKind::Auth)]
    #[case("InvalidParameterValueException", ErrorKind::Permanent)]
    #[case("ResourceNotFoundException", ErrorKind::Permanent)]
    fn test_service_code_classification(#[case] code: &str, #[case] kind: ErrorKind) {
        let error = Error::from_service_code(code, "boom");
        assert_eq!(error.kind(), kind);
        assert!(error.to_string().contains(code));
    }

    #[test]
    fn test_auth_is_not_retried_in_place() {
        let error = Error::auth("token expired");
        assert!(error.is_auth());
        assert!(error.is_recoverable());
        assert!(!error.should_retry());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(Error::SchemaMismatch { found: 2, expected: 1 }.is_fatal());
        assert!(Error::state_corrupt("/tmp/state.json", "eof").is_fatal());
        assert!(Error::config("workers out of range").is_fatal());
        assert!(!Error::permanent("not found").is_fatal());
        assert!(!Error::Cancelled.is_fatal());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "state.json");
        let error = Error::from(io_error);

        assert_eq!(error.kind(), ErrorKind::Io);
        assert!(error.to_string().contains("state.json"));
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::Transient).unwrap();
        assert_eq!(json, "\"transient\"");
    }
}
