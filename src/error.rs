//! Unified error handling for the trip tracker.
//!
//! Sample rejection is not an error: the filter reports it as an outcome and
//! tracking continues. Errors here cover lifecycle misuse, storage, transport
//! and configuration problems.

use thiserror::Error;

/// Unified error type for trip tracker operations.
#[derive(Debug, Clone, Error)]
#[cfg_attr(feature = "ffi", derive(uniffi::Error))]
pub enum TrackerError {
    /// An operation that needs a running session was called without one
    #[error("No active tracking session")]
    NoActiveSession,

    /// `start` was called while a session is already running
    #[error("Session '{session_id}' is already active")]
    SessionAlreadyActive { session_id: String },

    /// Key-value storage failure
    #[error("Storage error for key '{key}': {message}")]
    Storage { key: String, message: String },

    /// Snapshot or queue payload could not be encoded/decoded
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Remote sync transport failure
    #[error("Transport error{}: {message}", status_suffix(.status_code))]
    Transport {
        message: String,
        status_code: Option<u16>,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Generic internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

fn status_suffix(status_code: &Option<u16>) -> String {
    status_code
        .map(|code| format!(" ({})", code))
        .unwrap_or_default()
}

impl TrackerError {
    pub(crate) fn storage(key: &str, message: impl std::fmt::Display) -> Self {
        TrackerError::Storage {
            key: key.to_string(),
            message: message.to_string(),
        }
    }
}

impl From<serde_json::Error> for TrackerError {
    fn from(e: serde_json::Error) -> Self {
        TrackerError::Serialization {
            message: e.to_string(),
        }
    }
}

/// Result type alias for trip tracker operations.
pub type Result<T> = std::result::Result<T, TrackerError>;

/// Extension trait for converting Option to TrackerError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a no-active-session error.
    fn ok_or_no_session(self) -> Result<T>;

    /// Convert Option to Result with generic internal error.
    fn ok_or_internal(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_no_session(self) -> Result<T> {
        self.ok_or(TrackerError::NoActiveSession)
    }

    fn ok_or_internal(self, message: &str) -> Result<T> {
        self.ok_or_else(|| TrackerError::Internal {
            message: message.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TrackerError::SessionAlreadyActive {
            session_id: "trip-1".to_string(),
        };
        assert!(err.to_string().contains("trip-1"));

        let err = TrackerError::Transport {
            message: "Service Unavailable".to_string(),
            status_code: Some(503),
        };
        assert_eq!(err.to_string(), "Transport error (503): Service Unavailable");

        let err = TrackerError::Transport {
            message: "connection reset".to_string(),
            status_code: None,
        };
        assert_eq!(err.to_string(), "Transport error: connection reset");
    }

    #[test]
    fn test_option_ext() {
        let none: Option<i32> = None;
        assert!(matches!(
            none.ok_or_no_session(),
            Err(TrackerError::NoActiveSession)
        ));
        assert_eq!(Some(3).ok_or_internal("unused").unwrap(), 3);
    }

    #[test]
    fn test_from_serde_error() {
        let parse: std::result::Result<u32, _> = serde_json::from_str("not json");
        let err: TrackerError = parse.unwrap_err().into();
        assert!(matches!(err, TrackerError::Serialization { .. }));
    }
}
