//! Error types for the Sitepulse agent.
//!
//! Telemetry is best-effort: none of these errors reach the host through the
//! [`Agent`](crate::agent::Agent) facade. They exist so that each layer can
//! report *what* went wrong to the layer that contains it (usually the
//! [`EventBus`](crate::bus::EventBus), which logs and moves on).

use thiserror::Error;

use crate::storage::StorageError;

/// Errors that can occur during agent operations.
#[derive(Error, Debug)]
pub enum AgentError {
    /// The persistent key-value store could not be read or written.
    ///
    /// Non-fatal: the in-memory session keeps working for this instance.
    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(#[from] StorageError),

    /// A persisted record exists but could not be decoded.
    ///
    /// Callers treat this exactly like a missing record.
    #[error("malformed record under '{key}': {source}")]
    MalformedRecord {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// A signal handler or duty-cycle operation failed.
    #[error("handler for '{signal}' failed: {message}")]
    HandlerFailure { signal: String, message: String },

    /// Reading a replay script failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be serialized for storage.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AgentError {
    /// Returns `true` if the error only affects persistence and the
    /// in-memory state is still usable.
    #[must_use]
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            Self::PersistenceUnavailable(_) | Self::MalformedRecord { .. }
        )
    }
}

/// A specialized `Result` type for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistence_unavailable_display() {
        let err = AgentError::from(StorageError::Unavailable("quota exceeded".to_string()));
        assert_eq!(
            err.to_string(),
            "persistence unavailable: storage unavailable: quota exceeded"
        );
        assert!(err.is_persistence());
    }

    #[test]
    fn malformed_record_display_and_source() {
        use std::error::Error;

        let json_err = serde_json::from_str::<serde_json::Value>("{ nope").unwrap_err();
        let err = AgentError::MalformedRecord {
            key: "sitepulse.session".to_string(),
            source: json_err,
        };
        assert!(err
            .to_string()
            .starts_with("malformed record under 'sitepulse.session':"));
        assert!(err.source().is_some());
        assert!(err.is_persistence());
    }

    #[test]
    fn handler_failure_display() {
        let err = AgentError::HandlerFailure {
            signal: "duty-cycle".to_string(),
            message: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "handler for 'duty-cycle' failed: boom");
        assert!(!err.is_persistence());
    }

    #[test]
    fn json_error_conversion() {
        let json_err = serde_json::from_str::<u32>("\"x\"").unwrap_err();
        let err: AgentError = json_err.into();
        assert!(matches!(err, AgentError::Json(_)));
        assert!(err.to_string().starts_with("JSON error:"));
        assert!(!err.is_persistence());
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: AgentError = io_err.into();
        assert!(matches!(err, AgentError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn result_type_alias_works() {
        fn ok_fn() -> Result<i32> {
            Ok(42)
        }

        fn err_fn() -> Result<i32> {
            Err(AgentError::HandlerFailure {
                signal: "click".to_string(),
                message: "test".to_string(),
            })
        }

        assert!(ok_fn().is_ok());
        assert!(err_fn().is_err());
    }
}
