//! Error types for role resolution, roster sync and audit logging

use std::time::Duration;
use thiserror::Error;

/// Authorization subsystem errors
///
/// A cache miss is not an error; it is reported as
/// [`CacheState::Miss`](crate::event::CacheState::Miss).
#[derive(Debug, Error)]
pub enum AuthzError {
    /// User id is malformed (zero or negative)
    #[error("Invalid user id: {0}")]
    InvalidUserId(i64),

    /// Role name not recognised
    #[error("Invalid role: '{0}'")]
    InvalidRole(String),

    /// Role source did not answer within the lookup timeout
    #[error("Role lookup timed out after {0:?}")]
    LookupTimeout(Duration),

    /// Role source answered with an error (connection, parse, ...)
    #[error("Role lookup failed: {0}")]
    LookupFailure(String),

    /// Roster record is missing a field or carries an unreadable value
    #[error("Malformed roster record: {0}")]
    MalformedRecord(String),

    /// Some roster records could not be applied during a sync cycle
    #[error("Roster sync partially failed: {failed} record(s) rejected")]
    PartialSyncFailure {
        /// Number of rejected records
        failed: usize,
        /// Ids of rejected records (when the id itself was readable)
        failed_ids: Vec<i64>,
    },

    /// The whole sync cycle failed; the cache was left untouched
    #[error("Roster sync failed: {0}")]
    TotalSyncFailure(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Audit sink rejected a record
    #[error("Audit sink error: {0}")]
    Sink(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AuthzError {
    /// Whether the error came from talking to the role source
    pub fn is_lookup_error(&self) -> bool {
        matches!(self, Self::LookupTimeout(_) | Self::LookupFailure(_))
    }
}

/// Result type for authorization operations
pub type Result<T> = std::result::Result<T, AuthzError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = AuthzError::InvalidUserId(-4);
        assert_eq!(err.to_string(), "Invalid user id: -4");

        let err = AuthzError::PartialSyncFailure {
            failed: 2,
            failed_ids: vec![7, 9],
        };
        assert!(err.to_string().contains("2 record(s)"));
    }

    #[test]
    fn test_lookup_error_classification() {
        assert!(AuthzError::LookupTimeout(Duration::from_millis(250)).is_lookup_error());
        assert!(AuthzError::LookupFailure("refused".into()).is_lookup_error());
        assert!(!AuthzError::TotalSyncFailure("down".into()).is_lookup_error());
    }
}
