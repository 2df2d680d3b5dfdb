use thiserror::Error;

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

/// Failures surfaced by the sync core. None of them are fatal: every path
/// degrades to stale-but-consistent state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// Network or store error while writing (send, mark-read)
    #[error("write failed: {0}")]
    Write(String),

    /// Network or store error while reading (load, refresh, count)
    #[error("query failed: {0}")]
    Query(String),

    #[error("subscription to {table} failed: {message}")]
    Subscription { table: String, message: String },

    /// Remote procedure call failure (achievement evaluation)
    #[error("rpc {name} failed: {message}")]
    Rpc { name: String, message: String },

    #[error("failed to decode {what}: {message}")]
    Decode { what: &'static str, message: String },

    #[error("invalid channel filter: {0}")]
    InvalidFilter(String),

    #[error("message body is empty")]
    EmptyMessage,

    #[error("no message with id {0}")]
    UnknownMessage(String),

    /// The owning component was torn down while the call was in flight
    #[error("{0} is closed")]
    Closed(&'static str),
}

impl SyncError {
    pub fn decode(what: &'static str, err: impl std::fmt::Display) -> Self {
        SyncError::Decode {
            what,
            message: err.to_string(),
        }
    }

    pub fn subscription(table: &str, err: impl std::fmt::Display) -> Self {
        SyncError::Subscription {
            table: table.to_string(),
            message: err.to_string(),
        }
    }

    /// Whether retrying the same call later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Write(_)
                | SyncError::Query(_)
                | SyncError::Subscription { .. }
                | SyncError::Rpc { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SyncError::Write("timeout".into()).is_retryable());
        assert!(SyncError::Query("503".into()).is_retryable());
        assert!(SyncError::subscription("messages", "closed").is_retryable());
        assert!(!SyncError::EmptyMessage.is_retryable());
        assert!(!SyncError::InvalidFilter("no column".into()).is_retryable());
        assert!(!SyncError::decode("message", "missing id").is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::Rpc {
            name: "evaluate_achievements".into(),
            message: "500".into(),
        };
        assert_eq!(err.to_string(), "rpc evaluate_achievements failed: 500");
    }
}
