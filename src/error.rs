use crate::metrics::InsertBenchmark;
use std::time::Duration;
use thiserror::Error;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failures surfaced by a [`crate::store::DocumentStore`]. Driver errors are always
/// translated into one of these; messages never include connection credentials.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("connection error during {operation}: {message}")]
    Connection {
        operation: &'static str,
        message: String,
    },

    #[error("{operation} timed out after {}ms", limit.as_millis())]
    Timeout {
        operation: &'static str,
        limit: Duration,
    },

    #[error("write rejected during {operation}: {message}")]
    Write {
        operation: &'static str,
        message: String,
    },

    #[error("query failed during {operation}: {message}")]
    Query {
        operation: &'static str,
        message: String,
    },
}

impl StoreError {
    pub fn query(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Query {
            operation,
            message: message.into(),
        }
    }

    pub fn write(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Write {
            operation,
            message: message.into(),
        }
    }

    pub fn connection(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Connection {
            operation,
            message: message.into(),
        }
    }

    /// Connection and timeout failures may succeed on a later attempt; rejected writes and
    /// malformed queries will not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    pub fn operation(&self) -> &'static str {
        match self {
            Self::Connection { operation, .. }
            | Self::Timeout { operation, .. }
            | Self::Write { operation, .. }
            | Self::Query { operation, .. } => operation,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Timeout { .. } => "timeout",
            Self::Write { .. } => "write",
            Self::Query { .. } => "query",
        }
    }
}

/// Insertion benchmark stopped because too many inserts failed. `partial` holds the
/// statistics gathered over the inserts that did succeed.
#[derive(Error, Debug, Clone)]
#[error(
    "benchmark aborted: {failures} of {attempted} inserts failed (allowed ratio {max_failure_ratio})"
)]
pub struct BenchmarkAborted {
    pub failures: usize,
    pub attempted: usize,
    pub max_failure_ratio: f64,
    pub partial: Box<InsertBenchmark>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_failures_are_retryable() {
        assert!(StoreError::connection("insert_one", "reset").is_retryable());
        assert!(StoreError::Timeout {
            operation: "insert_one",
            limit: Duration::from_millis(50),
        }
        .is_retryable());
        assert!(!StoreError::write("insert_one", "validation").is_retryable());
        assert!(!StoreError::query("aggregate", "bad stage").is_retryable());
    }

    #[test]
    fn display_names_the_operation() {
        let err = StoreError::Timeout {
            operation: "find",
            limit: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "find timed out after 1500ms");
        assert_eq!(err.kind(), "timeout");
    }
}
