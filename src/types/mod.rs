#![forbid(unsafe_code)]

//! Shared error type and identifiers used across the planner and executor.

use std::fmt;

use crate::query::errors::PlanError;

/// Errors surfaced by planning or execution.
///
/// Planning failures arrive wrapped in [`QueryError::Plan`]; everything else
/// is raised while a pipeline is running and travels through the execution
/// context's error sink.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    /// The planner could not produce a plan.
    #[error("plan: {0}")]
    Plan(#[from] PlanError),
    /// An index scan timed out and the query shape forbids a chunked restart.
    #[error("index scan timed out on {index}")]
    ScanTimeout {
        /// Index whose scan timed out.
        index: String,
    },
    /// Unexpected internal inconsistency detected by an operator.
    #[error("internal: {0}")]
    Internal(String),
    /// Expression evaluation failed.
    #[error("evaluation of {expr} failed: {reason}")]
    Evaluation {
        /// Expression text.
        expr: String,
        /// Failure description.
        reason: String,
    },
    /// A datastore call failed.
    #[error("datastore: {0}")]
    Datastore(String),
    /// A single key could not be fetched; the rest of the batch proceeds.
    #[error("fetch of key {key} failed: {reason}")]
    KeyFetch {
        /// Document key.
        key: String,
        /// Failure description.
        reason: String,
    },
    /// The request was stopped before it completed.
    #[error("request cancelled")]
    Cancelled,
    /// Invalid engine configuration.
    #[error("config: {0}")]
    Config(String),
    /// Filesystem failure while loading configuration or fixtures.
    #[error("io: {0}")]
    Io(String),
    /// JSON decoding failure.
    #[error("json: {0}")]
    Json(String),
}

impl QueryError {
    /// Returns true when the error ends the request.
    ///
    /// Per-key fetch failures are reported alongside partial results and do
    /// not stop the pipeline.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, QueryError::KeyFetch { .. } | QueryError::Cancelled)
    }

    /// Stable numeric code for the error family.
    pub fn code(&self) -> u32 {
        match self {
            QueryError::Plan(err) => err.code(),
            QueryError::ScanTimeout { .. } => 12015,
            QueryError::Internal(_) => 5001,
            QueryError::Evaluation { .. } => 5010,
            QueryError::Datastore(_) => 12000,
            QueryError::KeyFetch { .. } => 12008,
            QueryError::Cancelled => 1010,
            QueryError::Config(_) => 1020,
            QueryError::Io(_) => 1030,
            QueryError::Json(_) => 1040,
        }
    }

    /// Convenience constructor for internal errors.
    pub fn internal(msg: impl Into<String>) -> Self {
        QueryError::Internal(msg.into())
    }
}

impl From<std::io::Error> for QueryError {
    fn from(err: std::io::Error) -> Self {
        QueryError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for QueryError {
    fn from(err: serde_json::Error) -> Self {
        QueryError::Json(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = QueryError> = std::result::Result<T, E>;

/// Opaque request identifier carried by the execution context.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct RequestId(pub String);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        RequestId(value.to_owned())
    }
}
