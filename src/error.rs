use std::error::Error;
use std::fmt;

use crate::execution::ExecutionStatus;
use crate::feedback::ReviewStatus;

pub type Result<T> = std::result::Result<T, QueryError>;

#[derive(Debug)]
pub enum QueryError {
    /// Completing a log entry that is already sealed, or was never begun.
    InvalidLogTransition {
        log_id: i64,
        current: Option<ExecutionStatus>,
    },
    FeedbackOnPendingExecution(i64),
    InvalidRating(i64),
    InvalidReviewTransition {
        feedback_id: i64,
        current: ReviewStatus,
        requested: ReviewStatus,
    },
    InvalidParameters(String),
    InvalidRequest(String),
    NotFound(String),
    TemplateInUse(String),
    UpstreamGeneration(String),
    UpstreamExecution(String),
    /// Transient: pool exhausted or a storage call exceeded its timeout.
    StorageUnavailable(String),
    Storage(String),
    Serialization(serde_json::Error),
}

impl QueryError {
    /// Whether the caller may retry the same call after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueryError::StorageUnavailable(_))
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryError::InvalidLogTransition { log_id, current } => match current {
                Some(status) => write!(
                    f,
                    "Invalid log transition: entry {} is already {}",
                    log_id, status
                ),
                None => write!(f, "Invalid log transition: entry {} does not exist", log_id),
            },
            QueryError::FeedbackOnPendingExecution(log_id) => write!(
                f,
                "Cannot rate execution {} while it is still pending",
                log_id
            ),
            QueryError::InvalidRating(rating) => {
                write!(f, "Rating must be between 1 and 5, got {}", rating)
            }
            QueryError::InvalidReviewTransition {
                feedback_id,
                current,
                requested,
            } => write!(
                f,
                "Feedback {} cannot move from {} to {}",
                feedback_id, current, requested
            ),
            QueryError::InvalidParameters(msg) => write!(f, "Invalid parameters: {}", msg),
            QueryError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            QueryError::NotFound(msg) => write!(f, "Not found: {}", msg),
            QueryError::TemplateInUse(name) => write!(
                f,
                "Template '{}' is referenced by execution history and can only be deactivated",
                name
            ),
            QueryError::UpstreamGeneration(msg) => write!(f, "SQL generation failed: {}", msg),
            QueryError::UpstreamExecution(msg) => write!(f, "SQL execution failed: {}", msg),
            QueryError::StorageUnavailable(msg) => write!(f, "Storage unavailable: {}", msg),
            QueryError::Storage(msg) => write!(f, "Storage error: {}", msg),
            QueryError::Serialization(err) => write!(f, "Serialization error: {}", err),
        }
    }
}

impl Error for QueryError {}

impl From<duckdb::Error> for QueryError {
    fn from(err: duckdb::Error) -> Self {
        QueryError::Storage(err.to_string())
    }
}

impl From<r2d2::Error> for QueryError {
    fn from(err: r2d2::Error) -> Self {
        QueryError::StorageUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for QueryError {
    fn from(err: serde_json::Error) -> Self {
        QueryError::Serialization(err)
    }
}
