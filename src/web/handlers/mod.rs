pub mod admin;
pub mod api;

use axum::http::StatusCode;
use tracing::{error, warn};

use crate::error::QueryError;

pub type ApiResult<T> = Result<T, (StatusCode, String)>;

pub fn status_for(err: &QueryError) -> StatusCode {
    match err {
        QueryError::NotFound(_) => StatusCode::NOT_FOUND,
        QueryError::InvalidLogTransition { .. }
        | QueryError::FeedbackOnPendingExecution(_)
        | QueryError::InvalidReviewTransition { .. }
        | QueryError::TemplateInUse(_) => StatusCode::CONFLICT,
        QueryError::InvalidRating(_)
        | QueryError::InvalidParameters(_)
        | QueryError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
        QueryError::UpstreamGeneration(_) | QueryError::UpstreamExecution(_) => {
            StatusCode::BAD_GATEWAY
        }
        QueryError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        QueryError::Storage(_) | QueryError::Serialization(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

pub fn api_error(err: QueryError) -> (StatusCode, String) {
    let status = status_for(&err);
    if status.is_server_error() {
        error!("Request failed: {}", err);
    } else {
        warn!("Request rejected: {}", err);
    }
    (status, err.to_string())
}
