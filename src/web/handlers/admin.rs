use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use super::{ApiResult, api_error};
use crate::cache::{CacheEntry, CacheStats};
use crate::error::QueryError;
use crate::execution::log::{ExecutionLogEntry, LogFilter};
use crate::feedback::{Feedback, FeedbackStats, QualityReport, ReviewStatus};
use crate::maintenance::SweepReport;
use crate::templates::{QueryTemplate, TemplateFilter};
use crate::web::state::AppState;

const DEFAULT_LIST_LIMIT: usize = 50;

#[derive(Debug, Deserialize)]
pub struct FeedbackQuery {
    pub status: Option<ReviewStatus>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ReviewRequest {
    pub reviewer_id: i64,
    pub status: ReviewStatus,
    #[serde(default)]
    pub admin_response: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ActiveRequest {
    pub active: bool,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

// Feedback review

pub async fn list_feedback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FeedbackQuery>,
) -> ApiResult<Json<Vec<Feedback>>> {
    state
        .feedback
        .list_feedback(query.status, query.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .await
        .map(Json)
        .map_err(api_error)
}

pub async fn feedback_stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<FeedbackStats>> {
    state.feedback.compute_stats().await.map(Json).map_err(api_error)
}

pub async fn review_feedback(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(payload): Json<ReviewRequest>,
) -> ApiResult<Json<Feedback>> {
    state
        .feedback
        .review_feedback(id, payload.reviewer_id, payload.status, payload.admin_response)
        .await
        .map(Json)
        .map_err(api_error)
}

// Template curation

pub async fn list_templates(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<TemplateFilter>,
) -> ApiResult<Json<Vec<QueryTemplate>>> {
    state.templates.list(filter).await.map(Json).map_err(api_error)
}

pub async fn create_template(
    State(state): State<Arc<AppState>>,
    Json(template): Json<QueryTemplate>,
) -> ApiResult<(StatusCode, Json<QueryTemplate>)> {
    let created = state.templates.create(&template).await.map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn get_template(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<QueryTemplate>> {
    state.templates.get(&name).await.map(Json).map_err(api_error)
}

pub async fn update_template(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(mut template): Json<QueryTemplate>,
) -> ApiResult<Json<QueryTemplate>> {
    template.name = name;
    state.templates.update(&template).await.map(Json).map_err(api_error)
}

pub async fn delete_template(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state.templates.delete(&name).await.map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn set_template_active(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(payload): Json<ActiveRequest>,
) -> ApiResult<StatusCode> {
    state
        .templates
        .set_active(&name, payload.active)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

// Cache inspection

pub async fn cache_stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<CacheStats>> {
    state.cache.stats().await.map(Json).map_err(api_error)
}

pub async fn cache_top(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<CacheEntry>>> {
    state
        .cache
        .top_entries(query.limit.unwrap_or(10))
        .await
        .map(Json)
        .map_err(api_error)
}

pub async fn invalidate_cache_entry(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
) -> ApiResult<StatusCode> {
    if state.cache.invalidate_key(&hash).await.map_err(api_error)? {
        info!("Invalidated cache entry {} on request", hash);
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(api_error(QueryError::NotFound(format!("cache entry {}", hash))))
    }
}

pub async fn sweep(State(state): State<Arc<AppState>>) -> ApiResult<Json<SweepReport>> {
    state.maintenance.run_once().await.map(Json).map_err(api_error)
}

// Execution history

pub async fn list_logs(
    State(state): State<Arc<AppState>>,
    Query(mut filter): Query<LogFilter>,
) -> ApiResult<Json<Vec<ExecutionLogEntry>>> {
    filter.limit.get_or_insert(DEFAULT_LIST_LIMIT);
    state.log.list(filter).await.map(Json).map_err(api_error)
}

pub async fn get_log(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<ExecutionLogEntry>> {
    state.log.get(id).await.map(Json).map_err(api_error)
}

pub async fn usage_report(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<QualityReport>> {
    state
        .feedback
        .quality_report(query.limit.unwrap_or(10))
        .await
        .map(Json)
        .map_err(api_error)
}
