use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::{ApiResult, api_error};
use crate::assistant::{QueryRequest, QueryResponse};
use crate::feedback::{Feedback, NewFeedback};
use crate::templates::RankedTemplate;
use crate::web::state::AppState;

#[derive(Debug, Deserialize)]
pub struct MatchRequest {
    pub question: String,
    #[serde(default = "default_role")]
    pub user_role: String,
    /// Only return templates scoring at least this much.
    #[serde(default)]
    pub min_score: Option<f64>,
}

fn default_role() -> String {
    "all".to_string()
}

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: String,
    pub uptime_seconds: i64,
    pub cached_entries: u64,
    pub active_templates: usize,
    pub llm_backend: String,
}

pub async fn ask(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<QueryRequest>,
) -> ApiResult<Json<QueryResponse>> {
    debug!("Question from user {}: {}", payload.user_id, payload.question);
    state.assistant.ask(payload).await.map(Json).map_err(api_error)
}

pub async fn submit_feedback(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NewFeedback>,
) -> ApiResult<Json<Feedback>> {
    state
        .feedback
        .submit_feedback(payload)
        .await
        .map(Json)
        .map_err(api_error)
}

pub async fn match_templates(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<MatchRequest>,
) -> ApiResult<Json<Vec<RankedTemplate>>> {
    let ranked = state
        .matcher
        .match_query(&payload.question, &payload.user_role)
        .await
        .map_err(api_error)?;
    let min_score = payload.min_score.unwrap_or(0.0);
    Ok(Json(
        ranked.into_iter().filter(|r| r.score >= min_score).collect(),
    ))
}

pub async fn system_status(State(state): State<Arc<AppState>>) -> ApiResult<Json<SystemStatus>> {
    let uptime = chrono::Utc::now()
        .signed_duration_since(state.startup_time)
        .num_seconds();
    let cache = state.cache.stats().await.map_err(api_error)?;
    let templates = state.templates.list_active().await.map_err(api_error)?;

    Ok(Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        cached_entries: cache.valid,
        active_templates: templates.len(),
        llm_backend: state.config.llm.backend.clone(),
    }))
}
