use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

use super::handlers;
use super::state::AppState;

// Question answering and user feedback
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/query", post(handlers::api::ask))
        .route(
            "/feedback",
            post(handlers::api::submit_feedback).get(handlers::admin::list_feedback),
        )
        .route("/templates/match", post(handlers::api::match_templates))
        .route("/status", get(handlers::api::system_status))
}

// Curation, inspection and housekeeping
pub fn admin_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/feedback/stats", get(handlers::admin::feedback_stats))
        .route("/feedback/{id}/review", post(handlers::admin::review_feedback))
        .route(
            "/templates",
            get(handlers::admin::list_templates).post(handlers::admin::create_template),
        )
        .route(
            "/templates/{name}",
            get(handlers::admin::get_template)
                .put(handlers::admin::update_template)
                .delete(handlers::admin::delete_template),
        )
        .route("/templates/{name}/active", post(handlers::admin::set_template_active))
        .route("/cache/stats", get(handlers::admin::cache_stats))
        .route("/cache/top", get(handlers::admin::cache_top))
        .route("/cache/{hash}/invalidate", post(handlers::admin::invalidate_cache_entry))
        .route("/cache/sweep", post(handlers::admin::sweep))
        .route("/logs", get(handlers::admin::list_logs))
        .route("/logs/{id}", get(handlers::admin::get_log))
        .route("/reports/usage", get(handlers::admin::usage_report))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api", api_routes().merge(admin_routes()))
        .with_state(state)
}
