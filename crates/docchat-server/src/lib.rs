pub mod config;
pub mod document;
pub mod handlers;
pub mod services;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod utils;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post, put},
    Router,
};
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};

pub use state::AppState;

/// Body limit for one request: a full batch of maximum-size files plus base64 overhead
fn body_limit(state: &AppState) -> usize {
    let limits = &state.settings.limits;
    let batch = limits
        .max_upload_bytes
        .saturating_mul(limits.max_batch_files.max(1) as u64);
    usize::try_from(batch.saturating_mul(4) / 3 + 64 * 1024).unwrap_or(usize::MAX)
}

pub fn build_router(state: AppState) -> Router {
    let body_limit = body_limit(&state);

    let public_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/health/ready", get(handlers::health::readiness_check));

    let api_routes = Router::new()
        .route("/api/formats", get(handlers::upload::list_formats))
        .route("/api/uploads", post(handlers::upload::upload_handler))
        .route("/api/models", get(handlers::models::list_models))
        .route("/api/models/{name}", get(handlers::models::get_model))
        .route(
            "/api/conversations",
            post(handlers::conversations::create_conversation)
                .get(handlers::conversations::list_conversations),
        )
        .route(
            "/api/conversations/import",
            post(handlers::conversations::import_conversation),
        )
        .route(
            "/api/conversations/{id}",
            get(handlers::conversations::get_conversation)
                .delete(handlers::conversations::delete_conversation),
        )
        .route(
            "/api/conversations/{id}/pin",
            put(handlers::conversations::pin_conversation),
        )
        .route(
            "/api/conversations/{id}/messages",
            post(handlers::chat::send_message),
        )
        .route(
            "/api/conversations/{id}/export",
            get(handlers::conversations::export_conversation),
        )
        .route("/api/search", get(handlers::search::search_handler))
        .route("/api/stats", get(handlers::search::stats_handler))
        .route("/api/cache", delete(handlers::search::clear_cache))
        .route(
            "/api/retention/sweep",
            post(handlers::conversations::retention_sweep),
        );

    Router::new()
        .merge(public_routes)
        .merge(api_routes)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(true)),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CatchPanicLayer::new())
}
