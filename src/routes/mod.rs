//! Router assembly: HTTP endpoints, WebSocket upgrade, CORS, and HTTP tracing.

use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::state::AppState;

pub mod http;
pub mod ws;

/// Build the application router with:
/// - WebSocket at `/ws`
/// - session API under `/api/...`
/// - CORS (allow any origin/method/headers)
/// - HTTP trace layer (per-request spans w/ method, path, status, latency)
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // WebSocket
        .route("/ws", get(ws::ws_upgrade))
        // HTTP API
        .route("/api/health", get(http::http_health))
        .route("/api/createSession/:class_id", post(http::http_create_session))
        .route("/api/getSessionParams/:session_id", get(http::http_get_session_params))
        .route("/api/requestQuestion/:session_id", get(http::http_request_question))
        .route("/api/submitAnswer/:question_id", post(http::http_submit_answer))
        .route("/api/requestHint/:question_id", post(http::http_request_hint))
        .route("/api/setAdaptive/:session_id", post(http::http_set_adaptive))
        .route("/api/updateSessionParams/:session_id", post(http::http_update_session_params))
        .route("/api/deleteSession/:session_id", delete(http::http_delete_session))
        .route("/api/getMetrics/:session_id", get(http::http_get_metrics))
        // State + CORS + HTTP tracing
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}
