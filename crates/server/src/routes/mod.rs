use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

mod files;
mod health;
mod rest;
mod ws_relay;
mod ws_sandbox;
mod ws_sync;

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // WebSocket routes
        .route("/ws/sync/:workspace", get(ws_sync::ws_handler))
        .route(
            "/ws/sandbox/:workspace/:session_id",
            get(ws_sandbox::ws_handler),
        )
        .route("/ws/relay", get(ws_relay::ws_handler))
        // Bulk reads per workspace
        .route("/api/:workspace/sessions", get(rest::list_sessions))
        .route("/api/:workspace/sessions/:id", get(rest::get_session))
        .route("/api/:workspace/sources", get(rest::list_sources))
        .route("/api/:workspace/statuses", get(rest::get_statuses))
        .route("/api/:workspace/labels", get(rest::get_labels))
        .route("/api/:workspace/skills", get(rest::list_skills))
        .route("/api/:workspace/plans/:session_id", get(rest::list_plans))
        .route("/api/:workspace/projects", get(rest::list_projects))
        .route(
            "/api/:workspace/sandboxes",
            get(rest::list_sandboxes).post(rest::create_sandbox),
        )
        .route(
            "/api/:workspace/sandboxes/:id",
            get(rest::get_sandbox).delete(rest::terminate_sandbox),
        )
        .route(
            "/api/:workspace/sandboxes/:id/heartbeat",
            post(rest::sandbox_heartbeat),
        )
        // REST-originated mutations
        .route("/api/:workspace/sessions/:id/flag", post(rest::flag_session))
        // Repo credentials
        .route("/api/:workspace/repos/check-auth", post(rest::check_repo_auth))
        .route("/api/:workspace/repos/credential", post(rest::store_credential))
        .route(
            "/api/:workspace/repos/credential/clear",
            post(rest::clear_credential),
        )
        // Relay entry points
        .route("/relay/action", post(rest::relay_action))
        .route("/relay/query/:resource", get(rest::relay_query))
        // Signed file serving
        .route("/files/*path", get(files::serve_file))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
