//! HTTP/SSE surface for the Agentum runtime.
//!
//! A thin axum adapter over `agentum-core`: REST endpoints for session
//! lifecycle and results, plus a Server-Sent-Events stream for live events.

pub mod auth;
pub mod error;
pub mod routes;
pub mod sse;
pub mod state;

use axum::http::HeaderValue;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

pub use state::SharedState;

/// Assemble the API router. Everything except token issuance and the health
/// probe sits behind the bearer-token middleware.
pub fn build_router(state: SharedState) -> Router {
    let cors = cors_layer(&state);

    let protected = Router::new()
        .route("/api/v1/sessions", get(routes::list_sessions))
        .route("/api/v1/sessions/run", post(routes::run_task))
        .route("/api/v1/sessions/{id}", get(routes::get_session))
        .route("/api/v1/sessions/{id}/task", post(routes::start_task))
        .route("/api/v1/sessions/{id}/cancel", post(routes::cancel_task))
        .route("/api/v1/sessions/{id}/result", get(routes::get_result))
        .route("/api/v1/sessions/{id}/events", get(sse::events_stream))
        .route(
            "/api/v1/sessions/{id}/events/history",
            get(routes::events_history),
        )
        .route("/api/v1/sessions/{id}/files", get(routes::get_file))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ));

    Router::new()
        .merge(protected)
        .route("/api/v1/auth/token", post(routes::issue_token))
        .route("/api/v1/health", get(routes::health))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(state: &SharedState) -> CorsLayer {
    let origins: Vec<HeaderValue> = state
        .ctx
        .config
        .cors_origins()
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                log::warn!("ignoring invalid CORS origin {origin:?}");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}
