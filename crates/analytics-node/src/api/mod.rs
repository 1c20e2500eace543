pub mod routes;
pub mod websocket;

use crate::state::AnalyticsState;
use axum::{
    http::HeaderValue,
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Build the API router
pub fn router(state: AnalyticsState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/", get(routes::root))
        .route("/health", get(routes::health))
        .route("/metrics", get(routes::metrics))
        // Stream lifecycle
        .route("/streams", get(routes::list_streams).post(routes::create_stream))
        .route("/streams/:id", delete(routes::delete_stream))
        .route("/streams/:id/start", post(routes::start_stream))
        .route("/streams/:id/stop", post(routes::stop_stream))
        // Analysis
        .route("/ai-models", get(routes::list_models))
        .route("/results", get(routes::list_results))
        .route("/dashboard/stats", get(routes::dashboard_stats))
        // Real-time delivery
        .route("/ws", get(websocket::ws_handler))
        .layer(cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);

    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    layer.allow_origin(parsed)
}
