use crate::error::ApiError;
use crate::state::AnalyticsState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use common::analysis::{ResultsFilters, ResultsQuery, ResultsResponse};
use common::streams::{StreamActionResponse, StreamDescriptor, StreamListResponse};
use serde_json::json;

pub const DEFAULT_RESULTS_LIMIT: usize = 100;

/// Service banner
pub async fn root(State(state): State<AnalyticsState>) -> impl IntoResponse {
    Json(json!({
        "message": "Video analytics node",
        "version": common::VERSION,
        "status": "running",
        "backend": state.backends().backend_id(),
        "started_at": state.started_at(),
    }))
}

/// Liveness check endpoint
pub async fn health() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "analytics-node",
            "timestamp": Utc::now(),
        })),
    )
}

/// Prometheus metrics endpoint
pub async fn metrics() -> Result<String, ApiError> {
    telemetry::metrics::gather_text()
        .map_err(|e| ApiError::Internal(format!("Failed to encode metrics: {}", e)))
}

pub async fn list_streams(State(state): State<AnalyticsState>) -> Json<StreamListResponse> {
    let streams = state.streams().list().await;
    Json(StreamListResponse {
        total: streams.len(),
        streams,
    })
}

pub async fn create_stream(
    State(state): State<AnalyticsState>,
    Json(descriptor): Json<StreamDescriptor>,
) -> Result<Json<StreamActionResponse>, ApiError> {
    let stream_id = state.streams().create(descriptor).await?;
    Ok(Json(StreamActionResponse {
        message: "Stream created".to_string(),
        stream_id,
    }))
}

pub async fn start_stream(
    State(state): State<AnalyticsState>,
    Path(stream_id): Path<String>,
) -> Result<Json<StreamActionResponse>, ApiError> {
    state.streams().start(&stream_id).await?;
    Ok(Json(StreamActionResponse {
        message: "Stream started".to_string(),
        stream_id,
    }))
}

pub async fn stop_stream(
    State(state): State<AnalyticsState>,
    Path(stream_id): Path<String>,
) -> Result<Json<StreamActionResponse>, ApiError> {
    state.streams().stop(&stream_id).await?;
    Ok(Json(StreamActionResponse {
        message: "Stream stopped".to_string(),
        stream_id,
    }))
}

pub async fn delete_stream(
    State(state): State<AnalyticsState>,
    Path(stream_id): Path<String>,
) -> Result<Json<StreamActionResponse>, ApiError> {
    state.streams().delete(&stream_id).await?;
    Ok(Json(StreamActionResponse {
        message: "Stream deleted".to_string(),
        stream_id,
    }))
}

pub async fn list_models(State(state): State<AnalyticsState>) -> impl IntoResponse {
    Json(state.backends().describe())
}

pub async fn list_results(
    State(state): State<AnalyticsState>,
    Query(query): Query<ResultsQuery>,
) -> Json<ResultsResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_RESULTS_LIMIT);
    let results = state
        .results()
        .query(query.stream_id.as_deref(), query.alert_level, limit)
        .await;

    Json(ResultsResponse {
        total: results.len(),
        results,
        filters: ResultsFilters {
            stream_id: query.stream_id,
            alert_level: query.alert_level,
            limit,
        },
    })
}

pub async fn dashboard_stats(State(state): State<AnalyticsState>) -> impl IntoResponse {
    Json(state.dashboard_stats().await)
}
