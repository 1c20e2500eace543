use crate::worker::WorkerError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failures of stream registry operations
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Stream '{0}' not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Invalid stream configuration: {0}")]
    Configuration(String),

    #[error("Maximum of {0} concurrent streams reached")]
    Capacity(usize),

    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),
}

impl From<WorkerError> for StreamError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::AlreadyRunning { .. } => StreamError::Conflict(err.to_string()),
            WorkerError::Retired { stream_id } => StreamError::NotFound(stream_id),
            WorkerError::Source { source, .. } => {
                StreamError::SourceUnavailable(source.to_string())
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %message, "request failed");
        }

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

impl From<StreamError> for ApiError {
    fn from(err: StreamError) -> Self {
        let message = err.to_string();
        match err {
            StreamError::NotFound(_) => ApiError::NotFound(message),
            StreamError::Conflict(_) | StreamError::Capacity(_) => ApiError::Conflict(message),
            StreamError::Configuration(_) => ApiError::BadRequest(message),
            StreamError::SourceUnavailable(_) => ApiError::Unavailable(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceError;
    use common::streams::WorkerState;

    #[test]
    fn test_stream_error_status_mapping() {
        let cases = [
            (StreamError::NotFound("cam".into()), StatusCode::NOT_FOUND),
            (StreamError::Conflict("exists".into()), StatusCode::CONFLICT),
            (StreamError::Capacity(10), StatusCode::CONFLICT),
            (StreamError::Configuration("bad".into()), StatusCode::BAD_REQUEST),
            (
                StreamError::SourceUnavailable("gone".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];

        for (err, expected) in cases {
            let response = ApiError::from(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }

    #[test]
    fn test_worker_error_conversion() {
        let err = StreamError::from(WorkerError::AlreadyRunning {
            stream_id: "cam".into(),
            state: WorkerState::Running,
        });
        assert!(matches!(err, StreamError::Conflict(ref msg) if msg.contains("already running")));

        let err = StreamError::from(WorkerError::Source {
            stream_id: "cam".into(),
            source: SourceError::Unavailable("no device".into()),
        });
        assert!(matches!(err, StreamError::SourceUnavailable(_)));

        let err = StreamError::from(WorkerError::Retired {
            stream_id: "cam".into(),
        });
        assert!(matches!(err, StreamError::NotFound(ref id) if id == "cam"));
    }

    #[test]
    fn test_internal_error_response() {
        let response = ApiError::Internal("encoder failed".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
