//! HTTP error mapping.

use crate::engine::EngineError;
use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use memoryfix_core::config::ConfigError;
use memoryfix_core::delivery::PreferenceError;
use memoryfix_core::types::{FetchError, ImageError, UnknownGarment};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    /// Missing or invalid client input.
    #[error("{0}")]
    BadRequest(String),
    /// Provider not configured on this deployment.
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    #[error("{0}")]
    NotFound(String),
    /// Request does not fit the session's current stage.
    #[error("{0}")]
    Conflict(String),
    /// Remote result image could not be retrieved.
    #[error("{0}")]
    Upstream(String),
}

impl ApiError {
    pub fn missing(field: &str) -> Self {
        ApiError::BadRequest(format!("missing {field}"))
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let message = e.to_string();
        match e {
            EngineError::Config(e) => ApiError::Configuration(e),
            EngineError::SessionNotFound(_) => ApiError::NotFound(message),
            EngineError::Pipeline(_) | EngineError::NotCompleted(_) => ApiError::Conflict(message),
            EngineError::Delivery(_) => ApiError::Upstream(message),
        }
    }
}

impl From<ImageError> for ApiError {
    fn from(e: ImageError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

/// A client-supplied image URL that cannot be fetched is bad input.
impl From<FetchError> for ApiError {
    fn from(e: FetchError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<UnknownGarment> for ApiError {
    fn from(e: UnknownGarment) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<PreferenceError> for ApiError {
    fn from(e: PreferenceError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            ApiError::Configuration(_) => (StatusCode::INTERNAL_SERVER_ERROR, "configuration_error"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "invalid_transition"),
            ApiError::Upstream(_) => (StatusCode::BAD_GATEWAY, "upstream_error"),
        };
        if status.is_server_error() {
            tracing::error!(code, error = %self, "request failed");
        }

        let body = Json(json!({
            "error": {
                "code": code,
                "message": self.to_string(),
            }
        }));
        (status, body).into_response()
    }
}
