use crate::analytics::AnalyticsError;
use crate::decode::DecodeError;
use crate::inference::InferenceError;
use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use super::LOG_TARGET;

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("malformed upload: {0}")]
    Multipart(#[from] MultipartError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    Analytics(#[from] AnalyticsError),
}

impl From<DecodeError> for ApiError {
    fn from(e: DecodeError) -> Self {
        match e {
            DecodeError::UnsupportedFormat(_) => ApiError::BadRequest(e.to_string()),
            other => ApiError::Inference(other.into()),
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Multipart(e) => e.status(),
            ApiError::Inference(InferenceError::Decode(DecodeError::UnsupportedFormat(_))) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Inference(e) if e.is_invalid_audio() => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Inference(_) | ApiError::Analytics(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(target: LOG_TARGET, status = status.as_u16(), error = %self, "request failed");
        } else {
            tracing::warn!(target: LOG_TARGET, status = status.as_u16(), error = %self, "request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
