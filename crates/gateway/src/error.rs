use axum::{
    Json,
    http::{StatusCode, header::WWW_AUTHENTICATE},
    response::{IntoResponse, Response},
};
use serde_json::json;
use tagger::TaggerError;

pub const NOT_AUTHENTICATED: &str = "Not authenticated";
pub const BAD_CREDENTIALS: &str = "Incorrect username or password";
pub const INVALID_IMAGE: &str = "Invalid encoded image";
pub const INTERNAL_ERROR: &str = "Internal server error";

/// Errors returned to HTTP clients as `{"detail": ...}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<TaggerError> for ApiError {
    fn from(err: TaggerError) -> Self {
        match err {
            TaggerError::ImageNotFound | TaggerError::ModelNotFound(_) => {
                ApiError::NotFound(err.to_string())
            }
            TaggerError::Engine(source) => {
                tracing::error!(error = %format!("{source:#}"), "Engine failure");
                ApiError::Internal(INTERNAL_ERROR.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "Request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "Request rejected");
        }

        let body = Json(json!({ "detail": self.to_string() }));
        match self {
            ApiError::Unauthorized(_) => {
                (status, [(WWW_AUTHENTICATE, "Basic")], body).into_response()
            }
            _ => (status, body).into_response(),
        }
    }
}
