//! Protocol errors and their HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Per-request failures. None of these affect the run as a whole.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("could not parse request: {0}")]
    Parse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("could not plan uploaded pipeline: {0}")]
    UploadPlan(String),
}

impl ProtocolError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProtocolError::Parse(_) => StatusCode::BAD_REQUEST,
            ProtocolError::NotFound(_) => StatusCode::NOT_FOUND,
            ProtocolError::UploadPlan(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error body in the shape the agent logs: `{"message": "..."}`
#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

impl IntoResponse for ProtocolError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        tracing::debug!(%status, error = %self, "request failed");
        (
            status,
            Json(ErrorBody {
                message: self.to_string(),
            }),
        )
            .into_response()
    }
}
