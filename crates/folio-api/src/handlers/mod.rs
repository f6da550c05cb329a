pub mod documents;
pub mod health;
pub mod jobs;

use axum::{Json, http::StatusCode, response::IntoResponse};
use folio_common::FolioError;

pub struct ApiError(pub FolioError);

impl From<FolioError> for ApiError {
    fn from(value: FolioError) -> Self {
        Self(value)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0 {
            FolioError::JobNotFound(_) | FolioError::DocumentNotFound(_) => StatusCode::NOT_FOUND,
            FolioError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            FolioError::InvalidTransition { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }

        (
            status,
            Json(serde_json::json!({
                "code": self.0.error_code(),
                "message": self.0.to_string(),
            })),
        )
            .into_response()
    }
}
