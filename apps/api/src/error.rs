use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use zonegrid_core::AppError;

mod types;

pub use types::ErrorResponse;

/// HTTP API error wrapper around core application errors.
#[derive(Debug)]
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(value: AppError) -> Self {
        Self(value)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AppError::ValidationFailed { .. }
            | AppError::UnallocatedVm(_)
            | AppError::VmNotRunning(_)
            | AppError::VmNotStopped(_)
            | AppError::BrandNotSupported(_)
            | AppError::VmWithoutFlexibleDiskSize(_)
            | AppError::InsufficientDiskSpace(_)
            | AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::InvalidParameters { .. } | AppError::UnprocessableEntity(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BucketsNotSetup(_) | AppError::DataVersion(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(ErrorResponse::from(&self.0))).into_response()
    }
}

/// Standard API result type.
pub type ApiResult<T> = Result<T, ApiError>;
