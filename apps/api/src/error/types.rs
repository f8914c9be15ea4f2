use serde::Serialize;
use zonegrid_core::{AppError, FieldError};

/// API error payload: `{code, message, errors?}`.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    errors: Option<Vec<FieldError>>,
}

impl From<&AppError> for ErrorResponse {
    fn from(error: &AppError) -> Self {
        Self {
            code: error.code().to_owned(),
            message: error.to_string(),
            errors: error.field_errors().map(<[FieldError]>::to_vec),
        }
    }
}
