//! Shared primitives for all Rust crates in zonegrid.

#![forbid(unsafe_code)]

/// Caller context propagated from the HTTP edge into workflow parameters.
pub mod context;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use context::{Caller, RequestContext, RequestId};

/// Result type used across zonegrid crates.
pub type AppResult<T> = Result<T, AppError>;

/// One entry of an error's `errors[]` array.
///
/// Most entries carry `field`/`code`/`message`. Rejections attributed to an
/// external resource (an IP owned by another zone) carry `type`/`id` instead
/// of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Offending parameter name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Stable per-field error code (`Missing`, `Invalid`, `UsedBy`, ...).
    pub code: String,
    /// Human-readable detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Kind of external resource that caused the rejection.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    /// Identifier of the external resource that caused the rejection.
    #[serde(rename = "id", skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
}

impl FieldError {
    /// Creates a `Missing` entry for a required parameter.
    #[must_use]
    pub fn missing(field: impl Into<String>) -> Self {
        Self {
            field: Some(field.into()),
            code: "Missing".to_owned(),
            message: Some("Missing field".to_owned()),
            resource_type: None,
            resource_id: None,
        }
    }

    /// Creates an `Invalid` entry with a detail message.
    #[must_use]
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: Some(field.into()),
            code: "Invalid".to_owned(),
            message: Some(message.into()),
            resource_type: None,
            resource_id: None,
        }
    }

    /// Creates an entry with an explicit per-field code.
    #[must_use]
    pub fn with_code(
        field: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            field: Some(field.into()),
            code: code.into(),
            message: Some(message.into()),
            resource_type: None,
            resource_id: None,
        }
    }

    /// Creates a `UsedBy` entry attributing a parameter to an owning resource.
    #[must_use]
    pub fn used_by(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        Self {
            field: Some(field.into()),
            code: "UsedBy".to_owned(),
            message: None,
            resource_type: Some(resource_type.into()),
            resource_id: Some(resource_id.into()),
        }
    }
}

/// Application error taxonomy.
///
/// Every variant maps to a stable wire `code` and HTTP status; bodies are
/// always `{code, message, errors?}`.
#[derive(Debug, Error)]
pub enum AppError {
    /// A parameter violates a schema rule.
    #[error("{message}")]
    ValidationFailed {
        /// Summary of the failure.
        message: String,
        /// Per-field breakdown.
        errors: Vec<FieldError>,
    },

    /// A reference was rejected by an external service (e.g. an IP in use).
    #[error("{message}")]
    InvalidParameters {
        /// Summary of the rejection.
        message: String,
        /// Per-field breakdown.
        errors: Vec<FieldError>,
    },

    /// A referenced network or pool does not exist.
    #[error("{0}")]
    UnprocessableEntity(String),

    /// Requested resource does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Action targets a VM that never provisioned onto a server.
    #[error("{0}")]
    UnallocatedVm(String),

    /// Action requires the VM to be running.
    #[error("{0}")]
    VmNotRunning(String),

    /// Action requires the VM to be stopped.
    #[error("{0}")]
    VmNotStopped(String),

    /// Action is not available for the VM's brand.
    #[error("{0}")]
    BrandNotSupported(String),

    /// Disk operation requires the flexible-disk package attribute.
    #[error("{0}")]
    VmWithoutFlexibleDiskSize(String),

    /// Disk operation exceeds the package disk envelope.
    #[error("{0}")]
    InsufficientDiskSpace(String),

    /// Persistent store buckets are not initialized yet.
    #[error("{0}")]
    BucketsNotSetup(String),

    /// A data schema migration is still pending.
    #[error("{0}")]
    DataVersion(String),

    /// Write operation lost an optimistic-concurrency race.
    #[error("{0}")]
    Conflict(String),

    /// Internal unexpected error.
    #[error("{0}")]
    Internal(String),
}

impl AppError {
    /// Creates a `ValidationFailed` error with a per-field breakdown.
    #[must_use]
    pub fn validation(errors: Vec<FieldError>) -> Self {
        Self::ValidationFailed {
            message: "Invalid VM parameters".to_owned(),
            errors,
        }
    }

    /// Creates a `ValidationFailed` error with an explicit message.
    #[must_use]
    pub fn validation_message(message: impl Into<String>, errors: Vec<FieldError>) -> Self {
        Self::ValidationFailed {
            message: message.into(),
            errors,
        }
    }

    /// Creates an `InvalidParameters` error with a per-field breakdown.
    #[must_use]
    pub fn invalid_parameters(errors: Vec<FieldError>) -> Self {
        Self::InvalidParameters {
            message: "Invalid parameters".to_owned(),
            errors,
        }
    }

    /// Returns the stable wire code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ValidationFailed { .. } | Self::Conflict(_) => "ValidationFailed",
            Self::InvalidParameters { .. } => "InvalidParameters",
            Self::UnprocessableEntity(_) => "UnprocessableEntityError",
            Self::NotFound(_) => "ResourceNotFound",
            Self::UnallocatedVm(_) => "UnallocatedVM",
            Self::VmNotRunning(_) => "VmNotRunning",
            Self::VmNotStopped(_) => "VmNotStopped",
            Self::BrandNotSupported(_) => "BrandNotSupported",
            Self::VmWithoutFlexibleDiskSize(_) => "VmWithoutFlexibleDiskSize",
            Self::InsufficientDiskSpace(_) => "InsufficientDiskSpace",
            Self::BucketsNotSetup(_) => "MorayBucketsNotSetup",
            Self::DataVersion(_) => "DataVersion",
            Self::Internal(_) => "InternalError",
        }
    }

    /// Returns the per-field breakdown when this error carries one.
    #[must_use]
    pub fn field_errors(&self) -> Option<&[FieldError]> {
        match self {
            Self::ValidationFailed { errors, .. } | Self::InvalidParameters { errors, .. } => {
                (!errors.is_empty()).then_some(errors.as_slice())
            }
            _ => None,
        }
    }
}
