//! Request identity and caller context shared between the HTTP edge and
//! workflow parameters.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{AppError, AppResult};

/// Identity of the party that issued a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    /// Caller kind (`signature`, `token`, `operator`, ...).
    #[serde(rename = "type")]
    pub caller_type: String,
    /// Source address recorded at the edge.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// SSH key fingerprint for signature callers.
    #[serde(rename = "keyId", skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
}

impl Caller {
    /// Caller recorded when no `x-context` header was supplied.
    #[must_use]
    pub fn unknown() -> Self {
        Self {
            caller_type: "unknown".to_owned(),
            ip: None,
            key_id: None,
        }
    }
}

/// Context carried by the `x-context` header and recorded on every job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Caller identity at API time.
    pub caller: Caller,
    /// Original request parameters as seen at the edge.
    #[serde(default)]
    pub params: Value,
}

impl RequestContext {
    /// Parses the JSON value of an `x-context` header.
    pub fn from_header(raw: &str) -> AppResult<Self> {
        serde_json::from_str(raw)
            .map_err(|error| AppError::Internal(format!("malformed x-context header: {error}")))
    }

    /// Context recorded when no `x-context` header was supplied.
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            caller: Caller::unknown(),
            params: Value::Null,
        }
    }
}

/// Request correlation identifier assigned at the edge and propagated to
/// every outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Creates a fresh request identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses an incoming `x-request-id` header value, assigning a fresh id
    /// when the value is not a UUID.
    #[must_use]
    pub fn from_header(raw: Option<&str>) -> Self {
        raw.and_then(|value| Uuid::parse_str(value.trim()).ok())
            .map_or_else(Self::new, Self)
    }

    /// Returns the underlying UUID value.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RequestId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}", self.0)
    }
}
