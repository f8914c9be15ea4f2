use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use zonegrid_core::{AppError, AppResult, FieldError};

/// Placement affinity hint supplied at provision time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locality {
    /// Whether the hint is a hard requirement.
    #[serde(default)]
    pub strict: bool,
    /// VMs the new instance should land near.
    #[serde(default)]
    pub near: Vec<Uuid>,
    /// VMs the new instance should land away from.
    #[serde(default)]
    pub far: Vec<Uuid>,
}

impl Locality {
    /// Parses the request form: `near`/`far` each accept a UUID string or an
    /// array of them.
    pub fn from_value(value: &Value) -> AppResult<Self> {
        let Some(object) = value.as_object() else {
            return Err(AppError::validation(vec![FieldError::invalid(
                "locality",
                "locality must be an object",
            )]));
        };

        let strict = object.get("strict").and_then(Value::as_bool).unwrap_or(false);
        let near = parse_uuid_list(object.get("near"))?;
        let far = parse_uuid_list(object.get("far"))?;

        Ok(Self { strict, near, far })
    }
}

fn parse_uuid_list(value: Option<&Value>) -> AppResult<Vec<Uuid>> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };

    let raw_entries: Vec<&Value> = match value {
        Value::Array(entries) => entries.iter().collect(),
        single => vec![single],
    };

    raw_entries
        .into_iter()
        .map(|entry| {
            entry
                .as_str()
                .and_then(|raw| Uuid::parse_str(raw).ok())
                .ok_or_else(malformed_uuid_error)
        })
        .collect()
}

fn malformed_uuid_error() -> AppError {
    AppError::validation(vec![FieldError::invalid(
        "locality",
        "locality contains malformed UUID",
    )])
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::Locality;

    #[test]
    fn accepts_single_uuid_or_array() {
        let locality = Locality::from_value(&json!({
            "strict": true,
            "near": "5e7c09a4-9e41-4f90-8e2f-6a355a4aa9aa",
            "far": ["930896af-bf8c-48d4-885c-6573a94b1853"],
        }))
        .unwrap();

        assert!(locality.strict);
        assert_eq!(locality.near.len(), 1);
        assert_eq!(locality.far.len(), 1);
    }

    #[test]
    fn malformed_uuid_is_reported_on_the_locality_field() {
        let error = Locality::from_value(&json!({"near": ["nope"]})).unwrap_err();
        let entries = error.field_errors().unwrap();

        assert_eq!(entries[0].field.as_deref(), Some("locality"));
        assert_eq!(entries[0].code, "Invalid");
        assert_eq!(
            entries[0].message.as_deref(),
            Some("locality contains malformed UUID")
        );
    }

    #[test]
    fn non_object_locality_is_rejected() {
        assert!(Locality::from_value(&json!("near")).is_err());
    }
}
