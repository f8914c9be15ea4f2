//! Tag validation: the closed set of typed `triton.`-prefixed tags and the
//! structurally reserved docker tag namespace.

use serde_json::{Map, Value};

use zonegrid_core::{AppError, AppResult, FieldError};

/// Declared value type of a recognized triton tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TritonTagType {
    /// Plain string value.
    String,
    /// Boolean value.
    Boolean,
}

impl TritonTagType {
    fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Boolean => "boolean",
        }
    }
}

/// Prefix of special tag keys.
pub const TRITON_TAG_PREFIX: &str = "triton.";

/// Docker label namespace that user operations may never touch.
pub const DOCKER_LABEL_PREFIX: &str = "docker:label:com.docker.";

/// Marker tag applied by the docker surface at provision time.
pub const SDC_DOCKER_TAG: &str = "sdc_docker";

const RECOGNIZED_TRITON_TAGS: &[(&str, TritonTagType)] = &[
    ("triton.cns.services", TritonTagType::String),
    ("triton.cns.disable", TritonTagType::Boolean),
    ("triton.cns.reverse_ptr", TritonTagType::String),
    ("triton.cmon.groups", TritonTagType::String),
    (
        "triton.placement.exclude_virtual_servers",
        TritonTagType::Boolean,
    ),
];

/// Returns the declared type of a recognized triton tag key.
#[must_use]
pub fn triton_tag_type(key: &str) -> Option<TritonTagType> {
    RECOGNIZED_TRITON_TAGS
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, tag_type)| *tag_type)
}

/// True for keys in the structurally reserved docker namespace.
#[must_use]
pub fn is_reserved_docker_tag(key: &str) -> bool {
    key == SDC_DOCKER_TAG || key.starts_with(DOCKER_LABEL_PREFIX)
}

/// Validates tag keys and values, collecting one entry per violation.
///
/// Covers scalar-value enforcement, the closed triton set with per-tag value
/// types, and the `triton.cns.services` DNS label list.
#[must_use]
pub fn validate_tag_values(tags: &Map<String, Value>) -> Vec<FieldError> {
    let mut errors = Vec::new();

    for (key, value) in tags {
        if key.is_empty() {
            errors.push(FieldError::invalid("tags", "Tag keys must not be empty"));
            continue;
        }

        if key.starts_with(TRITON_TAG_PREFIX) {
            let Some(tag_type) = triton_tag_type(key) else {
                errors.push(FieldError::invalid(
                    "tags",
                    format!("Unrecognized special triton tag \"{key}\""),
                ));
                continue;
            };

            let matches_type = match tag_type {
                TritonTagType::String => value.is_string(),
                TritonTagType::Boolean => value.is_boolean(),
            };

            if !matches_type {
                errors.push(FieldError::invalid(
                    "tags",
                    format!(
                        "Triton tag \"{key}\" value must be a {}: {} ({})",
                        tag_type.as_str(),
                        display_tag_value(value),
                        json_type_name(value)
                    ),
                ));
                continue;
            }

            if key == "triton.cns.services"
                && let Some(services) = value.as_str()
                && let Some(bad_label) = first_invalid_dns_label(services)
            {
                errors.push(FieldError::invalid(
                    "tags",
                    format!(
                        "invalid \"triton.cns.services\" tag: Expected DNS name but \"{bad_label}\" found."
                    ),
                ));
            }

            continue;
        }

        if !is_scalar(value) {
            errors.push(FieldError::invalid(
                "tags",
                format!("Tag \"{key}\" value must be a string, number or boolean"),
            ));
        }
    }

    errors
}

/// Rejects writes that would create or alter reserved docker tags.
///
/// The docker surface itself sets these keys at provision time; every other
/// path must refuse them.
pub fn ensure_no_reserved_docker_writes(
    tags: &Map<String, Value>,
    docker_provision: bool,
) -> AppResult<()> {
    if docker_provision {
        return Ok(());
    }

    for key in tags.keys() {
        if is_reserved_docker_tag(key) {
            return Err(AppError::validation_message(
                format!("Special tag \"{key}\" not supported"),
                Vec::new(),
            ));
        }
    }

    Ok(())
}

/// Rejects deletion of a reserved docker tag key.
pub fn ensure_tag_deletable(key: &str, vm_is_docker: bool) -> AppResult<()> {
    if !is_reserved_docker_tag(key) {
        return Ok(());
    }

    if vm_is_docker {
        return Err(AppError::validation_message(
            format!("Special tag \"{key}\" may not be deleted"),
            Vec::new(),
        ));
    }

    Err(AppError::validation_message(
        format!("Special tag \"{key}\" not supported"),
        Vec::new(),
    ))
}

/// Full write-path validation: reserved-docker policy plus value rules.
pub fn validate_tag_write(tags: &Map<String, Value>, docker_provision: bool) -> AppResult<()> {
    ensure_no_reserved_docker_writes(tags, docker_provision)?;

    let errors = validate_tag_values(tags);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(AppError::validation(errors))
    }
}

fn is_scalar(value: &Value) -> bool {
    value.is_string() || value.is_number() || value.is_boolean()
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn display_tag_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn first_invalid_dns_label(services: &str) -> Option<&str> {
    services.split(',').find(|label| !is_dns_label(label))
}

fn is_dns_label(label: &str) -> bool {
    if label.is_empty() || label.len() > 63 {
        return false;
    }

    let bytes = label.as_bytes();
    let interior_ok = bytes
        .iter()
        .all(|byte| byte.is_ascii_lowercase() || byte.is_ascii_digit() || *byte == b'-');

    interior_ok && bytes[0] != b'-' && bytes[bytes.len() - 1] != b'-'
}

#[cfg(test)]
mod tests {
    use serde_json::{Map, Value, json};

    use super::{ensure_tag_deletable, validate_tag_values, validate_tag_write};

    fn tag_map(entries: &[(&str, Value)]) -> Map<String, Value> {
        entries
            .iter()
            .map(|(key, value)| ((*key).to_owned(), value.clone()))
            .collect()
    }

    #[test]
    fn unknown_triton_tag_is_rejected() {
        let errors = validate_tag_values(&tag_map(&[("triton.foo", json!(true))]));

        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field.as_deref(), Some("tags"));
        assert_eq!(errors[0].code, "Invalid");
        assert_eq!(
            errors[0].message.as_deref(),
            Some("Unrecognized special triton tag \"triton.foo\"")
        );
    }

    #[test]
    fn triton_tag_type_mismatch_names_expected_and_actual() {
        let errors = validate_tag_values(&tag_map(&[("triton.cns.disable", json!("maybe"))]));

        assert_eq!(
            errors[0].message.as_deref(),
            Some("Triton tag \"triton.cns.disable\" value must be a boolean: maybe (string)")
        );
    }

    #[test]
    fn cns_services_must_be_dns_labels() {
        let errors = validate_tag_values(&tag_map(&[(
            "triton.cns.services",
            json!("web,Bad_Label,db"),
        )]));

        assert_eq!(
            errors[0].message.as_deref(),
            Some(
                "invalid \"triton.cns.services\" tag: Expected DNS name but \"Bad_Label\" found."
            )
        );
    }

    #[test]
    fn valid_cns_services_pass() {
        let errors = validate_tag_values(&tag_map(&[("triton.cns.services", json!("web,db-1"))]));
        assert!(errors.is_empty());
    }

    #[test]
    fn docker_label_write_is_refused_outside_docker_provision() {
        let tags = tag_map(&[
            ("foo", json!("bar")),
            ("docker:label:com.docker.blah", json!("baz")),
        ]);

        let error = validate_tag_write(&tags, false).unwrap_err();
        assert_eq!(
            error.to_string(),
            "Special tag \"docker:label:com.docker.blah\" not supported"
        );

        assert!(validate_tag_write(&tags, true).is_ok());
    }

    #[test]
    fn reserved_tag_deletion_depends_on_vm_kind() {
        let error = ensure_tag_deletable("sdc_docker", true).unwrap_err();
        assert_eq!(
            error.to_string(),
            "Special tag \"sdc_docker\" may not be deleted"
        );

        let error = ensure_tag_deletable("sdc_docker", false).unwrap_err();
        assert_eq!(error.to_string(), "Special tag \"sdc_docker\" not supported");

        assert!(ensure_tag_deletable("role", true).is_ok());
    }

    #[test]
    fn object_tag_values_are_rejected() {
        let errors = validate_tag_values(&tag_map(&[("shape", json!({"deep": true}))]));
        assert_eq!(errors.len(), 1);
    }
}
