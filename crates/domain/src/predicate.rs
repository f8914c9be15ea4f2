//! The predicate tree shared by structured filters, JSON predicates and
//! LDAP-style query strings.
//!
//! All three query surfaces compile to [`Predicate`]; stores either evaluate
//! it directly (in memory) or translate it to an index query.

use std::cmp::Ordering;

use serde_json::Value;

use zonegrid_core::{AppError, AppResult, FieldError};

/// A compiled filter over the public VM representation.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Field equals value (with scalar coercion).
    Eq(String, Value),
    /// Field is present and differs from value.
    Ne(String, Value),
    /// Field is strictly greater than value.
    Gt(String, Value),
    /// Field is greater than or equal to value.
    Ge(String, Value),
    /// Field is strictly less than value.
    Lt(String, Value),
    /// Field is less than or equal to value.
    Le(String, Value),
    /// String field contains the given substring.
    Substring(String, String),
    /// Field is present with any value.
    Present(String),
    /// All children match.
    And(Vec<Predicate>),
    /// Any child matches.
    Or(Vec<Predicate>),
    /// Child does not match.
    Not(Box<Predicate>),
}

impl Predicate {
    /// Parses the `predicate=` JSON form:
    /// `{eq:[field,value]} | {ne:…} | {gt:…} | {ge:…} | {lt:…} | {le:…}
    /// | {and:[…]} | {or:[…]}`.
    pub fn from_json(value: &Value) -> AppResult<Self> {
        let Some(object) = value.as_object() else {
            return Err(invalid_predicate("predicate must be a JSON object"));
        };

        if object.len() != 1 {
            return Err(invalid_predicate(
                "predicate objects must have exactly one operator key",
            ));
        }

        let (operator, operand) = match object.iter().next() {
            Some(entry) => entry,
            None => return Err(invalid_predicate("predicate must not be empty")),
        };

        match operator.as_str() {
            "and" | "or" => {
                let Some(children) = operand.as_array() else {
                    return Err(invalid_predicate(format!(
                        "\"{operator}\" operand must be an array of predicates"
                    )));
                };

                if children.is_empty() {
                    return Err(invalid_predicate(format!(
                        "\"{operator}\" operand must not be empty"
                    )));
                }

                let parsed = children
                    .iter()
                    .map(Self::from_json)
                    .collect::<AppResult<Vec<_>>>()?;

                Ok(if operator == "and" {
                    Self::And(parsed)
                } else {
                    Self::Or(parsed)
                })
            }
            "eq" | "ne" | "gt" | "ge" | "lt" | "le" => {
                let (field, value) = comparison_operand(operator, operand)?;
                Ok(match operator.as_str() {
                    "eq" => Self::Eq(field, value),
                    "ne" => Self::Ne(field, value),
                    "gt" => Self::Gt(field, value),
                    "ge" => Self::Ge(field, value),
                    "lt" => Self::Lt(field, value),
                    _ => Self::Le(field, value),
                })
            }
            other => Err(invalid_predicate(format!(
                "unknown predicate operator \"{other}\""
            ))),
        }
    }

    /// Evaluates this predicate against a public VM value.
    #[must_use]
    pub fn matches(&self, vm: &Value) -> bool {
        match self {
            Self::Eq(field, expected) => {
                resolve_field(vm, field).is_some_and(|stored| values_equal(stored, expected))
            }
            Self::Ne(field, expected) => {
                resolve_field(vm, field).is_some_and(|stored| !values_equal(stored, expected))
            }
            Self::Gt(field, expected) => ordering_matches(vm, field, expected, Ordering::is_gt),
            Self::Ge(field, expected) => ordering_matches(vm, field, expected, Ordering::is_ge),
            Self::Lt(field, expected) => ordering_matches(vm, field, expected, Ordering::is_lt),
            Self::Le(field, expected) => ordering_matches(vm, field, expected, Ordering::is_le),
            Self::Substring(field, needle) => resolve_field(vm, field)
                .and_then(Value::as_str)
                .is_some_and(|stored| stored.contains(needle.as_str())),
            Self::Present(field) => {
                resolve_field(vm, field).is_some_and(|stored| !stored.is_null())
            }
            Self::And(children) => children.iter().all(|child| child.matches(vm)),
            Self::Or(children) => children.iter().any(|child| child.matches(vm)),
            Self::Not(child) => !child.matches(vm),
        }
    }
}

/// Builds the `state=active` shortcut: neither destroyed nor failed.
#[must_use]
pub fn active_state_predicate() -> Predicate {
    Predicate::And(vec![
        Predicate::Ne("state".to_owned(), Value::from("destroyed")),
        Predicate::Ne("state".to_owned(), Value::from("failed")),
    ])
}

fn comparison_operand(operator: &str, operand: &Value) -> AppResult<(String, Value)> {
    let Some(pair) = operand.as_array().filter(|entries| entries.len() == 2) else {
        return Err(invalid_predicate(format!(
            "\"{operator}\" operand must be a [field, value] pair"
        )));
    };

    let Some(field) = pair[0].as_str().filter(|name| !name.is_empty()) else {
        return Err(invalid_predicate(format!(
            "\"{operator}\" field must be a non-empty string"
        )));
    };

    Ok((field.to_owned(), pair[1].clone()))
}

fn invalid_predicate(message: impl Into<String>) -> AppError {
    AppError::validation(vec![FieldError::invalid("predicate", message)])
}

/// Resolves a predicate field against the public VM value. `tag.<key>`
/// addresses the tag collection; anything else is a top-level field.
fn resolve_field<'a>(vm: &'a Value, field: &str) -> Option<&'a Value> {
    if let Some(key) = field.strip_prefix("tag.") {
        return vm.get("tags").and_then(|tags| tags.get(key));
    }

    vm.get(field)
}

fn ordering_matches(
    vm: &Value,
    field: &str,
    expected: &Value,
    accept: fn(Ordering) -> bool,
) -> bool {
    resolve_field(vm, field)
        .and_then(|stored| compare_values(stored, expected))
        .is_some_and(accept)
}

/// Scalar equality with coercion: query parameters arrive as strings even
/// for numeric and boolean fields.
fn values_equal(stored: &Value, expected: &Value) -> bool {
    if stored == expected {
        return true;
    }

    match (stored, expected) {
        (Value::Number(_), Value::String(raw)) => raw
            .parse::<f64>()
            .ok()
            .zip(stored.as_f64())
            .is_some_and(|(parsed, number)| parsed == number),
        (Value::Bool(stored_bool), Value::String(raw)) => raw
            .parse::<bool>()
            .ok()
            .is_some_and(|parsed| parsed == *stored_bool),
        (Value::String(_), Value::Number(_)) => values_equal(expected, stored),
        _ => false,
    }
}

fn compare_values(stored: &Value, expected: &Value) -> Option<Ordering> {
    if let (Some(left), Some(right)) = (stored.as_f64(), coerce_f64(expected)) {
        return left.partial_cmp(&right);
    }

    match (stored, expected) {
        (Value::String(left), Value::String(right)) => Some(left.as_str().cmp(right.as_str())),
        _ => None,
    }
}

fn coerce_f64(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|raw| raw.parse::<f64>().ok()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Predicate, active_state_predicate};

    fn sample_vm() -> serde_json::Value {
        json!({
            "uuid": "5e7c09a4-9e41-4f90-8e2f-6a355a4aa9aa",
            "state": "running",
            "ram": 256,
            "alias": "web0",
            "tags": {"smartdc_type": "core", "role": "database"},
        })
    }

    #[test]
    fn parses_and_evaluates_comparison_tree() {
        let predicate = Predicate::from_json(&json!({
            "and": [
                {"ge": ["ram", 128]},
                {"eq": ["state", "running"]},
            ]
        }))
        .unwrap();

        assert!(predicate.matches(&sample_vm()));

        let predicate = Predicate::from_json(&json!({"gt": ["ram", 256]})).unwrap();
        assert!(!predicate.matches(&sample_vm()));
    }

    #[test]
    fn string_number_coercion_applies_both_ways() {
        let predicate = Predicate::Eq("ram".to_owned(), json!("256"));
        assert!(predicate.matches(&sample_vm()));

        let predicate = Predicate::Ge("ram".to_owned(), json!("300"));
        assert!(!predicate.matches(&sample_vm()));
    }

    #[test]
    fn tag_fields_resolve_into_the_tag_collection() {
        let predicate = Predicate::Eq("tag.smartdc_type".to_owned(), json!("core"));
        assert!(predicate.matches(&sample_vm()));

        let predicate = Predicate::Eq("tag.missing".to_owned(), json!("core"));
        assert!(!predicate.matches(&sample_vm()));
    }

    #[test]
    fn ne_requires_the_field_to_be_present() {
        let predicate = Predicate::Ne("server_uuid".to_owned(), json!("x"));
        assert!(!predicate.matches(&sample_vm()));
    }

    #[test]
    fn active_shortcut_excludes_destroyed_and_failed() {
        let active = active_state_predicate();

        assert!(active.matches(&sample_vm()));
        assert!(!active.matches(&json!({"state": "destroyed"})));
        assert!(!active.matches(&json!({"state": "failed"})));
    }

    #[test]
    fn rejects_malformed_operator_shapes() {
        assert!(Predicate::from_json(&json!({"between": ["ram", 1, 2]})).is_err());
        assert!(Predicate::from_json(&json!({"eq": ["ram"]})).is_err());
        assert!(Predicate::from_json(&json!({"and": []})).is_err());
        assert!(Predicate::from_json(&json!(["eq", "ram", 1])).is_err());
    }
}
