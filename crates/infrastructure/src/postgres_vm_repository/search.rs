//! Predicate-to-SQL compilation over the indexed VM columns.
//!
//! The same predicate tree the in-memory store evaluates directly compiles
//! here to a parameterized WHERE clause: indexed fields hit their columns,
//! `tag.<key>` hits the flattened tags JSONB, everything else falls back to
//! the record JSONB. All values bind as text and cast in SQL.

use serde_json::Value;

use zonegrid_core::{AppError, AppResult};
use zonegrid_domain::Predicate;

/// A compiled WHERE clause with its positional binds.
pub(super) struct SqlFilter {
    pub clause: String,
    pub binds: Vec<String>,
}

/// Compiles a predicate tree; bind placeholders start at `$1`.
pub(super) fn compile_predicate(predicate: &Predicate) -> AppResult<SqlFilter> {
    let mut binds = Vec::new();
    let clause = compile(predicate, &mut binds)?;
    Ok(SqlFilter { clause, binds })
}

/// Maps a sort field to a SQL expression. Unknown fields sort through the
/// record JSONB; field names are restricted to identifier characters.
pub(super) fn sort_expression(field: &str) -> AppResult<String> {
    if !field
        .chars()
        .all(|character| character.is_ascii_alphanumeric() || matches!(character, '_' | '.'))
    {
        return Err(AppError::Internal(format!(
            "unsortable field name: {field}"
        )));
    }

    Ok(match field {
        "uuid" | "owner_uuid" | "brand" | "state" | "alias" | "ram" | "server_uuid"
        | "billing_id" | "create_timestamp" => field.to_owned(),
        _ => format!("data->>'{field}'"),
    })
}

fn compile(predicate: &Predicate, binds: &mut Vec<String>) -> AppResult<String> {
    match predicate {
        Predicate::And(children) => combine(children, " AND ", binds),
        Predicate::Or(children) => combine(children, " OR ", binds),
        Predicate::Not(child) => Ok(format!("NOT ({})", compile(child, binds)?)),
        Predicate::Eq(field, value) => comparison(field, "=", value, binds),
        Predicate::Ne(field, value) => {
            let inner = comparison(field, "=", value, binds)?;
            let present = presence(field, binds);
            Ok(format!("({present} AND NOT ({inner}))"))
        }
        Predicate::Gt(field, value) => comparison(field, ">", value, binds),
        Predicate::Ge(field, value) => comparison(field, ">=", value, binds),
        Predicate::Lt(field, value) => comparison(field, "<", value, binds),
        Predicate::Le(field, value) => comparison(field, "<=", value, binds),
        Predicate::Substring(field, needle) => {
            let expression = text_expression(field, binds);
            let placeholder = push(binds, format!("%{needle}%"));
            Ok(format!("{expression} LIKE {placeholder}"))
        }
        Predicate::Present(field) => Ok(presence(field, binds)),
    }
}

fn combine(children: &[Predicate], joiner: &str, binds: &mut Vec<String>) -> AppResult<String> {
    let compiled = children
        .iter()
        .map(|child| compile(child, binds))
        .collect::<AppResult<Vec<_>>>()?;
    Ok(format!("({})", compiled.join(joiner)))
}

fn comparison(
    field: &str,
    operator: &str,
    value: &Value,
    binds: &mut Vec<String>,
) -> AppResult<String> {
    let raw = scalar_text(value).ok_or_else(|| {
        AppError::Internal(format!("unsupported filter value for field {field}"))
    })?;

    Ok(match field {
        "ram" => {
            let placeholder = push(binds, raw);
            format!("ram {operator} ({placeholder})::bigint")
        }
        "create_timestamp" => {
            let placeholder = push(binds, raw);
            format!("create_timestamp {operator} ({placeholder})::timestamptz")
        }
        "uuid" | "owner_uuid" | "server_uuid" | "billing_id" => {
            let placeholder = push(binds, raw);
            format!("{field}::text {operator} {placeholder}")
        }
        "state" | "alias" | "brand" => {
            let placeholder = push(binds, raw);
            format!("{field} {operator} {placeholder}")
        }
        _ => {
            let expression = text_expression(field, binds);
            let ordering = matches!(operator, ">" | ">=" | "<" | "<=");
            if ordering && raw.parse::<f64>().is_ok() {
                let placeholder = push(binds, raw);
                format!("({expression})::numeric {operator} ({placeholder})::numeric")
            } else {
                let placeholder = push(binds, raw);
                format!("{expression} {operator} {placeholder}")
            }
        }
    })
}

/// Text expression for a non-column field: `tag.<key>` hits the flattened
/// tags object, anything else the record JSONB. Key and field names bind as
/// parameters.
fn text_expression(field: &str, binds: &mut Vec<String>) -> String {
    if let Some(key) = field.strip_prefix("tag.") {
        let placeholder = push(binds, key.to_owned());
        format!("tags->>({placeholder})")
    } else {
        let placeholder = push(binds, field.to_owned());
        format!("data->>({placeholder})")
    }
}

fn presence(field: &str, binds: &mut Vec<String>) -> String {
    match field {
        "uuid" | "owner_uuid" | "server_uuid" | "billing_id" | "state" | "alias" | "brand"
        | "ram" | "create_timestamp" => format!("{field} IS NOT NULL"),
        _ => {
            let expression = text_expression(field, binds);
            format!("{expression} IS NOT NULL")
        }
    }
}

fn push(binds: &mut Vec<String>, value: String) -> String {
    binds.push(value);
    format!("${}", binds.len())
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}
