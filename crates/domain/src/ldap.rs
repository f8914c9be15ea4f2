//! LDAP-style query string compilation.
//!
//! `query=` carries filters like `(&(ram>=128)(tags=*-smartdc_type=core-*))`.
//! The parser produces the same [`Predicate`] tree as the JSON predicate
//! surface. Tag matching uses the flattened `tags=*-<key>=<value>-*`
//! convention of the indexed store.

use nom::IResult;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while, take_while1};
use nom::character::complete::char;
use nom::combinator::{all_consuming, map, map_res};
use nom::multi::many1;
use nom::sequence::{delimited, pair, preceded};
use serde_json::Value;

use crate::predicate::Predicate;

/// Parses an LDAP-style filter string into a predicate tree, returning a
/// human-readable reason on failure.
pub fn parse_ldap_filter(input: &str) -> Result<Predicate, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("query filter must not be empty".to_owned());
    }

    let (_, predicate) = all_consuming(filter)(trimmed).map_err(|error| match error {
        nom::Err::Error(inner) | nom::Err::Failure(inner) => {
            let at = inner.input.trim();
            if at.is_empty() {
                "query filter ended inside an expression".to_owned()
            } else {
                format!("unexpected text at \"{at}\"")
            }
        }
        nom::Err::Incomplete(_) => "query filter is incomplete".to_owned(),
    })?;

    Ok(predicate)
}

fn filter(input: &str) -> IResult<&str, Predicate> {
    delimited(
        char('('),
        alt((and_expression, or_expression, not_expression, item)),
        char(')'),
    )(input)
}

fn and_expression(input: &str) -> IResult<&str, Predicate> {
    map(preceded(char('&'), many1(filter)), Predicate::And)(input)
}

fn or_expression(input: &str) -> IResult<&str, Predicate> {
    map(preceded(char('|'), many1(filter)), Predicate::Or)(input)
}

fn not_expression(input: &str) -> IResult<&str, Predicate> {
    map(preceded(char('!'), filter), |child| {
        Predicate::Not(Box::new(child))
    })(input)
}

fn attribute(input: &str) -> IResult<&str, &str> {
    take_while1(|character: char| {
        character.is_ascii_alphanumeric() || matches!(character, '_' | '-' | '.')
    })(input)
}

fn comparison_value(input: &str) -> IResult<&str, &str> {
    take_while(|character: char| character != ')' && character != '(')(input)
}

fn operator(input: &str) -> IResult<&str, &str> {
    alt((tag(">="), tag("<="), tag("=")))(input)
}

fn item(input: &str) -> IResult<&str, Predicate> {
    map_res(
        pair(attribute, pair(operator, comparison_value)),
        |(field, (op, raw))| build_item(field, op, raw),
    )(input)
}

fn build_item(field: &str, op: &str, raw: &str) -> Result<Predicate, ()> {
    if raw.is_empty() {
        return Err(());
    }

    if field == "tags" {
        if op != "=" {
            return Err(());
        }
        let (key, value) = parse_tag_convention(raw).ok_or(())?;
        return Ok(Predicate::Eq(format!("tag.{key}"), Value::from(value)));
    }

    let value = Value::from(raw.to_owned());

    Ok(match op {
        ">=" => Predicate::Ge(field.to_owned(), value),
        "<=" => Predicate::Le(field.to_owned(), value),
        _ => {
            if raw == "*" {
                Predicate::Present(field.to_owned())
            } else if raw.starts_with('*') && raw.ends_with('*') && raw.len() > 2 {
                Predicate::Substring(field.to_owned(), raw[1..raw.len() - 1].to_owned())
            } else {
                Predicate::Eq(field.to_owned(), value)
            }
        }
    })
}

/// `*-<key>=<value>-*` → `(key, value)`.
fn parse_tag_convention(raw: &str) -> Option<(String, String)> {
    let inner = raw.strip_prefix("*-")?.strip_suffix("-*")?;
    let (key, value) = inner.split_once('=')?;
    if key.is_empty() {
        return None;
    }
    Some((key.to_owned(), value.to_owned()))
}
