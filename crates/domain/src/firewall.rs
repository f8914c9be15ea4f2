//! Firewall rule records and the rule DSL.
//!
//! A rule string reads `FROM <targets> TO <targets> ALLOW|BLOCK <protocol>
//! <ports>`; keywords are case-insensitive and target lists are
//! parenthesized `OR` chains.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use nom::IResult;
use nom::branch::alt;
use nom::bytes::complete::{tag_no_case, take_while1};
use nom::character::complete::{char, multispace0, multispace1};
use nom::combinator::{all_consuming, map, map_res, opt};
use nom::multi::separated_list1;
use nom::sequence::{delimited, pair, preceded, tuple};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use zonegrid_core::FieldError;

/// A firewall rule scoped to an owner and referenced by VMs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    /// Rule identifier.
    pub uuid: Uuid,
    /// Rule DSL text.
    pub rule: String,
    /// Owning account.
    pub owner_uuid: Uuid,
    /// Whether the rule is applied.
    pub enabled: bool,
    /// Data-center-global flag; never accepted from this surface.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global: Option<bool>,
}

/// One endpoint selector of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleTarget {
    /// Any address.
    Any,
    /// Every VM of the rule owner.
    AllVms,
    /// A literal IPv4 address.
    Ip(Ipv4Addr),
    /// An IPv4 subnet.
    Subnet(Ipv4Net),
    /// VMs carrying a tag, optionally constrained to a value.
    Tag {
        /// Tag key.
        key: String,
        /// Optional required value.
        value: Option<String>,
    },
    /// A single VM.
    Vm(Uuid),
}

/// Rule verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    /// Permit matching traffic.
    Allow,
    /// Drop matching traffic.
    Block,
}

/// Transport selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleProtocol {
    /// TCP traffic.
    Tcp,
    /// UDP traffic.
    Udp,
    /// ICMP traffic.
    Icmp,
}

/// Port clause of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RulePorts {
    /// Every port.
    All,
    /// An explicit port list.
    Ports(Vec<u16>),
    /// ICMP type/code selector.
    IcmpType {
        /// ICMP message type.
        icmp_type: u8,
        /// Optional ICMP code.
        code: Option<u8>,
    },
}

/// Structured form of a parsed rule string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRule {
    /// Source selectors.
    pub from: Vec<RuleTarget>,
    /// Destination selectors.
    pub to: Vec<RuleTarget>,
    /// Verdict.
    pub action: RuleAction,
    /// Transport.
    pub protocol: RuleProtocol,
    /// Port clause.
    pub ports: RulePorts,
}

/// Parses a rule string, returning a human-readable reason on failure.
pub fn parse_rule(input: &str) -> Result<ParsedRule, String> {
    let (_, parsed) = all_consuming(rule_body)(input).map_err(|error| match error {
        nom::Err::Error(inner) | nom::Err::Failure(inner) => {
            let at = inner.input.trim();
            if at.is_empty() {
                "rule ended before a complete FROM/TO/action clause".to_owned()
            } else {
                format!("unexpected text at \"{at}\"")
            }
        }
        nom::Err::Incomplete(_) => "rule is incomplete".to_owned(),
    })?;

    match (parsed.protocol, &parsed.ports) {
        (RuleProtocol::Icmp, RulePorts::Ports(_)) => {
            Err("icmp rules take a TYPE clause, not ports".to_owned())
        }
        (RuleProtocol::Tcp | RuleProtocol::Udp, RulePorts::IcmpType { .. }) => {
            Err(format!(
                "{} rules take a PORT clause, not an icmp TYPE",
                match parsed.protocol {
                    RuleProtocol::Tcp => "tcp",
                    _ => "udp",
                }
            ))
        }
        _ => Ok(parsed),
    }
}

/// Validates a `firewall_rules` request value, collecting one entry per
/// violation.
#[must_use]
pub fn validate_firewall_rules(value: &Value) -> Vec<FieldError> {
    let Some(rules) = value.as_array() else {
        return vec![FieldError::invalid(
            "firewall_rules",
            "firewall_rules must be an array of objects",
        )];
    };

    let mut errors = Vec::new();

    for (index, entry) in rules.iter().enumerate() {
        let Some(rule) = entry.as_object() else {
            errors.push(FieldError::invalid(
                "firewall_rules",
                format!("firewall_rules[{index}] must be an object"),
            ));
            continue;
        };

        for required in ["uuid", "owner_uuid"] {
            match rule.get(required).and_then(Value::as_str) {
                Some(raw) if Uuid::parse_str(raw).is_ok() => {}
                Some(raw) => errors.push(FieldError::invalid(
                    "firewall_rules",
                    format!("firewall_rules[{index}].{required} is not a UUID: {raw}"),
                )),
                None => errors.push(FieldError::invalid(
                    "firewall_rules",
                    format!("firewall_rules[{index}].{required} is required"),
                )),
            }
        }

        match rule.get("enabled") {
            Some(Value::Bool(_)) => {}
            _ => errors.push(FieldError::invalid(
                "firewall_rules",
                format!("firewall_rules[{index}].enabled must be a boolean"),
            )),
        }

        if rule.get("global").and_then(Value::as_bool) == Some(true) {
            errors.push(FieldError::invalid(
                "firewall_rules",
                format!("Invalid rule: firewall_rules[{index}] may not be global"),
            ));
        }

        match rule.get("rule").and_then(Value::as_str) {
            Some(text) => {
                if let Err(reason) = parse_rule(text) {
                    errors.push(FieldError::invalid(
                        "firewall_rules",
                        format!("Invalid rule: {reason}"),
                    ));
                }
            }
            None => errors.push(FieldError::invalid(
                "firewall_rules",
                format!("firewall_rules[{index}].rule is required"),
            )),
        }
    }

    errors
}

fn word(input: &str) -> IResult<&str, &str> {
    take_while1(|character: char| {
        character.is_ascii_alphanumeric() || matches!(character, '-' | '_' | '.' | '/' | ':')
    })(input)
}

fn port_number(input: &str) -> IResult<&str, u16> {
    map_res(
        take_while1(|character: char| character.is_ascii_digit()),
        |digits: &str| {
            let port = digits.parse::<u16>().map_err(|_| ())?;
            if port == 0 { Err(()) } else { Ok(port) }
        },
    )(input)
}

fn icmp_number(input: &str) -> IResult<&str, u8> {
    map_res(
        take_while1(|character: char| character.is_ascii_digit()),
        |digits: &str| digits.parse::<u8>(),
    )(input)
}

fn target(input: &str) -> IResult<&str, RuleTarget> {
    alt((
        map(
            tuple((tag_no_case("all"), multispace1, tag_no_case("vms"))),
            |_| RuleTarget::AllVms,
        ),
        map(tag_no_case("any"), |_| RuleTarget::Any),
        map_res(
            preceded(pair(tag_no_case("ip"), multispace1), word),
            |raw: &str| raw.parse::<Ipv4Addr>().map(RuleTarget::Ip),
        ),
        map_res(
            preceded(pair(tag_no_case("subnet"), multispace1), word),
            |raw: &str| raw.parse::<Ipv4Net>().map(RuleTarget::Subnet),
        ),
        map_res(
            preceded(pair(tag_no_case("vm"), multispace1), word),
            |raw: &str| Uuid::parse_str(raw).map(RuleTarget::Vm),
        ),
        map(
            preceded(
                pair(tag_no_case("tag"), multispace1),
                pair(word, opt(preceded(char('='), word))),
            ),
            |(key, value): (&str, Option<&str>)| RuleTarget::Tag {
                key: key.to_owned(),
                value: value.map(str::to_owned),
            },
        ),
    ))(input)
}

fn targets(input: &str) -> IResult<&str, Vec<RuleTarget>> {
    alt((
        delimited(
            pair(char('('), multispace0),
            separated_list1(
                delimited(multispace1, tag_no_case("or"), multispace1),
                target,
            ),
            pair(multispace0, char(')')),
        ),
        map(target, |single| vec![single]),
    ))(input)
}

fn action(input: &str) -> IResult<&str, RuleAction> {
    alt((
        map(tag_no_case("allow"), |_| RuleAction::Allow),
        map(tag_no_case("block"), |_| RuleAction::Block),
    ))(input)
}

fn protocol(input: &str) -> IResult<&str, RuleProtocol> {
    alt((
        map(tag_no_case("tcp"), |_| RuleProtocol::Tcp),
        map(tag_no_case("udp"), |_| RuleProtocol::Udp),
        map(tag_no_case("icmp"), |_| RuleProtocol::Icmp),
    ))(input)
}

fn ports(input: &str) -> IResult<&str, RulePorts> {
    alt((
        map(
            preceded(
                pair(tag_no_case("ports"), multispace1),
                separated_list1(
                    delimited(multispace0, char(','), multispace0),
                    port_number,
                ),
            ),
            RulePorts::Ports,
        ),
        map(
            tuple((tag_no_case("port"), multispace1, tag_no_case("all"))),
            |_| RulePorts::All,
        ),
        map(
            preceded(pair(tag_no_case("port"), multispace1), port_number),
            |port| RulePorts::Ports(vec![port]),
        ),
        map(
            tuple((
                tag_no_case("type"),
                multispace1,
                icmp_number,
                opt(preceded(
                    tuple((multispace1, tag_no_case("code"), multispace1)),
                    icmp_number,
                )),
            )),
            |(_, _, icmp_type, code)| RulePorts::IcmpType { icmp_type, code },
        ),
    ))(input)
}

fn rule_body(input: &str) -> IResult<&str, ParsedRule> {
    map(
        tuple((
            multispace0,
            tag_no_case("from"),
            multispace1,
            targets,
            multispace1,
            tag_no_case("to"),
            multispace1,
            targets,
            multispace1,
            action,
            multispace1,
            protocol,
            multispace1,
            ports,
            multispace0,
        )),
        |(_, _, _, from, _, _, _, to, _, action, _, protocol, _, ports, _)| ParsedRule {
            from,
            to,
            action,
            protocol,
            ports,
        },
    )(input)
}
