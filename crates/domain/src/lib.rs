//! Domain entities and invariants for the zonegrid VM control plane.

#![forbid(unsafe_code)]

mod firewall;
mod job;
mod ldap;
mod locality;
mod migration;
mod predicate;
mod tags;
mod ticket;
mod vm;

pub use firewall::{
    FirewallRule, ParsedRule, RuleAction, RulePorts, RuleProtocol, RuleTarget, parse_rule,
    validate_firewall_rules,
};
pub use job::{Job, JobExecution};
pub use ldap::parse_ldap_filter;
pub use locality::Locality;
pub use migration::{MigrationPhase, MigrationProgressEntry, MigrationRecord, MigrationState};
pub use predicate::{Predicate, active_state_predicate};
pub use tags::{
    DOCKER_LABEL_PREFIX, SDC_DOCKER_TAG, TRITON_TAG_PREFIX, TritonTagType,
    ensure_no_reserved_docker_writes, ensure_tag_deletable, is_reserved_docker_tag,
    triton_tag_type, validate_tag_values, validate_tag_write,
};
pub use ticket::{Ticket, TicketScope, TicketState};
pub use vm::{Brand, Disk, Nic, Snapshot, Vm, VmAction, VmState};
