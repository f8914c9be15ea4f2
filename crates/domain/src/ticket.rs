use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Serialization scope of a waitlist ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "key", rename_all = "snake_case")]
pub enum TicketScope {
    /// Serializes mutations of one VM.
    Vm(Uuid),
    /// Serializes capacity-sensitive work on one server.
    Allocation(Uuid),
    /// Guards NAT zone provisioning for one fabric network.
    FabricNat(Uuid),
}

impl TicketScope {
    /// Returns the `(scope, key)` pair as the coordinator's queue key.
    #[must_use]
    pub fn queue_key(&self) -> String {
        match self {
            Self::Vm(uuid) => format!("vm:{uuid}"),
            Self::Allocation(uuid) => format!("allocation:{uuid}"),
            Self::FabricNat(uuid) => format!("fabric-nat:{uuid}"),
        }
    }
}

/// Waitlist ticket state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketState {
    /// Waiting behind earlier holders.
    Queued,
    /// Sole holder of the queue key.
    Active,
    /// Returned by its holder.
    Released,
    /// Reaped after its holder went silent.
    Expired,
}

/// A FIFO lease serializing work on a shared resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Ticket identifier.
    pub id: Uuid,
    /// Queue this ticket waits in.
    pub scope: TicketScope,
    /// Current state.
    pub state: TicketState,
    /// Job (or request) holding the ticket.
    pub holder: String,
    /// Enqueue time.
    pub acquired_at: DateTime<Utc>,
}
