use async_trait::async_trait;
use uuid::Uuid;

use zonegrid_core::AppResult;
use zonegrid_domain::{Ticket, TicketScope};

/// Distributed FIFO waitlist serializing mutations on shared resources.
///
/// At most one ticket per `(scope, key)` is active at any instant; waiting
/// is FIFO. Tickets must be released on success, error and cancel paths.
#[async_trait]
pub trait WaitlistCoordinator: Send + Sync {
    /// Enqueues a ticket. Returns it in `Active` state when the queue was
    /// empty, `Queued` otherwise. Never blocks.
    async fn join(&self, scope: TicketScope, holder: &str) -> AppResult<Ticket>;

    /// Fetches the current state of a ticket.
    async fn ticket(&self, scope: &TicketScope, ticket_id: Uuid) -> AppResult<Option<Ticket>>;

    /// Blocks until the ticket reaches the head of its queue.
    async fn wait_active(&self, ticket: &Ticket) -> AppResult<Ticket>;

    /// Releases a ticket, activating the next one in line. Idempotent.
    async fn release(&self, scope: &TicketScope, ticket_id: Uuid) -> AppResult<()>;

    /// Returns the queue for a scope in FIFO order, head first.
    async fn pending(&self, scope: &TicketScope) -> AppResult<Vec<Ticket>>;
}
