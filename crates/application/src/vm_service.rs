use std::sync::Arc;

use serde_json::{Value, json};
use uuid::Uuid;

use zonegrid_core::{AppError, AppResult, RequestContext, RequestId};
use zonegrid_domain::{Ticket, TicketScope, Vm};

use crate::vm_ports::{Collaborators, VmRepository, WaitlistCoordinator, WorkflowClient};

mod actions;
mod provision;
mod queries;
mod tags;
mod validate;

#[cfg(test)]
pub(crate) mod tests;

pub use queries::ListVmsParams;
pub use validate::{ProvisionSpec, ResolvedNetwork, UpdateSpec};

/// The VM mutation engine: validates requests, persists intent, dispatches
/// pipelines to the workflow executor and answers read queries.
#[derive(Clone)]
pub struct VmService {
    repository: Arc<dyn VmRepository>,
    waitlist: Arc<dyn WaitlistCoordinator>,
    workflows: Arc<dyn WorkflowClient>,
    collaborators: Collaborators,
    search_limit_cap: usize,
}

impl VmService {
    /// Creates a VM service with the default search page cap.
    #[must_use]
    pub fn new(
        repository: Arc<dyn VmRepository>,
        waitlist: Arc<dyn WaitlistCoordinator>,
        workflows: Arc<dyn WorkflowClient>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            repository,
            waitlist,
            workflows,
            collaborators,
            search_limit_cap: 1000,
        }
    }

    /// Overrides the server-side cap applied to `limit`.
    #[must_use]
    pub fn with_search_limit_cap(mut self, cap: usize) -> Self {
        self.search_limit_cap = cap.max(1);
        self
    }

    /// Returns the store port, for the reconciler sharing one composition
    /// root.
    #[must_use]
    pub fn repository(&self) -> Arc<dyn VmRepository> {
        self.repository.clone()
    }

    /// Returns the waitlist port.
    #[must_use]
    pub fn waitlist(&self) -> Arc<dyn WaitlistCoordinator> {
        self.waitlist.clone()
    }

    /// Returns the collaborator bundle.
    #[must_use]
    pub fn collaborators(&self) -> Collaborators {
        self.collaborators.clone()
    }

    /// Loads a VM or fails with the 404-class error.
    pub(crate) async fn load_vm(&self, uuid: Uuid) -> AppResult<Vm> {
        Ok(self
            .repository
            .get_vm(uuid)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("VM {uuid} not found")))?
            .vm)
    }

    /// Joins the per-VM waitlist and records the ticket for the job params.
    /// The ticket is released by the reconciler on every terminal outcome,
    /// or immediately when submission itself fails.
    pub(crate) async fn join_vm_ticket(
        &self,
        request_id: RequestId,
        vm_uuid: Uuid,
    ) -> AppResult<Ticket> {
        self.waitlist
            .join(TicketScope::Vm(vm_uuid), request_id.to_string().as_str())
            .await
    }

    /// Best-effort release used on dispatch failure paths.
    pub(crate) async fn abandon_ticket(&self, ticket: &Ticket) {
        let _ = self.waitlist.release(&ticket.scope, ticket.id).await;
    }
}

/// Assembles the params record stored on every job: target, task, bound
/// payload, held tickets and the caller context captured at API time.
pub(crate) fn job_params(
    context: &RequestContext,
    vm_uuid: Option<Uuid>,
    task: &str,
    payload: Value,
    tickets: &[&Ticket],
) -> Value {
    let tickets: Vec<Value> = tickets
        .iter()
        .map(|ticket| json!({"id": ticket.id, "scope": ticket.scope}))
        .collect();

    json!({
        "vm_uuid": vm_uuid,
        "task": task,
        "payload": payload,
        "tickets": tickets,
        "context": {
            "caller": context.caller,
            "params": context.params,
        },
    })
}
