//! In-memory FIFO waitlist for tests and single-node development.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use zonegrid_application::WaitlistCoordinator;
use zonegrid_core::{AppError, AppResult};
use zonegrid_domain::{Ticket, TicketScope, TicketState};

/// In-memory waitlist coordinator. One queue per `(scope, key)`; the head
/// of a queue is its sole active holder.
#[derive(Default)]
pub struct InMemoryWaitlistCoordinator {
    queues: Mutex<HashMap<String, VecDeque<Ticket>>>,
    released: Notify,
}

impl InMemoryWaitlistCoordinator {
    /// Creates an empty coordinator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WaitlistCoordinator for InMemoryWaitlistCoordinator {
    async fn join(&self, scope: TicketScope, holder: &str) -> AppResult<Ticket> {
        if holder.trim().is_empty() {
            return Err(AppError::Internal(
                "waitlist ticket holder must not be empty".to_owned(),
            ));
        }

        let mut queues = self.queues.lock().await;
        let queue = queues.entry(scope.queue_key()).or_default();

        let ticket = Ticket {
            id: Uuid::new_v4(),
            scope,
            state: if queue.is_empty() {
                TicketState::Active
            } else {
                TicketState::Queued
            },
            holder: holder.to_owned(),
            acquired_at: Utc::now(),
        };

        queue.push_back(ticket.clone());
        Ok(ticket)
    }

    async fn ticket(&self, scope: &TicketScope, ticket_id: Uuid) -> AppResult<Option<Ticket>> {
        let queues = self.queues.lock().await;
        Ok(queues
            .get(&scope.queue_key())
            .and_then(|queue| queue.iter().find(|ticket| ticket.id == ticket_id))
            .cloned())
    }

    async fn wait_active(&self, ticket: &Ticket) -> AppResult<Ticket> {
        loop {
            {
                let queues = self.queues.lock().await;
                match queues
                    .get(&ticket.scope.queue_key())
                    .and_then(VecDeque::front)
                {
                    Some(head) if head.id == ticket.id => {
                        let mut active = head.clone();
                        active.state = TicketState::Active;
                        return Ok(active);
                    }
                    Some(_) => {}
                    None => {
                        return Err(AppError::NotFound(format!(
                            "ticket {} is no longer queued",
                            ticket.id
                        )));
                    }
                }
            }

            self.released.notified().await;
        }
    }

    async fn release(&self, scope: &TicketScope, ticket_id: Uuid) -> AppResult<()> {
        let mut queues = self.queues.lock().await;

        if let Some(queue) = queues.get_mut(&scope.queue_key()) {
            queue.retain(|ticket| ticket.id != ticket_id);
            if let Some(next) = queue.front_mut() {
                next.state = TicketState::Active;
            }
            if queue.is_empty() {
                queues.remove(&scope.queue_key());
            }
        }

        self.released.notify_waiters();
        Ok(())
    }

    async fn pending(&self, scope: &TicketScope) -> AppResult<Vec<Ticket>> {
        let queues = self.queues.lock().await;
        Ok(queues
            .get(&scope.queue_key())
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use zonegrid_application::WaitlistCoordinator;
    use zonegrid_domain::{TicketScope, TicketState};

    use super::InMemoryWaitlistCoordinator;

    #[tokio::test]
    async fn only_the_head_of_a_queue_is_active() {
        let coordinator = InMemoryWaitlistCoordinator::new();
        let scope = TicketScope::Vm(Uuid::new_v4());

        let first = coordinator.join(scope, "job-1").await.unwrap();
        let second = coordinator.join(scope, "job-2").await.unwrap();

        assert_eq!(first.state, TicketState::Active);
        assert_eq!(second.state, TicketState::Queued);

        coordinator.release(&scope, first.id).await.unwrap();

        let pending = coordinator.pending(&scope).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second.id);
        assert_eq!(pending[0].state, TicketState::Active);
    }

    #[tokio::test]
    async fn waiters_progress_in_fifo_order() {
        let coordinator = std::sync::Arc::new(InMemoryWaitlistCoordinator::new());
        let scope = TicketScope::Vm(Uuid::new_v4());

        let first = coordinator.join(scope, "job-1").await.unwrap();
        let second = coordinator.join(scope, "job-2").await.unwrap();
        let third = coordinator.join(scope, "job-3").await.unwrap();

        let waiter = {
            let coordinator = coordinator.clone();
            let third = third.clone();
            tokio::spawn(async move { coordinator.wait_active(&third).await })
        };

        coordinator.release(&scope, first.id).await.unwrap();
        coordinator.release(&scope, second.id).await.unwrap();

        let active = waiter.await.unwrap().unwrap();
        assert_eq!(active.id, third.id);
        assert_eq!(active.state, TicketState::Active);
    }

    #[tokio::test]
    async fn releasing_a_queued_ticket_abandons_it_without_activation() {
        let coordinator = InMemoryWaitlistCoordinator::new();
        let scope = TicketScope::Allocation(Uuid::new_v4());

        let first = coordinator.join(scope, "job-1").await.unwrap();
        let second = coordinator.join(scope, "job-2").await.unwrap();

        coordinator.release(&scope, second.id).await.unwrap();

        let pending = coordinator.pending(&scope).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, first.id);
        assert_eq!(pending[0].state, TicketState::Active);
    }
}
