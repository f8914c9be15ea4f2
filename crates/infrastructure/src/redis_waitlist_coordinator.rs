//! Redis-backed distributed FIFO waitlist.
//!
//! Each `(scope, key)` maps to a Redis list of ticket ids; the head of the
//! list is the sole active holder. Release uses a compare-and-remove Lua
//! script so a stale caller cannot pop someone else's ticket, and removing
//! a non-head entry abandons a queued ticket without activating it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::{AsyncCommands, Script};
use uuid::Uuid;

use zonegrid_application::WaitlistCoordinator;
use zonegrid_core::{AppError, AppResult};
use zonegrid_domain::{Ticket, TicketScope, TicketState};

const RELEASE_TICKET_SCRIPT: &str = r#"
if redis.call('LINDEX', KEYS[1], 0) == ARGV[1] then
  return redis.call('LPOP', KEYS[1]) and 1 or 0
else
  return redis.call('LREM', KEYS[1], 1, ARGV[1])
end
"#;

/// Redis implementation of the waitlist coordinator.
#[derive(Clone)]
pub struct RedisWaitlistCoordinator {
    client: redis::Client,
    key_prefix: String,
    poll_interval: Duration,
}

impl RedisWaitlistCoordinator {
    /// Creates a coordinator adapter with the default wait poll interval.
    #[must_use]
    pub fn new(client: redis::Client, key_prefix: impl Into<String>) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
            poll_interval: Duration::from_millis(250),
        }
    }

    /// Overrides the head-poll interval used by `wait_active`.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn key_for(&self, scope: &TicketScope) -> String {
        format!("{}:{}", self.key_prefix, scope.queue_key())
    }

    async fn connection(&self) -> AppResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|error| AppError::Internal(format!("failed to connect to redis: {error}")))
    }
}

#[async_trait]
impl WaitlistCoordinator for RedisWaitlistCoordinator {
    async fn join(&self, scope: TicketScope, holder: &str) -> AppResult<Ticket> {
        if holder.trim().is_empty() {
            return Err(AppError::Internal(
                "waitlist ticket holder must not be empty".to_owned(),
            ));
        }

        let key = self.key_for(&scope);
        let ticket_id = Uuid::new_v4();
        let mut connection = self.connection().await?;

        let queue_length: i64 = connection
            .rpush(key.as_str(), ticket_id.to_string())
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to enqueue waitlist ticket: {error}"))
            })?;

        Ok(Ticket {
            id: ticket_id,
            scope,
            state: if queue_length == 1 {
                TicketState::Active
            } else {
                TicketState::Queued
            },
            holder: holder.to_owned(),
            acquired_at: Utc::now(),
        })
    }

    async fn ticket(&self, scope: &TicketScope, ticket_id: Uuid) -> AppResult<Option<Ticket>> {
        let key = self.key_for(scope);
        let mut connection = self.connection().await?;

        let entries: Vec<String> = connection.lrange(key.as_str(), 0, -1).await.map_err(
            |error| AppError::Internal(format!("failed to read waitlist queue: {error}")),
        )?;

        let position = entries
            .iter()
            .position(|entry| entry == &ticket_id.to_string());

        Ok(position.map(|position| Ticket {
            id: ticket_id,
            scope: *scope,
            state: if position == 0 {
                TicketState::Active
            } else {
                TicketState::Queued
            },
            holder: String::new(),
            acquired_at: Utc::now(),
        }))
    }

    async fn wait_active(&self, ticket: &Ticket) -> AppResult<Ticket> {
        let key = self.key_for(&ticket.scope);
        let wanted = ticket.id.to_string();

        loop {
            let mut connection = self.connection().await?;
            let head: Option<String> = connection.lindex(key.as_str(), 0).await.map_err(
                |error| AppError::Internal(format!("failed to read waitlist head: {error}")),
            )?;

            match head {
                Some(head) if head == wanted => {
                    let mut active = ticket.clone();
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

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn release(&self, scope: &TicketScope, ticket_id: Uuid) -> AppResult<()> {
        let key = self.key_for(scope);
        let script = Script::new(RELEASE_TICKET_SCRIPT);
        let mut connection = self.connection().await?;

        script
            .key(key)
            .arg(ticket_id.to_string())
            .invoke_async::<i32>(&mut connection)
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to release waitlist ticket: {error}"))
            })?;

        Ok(())
    }

    async fn pending(&self, scope: &TicketScope) -> AppResult<Vec<Ticket>> {
        let key = self.key_for(scope);
        let mut connection = self.connection().await?;

        let entries: Vec<String> = connection.lrange(key.as_str(), 0, -1).await.map_err(
            |error| AppError::Internal(format!("failed to read waitlist queue: {error}")),
        )?;

        Ok(entries
            .iter()
            .enumerate()
            .filter_map(|(position, entry)| {
                Uuid::parse_str(entry).ok().map(|id| Ticket {
                    id,
                    scope: *scope,
                    state: if position == 0 {
                        TicketState::Active
                    } else {
                        TicketState::Queued
                    },
                    holder: String::new(),
                    acquired_at: Utc::now(),
                })
            })
            .collect())
    }
}
