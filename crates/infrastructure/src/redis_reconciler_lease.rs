//! Redis-backed reconciler runtime election.

use async_trait::async_trait;
use redis::{AsyncCommands, ExistenceCheck, Script, SetExpiry, SetOptions};

use zonegrid_application::{ReconcilerLease, ReconcilerLeaseCoordinator};
use zonegrid_core::{AppError, AppResult};

const RELEASE_LEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
else
  return 0
end
"#;

const RENEW_LEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('EXPIRE', KEYS[1], ARGV[2])
else
  return 0
end
"#;

/// Redis implementation of reconciler runtime election.
#[derive(Clone)]
pub struct RedisReconcilerLeaseCoordinator {
    client: redis::Client,
    key_prefix: String,
}

impl RedisReconcilerLeaseCoordinator {
    /// Creates a coordinator adapter.
    #[must_use]
    pub fn new(client: redis::Client, key_prefix: impl Into<String>) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
        }
    }

    fn key_for(&self, scope_key: &str) -> String {
        format!("{}:{scope_key}", self.key_prefix)
    }

    async fn connection(&self) -> AppResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|error| AppError::Internal(format!("failed to connect to redis: {error}")))
    }
}

#[async_trait]
impl ReconcilerLeaseCoordinator for RedisReconcilerLeaseCoordinator {
    async fn try_acquire(
        &self,
        scope_key: &str,
        holder_id: &str,
        lease_seconds: u32,
    ) -> AppResult<Option<ReconcilerLease>> {
        if scope_key.trim().is_empty() || holder_id.trim().is_empty() {
            return Err(AppError::Internal(
                "reconciler lease scope_key and holder_id must not be empty".to_owned(),
            ));
        }

        if lease_seconds == 0 {
            return Err(AppError::Internal(
                "reconciler lease_seconds must be greater than zero".to_owned(),
            ));
        }

        let key = self.key_for(scope_key);
        let token = format!("{holder_id}:{}", uuid::Uuid::new_v4());
        let mut connection = self.connection().await?;

        // Atomic NX+EX: a crashed holder blocks peers for at most the TTL.
        let options = SetOptions::default()
            .conditional_set(ExistenceCheck::NX)
            .with_expiration(SetExpiry::EX(u64::from(lease_seconds)));

        let acquired: Option<String> = connection
            .set_options(key.as_str(), token.as_str(), options)
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to acquire reconciler lease: {error}"))
            })?;

        if acquired.is_none() {
            return Ok(None);
        }

        Ok(Some(ReconcilerLease {
            scope_key: scope_key.to_owned(),
            token,
            holder_id: holder_id.to_owned(),
        }))
    }

    async fn release(&self, lease: &ReconcilerLease) -> AppResult<()> {
        let key = self.key_for(lease.scope_key.as_str());
        let mut connection = self.connection().await?;

        Script::new(RELEASE_LEASE_SCRIPT)
            .key(key)
            .arg(lease.token.as_str())
            .invoke_async::<i32>(&mut connection)
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to release reconciler lease: {error}"))
            })?;

        Ok(())
    }

    async fn renew(&self, lease: &ReconcilerLease, lease_seconds: u32) -> AppResult<bool> {
        if lease_seconds == 0 {
            return Err(AppError::Internal(
                "reconciler lease_seconds must be greater than zero".to_owned(),
            ));
        }

        let key = self.key_for(lease.scope_key.as_str());
        let mut connection = self.connection().await?;

        let renewed = Script::new(RENEW_LEASE_SCRIPT)
            .key(key)
            .arg(lease.token.as_str())
            .arg(i64::from(lease_seconds))
            .invoke_async::<i32>(&mut connection)
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to renew reconciler lease: {error}"))
            })?;

        Ok(renewed > 0)
    }
}
