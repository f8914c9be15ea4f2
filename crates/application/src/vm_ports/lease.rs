use async_trait::async_trait;

use zonegrid_core::AppResult;

/// One reconciler runtime lease claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerLease {
    /// Coordination scope key.
    pub scope_key: String,
    /// Lease token used for safe release.
    pub token: String,
    /// Lease holder identity.
    pub holder_id: String,
}

/// Distributed coordination port electing a single reconciler runtime.
///
/// Only the lease holder drains terminal job outcomes; the TTL bounds how
/// long a crashed holder can block its peers.
#[async_trait]
pub trait ReconcilerLeaseCoordinator: Send + Sync {
    /// Attempts to acquire the lease for the given scope.
    async fn try_acquire(
        &self,
        scope_key: &str,
        holder_id: &str,
        lease_seconds: u32,
    ) -> AppResult<Option<ReconcilerLease>>;

    /// Releases a lease using token compare-and-delete semantics.
    async fn release(&self, lease: &ReconcilerLease) -> AppResult<()>;

    /// Renews an existing lease; false when token ownership changed.
    async fn renew(&self, lease: &ReconcilerLease, lease_seconds: u32) -> AppResult<bool>;
}
