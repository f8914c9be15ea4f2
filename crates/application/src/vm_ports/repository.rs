use async_trait::async_trait;
use uuid::Uuid;

use zonegrid_core::AppResult;
use zonegrid_domain::{MigrationRecord, Predicate, Vm};

/// Sort order for a VM search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSort {
    /// Field of the public VM representation to sort by.
    pub field: String,
    /// Whether to sort descending.
    pub descending: bool,
}

impl VmSort {
    /// Default listing order: newest first.
    #[must_use]
    pub fn create_timestamp_descending() -> Self {
        Self {
            field: "create_timestamp".to_owned(),
            descending: true,
        }
    }
}

/// A compiled VM search: one predicate plus pagination and ordering.
#[derive(Debug, Clone, PartialEq)]
pub struct VmSearch {
    /// Intersection of every query surface; `None` matches all VMs.
    pub predicate: Option<Predicate>,
    /// Page size after capping.
    pub limit: usize,
    /// Zero-based row offset.
    pub offset: usize,
    /// Result ordering.
    pub sort: VmSort,
}

/// One page of search results plus the total matching count ignoring
/// pagination.
#[derive(Debug, Clone, PartialEq)]
pub struct VmSearchPage {
    /// Matching VMs in sort order, `offset`-skipped and `limit`-capped.
    pub vms: Vec<Vm>,
    /// Cardinality of the full matching set.
    pub total: usize,
}

/// Readiness of the persistence layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    /// Buckets exist and writes are accepted.
    Ready,
    /// Buckets have not been created yet.
    NotSetup,
    /// A data schema migration is still in flight.
    MigrationPending,
}

/// A stored VM together with its optimistic-concurrency revision.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedVm {
    /// The persisted record.
    pub vm: Vm,
    /// Monotonically increasing write revision.
    pub revision: u64,
}

/// Persistence port for the `vms`, `vm_role_tags` and `vm_migrations`
/// buckets.
#[async_trait]
pub trait VmRepository: Send + Sync {
    /// Writes a VM record.
    ///
    /// `expected_revision` of `None` creates the record and conflicts when
    /// the uuid already exists; `Some(revision)` replaces the record and
    /// conflicts when another writer got there first. Returns the new
    /// revision.
    async fn put_vm(&self, vm: Vm, expected_revision: Option<u64>) -> AppResult<u64>;

    /// Fetches one VM with its revision. Destroyed VMs stay retrievable.
    async fn get_vm(&self, uuid: Uuid) -> AppResult<Option<VersionedVm>>;

    /// Runs a compiled search, returning one page plus the total count.
    async fn search_vms(&self, search: VmSearch) -> AppResult<VmSearchPage>;

    /// Upserts the migration record of a VM.
    async fn put_migration(&self, record: MigrationRecord) -> AppResult<()>;

    /// Fetches the migration record of a VM.
    async fn get_migration(&self, vm_uuid: Uuid) -> AppResult<Option<MigrationRecord>>;

    /// Replaces the secondary role-tag index entries for a VM.
    async fn put_role_tags(&self, vm_uuid: Uuid, role_tags: Vec<String>) -> AppResult<()>;

    /// Reports bucket readiness; requests are rejected with a 503-class
    /// error until the store reaches `Ready`.
    async fn status(&self) -> StoreStatus;
}
