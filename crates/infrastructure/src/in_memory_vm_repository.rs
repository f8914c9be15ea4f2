//! In-memory VM store for tests and single-node development.

use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use zonegrid_application::{StoreStatus, VersionedVm, VmRepository, VmSearch, VmSearchPage};
use zonegrid_core::{AppError, AppResult};
use zonegrid_domain::{MigrationRecord, Vm};

/// In-memory VM repository implementation.
#[derive(Default)]
pub struct InMemoryVmRepository {
    vms: RwLock<HashMap<Uuid, (Vm, u64)>>,
    migrations: RwLock<HashMap<Uuid, MigrationRecord>>,
    role_tags: RwLock<HashMap<Uuid, Vec<String>>>,
}

impl InMemoryVmRepository {
    /// Creates an empty in-memory repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VmRepository for InMemoryVmRepository {
    async fn put_vm(&self, vm: Vm, expected_revision: Option<u64>) -> AppResult<u64> {
        let mut vms = self.vms.write().await;

        match (vms.get(&vm.uuid), expected_revision) {
            (Some(_), None) => Err(AppError::Conflict(format!(
                "VM {} already exists",
                vm.uuid
            ))),
            (None, Some(_)) => Err(AppError::NotFound(format!("VM {} not found", vm.uuid))),
            (Some((_, revision)), Some(expected)) if *revision != expected => {
                Err(AppError::Conflict(format!(
                    "VM {} was updated concurrently (revision {revision}, expected {expected})",
                    vm.uuid
                )))
            }
            (existing, _) => {
                let next = existing.map_or(1, |(_, revision)| revision + 1);
                vms.insert(vm.uuid, (vm, next));
                Ok(next)
            }
        }
    }

    async fn get_vm(&self, uuid: Uuid) -> AppResult<Option<VersionedVm>> {
        Ok(self
            .vms
            .read()
            .await
            .get(&uuid)
            .map(|(vm, revision)| VersionedVm {
                vm: vm.clone(),
                revision: *revision,
            }))
    }

    async fn search_vms(&self, search: VmSearch) -> AppResult<VmSearchPage> {
        let vms = self.vms.read().await;

        let mut matching: Vec<Vm> = vms
            .values()
            .filter(|(vm, _)| {
                search
                    .predicate
                    .as_ref()
                    .is_none_or(|predicate| predicate.matches(&vm.to_public_value()))
            })
            .map(|(vm, _)| vm.clone())
            .collect();

        matching.sort_by(|left, right| {
            let ordering = compare_for_sort(left, right, search.sort.field.as_str());
            if search.sort.descending {
                ordering.reverse()
            } else {
                ordering
            }
        });

        let total = matching.len();
        let vms = matching
            .into_iter()
            .skip(search.offset)
            .take(search.limit)
            .collect();

        Ok(VmSearchPage { vms, total })
    }

    async fn put_migration(&self, record: MigrationRecord) -> AppResult<()> {
        self.migrations.write().await.insert(record.vm_uuid, record);
        Ok(())
    }

    async fn get_migration(&self, vm_uuid: Uuid) -> AppResult<Option<MigrationRecord>> {
        Ok(self.migrations.read().await.get(&vm_uuid).cloned())
    }

    async fn put_role_tags(&self, vm_uuid: Uuid, role_tags: Vec<String>) -> AppResult<()> {
        self.role_tags.write().await.insert(vm_uuid, role_tags);
        Ok(())
    }

    async fn status(&self) -> StoreStatus {
        StoreStatus::Ready
    }
}

/// Timestamps sort on the typed field; everything else compares through the
/// public wire representation.
fn compare_for_sort(left: &Vm, right: &Vm, field: &str) -> Ordering {
    if field == "create_timestamp" {
        return left.create_timestamp.cmp(&right.create_timestamp);
    }

    let left = left.to_public_value();
    let right = right.to_public_value();

    match (left.get(field), right.get(field)) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}
