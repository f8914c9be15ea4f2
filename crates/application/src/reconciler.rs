//! Post-execution reconciliation.
//!
//! Observes terminal workflow outcomes and brings the persisted VM, its
//! NIC records and the waitlist back in line: success persists the new VM
//! object, failure marks it failed (cleaning pre-created NICs unless the
//! pipeline passed the point of no return), cancellation refreshes state
//! from the compute node. Tickets named in the job params are released on
//! every terminal path.

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use zonegrid_core::{AppError, AppResult, Caller, RequestContext, RequestId};
use zonegrid_domain::{
    Job, JobExecution, MigrationPhase, MigrationProgressEntry, MigrationState, Nic, TicketScope,
    Vm, VmState,
};

use crate::vm_ports::NicRecord;
use crate::vm_service::VmService;

const CAS_ATTEMPTS: usize = 3;

/// Applies terminal job outcomes to the persisted world.
#[derive(Clone)]
pub struct Reconciler {
    service: VmService,
}

impl Reconciler {
    /// Creates a reconciler sharing the service's ports.
    #[must_use]
    pub fn new(service: VmService) -> Self {
        Self { service }
    }

    /// Applies one job outcome. Non-terminal jobs are ignored; application
    /// is idempotent so redelivery is safe. Tickets are released regardless
    /// of how application itself fares.
    pub async fn reconcile(&self, request_id: RequestId, job: &Job) -> AppResult<()> {
        let outcome = match job.execution {
            JobExecution::Succeeded => self.apply_success(request_id, job).await,
            JobExecution::Failed => self.apply_failure(request_id, job).await,
            JobExecution::Canceled => self.apply_cancel(request_id, job).await,
            JobExecution::Queued | JobExecution::Running => Ok(()),
        };

        self.release_job_tickets(job).await;
        outcome
    }

    async fn apply_success(&self, request_id: RequestId, job: &Job) -> AppResult<()> {
        let Some(vm_uuid) = job.vm_uuid else {
            return Ok(());
        };
        let payload = job.params.get("payload").cloned().unwrap_or(Value::Null);

        match job.task.as_str() {
            "provision" => {
                let nics = self.fetch_nics(request_id, vm_uuid).await?;
                let server_uuid = uuid_in(&payload, "server_uuid");
                self.with_vm_cas(vm_uuid, |vm| {
                    vm.nics = nics.iter().map(running_nic).collect();
                    if let Some(server) = server_uuid {
                        vm.server_uuid = Some(server);
                    }
                    vm.state = if vm.autoboot {
                        VmState::Running
                    } else {
                        VmState::Stopped
                    };
                    Ok(())
                })
                .await?;
            }
            "start" | "reboot" | "rollback" => {
                self.with_vm_cas(vm_uuid, |vm| {
                    vm.state = VmState::Running;
                    Ok(())
                })
                .await?;
            }
            "stop" => {
                self.with_vm_cas(vm_uuid, |vm| {
                    vm.state = VmState::Stopped;
                    Ok(())
                })
                .await?;
            }
            "update" => {
                self.with_vm_cas(vm_uuid, |vm| {
                    apply_update_payload(vm, &payload);
                    Ok(())
                })
                .await?;
            }
            "add-nics" | "remove-nic" => {
                let nics = self.fetch_nics(request_id, vm_uuid).await?;
                self.with_vm_cas(vm_uuid, |vm| {
                    vm.nics = nics.iter().map(running_nic).collect();
                    Ok(())
                })
                .await?;
            }
            "snapshot" => {
                let name = string_in(&payload, "snapshot_name");
                self.with_vm_cas(vm_uuid, |vm| {
                    if let Some(name) = &name
                        && !vm.snapshots.iter().any(|snapshot| snapshot.name == *name)
                    {
                        vm.snapshots.push(zonegrid_domain::Snapshot {
                            name: name.clone(),
                            created_at: Utc::now(),
                        });
                    }
                    Ok(())
                })
                .await?;
            }
            "delete-snapshot" => {
                let name = string_in(&payload, "snapshot_name");
                self.with_vm_cas(vm_uuid, |vm| {
                    if let Some(name) = &name {
                        vm.snapshots.retain(|snapshot| snapshot.name != *name);
                    }
                    Ok(())
                })
                .await?;
            }
            "reprovision" => {
                let image_uuid = uuid_in(&payload, "image_uuid");
                self.with_vm_cas(vm_uuid, |vm| {
                    if let Some(image_uuid) = image_uuid {
                        vm.image_uuid = Some(image_uuid);
                    }
                    vm.state = VmState::Running;
                    Ok(())
                })
                .await?;
            }
            "destroy" => {
                let fabric_uuids = self
                    .service
                    .load_vm(vm_uuid)
                    .await
                    .map(|vm| vm.fabric_network_uuids())
                    .unwrap_or_default();

                self.with_vm_cas(vm_uuid, |vm| {
                    vm.state = VmState::Destroyed;
                    vm.quota = None;
                    vm.nics = Vec::new();
                    Ok(())
                })
                .await?;

                self.reap_fabric_nats(request_id, vm_uuid, &fabric_uuids)
                    .await?;
            }
            "migrate-begin" => {
                let target = uuid_in(&payload, "target_server_uuid");
                self.update_migration(vm_uuid, MigrationPhase::Begin, MigrationState::Paused, target)
                    .await?;
            }
            "migrate-sync" => {
                self.update_migration(vm_uuid, MigrationPhase::Sync, MigrationState::Paused, None)
                    .await?;
            }
            "migrate-switch" => {
                let record = self.service.repository().get_migration(vm_uuid).await?;
                let target = record.as_ref().and_then(|record| record.target_server_uuid);

                self.update_migration(
                    vm_uuid,
                    MigrationPhase::Switch,
                    MigrationState::Successful,
                    None,
                )
                .await?;

                self.with_vm_cas(vm_uuid, |vm| {
                    if let Some(target) = target {
                        vm.server_uuid = Some(target);
                    }
                    vm.state = VmState::Running;
                    Ok(())
                })
                .await?;
            }
            _ => {}
        }

        Ok(())
    }

    async fn apply_failure(&self, request_id: RequestId, job: &Job) -> AppResult<()> {
        let Some(vm_uuid) = job.vm_uuid else {
            return Ok(());
        };

        match job.task.as_str() {
            "provision" => {
                if job.mark_as_failed_on_error {
                    let nics = self.fetch_nics(request_id, vm_uuid).await?;
                    for nic in &nics {
                        self.service
                            .collaborators()
                            .networks
                            .delete_nic(request_id, nic.mac.as_str())
                            .await?;
                    }
                }

                self.with_vm_cas(vm_uuid, |vm| {
                    vm.state = VmState::Failed;
                    if job.mark_as_failed_on_error {
                        vm.nics = Vec::new();
                    }
                    Ok(())
                })
                .await?;
            }
            "add-nics" => {
                // Remove the NIC records pre-created for this job, then
                // refresh the denormalized set.
                let macs = job
                    .params
                    .get("payload")
                    .and_then(|payload| payload.get("nic_macs"))
                    .and_then(Value::as_array)
                    .map(|entries| {
                        entries
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_owned)
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();

                for mac in &macs {
                    let _ = self
                        .service
                        .collaborators()
                        .networks
                        .delete_nic(request_id, mac.as_str())
                        .await;
                }

                let nics = self.fetch_nics(request_id, vm_uuid).await?;
                self.with_vm_cas(vm_uuid, |vm| {
                    vm.nics = nics.iter().map(running_nic).collect();
                    Ok(())
                })
                .await?;
            }
            "migrate-begin" | "migrate-sync" | "migrate-switch" => {
                let phase = migration_phase_of(job.task.as_str());
                self.update_migration(vm_uuid, phase, MigrationState::Failed, None)
                    .await?;
            }
            _ => {}
        }

        Ok(())
    }

    async fn apply_cancel(&self, request_id: RequestId, job: &Job) -> AppResult<()> {
        let Some(vm_uuid) = job.vm_uuid else {
            return Ok(());
        };

        if let Some(phase) = optional_migration_phase(job.task.as_str()) {
            self.update_migration(vm_uuid, phase, MigrationState::Aborted, None)
                .await?;
            return Ok(());
        }

        // Refresh the cached state from the compute node; the zone is the
        // source of truth after a canceled pipeline.
        let Ok(vm) = self.service.load_vm(vm_uuid).await else {
            return Ok(());
        };
        let Some(server_uuid) = vm.server_uuid else {
            return Ok(());
        };

        if let Some(snapshot) = self
            .service
            .collaborators()
            .compute
            .vm_snapshot(request_id, server_uuid, vm_uuid)
            .await?
        {
            self.with_vm_cas(vm_uuid, |vm| {
                vm.state = snapshot.state;
                Ok(())
            })
            .await?;
        }

        Ok(())
    }

    /// Destroys the `nat-<fabric>` zone once the last user VM on a fabric
    /// is gone.
    async fn reap_fabric_nats(
        &self,
        request_id: RequestId,
        destroyed_vm: Uuid,
        fabric_uuids: &[Uuid],
    ) -> AppResult<()> {
        for fabric_uuid in fabric_uuids {
            let Some(nat_zone) = self.service.find_active_nat_zone(*fabric_uuid).await? else {
                continue;
            };

            if self
                .fabric_has_user_vms(*fabric_uuid, destroyed_vm, nat_zone.uuid)
                .await?
            {
                continue;
            }

            let context = RequestContext {
                caller: Caller {
                    caller_type: "operator".to_owned(),
                    ip: None,
                    key_id: None,
                },
                params: Value::Null,
            };
            self.service
                .destroy(request_id, &context, nat_zone.uuid)
                .await?;
        }

        Ok(())
    }

    async fn fabric_has_user_vms(
        &self,
        fabric_uuid: Uuid,
        destroyed_vm: Uuid,
        nat_uuid: Uuid,
    ) -> AppResult<bool> {
        let page = self
            .service
            .repository()
            .search_vms(crate::vm_ports::VmSearch {
                predicate: Some(zonegrid_domain::active_state_predicate()),
                limit: 10_000,
                offset: 0,
                sort: crate::vm_ports::VmSort::create_timestamp_descending(),
            })
            .await?;

        Ok(page.vms.iter().any(|vm| {
            vm.uuid != destroyed_vm
                && vm.uuid != nat_uuid
                && vm.fabric_network_uuids().contains(&fabric_uuid)
        }))
    }

    async fn update_migration(
        &self,
        vm_uuid: Uuid,
        phase: MigrationPhase,
        state: MigrationState,
        target_server_uuid: Option<Uuid>,
    ) -> AppResult<()> {
        let repository = self.service.repository();
        let Some(mut record) = repository.get_migration(vm_uuid).await? else {
            return Ok(());
        };

        record.phase = phase;
        record.state = state;
        if target_server_uuid.is_some() {
            record.target_server_uuid = target_server_uuid;
        }
        record.updated_at = Utc::now();
        record.progress_history.push(MigrationProgressEntry {
            phase,
            state,
            started_at: record.updated_at,
            finished_at: Some(record.updated_at),
        });

        repository.put_migration(record).await
    }

    /// Optimistic write loop: re-read and re-apply when a concurrent writer
    /// wins the revision race.
    async fn with_vm_cas<F>(&self, vm_uuid: Uuid, mutate: F) -> AppResult<Vm>
    where
        F: Fn(&mut Vm) -> AppResult<()>,
    {
        let repository = self.service.repository();

        for _ in 0..CAS_ATTEMPTS {
            let Some(stored) = repository.get_vm(vm_uuid).await? else {
                return Err(AppError::NotFound(format!("VM {vm_uuid} not found")));
            };

            let mut vm = stored.vm;
            mutate(&mut vm)?;

            match repository.put_vm(vm.clone(), Some(stored.revision)).await {
                Ok(_) => return Ok(vm),
                Err(AppError::Conflict(_)) => continue,
                Err(error) => return Err(error),
            }
        }

        Err(AppError::Conflict(format!(
            "gave up reconciling VM {vm_uuid} after {CAS_ATTEMPTS} revision conflicts"
        )))
    }

    async fn fetch_nics(
        &self,
        request_id: RequestId,
        vm_uuid: Uuid,
    ) -> AppResult<Vec<NicRecord>> {
        self.service
            .collaborators()
            .networks
            .list_nics(request_id, vm_uuid)
            .await
    }

    async fn release_job_tickets(&self, job: &Job) {
        let Some(entries) = job.params.get("tickets").and_then(Value::as_array) else {
            return;
        };

        for entry in entries {
            let id = entry
                .get("id")
                .and_then(Value::as_str)
                .and_then(|raw| Uuid::parse_str(raw).ok());
            let scope = entry
                .get("scope")
                .cloned()
                .and_then(|value| serde_json::from_value::<TicketScope>(value).ok());

            if let (Some(id), Some(scope)) = (id, scope) {
                let _ = self.service.waitlist().release(&scope, id).await;
            }
        }
    }
}

fn running_nic(record: &NicRecord) -> Nic {
    Nic {
        mac: record.mac.clone(),
        ip: record.ip.clone(),
        nic_tag: None,
        network_uuid: Some(record.network_uuid),
        state: "running".to_owned(),
        primary: record.primary,
        fabric: record.fabric,
    }
}

fn apply_update_payload(vm: &mut Vm, payload: &Value) {
    if let Some(billing_id) = uuid_in(payload, "billing_id") {
        vm.billing_id = billing_id;
    }
    if let Some(ram) = payload.get("ram").and_then(Value::as_u64) {
        vm.ram = u32::try_from(ram).unwrap_or(vm.ram);
    }
    if let Some(quota) = payload.get("quota").and_then(Value::as_u64) {
        vm.quota = Some(quota);
    }
    if let Some(alias) = payload.get("alias").and_then(Value::as_str) {
        vm.alias = Some(alias.to_owned());
    }
    if let Some(autoboot) = payload.get("autoboot").and_then(Value::as_bool) {
        vm.autoboot = autoboot;
    }
    if let Some(tags) = payload.get("tags").and_then(Value::as_object) {
        vm.tags = tags.clone();
    }
    if let Some(metadata) = payload.get("customer_metadata").and_then(Value::as_object) {
        vm.customer_metadata = metadata.clone();
    }
    if let Some(metadata) = payload.get("internal_metadata").and_then(Value::as_object) {
        vm.internal_metadata = metadata.clone();
    }
}

fn uuid_in(payload: &Value, field: &str) -> Option<Uuid> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .and_then(|raw| Uuid::parse_str(raw).ok())
}

fn string_in(payload: &Value, field: &str) -> Option<String> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_owned)
}

fn migration_phase_of(task: &str) -> MigrationPhase {
    match task {
        "migrate-begin" => MigrationPhase::Begin,
        "migrate-sync" => MigrationPhase::Sync,
        _ => MigrationPhase::Switch,
    }
}

fn optional_migration_phase(task: &str) -> Option<MigrationPhase> {
    match task {
        "migrate-begin" => Some(MigrationPhase::Begin),
        "migrate-sync" => Some(MigrationPhase::Sync),
        "migrate-switch" => Some(MigrationPhase::Switch),
        _ => None,
    }
}
