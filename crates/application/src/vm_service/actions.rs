//! Dispatch of mutations against an existing VM.

use serde_json::{Value, json};
use uuid::Uuid;

use zonegrid_core::{AppError, AppResult, FieldError, RequestContext, RequestId};
use zonegrid_domain::{
    Job, MigrationPhase, MigrationRecord, MigrationState, Ticket, Vm, VmAction,
};

use super::{VmService, job_params};
use crate::composer::{
    WorkflowPipeline, add_nics_pipeline, create_snapshot_pipeline, delete_snapshot_pipeline,
    destroy_pipeline, migrate_begin_pipeline, migrate_sync_pipeline, migrate_switch_pipeline,
    reboot_pipeline, remove_nics_pipeline, reprovision_pipeline, rollback_snapshot_pipeline,
    start_pipeline, stop_pipeline, update_pipeline,
};

impl VmService {
    /// Validates and dispatches a `POST /vms/:uuid` action. Returns the
    /// accepted job.
    pub async fn dispatch_action(
        &self,
        request_id: RequestId,
        context: &RequestContext,
        vm_uuid: Uuid,
        payload: &Value,
    ) -> AppResult<Job> {
        let action = match payload.get("action").and_then(Value::as_str) {
            Some(raw) => VmAction::parse(raw)?,
            None => {
                return Err(AppError::validation(vec![FieldError::missing("action")]));
            }
        };

        let vm = self.load_vm(vm_uuid).await?;
        vm.ensure_action_allowed(action)?;

        match action {
            VmAction::Start => {
                vm.ensure_allocated()?;
                self.dispatch_simple(request_id, context, &vm, "start", start_pipeline())
                    .await
            }
            VmAction::Stop => {
                vm.ensure_allocated()?;
                self.dispatch_simple(request_id, context, &vm, "stop", stop_pipeline())
                    .await
            }
            VmAction::Reboot => {
                vm.ensure_allocated()?;
                self.dispatch_simple(request_id, context, &vm, "reboot", reboot_pipeline())
                    .await
            }
            VmAction::Update => self.dispatch_update(request_id, context, &vm, payload).await,
            VmAction::AddNics => {
                self.dispatch_add_nics(request_id, context, &vm, payload)
                    .await
            }
            VmAction::RemoveNics => {
                self.dispatch_remove_nics(request_id, context, &vm, payload)
                    .await
            }
            VmAction::CreateSnapshot => {
                let name = self.validate_snapshot_name(&vm, payload, true)?;
                self.dispatch_with_payload(
                    request_id,
                    context,
                    &vm,
                    "snapshot",
                    create_snapshot_pipeline(),
                    json!({"snapshot_name": name}),
                )
                .await
            }
            VmAction::RollbackSnapshot => {
                let name = self.validate_snapshot_name(&vm, payload, false)?;
                self.dispatch_with_payload(
                    request_id,
                    context,
                    &vm,
                    "rollback",
                    rollback_snapshot_pipeline(),
                    json!({"snapshot_name": name}),
                )
                .await
            }
            VmAction::DeleteSnapshot => {
                let name = self.validate_snapshot_name(&vm, payload, false)?;
                self.dispatch_with_payload(
                    request_id,
                    context,
                    &vm,
                    "delete-snapshot",
                    delete_snapshot_pipeline(),
                    json!({"snapshot_name": name}),
                )
                .await
            }
            VmAction::Reprovision => {
                self.dispatch_reprovision(request_id, context, &vm, payload)
                    .await
            }
            VmAction::Migrate => self.dispatch_migrate(request_id, context, &vm, payload).await,
            VmAction::Provision | VmAction::Destroy => Err(AppError::validation(vec![
                FieldError::invalid("action", "Invalid action for this endpoint"),
            ])),
        }
    }

    /// Dispatches the destroy workflow for a VM.
    pub async fn destroy(
        &self,
        request_id: RequestId,
        context: &RequestContext,
        vm_uuid: Uuid,
    ) -> AppResult<Job> {
        let vm = self.load_vm(vm_uuid).await?;
        vm.ensure_action_allowed(VmAction::Destroy)?;

        self.dispatch_simple(request_id, context, &vm, "destroy", destroy_pipeline())
            .await
    }

    async fn dispatch_simple(
        &self,
        request_id: RequestId,
        context: &RequestContext,
        vm: &Vm,
        task: &str,
        pipeline: WorkflowPipeline,
    ) -> AppResult<Job> {
        self.dispatch_with_payload(request_id, context, vm, task, pipeline, json!({}))
            .await
    }

    /// Joins the per-VM waitlist, binds params and submits. The ticket id
    /// travels in the job params so the reconciler can release it on any
    /// terminal outcome.
    async fn dispatch_with_payload(
        &self,
        request_id: RequestId,
        context: &RequestContext,
        vm: &Vm,
        task: &str,
        pipeline: WorkflowPipeline,
        payload: Value,
    ) -> AppResult<Job> {
        let ticket = self.join_vm_ticket(request_id, vm.uuid).await?;
        self.submit_with_tickets(request_id, context, vm, task, pipeline, payload, vec![ticket])
            .await
    }

    async fn submit_with_tickets(
        &self,
        request_id: RequestId,
        context: &RequestContext,
        vm: &Vm,
        task: &str,
        pipeline: WorkflowPipeline,
        payload: Value,
        tickets: Vec<Ticket>,
    ) -> AppResult<Job> {
        let ticket_refs: Vec<&Ticket> = tickets.iter().collect();
        let params = job_params(context, Some(vm.uuid), task, payload, &ticket_refs);

        match self
            .workflows
            .submit_pipeline(request_id, pipeline, params)
            .await
        {
            Ok(job) => Ok(job),
            Err(error) => {
                for ticket in &tickets {
                    self.abandon_ticket(ticket).await;
                }
                Err(error)
            }
        }
    }

    async fn dispatch_update(
        &self,
        request_id: RequestId,
        context: &RequestContext,
        vm: &Vm,
        payload: &Value,
    ) -> AppResult<Job> {
        let spec = self.validate_update(request_id, vm, payload).await?;

        let bound = json!({
            "billing_id": spec.package.as_ref().map(|package| package.uuid),
            "ram": spec.ram,
            "quota": spec.quota,
            "alias": spec.alias,
            "autoboot": spec.autoboot,
            "tags": spec.tags,
            "customer_metadata": spec.customer_metadata,
            "internal_metadata": spec.internal_metadata,
        });

        self.dispatch_with_payload(
            request_id,
            context,
            vm,
            "update",
            update_pipeline(spec.resize_up),
            bound,
        )
        .await
    }

    async fn dispatch_add_nics(
        &self,
        request_id: RequestId,
        context: &RequestContext,
        vm: &Vm,
        payload: &Value,
    ) -> AppResult<Job> {
        let entries = payload
            .get("networks")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if entries.is_empty() {
            return Err(AppError::validation(vec![FieldError::missing("networks")]));
        }

        let networks = self
            .resolve_networks(request_id, vm.owner_uuid, &entries)
            .await?;

        for network in &networks {
            if network.record.fabric {
                self.ensure_fabric_nat(request_id, context, vm.owner_uuid, &network.record)
                    .await?;
            }
        }

        // NIC records go into NAPI ahead of the workflow; its error branch
        // removes them again by MAC.
        let spec = super::validate::ProvisionSpec {
            vm_uuid: vm.uuid,
            owner_uuid: vm.owner_uuid,
            brand: vm.brand,
            image: None,
            networks,
            ram: vm.ram,
            billing_id: vm.billing_id,
            package: None,
            quota: vm.quota,
            alias: vm.alias.clone(),
            autoboot: vm.autoboot,
            tags: vm.tags.clone(),
            customer_metadata: vm.customer_metadata.clone(),
            internal_metadata: vm.internal_metadata.clone(),
            firewall_rules: Value::Array(Vec::new()),
            locality: None,
            disks: Vec::new(),
            server_uuid: vm.server_uuid,
            docker: vm.docker,
        };
        let nics = self.precreate_nics(request_id, &spec).await?;

        let fabric_nat = spec.networks.iter().any(|network| network.record.fabric);
        let bound = json!({
            "nic_macs": nics.iter().map(|nic| nic.mac.clone()).collect::<Vec<_>>(),
        });

        let ticket = self.join_vm_ticket(request_id, vm.uuid).await?;
        match self
            .submit_with_tickets(
                request_id,
                context,
                vm,
                "add-nics",
                add_nics_pipeline(fabric_nat),
                bound,
                vec![ticket],
            )
            .await
        {
            Ok(job) => Ok(job),
            Err(error) => {
                self.cleanup_precreated_nics(request_id, &nics).await;
                Err(error)
            }
        }
    }

    async fn dispatch_remove_nics(
        &self,
        request_id: RequestId,
        context: &RequestContext,
        vm: &Vm,
        payload: &Value,
    ) -> AppResult<Job> {
        let macs: Vec<String> = payload
            .get("macs")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        if macs.is_empty() {
            return Err(AppError::validation(vec![FieldError::missing("macs")]));
        }

        for mac in &macs {
            if !vm.nics.iter().any(|nic| nic.mac == *mac) {
                return Err(AppError::validation(vec![FieldError::invalid(
                    "macs",
                    format!("VM has no NIC with MAC {mac}"),
                )]));
            }
        }

        self.dispatch_with_payload(
            request_id,
            context,
            vm,
            "remove-nic",
            remove_nics_pipeline(),
            json!({"nic_macs": macs}),
        )
        .await
    }

    async fn dispatch_reprovision(
        &self,
        request_id: RequestId,
        context: &RequestContext,
        vm: &Vm,
        payload: &Value,
    ) -> AppResult<Job> {
        if vm.brand.is_hvm() {
            return Err(AppError::BrandNotSupported(format!(
                "reprovision is not supported for the {} brand",
                vm.brand.as_str()
            )));
        }

        let image_uuid = payload
            .get("image_uuid")
            .and_then(Value::as_str)
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .ok_or_else(|| AppError::validation(vec![FieldError::missing("image_uuid")]))?;

        let image = self
            .collaborators
            .images
            .get_image(request_id, image_uuid)
            .await?
            .ok_or_else(|| {
                AppError::validation(vec![FieldError::invalid(
                    "image_uuid",
                    format!("Image {image_uuid} does not exist"),
                )])
            })?;

        self.dispatch_with_payload(
            request_id,
            context,
            vm,
            "reprovision",
            reprovision_pipeline(),
            json!({"image_uuid": image.uuid}),
        )
        .await
    }

    async fn dispatch_migrate(
        &self,
        request_id: RequestId,
        context: &RequestContext,
        vm: &Vm,
        payload: &Value,
    ) -> AppResult<Job> {
        vm.ensure_allocated()?;
        let phase = self.validate_migrate_phase(vm, payload).await?;

        let (task, pipeline) = match phase {
            MigrationPhase::Begin => ("migrate-begin", migrate_begin_pipeline()),
            MigrationPhase::Sync => ("migrate-sync", migrate_sync_pipeline()),
            MigrationPhase::Switch => ("migrate-switch", migrate_switch_pipeline()),
        };

        if phase == MigrationPhase::Begin {
            let Some(source_server) = vm.server_uuid else {
                return Err(AppError::UnallocatedVm(format!(
                    "VM {} was never allocated to a server",
                    vm.uuid
                )));
            };

            let record = MigrationRecord {
                vm_uuid: vm.uuid,
                source_server_uuid: source_server,
                target_server_uuid: None,
                phase: MigrationPhase::Begin,
                state: MigrationState::Running,
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
                progress_history: Vec::new(),
            };
            self.repository.put_migration(record).await?;
        }

        self.dispatch_with_payload(
            request_id,
            context,
            vm,
            task,
            pipeline,
            json!({"migration_action": phase.as_str()}),
        )
        .await
    }

    fn validate_snapshot_name(
        &self,
        vm: &Vm,
        payload: &Value,
        creating: bool,
    ) -> AppResult<String> {
        if vm.brand == zonegrid_domain::Brand::Kvm {
            return Err(AppError::BrandNotSupported(
                "snapshots are not supported for the kvm brand".to_owned(),
            ));
        }

        let name = match payload.get("snapshot_name").and_then(Value::as_str) {
            Some(raw) if !raw.trim().is_empty() => raw.to_owned(),
            Some(_) | None if creating => {
                format!("snapshot-{}", chrono::Utc::now().format("%Y%m%dT%H%M%SZ"))
            }
            _ => {
                return Err(AppError::validation(vec![FieldError::missing(
                    "snapshot_name",
                )]));
            }
        };

        let exists = vm.snapshots.iter().any(|snapshot| snapshot.name == name);
        if creating && exists {
            return Err(AppError::validation(vec![FieldError::invalid(
                "snapshot_name",
                format!("Snapshot \"{name}\" already exists"),
            )]));
        }
        if !creating && !exists {
            return Err(AppError::validation(vec![FieldError::invalid(
                "snapshot_name",
                format!("Snapshot \"{name}\" does not exist"),
            )]));
        }

        Ok(name)
    }
}
