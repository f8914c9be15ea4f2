//! Canonical pipelines for provision, lifecycle, NIC, snapshot and tag
//! mutations.

use super::{WorkflowPipeline, WorkflowTask};

const PROVISION_VERSION: &str = "7.1.2";
const LIFECYCLE_VERSION: &str = "7.0.5";
const UPDATE_VERSION: &str = "7.0.9";
const NICS_VERSION: &str = "7.0.4";
const SNAPSHOT_VERSION: &str = "7.0.3";
const REPROVISION_VERSION: &str = "7.0.2";
const DESTROY_VERSION: &str = "7.0.7";
const TAGS_VERSION: &str = "7.0.2";

fn task(name: &str, timeout_seconds: u64, retry: u32) -> WorkflowTask {
    WorkflowTask::new(name, timeout_seconds, retry)
}

fn validate_and_set_action() -> Vec<WorkflowTask> {
    vec![
        task("common.validate_params", 30, 1),
        task("common.set_job_action", 10, 1),
    ]
}

/// Acquire-and-wait pair entering the per-VM serialized section.
fn vm_ticket_entry() -> Vec<WorkflowTask> {
    vec![
        task("waitlist.acquire_vm_ticket", 600, 1),
        task("waitlist.wait_ticket", 600, 1),
    ]
}

fn release_vm_ticket() -> WorkflowTask {
    task("waitlist.release_vm_ticket", 30, 1)
}

/// Fabric-NAT sub-pipeline: ensure a running `nat-<fabric>` zone exists
/// before the parent workflow continues, guarding the provision with a
/// fabric-nat ticket so concurrent requests create exactly one NAT zone.
fn fabric_nat_tasks() -> Vec<WorkflowTask> {
    vec![
        task("fabric.check_nat_zone", 30, 1),
        task("waitlist.acquire_fabric_nat_ticket", 600, 1),
        task("fabric.provision_nat_zone", 120, 1),
        task("fabric.wait_nat_zone", 1200, 1),
        task("waitlist.release_fabric_nat_ticket", 30, 1),
    ]
}

/// Options affecting provision pipeline composition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProvisionPipelineOptions {
    /// Image declares `generate_passwords`.
    pub generate_passwords: bool,
    /// At least one NIC attaches to an owner fabric network.
    pub fabric_nat: bool,
}

/// Provision pipeline. Everything from `cnapi.provision` on runs past the
/// point of no return: the zone may exist, so failures keep NICs for a
/// later sync to reconcile.
#[must_use]
pub fn provision_pipeline(options: ProvisionPipelineOptions) -> WorkflowPipeline {
    let mut pipeline = WorkflowPipeline::new("provision", PROVISION_VERSION, 3810);

    pipeline.tasks = validate_and_set_action();
    pipeline.tasks.push(task("ufds.lookup_owner", 30, 3));
    if options.generate_passwords {
        pipeline.tasks.push(task("imgapi.generate_passwords", 30, 3));
    }
    if options.fabric_nat {
        pipeline.tasks.extend(fabric_nat_tasks());
    }
    pipeline.tasks.extend([
        task("cnapi.ensure_image", 60, 3),
        task("cnapi.wait_ensure_image", 600, 1),
        task("common.prepare_cnapi_payload", 30, 1),
        task("waitlist.acquire_allocation_ticket", 600, 1),
        task("cnapi.provision", 120, 1).past_point_of_no_return(),
        task("cnapi.wait_task", 3600, 1).past_point_of_no_return(),
        task("volapi.add_references", 120, 1).past_point_of_no_return(),
        task("store.put_vm", 60, 3).past_point_of_no_return(),
        task("fwapi.update", 30, 3).past_point_of_no_return(),
        task("waitlist.release_allocation_ticket", 30, 1).past_point_of_no_return(),
    ]);

    pipeline.onerror = vec![
        task("napi.cleanup_nics", 10, 1),
        task("store.mark_vm_failed", 60, 3),
        task("waitlist.release_allocation_ticket", 30, 1),
    ];
    pipeline.oncancel = vec![
        task("cnapi.refresh_vm", 60, 1),
        task("waitlist.release_allocation_ticket", 30, 1),
    ];

    if options.fabric_nat {
        pipeline
            .onerror
            .push(task("waitlist.release_fabric_nat_ticket", 30, 1));
        pipeline
            .oncancel
            .push(task("waitlist.release_fabric_nat_ticket", 30, 1));
    }

    pipeline
}

fn lifecycle_pipeline(kind: &str, cnapi_task: &str) -> WorkflowPipeline {
    let mut pipeline = WorkflowPipeline::new(kind, LIFECYCLE_VERSION, 1410);

    pipeline.tasks = validate_and_set_action();
    pipeline.tasks.extend(vm_ticket_entry());
    pipeline.tasks.extend([
        task(cnapi_task, 60, 1),
        task("cnapi.wait_task", 600, 1),
        task("store.put_vm", 60, 3),
        release_vm_ticket(),
    ]);

    pipeline.onerror = vec![release_vm_ticket()];
    pipeline.oncancel = vec![task("cnapi.refresh_vm", 60, 1), release_vm_ticket()];
    pipeline
}

/// Start pipeline (stopped → running).
#[must_use]
pub fn start_pipeline() -> WorkflowPipeline {
    lifecycle_pipeline("start", "cnapi.start_vm")
}

/// Stop pipeline (running → stopped).
#[must_use]
pub fn stop_pipeline() -> WorkflowPipeline {
    lifecycle_pipeline("stop", "cnapi.stop_vm")
}

/// Reboot pipeline (running → running).
#[must_use]
pub fn reboot_pipeline() -> WorkflowPipeline {
    lifecycle_pipeline("reboot", "cnapi.reboot_vm")
}

/// Update pipeline; a resize additionally serializes on the server's
/// allocation ticket around the capacity-sensitive section.
#[must_use]
pub fn update_pipeline(resize: bool) -> WorkflowPipeline {
    let mut pipeline = WorkflowPipeline::new("update", UPDATE_VERSION, 1800);

    pipeline.tasks = validate_and_set_action();
    pipeline.tasks.extend(vm_ticket_entry());
    if resize {
        pipeline
            .tasks
            .push(task("waitlist.acquire_allocation_ticket", 600, 1));
    }
    pipeline.tasks.extend([
        task("cnapi.update", 60, 1),
        task("cnapi.wait_task", 600, 1),
        task("store.put_vm", 60, 3),
        task("fwapi.update", 30, 3),
    ]);
    if resize {
        pipeline
            .tasks
            .push(task("waitlist.release_allocation_ticket", 30, 1));
    }
    pipeline.tasks.push(release_vm_ticket());

    pipeline.onerror = vec![release_vm_ticket()];
    pipeline.oncancel = vec![task("cnapi.refresh_vm", 60, 1), release_vm_ticket()];
    if resize {
        pipeline
            .onerror
            .push(task("waitlist.release_allocation_ticket", 30, 1));
        pipeline
            .oncancel
            .push(task("waitlist.release_allocation_ticket", 30, 1));
    }

    pipeline
}

/// Add-NICs pipeline. NIC records are created in NAPI before the CN update;
/// the error branch removes any pre-created records.
#[must_use]
pub fn add_nics_pipeline(fabric_nat: bool) -> WorkflowPipeline {
    let mut pipeline = WorkflowPipeline::new("add-nics", NICS_VERSION, 1800);

    pipeline.tasks = vec![
        task("common.validate_params", 30, 1),
        task("common.setup_request", 10, 1),
    ];
    if fabric_nat {
        pipeline.tasks.extend(fabric_nat_tasks());
    }
    pipeline.tasks.extend([
        task("napi.update_network_params", 60, 3),
        task("waitlist.acquire_vm_ticket", 600, 1),
        task("waitlist.wait_ticket", 600, 1),
        task("cnapi.update", 60, 1),
        task("cnapi.wait_task", 600, 1),
        task("common.verify_updated", 60, 1),
        task("store.put_vm", 60, 3),
        task("fwapi.update", 30, 3),
        release_vm_ticket(),
    ]);

    pipeline.onerror = vec![task("napi.cleanup_nics", 10, 1), release_vm_ticket()];
    pipeline.oncancel = vec![release_vm_ticket()];
    if fabric_nat {
        pipeline
            .onerror
            .push(task("waitlist.release_fabric_nat_ticket", 30, 1));
        pipeline
            .oncancel
            .push(task("waitlist.release_fabric_nat_ticket", 30, 1));
    }

    pipeline
}

/// Remove-NICs pipeline.
#[must_use]
pub fn remove_nics_pipeline() -> WorkflowPipeline {
    let mut pipeline = WorkflowPipeline::new("remove-nic", NICS_VERSION, 1800);

    pipeline.tasks = vec![
        task("common.validate_params", 30, 1),
        task("common.setup_request", 10, 1),
    ];
    pipeline.tasks.extend(vm_ticket_entry());
    pipeline.tasks.extend([
        task("napi.delete_nics", 60, 3),
        task("cnapi.update", 60, 1),
        task("cnapi.wait_task", 600, 1),
        task("store.put_vm", 60, 3),
        task("fwapi.update", 30, 3),
        release_vm_ticket(),
    ]);

    pipeline.onerror = vec![release_vm_ticket()];
    pipeline.oncancel = vec![release_vm_ticket()];
    pipeline
}

fn snapshot_pipeline(kind: &str, middle: Vec<WorkflowTask>) -> WorkflowPipeline {
    let mut pipeline = WorkflowPipeline::new(kind, SNAPSHOT_VERSION, 3000);

    pipeline.tasks = validate_and_set_action();
    pipeline.tasks.extend(vm_ticket_entry());
    pipeline.tasks.extend(middle);
    pipeline
        .tasks
        .extend([task("store.put_vm", 60, 3), release_vm_ticket()]);

    pipeline.onerror = vec![release_vm_ticket()];
    pipeline.oncancel = vec![task("cnapi.refresh_vm", 60, 1), release_vm_ticket()];
    pipeline
}

/// Snapshot creation pipeline.
#[must_use]
pub fn create_snapshot_pipeline() -> WorkflowPipeline {
    snapshot_pipeline(
        "snapshot",
        vec![
            task("cnapi.create_snapshot", 60, 1),
            task("cnapi.wait_task", 1800, 1),
        ],
    )
}

/// Snapshot rollback pipeline: the zone is stopped, rolled back and booted
/// again inside the serialized section.
#[must_use]
pub fn rollback_snapshot_pipeline() -> WorkflowPipeline {
    snapshot_pipeline(
        "rollback",
        vec![
            task("cnapi.stop_vm", 60, 1),
            task("cnapi.wait_stop", 600, 1),
            task("cnapi.rollback_snapshot", 60, 1),
            task("cnapi.wait_rollback", 1800, 1),
            task("cnapi.start_vm", 60, 1),
            task("cnapi.wait_start", 600, 1),
        ],
    )
}

/// Snapshot deletion pipeline.
#[must_use]
pub fn delete_snapshot_pipeline() -> WorkflowPipeline {
    snapshot_pipeline(
        "delete-snapshot",
        vec![
            task("cnapi.delete_snapshot", 60, 1),
            task("cnapi.wait_task", 600, 1),
        ],
    )
}

/// Reprovision pipeline: replace the VM's image in place.
#[must_use]
pub fn reprovision_pipeline() -> WorkflowPipeline {
    let mut pipeline = WorkflowPipeline::new("reprovision", REPROVISION_VERSION, 4200);

    pipeline.tasks = validate_and_set_action();
    pipeline.tasks.extend(vm_ticket_entry());
    pipeline.tasks.extend([
        task("cnapi.ensure_image", 60, 3),
        task("cnapi.wait_ensure_image", 600, 1),
        task("cnapi.reprovision", 120, 1),
        task("cnapi.wait_task", 3600, 1),
        task("store.put_vm", 60, 3),
        release_vm_ticket(),
    ]);

    pipeline.onerror = vec![release_vm_ticket()];
    pipeline.oncancel = vec![task("cnapi.refresh_vm", 60, 1), release_vm_ticket()];
    pipeline
}

/// Destroy pipeline. NIC records are removed once the zone is gone; the
/// store keeps the record with `state=destroyed`.
#[must_use]
pub fn destroy_pipeline() -> WorkflowPipeline {
    let mut pipeline = WorkflowPipeline::new("destroy", DESTROY_VERSION, 2400);

    pipeline.tasks = validate_and_set_action();
    pipeline.tasks.extend(vm_ticket_entry());
    pipeline.tasks.extend([
        task("cnapi.destroy", 60, 1),
        task("cnapi.wait_task", 1800, 1),
        task("napi.cleanup_nics", 10, 3),
        task("store.mark_vm_destroyed", 60, 3),
        task("fwapi.update", 30, 3),
        release_vm_ticket(),
    ]);

    pipeline.onerror = vec![release_vm_ticket()];
    pipeline.oncancel = vec![task("cnapi.refresh_vm", 60, 1), release_vm_ticket()];
    pipeline
}

/// Tag mutation pipeline: the store is already authoritative; the pipeline
/// syncs zone metadata and tag-scoped firewall rules.
#[must_use]
pub fn update_tags_pipeline() -> WorkflowPipeline {
    let mut pipeline = WorkflowPipeline::new("update-tags", TAGS_VERSION, 1410);

    pipeline.tasks = validate_and_set_action();
    pipeline.tasks.extend(vm_ticket_entry());
    pipeline.tasks.extend([
        task("cnapi.update", 60, 1),
        task("cnapi.wait_task", 600, 1),
        task("fwapi.update", 30, 3),
        release_vm_ticket(),
    ]);

    pipeline.onerror = vec![release_vm_ticket()];
    pipeline.oncancel = vec![release_vm_ticket()];
    pipeline
}
