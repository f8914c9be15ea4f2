//! Migration pipelines: begin, sync, switch.
//!
//! Begin releases the per-VM ticket right after the initial migration
//! record is stored so other VM operations can proceed during the long
//! asynchronous data copy; switch holds it across the cutover.

use super::{WorkflowPipeline, WorkflowTask};

const MIGRATE_VERSION: &str = "1.0.8";

fn task(name: &str, timeout_seconds: u64, retry: u32) -> WorkflowTask {
    WorkflowTask::new(name, timeout_seconds, retry)
}

/// Migrate-begin: reserve a target server, provision the target zone shell
/// and store the initial migration record.
#[must_use]
pub fn migrate_begin_pipeline() -> WorkflowPipeline {
    let mut pipeline = WorkflowPipeline::new("migrate-begin", MIGRATE_VERSION, 7200);

    pipeline.tasks = vec![
        task("common.validate_params", 30, 1),
        task("common.set_job_action", 10, 1),
        task("cnapi.capture_source_filesystem", 120, 1),
        task("common.create_target_payload", 30, 1),
        task("waitlist.acquire_allocation_ticket", 600, 1),
        task("cnapi.allocate_server", 120, 1),
        task("waitlist.release_allocation_ticket", 30, 1),
        task("waitlist.acquire_vm_ticket", 600, 1),
        task("waitlist.wait_ticket", 600, 1),
        task("store.store_migration_record", 60, 3),
        task("waitlist.release_vm_ticket", 30, 1),
        task("cnapi.provision_target", 120, 1),
        task("common.set_create_timestamp", 10, 1),
        task("cnapi.capture_target_filesystem", 120, 1),
        task("cnapi.remove_sync_quotas", 60, 1),
        task("store.store_migration_success", 60, 3),
        task("common.chain_next_phase", 10, 1),
    ];

    pipeline.onerror = vec![
        task("store.store_migration_failure", 60, 3),
        task("waitlist.release_vm_ticket", 30, 1),
        task("waitlist.release_allocation_ticket", 30, 1),
    ];
    pipeline.oncancel = pipeline.onerror.clone();
    pipeline
}

/// Migrate-sync: incremental data copy while the source keeps running.
#[must_use]
pub fn migrate_sync_pipeline() -> WorkflowPipeline {
    let mut pipeline = WorkflowPipeline::new("migrate-sync", MIGRATE_VERSION, 15000);

    pipeline.tasks = vec![
        task("common.validate_params", 30, 1),
        task("common.set_job_action", 10, 1),
        task("waitlist.acquire_vm_ticket", 600, 1),
        task("waitlist.wait_ticket", 600, 1),
        task("cnapi.cleanup_sync_processes", 60, 1),
        task("store.store_migration_record", 60, 3),
        task("waitlist.release_vm_ticket", 30, 1),
        task("cnapi.start_source_sync", 60, 1),
        task("cnapi.start_target_sync", 60, 1),
        task("store.record_sync_processes", 30, 3),
        task("cnapi.run_sync", 14400, 1),
        task("store.store_migration_success", 60, 3),
        task("common.chain_next_phase", 10, 1),
    ];

    pipeline.onerror = vec![
        task("cnapi.cleanup_sync_processes", 60, 1),
        task("store.store_migration_failure", 60, 3),
        task("waitlist.release_vm_ticket", 30, 1),
    ];
    pipeline.oncancel = pipeline.onerror.clone();
    pipeline
}

/// Migrate-switch: final sync, IP reservation on the target, filesystem
/// cutover and server swap.
#[must_use]
pub fn migrate_switch_pipeline() -> WorkflowPipeline {
    let mut pipeline = WorkflowPipeline::new("migrate-switch", MIGRATE_VERSION, 7200);

    pipeline.tasks = vec![
        task("common.validate_params", 30, 1),
        task("common.set_job_action", 10, 1),
        task("cnapi.stop_source", 60, 1),
        task("cnapi.run_final_sync", 3600, 1),
        task("waitlist.acquire_vm_ticket", 600, 1),
        task("waitlist.wait_ticket", 600, 1),
        task("cnapi.ensure_vm_stopped", 120, 1),
        task("napi.reserve_target_ips", 60, 3),
        task("store.store_ip_reservation", 30, 3),
        task("cnapi.copy_core_filesystem", 600, 1),
        task("cnapi.setup_target_filesystem", 120, 1),
        task("cnapi.set_target_autoboot", 30, 1),
        task("cnapi.set_source_do_not_inventory", 30, 1),
        task("store.swap_server_uuid", 60, 3),
        task("cnapi.remove_target_do_not_inventory", 30, 1),
        task("store.store_migration_success", 60, 3),
        task("waitlist.release_vm_ticket", 30, 1),
        task("cnapi.start_target", 60, 1),
    ];

    pipeline.onerror = vec![
        task("store.store_migration_failure", 60, 3),
        task("napi.unreserve_target_ips", 30, 1),
        task("cnapi.restart_source", 60, 1),
        task("waitlist.release_vm_ticket", 30, 1),
    ];
    pipeline.oncancel = pipeline.onerror.clone();
    pipeline
}
