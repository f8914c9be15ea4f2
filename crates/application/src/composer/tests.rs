use super::{
    ProvisionPipelineOptions, WorkflowPipeline, add_nics_pipeline, create_snapshot_pipeline,
    delete_snapshot_pipeline, destroy_pipeline, migrate_begin_pipeline, migrate_sync_pipeline,
    migrate_switch_pipeline, provision_pipeline, reboot_pipeline, remove_nics_pipeline,
    reprovision_pipeline, rollback_snapshot_pipeline, start_pipeline, stop_pipeline,
    update_pipeline, update_tags_pipeline,
};

fn all_ticketed_pipelines() -> Vec<WorkflowPipeline> {
    vec![
        provision_pipeline(ProvisionPipelineOptions {
            generate_passwords: true,
            fabric_nat: true,
        }),
        start_pipeline(),
        stop_pipeline(),
        reboot_pipeline(),
        update_pipeline(true),
        update_pipeline(false),
        add_nics_pipeline(true),
        add_nics_pipeline(false),
        remove_nics_pipeline(),
        create_snapshot_pipeline(),
        rollback_snapshot_pipeline(),
        delete_snapshot_pipeline(),
        reprovision_pipeline(),
        destroy_pipeline(),
        update_tags_pipeline(),
        migrate_begin_pipeline(),
        migrate_sync_pipeline(),
        migrate_switch_pipeline(),
    ]
}

#[test]
fn every_pipeline_releases_tickets_on_error_and_cancel() {
    for pipeline in all_ticketed_pipelines() {
        assert!(
            pipeline.releases_tickets_on_all_paths(),
            "pipeline '{}' leaks a ticket on an error or cancel path",
            pipeline.name
        );
    }
}

#[test]
fn provision_carries_canonical_timeouts() {
    let pipeline = provision_pipeline(ProvisionPipelineOptions::default());

    assert_eq!(pipeline.timeout_seconds, 3810);

    let wait_task = pipeline
        .tasks
        .iter()
        .find(|task| task.name == "cnapi.wait_task")
        .unwrap();
    assert_eq!(wait_task.timeout_seconds, 3600);

    let cleanup = pipeline
        .onerror
        .iter()
        .find(|task| task.name == "napi.cleanup_nics")
        .unwrap();
    assert_eq!(cleanup.timeout_seconds, 10);
}

#[test]
fn provision_flips_cleanup_semantics_at_point_of_no_return() {
    let pipeline = provision_pipeline(ProvisionPipelineOptions::default());

    let provision_index = pipeline
        .tasks
        .iter()
        .position(|task| task.name == "cnapi.provision")
        .unwrap();

    for (index, task) in pipeline.tasks.iter().enumerate() {
        assert_eq!(
            task.mark_as_failed_on_error,
            index < provision_index,
            "task '{}' has the wrong cleanup marker",
            task.name
        );
    }
}

#[test]
fn fabric_option_inserts_nat_sub_pipeline_with_its_own_ticket() {
    let without = provision_pipeline(ProvisionPipelineOptions::default());
    assert!(!without.task_names().contains(&"fabric.provision_nat_zone"));

    let with = provision_pipeline(ProvisionPipelineOptions {
        generate_passwords: false,
        fabric_nat: true,
    });
    let names = with.task_names();
    let check = names.iter().position(|name| *name == "fabric.check_nat_zone");
    let acquire = names
        .iter()
        .position(|name| *name == "waitlist.acquire_fabric_nat_ticket");
    let provision = names
        .iter()
        .position(|name| *name == "fabric.provision_nat_zone");
    let wait = names.iter().position(|name| *name == "fabric.wait_nat_zone");

    assert!(check < acquire && acquire < provision && provision < wait);
}

#[test]
fn migrate_begin_releases_vm_ticket_before_target_provision() {
    let pipeline = migrate_begin_pipeline();
    let names = pipeline.task_names();

    let record = names
        .iter()
        .position(|name| *name == "store.store_migration_record")
        .unwrap();
    let release = names
        .iter()
        .position(|name| *name == "waitlist.release_vm_ticket")
        .unwrap();
    let provision_target = names
        .iter()
        .position(|name| *name == "cnapi.provision_target")
        .unwrap();

    assert!(record < release && release < provision_target);
}

#[test]
fn migrate_switch_restores_source_on_error() {
    let pipeline = migrate_switch_pipeline();
    let onerror: Vec<&str> = pipeline.onerror.iter().map(|task| task.name.as_str()).collect();

    assert!(onerror.contains(&"napi.unreserve_target_ips"));
    assert!(onerror.contains(&"cnapi.restart_source"));
}

#[test]
fn resize_update_serializes_on_the_allocation_ticket() {
    let resize = update_pipeline(true);
    assert!(
        resize
            .task_names()
            .contains(&"waitlist.acquire_allocation_ticket")
    );

    let plain = update_pipeline(false);
    assert!(
        !plain
            .task_names()
            .contains(&"waitlist.acquire_allocation_ticket")
    );
}

#[test]
fn pipeline_names_carry_task_and_version() {
    let pipeline = destroy_pipeline();
    assert!(pipeline.name.starts_with("destroy-"));
    assert_eq!(pipeline.task, "destroy");
}
