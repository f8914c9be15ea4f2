//! Application services and ports for the VM mutation engine.

#![forbid(unsafe_code)]

mod composer;
mod reconciler;
mod vm_ports;
mod vm_service;

pub use composer::{
    ProvisionPipelineOptions, WorkflowPipeline, WorkflowTask, add_nics_pipeline,
    create_snapshot_pipeline, delete_snapshot_pipeline, destroy_pipeline, migrate_begin_pipeline,
    migrate_sync_pipeline, migrate_switch_pipeline, provision_pipeline, reboot_pipeline,
    remove_nics_pipeline, reprovision_pipeline, rollback_snapshot_pipeline, start_pipeline,
    stop_pipeline, update_pipeline, update_tags_pipeline,
};
pub use reconciler::Reconciler;
pub use vm_ports::{
    Collaborators, ComputeProvider, Image, ImageProvider, JobsQuery, NetworkProvider,
    NetworkRecord, NetworkRef, NicRecord, Package, PackageProvider, ReconcilerLease,
    ReconcilerLeaseCoordinator, ServerCapacity, ServerVmSnapshot, StoreStatus, VersionedVm,
    VmRepository, VmSearch, VmSearchPage, VmSort, WaitlistCoordinator, WorkflowClient,
};
pub use vm_service::{ListVmsParams, ProvisionSpec, ResolvedNetwork, UpdateSpec, VmService};
