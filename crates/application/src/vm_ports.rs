mod collaborators;
mod lease;
mod repository;
mod waitlist;
mod workflow;

pub use collaborators::{
    Collaborators, ComputeProvider, Image, ImageProvider, NetworkProvider, NetworkRecord,
    NetworkRef, NicRecord, Package, PackageProvider, ServerCapacity, ServerVmSnapshot,
};
pub use lease::{ReconcilerLease, ReconcilerLeaseCoordinator};
pub use repository::{StoreStatus, VersionedVm, VmRepository, VmSearch, VmSearchPage, VmSort};
pub use waitlist::WaitlistCoordinator;
pub use workflow::{JobsQuery, WorkflowClient};
