mod jobs;
mod vms;

pub use jobs::JobsListQuery;
pub use vms::VmJobResponse;
