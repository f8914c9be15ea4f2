//! Infrastructure adapters for application ports.

#![forbid(unsafe_code)]

mod http_compute_client;
mod http_image_client;
mod http_network_client;
mod http_package_client;
mod http_workflow_client;
mod in_memory_vm_repository;
mod in_memory_waitlist_coordinator;
mod postgres_vm_repository;
mod redis_reconciler_lease;
mod redis_waitlist_coordinator;

pub use http_compute_client::HttpComputeClient;
pub use http_image_client::HttpImageClient;
pub use http_network_client::HttpNetworkClient;
pub use http_package_client::HttpPackageClient;
pub use http_workflow_client::HttpWorkflowClient;
pub use in_memory_vm_repository::InMemoryVmRepository;
pub use in_memory_waitlist_coordinator::InMemoryWaitlistCoordinator;
pub use postgres_vm_repository::PostgresVmRepository;
pub use redis_reconciler_lease::RedisReconcilerLeaseCoordinator;
pub use redis_waitlist_coordinator::RedisWaitlistCoordinator;
