use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use zonegrid_core::{AppResult, RequestId};
use zonegrid_domain::VmState;

/// A logical network or pool as known to the network API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRecord {
    /// Network identifier.
    pub uuid: Uuid,
    /// Network name, unique per owner.
    pub name: String,
    /// Accounts allowed to attach; empty means globally visible.
    #[serde(default)]
    pub owner_uuids: Vec<Uuid>,
    /// Whether this is a tenant fabric overlay requiring a NAT zone.
    #[serde(default)]
    pub fabric: bool,
}

impl NetworkRecord {
    /// True when `owner` may reference this network by name.
    #[must_use]
    pub fn visible_to(&self, owner: Uuid) -> bool {
        self.owner_uuids.is_empty() || self.owner_uuids.contains(&owner)
    }
}

/// A network reference from a provision or add-nics payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkRef {
    /// Reference by network uuid.
    Uuid(Uuid),
    /// Reference by owner-visible or global network name.
    Name(String),
}

impl NetworkRef {
    /// Returns the raw reference for error messages.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::Uuid(uuid) => uuid.to_string(),
            Self::Name(name) => name.clone(),
        }
    }
}

/// An authoritative NIC record held by the network API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicRecord {
    /// Interface hardware address.
    pub mac: String,
    /// Assigned IPv4 address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Owning logical network.
    pub network_uuid: Uuid,
    /// Resource kind the NIC belongs to; always `zone` for VM NICs.
    pub belongs_to_type: String,
    /// VM this NIC belongs to.
    pub belongs_to_uuid: Uuid,
    /// Account owning the NIC.
    pub owner_uuid: Uuid,
    /// Interface state.
    pub state: String,
    /// Whether this is the VM's primary interface.
    #[serde(default)]
    pub primary: bool,
    /// Whether the owning network is a fabric overlay.
    #[serde(default)]
    pub fabric: bool,
}

/// Network API port (NIC CRUD plus network lookup).
#[async_trait]
pub trait NetworkProvider: Send + Sync {
    /// Fetches a network or pool by uuid.
    async fn get_network(
        &self,
        request_id: RequestId,
        uuid: Uuid,
    ) -> AppResult<Option<NetworkRecord>>;

    /// Fetches a network by name.
    async fn find_network_by_name(
        &self,
        request_id: RequestId,
        name: &str,
    ) -> AppResult<Option<NetworkRecord>>;

    /// Returns the VM currently holding `ip` on the network, if any.
    async fn ip_owner(
        &self,
        request_id: RequestId,
        network_uuid: Uuid,
        ip: &str,
    ) -> AppResult<Option<Uuid>>;

    /// Creates a NIC record ahead of provisioning.
    async fn create_nic(&self, request_id: RequestId, nic: NicRecord) -> AppResult<NicRecord>;

    /// Lists NIC records by owning VM.
    async fn list_nics(
        &self,
        request_id: RequestId,
        belongs_to_uuid: Uuid,
    ) -> AppResult<Vec<NicRecord>>;

    /// Deletes a NIC record by hardware address.
    async fn delete_nic(&self, request_id: RequestId, mac: &str) -> AppResult<()>;
}

/// Advertised capacity of a compute node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCapacity {
    /// The server in question.
    pub server_uuid: Uuid,
    /// Unreserved RAM in MiB; negative when overcommitted.
    pub available_ram_mib: i64,
}

/// Point-in-time VM state as reported by the compute node agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerVmSnapshot {
    /// Zone state on the server.
    pub state: VmState,
}

/// Compute node API port.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Fetches the advertised capacity of a server.
    async fn server_capacity(
        &self,
        request_id: RequestId,
        server_uuid: Uuid,
    ) -> AppResult<ServerCapacity>;

    /// Fetches the live state of a VM on its server.
    async fn vm_snapshot(
        &self,
        request_id: RequestId,
        server_uuid: Uuid,
        vm_uuid: Uuid,
    ) -> AppResult<Option<ServerVmSnapshot>>;
}

/// A named resource envelope referenced by `billing_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    /// Package identifier.
    pub uuid: Uuid,
    /// Package name.
    pub name: String,
    /// Memory envelope in MiB.
    pub ram_mib: u32,
    /// Disk envelope in GiB.
    pub quota_gib: u64,
    /// CPU cap in percent of one core.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_cap: Option<u32>,
    /// Swap ceiling in MiB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_swap: Option<u32>,
    /// LWP ceiling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_lwps: Option<u32>,
    /// ZFS I/O scheduling priority.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zfs_io_priority: Option<u32>,
    /// Whether disks may be resized independently of the envelope.
    #[serde(default)]
    pub flexible_disk: bool,
}

/// Package catalog port.
#[async_trait]
pub trait PackageProvider: Send + Sync {
    /// Fetches a package by uuid.
    async fn get_package(&self, request_id: RequestId, uuid: Uuid) -> AppResult<Option<Package>>;
}

/// An installable machine image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Image identifier.
    pub uuid: Uuid,
    /// Image name.
    pub name: String,
    /// Operating system family.
    pub os: String,
    /// Image lifecycle state; only `active` images provision.
    pub state: String,
    /// Whether provisioning must generate credentials for this image.
    #[serde(default)]
    pub generate_passwords: bool,
}

/// Image service port.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Fetches an image by uuid.
    async fn get_image(&self, request_id: RequestId, uuid: Uuid) -> AppResult<Option<Image>>;
}

/// Dependency-injected bundle of external service ports, passed from the
/// composition root.
#[derive(Clone)]
pub struct Collaborators {
    /// Network API.
    pub networks: Arc<dyn NetworkProvider>,
    /// Compute node API.
    pub compute: Arc<dyn ComputeProvider>,
    /// Package catalog.
    pub packages: Arc<dyn PackageProvider>,
    /// Image service.
    pub images: Arc<dyn ImageProvider>,
}
