use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use zonegrid_core::{AppError, AppResult, FieldError};

use crate::firewall::FirewallRule;

/// Execution model of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Brand {
    /// Native zone.
    Joyent,
    /// Minimal native zone.
    JoyentMinimal,
    /// Linux-branded zone.
    Lx,
    /// Hardware virtualization (bhyve).
    Bhyve,
    /// Hardware virtualization (kvm).
    Kvm,
}

impl Brand {
    /// Returns the stable storage value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Joyent => "joyent",
            Self::JoyentMinimal => "joyent-minimal",
            Self::Lx => "lx",
            Self::Bhyve => "bhyve",
            Self::Kvm => "kvm",
        }
    }

    /// Parses a storage value.
    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "joyent" => Ok(Self::Joyent),
            "joyent-minimal" => Ok(Self::JoyentMinimal),
            "lx" => Ok(Self::Lx),
            "bhyve" => Ok(Self::Bhyve),
            "kvm" => Ok(Self::Kvm),
            _ => Err(AppError::validation(vec![FieldError::invalid(
                "brand",
                format!("Invalid VM brand: {value}"),
            )])),
        }
    }

    /// True for hardware-virtualized brands, which carry `disks` instead of
    /// an `image_uuid`/`quota` pair.
    #[must_use]
    pub fn is_hvm(&self) -> bool {
        matches!(self, Self::Bhyve | Self::Kvm)
    }
}

/// Observable VM lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    /// Provision workflow accepted, zone not yet created.
    Provisioning,
    /// Zone is up.
    Running,
    /// Zone exists but is halted.
    Stopped,
    /// Provision workflow failed.
    Failed,
    /// Destroy workflow succeeded. Terminal.
    Destroyed,
}

impl VmState {
    /// Returns the stable storage value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Destroyed => "destroyed",
        }
    }

    /// Parses a storage value.
    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "provisioning" => Ok(Self::Provisioning),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "failed" => Ok(Self::Failed),
            "destroyed" => Ok(Self::Destroyed),
            _ => Err(AppError::validation(vec![FieldError::invalid(
                "state",
                format!("Invalid VM state: {value}"),
            )])),
        }
    }

    /// `state=active` search shortcut: neither destroyed nor failed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Destroyed | Self::Failed)
    }
}

/// Mutation kinds accepted by the API surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmAction {
    /// Create a new VM.
    Provision,
    /// Boot a stopped VM.
    Start,
    /// Halt a running VM.
    Stop,
    /// Reboot a running VM.
    Reboot,
    /// Change package, autoboot, metadata, tags or resources.
    Update,
    /// Attach network interfaces.
    AddNics,
    /// Detach network interfaces.
    RemoveNics,
    /// Take a snapshot.
    CreateSnapshot,
    /// Roll back to a snapshot.
    RollbackSnapshot,
    /// Delete a snapshot.
    DeleteSnapshot,
    /// Replace the VM's image in place.
    Reprovision,
    /// Drive a migration phase.
    Migrate,
    /// Destroy the VM.
    Destroy,
}

impl VmAction {
    /// Parses the `action` value of a `POST /vms/:uuid` body.
    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "reboot" => Ok(Self::Reboot),
            "update" => Ok(Self::Update),
            "add_nics" => Ok(Self::AddNics),
            "remove_nics" => Ok(Self::RemoveNics),
            "create_snapshot" => Ok(Self::CreateSnapshot),
            "rollback_snapshot" => Ok(Self::RollbackSnapshot),
            "delete_snapshot" => Ok(Self::DeleteSnapshot),
            "reprovision" => Ok(Self::Reprovision),
            "migrate" => Ok(Self::Migrate),
            _ => Err(AppError::validation(vec![FieldError::invalid(
                "action",
                format!("Invalid action: {value}"),
            )])),
        }
    }
}

/// Denormalized network interface view held on the VM record.
///
/// The authoritative NIC record lives in the network API, keyed by
/// `belongs_to_uuid = vm.uuid`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nic {
    /// Interface hardware address.
    pub mac: String,
    /// Assigned IPv4 address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Physical tag the interface attaches through.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nic_tag: Option<String>,
    /// Owning logical network.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_uuid: Option<Uuid>,
    /// Interface state as reported by the network API.
    pub state: String,
    /// Whether this is the VM's primary interface.
    #[serde(default)]
    pub primary: bool,
    /// Whether the owning network is a tenant fabric overlay.
    #[serde(default)]
    pub fabric: bool,
}

/// Virtual disk of a hardware-virtualized VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    /// Source image for the boot disk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_uuid: Option<Uuid>,
    /// Disk size in MiB.
    pub size: u64,
    /// Whether the VM boots from this disk.
    #[serde(default)]
    pub boot: bool,
}

/// A named point-in-time snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot name, unique per VM.
    pub name: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// A provisioned compute instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vm {
    /// Unique, immutable identifier.
    pub uuid: Uuid,
    /// Owning account.
    pub owner_uuid: Uuid,
    /// Friendly name, unique per owner by convention.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Execution model.
    pub brand: Brand,
    /// Lifecycle state.
    pub state: VmState,
    /// Package reference; the zero UUID means "no package".
    pub billing_id: Uuid,
    /// Source image; absent for hardware-virtualized VMs with disks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_uuid: Option<Uuid>,
    /// Memory in MiB. Mirrored as `max_physical_memory` on the wire.
    pub ram: u32,
    /// Disk quota in GiB; unknown once the VM is destroyed.
    pub quota: Option<u64>,
    /// CPU cap in percent of one core.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_cap: Option<u32>,
    /// Fair-share scheduler weight.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_shares: Option<u32>,
    /// Swap ceiling in MiB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_swap: Option<u32>,
    /// LWP ceiling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_lwps: Option<u32>,
    /// ZFS I/O scheduling priority.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zfs_io_priority: Option<u32>,
    /// Current host; absent until placement succeeds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_uuid: Option<Uuid>,
    /// Whether the zone boots with its host.
    pub autoboot: bool,
    /// Whether the VM was provisioned through the docker surface.
    #[serde(default)]
    pub docker: bool,
    /// Whether the firewall is enabled for this VM.
    #[serde(default)]
    pub firewall_enabled: bool,
    /// Provision acceptance time.
    pub create_timestamp: DateTime<Utc>,
    /// Denormalized interface set.
    #[serde(default)]
    pub nics: Vec<Nic>,
    /// Tag collection; scalar values only.
    #[serde(default)]
    pub tags: Map<String, Value>,
    /// Caller-visible metadata.
    #[serde(default)]
    pub customer_metadata: Map<String, Value>,
    /// Operator metadata.
    #[serde(default)]
    pub internal_metadata: Map<String, Value>,
    /// Firewall rules scoped to this VM.
    #[serde(default)]
    pub firewall_rules: Vec<FirewallRule>,
    /// Snapshots taken of this VM.
    #[serde(default)]
    pub snapshots: Vec<Snapshot>,
    /// Virtual disks; hardware-virtualized brands only.
    #[serde(default)]
    pub disks: Vec<Disk>,
}

impl Vm {
    /// True unless the VM is destroyed or failed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Returns the fabric network uuids this VM has interfaces on.
    #[must_use]
    pub fn fabric_network_uuids(&self) -> Vec<Uuid> {
        self.nics
            .iter()
            .filter(|nic| nic.fabric)
            .filter_map(|nic| nic.network_uuid)
            .collect()
    }

    /// Checks that `action` is legal given the VM's current state.
    ///
    /// While provisioning, destroy is the only permitted mutation. Failed
    /// VMs accept destroy only. Start requires a stopped VM; stop, reboot
    /// and migrate require a running one.
    pub fn ensure_action_allowed(&self, action: VmAction) -> AppResult<()> {
        if action == VmAction::Destroy {
            if self.state == VmState::Destroyed {
                return Err(AppError::validation_message(
                    format!("VM {} is already destroyed", self.uuid),
                    Vec::new(),
                ));
            }
            return Ok(());
        }

        match self.state {
            VmState::Provisioning => Err(AppError::validation_message(
                format!("VM {} is provisioning; only destroy is allowed", self.uuid),
                Vec::new(),
            )),
            VmState::Failed => Err(AppError::UnallocatedVm(format!(
                "VM {} never provisioned; only destroy is allowed",
                self.uuid
            ))),
            VmState::Destroyed => Err(AppError::validation_message(
                format!("VM {} is destroyed", self.uuid),
                Vec::new(),
            )),
            VmState::Running => match action {
                VmAction::Start => Err(AppError::VmNotStopped(
                    "Cannot start a VM from a 'running' state".to_owned(),
                )),
                _ => Ok(()),
            },
            VmState::Stopped => match action {
                VmAction::Stop | VmAction::Reboot => Err(AppError::VmNotRunning(
                    "Cannot perform this action on a VM in a 'stopped' state".to_owned(),
                )),
                VmAction::Migrate => Err(AppError::VmNotRunning(
                    "Migration requires a running VM".to_owned(),
                )),
                _ => Ok(()),
            },
        }
    }

    /// Checks that the VM has been placed on a server.
    pub fn ensure_allocated(&self) -> AppResult<()> {
        if self.server_uuid.is_none() {
            return Err(AppError::UnallocatedVm(format!(
                "VM {} was never allocated to a server",
                self.uuid
            )));
        }

        Ok(())
    }

    /// Public wire representation: the serde form plus the mirrored
    /// `max_physical_memory` field and stringly state/brand values usable by
    /// the query engine.
    #[must_use]
    pub fn to_public_value(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(fields) = &mut value {
            fields.insert(
                "max_physical_memory".to_owned(),
                Value::from(u64::from(self.ram)),
            );
        }
        value
    }
}
