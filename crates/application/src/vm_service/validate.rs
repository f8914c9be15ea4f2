//! Synchronous request validation and normalization.
//!
//! Every mutation is validated here before any workflow exists. Schema
//! violations collect into one `ValidationFailed` error array; references
//! rejected by collaborators surface as 422-class errors.

use serde_json::{Map, Value};
use uuid::Uuid;

use zonegrid_core::{AppError, AppResult, FieldError, RequestId};
use zonegrid_domain::{
    Brand, Disk, Locality, MigrationPhase, Vm, validate_firewall_rules, validate_tag_write,
};

use super::VmService;
use crate::vm_ports::{Image, NetworkRecord, NetworkRef, Package};

/// A requested network resolved against the network API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedNetwork {
    /// The authoritative network record.
    pub record: NetworkRecord,
    /// Caller-requested IPv4 address, if any.
    pub requested_ip: Option<String>,
}

/// Fully validated and normalized provision parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionSpec {
    /// VM identifier (caller-provided or generated).
    pub vm_uuid: Uuid,
    /// Owning account.
    pub owner_uuid: Uuid,
    /// Execution model.
    pub brand: Brand,
    /// Source image; `None` for hardware-virtualized VMs (the boot disk
    /// carries it).
    pub image: Option<Image>,
    /// Resolved networks in request order.
    pub networks: Vec<ResolvedNetwork>,
    /// Memory in MiB.
    pub ram: u32,
    /// Package reference; the zero UUID means "no package".
    pub billing_id: Uuid,
    /// Resolved package when `billing_id` is non-zero.
    pub package: Option<Package>,
    /// Disk quota in GiB.
    pub quota: Option<u64>,
    /// Friendly name.
    pub alias: Option<String>,
    /// Boot with the host.
    pub autoboot: bool,
    /// Validated tag set.
    pub tags: Map<String, Value>,
    /// Caller-visible metadata.
    pub customer_metadata: Map<String, Value>,
    /// Operator metadata.
    pub internal_metadata: Map<String, Value>,
    /// Validated firewall rules.
    pub firewall_rules: Value,
    /// Placement affinity hint.
    pub locality: Option<Locality>,
    /// Virtual disks; hardware-virtualized brands only.
    pub disks: Vec<Disk>,
    /// Operator-forced placement.
    pub server_uuid: Option<Uuid>,
    /// Provision came through the docker surface.
    pub docker: bool,
}

/// Fully validated update parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateSpec {
    /// New package, when resizing.
    pub package: Option<Package>,
    /// New memory envelope in MiB.
    pub ram: Option<u32>,
    /// New disk quota in GiB.
    pub quota: Option<u64>,
    /// New alias.
    pub alias: Option<String>,
    /// New autoboot flag.
    pub autoboot: Option<bool>,
    /// Replacement tag set.
    pub tags: Option<Map<String, Value>>,
    /// Replacement caller metadata.
    pub customer_metadata: Option<Map<String, Value>>,
    /// Replacement operator metadata.
    pub internal_metadata: Option<Map<String, Value>>,
    /// True when the new envelope grows RAM.
    pub resize_up: bool,
}

impl VmService {
    /// Validates and normalizes a provision payload.
    pub(crate) async fn validate_provision(
        &self,
        request_id: RequestId,
        payload: &Value,
    ) -> AppResult<ProvisionSpec> {
        let Some(object) = payload.as_object() else {
            return Err(AppError::validation(vec![FieldError::invalid(
                "params",
                "VM parameters must be an object",
            )]));
        };

        let mut errors = Vec::new();

        let owner_uuid = required_uuid(object, "owner_uuid", &mut errors);
        let billing_id = required_uuid(object, "billing_id", &mut errors);
        let brand = match object.get("brand") {
            None => {
                errors.push(FieldError::missing("brand"));
                None
            }
            Some(value) => match value.as_str().map(Brand::parse) {
                Some(Ok(brand)) => Some(brand),
                _ => {
                    errors.push(FieldError::invalid(
                        "brand",
                        format!("Invalid VM brand: {}", display_value(value)),
                    ));
                    None
                }
            },
        };

        let ram = match object.get("ram") {
            None => {
                errors.push(FieldError::missing("ram"));
                None
            }
            Some(value) => match positive_u32(value) {
                Some(ram) => Some(ram),
                None => {
                    errors.push(FieldError::invalid(
                        "ram",
                        "ram must be a positive integer (MiB)",
                    ));
                    None
                }
            },
        };

        let vm_uuid = match object.get("uuid") {
            None => Uuid::new_v4(),
            Some(value) => match value.as_str().and_then(|raw| Uuid::parse_str(raw).ok()) {
                Some(uuid) => uuid,
                None => {
                    errors.push(FieldError::invalid("uuid", "uuid is not a valid UUID"));
                    Uuid::new_v4()
                }
            },
        };

        let is_hvm = brand.as_ref().is_some_and(Brand::is_hvm);
        let disks = parse_disks(object, is_hvm, &mut errors);

        let image_uuid = if is_hvm {
            disks.first().and_then(|disk| disk.image_uuid)
        } else {
            match object.get("image_uuid") {
                None => {
                    errors.push(FieldError::missing("image_uuid"));
                    None
                }
                Some(value) => match value.as_str().and_then(|raw| Uuid::parse_str(raw).ok()) {
                    Some(uuid) => Some(uuid),
                    None => {
                        errors.push(FieldError::invalid(
                            "image_uuid",
                            "image_uuid is not a valid UUID",
                        ));
                        None
                    }
                },
            }
        };

        let network_entries = match object.get("networks") {
            None => {
                errors.push(FieldError::missing("networks"));
                Vec::new()
            }
            Some(Value::Array(entries)) if !entries.is_empty() => entries.clone(),
            Some(_) => {
                errors.push(FieldError::invalid(
                    "networks",
                    "networks must be a non-empty array",
                ));
                Vec::new()
            }
        };

        let docker = object.get("docker").and_then(Value::as_bool).unwrap_or(false);

        let tags = object_map(object.get("tags"));
        if let Err(error) = validate_tag_write(&tags, docker) {
            match error {
                AppError::ValidationFailed {
                    message: _,
                    errors: tag_errors,
                } if !tag_errors.is_empty() => errors.extend(tag_errors),
                other => return Err(other),
            }
        }

        let firewall_rules = object
            .get("firewall_rules")
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));
        errors.extend(validate_firewall_rules(&firewall_rules));

        let locality = match object.get("locality") {
            None => None,
            Some(value) => match Locality::from_value(value) {
                Ok(locality) => Some(locality),
                Err(error) => {
                    if let Some(entries) = error.field_errors() {
                        errors.extend(entries.to_vec());
                    }
                    None
                }
            },
        };

        let alias = match object.get("alias") {
            None => None,
            Some(value) => match value.as_str().filter(|raw| is_valid_alias(raw)) {
                Some(raw) => Some(raw.to_owned()),
                None => {
                    errors.push(FieldError::invalid(
                        "alias",
                        "alias may only contain letters, digits, '-', '_' and '.'",
                    ));
                    None
                }
            },
        };

        let server_uuid = optional_uuid(object, "server_uuid", &mut errors);

        if !errors.is_empty() {
            return Err(AppError::validation(errors));
        }

        // Schema passed; now resolve external references. These surface as
        // 422-class errors rather than joining the 409 array.
        let owner_uuid = owner_uuid.unwrap_or_default();
        let networks = self
            .resolve_networks(request_id, owner_uuid, &network_entries)
            .await?;

        let image = match image_uuid {
            None => None,
            Some(uuid) => Some(self.resolve_image(request_id, uuid).await?),
        };

        let billing_id = billing_id.unwrap_or_default();
        let package = self.resolve_package(request_id, billing_id).await?;

        let quota = match object.get("quota").and_then(Value::as_u64) {
            Some(quota) => Some(quota),
            None => package.as_ref().map(|package| package.quota_gib),
        };

        Ok(ProvisionSpec {
            vm_uuid,
            owner_uuid,
            brand: brand.unwrap_or(Brand::Joyent),
            image,
            networks,
            ram: ram.unwrap_or_default(),
            billing_id,
            package,
            quota,
            alias,
            autoboot: object.get("autoboot").and_then(Value::as_bool).unwrap_or(true),
            tags,
            customer_metadata: object_map(object.get("customer_metadata")),
            internal_metadata: object_map(object.get("internal_metadata")),
            firewall_rules,
            locality,
            disks,
            server_uuid,
            docker,
        })
    }

    /// Validates an update payload against the current VM, including the
    /// resize capacity rule and the bhyve disk policy.
    pub(crate) async fn validate_update(
        &self,
        request_id: RequestId,
        vm: &Vm,
        payload: &Value,
    ) -> AppResult<UpdateSpec> {
        let object = payload.as_object().cloned().unwrap_or_default();
        let mut errors = Vec::new();

        if let Some(owner) = object.get("owner_uuid")
            && owner.as_str().is_none_or(|raw| raw.trim().is_empty())
        {
            errors.push(FieldError::invalid(
                "owner_uuid",
                "owner_uuid must not be empty",
            ));
        }

        let tags = match object.get("tags") {
            None => None,
            Some(value) => {
                let tags = object_map(Some(value));
                if let Err(error) = validate_tag_write(&tags, false) {
                    return Err(error);
                }
                Some(tags)
            }
        };

        let package = match object.get("billing_id") {
            None => None,
            Some(value) => match value.as_str().and_then(|raw| Uuid::parse_str(raw).ok()) {
                None => {
                    errors.push(FieldError::invalid(
                        "billing_id",
                        "billing_id is not a valid UUID",
                    ));
                    None
                }
                Some(uuid) if uuid == Uuid::nil() => None,
                Some(uuid) => match self
                    .collaborators
                    .packages
                    .get_package(request_id, uuid)
                    .await?
                {
                    Some(package) => Some(package),
                    None => {
                        errors.push(FieldError::invalid(
                            "billing_id",
                            format!("Package {uuid} does not exist"),
                        ));
                        None
                    }
                },
            },
        };

        let explicit_ram = match object.get("ram") {
            None => None,
            Some(value) => match positive_u32(value) {
                Some(ram) => Some(ram),
                None => {
                    errors.push(FieldError::invalid(
                        "ram",
                        "ram must be a positive integer (MiB)",
                    ));
                    None
                }
            },
        };

        if !errors.is_empty() {
            return Err(AppError::validation(errors));
        }

        let new_ram = explicit_ram.or(package.as_ref().map(|package| package.ram_mib));
        let resize_up = new_ram.is_some_and(|ram| ram > vm.ram);

        if resize_up {
            self.check_resize_capacity(request_id, vm, new_ram.unwrap_or(vm.ram))
                .await?;
        }

        if let Some(disks) = object.get("disks") {
            self.check_disk_policy(request_id, vm, package.as_ref(), disks)
                .await?;
        }

        Ok(UpdateSpec {
            ram: new_ram,
            quota: object
                .get("quota")
                .and_then(Value::as_u64)
                .or(package.as_ref().map(|package| package.quota_gib)),
            alias: object
                .get("alias")
                .and_then(Value::as_str)
                .map(str::to_owned),
            autoboot: object.get("autoboot").and_then(Value::as_bool),
            tags,
            customer_metadata: object
                .get("customer_metadata")
                .map(|value| object_map(Some(value))),
            internal_metadata: object
                .get("internal_metadata")
                .map(|value| object_map(Some(value))),
            package,
            resize_up,
        })
    }

    /// Resize-up must fit inside the server's advertised capacity;
    /// resize-down is always permitted.
    async fn check_resize_capacity(
        &self,
        request_id: RequestId,
        vm: &Vm,
        new_ram: u32,
    ) -> AppResult<()> {
        vm.ensure_allocated()?;
        let Some(server_uuid) = vm.server_uuid else {
            return Ok(());
        };

        let capacity = self
            .collaborators
            .compute
            .server_capacity(request_id, server_uuid)
            .await?;

        let required = i64::from(new_ram) - i64::from(vm.ram);
        if required > capacity.available_ram_mib {
            return Err(AppError::validation(vec![FieldError::with_code(
                "ram",
                "InsufficientCapacity",
                format!(
                    "Required additional RAM {} exceeds the server's available RAM {}",
                    required, capacity.available_ram_mib
                ),
            )]));
        }

        Ok(())
    }

    /// Disk changes are a bhyve/kvm feature gated on the package's
    /// flexible-disk attribute and its disk envelope.
    async fn check_disk_policy(
        &self,
        request_id: RequestId,
        vm: &Vm,
        new_package: Option<&Package>,
        disks: &Value,
    ) -> AppResult<()> {
        if !vm.brand.is_hvm() {
            return Err(AppError::BrandNotSupported(format!(
                "VM disks may not be changed for the {} brand",
                vm.brand.as_str()
            )));
        }

        let package = match new_package {
            Some(package) => Some(package.clone()),
            None if vm.billing_id != Uuid::nil() => {
                self.collaborators
                    .packages
                    .get_package(request_id, vm.billing_id)
                    .await?
            }
            None => None,
        };

        let Some(package) = package.filter(|package| package.flexible_disk) else {
            return Err(AppError::VmWithoutFlexibleDiskSize(
                "VM's package does not use flexible disk sizing".to_owned(),
            ));
        };

        let requested_mib: u64 = disks
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|disk| disk.get("size").and_then(Value::as_u64))
                    .sum()
            })
            .unwrap_or(0);

        if requested_mib > package.quota_gib.saturating_mul(1024) {
            return Err(AppError::InsufficientDiskSpace(format!(
                "Requested disk size {} MiB exceeds the package disk envelope {} MiB",
                requested_mib,
                package.quota_gib.saturating_mul(1024)
            )));
        }

        Ok(())
    }

    /// Resolves network references, enforcing owner visibility for name
    /// references and surfacing used IPs as externally-attributed errors.
    pub(crate) async fn resolve_networks(
        &self,
        request_id: RequestId,
        owner_uuid: Uuid,
        entries: &[Value],
    ) -> AppResult<Vec<ResolvedNetwork>> {
        let mut resolved = Vec::with_capacity(entries.len());

        for entry in entries {
            let (reference, requested_ip) = parse_network_entry(entry)?;

            let record = match &reference {
                NetworkRef::Uuid(uuid) => {
                    self.collaborators
                        .networks
                        .get_network(request_id, *uuid)
                        .await?
                }
                NetworkRef::Name(name) => self
                    .collaborators
                    .networks
                    .find_network_by_name(request_id, name.as_str())
                    .await?
                    .filter(|record| record.visible_to(owner_uuid)),
            };

            let Some(record) = record else {
                return Err(AppError::UnprocessableEntity(format!(
                    "No such Network or Pool with id/name: \"{}\"",
                    reference.label()
                )));
            };

            if let Some(ip) = &requested_ip
                && let Some(owning_vm) = self
                    .collaborators
                    .networks
                    .ip_owner(request_id, record.uuid, ip.as_str())
                    .await?
            {
                return Err(AppError::invalid_parameters(vec![FieldError::used_by(
                    "zone",
                    owning_vm.to_string(),
                    "ip",
                )]));
            }

            resolved.push(ResolvedNetwork {
                record,
                requested_ip,
            });
        }

        Ok(resolved)
    }

    async fn resolve_image(&self, request_id: RequestId, uuid: Uuid) -> AppResult<Image> {
        let image = self
            .collaborators
            .images
            .get_image(request_id, uuid)
            .await?
            .ok_or_else(|| {
                AppError::validation(vec![FieldError::invalid(
                    "image_uuid",
                    format!("Image {uuid} does not exist"),
                )])
            })?;

        if image.state != "active" {
            return Err(AppError::validation(vec![FieldError::invalid(
                "image_uuid",
                format!("Image {uuid} is not active"),
            )]));
        }

        Ok(image)
    }

    async fn resolve_package(
        &self,
        request_id: RequestId,
        billing_id: Uuid,
    ) -> AppResult<Option<Package>> {
        if billing_id == Uuid::nil() {
            return Ok(None);
        }

        let package = self
            .collaborators
            .packages
            .get_package(request_id, billing_id)
            .await?
            .ok_or_else(|| {
                AppError::validation(vec![FieldError::invalid(
                    "billing_id",
                    format!("Package {billing_id} does not exist"),
                )])
            })?;

        Ok(Some(package))
    }

    /// Validates a migrate request against the VM's migration record,
    /// returning the phase to run.
    pub(crate) async fn validate_migrate_phase(
        &self,
        vm: &Vm,
        payload: &Value,
    ) -> AppResult<MigrationPhase> {
        let phase = match payload.get("migration_action").and_then(Value::as_str) {
            None => MigrationPhase::Begin,
            Some(raw) => MigrationPhase::parse(raw)?,
        };

        let record = self.repository.get_migration(vm.uuid).await?;

        match phase {
            MigrationPhase::Begin => {
                if record.as_ref().is_some_and(zonegrid_domain::MigrationRecord::is_open) {
                    return Err(AppError::validation_message(
                        format!("VM {} already has a migration in progress", vm.uuid),
                        Vec::new(),
                    ));
                }
            }
            MigrationPhase::Sync | MigrationPhase::Switch => {
                let expected_previous = match phase {
                    MigrationPhase::Sync => MigrationPhase::Begin,
                    _ => MigrationPhase::Sync,
                };

                let ready = record.as_ref().is_some_and(|record| {
                    record.is_open()
                        && record.phase == expected_previous
                        && record.state == zonegrid_domain::MigrationState::Paused
                });

                if !ready {
                    return Err(AppError::validation_message(
                        format!(
                            "VM {} migration is not ready for the {} phase",
                            vm.uuid,
                            phase.as_str()
                        ),
                        Vec::new(),
                    ));
                }
            }
        }

        Ok(phase)
    }
}

fn parse_network_entry(entry: &Value) -> AppResult<(NetworkRef, Option<String>)> {
    match entry {
        Value::String(raw) => match Uuid::parse_str(raw) {
            Ok(uuid) => Ok((NetworkRef::Uuid(uuid), None)),
            Err(_) => Ok((NetworkRef::Name(raw.clone()), None)),
        },
        Value::Object(object) => {
            let requested_ip = object
                .get("ipv4_ips")
                .and_then(Value::as_array)
                .and_then(|ips| ips.first())
                .and_then(Value::as_str)
                .map(str::to_owned)
                .or_else(|| object.get("ip").and_then(Value::as_str).map(str::to_owned));

            if let Some(raw) = object.get("uuid").and_then(Value::as_str) {
                let uuid = Uuid::parse_str(raw).map_err(|_| {
                    AppError::validation(vec![FieldError::invalid(
                        "networks",
                        format!("network uuid is malformed: {raw}"),
                    )])
                })?;
                return Ok((NetworkRef::Uuid(uuid), requested_ip));
            }

            if let Some(name) = object.get("name").and_then(Value::as_str) {
                return Ok((NetworkRef::Name(name.to_owned()), requested_ip));
            }

            Err(AppError::validation(vec![FieldError::invalid(
                "networks",
                "each network requires a uuid or name",
            )]))
        }
        _ => Err(AppError::validation(vec![FieldError::invalid(
            "networks",
            "each network must be an object or a UUID string",
        )])),
    }
}

fn parse_disks(
    object: &Map<String, Value>,
    is_hvm: bool,
    errors: &mut Vec<FieldError>,
) -> Vec<Disk> {
    let entries = match object.get("disks") {
        None => {
            if is_hvm {
                errors.push(FieldError::missing("disks"));
            }
            return Vec::new();
        }
        Some(value) => {
            if !is_hvm {
                errors.push(FieldError::invalid(
                    "disks",
                    "disks are only supported for bhyve and kvm brands",
                ));
                return Vec::new();
            }
            match value.as_array() {
                Some(entries) if !entries.is_empty() => entries,
                _ => {
                    errors.push(FieldError::invalid(
                        "disks",
                        "disks must be a non-empty array",
                    ));
                    return Vec::new();
                }
            }
        }
    };

    let mut disks = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        match serde_json::from_value::<Disk>(entry.clone()) {
            Ok(disk) => disks.push(disk),
            Err(error) => errors.push(FieldError::invalid(
                "disks",
                format!("disks[{index}] is malformed: {error}"),
            )),
        }
    }

    if disks.first().is_some_and(|disk| disk.image_uuid.is_none()) {
        errors.push(FieldError::invalid(
            "disks",
            "disks[0].image_uuid is required",
        ));
    }

    disks
}

fn required_uuid(
    object: &Map<String, Value>,
    field: &str,
    errors: &mut Vec<FieldError>,
) -> Option<Uuid> {
    match object.get(field) {
        None => {
            errors.push(FieldError::missing(field));
            None
        }
        Some(value) => match value.as_str().and_then(|raw| Uuid::parse_str(raw).ok()) {
            Some(uuid) => Some(uuid),
            None => {
                errors.push(FieldError::invalid(
                    field,
                    format!("{field} is not a valid UUID"),
                ));
                None
            }
        },
    }
}

fn optional_uuid(
    object: &Map<String, Value>,
    field: &str,
    errors: &mut Vec<FieldError>,
) -> Option<Uuid> {
    match object.get(field) {
        None => None,
        Some(value) => match value.as_str().and_then(|raw| Uuid::parse_str(raw).ok()) {
            Some(uuid) => Some(uuid),
            None => {
                errors.push(FieldError::invalid(
                    field,
                    format!("{field} is not a valid UUID"),
                ));
                None
            }
        },
    }
}

fn object_map(value: Option<&Value>) -> Map<String, Value> {
    value
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

fn positive_u32(value: &Value) -> Option<u32> {
    value
        .as_u64()
        .filter(|raw| *raw > 0)
        .and_then(|raw| u32::try_from(raw).ok())
}

fn is_valid_alias(alias: &str) -> bool {
    !alias.is_empty()
        && alias.chars().all(|character| {
            character.is_ascii_alphanumeric() || matches!(character, '-' | '_' | '.')
        })
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
