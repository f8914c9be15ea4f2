//! Provision dispatch: NIC pre-creation, fabric-NAT dependency handling and
//! pipeline submission.

use chrono::Utc;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use zonegrid_core::{AppResult, RequestContext, RequestId};
use zonegrid_domain::{Brand, Job, Nic, TicketScope, TicketState, Vm, VmState};

use super::{VmService, job_params};
use crate::composer::{ProvisionPipelineOptions, provision_pipeline};
use crate::vm_ports::{NetworkRecord, NicRecord};
use crate::vm_service::validate::ProvisionSpec;

impl VmService {
    /// Validates a provision request, persists the VM in `provisioning`
    /// state and submits the provision pipeline. Returns the VM uuid and
    /// the accepted job.
    pub async fn provision(
        &self,
        request_id: RequestId,
        context: &RequestContext,
        payload: &Value,
    ) -> AppResult<(Uuid, Job)> {
        let spec = self.validate_provision(request_id, payload).await?;

        // A NAT zone must exist for every owner fabric before the parent
        // provision proceeds.
        for network in &spec.networks {
            if network.record.fabric {
                self.ensure_fabric_nat(request_id, context, spec.owner_uuid, &network.record)
                    .await?;
            }
        }

        let nics = self.precreate_nics(request_id, &spec).await?;
        let vm = build_vm_record(&spec, &nics);

        if let Err(error) = self.repository.put_vm(vm.clone(), None).await {
            self.cleanup_precreated_nics(request_id, &nics).await;
            return Err(error);
        }

        self.persist_role_tags(&vm).await?;

        let pipeline = provision_pipeline(ProvisionPipelineOptions {
            generate_passwords: spec
                .image
                .as_ref()
                .is_some_and(|image| image.generate_passwords),
            fabric_nat: spec.networks.iter().any(|network| network.record.fabric),
        });

        let payload = json!({
            "owner_uuid": spec.owner_uuid,
            "brand": spec.brand,
            "image_uuid": spec.image.as_ref().map(|image| image.uuid),
            "billing_id": spec.billing_id,
            "ram": spec.ram,
            "quota": spec.quota,
            "alias": spec.alias,
            "autoboot": spec.autoboot,
            "networks": spec
                .networks
                .iter()
                .map(|network| network.record.uuid)
                .collect::<Vec<_>>(),
            "nic_macs": nics.iter().map(|nic| nic.mac.clone()).collect::<Vec<_>>(),
            "locality": spec.locality,
            "firewall_rules": spec.firewall_rules,
            "server_uuid": spec.server_uuid,
            "internal_metadata": spec.internal_metadata,
        });

        let params = job_params(context, Some(vm.uuid), "provision", payload, &[]);
        match self
            .workflows
            .submit_pipeline(request_id, pipeline, params)
            .await
        {
            Ok(job) => Ok((vm.uuid, job)),
            Err(error) => {
                self.cleanup_precreated_nics(request_id, &nics).await;
                self.mark_vm_failed_best_effort(vm.uuid).await;
                Err(error)
            }
        }
    }

    /// Creates the NIC records in the network API ahead of provisioning, so
    /// a failed workflow can clean them up by `belongs_to_uuid`.
    pub(crate) async fn precreate_nics(
        &self,
        request_id: RequestId,
        spec: &ProvisionSpec,
    ) -> AppResult<Vec<NicRecord>> {
        let mut created = Vec::with_capacity(spec.networks.len());

        for (index, network) in spec.networks.iter().enumerate() {
            let nic = NicRecord {
                mac: generated_mac(),
                ip: network.requested_ip.clone(),
                network_uuid: network.record.uuid,
                belongs_to_type: "zone".to_owned(),
                belongs_to_uuid: spec.vm_uuid,
                owner_uuid: spec.owner_uuid,
                state: "provisioning".to_owned(),
                primary: index == 0,
                fabric: network.record.fabric,
            };

            match self.collaborators.networks.create_nic(request_id, nic).await {
                Ok(record) => created.push(record),
                Err(error) => {
                    self.cleanup_precreated_nics(request_id, &created).await;
                    return Err(error);
                }
            }
        }

        Ok(created)
    }

    pub(crate) async fn cleanup_precreated_nics(
        &self,
        request_id: RequestId,
        nics: &[NicRecord],
    ) {
        for nic in nics {
            let _ = self
                .collaborators
                .networks
                .delete_nic(request_id, nic.mac.as_str())
                .await;
        }
    }

    async fn mark_vm_failed_best_effort(&self, vm_uuid: Uuid) {
        if let Ok(Some(mut stored)) = self.repository.get_vm(vm_uuid).await {
            stored.vm.state = VmState::Failed;
            let _ = self
                .repository
                .put_vm(stored.vm, Some(stored.revision))
                .await;
        }
    }

    /// Maintains the `vm_role_tags` secondary index from `role.*` tag keys.
    pub(crate) async fn persist_role_tags(&self, vm: &Vm) -> AppResult<()> {
        let role_tags: Vec<String> = vm
            .tags
            .keys()
            .filter(|key| key.starts_with("role."))
            .cloned()
            .collect();

        self.repository.put_role_tags(vm.uuid, role_tags).await
    }

    /// Guarantees a running `nat-<fabric>` zone exists for an owner fabric,
    /// provisioning one under the fabric-nat ticket when absent. Concurrent
    /// requests serialize on the ticket so exactly one NAT zone is created.
    pub(crate) async fn ensure_fabric_nat(
        &self,
        request_id: RequestId,
        context: &RequestContext,
        owner_uuid: Uuid,
        network: &NetworkRecord,
    ) -> AppResult<()> {
        if self.active_nat_zone_exists(network.uuid).await? {
            return Ok(());
        }

        let scope = TicketScope::FabricNat(network.uuid);
        let ticket = self
            .waitlist
            .join(scope, request_id.to_string().as_str())
            .await?;

        if ticket.state != TicketState::Active {
            // Another request holds the guard and is provisioning the NAT
            // zone; nothing to do here.
            self.abandon_ticket(&ticket).await;
            return Ok(());
        }

        // Re-check under the guard before creating anything.
        if self.active_nat_zone_exists(network.uuid).await? {
            self.abandon_ticket(&ticket).await;
            return Ok(());
        }

        let nat_vm = build_nat_vm(owner_uuid, network);

        let nat_nic = NicRecord {
            mac: generated_mac(),
            ip: None,
            network_uuid: network.uuid,
            belongs_to_type: "zone".to_owned(),
            belongs_to_uuid: nat_vm.uuid,
            owner_uuid,
            state: "provisioning".to_owned(),
            primary: true,
            fabric: true,
        };
        let nat_nics = match self
            .collaborators
            .networks
            .create_nic(request_id, nat_nic)
            .await
        {
            Ok(record) => vec![record],
            Err(error) => {
                self.abandon_ticket(&ticket).await;
                return Err(error);
            }
        };

        let mut nat_vm = nat_vm;
        nat_vm.nics = nat_nics
            .iter()
            .map(|record| Nic {
                mac: record.mac.clone(),
                ip: record.ip.clone(),
                nic_tag: None,
                network_uuid: Some(record.network_uuid),
                state: record.state.clone(),
                primary: record.primary,
                fabric: record.fabric,
            })
            .collect();

        if let Err(error) = self.repository.put_vm(nat_vm.clone(), None).await {
            self.cleanup_precreated_nics(request_id, &nat_nics).await;
            self.abandon_ticket(&ticket).await;
            return Err(error);
        }

        let pipeline = provision_pipeline(ProvisionPipelineOptions::default());
        let payload = json!({
            "owner_uuid": owner_uuid,
            "brand": Brand::JoyentMinimal,
            "ram": nat_vm.ram,
            "alias": nat_vm.alias,
            "fabric_uuid": network.uuid,
            "nic_macs": nat_nics.iter().map(|nic| nic.mac.clone()).collect::<Vec<_>>(),
        });
        let params = job_params(context, Some(nat_vm.uuid), "provision", payload, &[&ticket]);

        match self
            .workflows
            .submit_pipeline(request_id, pipeline, params)
            .await
        {
            Ok(_) => Ok(()),
            Err(error) => {
                self.cleanup_precreated_nics(request_id, &nat_nics).await;
                self.mark_vm_failed_best_effort(nat_vm.uuid).await;
                self.abandon_ticket(&ticket).await;
                Err(error)
            }
        }
    }

    async fn active_nat_zone_exists(&self, fabric_uuid: Uuid) -> AppResult<bool> {
        Ok(self
            .find_active_nat_zone(fabric_uuid)
            .await?
            .is_some())
    }

    /// Finds the active NAT zone for a fabric by its alias convention.
    pub(crate) async fn find_active_nat_zone(&self, fabric_uuid: Uuid) -> AppResult<Option<Vm>> {
        use zonegrid_domain::{Predicate, active_state_predicate};

        let alias = format!("nat-{fabric_uuid}");
        let search = crate::vm_ports::VmSearch {
            predicate: Some(Predicate::And(vec![
                Predicate::Eq("alias".to_owned(), Value::from(alias)),
                active_state_predicate(),
            ])),
            limit: 1,
            offset: 0,
            sort: crate::vm_ports::VmSort::create_timestamp_descending(),
        };

        Ok(self.repository.search_vms(search).await?.vms.into_iter().next())
    }
}

fn build_vm_record(spec: &ProvisionSpec, nics: &[NicRecord]) -> Vm {
    Vm {
        uuid: spec.vm_uuid,
        owner_uuid: spec.owner_uuid,
        alias: spec.alias.clone(),
        brand: spec.brand,
        state: VmState::Provisioning,
        billing_id: spec.billing_id,
        image_uuid: spec.image.as_ref().map(|image| image.uuid),
        ram: spec.ram,
        quota: spec.quota,
        cpu_cap: spec.package.as_ref().and_then(|package| package.cpu_cap),
        cpu_shares: None,
        max_swap: spec.package.as_ref().and_then(|package| package.max_swap),
        max_lwps: spec.package.as_ref().and_then(|package| package.max_lwps),
        zfs_io_priority: spec
            .package
            .as_ref()
            .and_then(|package| package.zfs_io_priority),
        server_uuid: spec.server_uuid,
        autoboot: spec.autoboot,
        docker: spec.docker,
        firewall_enabled: spec
            .firewall_rules
            .as_array()
            .is_some_and(|rules| !rules.is_empty()),
        create_timestamp: Utc::now(),
        nics: nics
            .iter()
            .map(|record| Nic {
                mac: record.mac.clone(),
                ip: record.ip.clone(),
                nic_tag: None,
                network_uuid: Some(record.network_uuid),
                state: record.state.clone(),
                primary: record.primary,
                fabric: record.fabric,
            })
            .collect(),
        tags: spec.tags.clone(),
        customer_metadata: spec.customer_metadata.clone(),
        internal_metadata: spec.internal_metadata.clone(),
        firewall_rules: Vec::new(),
        snapshots: Vec::new(),
        disks: spec.disks.clone(),
    }
}

/// NAT zones are small native zones named by their fabric.
fn build_nat_vm(owner_uuid: Uuid, network: &NetworkRecord) -> Vm {
    let mut internal_metadata = Map::new();
    internal_metadata.insert("fabric_uuid".to_owned(), Value::from(network.uuid.to_string()));

    Vm {
        uuid: Uuid::new_v4(),
        owner_uuid,
        alias: Some(format!("nat-{}", network.uuid)),
        brand: Brand::JoyentMinimal,
        state: VmState::Provisioning,
        billing_id: Uuid::nil(),
        image_uuid: None,
        ram: 128,
        quota: Some(10),
        cpu_cap: Some(100),
        cpu_shares: None,
        max_swap: None,
        max_lwps: None,
        zfs_io_priority: None,
        server_uuid: None,
        autoboot: true,
        docker: false,
        firewall_enabled: false,
        create_timestamp: Utc::now(),
        nics: Vec::new(),
        tags: Map::new(),
        customer_metadata: Map::new(),
        internal_metadata,
        firewall_rules: Vec::new(),
        snapshots: Vec::new(),
        disks: Vec::new(),
    }
}

/// Synthesizes a locally administered MAC address.
fn generated_mac() -> String {
    let bytes = Uuid::new_v4().into_bytes();
    format!(
        "06:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4]
    )
}
