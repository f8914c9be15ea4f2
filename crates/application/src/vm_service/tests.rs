use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{Map, Value, json};
use tokio::sync::{Mutex, Notify, RwLock};
use uuid::Uuid;

use zonegrid_core::{AppError, AppResult, Caller, RequestContext, RequestId};
use zonegrid_domain::{
    Brand, Job, JobExecution, MigrationPhase, MigrationRecord, MigrationState, Ticket,
    TicketScope, TicketState, Vm, VmState,
};

use crate::composer::WorkflowPipeline;
use crate::reconciler::Reconciler;
use crate::vm_ports::{
    Collaborators, ComputeProvider, Image, ImageProvider, JobsQuery, NetworkProvider,
    NetworkRecord, NicRecord, Package, PackageProvider, ServerCapacity, ServerVmSnapshot,
    StoreStatus, VersionedVm, VmRepository, VmSearch, VmSearchPage, WaitlistCoordinator,
    WorkflowClient,
};
use crate::vm_service::{ListVmsParams, VmService};

// ---------------------------------------------------------------------------
// Fake ports
// ---------------------------------------------------------------------------

struct FakeVmRepository {
    vms: RwLock<HashMap<Uuid, (Vm, u64)>>,
    migrations: RwLock<HashMap<Uuid, MigrationRecord>>,
    role_tags: RwLock<HashMap<Uuid, Vec<String>>>,
    status: RwLock<StoreStatus>,
}

impl FakeVmRepository {
    fn new() -> Self {
        Self {
            vms: RwLock::new(HashMap::new()),
            migrations: RwLock::new(HashMap::new()),
            role_tags: RwLock::new(HashMap::new()),
            status: RwLock::new(StoreStatus::Ready),
        }
    }
}

#[async_trait]
impl VmRepository for FakeVmRepository {
    async fn put_vm(&self, vm: Vm, expected_revision: Option<u64>) -> AppResult<u64> {
        let mut vms = self.vms.write().await;

        match (vms.get(&vm.uuid), expected_revision) {
            (Some(_), None) => Err(AppError::Conflict(format!(
                "VM {} already exists",
                vm.uuid
            ))),
            (None, Some(_)) => Err(AppError::NotFound(format!("VM {} not found", vm.uuid))),
            (Some((_, revision)), Some(expected)) if *revision != expected => Err(
                AppError::Conflict(format!("VM {} revision moved", vm.uuid)),
            ),
            (existing, _) => {
                let next = existing.map_or(1, |(_, revision)| revision + 1);
                vms.insert(vm.uuid, (vm, next));
                Ok(next)
            }
        }
    }

    async fn get_vm(&self, uuid: Uuid) -> AppResult<Option<VersionedVm>> {
        Ok(self
            .vms
            .read()
            .await
            .get(&uuid)
            .map(|(vm, revision)| VersionedVm {
                vm: vm.clone(),
                revision: *revision,
            }))
    }

    async fn search_vms(&self, search: VmSearch) -> AppResult<VmSearchPage> {
        let vms = self.vms.read().await;

        let mut matching: Vec<Vm> = vms
            .values()
            .filter(|(vm, _)| {
                search
                    .predicate
                    .as_ref()
                    .is_none_or(|predicate| predicate.matches(&vm.to_public_value()))
            })
            .map(|(vm, _)| vm.clone())
            .collect();

        matching.sort_by(|left, right| {
            let ordering = if search.sort.field == "create_timestamp" {
                left.create_timestamp.cmp(&right.create_timestamp)
            } else {
                compare_public_field(left, right, search.sort.field.as_str())
            };
            if search.sort.descending {
                ordering.reverse()
            } else {
                ordering
            }
        });

        let total = matching.len();
        let vms = matching
            .into_iter()
            .skip(search.offset)
            .take(search.limit)
            .collect();

        Ok(VmSearchPage { vms, total })
    }

    async fn put_migration(&self, record: MigrationRecord) -> AppResult<()> {
        self.migrations.write().await.insert(record.vm_uuid, record);
        Ok(())
    }

    async fn get_migration(&self, vm_uuid: Uuid) -> AppResult<Option<MigrationRecord>> {
        Ok(self.migrations.read().await.get(&vm_uuid).cloned())
    }

    async fn put_role_tags(&self, vm_uuid: Uuid, role_tags: Vec<String>) -> AppResult<()> {
        self.role_tags.write().await.insert(vm_uuid, role_tags);
        Ok(())
    }

    async fn status(&self) -> StoreStatus {
        *self.status.read().await
    }
}

fn compare_public_field(left: &Vm, right: &Vm, field: &str) -> Ordering {
    let left = left.to_public_value();
    let right = right.to_public_value();

    match (left.get(field), right.get(field)) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

struct FakeWaitlist {
    queues: Mutex<HashMap<String, VecDeque<Ticket>>>,
    notify: Notify,
}

impl FakeWaitlist {
    fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }
}

#[async_trait]
impl WaitlistCoordinator for FakeWaitlist {
    async fn join(&self, scope: TicketScope, holder: &str) -> AppResult<Ticket> {
        let mut queues = self.queues.lock().await;
        let queue = queues.entry(scope.queue_key()).or_default();

        let ticket = Ticket {
            id: Uuid::new_v4(),
            scope,
            state: if queue.is_empty() {
                TicketState::Active
            } else {
                TicketState::Queued
            },
            holder: holder.to_owned(),
            acquired_at: Utc::now(),
        };

        queue.push_back(ticket.clone());
        Ok(ticket)
    }

    async fn ticket(&self, scope: &TicketScope, ticket_id: Uuid) -> AppResult<Option<Ticket>> {
        let queues = self.queues.lock().await;
        Ok(queues
            .get(&scope.queue_key())
            .and_then(|queue| queue.iter().find(|ticket| ticket.id == ticket_id))
            .cloned())
    }

    async fn wait_active(&self, ticket: &Ticket) -> AppResult<Ticket> {
        loop {
            {
                let queues = self.queues.lock().await;
                let queue = queues.get(&ticket.scope.queue_key());
                match queue.and_then(VecDeque::front) {
                    Some(head) if head.id == ticket.id => {
                        let mut active = head.clone();
                        active.state = TicketState::Active;
                        return Ok(active);
                    }
                    Some(_) => {}
                    None => {
                        return Err(AppError::NotFound("ticket left its queue".to_owned()));
                    }
                }
            }
            self.notify.notified().await;
        }
    }

    async fn release(&self, scope: &TicketScope, ticket_id: Uuid) -> AppResult<()> {
        let mut queues = self.queues.lock().await;
        if let Some(queue) = queues.get_mut(&scope.queue_key()) {
            queue.retain(|ticket| ticket.id != ticket_id);
            if let Some(head) = queue.front_mut() {
                head.state = TicketState::Active;
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn pending(&self, scope: &TicketScope) -> AppResult<Vec<Ticket>> {
        let queues = self.queues.lock().await;
        Ok(queues
            .get(&scope.queue_key())
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[derive(Default)]
struct FakeWorkflowExecutor {
    jobs: RwLock<Vec<Job>>,
}

impl FakeWorkflowExecutor {
    async fn complete_with<F>(&self, job_uuid: Uuid, execution: JobExecution, patch: F) -> Job
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .iter_mut()
            .find(|job| job.uuid == job_uuid)
            .unwrap_or_else(|| panic!("job {job_uuid} not submitted"));

        job.execution = execution;
        job.updated_at = Utc::now();
        patch(job);
        job.clone()
    }

    async fn complete(&self, job_uuid: Uuid, execution: JobExecution) -> Job {
        self.complete_with(job_uuid, execution, |_| {}).await
    }

    async fn all_jobs(&self) -> Vec<Job> {
        self.jobs.read().await.clone()
    }
}

#[async_trait]
impl WorkflowClient for FakeWorkflowExecutor {
    async fn submit_pipeline(
        &self,
        _request_id: RequestId,
        pipeline: WorkflowPipeline,
        params: Value,
    ) -> AppResult<Job> {
        let vm_uuid = params
            .get("vm_uuid")
            .and_then(Value::as_str)
            .and_then(|raw| Uuid::parse_str(raw).ok());

        let job = Job {
            uuid: Uuid::new_v4(),
            name: pipeline.name.clone(),
            vm_uuid,
            task: pipeline.task.clone(),
            execution: JobExecution::Queued,
            params,
            mark_as_failed_on_error: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        self.jobs.write().await.push(job.clone());
        Ok(job)
    }

    async fn get_job(&self, _request_id: RequestId, uuid: Uuid) -> AppResult<Option<Job>> {
        Ok(self
            .jobs
            .read()
            .await
            .iter()
            .find(|job| job.uuid == uuid)
            .cloned())
    }

    async fn list_jobs(&self, _request_id: RequestId, query: JobsQuery) -> AppResult<Vec<Job>> {
        Ok(self
            .jobs
            .read()
            .await
            .iter()
            .rev()
            .filter(|job| query.vm_uuid.is_none_or(|uuid| job.vm_uuid == Some(uuid)))
            .filter(|job| query.task.as_deref().is_none_or(|task| job.task == task))
            .filter(|job| {
                query
                    .execution
                    .is_none_or(|execution| job.execution == execution)
            })
            .skip(query.offset)
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn cancel_job(&self, _request_id: RequestId, uuid: Uuid) -> AppResult<Job> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .iter_mut()
            .find(|job| job.uuid == uuid)
            .ok_or_else(|| AppError::NotFound(format!("Job {uuid} not found")))?;

        job.execution = JobExecution::Canceled;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn terminal_jobs_since(
        &self,
        _request_id: RequestId,
        cursor: chrono::DateTime<Utc>,
    ) -> AppResult<Vec<Job>> {
        Ok(self
            .jobs
            .read()
            .await
            .iter()
            .filter(|job| job.execution.is_terminal() && job.updated_at > cursor)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
struct FakeNetworks {
    networks: RwLock<HashMap<Uuid, NetworkRecord>>,
    nics: RwLock<Vec<NicRecord>>,
    used_ips: RwLock<HashMap<(Uuid, String), Uuid>>,
}

#[async_trait]
impl NetworkProvider for FakeNetworks {
    async fn get_network(
        &self,
        _request_id: RequestId,
        uuid: Uuid,
    ) -> AppResult<Option<NetworkRecord>> {
        Ok(self.networks.read().await.get(&uuid).cloned())
    }

    async fn find_network_by_name(
        &self,
        _request_id: RequestId,
        name: &str,
    ) -> AppResult<Option<NetworkRecord>> {
        Ok(self
            .networks
            .read()
            .await
            .values()
            .find(|network| network.name == name)
            .cloned())
    }

    async fn ip_owner(
        &self,
        _request_id: RequestId,
        network_uuid: Uuid,
        ip: &str,
    ) -> AppResult<Option<Uuid>> {
        Ok(self
            .used_ips
            .read()
            .await
            .get(&(network_uuid, ip.to_owned()))
            .copied())
    }

    async fn create_nic(&self, _request_id: RequestId, nic: NicRecord) -> AppResult<NicRecord> {
        self.nics.write().await.push(nic.clone());
        Ok(nic)
    }

    async fn list_nics(
        &self,
        _request_id: RequestId,
        belongs_to_uuid: Uuid,
    ) -> AppResult<Vec<NicRecord>> {
        Ok(self
            .nics
            .read()
            .await
            .iter()
            .filter(|nic| nic.belongs_to_uuid == belongs_to_uuid)
            .cloned()
            .collect())
    }

    async fn delete_nic(&self, _request_id: RequestId, mac: &str) -> AppResult<()> {
        self.nics.write().await.retain(|nic| nic.mac != mac);
        Ok(())
    }
}

#[derive(Default)]
struct FakeCompute {
    capacities: RwLock<HashMap<Uuid, i64>>,
    snapshots: RwLock<HashMap<(Uuid, Uuid), VmState>>,
}

#[async_trait]
impl ComputeProvider for FakeCompute {
    async fn server_capacity(
        &self,
        _request_id: RequestId,
        server_uuid: Uuid,
    ) -> AppResult<ServerCapacity> {
        Ok(ServerCapacity {
            server_uuid,
            available_ram_mib: self
                .capacities
                .read()
                .await
                .get(&server_uuid)
                .copied()
                .unwrap_or(i64::from(u32::MAX)),
        })
    }

    async fn vm_snapshot(
        &self,
        _request_id: RequestId,
        server_uuid: Uuid,
        vm_uuid: Uuid,
    ) -> AppResult<Option<ServerVmSnapshot>> {
        Ok(self
            .snapshots
            .read()
            .await
            .get(&(server_uuid, vm_uuid))
            .map(|state| ServerVmSnapshot { state: *state }))
    }
}

#[derive(Default)]
struct FakePackages {
    packages: RwLock<HashMap<Uuid, Package>>,
}

#[async_trait]
impl PackageProvider for FakePackages {
    async fn get_package(
        &self,
        _request_id: RequestId,
        uuid: Uuid,
    ) -> AppResult<Option<Package>> {
        Ok(self.packages.read().await.get(&uuid).cloned())
    }
}

#[derive(Default)]
struct FakeImages {
    images: RwLock<HashMap<Uuid, Image>>,
}

#[async_trait]
impl ImageProvider for FakeImages {
    async fn get_image(&self, _request_id: RequestId, uuid: Uuid) -> AppResult<Option<Image>> {
        Ok(self.images.read().await.get(&uuid).cloned())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    service: VmService,
    reconciler: Reconciler,
    repository: Arc<FakeVmRepository>,
    waitlist: Arc<FakeWaitlist>,
    executor: Arc<FakeWorkflowExecutor>,
    networks: Arc<FakeNetworks>,
    compute: Arc<FakeCompute>,
    owner_uuid: Uuid,
    image_uuid: Uuid,
    network_uuid: Uuid,
    fabric_uuid: Uuid,
    package_uuid: Uuid,
    big_package_uuid: Uuid,
    small_package_uuid: Uuid,
    server_uuid: Uuid,
}

async fn harness() -> Harness {
    let repository = Arc::new(FakeVmRepository::new());
    let waitlist = Arc::new(FakeWaitlist::new());
    let executor = Arc::new(FakeWorkflowExecutor::default());
    let networks = Arc::new(FakeNetworks::default());
    let compute = Arc::new(FakeCompute::default());
    let packages = Arc::new(FakePackages::default());
    let images = Arc::new(FakeImages::default());

    let owner_uuid = Uuid::new_v4();
    let image_uuid = Uuid::new_v4();
    let network_uuid = Uuid::new_v4();
    let fabric_uuid = Uuid::new_v4();
    let package_uuid = Uuid::new_v4();
    let big_package_uuid = Uuid::new_v4();
    let small_package_uuid = Uuid::new_v4();
    let server_uuid = Uuid::new_v4();

    images.images.write().await.insert(
        image_uuid,
        Image {
            uuid: image_uuid,
            name: "base-64".to_owned(),
            os: "smartos".to_owned(),
            state: "active".to_owned(),
            generate_passwords: false,
        },
    );

    networks.networks.write().await.insert(
        network_uuid,
        NetworkRecord {
            uuid: network_uuid,
            name: "external".to_owned(),
            owner_uuids: Vec::new(),
            fabric: false,
        },
    );
    networks.networks.write().await.insert(
        fabric_uuid,
        NetworkRecord {
            uuid: fabric_uuid,
            name: "customer-fabric".to_owned(),
            owner_uuids: vec![owner_uuid],
            fabric: true,
        },
    );

    let package = |uuid: Uuid, name: &str, ram: u32| Package {
        uuid,
        name: name.to_owned(),
        ram_mib: ram,
        quota_gib: 25,
        cpu_cap: Some(100),
        max_swap: Some(ram * 2),
        max_lwps: Some(4000),
        zfs_io_priority: Some(100),
        flexible_disk: false,
    };
    packages
        .packages
        .write()
        .await
        .insert(package_uuid, package(package_uuid, "sample-256M", 256));
    packages
        .packages
        .write()
        .await
        .insert(big_package_uuid, package(big_package_uuid, "sample-2G", 2048));
    packages.packages.write().await.insert(
        small_package_uuid,
        package(small_package_uuid, "sample-128M", 128),
    );

    compute.capacities.write().await.insert(server_uuid, 512);

    let service = VmService::new(
        repository.clone(),
        waitlist.clone(),
        executor.clone(),
        Collaborators {
            networks: networks.clone(),
            compute: compute.clone(),
            packages: packages.clone(),
            images: images.clone(),
        },
    );
    let reconciler = Reconciler::new(service.clone());

    Harness {
        service,
        reconciler,
        repository,
        waitlist,
        executor,
        networks,
        compute,
        owner_uuid,
        image_uuid,
        network_uuid,
        fabric_uuid,
        package_uuid,
        big_package_uuid,
        small_package_uuid,
        server_uuid,
    }
}

fn request_id() -> RequestId {
    RequestId::new()
}

fn caller_context() -> RequestContext {
    RequestContext {
        caller: Caller {
            caller_type: "signature".to_owned(),
            ip: Some("127.0.0.68".to_owned()),
            key_id: Some("/admin/keys/id_rsa".to_owned()),
        },
        params: Value::Null,
    }
}

impl Harness {
    fn provision_payload(&self) -> Value {
        json!({
            "owner_uuid": self.owner_uuid,
            "image_uuid": self.image_uuid,
            "brand": "joyent-minimal",
            "networks": [{"uuid": self.network_uuid}],
            "ram": 256,
            "billing_id": self.package_uuid,
            "alias": "web0",
        })
    }

    async fn reconcile(&self, job_uuid: Uuid) {
        let job = self
            .executor
            .get_job(request_id(), job_uuid)
            .await
            .unwrap()
            .unwrap();
        self.reconciler.reconcile(request_id(), &job).await.unwrap();
    }

    /// Drives a provision through executor success onto the given server.
    async fn provision_running_vm(&self) -> Uuid {
        let (vm_uuid, job) = self
            .service
            .provision(request_id(), &caller_context(), &self.provision_payload())
            .await
            .unwrap();

        let server = self.server_uuid;
        self.executor
            .complete_with(job.uuid, JobExecution::Succeeded, |job| {
                job.params["payload"]["server_uuid"] = json!(server.to_string());
            })
            .await;
        self.reconcile(job.uuid).await;

        vm_uuid
    }

    async fn vm(&self, uuid: Uuid) -> Vm {
        self.repository.get_vm(uuid).await.unwrap().unwrap().vm
    }

    async fn seed_vm(&self, alias: &str, ram: u32, age_seconds: i64) -> Uuid {
        let uuid = Uuid::new_v4();
        let vm = Vm {
            uuid,
            owner_uuid: self.owner_uuid,
            alias: Some(alias.to_owned()),
            brand: Brand::JoyentMinimal,
            state: VmState::Running,
            billing_id: self.package_uuid,
            image_uuid: Some(self.image_uuid),
            ram,
            quota: Some(25),
            cpu_cap: None,
            cpu_shares: None,
            max_swap: None,
            max_lwps: None,
            zfs_io_priority: None,
            server_uuid: Some(self.server_uuid),
            autoboot: true,
            docker: false,
            firewall_enabled: false,
            create_timestamp: Utc::now() - Duration::seconds(age_seconds),
            nics: Vec::new(),
            tags: Map::new(),
            customer_metadata: Map::new(),
            internal_metadata: Map::new(),
            firewall_rules: Vec::new(),
            snapshots: Vec::new(),
            disks: Vec::new(),
        };
        self.repository.put_vm(vm, None).await.unwrap();
        uuid
    }

    async fn nat_zone_query(&self) -> Vec<Value> {
        let params = ListVmsParams {
            filters: vec![("alias".to_owned(), format!("nat-{}", self.fabric_uuid))],
            state: Some("active".to_owned()),
            ..ListVmsParams::default()
        };
        self.service.list_vms(&params).await.unwrap().0
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn provision_reports_every_missing_required_field() {
    let harness = harness().await;

    let error = harness
        .service
        .provision(request_id(), &caller_context(), &json!({}))
        .await
        .unwrap_err();

    assert_eq!(error.code(), "ValidationFailed");
    let fields: Vec<&str> = error
        .field_errors()
        .unwrap()
        .iter()
        .filter(|entry| entry.code == "Missing")
        .filter_map(|entry| entry.field.as_deref())
        .collect();

    for required in ["owner_uuid", "billing_id", "brand", "ram", "image_uuid", "networks"] {
        assert!(fields.contains(&required), "missing entry for {required}");
    }
}

#[tokio::test]
async fn unknown_network_reference_is_unprocessable() {
    let harness = harness().await;

    let mut payload = harness.provision_payload();
    payload["networks"] = json!([{"uuid": "caaaf10c-a587-49c6-9cf6-9b0a14ba960b"}]);

    let error = harness
        .service
        .provision(request_id(), &caller_context(), &payload)
        .await
        .unwrap_err();

    assert_eq!(error.code(), "UnprocessableEntityError");
    assert_eq!(
        error.to_string(),
        "No such Network or Pool with id/name: \"caaaf10c-a587-49c6-9cf6-9b0a14ba960b\""
    );
}

#[tokio::test]
async fn network_name_reference_resolves_for_visible_networks() {
    let harness = harness().await;

    let mut payload = harness.provision_payload();
    payload["networks"] = json!([{"name": "external"}]);

    assert!(
        harness
            .service
            .provision(request_id(), &caller_context(), &payload)
            .await
            .is_ok()
    );

    let mut payload = harness.provision_payload();
    payload["owner_uuid"] = json!(Uuid::new_v4());
    payload["networks"] = json!([{"name": "customer-fabric"}]);

    let error = harness
        .service
        .provision(request_id(), &caller_context(), &payload)
        .await
        .unwrap_err();
    assert_eq!(error.code(), "UnprocessableEntityError");
}

#[tokio::test]
async fn used_ip_is_attributed_to_the_owning_zone() {
    let harness = harness().await;
    let owning_vm = Uuid::new_v4();

    harness.networks.used_ips.write().await.insert(
        (harness.network_uuid, "10.88.88.15".to_owned()),
        owning_vm,
    );

    let mut payload = harness.provision_payload();
    payload["networks"] =
        json!([{"uuid": harness.network_uuid, "ipv4_ips": ["10.88.88.15"]}]);

    let error = harness
        .service
        .provision(request_id(), &caller_context(), &payload)
        .await
        .unwrap_err();

    assert_eq!(error.code(), "InvalidParameters");
    let entry = &error.field_errors().unwrap()[0];
    assert_eq!(entry.resource_type.as_deref(), Some("zone"));
    assert_eq!(entry.resource_id.as_deref(), Some(owning_vm.to_string().as_str()));
    assert_eq!(entry.code, "UsedBy");
    assert_eq!(entry.field.as_deref(), Some("ip"));
}

#[tokio::test]
async fn unrecognized_triton_tag_is_rejected() {
    let harness = harness().await;

    let mut payload = harness.provision_payload();
    payload["tags"] = json!({"triton.foo": true});

    let error = harness
        .service
        .provision(request_id(), &caller_context(), &payload)
        .await
        .unwrap_err();

    assert_eq!(error.code(), "ValidationFailed");
    let entry = &error.field_errors().unwrap()[0];
    assert_eq!(entry.field.as_deref(), Some("tags"));
    assert_eq!(entry.code, "Invalid");
    assert_eq!(
        entry.message.as_deref(),
        Some("Unrecognized special triton tag \"triton.foo\"")
    );
}

#[tokio::test]
async fn malformed_locality_uuid_is_rejected() {
    let harness = harness().await;

    let mut payload = harness.provision_payload();
    payload["locality"] = json!({"strict": true, "near": ["not-a-uuid"]});

    let error = harness
        .service
        .provision(request_id(), &caller_context(), &payload)
        .await
        .unwrap_err();

    let entry = &error.field_errors().unwrap()[0];
    assert_eq!(entry.field.as_deref(), Some("locality"));
    assert_eq!(
        entry.message.as_deref(),
        Some("locality contains malformed UUID")
    );
}

#[tokio::test]
async fn invalid_firewall_rule_is_rejected_with_detail() {
    let harness = harness().await;

    let mut payload = harness.provision_payload();
    payload["firewall_rules"] = json!([{
        "uuid": Uuid::new_v4(),
        "owner_uuid": harness.owner_uuid,
        "enabled": true,
        "rule": "FROM mars TO all vms ALLOW tcp PORT 22",
    }]);

    let error = harness
        .service
        .provision(request_id(), &caller_context(), &payload)
        .await
        .unwrap_err();

    assert!(
        error
            .field_errors()
            .unwrap()
            .iter()
            .any(|entry| entry.message.as_deref().is_some_and(|m| m.starts_with("Invalid rule:")))
    );
}

// ---------------------------------------------------------------------------
// Provision and reconciliation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn provision_records_caller_context_and_reaches_running() {
    let harness = harness().await;
    let context = caller_context();

    let (vm_uuid, job) = harness
        .service
        .provision(request_id(), &context, &harness.provision_payload())
        .await
        .unwrap();

    // P1: the job is a provision and carries the caller from API time.
    assert!(job.name.contains("provision"));
    assert_eq!(
        job.params["context"]["caller"],
        serde_json::to_value(&context.caller).unwrap()
    );

    let vm = harness.vm(vm_uuid).await;
    assert_eq!(vm.state, VmState::Provisioning);

    let server = harness.server_uuid;
    harness
        .executor
        .complete_with(job.uuid, JobExecution::Succeeded, |job| {
            job.params["payload"]["server_uuid"] = json!(server.to_string());
        })
        .await;
    harness.reconcile(job.uuid).await;

    let vm = harness.vm(vm_uuid).await;
    assert_eq!(vm.state, VmState::Running);
    assert_eq!(vm.server_uuid, Some(server));
    assert!(!vm.nics.is_empty());
}

#[tokio::test]
async fn failed_provision_cleans_up_precreated_nics() {
    let harness = harness().await;

    let (vm_uuid, job) = harness
        .service
        .provision(request_id(), &caller_context(), &harness.provision_payload())
        .await
        .unwrap();

    assert_eq!(
        harness
            .networks
            .list_nics(request_id(), vm_uuid)
            .await
            .unwrap()
            .len(),
        1
    );

    harness.executor.complete(job.uuid, JobExecution::Failed).await;
    harness.reconcile(job.uuid).await;

    // P6: no NIC records remain for the failed VM.
    assert!(
        harness
            .networks
            .list_nics(request_id(), vm_uuid)
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(harness.vm(vm_uuid).await.state, VmState::Failed);
}

#[tokio::test]
async fn failed_provision_past_point_of_no_return_keeps_nics() {
    let harness = harness().await;

    let (vm_uuid, job) = harness
        .service
        .provision(request_id(), &caller_context(), &harness.provision_payload())
        .await
        .unwrap();

    harness
        .executor
        .complete_with(job.uuid, JobExecution::Failed, |job| {
            job.mark_as_failed_on_error = false;
        })
        .await;
    harness.reconcile(job.uuid).await;

    assert_eq!(
        harness
            .networks
            .list_nics(request_id(), vm_uuid)
            .await
            .unwrap()
            .len(),
        1
    );
    assert_eq!(harness.vm(vm_uuid).await.state, VmState::Failed);
}

#[tokio::test]
async fn provisioning_vm_only_accepts_destroy() {
    let harness = harness().await;

    let (vm_uuid, _) = harness
        .service
        .provision(request_id(), &caller_context(), &harness.provision_payload())
        .await
        .unwrap();

    let error = harness
        .service
        .dispatch_action(
            request_id(),
            &caller_context(),
            vm_uuid,
            &json!({"action": "stop"}),
        )
        .await
        .unwrap_err();
    assert_eq!(error.code(), "ValidationFailed");

    assert!(
        harness
            .service
            .destroy(request_id(), &caller_context(), vm_uuid)
            .await
            .is_ok()
    );
}

// ---------------------------------------------------------------------------
// Lifecycle actions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stop_and_start_round_trip_through_the_executor() {
    let harness = harness().await;
    let vm_uuid = harness.provision_running_vm().await;

    let stop = harness
        .service
        .dispatch_action(
            request_id(),
            &caller_context(),
            vm_uuid,
            &json!({"action": "stop"}),
        )
        .await
        .unwrap();
    harness.executor.complete(stop.uuid, JobExecution::Succeeded).await;
    harness.reconcile(stop.uuid).await;
    assert_eq!(harness.vm(vm_uuid).await.state, VmState::Stopped);

    // Start from stopped is legal; stop from stopped is not.
    let error = harness
        .service
        .dispatch_action(
            request_id(),
            &caller_context(),
            vm_uuid,
            &json!({"action": "stop"}),
        )
        .await
        .unwrap_err();
    assert_eq!(error.code(), "VmNotRunning");

    let start = harness
        .service
        .dispatch_action(
            request_id(),
            &caller_context(),
            vm_uuid,
            &json!({"action": "start"}),
        )
        .await
        .unwrap();
    harness.executor.complete(start.uuid, JobExecution::Succeeded).await;
    harness.reconcile(start.uuid).await;
    assert_eq!(harness.vm(vm_uuid).await.state, VmState::Running);
}

#[tokio::test]
async fn missing_action_on_vm_path_is_a_conflict() {
    let harness = harness().await;
    let vm_uuid = harness.provision_running_vm().await;

    let error = harness
        .service
        .dispatch_action(request_id(), &caller_context(), vm_uuid, &json!({}))
        .await
        .unwrap_err();
    assert_eq!(error.code(), "ValidationFailed");

    let error = harness
        .service
        .dispatch_action(
            request_id(),
            &caller_context(),
            vm_uuid,
            &json!({"action": "defenestrate"}),
        )
        .await
        .unwrap_err();
    assert_eq!(error.code(), "ValidationFailed");
}

#[tokio::test]
async fn action_against_unknown_vm_is_not_found() {
    let harness = harness().await;

    let error = harness
        .service
        .dispatch_action(
            request_id(),
            &caller_context(),
            Uuid::new_v4(),
            &json!({"action": "start"}),
        )
        .await
        .unwrap_err();

    assert_eq!(error.code(), "ResourceNotFound");
}

#[tokio::test]
async fn canceled_job_refreshes_state_from_the_compute_node() {
    let harness = harness().await;
    let vm_uuid = harness.provision_running_vm().await;

    harness
        .compute
        .snapshots
        .write()
        .await
        .insert((harness.server_uuid, vm_uuid), VmState::Stopped);

    let job = harness
        .service
        .dispatch_action(
            request_id(),
            &caller_context(),
            vm_uuid,
            &json!({"action": "stop"}),
        )
        .await
        .unwrap();

    harness.service.cancel_job(request_id(), job.uuid).await.unwrap();
    harness.reconcile(job.uuid).await;

    assert_eq!(harness.vm(vm_uuid).await.state, VmState::Stopped);
    let scope = TicketScope::Vm(vm_uuid);
    assert!(harness.waitlist.pending(&scope).await.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Resize
// ---------------------------------------------------------------------------

#[tokio::test]
async fn resize_up_beyond_server_capacity_fails_and_keeps_the_package() {
    let harness = harness().await;
    let vm_uuid = harness.provision_running_vm().await;

    let error = harness
        .service
        .dispatch_action(
            request_id(),
            &caller_context(),
            vm_uuid,
            &json!({"action": "update", "billing_id": harness.big_package_uuid}),
        )
        .await
        .unwrap_err();

    // P9: ValidationFailed with the capacity breakdown on the ram field.
    assert_eq!(error.code(), "ValidationFailed");
    let entry = &error.field_errors().unwrap()[0];
    assert_eq!(entry.field.as_deref(), Some("ram"));
    assert_eq!(entry.code, "InsufficientCapacity");
    let message = entry.message.as_deref().unwrap();
    assert!(message.starts_with("Required additional RAM 1792"));
    assert!(message.contains("exceeds the server's available RAM 512"));

    assert_eq!(harness.vm(vm_uuid).await.billing_id, harness.package_uuid);
}

#[tokio::test]
async fn resize_down_never_consults_capacity() {
    let harness = harness().await;
    let vm_uuid = harness.provision_running_vm().await;

    // Remove all advertised headroom; shrinking must still pass.
    harness
        .compute
        .capacities
        .write()
        .await
        .insert(harness.server_uuid, -64);

    let job = harness
        .service
        .dispatch_action(
            request_id(),
            &caller_context(),
            vm_uuid,
            &json!({"action": "update", "billing_id": harness.small_package_uuid}),
        )
        .await
        .unwrap();

    harness.executor.complete(job.uuid, JobExecution::Succeeded).await;
    harness.reconcile(job.uuid).await;

    let vm = harness.vm(vm_uuid).await;
    assert_eq!(vm.billing_id, harness.small_package_uuid);
    assert_eq!(vm.ram, 128);
}

// ---------------------------------------------------------------------------
// Tags
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tag_lifecycle_merge_then_delete_one() {
    let harness = harness().await;
    let vm_uuid = harness.provision_running_vm().await;

    harness
        .service
        .add_tags(
            request_id(),
            &caller_context(),
            vm_uuid,
            json!({"role": "database", "group": "deployment"})
                .as_object()
                .cloned()
                .unwrap(),
        )
        .await
        .unwrap();

    harness
        .service
        .delete_tag(request_id(), &caller_context(), vm_uuid, "role")
        .await
        .unwrap();

    let tags = harness.service.list_tags(vm_uuid).await.unwrap();
    assert_eq!(Value::Object(tags), json!({"group": "deployment"}));
}

#[tokio::test]
async fn tag_put_is_total_and_idempotent() {
    let harness = harness().await;
    let vm_uuid = harness.provision_running_vm().await;

    harness
        .service
        .add_tags(
            request_id(),
            &caller_context(),
            vm_uuid,
            json!({"old": "value"}).as_object().cloned().unwrap(),
        )
        .await
        .unwrap();

    for _ in 0..2 {
        harness
            .service
            .set_tags(
                request_id(),
                &caller_context(),
                vm_uuid,
                json!({"a": 1}).as_object().cloned().unwrap(),
            )
            .await
            .unwrap();
    }

    // P8: the prior set is gone, replaced exactly.
    let tags = harness.service.list_tags(vm_uuid).await.unwrap();
    assert_eq!(Value::Object(tags), json!({"a": 1}));
}

#[tokio::test]
async fn docker_reserved_tag_is_refused_on_regular_vms() {
    let harness = harness().await;
    let vm_uuid = harness.provision_running_vm().await;

    let error = harness
        .service
        .set_tags(
            request_id(),
            &caller_context(),
            vm_uuid,
            json!({"foo": "bar", "docker:label:com.docker.blah": "baz"})
                .as_object()
                .cloned()
                .unwrap(),
        )
        .await
        .unwrap_err();

    assert_eq!(
        error.to_string(),
        "Special tag \"docker:label:com.docker.blah\" not supported"
    );
}

// ---------------------------------------------------------------------------
// Search and pagination
// ---------------------------------------------------------------------------

#[tokio::test]
async fn empty_filter_result_is_an_empty_page() {
    let harness = harness().await;
    harness.seed_vm("web1", 256, 10).await;

    let params = ListVmsParams {
        filters: vec![
            ("ram".to_owned(), "32".to_owned()),
            ("owner_uuid".to_owned(), harness.owner_uuid.to_string()),
        ],
        state: Some("active".to_owned()),
        ..ListVmsParams::default()
    };

    let (rows, total) = harness.service.list_vms(&params).await.unwrap();
    assert!(rows.is_empty());
    assert_eq!(total, 0);
}

#[tokio::test]
async fn unknown_owner_lists_empty_with_success() {
    let harness = harness().await;
    harness.seed_vm("web1", 256, 10).await;

    let params = ListVmsParams {
        filters: vec![("owner_uuid".to_owned(), Uuid::new_v4().to_string())],
        ..ListVmsParams::default()
    };

    let (rows, total) = harness.service.list_vms(&params).await.unwrap();
    assert!(rows.is_empty());
    assert_eq!(total, 0);
}

#[tokio::test]
async fn pagination_slices_agree_with_the_full_listing() {
    let harness = harness().await;
    for index in 0..7 {
        harness
            .seed_vm(&format!("vm{index}"), 256, 100 - index)
            .await;
    }

    let full = harness
        .service
        .list_vms(&ListVmsParams::default())
        .await
        .unwrap()
        .0;
    assert_eq!(full.len(), 7);

    // P3: list(L, K) == list(∞)[K..K+L]; P4: total ignores pagination.
    for (limit, offset) in [(3, 0), (3, 3), (2, 5), (4, 6)] {
        let params = ListVmsParams {
            limit: Some(limit),
            offset: Some(offset),
            ..ListVmsParams::default()
        };
        let (rows, total) = harness.service.list_vms(&params).await.unwrap();

        assert_eq!(total, 7);
        let expected: Vec<Value> = full.iter().skip(offset).take(limit).cloned().collect();
        assert_eq!(rows, expected);
    }

    let params = ListVmsParams {
        limit: Some(3),
        offset: Some(20),
        ..ListVmsParams::default()
    };
    let (rows, total) = harness.service.list_vms(&params).await.unwrap();
    assert!(rows.is_empty());
    assert_eq!(total, 7);
}

#[tokio::test]
async fn default_order_is_newest_first() {
    let harness = harness().await;
    harness.seed_vm("old", 256, 300).await;
    harness.seed_vm("new", 256, 1).await;

    let rows = harness
        .service
        .list_vms(&ListVmsParams::default())
        .await
        .unwrap()
        .0;

    assert_eq!(rows[0]["alias"], "new");
    assert_eq!(rows[1]["alias"], "old");
}

#[tokio::test]
async fn fields_projection_omits_unlisted_fields() {
    let harness = harness().await;
    harness.seed_vm("web1", 256, 10).await;

    let params = ListVmsParams {
        fields: Some("uuid,alias".to_owned()),
        ..ListVmsParams::default()
    };
    let rows = harness.service.list_vms(&params).await.unwrap().0;

    let row = rows[0].as_object().unwrap();
    assert_eq!(row.len(), 2);
    assert!(row.contains_key("uuid"));
    assert!(row.contains_key("alias"));
    assert!(!row.contains_key("ram"));
}

#[tokio::test]
async fn query_predicate_and_filters_intersect() {
    let harness = harness().await;
    harness.seed_vm("api0", 512, 10).await;
    harness.seed_vm("api1", 128, 20).await;
    harness.seed_vm("db0", 512, 30).await;

    let params = ListVmsParams {
        filters: vec![("owner_uuid".to_owned(), harness.owner_uuid.to_string())],
        query: Some("(ram>=256)".to_owned()),
        predicate: Some(r#"{"eq": ["alias", "api0"]}"#.to_owned()),
        ..ListVmsParams::default()
    };

    let (rows, total) = harness.service.list_vms(&params).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(rows[0]["alias"], "api0");
}

#[tokio::test]
async fn ldap_tag_convention_matches_tagged_vms() {
    let harness = harness().await;
    let tagged = harness.seed_vm("core0", 256, 10).await;
    harness.seed_vm("edge0", 256, 20).await;

    let mut stored = harness.repository.get_vm(tagged).await.unwrap().unwrap();
    stored
        .vm
        .tags
        .insert("smartdc_type".to_owned(), Value::from("core"));
    harness
        .repository
        .put_vm(stored.vm, Some(stored.revision))
        .await
        .unwrap();

    let params = ListVmsParams {
        query: Some("(&(ram>=128)(tags=*-smartdc_type=core-*))".to_owned()),
        ..ListVmsParams::default()
    };

    let (rows, total) = harness.service.list_vms(&params).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(rows[0]["alias"], "core0");
}

#[tokio::test]
async fn destroyed_vms_leave_active_searches_but_stay_retrievable() {
    let harness = harness().await;
    let vm_uuid = harness.provision_running_vm().await;

    let destroy = harness
        .service
        .destroy(request_id(), &caller_context(), vm_uuid)
        .await
        .unwrap();
    harness
        .executor
        .complete(destroy.uuid, JobExecution::Succeeded)
        .await;
    harness.reconcile(destroy.uuid).await;

    let params = ListVmsParams {
        state: Some("active".to_owned()),
        ..ListVmsParams::default()
    };
    let (rows, _) = harness.service.list_vms(&params).await.unwrap();
    assert!(rows.iter().all(|row| row["uuid"] != json!(vm_uuid)));

    let vm = harness.service.get_vm(vm_uuid).await.unwrap();
    assert_eq!(vm["state"], "destroyed");
    assert_eq!(vm["quota"], Value::Null);
}

// ---------------------------------------------------------------------------
// Jobs and audit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn job_audit_returns_actions_newest_first() {
    let harness = harness().await;
    let vm_uuid = harness.provision_running_vm().await;

    let stop = harness
        .service
        .dispatch_action(
            request_id(),
            &caller_context(),
            vm_uuid,
            &json!({"action": "stop"}),
        )
        .await
        .unwrap();
    harness.executor.complete(stop.uuid, JobExecution::Succeeded).await;
    harness.reconcile(stop.uuid).await;

    let start = harness
        .service
        .dispatch_action(
            request_id(),
            &caller_context(),
            vm_uuid,
            &json!({"action": "start"}),
        )
        .await
        .unwrap();
    harness.executor.complete(start.uuid, JobExecution::Succeeded).await;
    harness.reconcile(start.uuid).await;

    // P7: newest first, matching the actions performed.
    let jobs = harness
        .service
        .list_jobs(request_id(), Some(vm_uuid), None, None)
        .await
        .unwrap();
    let tasks: Vec<&str> = jobs.iter().map(|job| job.task.as_str()).collect();
    assert_eq!(tasks, vec!["start", "stop", "provision"]);

    // And every job still carries the original caller (P1 across actions).
    for job in &jobs {
        assert_eq!(job.params["context"]["caller"]["type"], "signature");
    }
}

// ---------------------------------------------------------------------------
// Waitlist
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_mutations_serialize_fifo_on_the_vm_ticket() {
    let harness = harness().await;
    let vm_uuid = harness.provision_running_vm().await;
    let scope = TicketScope::Vm(vm_uuid);

    let first = harness
        .service
        .dispatch_action(
            request_id(),
            &caller_context(),
            vm_uuid,
            &json!({"action": "stop"}),
        )
        .await
        .unwrap();

    // The VM is still "running" in the store until the stop reconciles, so
    // a reboot is admissible and must queue behind the stop.
    let second = harness
        .service
        .dispatch_action(
            request_id(),
            &caller_context(),
            vm_uuid,
            &json!({"action": "reboot"}),
        )
        .await
        .unwrap();

    let pending = harness.waitlist.pending(&scope).await.unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].state, TicketState::Active);
    assert_eq!(pending[1].state, TicketState::Queued);

    harness.executor.complete(first.uuid, JobExecution::Succeeded).await;
    harness.reconcile(first.uuid).await;

    let pending = harness.waitlist.pending(&scope).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].state, TicketState::Active);

    harness.executor.complete(second.uuid, JobExecution::Failed).await;
    harness.reconcile(second.uuid).await;
    assert!(harness.waitlist.pending(&scope).await.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Fabric NAT
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_fabric_vm_provisions_exactly_one_nat_zone() {
    let harness = harness().await;

    assert!(harness.nat_zone_query().await.is_empty());

    let mut payload = harness.provision_payload();
    payload["networks"] = json!([{"uuid": harness.fabric_uuid}]);

    let (vm_uuid, job) = harness
        .service
        .provision(request_id(), &caller_context(), &payload)
        .await
        .unwrap();

    // A NAT provision job was dispatched ahead of the user VM's job.
    let jobs = harness.executor.all_jobs().await;
    assert_eq!(jobs.len(), 2);
    let nat_job = &jobs[0];
    assert_ne!(nat_job.vm_uuid, Some(vm_uuid));

    for job_uuid in [nat_job.uuid, job.uuid] {
        harness
            .executor
            .complete(job_uuid, JobExecution::Succeeded)
            .await;
        harness.reconcile(job_uuid).await;
    }

    let nat_zones = harness.nat_zone_query().await;
    assert_eq!(nat_zones.len(), 1);
    assert_eq!(nat_zones[0]["state"], "running");
}

#[tokio::test]
async fn concurrent_fabric_provisions_share_one_nat_zone() {
    let harness = harness().await;

    let mut payload = harness.provision_payload();
    payload["networks"] = json!([{"uuid": harness.fabric_uuid}]);

    harness
        .service
        .provision(request_id(), &caller_context(), &payload)
        .await
        .unwrap();
    harness
        .service
        .provision(request_id(), &caller_context(), &payload)
        .await
        .unwrap();

    let nat_jobs: Vec<Job> = harness
        .executor
        .all_jobs()
        .await
        .into_iter()
        .filter(|job| {
            job.params["payload"]
                .get("fabric_uuid")
                .is_some_and(|value| !value.is_null())
        })
        .collect();
    assert_eq!(nat_jobs.len(), 1);
}

#[tokio::test]
async fn destroying_the_last_fabric_vm_reaps_the_nat_zone() {
    let harness = harness().await;

    let mut payload = harness.provision_payload();
    payload["networks"] = json!([{"uuid": harness.fabric_uuid}]);

    let (vm_uuid, job) = harness
        .service
        .provision(request_id(), &caller_context(), &payload)
        .await
        .unwrap();

    let jobs = harness.executor.all_jobs().await;
    let nat_vm_uuid = jobs[0].vm_uuid.unwrap();
    for job_uuid in [jobs[0].uuid, job.uuid] {
        harness
            .executor
            .complete(job_uuid, JobExecution::Succeeded)
            .await;
        harness.reconcile(job_uuid).await;
    }
    assert_eq!(harness.nat_zone_query().await.len(), 1);

    let destroy = harness
        .service
        .destroy(request_id(), &caller_context(), vm_uuid)
        .await
        .unwrap();
    harness
        .executor
        .complete(destroy.uuid, JobExecution::Succeeded)
        .await;
    harness.reconcile(destroy.uuid).await;

    // The reconciler chained a destroy for the orphaned NAT zone.
    let nat_destroy = harness
        .executor
        .all_jobs()
        .await
        .into_iter()
        .find(|job| job.task == "destroy" && job.vm_uuid == Some(nat_vm_uuid))
        .unwrap();
    harness
        .executor
        .complete(nat_destroy.uuid, JobExecution::Succeeded)
        .await;
    harness.reconcile(nat_destroy.uuid).await;

    assert!(harness.nat_zone_query().await.is_empty());
    assert_eq!(harness.vm(nat_vm_uuid).await.state, VmState::Destroyed);
}

// ---------------------------------------------------------------------------
// Migration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn migration_phases_chain_begin_sync_switch() {
    let harness = harness().await;
    let vm_uuid = harness.provision_running_vm().await;
    let target_server = Uuid::new_v4();

    let begin = harness
        .service
        .dispatch_action(
            request_id(),
            &caller_context(),
            vm_uuid,
            &json!({"action": "migrate", "migration_action": "begin"}),
        )
        .await
        .unwrap();
    harness
        .executor
        .complete_with(begin.uuid, JobExecution::Succeeded, |job| {
            job.params["payload"]["target_server_uuid"] = json!(target_server.to_string());
        })
        .await;
    harness.reconcile(begin.uuid).await;

    let record = harness
        .service
        .get_vm_migration(vm_uuid)
        .await
        .unwrap();
    assert_eq!(record.phase, MigrationPhase::Begin);
    assert_eq!(record.state, MigrationState::Paused);
    assert_eq!(record.target_server_uuid, Some(target_server));

    // A second begin while the record is open must be refused.
    let error = harness
        .service
        .dispatch_action(
            request_id(),
            &caller_context(),
            vm_uuid,
            &json!({"action": "migrate", "migration_action": "begin"}),
        )
        .await
        .unwrap_err();
    assert_eq!(error.code(), "ValidationFailed");

    let sync = harness
        .service
        .dispatch_action(
            request_id(),
            &caller_context(),
            vm_uuid,
            &json!({"action": "migrate", "migration_action": "sync"}),
        )
        .await
        .unwrap();
    harness.executor.complete(sync.uuid, JobExecution::Succeeded).await;
    harness.reconcile(sync.uuid).await;

    let switch = harness
        .service
        .dispatch_action(
            request_id(),
            &caller_context(),
            vm_uuid,
            &json!({"action": "migrate", "migration_action": "switch"}),
        )
        .await
        .unwrap();
    harness
        .executor
        .complete(switch.uuid, JobExecution::Succeeded)
        .await;
    harness.reconcile(switch.uuid).await;

    let record = harness.service.get_vm_migration(vm_uuid).await.unwrap();
    assert_eq!(record.phase, MigrationPhase::Switch);
    assert_eq!(record.state, MigrationState::Successful);

    let vm = harness.vm(vm_uuid).await;
    assert_eq!(vm.server_uuid, Some(target_server));
    assert_eq!(vm.state, VmState::Running);
}

#[tokio::test]
async fn sync_requires_a_paused_begin_record() {
    let harness = harness().await;
    let vm_uuid = harness.provision_running_vm().await;

    let error = harness
        .service
        .dispatch_action(
            request_id(),
            &caller_context(),
            vm_uuid,
            &json!({"action": "migrate", "migration_action": "sync"}),
        )
        .await
        .unwrap_err();

    assert_eq!(error.code(), "ValidationFailed");
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

#[tokio::test]
async fn snapshot_create_and_delete_update_the_record() {
    let harness = harness().await;
    let vm_uuid = harness.provision_running_vm().await;

    let create = harness
        .service
        .dispatch_action(
            request_id(),
            &caller_context(),
            vm_uuid,
            &json!({"action": "create_snapshot", "snapshot_name": "pre-upgrade"}),
        )
        .await
        .unwrap();
    harness
        .executor
        .complete(create.uuid, JobExecution::Succeeded)
        .await;
    harness.reconcile(create.uuid).await;

    let vm = harness.vm(vm_uuid).await;
    assert_eq!(vm.snapshots.len(), 1);
    assert_eq!(vm.snapshots[0].name, "pre-upgrade");

    let delete = harness
        .service
        .dispatch_action(
            request_id(),
            &caller_context(),
            vm_uuid,
            &json!({"action": "delete_snapshot", "snapshot_name": "pre-upgrade"}),
        )
        .await
        .unwrap();
    harness
        .executor
        .complete(delete.uuid, JobExecution::Succeeded)
        .await;
    harness.reconcile(delete.uuid).await;

    assert!(harness.vm(vm_uuid).await.snapshots.is_empty());
}

#[tokio::test]
async fn rollback_of_unknown_snapshot_is_rejected() {
    let harness = harness().await;
    let vm_uuid = harness.provision_running_vm().await;

    let error = harness
        .service
        .dispatch_action(
            request_id(),
            &caller_context(),
            vm_uuid,
            &json!({"action": "rollback_snapshot", "snapshot_name": "nope"}),
        )
        .await
        .unwrap_err();

    assert_eq!(error.code(), "ValidationFailed");
}

// ---------------------------------------------------------------------------
// Store readiness
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ping_surfaces_store_initialization_state() {
    let harness = harness().await;
    assert!(harness.service.ping().await.is_ok());

    *harness.repository.status.write().await = StoreStatus::NotSetup;
    let error = harness.service.ping().await.unwrap_err();
    assert_eq!(error.code(), "MorayBucketsNotSetup");

    *harness.repository.status.write().await = StoreStatus::MigrationPending;
    let error = harness.service.ping().await.unwrap_err();
    assert_eq!(error.code(), "DataVersion");
}
