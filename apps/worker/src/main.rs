//! zonegrid reconciler runtime.
//!
//! Polls the workflow executor for terminal jobs past a cursor and applies
//! each outcome through the reconciler: VM state markers, NIC cleanup,
//! fabric-NAT reaping and ticket release. A Redis singleton lease keeps one
//! runtime active at a time when replicas are deployed.

#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use zonegrid_application::{
    Collaborators, Reconciler, ReconcilerLeaseCoordinator, VmService, WaitlistCoordinator,
    WorkflowClient,
};
use zonegrid_core::{AppError, AppResult, RequestId};
use zonegrid_infrastructure::{
    HttpComputeClient, HttpImageClient, HttpNetworkClient, HttpPackageClient, HttpWorkflowClient,
    InMemoryWaitlistCoordinator, PostgresVmRepository, RedisReconcilerLeaseCoordinator,
    RedisWaitlistCoordinator,
};

const RECONCILER_LEASE_SCOPE: &str = "reconciler";

#[derive(Debug, Clone)]
struct WorkerConfig {
    database_url: String,
    workflow_api_url: String,
    network_api_url: String,
    compute_api_url: String,
    package_api_url: String,
    image_api_url: String,
    worker_id: String,
    redis_url: Option<String>,
    coordination_backend: WorkerCoordinationBackend,
    coordination_lease_seconds: u32,
    waitlist_backend: WaitlistBackend,
    poll_interval_ms: u64,
    cursor_overlap_seconds: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerCoordinationBackend {
    None,
    Redis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitlistBackend {
    Memory,
    Redis,
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = WorkerConfig::load()?;
    let pool = connect_pool(config.database_url.as_str()).await?;
    let workflows = build_workflow_client(&config)?;
    let reconciler = build_reconciler(&config, pool, workflows.clone())?;
    let lease_coordinator = build_lease_coordinator(&config)?;

    info!(
        worker_id = %config.worker_id,
        workflow_api_url = %config.workflow_api_url,
        coordination_backend = ?config.coordination_backend,
        poll_interval_ms = config.poll_interval_ms,
        "zonegrid-worker started"
    );

    let mut cursor = Utc::now() - chrono::Duration::seconds(config.cursor_overlap_seconds);
    let mut reconciled: HashSet<Uuid> = HashSet::new();

    loop {
        let lease = match &lease_coordinator {
            None => None,
            Some(coordinator) => {
                match coordinator
                    .try_acquire(
                        RECONCILER_LEASE_SCOPE,
                        config.worker_id.as_str(),
                        config.coordination_lease_seconds,
                    )
                    .await
                {
                    Ok(Some(lease)) => Some(lease),
                    Ok(None) => {
                        info!(
                            worker_id = %config.worker_id,
                            "reconciler lease held elsewhere; standing by"
                        );
                        tokio::time::sleep(Duration::from_millis(config.poll_interval_ms)).await;
                        continue;
                    }
                    Err(error) => {
                        warn!(
                            worker_id = %config.worker_id,
                            error = %error,
                            "failed to acquire reconciler lease"
                        );
                        tokio::time::sleep(Duration::from_millis(config.poll_interval_ms)).await;
                        continue;
                    }
                }
            }
        };

        let cycle = run_reconcile_cycle(
            &reconciler,
            workflows.as_ref(),
            &config,
            cursor,
            &mut reconciled,
        )
        .await;

        if let (Some(coordinator), Some(lease)) = (&lease_coordinator, &lease)
            && let Err(error) = coordinator.release(lease).await
        {
            warn!(
                worker_id = %config.worker_id,
                error = %error,
                "failed to release reconciler lease"
            );
        }

        match cycle {
            Ok(new_cursor) => {
                cursor = new_cursor;
                // Bound the dedup set; jobs behind the cursor overlap window
                // can no longer reappear.
                if reconciled.len() > 10_000 {
                    reconciled.clear();
                }
            }
            Err(error) => {
                warn!(
                    worker_id = %config.worker_id,
                    error = %error,
                    "reconcile cycle failed"
                );
            }
        }

        tokio::time::sleep(Duration::from_millis(config.poll_interval_ms)).await;
    }
}

/// One poll cycle: fetch terminal jobs past the cursor and apply each
/// outcome. Returns the advanced cursor.
async fn run_reconcile_cycle(
    reconciler: &Reconciler,
    workflows: &dyn WorkflowClient,
    config: &WorkerConfig,
    cursor: DateTime<Utc>,
    reconciled: &mut HashSet<Uuid>,
) -> AppResult<DateTime<Utc>> {
    let request_id = RequestId::new();
    let jobs = workflows.terminal_jobs_since(request_id, cursor).await?;

    if jobs.is_empty() {
        return Ok(cursor);
    }

    let mut applied = 0_u32;
    let mut failed = 0_u32;
    let mut max_seen = cursor;

    for job in &jobs {
        if job.updated_at > max_seen {
            max_seen = job.updated_at;
        }
        if !reconciled.insert(job.uuid) {
            continue;
        }

        match reconciler.reconcile(request_id, job).await {
            Ok(()) => {
                applied += 1;
                info!(
                    worker_id = %config.worker_id,
                    job_uuid = %job.uuid,
                    task = %job.task,
                    execution = %job.execution.as_str(),
                    "job outcome reconciled"
                );
            }
            Err(error) => {
                failed += 1;
                // Drop it from the dedup set so the next cycle retries.
                reconciled.remove(&job.uuid);
                warn!(
                    worker_id = %config.worker_id,
                    job_uuid = %job.uuid,
                    task = %job.task,
                    error = %error,
                    "failed to reconcile job outcome"
                );
            }
        }
    }

    info!(
        worker_id = %config.worker_id,
        seen = jobs.len(),
        applied,
        failed,
        "reconcile cycle finished"
    );

    // Keep a small overlap so jobs that share the boundary timestamp are
    // seen again; the dedup set makes the re-read harmless.
    Ok(max_seen - chrono::Duration::seconds(config.cursor_overlap_seconds))
}

fn build_reconciler(
    config: &WorkerConfig,
    pool: PgPool,
    workflows: Arc<HttpWorkflowClient>,
) -> AppResult<Reconciler> {
    let repository = Arc::new(PostgresVmRepository::new(pool));

    let waitlist: Arc<dyn WaitlistCoordinator> = match config.waitlist_backend {
        WaitlistBackend::Memory => Arc::new(InMemoryWaitlistCoordinator::new()),
        WaitlistBackend::Redis => {
            let redis_url = config.redis_url.as_deref().ok_or_else(|| {
                AppError::Internal("REDIS_URL is required when WAITLIST_BACKEND=redis".to_owned())
            })?;
            let redis_client = redis::Client::open(redis_url)
                .map_err(|error| AppError::Internal(format!("invalid REDIS_URL: {error}")))?;
            Arc::new(RedisWaitlistCoordinator::new(
                redis_client,
                "zonegrid:waitlist",
            ))
        }
    };

    let http_client = reqwest_client()?;
    let collaborators = Collaborators {
        networks: Arc::new(HttpNetworkClient::new(
            http_client.clone(),
            config.network_api_url.clone(),
        )),
        compute: Arc::new(HttpComputeClient::new(
            http_client.clone(),
            config.compute_api_url.clone(),
        )),
        packages: Arc::new(HttpPackageClient::new(
            http_client.clone(),
            config.package_api_url.clone(),
        )),
        images: Arc::new(HttpImageClient::new(
            http_client,
            config.image_api_url.clone(),
        )),
    };

    let service = VmService::new(repository, waitlist, workflows, collaborators);
    Ok(Reconciler::new(service))
}

fn build_workflow_client(config: &WorkerConfig) -> AppResult<Arc<HttpWorkflowClient>> {
    Ok(Arc::new(HttpWorkflowClient::new(
        reqwest_client()?,
        config.workflow_api_url.clone(),
    )))
}

fn reqwest_client() -> AppResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
        .map_err(|error| AppError::Internal(format!("failed to build HTTP client: {error}")))
}

fn build_lease_coordinator(
    config: &WorkerConfig,
) -> AppResult<Option<Arc<dyn ReconcilerLeaseCoordinator>>> {
    match config.coordination_backend {
        WorkerCoordinationBackend::None => Ok(None),
        WorkerCoordinationBackend::Redis => {
            let redis_url = config.redis_url.as_deref().ok_or_else(|| {
                AppError::Internal(
                    "REDIS_URL is required when WORKER_COORDINATION_BACKEND=redis".to_owned(),
                )
            })?;

            let redis_client = redis::Client::open(redis_url)
                .map_err(|error| AppError::Internal(format!("invalid REDIS_URL: {error}")))?;

            Ok(Some(Arc::new(RedisReconcilerLeaseCoordinator::new(
                redis_client,
                "zonegrid:reconciler_lease",
            ))))
        }
    }
}

async fn connect_pool(database_url: &str) -> AppResult<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .map_err(|error| AppError::Internal(format!("failed to connect to database: {error}")))
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

impl WorkerConfig {
    fn load() -> AppResult<Self> {
        let database_url = required_env("DATABASE_URL")?;
        let workflow_api_url = required_env("WORKFLOW_API_URL")?;
        let network_api_url = required_env("NETWORK_API_URL")?;
        let compute_api_url = required_env("COMPUTE_API_URL")?;
        let package_api_url = required_env("PACKAGE_API_URL")?;
        let image_api_url = required_env("IMAGE_API_URL")?;

        let worker_id = env::var("WORKER_ID")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| format!("reconciler-{}", std::process::id()));

        let redis_url = env::var("REDIS_URL")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        let coordination_backend = match env::var("WORKER_COORDINATION_BACKEND")
            .unwrap_or_else(|_| "none".to_owned())
            .to_lowercase()
            .as_str()
        {
            "none" => WorkerCoordinationBackend::None,
            "redis" => WorkerCoordinationBackend::Redis,
            other => {
                return Err(AppError::Internal(format!(
                    "WORKER_COORDINATION_BACKEND must be either 'none' or 'redis', got '{other}'"
                )));
            }
        };

        let waitlist_backend = match env::var("WAITLIST_BACKEND")
            .unwrap_or_else(|_| "memory".to_owned())
            .to_lowercase()
            .as_str()
        {
            "memory" => WaitlistBackend::Memory,
            "redis" => WaitlistBackend::Redis,
            other => {
                return Err(AppError::Internal(format!(
                    "WAITLIST_BACKEND must be either 'memory' or 'redis', got '{other}'"
                )));
            }
        };

        let coordination_lease_seconds = parse_env_u32("WORKER_COORDINATION_LEASE_SECONDS", 120)?;
        let poll_interval_ms = parse_env_u64("WORKER_POLL_INTERVAL_MS", 1500)?;
        let cursor_overlap_seconds = i64::from(parse_env_u32("WORKER_CURSOR_OVERLAP_SECONDS", 5)?);

        if matches!(coordination_backend, WorkerCoordinationBackend::Redis) && redis_url.is_none()
        {
            return Err(AppError::Internal(
                "REDIS_URL is required when WORKER_COORDINATION_BACKEND=redis".to_owned(),
            ));
        }

        if coordination_lease_seconds == 0 {
            return Err(AppError::Internal(
                "WORKER_COORDINATION_LEASE_SECONDS must be greater than zero".to_owned(),
            ));
        }

        if poll_interval_ms == 0 {
            return Err(AppError::Internal(
                "WORKER_POLL_INTERVAL_MS must be greater than zero".to_owned(),
            ));
        }

        Ok(Self {
            database_url,
            workflow_api_url,
            network_api_url,
            compute_api_url,
            package_api_url,
            image_api_url,
            worker_id,
            redis_url,
            coordination_backend,
            coordination_lease_seconds,
            waitlist_backend,
            poll_interval_ms,
            cursor_overlap_seconds,
        })
    }
}

fn required_env(name: &str) -> AppResult<String> {
    env::var(name).map_err(|_| AppError::Internal(format!("{name} is required")))
}

fn parse_env_u32(name: &str, default: u32) -> AppResult<u32> {
    match env::var(name) {
        Ok(value) => value.parse::<u32>().map_err(|error| {
            AppError::Internal(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_env_u64(name: &str, default: u64) -> AppResult<u64> {
    match env::var(name) {
        Ok(value) => value.parse::<u64>().map_err(|error| {
            AppError::Internal(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}
