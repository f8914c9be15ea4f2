use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use zonegrid_application::{Collaborators, VmRepository, VmService, WaitlistCoordinator};
use zonegrid_core::AppError;
use zonegrid_infrastructure::{
    HttpComputeClient, HttpImageClient, HttpNetworkClient, HttpPackageClient, HttpWorkflowClient,
    InMemoryVmRepository, InMemoryWaitlistCoordinator, PostgresVmRepository,
    RedisWaitlistCoordinator,
};

use crate::api_config::{ApiConfig, StoreBackend, WaitlistBackend};
use crate::state::AppState;

pub async fn connect_and_migrate(database_url: &str) -> Result<PgPool, AppError> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(|error| AppError::Internal(format!("failed to connect to database: {error}")))?;

    sqlx::migrate!("../../crates/infrastructure/migrations")
        .run(&pool)
        .await
        .map_err(|error| AppError::Internal(format!("failed to run migrations: {error}")))?;

    Ok(pool)
}

pub fn build_app_state(config: &ApiConfig, pool: Option<PgPool>) -> Result<AppState, AppError> {
    let repository: Arc<dyn VmRepository> = match config.store_backend {
        StoreBackend::Memory => Arc::new(InMemoryVmRepository::new()),
        StoreBackend::Postgres => {
            let pool = pool.ok_or_else(|| {
                AppError::Internal("postgres store requires a connection pool".to_owned())
            })?;
            Arc::new(PostgresVmRepository::new(pool))
        }
    };

    let waitlist: Arc<dyn WaitlistCoordinator> = match config.waitlist_backend {
        WaitlistBackend::Memory => Arc::new(InMemoryWaitlistCoordinator::new()),
        WaitlistBackend::Redis => {
            let redis_url = config.redis_url.as_deref().ok_or_else(|| {
                AppError::Internal("redis waitlist requires REDIS_URL".to_owned())
            })?;
            let redis_client = redis::Client::open(redis_url)
                .map_err(|error| AppError::Internal(format!("invalid REDIS_URL: {error}")))?;
            Arc::new(RedisWaitlistCoordinator::new(
                redis_client,
                "zonegrid:waitlist",
            ))
        }
    };

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
        .map_err(|error| AppError::Internal(format!("failed to build HTTP client: {error}")))?;

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
            http_client.clone(),
            config.image_api_url.clone(),
        )),
    };

    let workflows = Arc::new(HttpWorkflowClient::new(
        http_client,
        config.workflow_api_url.clone(),
    ));

    let vm_service = VmService::new(repository, waitlist, workflows, collaborators)
        .with_search_limit_cap(config.search_limit_cap);

    Ok(AppState {
        vm_service,
        workflow_api_url: config.workflow_api_url.clone(),
    })
}
