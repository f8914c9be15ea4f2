//! zonegrid API composition root.

#![forbid(unsafe_code)]

mod api_config;
mod api_router;
mod api_services;
mod dto;
mod error;
mod handlers;
mod middleware;
mod state;

use tracing::info;
use zonegrid_core::AppError;

use crate::api_config::StoreBackend;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    api_config::init_tracing();

    let config = api_config::ApiConfig::load()?;

    let pool = match config.store_backend {
        StoreBackend::Postgres => {
            let database_url = config.database_url.as_deref().ok_or_else(|| {
                AppError::Internal(
                    "DATABASE_URL is required when STORE_BACKEND=postgres".to_owned(),
                )
            })?;
            let pool = api_services::connect_and_migrate(database_url).await?;
            if config.migrate_only {
                info!("database migrations applied successfully");
                return Ok(());
            }
            Some(pool)
        }
        StoreBackend::Memory => None,
    };

    let app_state = api_services::build_app_state(&config, pool)?;
    let app = api_router::build_router(app_state);
    let address = config.socket_address()?;

    let listener = tokio::net::TcpListener::bind(address)
        .await
        .map_err(|error| AppError::Internal(format!("failed to bind listener: {error}")))?;

    info!(%address, "zonegrid-api listening");

    axum::serve(listener, app)
        .await
        .map_err(|error| AppError::Internal(format!("api server error: {error}")))
}
