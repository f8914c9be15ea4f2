use std::env;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use tracing_subscriber::EnvFilter;
use url::Url;
use zonegrid_core::AppError;

/// Persistence backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// In-memory store for development and tests.
    Memory,
    /// Durable Postgres store.
    Postgres,
}

/// Waitlist backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitlistBackend {
    /// In-process FIFO queues; single API instance only.
    Memory,
    /// Redis-backed distributed waitlist.
    Redis,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub migrate_only: bool,
    pub api_host: String,
    pub api_port: u16,
    pub store_backend: StoreBackend,
    pub database_url: Option<String>,
    pub waitlist_backend: WaitlistBackend,
    pub redis_url: Option<String>,
    pub workflow_api_url: String,
    pub network_api_url: String,
    pub compute_api_url: String,
    pub package_api_url: String,
    pub image_api_url: String,
    pub search_limit_cap: usize,
}

impl ApiConfig {
    pub fn load() -> Result<Self, AppError> {
        let migrate_only = env::args().nth(1).as_deref() == Some("migrate");

        let api_host = env::var("API_HOST").unwrap_or_else(|_| "127.0.0.1".to_owned());
        let api_port = env::var("API_PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(8080);

        let store_backend = match env::var("STORE_BACKEND")
            .unwrap_or_else(|_| "postgres".to_owned())
            .to_lowercase()
            .as_str()
        {
            "memory" => StoreBackend::Memory,
            "postgres" => StoreBackend::Postgres,
            other => {
                return Err(AppError::Internal(format!(
                    "STORE_BACKEND must be either 'memory' or 'postgres', got '{other}'"
                )));
            }
        };

        let database_url = optional_env("DATABASE_URL");
        if store_backend == StoreBackend::Postgres && database_url.is_none() {
            return Err(AppError::Internal(
                "DATABASE_URL is required when STORE_BACKEND=postgres".to_owned(),
            ));
        }

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

        let redis_url = optional_env("REDIS_URL");
        if waitlist_backend == WaitlistBackend::Redis && redis_url.is_none() {
            return Err(AppError::Internal(
                "REDIS_URL is required when WAITLIST_BACKEND=redis".to_owned(),
            ));
        }

        Ok(Self {
            migrate_only,
            api_host,
            api_port,
            store_backend,
            database_url,
            waitlist_backend,
            redis_url,
            workflow_api_url: required_url("WORKFLOW_API_URL")?,
            network_api_url: required_url("NETWORK_API_URL")?,
            compute_api_url: required_url("COMPUTE_API_URL")?,
            package_api_url: required_url("PACKAGE_API_URL")?,
            image_api_url: required_url("IMAGE_API_URL")?,
            search_limit_cap: parse_env_usize("SEARCH_LIMIT_CAP", 1000)?,
        })
    }

    pub fn socket_address(&self) -> Result<SocketAddr, AppError> {
        let host = IpAddr::from_str(&self.api_host).map_err(|error| {
            AppError::Internal(format!("invalid API_HOST '{}': {error}", self.api_host))
        })?;
        Ok(SocketAddr::from((host, self.api_port)))
    }
}

pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn optional_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn required_url(name: &str) -> Result<String, AppError> {
    let value =
        env::var(name).map_err(|_| AppError::Internal(format!("{name} is required")))?;

    Url::parse(value.as_str())
        .map_err(|error| AppError::Internal(format!("invalid {name} '{value}': {error}")))?;

    Ok(value.trim_end_matches('/').to_owned())
}

fn parse_env_usize(name: &str, default: usize) -> Result<usize, AppError> {
    match env::var(name) {
        Ok(value) => value.parse::<usize>().map_err(|error| {
            AppError::Internal(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}
