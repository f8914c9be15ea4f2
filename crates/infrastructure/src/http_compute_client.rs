//! HTTP client for the compute node API (capacity and live VM state).

use async_trait::async_trait;
use reqwest::StatusCode;
use uuid::Uuid;

use zonegrid_application::{ComputeProvider, ServerCapacity, ServerVmSnapshot};
use zonegrid_core::{AppError, AppResult, RequestId};
use zonegrid_domain::VmState;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Compute node API adapter.
#[derive(Clone)]
pub struct HttpComputeClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpComputeClient {
    /// Creates a client against the compute API base URL.
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }
}

#[async_trait]
impl ComputeProvider for HttpComputeClient {
    async fn server_capacity(
        &self,
        request_id: RequestId,
        server_uuid: Uuid,
    ) -> AppResult<ServerCapacity> {
        let response = self
            .client
            .get(format!("{}/servers/{server_uuid}", self.base_url))
            .header(REQUEST_ID_HEADER, request_id.to_string())
            .send()
            .await
            .map_err(|error| AppError::Internal(format!("compute API request failed: {error}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_owned());
            return Err(AppError::Internal(format!(
                "compute API fetch server returned status {}: {body}",
                status.as_u16()
            )));
        }

        #[derive(serde::Deserialize)]
        struct ServerRecord {
            uuid: Uuid,
            unreserved_ram: i64,
        }

        let record = response.json::<ServerRecord>().await.map_err(|error| {
            AppError::Internal(format!("failed to parse server record: {error}"))
        })?;

        Ok(ServerCapacity {
            server_uuid: record.uuid,
            available_ram_mib: record.unreserved_ram,
        })
    }

    async fn vm_snapshot(
        &self,
        request_id: RequestId,
        server_uuid: Uuid,
        vm_uuid: Uuid,
    ) -> AppResult<Option<ServerVmSnapshot>> {
        let response = self
            .client
            .get(format!(
                "{}/servers/{server_uuid}/vms/{vm_uuid}",
                self.base_url
            ))
            .header(REQUEST_ID_HEADER, request_id.to_string())
            .send()
            .await
            .map_err(|error| AppError::Internal(format!("compute API request failed: {error}")))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_owned());
            return Err(AppError::Internal(format!(
                "compute API fetch VM returned status {}: {body}",
                status.as_u16()
            )));
        }

        #[derive(serde::Deserialize)]
        struct VmRecord {
            state: String,
        }

        let record = response
            .json::<VmRecord>()
            .await
            .map_err(|error| AppError::Internal(format!("failed to parse VM record: {error}")))?;

        Ok(Some(ServerVmSnapshot {
            state: VmState::parse(record.state.as_str())?,
        }))
    }
}
