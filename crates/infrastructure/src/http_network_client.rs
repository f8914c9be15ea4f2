//! HTTP client for the network API (NIC CRUD and network lookup).

use async_trait::async_trait;
use reqwest::StatusCode;
use uuid::Uuid;

use zonegrid_application::{NetworkProvider, NetworkRecord, NicRecord};
use zonegrid_core::{AppError, AppResult, RequestId};

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Network API adapter.
#[derive(Clone)]
pub struct HttpNetworkClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpNetworkClient {
    /// Creates a client against a base URL like `http://napi.example:80`.
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }
}

#[async_trait]
impl NetworkProvider for HttpNetworkClient {
    async fn get_network(
        &self,
        request_id: RequestId,
        uuid: Uuid,
    ) -> AppResult<Option<NetworkRecord>> {
        let response = self
            .client
            .get(format!("{}/networks/{uuid}", self.base_url))
            .header(REQUEST_ID_HEADER, request_id.to_string())
            .send()
            .await
            .map_err(|error| AppError::Internal(format!("network API request failed: {error}")))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status("fetch network", response).await?;

        response
            .json::<NetworkRecord>()
            .await
            .map(Some)
            .map_err(|error| {
                AppError::Internal(format!("failed to parse network record: {error}"))
            })
    }

    async fn find_network_by_name(
        &self,
        request_id: RequestId,
        name: &str,
    ) -> AppResult<Option<NetworkRecord>> {
        let response = self
            .client
            .get(format!("{}/networks", self.base_url))
            .query(&[("name", name)])
            .header(REQUEST_ID_HEADER, request_id.to_string())
            .send()
            .await
            .map_err(|error| AppError::Internal(format!("network API request failed: {error}")))?;

        let response = check_status("search networks", response).await?;
        let records = response.json::<Vec<NetworkRecord>>().await.map_err(|error| {
            AppError::Internal(format!("failed to parse network records: {error}"))
        })?;

        Ok(records.into_iter().next())
    }

    async fn ip_owner(
        &self,
        request_id: RequestId,
        network_uuid: Uuid,
        ip: &str,
    ) -> AppResult<Option<Uuid>> {
        let response = self
            .client
            .get(format!("{}/networks/{network_uuid}/ips/{ip}", self.base_url))
            .header(REQUEST_ID_HEADER, request_id.to_string())
            .send()
            .await
            .map_err(|error| AppError::Internal(format!("network API request failed: {error}")))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status("fetch IP record", response).await?;

        #[derive(serde::Deserialize)]
        struct IpRecord {
            belongs_to_uuid: Option<Uuid>,
        }

        let record = response.json::<IpRecord>().await.map_err(|error| {
            AppError::Internal(format!("failed to parse IP record: {error}"))
        })?;

        Ok(record.belongs_to_uuid)
    }

    async fn create_nic(&self, request_id: RequestId, nic: NicRecord) -> AppResult<NicRecord> {
        let response = self
            .client
            .post(format!("{}/nics", self.base_url))
            .header(REQUEST_ID_HEADER, request_id.to_string())
            .json(&nic)
            .send()
            .await
            .map_err(|error| AppError::Internal(format!("network API request failed: {error}")))?;

        let response = check_status("create NIC", response).await?;
        response
            .json::<NicRecord>()
            .await
            .map_err(|error| AppError::Internal(format!("failed to parse NIC record: {error}")))
    }

    async fn list_nics(
        &self,
        request_id: RequestId,
        belongs_to_uuid: Uuid,
    ) -> AppResult<Vec<NicRecord>> {
        let response = self
            .client
            .get(format!("{}/nics", self.base_url))
            .query(&[("belongs_to_uuid", belongs_to_uuid.to_string())])
            .header(REQUEST_ID_HEADER, request_id.to_string())
            .send()
            .await
            .map_err(|error| AppError::Internal(format!("network API request failed: {error}")))?;

        let response = check_status("list NICs", response).await?;
        response
            .json::<Vec<NicRecord>>()
            .await
            .map_err(|error| AppError::Internal(format!("failed to parse NIC records: {error}")))
    }

    async fn delete_nic(&self, request_id: RequestId, mac: &str) -> AppResult<()> {
        let response = self
            .client
            .delete(format!("{}/nics/{}", self.base_url, mac.replace(':', "")))
            .header(REQUEST_ID_HEADER, request_id.to_string())
            .send()
            .await
            .map_err(|error| AppError::Internal(format!("network API request failed: {error}")))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status("delete NIC", response).await.map(|_| ())
    }
}

async fn check_status(
    operation: &str,
    response: reqwest::Response,
) -> AppResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<body unavailable>".to_owned());
    Err(AppError::Internal(format!(
        "network API {operation} returned status {}: {body}",
        status.as_u16()
    )))
}
