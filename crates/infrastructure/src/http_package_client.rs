//! HTTP client for the package catalog.

use async_trait::async_trait;
use reqwest::StatusCode;
use uuid::Uuid;

use zonegrid_application::{Package, PackageProvider};
use zonegrid_core::{AppError, AppResult, RequestId};

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Package catalog adapter.
#[derive(Clone)]
pub struct HttpPackageClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPackageClient {
    /// Creates a client against the package catalog base URL.
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }
}

#[async_trait]
impl PackageProvider for HttpPackageClient {
    async fn get_package(&self, request_id: RequestId, uuid: Uuid) -> AppResult<Option<Package>> {
        let response = self
            .client
            .get(format!("{}/packages/{uuid}", self.base_url))
            .header(REQUEST_ID_HEADER, request_id.to_string())
            .send()
            .await
            .map_err(|error| AppError::Internal(format!("package API request failed: {error}")))?;

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
                "package API fetch returned status {}: {body}",
                status.as_u16()
            )));
        }

        response
            .json::<Package>()
            .await
            .map(Some)
            .map_err(|error| AppError::Internal(format!("failed to parse package: {error}")))
    }
}
