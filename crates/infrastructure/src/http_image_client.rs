//! HTTP client for the image service.

use async_trait::async_trait;
use reqwest::StatusCode;
use uuid::Uuid;

use zonegrid_application::{Image, ImageProvider};
use zonegrid_core::{AppError, AppResult, RequestId};

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Image service adapter.
#[derive(Clone)]
pub struct HttpImageClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpImageClient {
    /// Creates a client against the image service base URL.
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }
}

#[async_trait]
impl ImageProvider for HttpImageClient {
    async fn get_image(&self, request_id: RequestId, uuid: Uuid) -> AppResult<Option<Image>> {
        let response = self
            .client
            .get(format!("{}/images/{uuid}", self.base_url))
            .header(REQUEST_ID_HEADER, request_id.to_string())
            .send()
            .await
            .map_err(|error| AppError::Internal(format!("image API request failed: {error}")))?;

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
                "image API fetch returned status {}: {body}",
                status.as_u16()
            )));
        }

        response
            .json::<Image>()
            .await
            .map(Some)
            .map_err(|error| AppError::Internal(format!("failed to parse image: {error}")))
    }
}
