//! HTTP client for the workflow executor.
//!
//! The executor owns job progression; this adapter registers pipelines,
//! creates jobs bound to parameters and reads job state back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use zonegrid_application::{JobsQuery, WorkflowClient, WorkflowPipeline};
use zonegrid_core::{AppError, AppResult, RequestId};
use zonegrid_domain::Job;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Workflow executor adapter.
#[derive(Clone)]
pub struct HttpWorkflowClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct CreateJobRequest {
    pipeline: WorkflowPipeline,
    params: Value,
}

impl HttpWorkflowClient {
    /// Creates a client against the executor base URL.
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }

    /// Returns the executor URL advertised in mutation responses.
    #[must_use]
    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
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
            "workflow executor {operation} returned status {}: {body}",
            status.as_u16()
        )))
    }

    async fn parse_job(operation: &str, response: reqwest::Response) -> AppResult<Job> {
        response.json::<Job>().await.map_err(|error| {
            AppError::Internal(format!(
                "failed to parse workflow executor {operation} response: {error}"
            ))
        })
    }
}

#[async_trait]
impl WorkflowClient for HttpWorkflowClient {
    async fn submit_pipeline(
        &self,
        request_id: RequestId,
        pipeline: WorkflowPipeline,
        params: Value,
    ) -> AppResult<Job> {
        let response = self
            .client
            .post(format!("{}/jobs", self.base_url))
            .header(REQUEST_ID_HEADER, request_id.to_string())
            .json(&CreateJobRequest { pipeline, params })
            .send()
            .await
            .map_err(|error| {
                AppError::Internal(format!("workflow executor request failed: {error}"))
            })?;

        let response = Self::check_status("job submission", response).await?;
        Self::parse_job("job submission", response).await
    }

    async fn get_job(&self, request_id: RequestId, uuid: Uuid) -> AppResult<Option<Job>> {
        let response = self
            .client
            .get(format!("{}/jobs/{uuid}", self.base_url))
            .header(REQUEST_ID_HEADER, request_id.to_string())
            .send()
            .await
            .map_err(|error| {
                AppError::Internal(format!("workflow executor request failed: {error}"))
            })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = Self::check_status("job fetch", response).await?;
        Self::parse_job("job fetch", response).await.map(Some)
    }

    async fn list_jobs(&self, request_id: RequestId, query: JobsQuery) -> AppResult<Vec<Job>> {
        let mut request = self
            .client
            .get(format!("{}/jobs", self.base_url))
            .header(REQUEST_ID_HEADER, request_id.to_string())
            .query(&[
                ("limit", query.limit.to_string()),
                ("offset", query.offset.to_string()),
            ]);

        if let Some(vm_uuid) = query.vm_uuid {
            request = request.query(&[("vm_uuid", vm_uuid.to_string())]);
        }
        if let Some(task) = &query.task {
            request = request.query(&[("task", task.as_str())]);
        }
        if let Some(execution) = query.execution {
            request = request.query(&[("execution", execution.as_str())]);
        }

        let response = request.send().await.map_err(|error| {
            AppError::Internal(format!("workflow executor request failed: {error}"))
        })?;

        let response = Self::check_status("job listing", response).await?;
        response.json::<Vec<Job>>().await.map_err(|error| {
            AppError::Internal(format!("failed to parse workflow executor job list: {error}"))
        })
    }

    async fn cancel_job(&self, request_id: RequestId, uuid: Uuid) -> AppResult<Job> {
        let response = self
            .client
            .post(format!("{}/jobs/{uuid}/cancel", self.base_url))
            .header(REQUEST_ID_HEADER, request_id.to_string())
            .send()
            .await
            .map_err(|error| {
                AppError::Internal(format!("workflow executor request failed: {error}"))
            })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(AppError::NotFound(format!("Job {uuid} not found")));
        }

        let response = Self::check_status("job cancel", response).await?;
        Self::parse_job("job cancel", response).await
    }

    async fn terminal_jobs_since(
        &self,
        request_id: RequestId,
        cursor: DateTime<Utc>,
    ) -> AppResult<Vec<Job>> {
        let response = self
            .client
            .get(format!("{}/jobs", self.base_url))
            .header(REQUEST_ID_HEADER, request_id.to_string())
            .query(&[
                ("terminal", "true".to_owned()),
                ("since", cursor.to_rfc3339()),
            ])
            .send()
            .await
            .map_err(|error| {
                AppError::Internal(format!("workflow executor request failed: {error}"))
            })?;

        let response = Self::check_status("terminal job listing", response).await?;
        response.json::<Vec<Job>>().await.map_err(|error| {
            AppError::Internal(format!("failed to parse workflow executor job list: {error}"))
        })
    }
}
