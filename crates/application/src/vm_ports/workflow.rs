use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use zonegrid_core::{AppResult, RequestId};
use zonegrid_domain::{Job, JobExecution};

use crate::composer::WorkflowPipeline;

/// Job listing filter; results are ordered by creation time descending.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobsQuery {
    /// Restrict to jobs targeting one VM.
    pub vm_uuid: Option<Uuid>,
    /// Restrict to one mutation kind.
    pub task: Option<String>,
    /// Restrict to one execution state.
    pub execution: Option<JobExecution>,
    /// Page size.
    pub limit: usize,
    /// Row offset.
    pub offset: usize,
}

impl JobsQuery {
    /// Query scoped to one VM with the default page size.
    #[must_use]
    pub fn for_vm(vm_uuid: Uuid) -> Self {
        Self {
            vm_uuid: Some(vm_uuid),
            limit: 1000,
            ..Self::default()
        }
    }
}

/// Workflow executor port: pipeline submission and job observation.
///
/// The executor owns job progression; this side submits pipelines and reads
/// state.
#[async_trait]
pub trait WorkflowClient: Send + Sync {
    /// Registers a pipeline and creates a job bound to `params`. The job
    /// comes back in `queued` state.
    async fn submit_pipeline(
        &self,
        request_id: RequestId,
        pipeline: WorkflowPipeline,
        params: Value,
    ) -> AppResult<Job>;

    /// Fetches one job.
    async fn get_job(&self, request_id: RequestId, uuid: Uuid) -> AppResult<Option<Job>>;

    /// Lists jobs matching a filter, newest first.
    async fn list_jobs(&self, request_id: RequestId, query: JobsQuery) -> AppResult<Vec<Job>>;

    /// Requests cancellation; the executor drives the `oncancel` branch.
    async fn cancel_job(&self, request_id: RequestId, uuid: Uuid) -> AppResult<Job>;

    /// Lists jobs that reached a terminal state after `cursor`, oldest
    /// first. Drives the reconciler poll loop.
    async fn terminal_jobs_since(
        &self,
        request_id: RequestId,
        cursor: DateTime<Utc>,
    ) -> AppResult<Vec<Job>>;
}
