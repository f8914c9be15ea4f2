use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use uuid::Uuid;

use zonegrid_core::{AppError, FieldError, RequestId};
use zonegrid_domain::Job;

use crate::dto::JobsListQuery;
use crate::error::ApiResult;
use crate::state::AppState;

pub async fn list_jobs_handler(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Query(query): Query<JobsListQuery>,
) -> ApiResult<Json<Vec<Job>>> {
    let jobs = state
        .vm_service
        .list_jobs(request_id, query.vm_uuid, query.task, query.execution)
        .await?;

    Ok(Json(jobs))
}

pub async fn get_job_handler(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(uuid): Path<String>,
) -> ApiResult<Json<Job>> {
    let uuid = parse_job_uuid(uuid.as_str())?;
    Ok(Json(state.vm_service.get_job(request_id, uuid).await?))
}

/// Requests cancellation; the executor drives the pipeline's `oncancel`
/// branch and the reconciler applies the outcome.
pub async fn cancel_job_handler(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(uuid): Path<String>,
) -> ApiResult<Json<Job>> {
    let uuid = parse_job_uuid(uuid.as_str())?;
    Ok(Json(state.vm_service.cancel_job(request_id, uuid).await?))
}

fn parse_job_uuid(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| {
        AppError::validation(vec![FieldError::invalid(
            "uuid",
            format!("Invalid job uuid: {raw}"),
        )])
    })
}
