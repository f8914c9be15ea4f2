use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::{Extension, Json};
use serde_json::Value;
use uuid::Uuid;

use zonegrid_application::ListVmsParams;
use zonegrid_core::{AppError, FieldError, RequestContext, RequestId};
use zonegrid_domain::{Job, MigrationRecord};

use crate::dto::{JobsListQuery, VmJobResponse};
use crate::error::ApiResult;
use crate::state::AppState;

/// Total matching count, ignoring pagination, on every listing response.
pub const RESOURCE_COUNT_HEADER: &str = "x-joyent-resource-count";

/// Executor URL advertised on accepted mutations.
pub const WORKFLOW_API_HEADER: &str = "workflow-api";

const STRUCTURED_QUERY_KEYS: &[&str] = &[
    "uuid",
    "owner_uuid",
    "brand",
    "alias",
    "ram",
    "server_uuid",
    "billing_id",
    "image_uuid",
    "docker",
];

pub async fn list_vms_handler(
    State(state): State<AppState>,
    Query(raw): Query<HashMap<String, String>>,
) -> ApiResult<(HeaderMap, Json<Vec<Value>>)> {
    let params = list_params_from_query(raw)?;
    let (rows, total) = state.vm_service.list_vms(&params).await?;

    Ok((resource_count_headers(total)?, Json(rows)))
}

pub async fn get_vm_handler(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> ApiResult<Json<Value>> {
    let uuid = parse_vm_uuid(uuid.as_str())?;
    Ok(Json(state.vm_service.get_vm(uuid).await?))
}

pub async fn create_vm_handler(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(context): Extension<RequestContext>,
    Json(payload): Json<Value>,
) -> ApiResult<(StatusCode, HeaderMap, Json<VmJobResponse>)> {
    let (vm_uuid, job) = state
        .vm_service
        .provision(request_id, &context, &payload)
        .await?;

    accepted(&state, vm_uuid, job.uuid)
}

pub async fn vm_action_handler(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(context): Extension<RequestContext>,
    Path(uuid): Path<String>,
    Json(payload): Json<Value>,
) -> ApiResult<(StatusCode, HeaderMap, Json<VmJobResponse>)> {
    let uuid = parse_vm_uuid(uuid.as_str())?;
    let job = state
        .vm_service
        .dispatch_action(request_id, &context, uuid, &payload)
        .await?;

    accepted(&state, uuid, job.uuid)
}

pub async fn delete_vm_handler(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(context): Extension<RequestContext>,
    Path(uuid): Path<String>,
) -> ApiResult<(StatusCode, HeaderMap, Json<VmJobResponse>)> {
    let uuid = parse_vm_uuid(uuid.as_str())?;
    let job = state.vm_service.destroy(request_id, &context, uuid).await?;

    accepted(&state, uuid, job.uuid)
}

pub async fn list_vm_jobs_handler(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(uuid): Path<String>,
    Query(query): Query<JobsListQuery>,
) -> ApiResult<Json<Vec<Job>>> {
    let uuid = parse_vm_uuid(uuid.as_str())?;
    let jobs = state
        .vm_service
        .list_jobs(request_id, Some(uuid), query.task, query.execution)
        .await?;

    Ok(Json(jobs))
}

pub async fn get_vm_migration_handler(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> ApiResult<Json<MigrationRecord>> {
    let uuid = parse_vm_uuid(uuid.as_str())?;
    Ok(Json(state.vm_service.get_vm_migration(uuid).await?))
}

/// 202 with `{vm_uuid, job_uuid}` plus the executor location header.
pub(crate) fn accepted(
    state: &AppState,
    vm_uuid: Uuid,
    job_uuid: Uuid,
) -> ApiResult<(StatusCode, HeaderMap, Json<VmJobResponse>)> {
    let mut headers = HeaderMap::new();
    headers.insert(
        WORKFLOW_API_HEADER,
        HeaderValue::from_str(state.workflow_api_url.as_str())
            .map_err(|error| AppError::Internal(format!("invalid workflow API URL: {error}")))?,
    );

    Ok((
        StatusCode::ACCEPTED,
        headers,
        Json(VmJobResponse { vm_uuid, job_uuid }),
    ))
}

pub(crate) fn parse_vm_uuid(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| {
        AppError::validation(vec![FieldError::invalid(
            "uuid",
            format!("Invalid VM uuid: {raw}"),
        )])
    })
}

fn resource_count_headers(total: usize) -> Result<HeaderMap, AppError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        RESOURCE_COUNT_HEADER,
        HeaderValue::from_str(total.to_string().as_str())
            .map_err(|error| AppError::Internal(format!("invalid count header: {error}")))?,
    );
    Ok(headers)
}

fn list_params_from_query(raw: HashMap<String, String>) -> Result<ListVmsParams, AppError> {
    let mut params = ListVmsParams::default();

    for (key, value) in raw {
        match key.as_str() {
            "limit" => {
                params.limit = Some(value.parse::<usize>().map_err(|_| {
                    AppError::validation(vec![FieldError::invalid(
                        "limit",
                        format!("limit is not a non-negative integer: {value}"),
                    )])
                })?);
            }
            "offset" => {
                params.offset = Some(value.parse::<usize>().map_err(|_| {
                    AppError::validation(vec![FieldError::invalid(
                        "offset",
                        format!("offset is not a non-negative integer: {value}"),
                    )])
                })?);
            }
            "fields" => params.fields = Some(value),
            "sort" => params.sort = Some(value),
            "query" => params.query = Some(value),
            "predicate" => params.predicate = Some(value),
            "state" => params.state = Some(value),
            key if STRUCTURED_QUERY_KEYS.contains(&key) || key.starts_with("tag.") => {
                params.filters.push((key.to_owned(), value));
            }
            // Unknown query parameters are ignored.
            _ => {}
        }
    }

    Ok(params)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{list_params_from_query, parse_vm_uuid};

    #[test]
    fn query_keys_split_into_structured_and_reserved() {
        let mut raw = HashMap::new();
        raw.insert("ram".to_owned(), "256".to_owned());
        raw.insert("tag.role".to_owned(), "database".to_owned());
        raw.insert("limit".to_owned(), "10".to_owned());
        raw.insert("state".to_owned(), "active".to_owned());
        raw.insert("unknown_thing".to_owned(), "x".to_owned());

        let params = list_params_from_query(raw).unwrap();

        assert_eq!(params.limit, Some(10));
        assert_eq!(params.state.as_deref(), Some("active"));
        assert_eq!(params.filters.len(), 2);
    }

    #[test]
    fn malformed_limit_is_a_validation_error() {
        let mut raw = HashMap::new();
        raw.insert("limit".to_owned(), "ten".to_owned());
        assert!(list_params_from_query(raw).is_err());
    }

    #[test]
    fn vm_path_uuid_must_parse() {
        assert!(parse_vm_uuid("not-a-uuid").is_err());
        assert!(parse_vm_uuid("5e7c09a4-9e41-4f90-8e2f-6a355a4aa9aa").is_ok());
    }
}
