use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::{Extension, Json};
use serde_json::{Map, Value};

use zonegrid_core::{AppError, FieldError, RequestContext, RequestId};

use crate::dto::VmJobResponse;
use crate::error::ApiResult;
use crate::handlers::vms::{accepted, parse_vm_uuid};
use crate::state::AppState;

pub async fn list_tags_handler(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> ApiResult<Json<Value>> {
    let uuid = parse_vm_uuid(uuid.as_str())?;
    let tags = state.vm_service.list_tags(uuid).await?;
    Ok(Json(Value::Object(tags)))
}

pub async fn get_tag_handler(
    State(state): State<AppState>,
    Path((uuid, key)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let uuid = parse_vm_uuid(uuid.as_str())?;
    Ok(Json(state.vm_service.get_tag(uuid, key.as_str()).await?))
}

/// `POST /vms/:uuid/tags` merges new tags into the collection.
pub async fn add_tags_handler(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(context): Extension<RequestContext>,
    Path(uuid): Path<String>,
    Json(payload): Json<Value>,
) -> ApiResult<(StatusCode, HeaderMap, Json<VmJobResponse>)> {
    let uuid = parse_vm_uuid(uuid.as_str())?;
    let tags = tag_map(payload)?;

    let (_, job) = state
        .vm_service
        .add_tags(request_id, &context, uuid, tags)
        .await?;

    accepted(&state, uuid, job.uuid)
}

/// `PUT /vms/:uuid/tags` replaces the entire tag collection.
pub async fn set_tags_handler(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(context): Extension<RequestContext>,
    Path(uuid): Path<String>,
    Json(payload): Json<Value>,
) -> ApiResult<(StatusCode, HeaderMap, Json<VmJobResponse>)> {
    let uuid = parse_vm_uuid(uuid.as_str())?;
    let tags = tag_map(payload)?;

    let (_, job) = state
        .vm_service
        .set_tags(request_id, &context, uuid, tags)
        .await?;

    accepted(&state, uuid, job.uuid)
}

pub async fn delete_tag_handler(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(context): Extension<RequestContext>,
    Path((uuid, key)): Path<(String, String)>,
) -> ApiResult<(StatusCode, HeaderMap, Json<VmJobResponse>)> {
    let uuid = parse_vm_uuid(uuid.as_str())?;
    let job = state
        .vm_service
        .delete_tag(request_id, &context, uuid, key.as_str())
        .await?;

    accepted(&state, uuid, job.uuid)
}

pub async fn delete_all_tags_handler(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(context): Extension<RequestContext>,
    Path(uuid): Path<String>,
) -> ApiResult<(StatusCode, HeaderMap, Json<VmJobResponse>)> {
    let uuid = parse_vm_uuid(uuid.as_str())?;
    let job = state
        .vm_service
        .delete_all_tags(request_id, &context, uuid)
        .await?;

    accepted(&state, uuid, job.uuid)
}

fn tag_map(payload: Value) -> Result<Map<String, Value>, AppError> {
    match payload {
        Value::Object(tags) => Ok(tags),
        _ => Err(AppError::validation(vec![FieldError::invalid(
            "tags",
            "tags must be a JSON object",
        )])),
    }
}
