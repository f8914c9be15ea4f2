use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

use crate::error::ApiResult;
use crate::state::AppState;

/// Liveness probe; 503-class errors until the store buckets are ready.
pub async fn ping_handler(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    state.vm_service.ping().await?;
    Ok(Json(json!({"status": "OK"})))
}
