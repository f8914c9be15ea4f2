use serde::Serialize;
use uuid::Uuid;

/// Body of every accepted asynchronous mutation.
#[derive(Debug, Serialize)]
pub struct VmJobResponse {
    /// Target (or newly assigned) VM.
    pub vm_uuid: Uuid,
    /// Accepted job; poll `/jobs/:uuid` for the outcome.
    pub job_uuid: Uuid,
}
