use serde::Deserialize;
use uuid::Uuid;

/// Query string of `GET /jobs`.
#[derive(Debug, Deserialize)]
pub struct JobsListQuery {
    /// Restrict to jobs targeting one VM.
    pub vm_uuid: Option<Uuid>,
    /// Restrict to one mutation kind.
    pub task: Option<String>,
    /// Restrict to one execution state.
    pub execution: Option<String>,
}
