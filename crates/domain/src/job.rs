use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use zonegrid_core::{AppError, AppResult};

/// Execution state of a job, owned by the workflow executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobExecution {
    /// Accepted, not started.
    Queued,
    /// Pipeline is running.
    Running,
    /// Pipeline finished successfully.
    Succeeded,
    /// Pipeline entered its error branch and finished.
    Failed,
    /// Pipeline was canceled.
    Canceled,
}

impl JobExecution {
    /// Returns the stable storage value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Parses a storage value.
    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            _ => Err(AppError::Internal(format!(
                "unknown job execution state '{value}'"
            ))),
        }
    }

    /// True once the executor will no longer progress the job.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

/// A workflow job as observed from the executor.
///
/// Jobs are append-only from this side: the executor owns progression, the
/// control plane reads and correlates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job identifier assigned at submission.
    pub uuid: Uuid,
    /// Workflow name, e.g. `provision-7.x`.
    pub name: String,
    /// Target VM.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_uuid: Option<Uuid>,
    /// Mutation kind (`provision`, `start`, `migrate-sync`, ...).
    pub task: String,
    /// Executor-owned progression state.
    pub execution: JobExecution,
    /// Bound pipeline parameters, including `context.caller`.
    pub params: Value,
    /// Whether a failure should mark the VM failed and trigger NIC cleanup.
    /// Cleared by the pipeline once the point of no return is reached.
    #[serde(rename = "markAsFailedOnError", default = "default_mark_as_failed")]
    pub mark_as_failed_on_error: bool,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Last progression time.
    pub updated_at: DateTime<Utc>,
}

fn default_mark_as_failed() -> bool {
    true
}

impl Job {
    /// Returns the caller recorded at API time, when present.
    #[must_use]
    pub fn caller(&self) -> Option<&Value> {
        self.params.get("context").and_then(|context| context.get("caller"))
    }
}

#[cfg(test)]
mod tests {
    use super::JobExecution;

    #[test]
    fn terminal_states() {
        assert!(!JobExecution::Queued.is_terminal());
        assert!(!JobExecution::Running.is_terminal());
        assert!(JobExecution::Succeeded.is_terminal());
        assert!(JobExecution::Failed.is_terminal());
        assert!(JobExecution::Canceled.is_terminal());
    }

    #[test]
    fn execution_round_trips_storage_values() {
        for state in [
            JobExecution::Queued,
            JobExecution::Running,
            JobExecution::Succeeded,
            JobExecution::Failed,
            JobExecution::Canceled,
        ] {
            assert_eq!(JobExecution::parse(state.as_str()).unwrap(), state);
        }
    }
}
