use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use zonegrid_core::{AppError, AppResult};

/// Phase of a live migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    /// Target reservation and initial provision.
    Begin,
    /// Incremental data copy while the source keeps running.
    Sync,
    /// Final cutover to the target server.
    Switch,
}

impl MigrationPhase {
    /// Returns the stable storage value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Begin => "begin",
            Self::Sync => "sync",
            Self::Switch => "switch",
        }
    }

    /// Parses a request or storage value.
    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "begin" => Ok(Self::Begin),
            "sync" => Ok(Self::Sync),
            "switch" => Ok(Self::Switch),
            _ => Err(AppError::validation_message(
                format!("Invalid migration action: {value}"),
                Vec::new(),
            )),
        }
    }
}

/// State of the migration record as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    /// A phase workflow is currently executing.
    Running,
    /// Between phases; waiting for the next one.
    Paused,
    /// The last phase workflow failed.
    Failed,
    /// Switch completed; the VM lives on the target.
    Successful,
    /// Operator aborted the migration.
    Aborted,
}

/// One attempted phase in a migration's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationProgressEntry {
    /// Phase attempted.
    pub phase: MigrationPhase,
    /// Outcome state.
    pub state: MigrationState,
    /// Phase start time.
    pub started_at: DateTime<Utc>,
    /// Phase end time, once terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Persisted migration record; at most one active record per VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// VM being migrated.
    pub vm_uuid: Uuid,
    /// Server the VM migrates away from.
    pub source_server_uuid: Uuid,
    /// Server the VM migrates to; fixed once begin allocates it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_server_uuid: Option<Uuid>,
    /// Most recent phase.
    pub phase: MigrationPhase,
    /// Overall record state.
    pub state: MigrationState,
    /// Record creation time.
    pub created_at: DateTime<Utc>,
    /// Last phase transition time.
    pub updated_at: DateTime<Utc>,
    /// Per-phase history, oldest first.
    #[serde(default)]
    pub progress_history: Vec<MigrationProgressEntry>,
}

impl MigrationRecord {
    /// True while a phase workflow may still mutate this record.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self.state, MigrationState::Running | MigrationState::Paused)
    }
}
