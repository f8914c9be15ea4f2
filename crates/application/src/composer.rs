//! Declarative workflow composition.
//!
//! The control plane never executes tasks in-process: each mutation selects
//! a pipeline here, binds parameters and hands the result to the external
//! workflow executor. Task names are `module.operation` references resolved
//! by the executor; retry, timeout and error/cancel branches are data.

use serde::{Deserialize, Serialize};

mod migrate;
mod pipelines;

#[cfg(test)]
mod tests;

pub use migrate::{migrate_begin_pipeline, migrate_sync_pipeline, migrate_switch_pipeline};
pub use pipelines::{
    ProvisionPipelineOptions, add_nics_pipeline, create_snapshot_pipeline,
    delete_snapshot_pipeline, destroy_pipeline, provision_pipeline, reboot_pipeline,
    remove_nics_pipeline, reprovision_pipeline, rollback_snapshot_pipeline, start_pipeline,
    stop_pipeline, update_pipeline, update_tags_pipeline,
};

/// One task of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTask {
    /// Executor operation reference, e.g. `cnapi.wait_task`.
    pub name: String,
    /// Per-task wall-clock budget in seconds.
    pub timeout_seconds: u64,
    /// Maximum attempts; bodies must be idempotent under retry.
    pub retry: u32,
    /// Whether a failure in this task still marks the VM failed and cleans
    /// up pre-created NICs. Cleared once the point of no return is reached.
    #[serde(rename = "markAsFailedOnError")]
    pub mark_as_failed_on_error: bool,
}

impl WorkflowTask {
    /// Creates a task with cleanup-on-error semantics.
    #[must_use]
    pub fn new(name: impl Into<String>, timeout_seconds: u64, retry: u32) -> Self {
        Self {
            name: name.into(),
            timeout_seconds,
            retry,
            mark_as_failed_on_error: true,
        }
    }

    /// Marks this task as running past the point of no return: physical
    /// zone creation has started, so errors must not clean up NICs.
    #[must_use]
    pub fn past_point_of_no_return(mut self) -> Self {
        self.mark_as_failed_on_error = false;
        self
    }
}

/// An ordered pipeline with error and cancel branches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowPipeline {
    /// Registered workflow name, `<task>-<version>`.
    pub name: String,
    /// Definition version; lets the executor deduplicate re-registration.
    pub version: String,
    /// Mutation kind this pipeline implements.
    pub task: String,
    /// Overall wall-clock budget in seconds.
    pub timeout_seconds: u64,
    /// Main task chain.
    pub tasks: Vec<WorkflowTask>,
    /// Branch executed when a task fails or times out.
    pub onerror: Vec<WorkflowTask>,
    /// Branch executed on explicit cancellation.
    pub oncancel: Vec<WorkflowTask>,
}

impl WorkflowPipeline {
    /// Creates an empty pipeline for a mutation kind.
    #[must_use]
    pub fn new(task: impl Into<String>, version: impl Into<String>, timeout_seconds: u64) -> Self {
        let task = task.into();
        let version = version.into();
        Self {
            name: format!("{task}-{version}"),
            version,
            task,
            timeout_seconds,
            tasks: Vec::new(),
            onerror: Vec::new(),
            oncancel: Vec::new(),
        }
    }

    /// Returns the names of the main task chain, for assertions and logs.
    #[must_use]
    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(|task| task.name.as_str()).collect()
    }

    /// True when every branch that acquires a ticket also releases it on
    /// the error and cancel paths.
    #[must_use]
    pub fn releases_tickets_on_all_paths(&self) -> bool {
        let acquires: Vec<&str> = self
            .tasks
            .iter()
            .filter_map(|task| task.name.strip_prefix("waitlist.acquire_"))
            .collect();

        acquires.iter().all(|suffix| {
            let release = format!("waitlist.release_{suffix}");
            let released_in = |branch: &[WorkflowTask]| {
                branch.iter().any(|task| task.name == release)
            };
            released_in(&self.onerror) && released_in(&self.oncancel)
        })
    }
}
