//! Crash recovery: fail nodes stranded `in_progress` by a previous run.
//!
//! `in_progress` never survives a clean shutdown, so any such row at
//! startup belongs to a crashed process. Failing it keeps the tree free of
//! orphaned "running" nodes whose status lies about work actually
//! happening.

use crate::task::{Task, TaskRepository, TaskStatus};

/// Diagnostic recorded on every recovered node.
pub const RECOVERY_DIAGNOSTIC: &str = "interrupted by restart";

/// Scan the repository for stranded nodes and fail them.
///
/// Returns the recovered tasks (pre-update snapshots) so the caller can
/// surface them to the operator.
pub async fn run_recovery_sweep(
    repo: &dyn TaskRepository,
) -> Result<Vec<Task>, crate::task::RepoError> {
    let stranded = repo.list_interrupted().await?;

    for task in &stranded {
        repo.update_status(&task.id, TaskStatus::Failed, None, Some(RECOVERY_DIAGNOSTIC))
            .await?;
        tracing::warn!(task_id = %task.id, "Recovered stranded task: {}",
            crate::util::truncate_chars(&task.description, 80));
    }

    Ok(stranded)
}
