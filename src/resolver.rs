//! Dependency resolution: promotes pending tasks whose dependencies have
//! all completed, and cascades skips through dependents of failed or
//! skipped tasks.

use crate::db::Database;
use crate::types::{Task, TaskStatus};
use anyhow::Result;
use std::collections::HashSet;
use tracing::debug;

/// Outcome of one resolver pass.
#[derive(Debug, Default)]
pub struct ResolutionOutcome {
    /// Tasks promoted to ready.
    pub promoted: Vec<Task>,
    /// Task ids force-skipped because a dependency failed or was skipped.
    pub skipped: Vec<String>,
}

/// One pass over all pending tasks.
///
/// A task with no dependencies is ready immediately. A task whose
/// dependencies are all `completed` is promoted to `ready`. A task with any
/// `failed` or `skipped` dependency is force-skipped, along with its own
/// transitive dependents.
pub fn resolve_pending(db: &Database) -> Result<ResolutionOutcome> {
    let mut outcome = ResolutionOutcome::default();
    let mut already_skipped: HashSet<String> = HashSet::new();

    for task in db.list_tasks_by_status(TaskStatus::Pending)? {
        if already_skipped.contains(&task.id) {
            continue;
        }

        let statuses = db.dependency_statuses(&task.id)?;

        let blocked_by_terminal = statuses.iter().any(|(_, status)| {
            matches!(status, Some(TaskStatus::Failed) | Some(TaskStatus::Skipped))
        });
        if blocked_by_terminal {
            let chain = propagate_skip(db, &task.id)?;
            already_skipped.extend(chain.iter().cloned());
            outcome.skipped.extend(chain);
            continue;
        }

        let all_completed = statuses
            .iter()
            .all(|(_, status)| *status == Some(TaskStatus::Completed));
        if all_completed {
            debug!(task_id = %task.id, "dependencies satisfied, promoting to ready");
            let promoted = db.update_task_status(&task.id, TaskStatus::Ready, None)?;
            db.record_history(&task.id, TaskStatus::Ready, "ready", None)?;
            outcome.promoted.push(promoted);
        }
    }

    Ok(outcome)
}

/// Skip a task and cascade through its transitive dependents.
///
/// The starting task is skipped if it is pending, ready, or failed;
/// dependents are skipped while they are still pending or ready. A visited
/// set keeps the traversal idempotent and terminating, so each affected id
/// appears exactly once in the returned list.
pub fn propagate_skip(db: &Database, task_id: &str) -> Result<Vec<String>> {
    let mut visited: HashSet<String> = HashSet::new();
    let mut affected: Vec<String> = Vec::new();
    let mut stack: Vec<(String, bool)> = vec![(task_id.to_string(), true)];

    while let Some((current, is_root)) = stack.pop() {
        if !visited.insert(current.clone()) {
            continue;
        }

        let Some(task) = db.get_task(&current)? else {
            continue;
        };

        let skippable = match task.status {
            TaskStatus::Pending | TaskStatus::Ready => true,
            // Only the task the cascade starts from may be skipped out of
            // failed; a failed dependent keeps its failure record.
            TaskStatus::Failed => is_root,
            _ => false,
        };
        if !skippable {
            continue;
        }

        db.update_task_status(&current, TaskStatus::Skipped, None)?;
        db.record_history(&current, TaskStatus::Skipped, "skipped", None)?;
        affected.push(current.clone());

        for dependent in db.get_dependents(&current)? {
            if !visited.contains(&dependent) {
                stack.push((dependent, false));
            }
        }
    }

    debug!(start = %task_id, count = affected.len(), "skip cascade complete");
    Ok(affected)
}
