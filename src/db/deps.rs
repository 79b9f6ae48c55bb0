//! Dependency edge operations and cycle detection.

use super::Database;
use crate::types::TaskStatus;
use anyhow::Result;
use rusqlite::{params, Connection};
use std::collections::{HashSet, VecDeque};

/// Typed marker for cycle rejection, so the api layer can downcast it out
/// of the db layer's anyhow errors and surface its own error code.
#[derive(Debug, thiserror::Error)]
#[error("Dependency on {task_id} would create a cycle")]
pub struct DependencyCycleError {
    pub task_id: String,
}

/// Insert a dependency edge (from must complete before to).
/// Rejects edges that would make the graph cyclic.
pub(crate) fn add_dependency_internal(
    conn: &Connection,
    from_task_id: &str,
    to_task_id: &str,
) -> Result<()> {
    if from_task_id == to_task_id || would_create_cycle(conn, from_task_id, to_task_id)? {
        return Err(DependencyCycleError {
            task_id: from_task_id.to_string(),
        }
        .into());
    }

    conn.execute(
        "INSERT OR IGNORE INTO task_deps (from_task_id, to_task_id) VALUES (?1, ?2)",
        params![from_task_id, to_task_id],
    )?;
    Ok(())
}

/// Check if adding from -> to would create a cycle.
/// A cycle would occur if `from` is already reachable from `to`.
fn would_create_cycle(conn: &Connection, from_task_id: &str, to_task_id: &str) -> Result<bool> {
    let mut visited: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    queue.push_back(to_task_id.to_string());

    while let Some(current) = queue.pop_front() {
        if current == from_task_id {
            return Ok(true);
        }

        if !visited.insert(current.clone()) {
            continue;
        }

        let mut stmt =
            conn.prepare("SELECT to_task_id FROM task_deps WHERE from_task_id = ?1")?;
        let next: Vec<String> = stmt
            .query_map(params![&current], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;

        for id in next {
            if !visited.contains(&id) {
                queue.push_back(id);
            }
        }
    }

    Ok(false)
}

/// Ids of tasks whose depends_on includes the given task.
pub(crate) fn get_dependents_internal(conn: &Connection, task_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT to_task_id FROM task_deps WHERE from_task_id = ?1")?;
    let ids = stmt
        .query_map(params![task_id], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

impl Database {
    /// Ids of tasks the given task depends on.
    pub fn get_dependencies(&self, task_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT from_task_id FROM task_deps WHERE to_task_id = ?1")?;
            let ids = stmt
                .query_map(params![task_id], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    /// Ids of tasks that depend on the given task.
    pub fn get_dependents(&self, task_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| get_dependents_internal(conn, task_id))
    }

    /// Statuses of the given task's dependencies. A dependency id with no
    /// backing row yields `None` (the task can never become ready through
    /// it, which is surfaced to the resolver rather than hidden).
    pub fn dependency_statuses(&self, task_id: &str) -> Result<Vec<(String, Option<TaskStatus>)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT d.from_task_id, t.status
                 FROM task_deps d
                 LEFT JOIN tasks t ON t.id = d.from_task_id
                 WHERE d.to_task_id = ?1",
            )?;
            let rows = stmt
                .query_map(params![task_id], |row| {
                    let id: String = row.get(0)?;
                    let status: Option<String> = row.get(1)?;
                    Ok((id, status))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(rows
                .into_iter()
                .map(|(id, status)| (id, status.and_then(|s| TaskStatus::from_str(&s))))
                .collect())
        })
    }
}
