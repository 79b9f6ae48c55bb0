//! Task CRUD, dense position ordering, and status transitions.

use super::{now_ms, Database};
use crate::types::{CreateTaskInput, ExecutionMode, Task, TaskStatus};
use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

pub fn parse_task_row(row: &Row) -> rusqlite::Result<Task> {
    let id: String = row.get("id")?;
    let name: String = row.get("name")?;
    let prompt: String = row.get("prompt")?;
    let project: String = row.get("project")?;
    let mode: String = row.get("mode")?;
    let status: String = row.get("status")?;
    let position: i64 = row.get("position")?;
    let depends_on_json: String = row.get("depends_on")?;
    let session_name: Option<String> = row.get("session_name")?;
    let use_worktree: bool = row.get("use_worktree")?;
    let environment_id: Option<String> = row.get("environment_id")?;
    let error: Option<String> = row.get("error")?;
    let retry_count: i64 = row.get("retry_count")?;
    let created_at: i64 = row.get("created_at")?;
    let started_at: Option<i64> = row.get("started_at")?;
    let completed_at: Option<i64> = row.get("completed_at")?;

    Ok(Task {
        id,
        name,
        prompt,
        project,
        mode: ExecutionMode::from_str(&mode).unwrap_or(ExecutionMode::Interactive),
        status: TaskStatus::from_str(&status).unwrap_or(TaskStatus::Pending),
        position,
        depends_on: serde_json::from_str(&depends_on_json).unwrap_or_default(),
        session_name,
        use_worktree,
        environment_id,
        error,
        retry_count,
        created_at,
        started_at,
        completed_at,
    })
}

/// Internal helper to get a task using an existing connection (avoids deadlock).
pub(crate) fn get_task_internal(conn: &Connection, task_id: &str) -> Result<Option<Task>> {
    let mut stmt = conn.prepare("SELECT * FROM tasks WHERE id = ?1")?;

    let result = stmt.query_row(params![task_id], parse_task_row);

    match result {
        Ok(task) => Ok(Some(task)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Insert one task at the tail of the position order.
/// Dependencies must already exist (in the store or earlier in the same
/// transaction); the caller is responsible for cycle checking.
fn insert_task_internal(conn: &Connection, input: &CreateTaskInput) -> Result<Task> {
    let task_id = Uuid::new_v4().to_string();
    let now = now_ms();
    let mode = input.mode.unwrap_or(ExecutionMode::Interactive);

    for dep_id in &input.depends_on {
        if get_task_internal(conn, dep_id)?.is_none() {
            return Err(anyhow!("Dependency task not found: {}", dep_id));
        }
    }

    let position: i64 = conn.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?;
    let depends_on_json = serde_json::to_string(&input.depends_on)?;

    conn.execute(
        "INSERT INTO tasks (
            id, name, prompt, project, mode, status, position, depends_on,
            use_worktree, environment_id, retry_count, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?8, ?9, 0, ?10)",
        params![
            &task_id,
            &input.name,
            &input.prompt,
            &input.project,
            mode.as_str(),
            position,
            depends_on_json,
            input.use_worktree,
            &input.environment_id,
            now,
        ],
    )?;

    for dep_id in &input.depends_on {
        super::deps::add_dependency_internal(conn, dep_id, &task_id)?;
    }

    Ok(Task {
        id: task_id,
        name: input.name.clone(),
        prompt: input.prompt.clone(),
        project: input.project.clone(),
        mode,
        status: TaskStatus::Pending,
        position,
        depends_on: input.depends_on.clone(),
        session_name: None,
        use_worktree: input.use_worktree,
        environment_id: input.environment_id.clone(),
        error: None,
        retry_count: 0,
        created_at: now,
        started_at: None,
        completed_at: None,
    })
}

impl Database {
    /// Create a new task at the tail of the queue.
    pub fn create_task(&self, input: &CreateTaskInput) -> Result<Task> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let task = insert_task_internal(&tx, input)?;
            tx.commit()?;
            Ok(task)
        })
    }

    /// Create several tasks atomically with contiguous positions.
    /// Later inputs may depend on tasks created earlier in the same batch.
    pub fn create_task_batch(&self, inputs: &[CreateTaskInput]) -> Result<Vec<Task>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut tasks = Vec::with_capacity(inputs.len());
            for input in inputs {
                tasks.push(insert_task_internal(&tx, input)?);
            }
            tx.commit()?;
            Ok(tasks)
        })
    }

    /// Create a batch where dependencies reference other members of the
    /// same batch by index. Used by template instantiation, where task ids
    /// do not exist until the batch is created. Atomic; positions are
    /// contiguous in input order.
    pub fn create_linked_batch(
        &self,
        specs: &[(CreateTaskInput, Vec<usize>)],
    ) -> Result<Vec<Task>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let mut tasks: Vec<Task> = Vec::with_capacity(specs.len());
            for (input, _) in specs {
                tasks.push(insert_task_internal(&tx, input)?);
            }

            for (index, (_, dep_indexes)) in specs.iter().enumerate() {
                if dep_indexes.is_empty() {
                    continue;
                }
                let mut dep_ids: Vec<String> = tasks[index].depends_on.clone();
                for &dep_index in dep_indexes {
                    if dep_index >= tasks.len() {
                        return Err(anyhow!("dependency index {} out of range", dep_index));
                    }
                    let dep_id = tasks[dep_index].id.clone();
                    super::deps::add_dependency_internal(&tx, &dep_id, &tasks[index].id)?;
                    dep_ids.push(dep_id);
                }
                tx.execute(
                    "UPDATE tasks SET depends_on = ?1 WHERE id = ?2",
                    params![serde_json::to_string(&dep_ids)?, &tasks[index].id],
                )?;
                tasks[index].depends_on = dep_ids;
            }

            tx.commit()?;
            Ok(tasks)
        })
    }

    /// Get a task by ID.
    pub fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        self.with_conn(|conn| get_task_internal(conn, task_id))
    }

    /// List all tasks in position order.
    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM tasks ORDER BY position")?;
            let tasks = stmt
                .query_map([], parse_task_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
    }

    /// List tasks with the given status, in position order.
    pub fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM tasks WHERE status = ?1 ORDER BY position")?;
            let tasks = stmt
                .query_map(params![status.as_str()], parse_task_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
    }

    /// The ready task with the lowest position, if any.
    pub fn next_ready_task(&self) -> Result<Option<Task>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM tasks WHERE status = 'ready' ORDER BY position LIMIT 1",
            )?;
            let result = stmt.query_row([], parse_task_row);
            match result {
                Ok(task) => Ok(Some(task)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Transition a task to a new status.
    ///
    /// Sets `started_at` on the first transition into `running` and
    /// `completed_at` on terminal states. `error` is stored as given;
    /// passing `None` clears any previous error.
    pub fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<Task> {
        self.with_conn(|conn| update_status_internal(conn, task_id, status, error))
    }

    /// Record the session a task is running in.
    pub fn link_session(&self, task_id: &str, session_name: &str) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE tasks SET session_name = ?1 WHERE id = ?2",
                params![session_name, task_id],
            )?;
            if changed == 0 {
                return Err(anyhow!("Task not found: {}", task_id));
            }
            Ok(())
        })
    }

    /// Increment the retry counter. Called once per failure event.
    pub fn bump_retry_count(&self, task_id: &str) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET retry_count = retry_count + 1 WHERE id = ?1",
                params![task_id],
            )?;
            let count = conn.query_row(
                "SELECT retry_count FROM tasks WHERE id = ?1",
                params![task_id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    /// Put a failed task back into `ready`, clearing its error and run
    /// timestamps. The retry counter is untouched; it was already bumped
    /// when the failure was recorded.
    pub fn reset_for_retry(&self, task_id: &str) -> Result<Task> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE tasks SET status = 'ready', error = NULL,
                        started_at = NULL, completed_at = NULL
                 WHERE id = ?1",
                params![task_id],
            )?;
            if changed == 0 {
                return Err(anyhow!("Task not found: {}", task_id));
            }
            get_task_internal(conn, task_id)?.ok_or_else(|| anyhow!("Task not found: {}", task_id))
        })
    }

    /// Move a task to a new position, shifting the tasks in between.
    /// Returns the full task list in the new order.
    pub fn reorder_task(&self, task_id: &str, new_position: i64) -> Result<Vec<Task>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let task = get_task_internal(&tx, task_id)?
                .ok_or_else(|| anyhow!("Task not found: {}", task_id))?;
            let count: i64 = tx.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?;
            let new_position = new_position.clamp(0, count - 1);
            let old_position = task.position;

            if new_position > old_position {
                tx.execute(
                    "UPDATE tasks SET position = position - 1
                     WHERE position > ?1 AND position <= ?2",
                    params![old_position, new_position],
                )?;
            } else if new_position < old_position {
                tx.execute(
                    "UPDATE tasks SET position = position + 1
                     WHERE position >= ?1 AND position < ?2",
                    params![new_position, old_position],
                )?;
            }
            tx.execute(
                "UPDATE tasks SET position = ?1 WHERE id = ?2",
                params![new_position, task_id],
            )?;

            tx.commit()?;

            let mut stmt = conn.prepare("SELECT * FROM tasks ORDER BY position")?;
            let tasks = stmt
                .query_map([], parse_task_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
    }

    /// Delete a task and close the position gap it leaves.
    ///
    /// Only tasks in a deletable status (pending, ready, paused) may be
    /// deleted. Dependency edges referencing the task are removed in both
    /// directions so dependents do not wait on an id that no longer exists.
    pub fn delete_task(&self, task_id: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let task = get_task_internal(&tx, task_id)?
                .ok_or_else(|| anyhow!("Task not found: {}", task_id))?;
            if !task.status.is_deletable() {
                return Err(anyhow!(
                    "Task {} cannot be deleted while {}",
                    task_id,
                    task.status
                ));
            }

            // Drop the deleted id from every dependent's depends_on list.
            let dependents = super::deps::get_dependents_internal(&tx, task_id)?;
            for dep_id in dependents {
                if let Some(dependent) = get_task_internal(&tx, &dep_id)? {
                    let remaining: Vec<&String> = dependent
                        .depends_on
                        .iter()
                        .filter(|id| id.as_str() != task_id)
                        .collect();
                    tx.execute(
                        "UPDATE tasks SET depends_on = ?1 WHERE id = ?2",
                        params![serde_json::to_string(&remaining)?, dep_id],
                    )?;
                }
            }
            tx.execute(
                "DELETE FROM task_deps WHERE from_task_id = ?1 OR to_task_id = ?1",
                params![task_id],
            )?;

            tx.execute("DELETE FROM tasks WHERE id = ?1", params![task_id])?;
            tx.execute(
                "UPDATE tasks SET position = position - 1 WHERE position > ?1",
                params![task.position],
            )?;

            tx.commit()?;
            Ok(())
        })
    }

    /// Bulk-transition every task in one of `from` into `to`.
    /// Returns the affected tasks. Used by queue pause/resume.
    pub fn bulk_transition(&self, from: &[TaskStatus], to: TaskStatus) -> Result<Vec<Task>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut affected = Vec::new();
            for status in from {
                let mut stmt =
                    tx.prepare("SELECT * FROM tasks WHERE status = ?1 ORDER BY position")?;
                let tasks: Vec<Task> = stmt
                    .query_map(params![status.as_str()], parse_task_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                drop(stmt);
                for task in tasks {
                    affected.push(update_status_internal(&tx, &task.id, to, None)?);
                }
            }
            tx.commit()?;
            Ok(affected)
        })
    }
}

pub(crate) fn update_status_internal(
    conn: &Connection,
    task_id: &str,
    status: TaskStatus,
    error: Option<&str>,
) -> Result<Task> {
    let now = now_ms();
    let task =
        get_task_internal(conn, task_id)?.ok_or_else(|| anyhow!("Task not found: {}", task_id))?;

    let started_at = if status == TaskStatus::Running && task.started_at.is_none() {
        Some(now)
    } else {
        task.started_at
    };
    let completed_at = if status.is_terminal() {
        Some(now)
    } else {
        task.completed_at
    };

    conn.execute(
        "UPDATE tasks SET status = ?1, error = ?2, started_at = ?3, completed_at = ?4
         WHERE id = ?5",
        params![status.as_str(), error, started_at, completed_at, task_id],
    )?;

    Ok(Task {
        status,
        error: error.map(str::to_string),
        started_at,
        completed_at,
        ..task
    })
}
