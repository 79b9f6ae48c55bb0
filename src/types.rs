//! Core types for the task queue executor.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
    Paused,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Paused => "paused",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "ready" => Some(TaskStatus::Ready),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "skipped" => Some(TaskStatus::Skipped),
            "paused" => Some(TaskStatus::Paused),
            _ => None,
        }
    }

    /// Terminal states set `completed_at` and never re-enter the scheduler
    /// on their own.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }

    /// Only tasks that have not started (or were paused) may be deleted.
    pub fn is_deletable(&self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Ready | TaskStatus::Paused
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a task's prompt is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One-shot subprocess; the prompt is passed as an argument and the
    /// process runs to completion.
    Print,
    /// Persistent terminal session; the user may be asked to act.
    Interactive,
    /// Persistent terminal session with permission prompts suppressed.
    Trust,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Print => "print",
            ExecutionMode::Interactive => "interactive",
            ExecutionMode::Trust => "trust",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "print" => Some(ExecutionMode::Print),
            "interactive" => Some(ExecutionMode::Interactive),
            "trust" => Some(ExecutionMode::Trust),
            _ => None,
        }
    }

    /// Whether this mode runs inside a persistent terminal session.
    pub fn is_session_backed(&self) -> bool {
        matches!(self, ExecutionMode::Interactive | ExecutionMode::Trust)
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of scheduled work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    /// Free-text instruction handed to the executor.
    pub prompt: String,
    /// Target working context; the working directory is derived from it.
    pub project: String,
    pub mode: ExecutionMode,
    pub status: TaskStatus,
    /// Dense execution order: a permutation of 0..N over the whole store.
    pub position: i64,
    /// Ids of tasks that must complete before this one becomes ready.
    pub depends_on: Vec<String>,
    /// Set once an interactive/trust task launches a session.
    pub session_name: Option<String>,
    pub use_worktree: bool,
    pub environment_id: Option<String>,
    pub error: Option<String>,
    /// Incremented once per distinct failure event, never per retry attempt.
    pub retry_count: i64,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

/// Input for creating a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateTaskInput {
    pub name: String,
    pub prompt: String,
    pub project: String,
    pub mode: Option<ExecutionMode>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub use_worktree: bool,
    pub environment_id: Option<String>,
}

/// A reusable ordered set of task specifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub steps: Vec<TemplateStep>,
    pub created_at: i64,
}

/// One step of a template. `prompt` may contain `{var}` placeholders that
/// are substituted textually at instantiation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateStep {
    pub name: String,
    pub prompt: String,
    pub mode: ExecutionMode,
    /// Index of the step this one depends on. Defaults to the immediately
    /// preceding step when absent.
    pub depends_on_step: Option<i64>,
    #[serde(default)]
    pub use_worktree: bool,
}

/// Input for creating a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTemplateInput {
    pub name: String,
    pub description: Option<String>,
    pub steps: Vec<TemplateStep>,
}

/// Append-only lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHistoryEntry {
    pub id: i64,
    pub task_id: String,
    pub status: TaskStatus,
    /// Event tag, e.g. "created", "started", "failed", "retried".
    pub event: String,
    pub details: Option<serde_json::Value>,
    pub timestamp: i64,
}

/// Lifecycle event delivered to the notifier. Delivery is best-effort with
/// no ordering guarantee across observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    TaskCreated { task: Task },
    TaskUpdated { task: Task },
    TaskDeleted { task_id: String },
    TasksReordered { tasks: Vec<Task> },
    TaskSkipped { task_id: String },
    /// A task failed and occupies the failure gate awaiting a human
    /// retry/skip decision.
    TaskFailed { task_id: String, error: String },
    QueuePaused,
    QueueResumed { tasks: Vec<Task> },
}

/// Variable map used when instantiating a template.
pub type TemplateVariables = HashMap<String, String>;
