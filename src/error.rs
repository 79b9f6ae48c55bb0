//! Structured error types for queue operations.

use serde::Serialize;

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors
    MissingRequiredField,
    InvalidFieldValue,

    // Not found errors
    TaskNotFound,
    TemplateNotFound,

    // Conflict errors
    DependencyCycle,
    NotDeletable,
    /// retry/skip named a task other than the one in the failure gate.
    GateMismatch,

    // Internal errors
    DatabaseError,
    InternalError,
}

/// Structured error returned by the queue's public operations.
#[derive(Debug, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct QueueError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl QueueError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            field: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    // Convenience constructors

    pub fn missing_field(field: &str) -> Self {
        Self::new(
            ErrorCode::MissingRequiredField,
            format!("{} is required", field),
        )
        .with_field(field)
    }

    pub fn invalid_value(field: &str, reason: &str) -> Self {
        Self::new(ErrorCode::InvalidFieldValue, reason).with_field(field)
    }

    pub fn task_not_found(task_id: &str) -> Self {
        Self::new(
            ErrorCode::TaskNotFound,
            format!("Task not found: {}", task_id),
        )
    }

    pub fn template_not_found(template_id: &str) -> Self {
        Self::new(
            ErrorCode::TemplateNotFound,
            format!("Template not found: {}", template_id),
        )
    }

    pub fn dependency_cycle(task_id: &str) -> Self {
        Self::new(
            ErrorCode::DependencyCycle,
            format!("Dependency on {} would create a cycle", task_id),
        )
    }

    pub fn not_deletable(task_id: &str, status: &str) -> Self {
        Self::new(
            ErrorCode::NotDeletable,
            format!("Task {} cannot be deleted while {}", task_id, status),
        )
    }
}

impl From<anyhow::Error> for QueueError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(cycle) = err.downcast_ref::<crate::db::deps::DependencyCycleError>() {
            return Self::dependency_cycle(&cycle.task_id);
        }
        Self::new(ErrorCode::DatabaseError, err.to_string())
    }
}

/// Result alias for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;
