//! taskdeck: a dependency-aware task queue executor.
//!
//! Tasks carry a free-text prompt and an execution mode: `print` runs the
//! prompt as a one-shot subprocess, `interactive` and `trust` drive a
//! persistent terminal session through an external provider. A poll-loop
//! scheduler promotes tasks whose dependencies have completed, starts at
//! most one task per tick, cascades skips through the dependents of failed
//! or skipped tasks, and parks failures in a single-slot gate until a human
//! decides to retry or skip.
//!
//! The terminal-session provider, environment-variable provider, execution
//! capacity provider, and notification channel are external collaborators
//! behind the traits in [`providers`].

pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod providers;
pub mod queue;
pub mod resolver;
pub(crate) mod scheduler;
pub mod types;

pub use config::QueueConfig;
pub use db::Database;
pub use error::{ErrorCode, QueueError, QueueResult};
pub use queue::{Providers, TaskQueue};
pub use types::{
    CreateTaskInput, CreateTemplateInput, ExecutionMode, QueueEvent, Task, TaskHistoryEntry,
    TaskStatus, Template, TemplateStep, TemplateVariables,
};
