//! Contracts for the external collaborators the queue core drives.
//!
//! The terminal-session provider, environment-variable provider, execution
//! capacity provider, and notification channel all live outside this crate.
//! The core only ever talks to them through these traits, so tests script
//! them and embedders plug in real backends (e.g. a terminal multiplexer).

use crate::types::QueueEvent;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Externally-reported status of a terminal session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Work finished; the session is sitting at an idle prompt.
    Idle,
    Working,
    /// The session is waiting for a human (e.g. a permission prompt).
    NeedsAttention,
    Unknown,
}

/// Handle to one live terminal session.
#[async_trait]
pub trait TerminalSession: Send + Sync {
    /// Resolve once the session is ready to accept input.
    async fn wait_ready(&self) -> anyhow::Result<()>;

    /// Inject one line of input into the session.
    async fn write_line(&self, text: &str) -> anyhow::Result<()>;

    /// Tear the session down immediately. Non-graceful.
    async fn kill(&self) -> anyhow::Result<()>;
}

/// Creates and observes terminal sessions.
#[async_trait]
pub trait TerminalProvider: Send + Sync {
    /// `use_worktree` is forwarded as-is; providers that support isolated
    /// worktrees may branch the working directory off it.
    async fn create(
        &self,
        working_dir: &str,
        session_name: &str,
        env: &HashMap<String, String>,
        use_worktree: bool,
    ) -> anyhow::Result<Box<dyn TerminalSession>>;

    /// Liveness check against the external session registry.
    async fn session_exists(&self, session_name: &str) -> anyhow::Result<bool>;

    /// Latest externally-reported status for the session.
    async fn session_status(&self, session_name: &str) -> anyhow::Result<SessionStatus>;
}

/// Resolves an environment id to a variable map.
#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    async fn resolve(&self, environment_id: &str) -> anyhow::Result<HashMap<String, String>>;
}

/// Current execution capacity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Capacity {
    /// How many additional concurrent sessions may be started.
    pub available: u32,
}

/// Reports and tracks execution capacity for session-backed tasks.
#[async_trait]
pub trait CapacityProvider: Send + Sync {
    async fn capacity(&self) -> anyhow::Result<Capacity>;

    async fn register(
        &self,
        session_name: &str,
        project: &str,
        metadata: serde_json::Value,
    ) -> anyhow::Result<()>;

    async fn unregister(&self, session_name: &str) -> anyhow::Result<()>;
}

/// Receives lifecycle events for delivery to observers. Best-effort: no
/// acknowledgement, no ordering guarantee, and failures are swallowed by
/// implementations rather than surfaced to the core.
pub trait Notifier: Send + Sync {
    fn send(&self, event: QueueEvent);
}
