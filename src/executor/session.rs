//! Interactive/trust mode: persistent terminal sessions and their monitors.

use super::{resolve_env, sanitize_prompt, session_name_for};
use crate::config::QueueConfig;
use crate::db::Database;
use crate::providers::{CapacityProvider, EnvironmentProvider, SessionStatus, TerminalProvider};
use crate::scheduler::SchedulerCommand;
use crate::types::{ExecutionMode, Task};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub(crate) struct SessionLauncher {
    pub db: Database,
    pub config: Arc<QueueConfig>,
    pub terminal: Arc<dyn TerminalProvider>,
    pub environment: Arc<dyn EnvironmentProvider>,
    pub capacity: Arc<dyn CapacityProvider>,
    pub tx: mpsc::Sender<SchedulerCommand>,
}

/// Launch a persistent session for an interactive/trust task: link the
/// session in the store, register capacity, create the session, wait for
/// readiness, and inject the sanitized prompt after a settle delay.
///
/// The created handle is handed back to the scheduler, which owns it and
/// starts the monitor.
pub(crate) fn spawn_launch(launcher: SessionLauncher, task: Task) -> JoinHandle<()> {
    tokio::spawn(async move {
        let session_name = session_name_for(&task.project, &task.id);
        match launch(&launcher, &task, &session_name).await {
            Ok(session) => {
                let _ = launcher
                    .tx
                    .send(SchedulerCommand::SessionLaunched {
                        task_id: task.id,
                        session_name,
                        session,
                    })
                    .await;
            }
            Err(error) => {
                // The capacity slot may have been taken before the failure.
                if let Err(e) = launcher.capacity.unregister(&session_name).await {
                    debug!(session = %session_name, "capacity unregister after failed launch: {}", e);
                }
                let _ = launcher
                    .tx
                    .send(SchedulerCommand::LaunchFailed {
                        task_id: task.id,
                        error: error.to_string(),
                    })
                    .await;
            }
        }
    })
}

async fn launch(
    launcher: &SessionLauncher,
    task: &Task,
    session_name: &str,
) -> anyhow::Result<Box<dyn crate::providers::TerminalSession>> {
    let env = resolve_env(&launcher.environment, task.environment_id.as_deref()).await?;
    let working_dir = launcher.config.working_dir(&task.project);

    launcher.db.link_session(&task.id, session_name)?;
    launcher
        .capacity
        .register(
            session_name,
            &task.project,
            json!({
                "task_id": task.id,
                "mode": task.mode.as_str(),
                "use_worktree": task.use_worktree,
            }),
        )
        .await?;

    let session = launcher
        .terminal
        .create(
            &working_dir.to_string_lossy(),
            session_name,
            &env,
            task.use_worktree,
        )
        .await?;

    session.wait_ready().await?;
    tokio::time::sleep(launcher.config.settle_delay).await;

    let mut command = sanitize_prompt(&task.prompt);
    if task.mode == ExecutionMode::Trust {
        command.push(' ');
        command.push_str(&launcher.config.trust_flag);
    }
    session.write_line(&command).await?;

    info!(task_id = %task.id, session = %session_name, mode = %task.mode, "session started");
    Ok(session)
}

/// Poll the external status channel for one task's session until it goes
/// idle (completed) or disappears (failure). In interactive mode a session
/// asking for attention is expected and keeps running; in trust mode it is
/// an anomaly worth logging, but never a failure.
pub(crate) fn spawn_monitor(
    terminal: Arc<dyn TerminalProvider>,
    task_id: String,
    session_name: String,
    mode: ExecutionMode,
    interval: std::time::Duration,
    tx: mpsc::Sender<SchedulerCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut attention_logged = false;

        loop {
            ticker.tick().await;

            match terminal.session_exists(&session_name).await {
                Ok(true) => {}
                Ok(false) => {
                    let _ = tx
                        .send(SchedulerCommand::SessionGone {
                            task_id,
                            error: format!("session {} terminated unexpectedly", session_name),
                        })
                        .await;
                    return;
                }
                Err(e) => {
                    warn!(session = %session_name, "session liveness check failed: {}", e);
                    continue;
                }
            }

            match terminal.session_status(&session_name).await {
                Ok(SessionStatus::Idle) => {
                    let _ = tx.send(SchedulerCommand::SessionIdle { task_id }).await;
                    return;
                }
                Ok(SessionStatus::NeedsAttention) => {
                    if mode == ExecutionMode::Trust && !attention_logged {
                        warn!(
                            task_id = %task_id,
                            session = %session_name,
                            "trust-mode session is requesting attention"
                        );
                        attention_logged = true;
                    }
                }
                Ok(SessionStatus::Working) | Ok(SessionStatus::Unknown) => {}
                Err(e) => {
                    debug!(session = %session_name, "status read failed: {}", e);
                }
            }
        }
    })
}
