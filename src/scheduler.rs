//! The scheduler: a single-writer actor owning all mutable queue state.
//!
//! One spawned task owns the pause flag, the failure gate, and the per-task
//! handle maps. Every mutation arrives over a command channel; the poll
//! tick is an interval arm in the same select loop, so ticks never overlap
//! command handling and no locking is needed for the scheduler's own
//! invariants. Execution strategies and session monitors run as independent
//! tasks and report back over the same channel.

use crate::config::QueueConfig;
use crate::db::Database;
use crate::error::{ErrorCode, QueueError, QueueResult};
use crate::executor::{print, session};
use crate::providers::{
    CapacityProvider, EnvironmentProvider, Notifier, TerminalProvider, TerminalSession,
};
use crate::resolver;
use crate::types::{ExecutionMode, QueueEvent, Task, TaskStatus};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Commands accepted by the scheduler actor. Public operations carry a
/// reply channel; the rest are progress reports from executors and
/// monitors.
pub(crate) enum SchedulerCommand {
    Retry {
        task_id: String,
        reply: oneshot::Sender<QueueResult<Task>>,
    },
    Skip {
        task_id: String,
        reply: oneshot::Sender<QueueResult<Vec<String>>>,
    },
    StopAll {
        reply: oneshot::Sender<QueueResult<()>>,
    },
    Pause,
    Unpause,
    Resume {
        reply: oneshot::Sender<QueueResult<Vec<Task>>>,
    },
    IsPaused {
        reply: oneshot::Sender<bool>,
    },
    AwaitingDecision {
        reply: oneshot::Sender<Option<String>>,
    },
    /// Tracked-handle counts, for leak auditing.
    HandleCounts {
        reply: oneshot::Sender<(usize, usize, usize)>,
    },
    Shutdown,

    // Reports from executors and monitors.
    PrintFinished {
        task_id: String,
        result: Result<(), String>,
    },
    SessionLaunched {
        task_id: String,
        session_name: String,
        session: Box<dyn TerminalSession>,
    },
    LaunchFailed {
        task_id: String,
        error: String,
    },
    SessionIdle {
        task_id: String,
    },
    SessionGone {
        task_id: String,
        error: String,
    },
}

struct SessionEntry {
    session_name: String,
    handle: Box<dyn TerminalSession>,
}

/// All mutable scheduler state, owned by the actor.
struct SchedulerState {
    paused: bool,
    /// The failure gate: at most one task id awaiting a retry/skip decision.
    gate: Option<String>,
    /// Print-mode executions, keyed by task id. Aborting the handle kills
    /// the subprocess.
    processes: HashMap<String, JoinHandle<()>>,
    /// Live terminal sessions, keyed by task id.
    sessions: HashMap<String, SessionEntry>,
    /// Session monitors, keyed by task id.
    monitors: HashMap<String, JoinHandle<()>>,
    /// Session launches still in flight, keyed by task id.
    launches: HashMap<String, JoinHandle<()>>,
}

pub(crate) struct Scheduler {
    db: Database,
    config: Arc<QueueConfig>,
    terminal: Arc<dyn TerminalProvider>,
    environment: Arc<dyn EnvironmentProvider>,
    capacity: Arc<dyn CapacityProvider>,
    notifier: Arc<dyn Notifier>,
    tx: mpsc::Sender<SchedulerCommand>,
    state: SchedulerState,
}

impl Scheduler {
    /// Spawn the scheduler actor. Returns the command sender and the actor
    /// handle.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        db: Database,
        config: Arc<QueueConfig>,
        terminal: Arc<dyn TerminalProvider>,
        environment: Arc<dyn EnvironmentProvider>,
        capacity: Arc<dyn CapacityProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> (mpsc::Sender<SchedulerCommand>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(64);
        let scheduler = Scheduler {
            db,
            config,
            terminal,
            environment,
            capacity,
            notifier,
            tx: tx.clone(),
            state: SchedulerState {
                paused: false,
                gate: None,
                processes: HashMap::new(),
                sessions: HashMap::new(),
                monitors: HashMap::new(),
                launches: HashMap::new(),
            },
        };
        let handle = tokio::spawn(scheduler.run(rx));
        (tx, handle)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<SchedulerCommand>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(SchedulerCommand::Shutdown) | None => {
                            debug!("scheduler shutting down");
                            return;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("scheduler tick failed: {}", e);
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: SchedulerCommand) {
        match cmd {
            SchedulerCommand::Retry { task_id, reply } => {
                let _ = reply.send(self.retry_task(&task_id));
            }
            SchedulerCommand::Skip { task_id, reply } => {
                let _ = reply.send(self.skip_task(&task_id));
            }
            SchedulerCommand::StopAll { reply } => {
                let _ = reply.send(self.stop_all().await);
            }
            SchedulerCommand::Pause => {
                self.state.paused = true;
                info!("queue paused");
            }
            SchedulerCommand::Unpause => {
                self.state.paused = false;
                info!("queue unpaused");
            }
            SchedulerCommand::Resume { reply } => {
                let _ = reply.send(self.resume_queue());
            }
            SchedulerCommand::IsPaused { reply } => {
                let _ = reply.send(self.state.paused);
            }
            SchedulerCommand::AwaitingDecision { reply } => {
                let _ = reply.send(self.state.gate.clone());
            }
            SchedulerCommand::HandleCounts { reply } => {
                let _ = reply.send((
                    self.state.processes.len(),
                    self.state.sessions.len(),
                    self.state.monitors.len(),
                ));
            }
            SchedulerCommand::Shutdown => unreachable!("handled in run loop"),
            SchedulerCommand::PrintFinished { task_id, result } => {
                self.state.processes.remove(&task_id);
                match result {
                    Ok(()) => self.complete_task(&task_id).await,
                    Err(error) => self.fail_task(&task_id, &error).await,
                }
            }
            SchedulerCommand::SessionLaunched {
                task_id,
                session_name,
                session,
            } => {
                self.state.launches.remove(&task_id);
                self.on_session_launched(task_id, session_name, session)
                    .await;
            }
            SchedulerCommand::LaunchFailed { task_id, error } => {
                self.state.launches.remove(&task_id);
                self.fail_task(&task_id, &error).await;
            }
            SchedulerCommand::SessionIdle { task_id } => {
                self.state.monitors.remove(&task_id);
                if let Some(entry) = self.state.sessions.remove(&task_id) {
                    // Completion leaves the session alive for inspection but
                    // frees its capacity slot.
                    if let Err(e) = self.capacity.unregister(&entry.session_name).await {
                        warn!(session = %entry.session_name, "capacity unregister failed: {}", e);
                    }
                }
                self.complete_task(&task_id).await;
            }
            SchedulerCommand::SessionGone { task_id, error } => {
                self.fail_task(&task_id, &error).await;
            }
        }
    }

    /// One scheduling tick: resolve dependencies, then start at most one
    /// ready task if nothing blocks new starts.
    async fn tick(&mut self) -> anyhow::Result<()> {
        if self.state.paused || self.state.gate.is_some() {
            return Ok(());
        }

        let capacity = self.capacity.capacity().await?;
        if capacity.available == 0 {
            return Ok(());
        }

        let outcome = resolver::resolve_pending(&self.db)?;
        for task in &outcome.promoted {
            self.notifier.send(QueueEvent::TaskUpdated { task: task.clone() });
        }
        for task_id in &outcome.skipped {
            self.notifier.send(QueueEvent::TaskSkipped {
                task_id: task_id.clone(),
            });
        }

        let Some(task) = self.db.next_ready_task()? else {
            return Ok(());
        };

        let task = self
            .db
            .update_task_status(&task.id, TaskStatus::Running, None)?;
        self.db
            .record_history(&task.id, TaskStatus::Running, "started", None)?;
        self.notifier.send(QueueEvent::TaskUpdated { task: task.clone() });
        info!(task_id = %task.id, mode = %task.mode, "starting task");

        match task.mode {
            ExecutionMode::Print => {
                let handle = print::spawn(
                    task.clone(),
                    Arc::clone(&self.config),
                    Arc::clone(&self.environment),
                    self.tx.clone(),
                );
                self.state.processes.insert(task.id.clone(), handle);
            }
            ExecutionMode::Interactive | ExecutionMode::Trust => {
                let launcher = session::SessionLauncher {
                    db: self.db.clone(),
                    config: Arc::clone(&self.config),
                    terminal: Arc::clone(&self.terminal),
                    environment: Arc::clone(&self.environment),
                    capacity: Arc::clone(&self.capacity),
                    tx: self.tx.clone(),
                };
                let handle = session::spawn_launch(launcher, task.clone());
                self.state.launches.insert(task.id.clone(), handle);
            }
        }

        Ok(())
    }

    /// Executor and monitor reports only apply while their task is still
    /// running. Stale reports arrive when a task was stopped with a launch
    /// or a monitor send in flight.
    fn task_is_running(&self, task_id: &str) -> bool {
        matches!(
            self.db.get_task(task_id),
            Ok(Some(ref task)) if task.status == TaskStatus::Running
        )
    }

    async fn on_session_launched(
        &mut self,
        task_id: String,
        session_name: String,
        session: Box<dyn TerminalSession>,
    ) {
        // The queue may have been stopped while the launch was in flight;
        // a task that is no longer running must not keep a live session.
        if !self.task_is_running(&task_id) {
            warn!(task_id = %task_id, session = %session_name, "discarding session for stopped task");
            if let Err(e) = session.kill().await {
                warn!(session = %session_name, "session kill failed: {}", e);
            }
            if let Err(e) = self.capacity.unregister(&session_name).await {
                warn!(session = %session_name, "capacity unregister failed: {}", e);
            }
            return;
        }

        let monitor = session::spawn_monitor(
            Arc::clone(&self.terminal),
            task_id.clone(),
            session_name.clone(),
            self.db
                .get_task(&task_id)
                .ok()
                .flatten()
                .map(|t| t.mode)
                .unwrap_or(ExecutionMode::Interactive),
            self.config.monitor_interval,
            self.tx.clone(),
        );
        self.state.monitors.insert(task_id.clone(), monitor);
        self.state.sessions.insert(
            task_id,
            SessionEntry {
                session_name,
                handle: session,
            },
        );
    }

    async fn complete_task(&mut self, task_id: &str) {
        if !self.task_is_running(task_id) {
            debug!(task_id, "dropping completion report for task no longer running");
            return;
        }
        match self
            .db
            .update_task_status(task_id, TaskStatus::Completed, None)
        {
            Ok(task) => {
                if let Err(e) =
                    self.db
                        .record_history(task_id, TaskStatus::Completed, "completed", None)
                {
                    warn!(task_id, "history write failed: {}", e);
                }
                info!(task_id, "task completed");
                self.notifier.send(QueueEvent::TaskUpdated { task });
            }
            Err(e) => error!(task_id, "failed to record completion: {}", e),
        }
    }

    /// The failure path: bump the retry counter, mark the task failed, tear
    /// down anything still tracked for it, and occupy the gate if empty.
    async fn fail_task(&mut self, task_id: &str, error_text: &str) {
        if !self.task_is_running(task_id) {
            debug!(task_id, "dropping failure report for task no longer running: {}", error_text);
            return;
        }
        warn!(task_id, "task failed: {}", error_text);

        if let Err(e) = self.db.bump_retry_count(task_id) {
            error!(task_id, "failed to bump retry count: {}", e);
        }
        match self
            .db
            .update_task_status(task_id, TaskStatus::Failed, Some(error_text))
        {
            Ok(task) => {
                if let Err(e) = self.db.record_history(
                    task_id,
                    TaskStatus::Failed,
                    "failed",
                    Some(&json!({ "error": error_text })),
                ) {
                    warn!(task_id, "history write failed: {}", e);
                }
                self.notifier.send(QueueEvent::TaskUpdated { task });
            }
            Err(e) => error!(task_id, "failed to record failure: {}", e),
        }

        self.teardown_handles(task_id).await;

        if self.state.gate.is_none() {
            self.state.gate = Some(task_id.to_string());
            self.notifier.send(QueueEvent::TaskFailed {
                task_id: task_id.to_string(),
                error: error_text.to_string(),
            });
        }
    }

    /// Audited teardown: after this returns, no handle for the task remains
    /// in any map.
    async fn teardown_handles(&mut self, task_id: &str) {
        if let Some(handle) = self.state.processes.remove(task_id) {
            handle.abort();
        }
        if let Some(handle) = self.state.launches.remove(task_id) {
            handle.abort();
        }
        if let Some(monitor) = self.state.monitors.remove(task_id) {
            monitor.abort();
        }
        if let Some(entry) = self.state.sessions.remove(task_id) {
            if let Err(e) = entry.handle.kill().await {
                warn!(session = %entry.session_name, "session kill failed: {}", e);
            }
            if let Err(e) = self.capacity.unregister(&entry.session_name).await {
                warn!(session = %entry.session_name, "capacity unregister failed: {}", e);
            }
        }
    }

    fn retry_task(&mut self, task_id: &str) -> QueueResult<Task> {
        if self.state.gate.as_deref() != Some(task_id) {
            return Err(gate_mismatch(task_id, self.state.gate.as_deref()));
        }
        self.state.gate = None;

        let task = self.db.reset_for_retry(task_id)?;
        self.db
            .record_history(task_id, TaskStatus::Ready, "retried", None)?;
        info!(task_id, retry_count = task.retry_count, "task queued for retry");
        self.notifier.send(QueueEvent::TaskUpdated { task: task.clone() });
        Ok(task)
    }

    fn skip_task(&mut self, task_id: &str) -> QueueResult<Vec<String>> {
        if self.state.gate.as_deref() != Some(task_id) {
            return Err(gate_mismatch(task_id, self.state.gate.as_deref()));
        }
        self.state.gate = None;

        let affected = resolver::propagate_skip(&self.db, task_id)?;
        for id in &affected {
            self.notifier.send(QueueEvent::TaskSkipped {
                task_id: id.clone(),
            });
        }
        info!(task_id, skipped = affected.len(), "task skipped");
        Ok(affected)
    }

    /// Kill every tracked execution, pause their tasks, and pause the rest
    /// of the queue.
    async fn stop_all(&mut self) -> QueueResult<()> {
        self.state.gate = None;

        // In-flight launches are not aborted: an abort between capacity
        // registration and the session handoff would leak both. They run to
        // completion and the handoff discards the session because its task
        // is no longer running.
        let launching: Vec<String> = self.state.launches.drain().map(|(id, _)| id).collect();

        let tracked: Vec<String> = self
            .state
            .processes
            .keys()
            .chain(self.state.sessions.keys())
            .chain(self.state.monitors.keys())
            .cloned()
            .chain(launching)
            .collect::<std::collections::HashSet<_>>()
            .into_iter()
            .collect();

        for task_id in tracked {
            self.teardown_handles(&task_id).await;
            self.db
                .update_task_status(&task_id, TaskStatus::Paused, None)?;
            self.db
                .record_history(&task_id, TaskStatus::Paused, "stopped", None)?;
        }

        self.db
            .bulk_transition(&[TaskStatus::Pending, TaskStatus::Ready], TaskStatus::Paused)?;

        self.state.paused = true;
        info!("all tasks stopped, queue paused");
        self.notifier.send(QueueEvent::QueuePaused);
        Ok(())
    }

    /// Put every paused task back into dependency resolution. Clears the
    /// gate even when no retry/skip decision was made; intentional, see
    /// DESIGN notes.
    fn resume_queue(&mut self) -> QueueResult<Vec<Task>> {
        if let Some(gated) = self.state.gate.take() {
            warn!(task_id = %gated, "resume is clearing the failure gate without a decision");
        }
        self.state.paused = false;

        let resumed = self
            .db
            .bulk_transition(&[TaskStatus::Paused], TaskStatus::Pending)?;
        for task in &resumed {
            if let Err(e) = self
                .db
                .record_history(&task.id, TaskStatus::Pending, "resumed", None)
            {
                warn!(task_id = %task.id, "history write failed: {}", e);
            }
        }

        let tasks = self.db.list_tasks()?;
        info!(resumed = resumed.len(), "queue resumed");
        self.notifier.send(QueueEvent::QueueResumed {
            tasks: tasks.clone(),
        });
        Ok(tasks)
    }
}

fn gate_mismatch(task_id: &str, gated: Option<&str>) -> QueueError {
    let message = match gated {
        Some(gated) => format!(
            "Task {} is not awaiting a decision (gate holds {})",
            task_id, gated
        ),
        None => format!("Task {} is not awaiting a decision (gate is empty)", task_id),
    };
    QueueError::new(ErrorCode::GateMismatch, message)
}
