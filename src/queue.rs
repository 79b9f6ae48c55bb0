//! The public face of the task queue: validated operations for the API
//! layer, template instantiation, and the scheduler lifecycle.

use crate::config::QueueConfig;
use crate::db::Database;
use crate::error::{ErrorCode, QueueError, QueueResult};
use crate::providers::{CapacityProvider, EnvironmentProvider, Notifier, TerminalProvider};
use crate::scheduler::{Scheduler, SchedulerCommand};
use crate::types::{
    CreateTaskInput, CreateTemplateInput, QueueEvent, Task, TaskHistoryEntry, TaskStatus,
    Template, TemplateVariables,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// External collaborators the queue is wired to.
pub struct Providers {
    pub terminal: Arc<dyn TerminalProvider>,
    pub environment: Arc<dyn EnvironmentProvider>,
    pub capacity: Arc<dyn CapacityProvider>,
    pub notifier: Arc<dyn Notifier>,
}

/// Dependency-aware task queue executor.
///
/// Owns the task store and the scheduler actor. All mutating operations
/// validate synchronously before touching state; scheduler-owned state
/// (pause flag, failure gate, handle maps) is reached over the command
/// channel.
pub struct TaskQueue {
    db: Database,
    notifier: Arc<dyn Notifier>,
    tx: mpsc::Sender<SchedulerCommand>,
    scheduler: JoinHandle<()>,
}

impl TaskQueue {
    /// Start the queue: spawns the scheduler actor with its poll loop.
    pub fn start(db: Database, providers: Providers, config: QueueConfig) -> Self {
        let notifier = Arc::clone(&providers.notifier);
        let (tx, scheduler) = Scheduler::spawn(
            db.clone(),
            Arc::new(config),
            providers.terminal,
            providers.environment,
            providers.capacity,
            providers.notifier,
        );
        Self {
            db,
            notifier,
            tx,
            scheduler,
        }
    }

    /// Stop the scheduler actor. Running executions are not touched; call
    /// [`TaskQueue::stop_all_tasks`] first for a clean halt.
    pub async fn shutdown(self) {
        let _ = self.tx.send(SchedulerCommand::Shutdown).await;
        let _ = self.scheduler.await;
    }

    /// Direct access to the underlying store.
    pub fn database(&self) -> &Database {
        &self.db
    }

    // ----- task CRUD -------------------------------------------------------

    /// Create one task at the tail of the queue.
    pub fn create_task(&self, input: &CreateTaskInput) -> QueueResult<Task> {
        self.validate_input(input)?;
        self.validate_dependencies(&input.depends_on)?;

        let task = self.db.create_task(input)?;
        self.db
            .record_history(&task.id, TaskStatus::Pending, "created", None)?;
        self.notifier.send(QueueEvent::TaskCreated { task: task.clone() });
        Ok(task)
    }

    /// Create several tasks atomically with contiguous positions.
    pub fn create_task_batch(&self, inputs: &[CreateTaskInput]) -> QueueResult<Vec<Task>> {
        for input in inputs {
            self.validate_input(input)?;
            self.validate_dependencies(&input.depends_on)?;
        }

        let tasks = self.db.create_task_batch(inputs)?;
        for task in &tasks {
            self.db
                .record_history(&task.id, TaskStatus::Pending, "created", None)?;
            self.notifier.send(QueueEvent::TaskCreated { task: task.clone() });
        }
        Ok(tasks)
    }

    pub fn get_task(&self, task_id: &str) -> QueueResult<Task> {
        self.db
            .get_task(task_id)?
            .ok_or_else(|| QueueError::task_not_found(task_id))
    }

    pub fn list_tasks(&self) -> QueueResult<Vec<Task>> {
        Ok(self.db.list_tasks()?)
    }

    pub fn get_task_history(&self, task_id: &str) -> QueueResult<Vec<TaskHistoryEntry>> {
        Ok(self.db.get_history(task_id)?)
    }

    /// Delete a task. Only pending, ready, and paused tasks are deletable.
    pub fn delete_task(&self, task_id: &str) -> QueueResult<()> {
        let task = self.get_task(task_id)?;
        if !task.status.is_deletable() {
            return Err(QueueError::not_deletable(task_id, task.status.as_str()));
        }

        self.db.delete_task(task_id)?;
        self.notifier.send(QueueEvent::TaskDeleted {
            task_id: task_id.to_string(),
        });
        Ok(())
    }

    /// Move a task to a new position in the execution order.
    pub fn reorder_task(&self, task_id: &str, new_position: i64) -> QueueResult<Vec<Task>> {
        self.get_task(task_id)?;
        let tasks = self.db.reorder_task(task_id, new_position)?;
        self.notifier.send(QueueEvent::TasksReordered {
            tasks: tasks.clone(),
        });
        Ok(tasks)
    }

    // ----- failure gate decisions ------------------------------------------

    /// Retry the task currently in the failure gate. A non-matching id is a
    /// no-op error; no state changes.
    pub async fn retry_task(&self, task_id: &str) -> QueueResult<Task> {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerCommand::Retry {
            task_id: task_id.to_string(),
            reply,
        })
        .await?;
        recv(rx).await?
    }

    /// Skip the task currently in the failure gate, cascading to its
    /// transitive dependents. Returns all affected task ids.
    pub async fn skip_task(&self, task_id: &str) -> QueueResult<Vec<String>> {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerCommand::Skip {
            task_id: task_id.to_string(),
            reply,
        })
        .await?;
        recv(rx).await?
    }

    // ----- global controls --------------------------------------------------

    /// Kill every running execution, pause their tasks and all queued
    /// tasks, and stop starting new work.
    pub async fn stop_all_tasks(&self) -> QueueResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerCommand::StopAll { reply }).await?;
        recv(rx).await?
    }

    /// Soft-pause: blocks new task starts without touching running work.
    pub async fn pause_queue(&self) -> QueueResult<()> {
        self.send(SchedulerCommand::Pause).await
    }

    /// Lift a soft pause.
    pub async fn unpause_queue(&self) -> QueueResult<()> {
        self.send(SchedulerCommand::Unpause).await
    }

    /// Move all paused tasks back to pending (they re-enter dependency
    /// resolution) and lift the pause. Also clears the failure gate.
    pub async fn resume_queue(&self) -> QueueResult<Vec<Task>> {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerCommand::Resume { reply }).await?;
        recv(rx).await?
    }

    pub async fn is_paused(&self) -> QueueResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerCommand::IsPaused { reply }).await?;
        recv(rx).await
    }

    /// Id of the task occupying the failure gate, if any.
    pub async fn awaiting_decision(&self) -> QueueResult<Option<String>> {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerCommand::AwaitingDecision { reply }).await?;
        recv(rx).await
    }

    /// Counts of tracked (process, session, monitor) handles. Exposed for
    /// leak auditing.
    pub async fn tracked_handle_counts(&self) -> QueueResult<(usize, usize, usize)> {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerCommand::HandleCounts { reply }).await?;
        recv(rx).await
    }

    // ----- templates ---------------------------------------------------------

    pub fn create_template(&self, input: &CreateTemplateInput) -> QueueResult<Template> {
        if input.name.trim().is_empty() {
            return Err(QueueError::missing_field("name"));
        }
        if input.steps.is_empty() {
            return Err(QueueError::missing_field("steps"));
        }
        Ok(self.db.create_template(input)?)
    }

    pub fn get_template(&self, template_id: &str) -> QueueResult<Template> {
        self.db
            .get_template(template_id)?
            .ok_or_else(|| QueueError::template_not_found(template_id))
    }

    pub fn list_templates(&self) -> QueueResult<Vec<Template>> {
        Ok(self.db.list_templates()?)
    }

    pub fn delete_template(&self, template_id: &str) -> QueueResult<()> {
        self.get_template(template_id)?;
        Ok(self.db.delete_template(template_id)?)
    }

    /// Instantiate a template against a project: one task per step, with
    /// `{var}` placeholders substituted textually and dependencies wired to
    /// the explicit `depends_on_step` index or, by default, the immediately
    /// preceding step.
    pub fn instantiate_template(
        &self,
        template_id: &str,
        project: &str,
        variables: &TemplateVariables,
    ) -> QueueResult<Vec<Task>> {
        if project.trim().is_empty() {
            return Err(QueueError::missing_field("project"));
        }
        let template = self.get_template(template_id)?;

        let mut specs = Vec::with_capacity(template.steps.len());
        for (index, step) in template.steps.iter().enumerate() {
            let depends_on_step = match step.depends_on_step {
                Some(dep) => {
                    if dep < 0 || dep as usize >= template.steps.len() || dep as usize == index {
                        return Err(QueueError::invalid_value(
                            "depends_on_step",
                            &format!("step {} has invalid dependency index {}", index, dep),
                        ));
                    }
                    vec![dep as usize]
                }
                None if index > 0 => vec![index - 1],
                None => vec![],
            };

            let input = CreateTaskInput {
                name: substitute_variables(&step.name, variables),
                prompt: substitute_variables(&step.prompt, variables),
                project: project.to_string(),
                mode: Some(step.mode),
                depends_on: Vec::new(),
                use_worktree: step.use_worktree,
                environment_id: None,
            };
            self.validate_input(&input)?;
            specs.push((input, depends_on_step));
        }

        let tasks = self.db.create_linked_batch(&specs)?;
        for task in &tasks {
            self.db
                .record_history(&task.id, TaskStatus::Pending, "created", None)?;
            self.notifier.send(QueueEvent::TaskCreated { task: task.clone() });
        }
        Ok(tasks)
    }

    // ----- internals ----------------------------------------------------------

    fn validate_input(&self, input: &CreateTaskInput) -> QueueResult<()> {
        if input.name.trim().is_empty() {
            return Err(QueueError::missing_field("name"));
        }
        if input.prompt.trim().is_empty() {
            return Err(QueueError::missing_field("prompt"));
        }
        if input.project.trim().is_empty() {
            return Err(QueueError::missing_field("project"));
        }
        Ok(())
    }

    /// Every declared dependency must already exist in the store. Batch
    /// inputs cannot reference batch-mates: ids are assigned at insert time.
    fn validate_dependencies(&self, depends_on: &[String]) -> QueueResult<()> {
        for dep_id in depends_on {
            if self.db.get_task(dep_id)?.is_none() {
                return Err(QueueError::invalid_value(
                    "depends_on",
                    &format!("dependency task not found: {}", dep_id),
                ));
            }
        }
        Ok(())
    }

    async fn send(&self, cmd: SchedulerCommand) -> QueueResult<()> {
        self.tx.send(cmd).await.map_err(|_| {
            QueueError::new(ErrorCode::InternalError, "scheduler is not running")
        })
    }
}

async fn recv<T>(rx: oneshot::Receiver<T>) -> QueueResult<T> {
    rx.await
        .map_err(|_| QueueError::new(ErrorCode::InternalError, "scheduler dropped the reply"))
}

/// Textual `{var}` substitution.
fn substitute_variables(text: &str, variables: &TemplateVariables) -> String {
    let mut out = text.to_string();
    for (key, value) in variables {
        out = out.replace(&format!("{{{}}}", key), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitution_replaces_all_occurrences() {
        let mut vars = TemplateVariables::new();
        vars.insert("name".to_string(), "api".to_string());
        vars.insert("lang".to_string(), "rust".to_string());

        let out = substitute_variables("build {name} in {lang}, test {name}", &vars);
        assert_eq!(out, "build api in rust, test api");
    }

    #[test]
    fn substitution_leaves_unknown_placeholders() {
        let vars = TemplateVariables::new();
        assert_eq!(substitute_variables("keep {this}", &vars), "keep {this}");
    }
}
