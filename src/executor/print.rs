//! Print mode: one-shot subprocess execution.

use super::resolve_env;
use crate::config::QueueConfig;
use crate::providers::EnvironmentProvider;
use crate::scheduler::SchedulerCommand;
use crate::types::Task;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Launch the task's prompt as a one-shot subprocess.
///
/// Exit code 0 completes the task; a non-zero exit, signal termination, or
/// launch failure reports the captured stderr (or a synthesized message)
/// back to the scheduler. Aborting the returned handle kills the process.
pub(crate) fn spawn(
    task: Task,
    config: Arc<QueueConfig>,
    environment: Arc<dyn EnvironmentProvider>,
    tx: mpsc::Sender<SchedulerCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = run(&task, &config, &environment).await;
        let _ = tx
            .send(SchedulerCommand::PrintFinished {
                task_id: task.id,
                result,
            })
            .await;
    })
}

async fn run(
    task: &Task,
    config: &QueueConfig,
    environment: &Arc<dyn EnvironmentProvider>,
) -> Result<(), String> {
    let env = resolve_env(environment, task.environment_id.as_deref())
        .await
        .map_err(|e| format!("failed to resolve environment: {}", e))?;

    let working_dir = config.working_dir(&task.project);
    debug!(task_id = %task.id, dir = %working_dir.display(), "launching print-mode process");

    let output = Command::new(&config.runner_bin)
        .args(&config.print_args)
        .arg(&task.prompt)
        .envs(&env)
        .current_dir(&working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| format!("failed to launch {}: {}", config.runner_bin, e))?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        Err(format!("process exited abnormally: {}", output.status))
    } else {
        Err(stderr)
    }
}
