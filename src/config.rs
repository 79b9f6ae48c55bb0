//! Queue configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Tunables for the scheduler and execution strategies.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Main scheduler tick. At most one task is started per tick.
    pub poll_interval: Duration,
    /// Per-session monitor tick; shorter than the scheduler tick so
    /// completion is noticed promptly.
    pub monitor_interval: Duration,
    /// Delay between a session reporting ready and the prompt being
    /// injected, so shell init output does not swallow the command.
    pub settle_delay: Duration,
    /// Binary launched for every task.
    pub runner_bin: String,
    /// Arguments placed before the prompt in print mode.
    pub print_args: Vec<String>,
    /// Flag appended to the injected command in trust mode to suppress
    /// permission prompts.
    pub trust_flag: String,
    /// Root under which per-project working directories live.
    pub workspace_root: PathBuf,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            monitor_interval: Duration::from_millis(500),
            settle_delay: Duration::from_millis(1500),
            runner_bin: "agent".to_string(),
            print_args: vec!["--print".to_string()],
            trust_flag: "--auto-approve".to_string(),
            workspace_root: PathBuf::from("."),
        }
    }
}

impl QueueConfig {
    /// Working directory for a project.
    pub fn working_dir(&self, project: &str) -> PathBuf {
        self.workspace_root.join(project)
    }
}
