//! Execution strategies: one-shot subprocesses (print mode) and persistent
//! terminal sessions (interactive/trust modes).

pub(crate) mod print;
pub(crate) mod session;

use crate::providers::EnvironmentProvider;
use std::collections::HashMap;
use std::sync::Arc;

/// Resolve the task's environment variables, or an empty map when the task
/// has no environment selected.
pub(crate) async fn resolve_env(
    provider: &Arc<dyn EnvironmentProvider>,
    environment_id: Option<&str>,
) -> anyhow::Result<HashMap<String, String>> {
    match environment_id {
        Some(id) => provider.resolve(id).await,
        None => Ok(HashMap::new()),
    }
}

/// Strip shell metacharacters and collapse newlines so a prompt can be
/// injected into a terminal as a single command line.
pub fn sanitize_prompt(prompt: &str) -> String {
    const SHELL_META: &[char] = &['`', '$', ';', '&', '|', '<', '>', '(', ')', '\\', '"', '\''];

    let cleaned: String = prompt
        .chars()
        .map(|c| if c.is_whitespace() { ' ' } else { c })
        .filter(|c| !SHELL_META.contains(c))
        .collect();

    // Collapse runs of spaces left by removed newlines.
    let mut out = String::with_capacity(cleaned.len());
    let mut last_was_space = false;
    for c in cleaned.chars() {
        if c == ' ' {
            if !last_was_space {
                out.push(c);
            }
            last_was_space = true;
        } else {
            out.push(c);
            last_was_space = false;
        }
    }
    out.trim().to_string()
}

/// Session name scoped to the project, unique per task.
pub(crate) fn session_name_for(project: &str, task_id: &str) -> String {
    let slug: String = project
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    let short_id = &task_id[..task_id.len().min(8)];
    format!("task-{}-{}", slug, short_id)
}
