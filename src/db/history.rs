//! Append-only task lifecycle history.

use super::{now_ms, Database};
use crate::types::{TaskHistoryEntry, TaskStatus};
use anyhow::Result;
use rusqlite::params;

impl Database {
    /// Append a history record. Rows are never mutated afterwards.
    pub fn record_history(
        &self,
        task_id: &str,
        status: TaskStatus,
        event: &str,
        details: Option<&serde_json::Value>,
    ) -> Result<()> {
        let details_json = details.map(serde_json::Value::to_string);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO task_history (task_id, status, event, details, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![task_id, status.as_str(), event, details_json, now_ms()],
            )?;
            Ok(())
        })
    }

    /// History for one task, oldest first.
    pub fn get_history(&self, task_id: &str) -> Result<Vec<TaskHistoryEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, task_id, status, event, details, timestamp
                 FROM task_history WHERE task_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![task_id], |row| {
                    let details: Option<String> = row.get(4)?;
                    let status: String = row.get(2)?;
                    Ok(TaskHistoryEntry {
                        id: row.get(0)?,
                        task_id: row.get(1)?,
                        status: TaskStatus::from_str(&status).unwrap_or(TaskStatus::Pending),
                        event: row.get(3)?,
                        details: details.and_then(|s| serde_json::from_str(&s).ok()),
                        timestamp: row.get(5)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Bulk retention cleanup: drop history rows older than the cutoff.
    /// Returns the number of rows removed.
    pub fn prune_history_before(&self, cutoff_ms: i64) -> Result<usize> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM task_history WHERE timestamp < ?1",
                params![cutoff_ms],
            )?;
            Ok(removed)
        })
    }
}
