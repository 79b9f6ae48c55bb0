//! Template storage: reusable ordered sets of task specifications.

use super::{now_ms, Database};
use crate::types::{CreateTemplateInput, ExecutionMode, Template, TemplateStep};
use anyhow::{anyhow, Result};
use rusqlite::{params, Connection};
use uuid::Uuid;

fn load_steps(conn: &Connection, template_id: &str) -> Result<Vec<TemplateStep>> {
    let mut stmt = conn.prepare(
        "SELECT name, prompt, mode, depends_on_step, use_worktree
         FROM template_steps WHERE template_id = ?1 ORDER BY step_index",
    )?;
    let steps = stmt
        .query_map(params![template_id], |row| {
            let mode: String = row.get(2)?;
            Ok(TemplateStep {
                name: row.get(0)?,
                prompt: row.get(1)?,
                mode: ExecutionMode::from_str(&mode).unwrap_or(ExecutionMode::Interactive),
                depends_on_step: row.get(3)?,
                use_worktree: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(steps)
}

impl Database {
    /// Create a template with its ordered steps in one transaction.
    pub fn create_template(&self, input: &CreateTemplateInput) -> Result<Template> {
        let template_id = Uuid::new_v4().to_string();
        let now = now_ms();

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            tx.execute(
                "INSERT INTO templates (id, name, description, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![&template_id, &input.name, &input.description, now],
            )?;

            for (index, step) in input.steps.iter().enumerate() {
                tx.execute(
                    "INSERT INTO template_steps
                        (template_id, step_index, name, prompt, mode, depends_on_step, use_worktree)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        &template_id,
                        index as i64,
                        &step.name,
                        &step.prompt,
                        step.mode.as_str(),
                        step.depends_on_step,
                        step.use_worktree,
                    ],
                )?;
            }

            tx.commit()?;

            Ok(Template {
                id: template_id,
                name: input.name.clone(),
                description: input.description.clone(),
                steps: input.steps.clone(),
                created_at: now,
            })
        })
    }

    /// Get a template with its steps.
    pub fn get_template(&self, template_id: &str) -> Result<Option<Template>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, name, description, created_at FROM templates WHERE id = ?1")?;
            let result = stmt.query_row(params![template_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            });

            match result {
                Ok((id, name, description, created_at)) => {
                    let steps = load_steps(conn, &id)?;
                    Ok(Some(Template {
                        id,
                        name,
                        description,
                        steps,
                        created_at,
                    }))
                }
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    /// List all templates with their steps, newest first.
    pub fn list_templates(&self) -> Result<Vec<Template>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, description, created_at FROM templates ORDER BY created_at DESC",
            )?;
            let headers: Vec<(String, String, Option<String>, i64)> = stmt
                .query_map([], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut templates = Vec::with_capacity(headers.len());
            for (id, name, description, created_at) in headers {
                let steps = load_steps(conn, &id)?;
                templates.push(Template {
                    id,
                    name,
                    description,
                    steps,
                    created_at,
                });
            }
            Ok(templates)
        })
    }

    /// Delete a template and its steps.
    pub fn delete_template(&self, template_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM templates WHERE id = ?1", params![template_id])?;
            if changed == 0 {
                return Err(anyhow!("Template not found: {}", template_id));
            }
            Ok(())
        })
    }
}
