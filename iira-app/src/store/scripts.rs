use super::{Database, now_rfc3339};
use anyhow::Context;
use iira_tools::{Script, ScriptParam};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde::Deserialize;

/// A script as submitted for creation or replacement.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewScript {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub script_type: Option<String>,
    #[serde(default)]
    pub params: Vec<ScriptParam>,
}

impl NewScript {
    fn validate(&self) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("script name is required");
        }
        for param in &self.params {
            if param.param_name.trim().is_empty() {
                anyhow::bail!("script '{}' has a parameter without a name", self.name);
            }
        }
        Ok(())
    }
}

impl Database {
    pub async fn list_scripts(&self) -> anyhow::Result<Vec<Script>> {
        self.call(|conn| {
            let ids: Vec<i64> = {
                let mut stmt = conn.prepare_cached("SELECT id FROM scripts ORDER BY id")?;
                stmt.query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<_>>()?
            };
            let mut scripts = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(script) = load_script(conn, id)? {
                    scripts.push(script);
                }
            }
            Ok(scripts)
        })
        .await
    }

    pub async fn get_script(&self, id: i64) -> anyhow::Result<Option<Script>> {
        self.call(move |conn| load_script(conn, id)).await
    }

    pub async fn get_script_by_name(&self, name: &str) -> anyhow::Result<Option<Script>> {
        let name = name.to_string();
        self.call(move |conn| {
            let id: Option<i64> = conn
                .query_row("SELECT id FROM scripts WHERE name = ?1", [&name], |row| {
                    row.get(0)
                })
                .optional()?;
            match id {
                Some(id) => load_script(conn, id),
                None => Ok(None),
            }
        })
        .await
    }

    /// Insert a new script. Fails if the name is already taken.
    pub async fn add_script(&self, new: NewScript) -> anyhow::Result<Script> {
        new.validate()?;
        self.call(move |conn| {
            let tx = conn.transaction()?;
            ensure_name_free(&tx, &new.name, None)?;
            let now = now_rfc3339();
            tx.execute(
                "INSERT INTO scripts (name, description, tags, content, script_type, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    new.name,
                    new.description,
                    serde_json::to_string(&new.tags)?,
                    new.content,
                    new.script_type,
                    now,
                ],
            )?;
            let id = tx.last_insert_rowid();
            write_params(&tx, id, &new.params)?;
            tx.commit()?;
            tracing::info!(script_id = id, script_name = %new.name, "script added");
            load_script(conn, id)?.context("script vanished after insert")
        })
        .await
    }

    /// Replace a script's fields and parameters. `Ok(None)` if `id` is unknown.
    pub async fn update_script(&self, id: i64, new: NewScript) -> anyhow::Result<Option<Script>> {
        new.validate()?;
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let exists: Option<i64> = tx
                .query_row("SELECT id FROM scripts WHERE id = ?1", [id], |row| row.get(0))
                .optional()?;
            if exists.is_none() {
                return Ok(None);
            }
            ensure_name_free(&tx, &new.name, Some(id))?;
            tx.execute(
                "UPDATE scripts
                 SET name = ?1, description = ?2, tags = ?3, content = ?4, script_type = ?5, updated_at = ?6
                 WHERE id = ?7",
                params![
                    new.name,
                    new.description,
                    serde_json::to_string(&new.tags)?,
                    new.content,
                    new.script_type,
                    now_rfc3339(),
                    id,
                ],
            )?;
            tx.execute("DELETE FROM script_params WHERE script_id = ?1", [id])?;
            write_params(&tx, id, &new.params)?;
            tx.commit()?;
            tracing::info!(script_id = id, script_name = %new.name, "script updated");
            load_script(conn, id)
        })
        .await
    }

    pub async fn delete_script(&self, id: i64) -> anyhow::Result<bool> {
        self.call(move |conn| {
            let removed = conn.execute("DELETE FROM scripts WHERE id = ?1", [id])?;
            if removed > 0 {
                tracing::info!(script_id = id, "script deleted");
            }
            Ok(removed > 0)
        })
        .await
    }
}

fn ensure_name_free(tx: &Transaction<'_>, name: &str, except: Option<i64>) -> anyhow::Result<()> {
    let holder: Option<i64> = tx
        .query_row("SELECT id FROM scripts WHERE name = ?1", [name], |row| {
            row.get(0)
        })
        .optional()?;
    match holder {
        Some(other) if Some(other) != except => {
            anyhow::bail!("a script named '{name}' already exists (id {other})")
        }
        _ => Ok(()),
    }
}

fn write_params(tx: &Transaction<'_>, script_id: i64, params: &[ScriptParam]) -> anyhow::Result<()> {
    let mut stmt = tx.prepare_cached(
        "INSERT INTO script_params (script_id, position, param_name, param_type, required, default_value)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for (position, p) in params.iter().enumerate() {
        stmt.execute(params![
            script_id,
            position as i64,
            p.param_name,
            p.param_type,
            p.required,
            p.default_value,
        ])?;
    }
    Ok(())
}

fn load_script(conn: &Connection, id: i64) -> anyhow::Result<Option<Script>> {
    let row = conn
        .query_row(
            "SELECT id, name, description, tags, content, script_type FROM scripts WHERE id = ?1",
            [id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            },
        )
        .optional()?;
    let Some((id, name, description, tags, content, script_type)) = row else {
        return Ok(None);
    };
    let tags: Vec<String> = serde_json::from_str(&tags)
        .with_context(|| format!("decode tags for script {id}"))?;

    let mut stmt = conn.prepare_cached(
        "SELECT param_name, param_type, required, default_value
         FROM script_params WHERE script_id = ?1 ORDER BY position",
    )?;
    let params = stmt
        .query_map([id], |row| {
            Ok(ScriptParam {
                param_name: row.get(0)?,
                param_type: row.get(1)?,
                required: row.get(2)?,
                default_value: row.get(3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(Some(Script {
        id,
        name,
        description,
        tags,
        content,
        script_type,
        params,
    }))
}
