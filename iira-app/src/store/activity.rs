use super::{Database, now_rfc3339};
use anyhow::Context;
use rusqlite::params;
use serde::{Deserialize, Serialize};

/// Catalogue changes worth an audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityKind {
    CreateScript,
    UpdateScript,
    DeleteScript,
    IngestSop,
    DeleteSop,
}

impl ActivityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateScript => "CREATE_SCRIPT",
            Self::UpdateScript => "UPDATE_SCRIPT",
            Self::DeleteScript => "DELETE_SCRIPT",
            Self::IngestSop => "INGEST_SOP",
            Self::DeleteSop => "DELETE_SOP",
        }
    }
}

impl std::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityEntry {
    pub id: i64,
    pub activity_type: String,
    pub details: serde_json::Value,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityPage {
    pub activities: Vec<ActivityEntry>,
    pub current_page: u64,
    pub total_pages: u64,
}

impl Database {
    /// Append to the activity log. A failed write is logged and swallowed;
    /// the change it describes has already happened.
    pub async fn record_activity(&self, kind: ActivityKind, details: serde_json::Value) {
        let details_text = details.to_string();
        let result = self
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO system_activity_log (activity_type, details, created_at) VALUES (?1, ?2, ?3)",
                    params![kind.as_str(), details_text, now_rfc3339()],
                )?;
                Ok(())
            })
            .await;
        match result {
            Ok(()) => tracing::info!(activity = %kind, "activity logged"),
            Err(error) => tracing::warn!(activity = %kind, error = %error, "could not write activity log"),
        }
    }

    /// Newest first. `page` is 1-based.
    pub async fn list_activity(&self, page: u64, limit: u64) -> anyhow::Result<ActivityPage> {
        let page = page.max(1);
        let limit = limit.clamp(1, 500);
        self.call(move |conn| {
            let total: i64 =
                conn.query_row("SELECT COUNT(*) FROM system_activity_log", [], |row| row.get(0))?;
            let total = total.max(0) as u64;
            let offset = (page - 1).saturating_mul(limit);
            let mut stmt = conn.prepare_cached(
                "SELECT id, activity_type, details, created_at FROM system_activity_log
                 ORDER BY id DESC LIMIT ?1 OFFSET ?2",
            )?;
            let rows = stmt
                .query_map(params![limit as i64, offset as i64], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let activities = rows
                .into_iter()
                .map(|(id, activity_type, details, timestamp)| {
                    Ok(ActivityEntry {
                        id,
                        activity_type,
                        details: serde_json::from_str(&details)
                            .with_context(|| format!("decode details of activity {id}"))?,
                        timestamp,
                    })
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            Ok(ActivityPage {
                activities,
                current_page: page,
                total_pages: total.div_ceil(limit),
            })
        })
        .await
    }
}
