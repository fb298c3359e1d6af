//! SQLite persistence.
//!
//! Every call opens its own connection on a blocking worker thread, so the
//! async runtime never waits on disk I/O.

mod activity;
mod feedback;
mod history;
mod incidents;
mod scripts;
mod settings;

pub use activity::{ActivityEntry, ActivityKind, ActivityPage};
pub use feedback::{AgentCount, FeedbackAnalysis, FeedbackSummaryStats, Misclassification, WarmCandidate};
pub use history::{HistoryEntry, HistoryPage};
pub use scripts::NewScript;

#[cfg(test)]
pub(crate) use incidents::sample_incident;

use crate::model::{Incident, IncidentStatus, Plan, StepRecord};
use anyhow::Context;
use async_trait::async_trait;
use iira_tools::Script;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS scripts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE,
  description TEXT NOT NULL DEFAULT '',
  tags TEXT NOT NULL DEFAULT '[]',
  content TEXT NOT NULL DEFAULT '',
  script_type TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS script_params (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  script_id INTEGER NOT NULL REFERENCES scripts(id) ON DELETE CASCADE,
  position INTEGER NOT NULL,
  param_name TEXT NOT NULL,
  param_type TEXT NOT NULL,
  required INTEGER NOT NULL DEFAULT 0,
  default_value TEXT
);
CREATE INDEX IF NOT EXISTS idx_script_params_script ON script_params(script_id, position);
CREATE TABLE IF NOT EXISTS incidents (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  number TEXT NOT NULL UNIQUE,
  short_description TEXT NOT NULL,
  description TEXT,
  cmdb_ci TEXT,
  business_service TEXT,
  priority TEXT,
  impact TEXT,
  urgency TEXT,
  assignment_group TEXT,
  status TEXT NOT NULL DEFAULT 'New',
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS incident_history (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  incident_number TEXT NOT NULL,
  incident_data TEXT NOT NULL,
  llm_plan TEXT,
  resolved_scripts TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_history_number ON incident_history(incident_number, id);
CREATE TABLE IF NOT EXISTS retrieval_feedback (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  incident_short_description TEXT NOT NULL,
  incident_description TEXT,
  incident_number TEXT,
  recommended_agent_id TEXT,
  recommended_agent_title TEXT,
  search_score REAL,
  user_feedback_type TEXT NOT NULL,
  correct_agent_id TEXT,
  correct_agent_title TEXT,
  session_id TEXT,
  created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS feedback_keys (
  key TEXT PRIMARY KEY,
  last_feedback_ts TEXT,
  expires_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS feedback_counters (
  key TEXT NOT NULL REFERENCES feedback_keys(key) ON DELETE CASCADE,
  field TEXT NOT NULL,
  value INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY (key, field)
);
CREATE TABLE IF NOT EXISTS system_activity_log (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  activity_type TEXT NOT NULL,
  details TEXT NOT NULL,
  created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS app_settings (
  setting_key TEXT PRIMARY KEY,
  setting_value TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
"#;

/// Handle to the IIRA database file. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
}

impl Database {
    /// Create the file (and parent directory) if needed and apply the schema.
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let db = Self { path: path.into() };
        if let Some(parent) = db.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create database directory {}", parent.display()))?;
        }
        db.call(|conn| {
            conn.execute_batch(SCHEMA).context("apply schema")?;
            Ok(())
        })
        .await?;
        tracing::info!(path = %db.path.display(), "database ready");
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) async fn call<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = connect(&path)?;
            f(&mut conn)
        })
        .await
        .context("database task join error")?
    }
}

fn connect(path: &Path) -> anyhow::Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("open database {}", path.display()))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;
    Ok(conn)
}

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Read access to registered scripts.
#[async_trait]
pub trait ScriptRegistry: Send + Sync {
    /// All scripts, ordered by id.
    async fn list_scripts(&self) -> anyhow::Result<Vec<Script>>;
    async fn get_script_by_name(&self, name: &str) -> anyhow::Result<Option<Script>>;
}

/// Where incidents come from and where their status is reported.
#[async_trait]
pub trait IncidentSource: Send + Sync {
    async fn list_unresolved(&self) -> anyhow::Result<Vec<Incident>>;
    async fn set_status(&self, incident_id: i64, status: IncidentStatus) -> anyhow::Result<()>;
}

/// One trace record per resolution attempt, rewritten as the run progresses.
#[async_trait]
pub trait TraceStore: Send + Sync {
    async fn insert_initial(&self, incident: &Incident) -> anyhow::Result<i64>;
    async fn update(
        &self,
        incident_number: &str,
        plan: Option<&Plan>,
        trace: &[StepRecord],
    ) -> anyhow::Result<()>;
}

#[async_trait]
impl ScriptRegistry for Database {
    async fn list_scripts(&self) -> anyhow::Result<Vec<Script>> {
        Database::list_scripts(self).await
    }

    async fn get_script_by_name(&self, name: &str) -> anyhow::Result<Option<Script>> {
        Database::get_script_by_name(self, name).await
    }
}

#[async_trait]
impl IncidentSource for Database {
    async fn list_unresolved(&self) -> anyhow::Result<Vec<Incident>> {
        self.list_incidents_with_status(IncidentStatus::New).await
    }

    async fn set_status(&self, incident_id: i64, status: IncidentStatus) -> anyhow::Result<()> {
        self.set_incident_status(incident_id, status).await
    }
}

#[async_trait]
impl TraceStore for Database {
    async fn insert_initial(&self, incident: &Incident) -> anyhow::Result<i64> {
        self.insert_history(incident).await
    }

    async fn update(
        &self,
        incident_number: &str,
        plan: Option<&Plan>,
        trace: &[StepRecord],
    ) -> anyhow::Result<()> {
        self.update_history(incident_number, plan, trace).await
    }
}

#[cfg(test)]
pub(crate) async fn temp_database() -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("iira.db")).await.unwrap();
    (dir, db)
}
