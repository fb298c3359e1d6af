use super::{Database, now_rfc3339};
use crate::model::{Incident, Plan, StepRecord};
use anyhow::Context;
use rusqlite::{OptionalExtension, Row, params};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub incident_number: String,
    /// Current status of the incident, when it exists in `incidents`.
    pub status: Option<String>,
    pub incident_data: serde_json::Value,
    pub llm_plan: Option<Plan>,
    pub resolved_scripts: Option<Vec<StepRecord>>,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPage {
    pub history: Vec<HistoryEntry>,
    pub total_records: u64,
    pub total_pages: u64,
    pub current_page: u64,
}

impl Database {
    /// Start a new attempt record with no plan and no steps.
    pub async fn insert_history(&self, incident: &Incident) -> anyhow::Result<i64> {
        let number = incident.number.clone();
        let data = serde_json::to_string(incident)?;
        self.call(move |conn| {
            let now = now_rfc3339();
            conn.execute(
                "INSERT INTO incident_history (incident_number, incident_data, llm_plan, resolved_scripts, created_at, updated_at)
                 VALUES (?1, ?2, NULL, NULL, ?3, ?3)",
                params![number, data, now],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Rewrite plan and steps on the latest attempt for `incident_number`.
    pub async fn update_history(
        &self,
        incident_number: &str,
        plan: Option<&Plan>,
        trace: &[StepRecord],
    ) -> anyhow::Result<()> {
        let number = incident_number.to_string();
        let plan = plan.map(serde_json::to_string).transpose()?;
        let trace = serde_json::to_string(trace)?;
        self.call(move |conn| {
            let updated = conn.execute(
                "UPDATE incident_history
                 SET llm_plan = ?1, resolved_scripts = ?2, updated_at = ?3
                 WHERE id = (SELECT MAX(id) FROM incident_history WHERE incident_number = ?4)",
                params![plan, trace, now_rfc3339(), number],
            )?;
            if updated == 0 {
                anyhow::bail!("no history record for incident {number}");
            }
            Ok(())
        })
        .await
    }

    pub async fn latest_history(&self, incident_number: &str) -> anyhow::Result<Option<HistoryEntry>> {
        let number = incident_number.to_string();
        self.call(move |conn| {
            let entry = conn
                .query_row(
                    "SELECT h.id, h.incident_number, i.status, h.incident_data, h.llm_plan,
                            h.resolved_scripts, h.updated_at
                     FROM incident_history h LEFT JOIN incidents i ON i.number = h.incident_number
                     WHERE h.incident_number = ?1 ORDER BY h.id DESC LIMIT 1",
                    [&number],
                    raw_from_row,
                )
                .optional()?;
            entry.map(RawEntry::decode).transpose()
        })
        .await
    }

    /// Newest first. `page` is 1-based.
    pub async fn list_history(&self, page: u64, limit: u64) -> anyhow::Result<HistoryPage> {
        let page = page.max(1);
        let limit = limit.clamp(1, 500);
        self.call(move |conn| {
            let total: i64 =
                conn.query_row("SELECT COUNT(*) FROM incident_history", [], |row| row.get(0))?;
            let total = total.max(0) as u64;
            let offset = (page - 1).saturating_mul(limit);
            let mut stmt = conn.prepare_cached(
                "SELECT h.id, h.incident_number, i.status, h.incident_data, h.llm_plan,
                        h.resolved_scripts, h.updated_at
                 FROM incident_history h LEFT JOIN incidents i ON i.number = h.incident_number
                 ORDER BY h.id DESC LIMIT ?1 OFFSET ?2",
            )?;
            let history = stmt
                .query_map(params![limit as i64, offset as i64], raw_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?
                .into_iter()
                .map(RawEntry::decode)
                .collect::<anyhow::Result<Vec<_>>>()?;
            Ok(HistoryPage {
                history,
                total_records: total,
                total_pages: total.div_ceil(limit),
                current_page: page,
            })
        })
        .await
    }
}

struct RawEntry {
    id: i64,
    incident_number: String,
    status: Option<String>,
    incident_data: String,
    llm_plan: Option<String>,
    resolved_scripts: Option<String>,
    updated_at: String,
}

impl RawEntry {
    fn decode(self) -> anyhow::Result<HistoryEntry> {
        let id = self.id;
        Ok(HistoryEntry {
            id,
            incident_number: self.incident_number,
            status: self.status,
            incident_data: serde_json::from_str(&self.incident_data)
                .with_context(|| format!("decode incident_data of history {id}"))?,
            llm_plan: self
                .llm_plan
                .map(|p| serde_json::from_str(&p))
                .transpose()
                .with_context(|| format!("decode llm_plan of history {id}"))?,
            resolved_scripts: self
                .resolved_scripts
                .map(|s| serde_json::from_str(&s))
                .transpose()
                .with_context(|| format!("decode resolved_scripts of history {id}"))?,
            updated_at: self.updated_at,
        })
    }
}

fn raw_from_row(row: &Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok(RawEntry {
        id: row.get(0)?,
        incident_number: row.get(1)?,
        status: row.get(2)?,
        incident_data: row.get(3)?,
        llm_plan: row.get(4)?,
        resolved_scripts: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PlanStep, StepStatus};
    use crate::store::incidents::sample_incident;
    use crate::store::temp_database;

    fn step(n: usize, status: StepStatus) -> StepRecord {
        StepRecord {
            step_number: n,
            description: format!("step {n}"),
            resolved_script_name: None,
            resolved_script_id: None,
            extracted_parameters: Default::default(),
            status,
            output: String::new(),
        }
    }

    #[tokio::test]
    async fn update_rewrites_latest_attempt_in_place() {
        let (_dir, db) = temp_database().await;
        let inc = sample_incident("INC100");
        let first = db.insert_history(&inc).await.unwrap();
        let second = db.insert_history(&inc).await.unwrap();
        assert!(second > first);

        let plan = Plan {
            steps: vec![PlanStep {
                description: "restart".to_string(),
                tool: Some("restart_nginx".to_string()),
            }],
        };
        db.update_history("INC100", Some(&plan), &[step(1, StepStatus::Success)])
            .await
            .unwrap();
        db.update_history(
            "INC100",
            Some(&plan),
            &[step(1, StepStatus::Success), step(2, StepStatus::Skipped)],
        )
        .await
        .unwrap();

        let latest = db.latest_history("INC100").await.unwrap().unwrap();
        assert_eq!(latest.id, second);
        assert_eq!(latest.llm_plan, Some(plan));
        assert_eq!(latest.resolved_scripts.unwrap().len(), 2);

        let page = db.list_history(1, 10).await.unwrap();
        assert_eq!(page.total_records, 2);
        let older = page.history.iter().find(|h| h.id == first).unwrap();
        assert!(older.llm_plan.is_none());
    }

    #[tokio::test]
    async fn update_without_initial_record_fails() {
        let (_dir, db) = temp_database().await;
        assert!(db.update_history("INC404", None, &[]).await.is_err());
    }

    #[tokio::test]
    async fn pagination_counts_pages() {
        let (_dir, db) = temp_database().await;
        for n in 0..5 {
            db.insert_history(&sample_incident(&format!("INC{n}"))).await.unwrap();
        }
        let page = db.list_history(2, 2).await.unwrap();
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.current_page, 2);
        let numbers: Vec<_> = page.history.iter().map(|h| h.incident_number.as_str()).collect();
        assert_eq!(numbers, ["INC2", "INC1"]);
    }
}
