use super::{Database, now_rfc3339};
use crate::model::{Incident, IncidentStatus};
use rusqlite::{OptionalExtension, Row, params};

const INCIDENT_COLUMNS: &str = "id, number, short_description, description, cmdb_ci, business_service, \
     priority, impact, urgency, assignment_group, status";

impl Database {
    /// Insert a `New` incident. Fails if the number already exists.
    pub async fn add_incident(&self, incident: Incident) -> anyhow::Result<Incident> {
        if incident.number.trim().is_empty() || incident.short_description.trim().is_empty() {
            anyhow::bail!("incident number and short_description are required");
        }
        self.call(move |conn| {
            let now = now_rfc3339();
            conn.execute(
                "INSERT INTO incidents (number, short_description, description, cmdb_ci, business_service,
                   priority, impact, urgency, assignment_group, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
                params![
                    incident.number,
                    incident.short_description,
                    incident.description,
                    incident.cmdb_ci,
                    incident.business_service,
                    incident.priority,
                    incident.impact,
                    incident.urgency,
                    incident.assignment_group,
                    IncidentStatus::New.as_str(),
                    now,
                ],
            )
            .map_err(|e| anyhow::anyhow!("insert incident {}: {e}", incident.number))?;
            Ok(Incident {
                id: conn.last_insert_rowid(),
                status: IncidentStatus::New,
                ..incident
            })
        })
        .await
    }

    pub async fn get_incident_by_number(&self, number: &str) -> anyhow::Result<Option<Incident>> {
        let number = number.to_string();
        self.call(move |conn| {
            let sql = format!("SELECT {INCIDENT_COLUMNS} FROM incidents WHERE number = ?1");
            Ok(conn.query_row(&sql, [&number], incident_from_row).optional()?)
        })
        .await
    }

    pub async fn list_incidents_with_status(
        &self,
        status: IncidentStatus,
    ) -> anyhow::Result<Vec<Incident>> {
        self.call(move |conn| {
            let sql = format!("SELECT {INCIDENT_COLUMNS} FROM incidents WHERE status = ?1 ORDER BY id");
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt
                .query_map([status.as_str()], incident_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn set_incident_status(
        &self,
        incident_id: i64,
        status: IncidentStatus,
    ) -> anyhow::Result<()> {
        self.call(move |conn| {
            let updated = conn.execute(
                "UPDATE incidents SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now_rfc3339(), incident_id],
            )?;
            if updated == 0 {
                anyhow::bail!("no incident with id {incident_id}");
            }
            tracing::info!(incident_id, status = %status, "incident status updated");
            Ok(())
        })
        .await
    }
}

fn incident_from_row(row: &Row<'_>) -> rusqlite::Result<Incident> {
    let status: String = row.get(10)?;
    Ok(Incident {
        id: row.get(0)?,
        number: row.get(1)?,
        short_description: row.get(2)?,
        description: row.get(3)?,
        cmdb_ci: row.get(4)?,
        business_service: row.get(5)?,
        priority: row.get(6)?,
        impact: row.get(7)?,
        urgency: row.get(8)?,
        assignment_group: row.get(9)?,
        status: IncidentStatus::parse(&status).unwrap_or(IncidentStatus::Error),
    })
}

#[cfg(test)]
pub(crate) fn sample_incident(number: &str) -> Incident {
    Incident {
        id: 0,
        number: number.to_string(),
        short_description: "Web server down".to_string(),
        description: Some("nginx on web-01 is not responding".to_string()),
        cmdb_ci: Some("web-01".to_string()),
        business_service: Some("storefront".to_string()),
        priority: Some("2".to_string()),
        impact: None,
        urgency: None,
        assignment_group: None,
        status: IncidentStatus::New,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{IncidentSource, temp_database};

    #[tokio::test]
    async fn unresolved_lists_only_new_incidents_in_id_order() {
        let (_dir, db) = temp_database().await;
        let a = db.add_incident(sample_incident("INC001")).await.unwrap();
        let b = db.add_incident(sample_incident("INC002")).await.unwrap();
        db.add_incident(sample_incident("INC003")).await.unwrap();

        db.set_status(b.id, IncidentStatus::InProgress).await.unwrap();

        let open: Vec<_> = db
            .list_unresolved()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.number)
            .collect();
        assert_eq!(open, ["INC001", "INC003"]);
        assert_eq!(a.status, IncidentStatus::New);
    }

    #[tokio::test]
    async fn duplicate_number_is_rejected() {
        let (_dir, db) = temp_database().await;
        db.add_incident(sample_incident("INC001")).await.unwrap();
        assert!(db.add_incident(sample_incident("INC001")).await.is_err());
    }

    #[tokio::test]
    async fn set_status_on_unknown_incident_fails() {
        let (_dir, db) = temp_database().await;
        assert!(db.set_incident_status(42, IncidentStatus::Resolved).await.is_err());
    }

    #[tokio::test]
    async fn status_is_persisted_with_display_name() {
        let (_dir, db) = temp_database().await;
        let inc = db.add_incident(sample_incident("INC009")).await.unwrap();
        db.set_incident_status(inc.id, IncidentStatus::SopNotFound)
            .await
            .unwrap();
        let fetched = db.get_incident_by_number("INC009").await.unwrap().unwrap();
        assert_eq!(fetched.status, IncidentStatus::SopNotFound);
    }
}
