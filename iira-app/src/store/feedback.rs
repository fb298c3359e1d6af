use super::{Database, now_rfc3339};
use crate::feedback::{CounterBatch, FeedbackStore, FeedbackSubmission, FeedbackSummary};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackSummaryStats {
    pub total_feedback: i64,
    pub correct_recommendations: i64,
    pub incorrect_recommendations: i64,
    /// Percentage, two decimals.
    pub overall_accuracy: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentCount {
    pub agent_title: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Misclassification {
    pub recommended: String,
    pub correct: String,
    pub frequency: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackAnalysis {
    pub summary: FeedbackSummaryStats,
    pub best_performing_agents: Vec<AgentCount>,
    pub worst_performing_agents: Vec<AgentCount>,
    pub common_misclassifications: Vec<Misclassification>,
}

/// An incident text that was confirmed for the same procedure often enough
/// to seed the counters ahead of time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmCandidate {
    pub short_description: String,
    pub description: Option<String>,
    pub agent_id: String,
    pub votes: i64,
}

impl Database {
    pub async fn record_feedback(&self, submission: &FeedbackSubmission) -> anyhow::Result<i64> {
        let s = submission.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO retrieval_feedback (
                   incident_short_description, incident_description, incident_number,
                   recommended_agent_id, recommended_agent_title, search_score,
                   user_feedback_type, correct_agent_id, correct_agent_title, session_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    s.incident_short_description,
                    s.incident_description,
                    s.incident_number,
                    s.recommended_agent_id,
                    s.recommended_agent_title,
                    s.search_score,
                    s.feedback_type.as_str(),
                    s.correct_agent_id,
                    s.correct_agent_title,
                    s.session_id,
                    now_rfc3339(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn analyze_feedback(&self) -> anyhow::Result<FeedbackAnalysis> {
        self.call(|conn| {
            let mut by_type: BTreeMap<String, i64> = BTreeMap::new();
            {
                let mut stmt = conn.prepare_cached(
                    "SELECT user_feedback_type, COUNT(*) FROM retrieval_feedback GROUP BY user_feedback_type",
                )?;
                let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
                for row in rows {
                    let (kind, count): (String, i64) = row?;
                    by_type.insert(kind, count);
                }
            }
            let correct = by_type.get("Correct").copied().unwrap_or(0);
            let incorrect = by_type.get("Incorrect").copied().unwrap_or(0);
            let total = correct + incorrect;
            let accuracy = if total > 0 {
                (correct as f64 / total as f64 * 10_000.0).round() / 100.0
            } else {
                0.0
            };

            let best = agent_counts(
                conn,
                "SELECT correct_agent_title, COUNT(*) FROM retrieval_feedback
                 WHERE user_feedback_type = 'Correct' AND correct_agent_title IS NOT NULL
                 GROUP BY correct_agent_title ORDER BY COUNT(*) DESC, correct_agent_title LIMIT 5",
            )?;
            let worst = agent_counts(
                conn,
                "SELECT recommended_agent_title, COUNT(*) FROM retrieval_feedback
                 WHERE user_feedback_type = 'Incorrect' AND recommended_agent_title IS NOT NULL
                 GROUP BY recommended_agent_title ORDER BY COUNT(*) DESC, recommended_agent_title LIMIT 5",
            )?;

            let mut stmt = conn.prepare_cached(
                "SELECT recommended_agent_title, correct_agent_title, COUNT(*)
                 FROM retrieval_feedback
                 WHERE user_feedback_type = 'Incorrect'
                   AND recommended_agent_title IS NOT NULL AND correct_agent_title IS NOT NULL
                   AND recommended_agent_title != correct_agent_title
                 GROUP BY recommended_agent_title, correct_agent_title
                 ORDER BY COUNT(*) DESC, recommended_agent_title LIMIT 10",
            )?;
            let misclassifications = stmt
                .query_map([], |row| {
                    Ok(Misclassification {
                        recommended: row.get(0)?,
                        correct: row.get(1)?,
                        frequency: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(FeedbackAnalysis {
                summary: FeedbackSummaryStats {
                    total_feedback: total,
                    correct_recommendations: correct,
                    incorrect_recommendations: incorrect,
                    overall_accuracy: accuracy,
                },
                best_performing_agents: best,
                worst_performing_agents: worst,
                common_misclassifications: misclassifications,
            })
        })
        .await
    }

    /// Incident texts confirmed `Correct` for the same procedure at least
    /// `min_votes` times.
    pub async fn warm_candidates(&self, min_votes: i64) -> anyhow::Result<Vec<WarmCandidate>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT incident_short_description, incident_description, correct_agent_id, COUNT(*)
                 FROM retrieval_feedback
                 WHERE user_feedback_type = 'Correct' AND correct_agent_id IS NOT NULL
                 GROUP BY incident_short_description, incident_description, correct_agent_id
                 HAVING COUNT(*) >= ?1
                 ORDER BY MIN(id)",
            )?;
            let rows = stmt
                .query_map([min_votes], |row| {
                    Ok(WarmCandidate {
                        short_description: row.get(0)?,
                        description: row.get(1)?,
                        agent_id: row.get(2)?,
                        votes: row.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }
}

fn agent_counts(conn: &Connection, sql: &str) -> anyhow::Result<Vec<AgentCount>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(AgentCount {
                agent_title: row.get(0)?,
                count: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Drop `key` if its TTL has passed. Returns whether a live entry remains.
fn expire_if_stale(conn: &Connection, key: &str, now: i64) -> anyhow::Result<bool> {
    let expires_at: Option<i64> = conn
        .query_row(
            "SELECT expires_at FROM feedback_keys WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()?;
    match expires_at {
        Some(at) if at <= now => {
            conn.execute("DELETE FROM feedback_keys WHERE key = ?1", [key])?;
            Ok(false)
        }
        Some(_) => Ok(true),
        None => Ok(false),
    }
}

#[async_trait]
impl FeedbackStore for Database {
    async fn get_counters(&self, key: &str) -> anyhow::Result<FeedbackSummary> {
        let key = key.to_string();
        self.call(move |conn| {
            if !expire_if_stale(conn, &key, unix_now())? {
                return Ok(FeedbackSummary::default());
            }
            let last_feedback_ts: Option<String> = conn.query_row(
                "SELECT last_feedback_ts FROM feedback_keys WHERE key = ?1",
                [&key],
                |row| row.get(0),
            )?;
            let mut stmt =
                conn.prepare_cached("SELECT field, value FROM feedback_counters WHERE key = ?1")?;
            let counters = stmt
                .query_map([&key], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
            Ok(FeedbackSummary {
                counters,
                last_feedback_ts,
            })
        })
        .await
    }

    async fn apply_batch(&self, key: &str, batch: &CounterBatch) -> anyhow::Result<()> {
        let key = key.to_string();
        let batch = batch.clone();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let now = unix_now();
            expire_if_stale(&tx, &key, now)?;
            let ttl = i64::try_from(batch.ttl.as_secs()).unwrap_or(i64::MAX);
            tx.execute(
                "INSERT INTO feedback_keys (key, last_feedback_ts, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                   last_feedback_ts = excluded.last_feedback_ts,
                   expires_at = excluded.expires_at",
                params![key, now_rfc3339(), now.saturating_add(ttl)],
            )?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO feedback_counters (key, field, value) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key, field) DO UPDATE SET value = value + excluded.value",
                )?;
                for (field, delta) in &batch.increments {
                    stmt.execute(params![key, field, delta])?;
                }
            }
            tx.commit()?;
            tracing::debug!(key = %key, fields = batch.increments.len(), "feedback counters updated");
            Ok(())
        })
        .await
    }
}
