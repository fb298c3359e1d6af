//! Semantic search over script descriptions, kept in step with the registry.

use crate::embedding::Embedder;
use crate::index::{Point, PointId, VectorIndex};
use crate::script_resolver::NOT_FOUND;
use crate::store::{ActivityKind, Database, NewScript};
use iira_tools::Script;
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScriptMatch {
    pub script_name: Option<String>,
    /// The matched id, or `"Not Found"`.
    pub script_id: String,
    pub score: Option<f32>,
}

impl ScriptMatch {
    fn not_found() -> Self {
        Self {
            script_name: None,
            script_id: NOT_FOUND.to_string(),
            score: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub upserted: usize,
    pub removed: usize,
}

/// Script registry writes plus the description index that mirrors them.
pub struct ScriptCatalog {
    db: Database,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    collection: String,
    dimension: usize,
    match_threshold: f32,
}

impl ScriptCatalog {
    pub fn new(
        db: Database,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        collection: impl Into<String>,
        dimension: usize,
        match_threshold: f32,
    ) -> Self {
        Self {
            db,
            embedder,
            index,
            collection: collection.into(),
            dimension,
            match_threshold,
        }
    }

    pub async fn add(&self, new: NewScript) -> anyhow::Result<Script> {
        let script = self.db.add_script(new).await?;
        self.db
            .record_activity(
                ActivityKind::CreateScript,
                json!({ "script_id": script.id, "script_name": script.name }),
            )
            .await;
        self.sync().await?;
        Ok(script)
    }

    pub async fn update(&self, id: i64, new: NewScript) -> anyhow::Result<Option<Script>> {
        let updated = self.db.update_script(id, new).await?;
        if let Some(script) = &updated {
            self.db
                .record_activity(
                    ActivityKind::UpdateScript,
                    json!({ "script_id": script.id, "script_name": script.name }),
                )
                .await;
            self.sync().await?;
        }
        Ok(updated)
    }

    pub async fn delete(&self, id: i64) -> anyhow::Result<bool> {
        let deleted = self.db.delete_script(id).await?;
        if deleted {
            self.db
                .record_activity(ActivityKind::DeleteScript, json!({ "script_id": id }))
                .await;
            self.sync().await?;
        }
        Ok(deleted)
    }

    /// Rebuild the index from the registry: drop points for scripts that no
    /// longer exist and re-embed every current description.
    #[tracing::instrument(level = "info", skip_all, fields(collection = %self.collection))]
    pub async fn sync(&self) -> anyhow::Result<SyncReport> {
        self.index
            .ensure_collection(&self.collection, self.dimension)
            .await?;
        let scripts = self.db.list_scripts().await?;
        let live: HashSet<PointId> = scripts
            .iter()
            .filter_map(|s| u64::try_from(s.id).ok().map(PointId::Num))
            .collect();

        let stale: Vec<PointId> = self
            .index
            .scroll_all(&self.collection)
            .await?
            .into_iter()
            .map(|p| p.id)
            .filter(|id| !live.contains(id))
            .collect();
        if !stale.is_empty() {
            self.index.delete(&self.collection, &stale).await?;
        }

        let mut points = Vec::with_capacity(scripts.len());
        for script in &scripts {
            let Ok(id) = u64::try_from(script.id) else {
                continue;
            };
            let text = if script.description.trim().is_empty() {
                script.name.as_str()
            } else {
                script.description.as_str()
            };
            points.push(Point {
                id: PointId::Num(id),
                vector: self.embedder.embed(text).await?,
                payload: json!({
                    "id": script.id,
                    "name": script.name,
                    "description": script.description,
                }),
            });
        }
        let upserted = points.len();
        if !points.is_empty() {
            self.index.upsert(&self.collection, points).await?;
        }
        tracing::info!(upserted, removed = stale.len(), "script index synchronized");
        Ok(SyncReport {
            upserted,
            removed: stale.len(),
        })
    }

    /// Best script for a free-text step description.
    pub async fn match_description(&self, description: &str) -> anyhow::Result<ScriptMatch> {
        if description.trim().is_empty() {
            return Ok(ScriptMatch::not_found());
        }
        let vector = self.embedder.embed(description).await?;
        let hits = self.index.search(&self.collection, &vector, 1).await?;
        let Some(best) = hits.into_iter().next() else {
            return Ok(ScriptMatch::not_found());
        };
        if best.score < self.match_threshold {
            tracing::debug!(score = best.score, threshold = self.match_threshold, "best script below threshold");
            return Ok(ScriptMatch::not_found());
        }
        let PointId::Num(id) = best.id else {
            return Ok(ScriptMatch::not_found());
        };
        let Ok(id) = i64::try_from(id) else {
            return Ok(ScriptMatch::not_found());
        };
        // The registry is authoritative; an index entry may predate a delete.
        match self.db.get_script(id).await? {
            Some(script) => Ok(ScriptMatch {
                script_name: Some(script.name),
                script_id: script.id.to_string(),
                score: Some(best.score),
            }),
            None => Ok(ScriptMatch::not_found()),
        }
    }
}
