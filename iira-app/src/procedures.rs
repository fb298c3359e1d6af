//! Procedure (SOP) catalogue: plain-text parsing, LLM-assisted drafting,
//! ingest into the vector index, listing and removal.

use crate::embedding::Embedder;
use crate::index::{Point, PointId, VectorIndex};
use crate::model::{Procedure, ProcedureStep};
use crate::planner::ProcedureStructurer;
use crate::script_index::ScriptCatalog;
use crate::store::{ActivityKind, Database};
use anyhow::Context;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

/// Parse one SOP document.
///
/// Blank lines are ignored. The first line is the title, the second the
/// issue, and each remaining line a step written either as
/// `description -> script_name` or as a bare description. Documents with
/// fewer than two lines yield `None`.
pub fn parse_procedure_text(text: &str) -> Option<Procedure> {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    let title = lines.next()?;
    let issue = lines.next()?;
    let steps = lines
        .map(|line| match line.split_once("->") {
            Some((description, script)) => ProcedureStep {
                description: description.trim().to_string(),
                script_name: Some(script.trim())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
                script_id: None,
            },
            None => ProcedureStep {
                description: line.to_string(),
                script_name: None,
                script_id: None,
            },
        })
        .collect();
    Some(Procedure {
        id: String::new(),
        title: title.to_string(),
        issue: issue.to_string(),
        tags: Vec::new(),
        steps,
    })
}

/// Parse a single file, or every `.txt` file directly inside a directory
/// (sorted by name).
pub async fn load_procedures(path: &Path) -> anyhow::Result<Vec<Procedure>> {
    let meta = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("stat {}", path.display()))?;
    let files = if meta.is_dir() {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(path)
            .await
            .with_context(|| format!("read directory {}", path.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let p = entry.path();
            if p.extension().is_some_and(|e| e == "txt") && entry.file_type().await?.is_file() {
                files.push(p);
            }
        }
        files.sort();
        files
    } else {
        vec![path.to_path_buf()]
    };

    let mut procedures = Vec::new();
    for file in files {
        let text = tokio::fs::read_to_string(&file)
            .await
            .with_context(|| format!("read {}", file.display()))?;
        match parse_procedure_text(&text) {
            Some(p) => procedures.push(p),
            None => tracing::warn!(path = %file.display(), "skipping SOP file with fewer than two lines"),
        }
    }
    Ok(procedures)
}

/// Structure raw SOP text with the model, then bind every step to the
/// closest registered script by description. Unbound steps carry
/// `script_id = "Not Found"`.
#[tracing::instrument(level = "info", skip_all)]
pub async fn draft_procedure(
    structurer: &dyn ProcedureStructurer,
    scripts: &ScriptCatalog,
    text: &str,
) -> anyhow::Result<Procedure> {
    if text.trim().is_empty() {
        anyhow::bail!("SOP text is empty");
    }
    let mut procedure = structurer.structure_procedure(text).await?;
    procedure.steps.retain(|s| !s.description.trim().is_empty());
    for step in &mut procedure.steps {
        let matched = scripts.match_description(&step.description).await?;
        step.script_name = matched.script_name;
        step.script_id = Some(matched.script_id);
    }
    let bound = procedure
        .steps
        .iter()
        .filter(|s| s.script_name.is_some())
        .count();
    tracing::info!(
        title = %procedure.title,
        steps = procedure.steps.len(),
        bound,
        "SOP drafted"
    );
    Ok(procedure)
}

pub struct ProcedureCatalog {
    db: Database,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    collection: String,
    dimension: usize,
}

impl ProcedureCatalog {
    pub fn new(
        db: Database,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        collection: impl Into<String>,
        dimension: usize,
    ) -> Self {
        Self {
            db,
            embedder,
            index,
            collection: collection.into(),
            dimension,
        }
    }

    /// Embed and store procedures under fresh ids. Returns them with ids set.
    #[tracing::instrument(level = "info", skip_all, fields(count = procedures.len()))]
    pub async fn ingest(&self, procedures: Vec<Procedure>) -> anyhow::Result<Vec<Procedure>> {
        if procedures.is_empty() {
            return Ok(procedures);
        }
        self.index
            .ensure_collection(&self.collection, self.dimension)
            .await?;

        let mut points = Vec::with_capacity(procedures.len());
        let mut stored = Vec::with_capacity(procedures.len());
        for mut procedure in procedures {
            if procedure.title.trim().is_empty() {
                anyhow::bail!("procedure title is required");
            }
            let vector = self
                .embedder
                .embed(&procedure.embedding_text())
                .await
                .with_context(|| format!("embed procedure '{}'", procedure.title))?;
            procedure.id = uuid::Uuid::new_v4().to_string();
            let mut payload = serde_json::to_value(&procedure)?;
            if let Some(map) = payload.as_object_mut() {
                map.remove("id");
            }
            points.push(Point {
                id: PointId::Uuid(procedure.id.clone()),
                vector,
                payload,
            });
            stored.push(procedure);
        }
        self.index.upsert(&self.collection, points).await?;
        for procedure in &stored {
            self.db
                .record_activity(
                    ActivityKind::IngestSop,
                    json!({ "sop_id": procedure.id, "title": procedure.title }),
                )
                .await;
        }
        tracing::info!(count = stored.len(), collection = %self.collection, "procedures ingested");
        Ok(stored)
    }

    pub async fn list(&self) -> anyhow::Result<Vec<Procedure>> {
        let points = self.index.scroll_all(&self.collection).await?;
        let mut out = Vec::with_capacity(points.len());
        for point in points {
            let id = point.id.to_string();
            match serde_json::from_value::<Procedure>(point.payload) {
                Ok(mut p) => {
                    p.id = id;
                    out.push(p);
                }
                Err(e) => tracing::warn!(point_id = %id, error = %e, "skipping malformed procedure payload"),
            }
        }
        Ok(out)
    }

    pub async fn delete(&self, id: &str) -> anyhow::Result<()> {
        self.index
            .delete(&self.collection, &[PointId::parse(id)])
            .await?;
        self.db
            .record_activity(ActivityKind::DeleteSop, json!({ "sop_id": id }))
            .await;
        tracing::info!(procedure_id = id, "procedure deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MemoryIndex;
    use crate::store::{NewScript, temp_database};

    struct LengthEmbedder;

    /// Disk-ish words vs. restart-ish words.
    struct KeywordEmbedder;

    #[async_trait::async_trait]
    impl Embedder for KeywordEmbedder {
        async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            let t = text.to_lowercase();
            let disk = ["disk", "space"].iter().filter(|w| t.contains(*w)).count();
            let restart = ["restart", "nginx"].iter().filter(|w| t.contains(*w)).count();
            Ok(vec![disk as f32, restart as f32])
        }
    }

    /// Splits on lines the way a well-behaved model would.
    struct LineStructurer;

    #[async_trait::async_trait]
    impl ProcedureStructurer for LineStructurer {
        async fn structure_procedure(&self, text: &str) -> anyhow::Result<Procedure> {
            let mut p = parse_procedure_text(text).ok_or_else(|| anyhow::anyhow!("too short"))?;
            for step in &mut p.steps {
                step.script_name = None;
            }
            Ok(p)
        }
    }

    fn procedure_catalog(db: Database, index: Arc<MemoryIndex>) -> ProcedureCatalog {
        ProcedureCatalog::new(db, Arc::new(LengthEmbedder), index, "sop_documents", 2)
    }

    #[async_trait::async_trait]
    impl Embedder for LengthEmbedder {
        async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            Ok(vec![text.len() as f32, 1.0])
        }
    }

    const WEB_SOP: &str = "Web server down\n\nnginx stops answering on port 80\nCheck disk usage -> check_disk\nRestart nginx -> restart_web_server\nTell the service owner\nEscalate ->   \n";

    #[test]
    fn text_format_parses_title_issue_and_steps() {
        let p = parse_procedure_text(WEB_SOP).unwrap();
        assert_eq!(p.title, "Web server down");
        assert_eq!(p.issue, "nginx stops answering on port 80");
        let tools: Vec<_> = p.steps.iter().map(|s| s.script_name.as_deref()).collect();
        assert_eq!(tools, [Some("check_disk"), Some("restart_web_server"), None, None]);
        assert_eq!(p.steps[3].description, "Escalate");
    }

    #[test]
    fn single_line_document_is_skipped() {
        assert!(parse_procedure_text("Only a title\n\n").is_none());
        assert!(parse_procedure_text("").is_none());
    }

    #[tokio::test]
    async fn directory_load_reads_txt_files_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "Disk full\n/var is full\nClean -> clear_tmp").unwrap();
        std::fs::write(dir.path().join("a.txt"), WEB_SOP).unwrap();
        std::fs::write(dir.path().join("notes.md"), "ignored\nentirely").unwrap();
        std::fs::write(dir.path().join("c.txt"), "too short").unwrap();

        let loaded = load_procedures(dir.path()).await.unwrap();
        let titles: Vec<_> = loaded.iter().map(|p| p.title.as_str()).collect();
        assert_eq!(titles, ["Web server down", "Disk full"]);

        let single = load_procedures(&dir.path().join("b.txt")).await.unwrap();
        assert_eq!(single.len(), 1);
    }

    #[tokio::test]
    async fn ingest_then_list_then_delete() {
        let (_dir, db) = temp_database().await;
        let catalog = procedure_catalog(db.clone(), Arc::new(MemoryIndex::new()));
        let stored = catalog
            .ingest(vec![parse_procedure_text(WEB_SOP).unwrap()])
            .await
            .unwrap();
        assert!(uuid::Uuid::parse_str(&stored[0].id).is_ok());

        let listed = catalog.list().await.unwrap();
        assert_eq!(listed, stored);

        catalog.delete(&stored[0].id).await.unwrap();
        assert!(catalog.list().await.unwrap().is_empty());

        let log = db.list_activity(1, 10).await.unwrap();
        let kinds: Vec<_> = log.activities.iter().map(|a| a.activity_type.as_str()).collect();
        assert_eq!(kinds, ["DELETE_SOP", "INGEST_SOP"]);
        assert_eq!(log.activities[1].details["title"], "Web server down");
        assert_eq!(log.activities[0].details["sop_id"], stored[0].id.as_str());
    }

    #[tokio::test]
    async fn untitled_procedure_is_rejected() {
        let (_dir, db) = temp_database().await;
        let catalog = procedure_catalog(db, Arc::new(MemoryIndex::new()));
        let mut p = parse_procedure_text(WEB_SOP).unwrap();
        p.title = " ".to_string();
        assert!(catalog.ingest(vec![p]).await.is_err());
    }

    #[tokio::test]
    async fn drafted_steps_bind_to_matching_scripts_or_not_found() {
        let (_dir, db) = temp_database().await;
        let scripts = ScriptCatalog::new(
            db,
            Arc::new(KeywordEmbedder),
            Arc::new(MemoryIndex::new()),
            "script_index",
            2,
            0.6,
        );
        let web = scripts
            .add(NewScript {
                name: "restart_web_server".to_string(),
                description: "Restart nginx".to_string(),
                tags: vec![],
                content: "#!/bin/sh\necho ok\n".to_string(),
                script_type: Some("shell_script".to_string()),
                params: vec![],
            })
            .await
            .unwrap();

        let draft = draft_procedure(&LineStructurer, &scripts, WEB_SOP).await.unwrap();
        assert_eq!(draft.title, "Web server down");
        assert_eq!(draft.steps.len(), 4);
        let restart = &draft.steps[1];
        assert_eq!(restart.script_name.as_deref(), Some("restart_web_server"));
        assert_eq!(restart.script_id, Some(web.id.to_string()));
        let owner = &draft.steps[2];
        assert_eq!(owner.script_name, None);
        assert_eq!(owner.script_id.as_deref(), Some("Not Found"));
    }

    #[tokio::test]
    async fn blank_text_is_not_sent_for_drafting() {
        let (_dir, db) = temp_database().await;
        let scripts = ScriptCatalog::new(
            db,
            Arc::new(KeywordEmbedder),
            Arc::new(MemoryIndex::new()),
            "script_index",
            2,
            0.6,
        );
        assert!(draft_procedure(&LineStructurer, &scripts, "  \n ").await.is_err());
    }
}
