//! Component wiring and the long-running `serve` mode.

use crate::config::{IiraConfig, VectorBackend};
use crate::embedding::{Embedder, OllamaEmbedder};
use crate::feedback::{FeedbackService, FeedbackStore, RerankPolicy};
use crate::index::{MemoryIndex, QdrantIndex, VectorIndex};
use crate::model::{Incident, IncidentStatus};
use crate::monitor::IncidentMonitor;
use crate::planner::{LlmPlanner, ProcedureStructurer};
use crate::procedures::ProcedureCatalog;
use crate::resolver::{ResolutionOutcome, ResolverAgent, ResolverDeps};
use crate::retrieval::RetrievalEngine;
use crate::runner::ScriptRunner;
use crate::script_index::ScriptCatalog;
use crate::script_resolver::ScriptResolver;
use crate::store::Database;
use crate::thresholds::{ThresholdCache, Thresholds};
use iira_llm::OllamaClient;
use iira_tools::{ExecutionAgent, ShellScriptTool};
use std::sync::Arc;
use std::time::Duration;

pub struct App {
    pub config: IiraConfig,
    pub db: Database,
    pub thresholds: Arc<ThresholdCache>,
    pub retrieval: Arc<RetrievalEngine>,
    pub resolver: Arc<ResolverAgent>,
    pub procedures: ProcedureCatalog,
    pub scripts: ScriptCatalog,
    pub runner: ScriptRunner,
    pub structurer: Arc<dyn ProcedureStructurer>,
    pub feedback: FeedbackService,
}

impl App {
    pub async fn build(config: IiraConfig) -> anyhow::Result<Self> {
        tracing::info!(
            database_path = %config.general.database_path.display(),
            llm_base_url = %config.llm.base_url,
            plan_model = %config.llm.plan_model,
            params_model = %config.llm.params_model,
            embedding_model = %config.embedding.model,
            embedding_dimension = config.embedding.dimension,
            vector_backend = ?config.vector_index.backend,
            vector_url = %config.vector_index.url,
            top_k = config.retrieval.top_k,
            execution_timeout_seconds = config.execution.timeout_seconds,
            "configuration loaded"
        );

        let db = Database::open(&config.general.database_path).await?;
        let request_timeout = Duration::from_secs(config.llm.timeout_seconds);
        let llm = OllamaClient::new(&config.llm.base_url, request_timeout, config.llm.retry_policy());
        let embedder: Arc<dyn Embedder> = Arc::new(OllamaEmbedder::new(
            llm.clone(),
            config.embedding.model.clone(),
            config.embedding.dimension,
        ));
        let index: Arc<dyn VectorIndex> = match config.vector_index.backend {
            VectorBackend::Qdrant => Arc::new(QdrantIndex::new(
                &config.vector_index.url,
                config.vector_index.api_key.clone(),
                request_timeout,
                config.llm.retry_policy(),
            )?),
            VectorBackend::Memory => {
                tracing::warn!("in-memory vector index: procedures do not outlive this process");
                Arc::new(MemoryIndex::new())
            }
        };
        let planner = Arc::new(LlmPlanner::new(
            llm,
            config.llm.plan_model.clone(),
            config.llm.params_model.clone(),
            config.llm.hyde_model.clone(),
        ));
        let thresholds = Arc::new(ThresholdCache::new(
            Arc::new(db.clone()),
            Thresholds::from(&config.retrieval),
        ));
        let feedback_store: Arc<dyn FeedbackStore> = Arc::new(db.clone());

        let retrieval = Arc::new(RetrievalEngine::new(
            embedder.clone(),
            index.clone(),
            feedback_store.clone(),
            planner.clone(),
            thresholds.clone(),
            config.vector_index.procedure_collection.clone(),
            config.retrieval.fetch_k,
            RerankPolicy::from(&config.feedback),
        ));
        let executor = Arc::new(ExecutionAgent::new(ShellScriptTool::new(
            config.execution.shell_policy(),
        )));
        let resolver = Arc::new(ResolverAgent::new(ResolverDeps {
            retrieval: retrieval.clone(),
            planner: planner.clone(),
            extractor: planner.clone(),
            registry: Arc::new(db.clone()),
            traces: Arc::new(db.clone()),
            executor: executor.clone(),
            script_resolver: ScriptResolver::new(config.resolver.match_threshold),
            top_k: config.retrieval.top_k,
        }));
        let runner = ScriptRunner::new(Arc::new(db.clone()), executor);
        let procedures = ProcedureCatalog::new(
            db.clone(),
            embedder.clone(),
            index.clone(),
            config.vector_index.procedure_collection.clone(),
            config.embedding.dimension,
        );
        let scripts = ScriptCatalog::new(
            db.clone(),
            embedder,
            index,
            config.vector_index.script_collection.clone(),
            config.embedding.dimension,
            config.retrieval.script_match_threshold,
        );
        let feedback = FeedbackService::new(db.clone(), feedback_store, config.feedback.clone());

        Ok(Self {
            config,
            db,
            thresholds,
            retrieval,
            resolver,
            procedures,
            scripts,
            runner,
            structurer: planner,
            feedback,
        })
    }

    /// Resolve one stored incident now, regardless of its current status.
    pub async fn resolve_number(&self, number: &str) -> anyhow::Result<ResolutionOutcome> {
        let incident: Incident = self
            .db
            .get_incident_by_number(number)
            .await?
            .ok_or_else(|| anyhow::anyhow!("incident {number} not found"))?;
        self.db
            .set_incident_status(incident.id, IncidentStatus::InProgress)
            .await?;
        let outcome = self.resolver.run(&incident).await;
        self.db
            .set_incident_status(incident.id, outcome.status.incident_status())
            .await?;
        Ok(outcome)
    }

    /// Run the incident monitor until Ctrl-C.
    pub async fn serve(self) -> anyhow::Result<()> {
        if let Err(error) = self.scripts.sync().await {
            tracing::warn!(error = %error, "script index sync at startup failed");
        }
        let monitor = IncidentMonitor::new(
            Arc::new(self.db.clone()),
            self.resolver.clone(),
            Duration::from_secs(self.config.monitor.poll_interval_seconds),
        );
        tracing::info!(
            database_path = %self.db.path().display(),
            monitor_enabled = self.config.monitor.enabled,
            "iira serving"
        );
        if self.config.monitor.enabled {
            monitor.start().await;
        } else {
            tracing::info!("incident monitor disabled");
        }

        tokio::signal::ctrl_c()
            .await
            .map_err(|e| anyhow::anyhow!("wait for shutdown signal: {e}"))?;
        tracing::info!("shutdown signal received");
        let summary = monitor.shutdown().await;
        tracing::info!(
            incidents_processed = summary.total_processed,
            polls = summary.total_polls,
            "iira stopped"
        );
        Ok(())
    }
}
