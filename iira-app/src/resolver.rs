//! Incident resolution loop: retrieve, plan, then resolve, extract and
//! execute each step in order.
//!
//! Manual and unmatched steps are skipped and the run goes on; the first
//! step that fails halts it. The trace is written back after every step.

use crate::error::ResolutionError;
use crate::model::{
    Incident, IncidentStatus, Plan, ResolutionContext, ScoredProcedure, StepRecord, StepStatus,
};
use crate::planner::{ParameterExtractor, PlanGenerator};
use crate::retrieval::{RetrievalEngine, SearchQuery};
use crate::runner::execution_tool;
use crate::script_resolver::{ResolvedStep, ScriptResolver, StepBinding};
use crate::store::{ScriptRegistry, TraceStore};
use iira_tools::{ExecutionAgent, ParamValues};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResolutionStatus {
    Resolved,
    Error,
    #[serde(rename = "SOP not found")]
    SopNotFound,
}

impl ResolutionStatus {
    pub fn incident_status(self) -> IncidentStatus {
        match self {
            Self::Resolved => IncidentStatus::Resolved,
            Self::Error => IncidentStatus::Error,
            Self::SopNotFound => IncidentStatus::SopNotFound,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolutionOutcome {
    pub status: ResolutionStatus,
    pub plan: Option<Plan>,
    pub trace: Vec<StepRecord>,
    /// Why the run stopped early, if it did.
    pub error: Option<String>,
}

/// What a dry run would do, without executing anything.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanPreview {
    pub candidates: Vec<ScoredProcedure>,
    pub plan: Plan,
    pub steps: Vec<ResolvedStep>,
}

pub struct ResolverDeps {
    pub retrieval: Arc<RetrievalEngine>,
    pub planner: Arc<dyn PlanGenerator>,
    pub extractor: Arc<dyn ParameterExtractor>,
    pub registry: Arc<dyn ScriptRegistry>,
    pub traces: Arc<dyn TraceStore>,
    pub executor: Arc<ExecutionAgent>,
    pub script_resolver: ScriptResolver,
    pub top_k: usize,
}

pub struct ResolverAgent {
    deps: ResolverDeps,
}

enum StepFlow {
    Continue(ResolutionContext),
    Halt(ResolutionError),
}

struct StepOutcome {
    record: StepRecord,
    flow: StepFlow,
}

#[derive(Default)]
struct RunState {
    plan: Option<Plan>,
    trace: Vec<StepRecord>,
}

impl ResolverAgent {
    pub fn new(deps: ResolverDeps) -> Self {
        Self { deps }
    }

    /// Resolve one incident. Never fails: problems end up in the outcome's
    /// status and error.
    #[tracing::instrument(level = "info", skip_all, fields(incident_number = %incident.number))]
    pub async fn run(&self, incident: &Incident) -> ResolutionOutcome {
        let mut state = RunState::default();
        let result = self.drive(incident, &mut state).await;
        let (status, error) = match result {
            Ok(()) => (ResolutionStatus::Resolved, None),
            Err(ResolutionError::NotFound) => {
                tracing::info!("no procedure matched the incident");
                (ResolutionStatus::SopNotFound, None)
            }
            Err(e) => {
                tracing::error!(error = %e, steps = state.trace.len(), "resolution stopped");
                (ResolutionStatus::Error, Some(e.to_string()))
            }
        };
        tracing::info!(status = ?status, steps = state.trace.len(), "resolution finished");
        ResolutionOutcome {
            status,
            plan: state.plan,
            trace: state.trace,
            error,
        }
    }

    async fn drive(&self, incident: &Incident, state: &mut RunState) -> Result<(), ResolutionError> {
        self.deps
            .traces
            .insert_initial(incident)
            .await
            .map_err(|e| ResolutionError::upstream(format!("trace insert failed: {e}")))?;

        let (query_text, candidates) = self.retrieve(incident).await?;
        let plan = self.plan(&query_text, &candidates).await?;
        state.plan = Some(plan.clone());
        self.checkpoint(&incident.number, state).await?;

        let scripts = self
            .deps
            .registry
            .list_scripts()
            .await
            .map_err(ResolutionError::upstream)?;
        let steps = self.deps.script_resolver.resolve(&plan.steps, &scripts);

        let mut context = ResolutionContext::from_incident(incident);
        for (i, step) in steps.iter().enumerate() {
            let StepOutcome { record, flow } = self.run_step(i + 1, step, &context).await;
            tracing::info!(
                step = record.step_number,
                status = ?record.status,
                script_name = record.resolved_script_name.as_deref().unwrap_or("-"),
                "step finished"
            );
            state.trace.push(record);
            self.checkpoint(&incident.number, state).await?;
            match flow {
                StepFlow::Continue(next) => context = next,
                StepFlow::Halt(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn retrieve(
        &self,
        incident: &Incident,
    ) -> Result<(String, Vec<ScoredProcedure>), ResolutionError> {
        let (text, aux) = incident.search_text();
        let query = SearchQuery {
            text,
            aux,
            top_k: self.deps.top_k,
            apply_threshold: true,
        };
        let outcome = self.deps.retrieval.search(&query).await?;
        if outcome.results.is_empty() {
            return Err(ResolutionError::NotFound);
        }
        let query_text = match aux {
            Some(aux) => format!("{text}\n{aux}"),
            None => text.to_string(),
        };
        Ok((query_text, outcome.results))
    }

    async fn plan(
        &self,
        query_text: &str,
        candidates: &[ScoredProcedure],
    ) -> Result<Plan, ResolutionError> {
        let plan = self.deps.planner.generate_plan(query_text, candidates).await?;
        if plan.steps.is_empty() {
            return Err(ResolutionError::PlanningFailure(
                "plan contains no steps".to_string(),
            ));
        }
        Ok(plan)
    }

    async fn checkpoint(&self, incident_number: &str, state: &RunState) -> Result<(), ResolutionError> {
        self.deps
            .traces
            .update(incident_number, state.plan.as_ref(), &state.trace)
            .await
            .map_err(|e| ResolutionError::upstream(format!("trace checkpoint failed: {e}")))
    }

    async fn run_step(
        &self,
        step_number: usize,
        step: &ResolvedStep,
        context: &ResolutionContext,
    ) -> StepOutcome {
        let mut record = StepRecord {
            step_number,
            description: step.description.clone(),
            resolved_script_name: step.script_name().map(str::to_string),
            resolved_script_id: step.script_id_label(),
            extracted_parameters: ParamValues::new(),
            status: StepStatus::Skipped,
            output: String::new(),
        };

        let script_name = match &step.binding {
            StepBinding::Manual => {
                record.output = "Manual step: no tool specified.".to_string();
                return continue_with(record, context.clone());
            }
            StepBinding::Unmatched { .. } => {
                record.output = format!(
                    "Manual step: no registered script matches tool '{}'.",
                    step.tool.as_deref().unwrap_or_default()
                );
                return continue_with(record, context.clone());
            }
            StepBinding::Bound { script_name, .. } => script_name,
        };

        let script = match self.deps.registry.get_script_by_name(script_name).await {
            Ok(Some(script)) => script,
            Ok(None) => {
                return halt(
                    record,
                    ResolutionError::ResolutionFailure(format!(
                        "Script '{script_name}' not found in registry."
                    )),
                );
            }
            Err(e) => return halt(record, ResolutionError::upstream(e)),
        };
        let Some(tool) = execution_tool(&script) else {
            return halt(
                record,
                ResolutionError::ResolutionFailure(format!(
                    "Script '{script_name}' has no execution tool type."
                )),
            );
        };

        let params = if script.params.is_empty() {
            ParamValues::new()
        } else {
            match self.deps.extractor.extract(context, &script.params).await {
                Ok(values) => values,
                Err(e) => return halt(record, e),
            }
        };
        record.extracted_parameters = params.clone();

        let missing = script.missing_required(&params);
        if !missing.is_empty() {
            return halt(record, ResolutionError::ParameterFailure { missing });
        }

        let result = self.deps.executor.run(tool, &script, &params).await;
        if result.is_success() {
            record.status = StepStatus::Success;
            let next = context.with_output(&script.name, &result.output);
            record.output = result.output;
            return continue_with(record, next);
        }
        record.status = StepStatus::Error;
        record.output = result.output.clone();
        StepOutcome {
            record,
            flow: StepFlow::Halt(ResolutionError::ExecutionFailure(result.output)),
        }
    }

    /// Retrieve, plan and bind scripts without executing or persisting.
    pub async fn preview(
        &self,
        short_description: &str,
        description: Option<&str>,
    ) -> Result<PlanPreview, ResolutionError> {
        let incident = Incident {
            id: 0,
            number: String::new(),
            short_description: short_description.to_string(),
            description: description.map(str::to_string),
            cmdb_ci: None,
            business_service: None,
            priority: None,
            impact: None,
            urgency: None,
            assignment_group: None,
            status: IncidentStatus::New,
        };
        let (query_text, candidates) = self.retrieve(&incident).await?;
        let plan = self.plan(&query_text, &candidates).await?;
        let scripts = self
            .deps
            .registry
            .list_scripts()
            .await
            .map_err(ResolutionError::upstream)?;
        let steps = self.deps.script_resolver.resolve(&plan.steps, &scripts);
        Ok(PlanPreview {
            candidates,
            plan,
            steps,
        })
    }
}

fn continue_with(record: StepRecord, next: ResolutionContext) -> StepOutcome {
    StepOutcome {
        record,
        flow: StepFlow::Continue(next),
    }
}

fn halt(mut record: StepRecord, error: ResolutionError) -> StepOutcome {
    record.status = StepStatus::Error;
    record.output = error.to_string();
    StepOutcome {
        record,
        flow: StepFlow::Halt(error),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::index::{MemoryIndex, Point, PointId, VectorIndex};
    use crate::model::PlanStep;
    use crate::retrieval::tests::{
        COLLECTION, FixedFeedback, POLICY, ScriptedHyde, TableEmbedder, procedure,
    };
    use crate::store::sample_incident;
    use crate::thresholds::{ThresholdCache, Thresholds};
    use async_trait::async_trait;
    use iira_tools::{Script, ScriptParam, ShellPolicy, ShellScriptTool};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    pub(crate) struct FixedPlanner {
        pub plan: Result<Plan, String>,
    }

    #[async_trait]
    impl PlanGenerator for FixedPlanner {
        async fn generate_plan(
            &self,
            _query: &str,
            _candidates: &[ScoredProcedure],
        ) -> Result<Plan, ResolutionError> {
            self.plan
                .clone()
                .map_err(ResolutionError::PlanningFailure)
        }
    }

    /// Hands back the same values every call and remembers each context.
    #[derive(Default)]
    pub(crate) struct RecordingExtractor {
        pub values: ParamValues,
        pub seen: Mutex<Vec<ResolutionContext>>,
    }

    #[async_trait]
    impl ParameterExtractor for RecordingExtractor {
        async fn extract(
            &self,
            context: &ResolutionContext,
            params: &[ScriptParam],
        ) -> Result<ParamValues, ResolutionError> {
            self.seen.lock().unwrap().push(context.clone());
            Ok(self
                .values
                .iter()
                .filter(|(k, _)| params.iter().any(|p| &p.param_name == *k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect())
        }
    }

    #[derive(Default)]
    pub(crate) struct MemoryRegistry {
        pub scripts: Vec<Script>,
        /// Names listed but not retrievable, to mimic a registry that changed mid-run.
        pub vanished: Vec<String>,
    }

    #[async_trait]
    impl ScriptRegistry for MemoryRegistry {
        async fn list_scripts(&self) -> anyhow::Result<Vec<Script>> {
            Ok(self.scripts.clone())
        }

        async fn get_script_by_name(&self, name: &str) -> anyhow::Result<Option<Script>> {
            if self.vanished.iter().any(|v| v == name) {
                return Ok(None);
            }
            Ok(self.scripts.iter().find(|s| s.name == name).cloned())
        }
    }

    /// Keeps every checkpoint so tests can inspect what was durable when.
    #[derive(Default)]
    pub(crate) struct RecordingTraces {
        pub inserted: Mutex<Vec<String>>,
        pub checkpoints: Mutex<Vec<(Option<Plan>, Vec<StepRecord>)>>,
        pub fail_updates: bool,
    }

    #[async_trait]
    impl TraceStore for RecordingTraces {
        async fn insert_initial(&self, incident: &Incident) -> anyhow::Result<i64> {
            let mut inserted = self.inserted.lock().unwrap();
            inserted.push(incident.number.clone());
            Ok(inserted.len() as i64)
        }

        async fn update(
            &self,
            _incident_number: &str,
            plan: Option<&Plan>,
            trace: &[StepRecord],
        ) -> anyhow::Result<()> {
            if self.fail_updates {
                anyhow::bail!("disk I/O error");
            }
            self.checkpoints
                .lock()
                .unwrap()
                .push((plan.cloned(), trace.to_vec()));
            Ok(())
        }
    }

    pub(crate) fn shell_script(id: i64, name: &str, body: &str, params: Vec<ScriptParam>) -> Script {
        Script {
            id,
            name: name.to_string(),
            description: format!("{name} script"),
            tags: vec![],
            content: format!("#!/bin/sh\n{body}\n"),
            script_type: Some("shell_script".to_string()),
            params,
        }
    }

    pub(crate) fn required(name: &str) -> ScriptParam {
        ScriptParam {
            param_name: name.to_string(),
            param_type: "string".to_string(),
            required: true,
            default_value: None,
        }
    }

    pub(crate) fn plan(tools: &[Option<&str>]) -> Plan {
        Plan {
            steps: tools
                .iter()
                .enumerate()
                .map(|(i, t)| PlanStep {
                    description: format!("step {}", i + 1),
                    tool: t.map(str::to_string),
                })
                .collect(),
        }
    }

    pub(crate) const INCIDENT_TEXT: &str = "Web server down nginx on web-01 is not responding";

    pub(crate) struct Fixture {
        pub agent: ResolverAgent,
        pub traces: Arc<RecordingTraces>,
        pub extractor: Arc<RecordingExtractor>,
        pub hyde: Arc<ScriptedHyde>,
        pub scratch: tempfile::TempDir,
    }

    pub(crate) struct FixtureBuilder {
        pub indexed: bool,
        pub plan: Result<Plan, String>,
        pub scripts: Vec<Script>,
        pub vanished: Vec<String>,
        pub values: ParamValues,
        pub fail_updates: bool,
    }

    impl Default for FixtureBuilder {
        fn default() -> Self {
            Self {
                indexed: true,
                plan: Ok(plan(&[None])),
                scripts: Vec::new(),
                vanished: Vec::new(),
                values: ParamValues::new(),
                fail_updates: false,
            }
        }
    }

    impl FixtureBuilder {
        pub async fn build(self) -> Fixture {
            let index = Arc::new(MemoryIndex::new());
            if self.indexed {
                index
                    .upsert(
                        COLLECTION,
                        vec![Point {
                            id: PointId::Num(1),
                            vector: vec![1.0, 0.0],
                            payload: serde_json::to_value(procedure(
                                "",
                                "Web server down",
                                &["restart_web_server"],
                            ))
                            .unwrap(),
                        }],
                    )
                    .await
                    .unwrap();
            }
            let embedder = Arc::new(TableEmbedder {
                vectors: [
                    (INCIDENT_TEXT.to_string(), vec![1.0, 0.0]),
                    ("HYPO".to_string(), vec![1.0, 0.0]),
                ]
                .into_iter()
                .collect(),
            });
            let hyde = Arc::new(ScriptedHyde::returning(Some("HYPO")));
            let retrieval = Arc::new(RetrievalEngine::new(
                embedder,
                index,
                Arc::new(FixedFeedback::default()),
                hyde.clone(),
                Arc::new(ThresholdCache::fixed(Thresholds {
                    initial: 0.55,
                    hyde: 0.5,
                })),
                COLLECTION,
                10,
                POLICY,
            ));
            let scratch = tempfile::tempdir().unwrap();
            let executor = Arc::new(ExecutionAgent::new(ShellScriptTool::new(ShellPolicy {
                timeout: Some(Duration::from_secs(10)),
                scratch_dir: scratch.path().to_path_buf(),
            })));
            let traces = Arc::new(RecordingTraces {
                fail_updates: self.fail_updates,
                ..Default::default()
            });
            let extractor = Arc::new(RecordingExtractor {
                values: self.values,
                ..Default::default()
            });
            let agent = ResolverAgent::new(ResolverDeps {
                retrieval,
                planner: Arc::new(FixedPlanner { plan: self.plan }),
                extractor: extractor.clone(),
                registry: Arc::new(MemoryRegistry {
                    scripts: self.scripts,
                    vanished: self.vanished,
                }),
                traces: traces.clone(),
                executor,
                script_resolver: ScriptResolver::new(0.5),
                top_k: 3,
            });
            Fixture {
                agent,
                traces,
                extractor,
                hyde,
                scratch,
            }
        }
    }

    fn statuses(trace: &[StepRecord]) -> Vec<StepStatus> {
        trace.iter().map(|r| r.status).collect()
    }

    #[tokio::test]
    async fn empty_index_ends_in_sop_not_found() {
        let f = FixtureBuilder {
            indexed: false,
            ..Default::default()
        }
        .build()
        .await;
        let out = f.agent.run(&sample_incident("INC1")).await;
        assert_eq!(out.status, ResolutionStatus::SopNotFound);
        assert!(out.plan.is_none());
        assert!(out.trace.is_empty());
        assert_eq!(f.hyde.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(*f.traces.inserted.lock().unwrap(), ["INC1"]);
        assert!(f.traces.checkpoints.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn all_steps_succeed_and_outputs_flow_forward() {
        let f = FixtureBuilder {
            plan: Ok(plan(&[Some("check_disk"), Some("report-usage")])),
            scripts: vec![
                shell_script(1, "check_disk", "echo \"disk ok on $1\"", vec![required("HOSTNAME")]),
                shell_script(2, "report_usage", "echo \"reported $1\"", vec![required("HOSTNAME")]),
            ],
            values: ParamValues::from([("HOSTNAME".to_string(), json!("web-01"))]),
            ..Default::default()
        }
        .build()
        .await;

        let out = f.agent.run(&sample_incident("INC2")).await;
        assert_eq!(out.status, ResolutionStatus::Resolved);
        assert_eq!(statuses(&out.trace), [StepStatus::Success, StepStatus::Success]);
        assert_eq!(out.trace[0].output, "disk ok on web-01");
        assert_eq!(out.trace[1].resolved_script_name.as_deref(), Some("report_usage"));
        assert_eq!(out.trace[1].resolved_script_id.as_deref(), Some("2"));
        assert_eq!(out.trace[0].extracted_parameters["HOSTNAME"], json!("web-01"));

        let seen = f.extractor.seen.lock().unwrap();
        assert!(seen[0].get("check_disk_output").is_none());
        assert_eq!(seen[1].get("check_disk_output"), Some(&json!("disk ok on web-01")));
        assert_eq!(seen[1].get("short_description"), Some(&json!("Web server down")));
    }

    #[tokio::test]
    async fn manual_and_unmatched_steps_are_skipped_without_halting() {
        let f = FixtureBuilder {
            plan: Ok(plan(&[None, Some("page_oncall"), Some("check_disk")])),
            scripts: vec![shell_script(1, "check_disk", "echo fine", vec![])],
            ..Default::default()
        }
        .build()
        .await;

        let out = f.agent.run(&sample_incident("INC3")).await;
        assert_eq!(out.status, ResolutionStatus::Resolved);
        assert_eq!(
            statuses(&out.trace),
            [StepStatus::Skipped, StepStatus::Skipped, StepStatus::Success]
        );
        assert_eq!(out.trace[0].resolved_script_id, None);
        assert_eq!(out.trace[1].resolved_script_id.as_deref(), Some("Not Found"));
        assert_eq!(out.trace[1].resolved_script_name, None);
    }

    #[tokio::test]
    async fn null_required_parameter_halts_with_missing_names() {
        let f = FixtureBuilder {
            plan: Ok(plan(&[Some("restart_web_server"), Some("check_disk")])),
            scripts: vec![
                shell_script(1, "restart_web_server", "echo restarted", vec![required("HOSTNAME")]),
                shell_script(2, "check_disk", "echo fine", vec![]),
            ],
            values: ParamValues::from([("HOSTNAME".to_string(), json!(null))]),
            ..Default::default()
        }
        .build()
        .await;

        let out = f.agent.run(&sample_incident("INC4")).await;
        assert_eq!(out.status, ResolutionStatus::Error);
        assert_eq!(out.trace.len(), 1);
        assert_eq!(out.trace[0].status, StepStatus::Error);
        assert_eq!(
            out.trace[0].output,
            "Failed to extract required parameters: HOSTNAME."
        );
        assert!(out.error.unwrap().contains("HOSTNAME"));
    }

    #[tokio::test]
    async fn execution_failure_halts_before_later_steps_run() {
        let scratch_marker = tempfile::tempdir().unwrap();
        let marker = scratch_marker.path().join("step3-ran");
        let f = FixtureBuilder {
            plan: Ok(plan(&[Some("check_disk"), Some("restart_web_server"), Some("touch_marker")])),
            scripts: vec![
                shell_script(1, "check_disk", "echo fine", vec![]),
                shell_script(2, "restart_web_server", "echo partial\necho 'nginx: bind failed' >&2\nexit 1", vec![]),
                shell_script(3, "touch_marker", &format!("touch {}", marker.display()), vec![]),
            ],
            ..Default::default()
        }
        .build()
        .await;

        let out = f.agent.run(&sample_incident("INC5")).await;
        assert_eq!(out.status, ResolutionStatus::Error);
        assert_eq!(statuses(&out.trace), [StepStatus::Success, StepStatus::Error]);
        assert_eq!(out.trace[1].output, "partial\nnginx: bind failed");
        assert!(!marker.exists());
        assert!(f.scratch.path().read_dir().unwrap().next().is_none());
    }

    #[tokio::test]
    async fn every_step_is_checkpointed_as_it_completes() {
        let f = FixtureBuilder {
            plan: Ok(plan(&[Some("check_disk"), None, Some("restart_web_server")])),
            scripts: vec![
                shell_script(1, "check_disk", "echo fine", vec![]),
                shell_script(2, "restart_web_server", "exit 2", vec![]),
            ],
            ..Default::default()
        }
        .build()
        .await;

        let out = f.agent.run(&sample_incident("INC6")).await;
        let checkpoints = f.traces.checkpoints.lock().unwrap();
        let lengths: Vec<_> = checkpoints.iter().map(|(_, t)| t.len()).collect();
        assert_eq!(lengths, [0, 1, 2, 3]);
        for (plan, trace) in checkpoints.iter() {
            assert_eq!(plan.as_ref(), out.plan.as_ref());
            assert_eq!(trace.as_slice(), &out.trace[..trace.len()]);
        }
        for (i, record) in out.trace.iter().enumerate() {
            assert_eq!(record.step_number, i + 1);
        }
    }

    #[tokio::test]
    async fn script_gone_from_registry_is_a_resolution_error() {
        let f = FixtureBuilder {
            plan: Ok(plan(&[Some("check_disk"), Some("check_disk")])),
            scripts: vec![shell_script(1, "check_disk", "echo fine", vec![])],
            vanished: vec!["check_disk".to_string()],
            ..Default::default()
        }
        .build()
        .await;

        let out = f.agent.run(&sample_incident("INC7")).await;
        assert_eq!(out.status, ResolutionStatus::Error);
        assert_eq!(out.trace.len(), 1);
        assert!(out.trace[0].output.contains("not found in registry"));
    }

    #[tokio::test]
    async fn script_without_tool_type_is_a_resolution_error() {
        let mut script = shell_script(1, "check_disk", "echo fine", vec![]);
        script.script_type = None;
        let f = FixtureBuilder {
            plan: Ok(plan(&[Some("check_disk")])),
            scripts: vec![script],
            ..Default::default()
        }
        .build()
        .await;

        let out = f.agent.run(&sample_incident("INC8")).await;
        assert_eq!(out.status, ResolutionStatus::Error);
        assert!(out.trace[0].output.contains("no execution tool type"));
    }

    #[tokio::test]
    async fn empty_or_unusable_plan_is_an_error_without_steps() {
        for planned in [Ok(Plan::default()), Err("model said no".to_string())] {
            let f = FixtureBuilder {
                plan: planned,
                ..Default::default()
            }
            .build()
            .await;
            let out = f.agent.run(&sample_incident("INC9")).await;
            assert_eq!(out.status, ResolutionStatus::Error);
            assert!(out.trace.is_empty());
            assert!(f.traces.checkpoints.lock().unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn failed_checkpoint_stops_the_run() {
        let scratch_marker = tempfile::tempdir().unwrap();
        let marker = scratch_marker.path().join("ran");
        let f = FixtureBuilder {
            plan: Ok(plan(&[Some("touch_marker")])),
            scripts: vec![shell_script(1, "touch_marker", &format!("touch {}", marker.display()), vec![])],
            fail_updates: true,
            ..Default::default()
        }
        .build()
        .await;

        let out = f.agent.run(&sample_incident("INC10")).await;
        assert_eq!(out.status, ResolutionStatus::Error);
        assert!(out.error.unwrap().contains("checkpoint"));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn preview_binds_without_executing() {
        let scratch_marker = tempfile::tempdir().unwrap();
        let marker = scratch_marker.path().join("ran");
        let f = FixtureBuilder {
            plan: Ok(plan(&[Some("restart-webserver")])),
            scripts: vec![shell_script(
                4,
                "restart_web_server",
                &format!("touch {}", marker.display()),
                vec![],
            )],
            ..Default::default()
        }
        .build()
        .await;

        let preview = f
            .agent
            .preview("Web server down", Some("nginx on web-01 is not responding"))
            .await
            .unwrap();
        assert_eq!(preview.candidates[0].procedure.title, "Web server down");
        assert!(matches!(
            preview.steps[0].binding,
            StepBinding::Bound { script_id: 4, .. }
        ));
        assert!(!marker.exists());
        assert!(f.traces.inserted.lock().unwrap().is_empty());
    }

    #[test]
    fn status_maps_to_incident_vocabulary() {
        assert_eq!(
            ResolutionStatus::SopNotFound.incident_status(),
            IncidentStatus::SopNotFound
        );
        let json = serde_json::to_value(ResolutionStatus::SopNotFound).unwrap();
        assert_eq!(json, json!("SOP not found"));
    }
}
