//! Two-stage procedure retrieval.
//!
//! Stage 1 embeds the incident text, re-ranks the nearest procedures by past
//! feedback and keeps those above the initial threshold. When nothing clears
//! it, stage 2 embeds an LLM-written hypothetical procedure instead and
//! applies the more lenient HyDE threshold. An empty result is a normal
//! outcome.

use crate::embedding::Embedder;
use crate::error::ResolutionError;
use crate::feedback::{FeedbackStore, FeedbackSummary, RerankPolicy, fingerprint, rerank};
use crate::index::VectorIndex;
use crate::model::{Procedure, ScoredProcedure};
use crate::planner::HydeWriter;
use crate::thresholds::ThresholdCache;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct SearchQuery<'a> {
    pub text: &'a str,
    pub aux: Option<&'a str>,
    pub top_k: usize,
    /// `false` returns the ranked candidates regardless of score.
    pub apply_threshold: bool,
}

impl SearchQuery<'_> {
    fn combined(&self) -> String {
        match self.aux.map(str::trim).filter(|a| !a.is_empty()) {
            Some(aux) => format!("{} {aux}", self.text.trim()),
            None => self.text.trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStage {
    Initial,
    Hyde,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchOutcome {
    /// Stage that produced `results`; `None` when both came back empty.
    pub stage: Option<SearchStage>,
    pub results: Vec<ScoredProcedure>,
}

impl SearchOutcome {
    fn empty() -> Self {
        Self {
            stage: None,
            results: Vec::new(),
        }
    }
}

pub struct RetrievalEngine {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    feedback: Arc<dyn FeedbackStore>,
    hyde: Arc<dyn HydeWriter>,
    thresholds: Arc<ThresholdCache>,
    collection: String,
    fetch_k: usize,
    rerank: RerankPolicy,
}

impl RetrievalEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        feedback: Arc<dyn FeedbackStore>,
        hyde: Arc<dyn HydeWriter>,
        thresholds: Arc<ThresholdCache>,
        collection: impl Into<String>,
        fetch_k: usize,
        rerank: RerankPolicy,
    ) -> Self {
        Self {
            embedder,
            index,
            feedback,
            hyde,
            thresholds,
            collection: collection.into(),
            fetch_k,
            rerank,
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(top_k = query.top_k, apply_threshold = query.apply_threshold))]
    pub async fn search(&self, query: &SearchQuery<'_>) -> Result<SearchOutcome, ResolutionError> {
        let top_k = query.top_k.max(1);
        let text = query.combined();
        if text.is_empty() {
            return Ok(SearchOutcome::empty());
        }
        let thresholds = self.thresholds.get().await;
        let summary = self.feedback_for(query).await;

        let vector = self
            .embedder
            .embed(&text)
            .await
            .map_err(ResolutionError::upstream)?;
        let ranked = self.ranked(&vector, top_k, &summary).await?;
        let initial = select(ranked, query.apply_threshold.then_some(thresholds.initial), top_k);
        if !initial.is_empty() {
            tracing::info!(
                results = initial.len(),
                best = initial[0].score,
                threshold = thresholds.initial,
                "stage 1 search matched"
            );
            return Ok(SearchOutcome {
                stage: Some(SearchStage::Initial),
                results: initial,
            });
        }

        tracing::info!(threshold = thresholds.initial, "stage 1 found nothing; trying hypothetical procedure");
        let hyde_text = match self.hyde.hypothetical_procedure(&text).await {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(error = %e, "hypothetical procedure generation failed");
                return Ok(SearchOutcome::empty());
            }
        };
        let vector = match self.embedder.embed(&hyde_text).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "hypothetical procedure embedding failed");
                return Ok(SearchOutcome::empty());
            }
        };
        let ranked = match self.ranked(&vector, top_k, &summary).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "stage 2 index search failed");
                return Ok(SearchOutcome::empty());
            }
        };
        let results = select(ranked, query.apply_threshold.then_some(thresholds.hyde), top_k);
        tracing::info!(results = results.len(), threshold = thresholds.hyde, "stage 2 search finished");
        if results.is_empty() {
            return Ok(SearchOutcome::empty());
        }
        Ok(SearchOutcome {
            stage: Some(SearchStage::Hyde),
            results,
        })
    }

    async fn feedback_for(&self, query: &SearchQuery<'_>) -> FeedbackSummary {
        let key = fingerprint(query.text, query.aux);
        match self.feedback.get_counters(&key).await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "feedback counters unavailable; ranking by similarity only");
                FeedbackSummary::default()
            }
        }
    }

    async fn ranked(
        &self,
        vector: &[f32],
        top_k: usize,
        summary: &FeedbackSummary,
    ) -> Result<Vec<ScoredProcedure>, ResolutionError> {
        let hits = self
            .index
            .search(&self.collection, vector, self.fetch_k.max(top_k))
            .await
            .map_err(ResolutionError::upstream)?;
        let candidates = hits
            .into_iter()
            .filter_map(|hit| {
                let id = hit.id.to_string();
                match serde_json::from_value::<Procedure>(hit.payload) {
                    Ok(mut procedure) => {
                        procedure.id = id;
                        Some(ScoredProcedure {
                            procedure,
                            score: hit.score,
                        })
                    }
                    Err(e) => {
                        tracing::warn!(point_id = %id, error = %e, "skipping malformed procedure payload");
                        None
                    }
                }
            })
            .collect();
        Ok(rerank(candidates, summary, self.rerank))
    }
}

fn select(ranked: Vec<ScoredProcedure>, threshold: Option<f32>, top_k: usize) -> Vec<ScoredProcedure> {
    ranked
        .into_iter()
        .filter(|c| threshold.is_none_or(|t| c.score >= t))
        .take(top_k)
        .collect()
}
