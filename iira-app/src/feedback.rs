//! User feedback on retrieval results and the counters that re-rank them.

use crate::config::FeedbackConfig;
use crate::model::ScoredProcedure;
use crate::store::{Database, FeedbackAnalysis};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const CORRECT_COUNT: &str = "correct_count";
pub const INCORRECT_COUNT: &str = "incorrect_count";

/// Lookup key for the counters of one incident text.
pub fn fingerprint(short_description: &str, description: Option<&str>) -> String {
    let text = format!("{}::{}", short_description, description.unwrap_or_default())
        .trim()
        .to_lowercase();
    let digest = Sha256::digest(text.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("feedback:desc_hash:{}", &hex[..16])
}

fn correct_field(agent_id: &str) -> String {
    format!("correct_agent:{agent_id}")
}

fn incorrect_field(agent_id: &str) -> String {
    format!("incorrect_recommendation:{agent_id}")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeedbackSummary {
    pub counters: BTreeMap<String, i64>,
    pub last_feedback_ts: Option<String>,
}

impl FeedbackSummary {
    pub fn count(&self, field: &str) -> i64 {
        self.counters.get(field).copied().unwrap_or(0)
    }

    pub fn correct_for(&self, agent_id: &str) -> i64 {
        self.count(&correct_field(agent_id))
    }

    pub fn incorrect_for(&self, agent_id: &str) -> i64 {
        self.count(&incorrect_field(agent_id))
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedbackKind {
    Correct,
    Incorrect,
}

impl FeedbackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Correct => "Correct",
            Self::Incorrect => "Incorrect",
        }
    }
}

/// Counter increments applied together, plus the key's new TTL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterBatch {
    pub increments: Vec<(String, i64)>,
    pub ttl: Duration,
}

impl CounterBatch {
    pub fn for_vote(kind: FeedbackKind, agent_id: Option<&str>, ttl: Duration) -> Self {
        let agent_id = agent_id.map(str::trim).filter(|id| !id.is_empty());
        let mut increments = Vec::with_capacity(2);
        match kind {
            FeedbackKind::Correct => {
                increments.push((CORRECT_COUNT.to_string(), 1));
                if let Some(id) = agent_id {
                    increments.push((correct_field(id), 1));
                }
            }
            FeedbackKind::Incorrect => {
                increments.push((INCORRECT_COUNT.to_string(), 1));
                if let Some(id) = agent_id {
                    increments.push((incorrect_field(id), 1));
                }
            }
        }
        Self { increments, ttl }
    }
}

/// Per-fingerprint vote counters with expiry.
#[async_trait]
pub trait FeedbackStore: Send + Sync {
    /// Counters for `key`; empty when the key is unknown or expired.
    async fn get_counters(&self, key: &str) -> anyhow::Result<FeedbackSummary>;

    /// Apply every increment, stamp the time and reset the TTL as one unit.
    async fn apply_batch(&self, key: &str, batch: &CounterBatch) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RerankPolicy {
    pub margin: i64,
    pub boost: f32,
    pub penalty: f32,
}

impl From<&FeedbackConfig> for RerankPolicy {
    fn from(cfg: &FeedbackConfig) -> Self {
        Self {
            margin: cfg.confirmation_margin,
            boost: cfg.boost,
            penalty: cfg.penalty,
        }
    }
}

/// Adjust scores by past votes for this incident text, clamp to `[0, 1]`
/// and re-sort descending. Equal scores keep their incoming order.
pub fn rerank(
    mut candidates: Vec<ScoredProcedure>,
    summary: &FeedbackSummary,
    policy: RerankPolicy,
) -> Vec<ScoredProcedure> {
    if !summary.is_empty() {
        for c in &mut candidates {
            let correct = summary.correct_for(&c.procedure.id);
            let incorrect = summary.incorrect_for(&c.procedure.id);
            let before = c.score;
            if correct - incorrect > policy.margin {
                c.score += policy.boost;
            } else if incorrect - correct > policy.margin {
                c.score -= policy.penalty;
            }
            if c.score != before {
                tracing::debug!(
                    procedure_id = %c.procedure.id,
                    correct,
                    incorrect,
                    before,
                    after = c.score,
                    "feedback adjusted score"
                );
            }
        }
    }
    for c in &mut candidates {
        c.score = clamp_score(c.score);
    }
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    candidates
}

fn clamp_score(score: f32) -> f32 {
    if score.is_nan() {
        return 0.0;
    }
    score.clamp(0.0, 1.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackSubmission {
    pub incident_short_description: String,
    #[serde(default)]
    pub incident_description: Option<String>,
    #[serde(default)]
    pub incident_number: Option<String>,
    #[serde(default)]
    pub recommended_agent_id: Option<String>,
    #[serde(default)]
    pub recommended_agent_title: Option<String>,
    #[serde(default)]
    pub search_score: Option<f64>,
    pub feedback_type: FeedbackKind,
    #[serde(default)]
    pub correct_agent_id: Option<String>,
    #[serde(default)]
    pub correct_agent_title: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl FeedbackSubmission {
    /// The procedure whose counter a vote moves: the confirmed one for
    /// `Correct`, the rejected recommendation for `Incorrect`.
    pub fn counted_agent(&self) -> Option<&str> {
        match self.feedback_type {
            FeedbackKind::Correct => self.correct_agent_id.as_deref(),
            FeedbackKind::Incorrect => self.recommended_agent_id.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WarmReport {
    pub candidates: usize,
    pub cached: usize,
}

pub struct FeedbackService {
    db: Database,
    store: Arc<dyn FeedbackStore>,
    config: FeedbackConfig,
}

impl FeedbackService {
    pub fn new(db: Database, store: Arc<dyn FeedbackStore>, config: FeedbackConfig) -> Self {
        Self { db, store, config }
    }

    /// Log the vote and move the counters. Returns the feedback row id.
    #[tracing::instrument(level = "info", skip_all, fields(feedback_type = submission.feedback_type.as_str()))]
    pub async fn submit(&self, submission: &FeedbackSubmission) -> anyhow::Result<i64> {
        if submission.incident_short_description.trim().is_empty() {
            anyhow::bail!("incident_short_description is required");
        }
        let id = self.db.record_feedback(submission).await?;
        let key = fingerprint(
            &submission.incident_short_description,
            submission.incident_description.as_deref(),
        );
        let batch = CounterBatch::for_vote(
            submission.feedback_type,
            submission.counted_agent(),
            Duration::from_secs(self.config.ttl_seconds),
        );
        self.store.apply_batch(&key, &batch).await?;
        tracing::info!(feedback_id = id, key = %key, "feedback recorded");
        Ok(id)
    }

    pub async fn analyze(&self) -> anyhow::Result<FeedbackAnalysis> {
        self.db.analyze_feedback().await
    }

    /// Seed counters for incident texts with enough confirmed votes.
    pub async fn warm(&self) -> anyhow::Result<WarmReport> {
        let candidates = self
            .db
            .warm_candidates(self.config.warm_confidence_threshold)
            .await?;
        let ttl = Duration::from_secs(self.config.warm_ttl_seconds);
        let mut cached = 0;
        for c in &candidates {
            let key = fingerprint(&c.short_description, c.description.as_deref());
            let batch = CounterBatch::for_vote(FeedbackKind::Correct, Some(&c.agent_id), ttl);
            match self.store.apply_batch(&key, &batch).await {
                Ok(()) => cached += 1,
                Err(e) => tracing::warn!(key = %key, error = %e, "cache warm entry failed"),
            }
        }
        tracing::info!(candidates = candidates.len(), cached, "feedback cache warmed");
        Ok(WarmReport {
            candidates: candidates.len(),
            cached,
        })
    }
}
