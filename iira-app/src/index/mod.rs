//! Nearest-neighbour search over procedure and script embeddings.

mod memory;
mod qdrant;

pub use memory::MemoryIndex;
pub use qdrant::QdrantIndex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Qdrant accepts unsigned integers or UUID strings as point ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PointId {
    Num(u64),
    Uuid(String),
}

impl std::fmt::Display for PointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Num(n) => write!(f, "{n}"),
            Self::Uuid(s) => f.write_str(s),
        }
    }
}

impl PointId {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match raw.parse::<u64>() {
            Ok(n) => Self::Num(n),
            Err(_) => Self::Uuid(raw.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub id: PointId,
    pub vector: Vec<f32>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScoredPoint {
    pub id: PointId,
    pub score: f32,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StoredPoint {
    pub id: PointId,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// A vector store with named collections, cosine similarity.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn ensure_collection(&self, collection: &str, dimension: usize) -> anyhow::Result<()>;
    async fn upsert(&self, collection: &str, points: Vec<Point>) -> anyhow::Result<()>;
    /// Up to `limit` points, best first. A missing collection yields no points.
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
    ) -> anyhow::Result<Vec<ScoredPoint>>;
    async fn delete(&self, collection: &str, ids: &[PointId]) -> anyhow::Result<()>;
    async fn scroll_all(&self, collection: &str) -> anyhow::Result<Vec<StoredPoint>>;
}
