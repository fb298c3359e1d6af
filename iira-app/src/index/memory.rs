use super::{Point, PointId, ScoredPoint, StoredPoint, VectorIndex};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Brute-force cosine index kept in process memory. Points keep insertion
/// order, so ties rank the same way on every run.
#[derive(Default)]
pub struct MemoryIndex {
    collections: RwLock<HashMap<String, Vec<Point>>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

pub(crate) fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0_f32;
    let mut na = 0.0_f32;
    let mut nb = 0.0_f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn ensure_collection(&self, collection: &str, _dimension: usize) -> anyhow::Result<()> {
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default();
        Ok(())
    }

    async fn upsert(&self, collection: &str, points: Vec<Point>) -> anyhow::Result<()> {
        let mut guard = self.collections.write().await;
        let stored = guard.entry(collection.to_string()).or_default();
        for point in points {
            match stored.iter_mut().find(|p| p.id == point.id) {
                Some(existing) => *existing = point,
                None => stored.push(point),
            }
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
    ) -> anyhow::Result<Vec<ScoredPoint>> {
        let guard = self.collections.read().await;
        let Some(stored) = guard.get(collection) else {
            return Ok(Vec::new());
        };
        let mut scored: Vec<ScoredPoint> = stored
            .iter()
            .map(|p| ScoredPoint {
                id: p.id.clone(),
                score: cosine(vector, &p.vector),
                payload: p.payload.clone(),
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn delete(&self, collection: &str, ids: &[PointId]) -> anyhow::Result<()> {
        if let Some(stored) = self.collections.write().await.get_mut(collection) {
            stored.retain(|p| !ids.contains(&p.id));
        }
        Ok(())
    }

    async fn scroll_all(&self, collection: &str) -> anyhow::Result<Vec<StoredPoint>> {
        let guard = self.collections.read().await;
        Ok(guard
            .get(collection)
            .map(|stored| {
                stored
                    .iter()
                    .map(|p| StoredPoint {
                        id: p.id.clone(),
                        payload: p.payload.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn point(id: u64, vector: Vec<f32>) -> Point {
        Point {
            id: PointId::Num(id),
            vector,
            payload: json!({ "n": id }),
        }
    }

    #[tokio::test]
    async fn search_ranks_by_cosine_and_keeps_insertion_order_on_ties() {
        let index = MemoryIndex::new();
        index
            .upsert(
                "c",
                vec![
                    point(1, vec![0.0, 1.0]),
                    point(2, vec![1.0, 0.0]),
                    point(3, vec![2.0, 0.0]),
                ],
            )
            .await
            .unwrap();
        let hits = index.search("c", &[1.0, 0.0], 2).await.unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.id.clone()).collect();
        assert_eq!(ids, [PointId::Num(2), PointId::Num(3)]);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn upsert_replaces_and_delete_removes() {
        let index = MemoryIndex::new();
        index.upsert("c", vec![point(1, vec![1.0, 0.0])]).await.unwrap();
        index.upsert("c", vec![point(1, vec![0.0, 1.0])]).await.unwrap();
        assert_eq!(index.scroll_all("c").await.unwrap().len(), 1);
        let hit = &index.search("c", &[0.0, 1.0], 1).await.unwrap()[0];
        assert!((hit.score - 1.0).abs() < 1e-6);

        index.delete("c", &[PointId::Num(1)]).await.unwrap();
        assert!(index.scroll_all("c").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_collection_searches_empty() {
        let index = MemoryIndex::new();
        assert!(index.search("nope", &[1.0], 10).await.unwrap().is_empty());
    }

    #[test]
    fn cosine_handles_degenerate_vectors() {
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine(&[1.0], &[1.0, 0.0]), 0.0);
    }
}
