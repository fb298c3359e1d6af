use super::{Point, PointId, ScoredPoint, StoredPoint, VectorIndex};
use async_trait::async_trait;
use iira_llm::RetryPolicy;
use qdrant_client::Qdrant;
use qdrant_client::qdrant::{
    self, CreateCollectionBuilder, DeletePointsBuilder, Distance, ListValue, PointStruct,
    PointsIdsList, ScrollPointsBuilder, SearchPointsBuilder, Struct, UpsertPointsBuilder,
    VectorParamsBuilder, point_id::PointIdOptions, value::Kind,
};
use serde_json::{Map, Number, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const SCROLL_PAGE: u32 = 256;

/// Qdrant over its gRPC API.
#[derive(Clone)]
pub struct QdrantIndex {
    client: Arc<Qdrant>,
    url: String,
    retry: RetryPolicy,
}

impl QdrantIndex {
    pub fn new(
        url: &str,
        api_key: Option<String>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> anyhow::Result<Self> {
        let url = url.trim_end_matches('/').to_string();
        let api_key = api_key.filter(|k| !k.trim().is_empty());
        let client = Qdrant::from_url(&url)
            .api_key(api_key)
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("configure qdrant client for {url}: {e}"))?;
        Ok(Self {
            client: Arc::new(client),
            url,
            retry,
        })
    }

    async fn collection_exists(&self, collection: &str) -> anyhow::Result<bool> {
        let client = &self.client;
        self.retry
            .run("qdrant.collection_exists", || async move {
                client.collection_exists(collection).await
            })
            .await
            .map_err(|(attempts, e)| {
                anyhow::anyhow!(
                    "qdrant.collection_exists at {} failed after {attempts} attempt(s): {e}",
                    self.url
                )
            })
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn ensure_collection(&self, collection: &str, dimension: usize) -> anyhow::Result<()> {
        if self.collection_exists(collection).await? {
            return Ok(());
        }
        let create = CreateCollectionBuilder::new(collection)
            .vectors_config(VectorParamsBuilder::new(dimension as u64, Distance::Cosine))
            .build();
        let client = &self.client;
        self.retry
            .run("qdrant.create_collection", || {
                let create = create.clone();
                async move { client.create_collection(create).await }
            })
            .await
            .map_err(|(attempts, e)| {
                anyhow::anyhow!("qdrant.create_collection failed after {attempts} attempt(s): {e}")
            })?;
        tracing::info!(collection, dimension, "qdrant collection created");
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, points), fields(points = points.len()))]
    async fn upsert(&self, collection: &str, points: Vec<Point>) -> anyhow::Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let points = points
            .into_iter()
            .map(to_point_struct)
            .collect::<anyhow::Result<Vec<_>>>()?;
        let upsert = UpsertPointsBuilder::new(collection, points).wait(true).build();
        let client = &self.client;
        self.retry
            .run("qdrant.upsert", || {
                let upsert = upsert.clone();
                async move { client.upsert_points(upsert).await }
            })
            .await
            .map_err(|(attempts, e)| anyhow::anyhow!("qdrant.upsert failed after {attempts} attempt(s): {e}"))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, vector))]
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
    ) -> anyhow::Result<Vec<ScoredPoint>> {
        if !self.collection_exists(collection).await? {
            tracing::warn!(collection, "qdrant collection missing; search returns nothing");
            return Ok(Vec::new());
        }
        let search = SearchPointsBuilder::new(collection, vector.to_vec(), limit as u64)
            .with_payload(true)
            .build();
        let client = &self.client;
        let response = self
            .retry
            .run("qdrant.search", || {
                let search = search.clone();
                async move { client.search_points(search).await }
            })
            .await
            .map_err(|(attempts, e)| anyhow::anyhow!("qdrant.search failed after {attempts} attempt(s): {e}"))?;

        Ok(response
            .result
            .into_iter()
            .filter_map(|point| {
                let id = from_qdrant_id(point.id)?;
                Some(ScoredPoint {
                    id,
                    score: point.score,
                    payload: payload_to_json(point.payload),
                })
            })
            .collect())
    }

    async fn delete(&self, collection: &str, ids: &[PointId]) -> anyhow::Result<()> {
        if ids.is_empty() || !self.collection_exists(collection).await? {
            return Ok(());
        }
        let selector = PointsIdsList {
            ids: ids.iter().map(to_qdrant_id).collect(),
        };
        let delete = DeletePointsBuilder::new(collection)
            .points(selector)
            .wait(true)
            .build();
        let client = &self.client;
        self.retry
            .run("qdrant.delete", || {
                let delete = delete.clone();
                async move { client.delete_points(delete).await }
            })
            .await
            .map_err(|(attempts, e)| anyhow::anyhow!("qdrant.delete failed after {attempts} attempt(s): {e}"))?;
        Ok(())
    }

    async fn scroll_all(&self, collection: &str) -> anyhow::Result<Vec<StoredPoint>> {
        let mut out = Vec::new();
        if !self.collection_exists(collection).await? {
            return Ok(out);
        }
        let client = &self.client;
        let mut offset: Option<qdrant::PointId> = None;
        loop {
            let mut page = ScrollPointsBuilder::new(collection)
                .limit(SCROLL_PAGE)
                .with_payload(true)
                .with_vectors(false);
            if let Some(o) = offset.take() {
                page = page.offset(o);
            }
            let page = page.build();
            let response = self
                .retry
                .run("qdrant.scroll", || {
                    let page = page.clone();
                    async move { client.scroll(page).await }
                })
                .await
                .map_err(|(attempts, e)| anyhow::anyhow!("qdrant.scroll failed after {attempts} attempt(s): {e}"))?;

            out.extend(response.result.into_iter().filter_map(|point| {
                let id = from_qdrant_id(point.id)?;
                Some(StoredPoint {
                    id,
                    payload: payload_to_json(point.payload),
                })
            }));
            match response.next_page_offset {
                Some(next) => offset = Some(next),
                None => return Ok(out),
            }
        }
    }
}

fn to_qdrant_id(id: &PointId) -> qdrant::PointId {
    match id {
        PointId::Num(n) => qdrant::PointId::from(*n),
        PointId::Uuid(s) => qdrant::PointId::from(s.clone()),
    }
}

fn from_qdrant_id(id: Option<qdrant::PointId>) -> Option<PointId> {
    match id?.point_id_options? {
        PointIdOptions::Num(n) => Some(PointId::Num(n)),
        PointIdOptions::Uuid(s) => Some(PointId::Uuid(s)),
    }
}

fn to_point_struct(point: Point) -> anyhow::Result<PointStruct> {
    let payload: HashMap<String, qdrant::Value> = match point.payload {
        Value::Object(fields) => fields
            .into_iter()
            .map(|(k, v)| (k, json_to_value(v)))
            .collect(),
        Value::Null => HashMap::new(),
        other => {
            return Err(anyhow::anyhow!(
                "point {} payload must be a JSON object, got {other}",
                point.id
            ));
        }
    };
    Ok(PointStruct::new(to_qdrant_id(&point.id), point.vector, payload))
}

fn json_to_value(value: Value) -> qdrant::Value {
    let kind = match value {
        Value::Null => Kind::NullValue(0),
        Value::Bool(b) => Kind::BoolValue(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Kind::IntegerValue(i),
            None => Kind::DoubleValue(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => Kind::StringValue(s),
        Value::Array(items) => Kind::ListValue(ListValue {
            values: items.into_iter().map(json_to_value).collect(),
        }),
        Value::Object(fields) => Kind::StructValue(Struct {
            fields: fields
                .into_iter()
                .map(|(k, v)| (k, json_to_value(v)))
                .collect(),
        }),
    };
    qdrant::Value { kind: Some(kind) }
}

fn value_to_json(value: qdrant::Value) -> Value {
    match value.kind {
        None | Some(Kind::NullValue(_)) => Value::Null,
        Some(Kind::BoolValue(b)) => Value::Bool(b),
        Some(Kind::IntegerValue(i)) => Value::Number(i.into()),
        Some(Kind::DoubleValue(d)) => Number::from_f64(d).map_or(Value::Null, Value::Number),
        Some(Kind::StringValue(s)) => Value::String(s),
        Some(Kind::ListValue(list)) => {
            Value::Array(list.values.into_iter().map(value_to_json).collect())
        }
        Some(Kind::StructValue(object)) => Value::Object(
            object
                .fields
                .into_iter()
                .map(|(k, v)| (k, value_to_json(v)))
                .collect::<Map<_, _>>(),
        ),
    }
}

fn payload_to_json(payload: HashMap<String, qdrant::Value>) -> Value {
    Value::Object(
        payload
            .into_iter()
            .map(|(k, v)| (k, value_to_json(v)))
            .collect(),
    )
}
