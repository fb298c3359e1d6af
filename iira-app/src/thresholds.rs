//! Runtime-adjustable retrieval thresholds.

use crate::config::RetrievalConfig;
use crate::store::Database;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub const INITIAL_SEARCH_THRESHOLD: &str = "INITIAL_SEARCH_THRESHOLD";
pub const HYDE_SEARCH_THRESHOLD: &str = "HYDE_SEARCH_THRESHOLD";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub initial: f32,
    pub hyde: f32,
}

impl From<&RetrievalConfig> for Thresholds {
    fn from(cfg: &RetrievalConfig) -> Self {
        Self {
            initial: cfg.initial_threshold,
            hyde: cfg.hyde_threshold,
        }
    }
}

#[async_trait]
pub trait SettingsSource: Send + Sync {
    async fn load_settings(&self) -> anyhow::Result<BTreeMap<String, String>>;
}

#[async_trait]
impl SettingsSource for Database {
    async fn load_settings(&self) -> anyhow::Result<BTreeMap<String, String>> {
        self.get_settings().await
    }
}

/// Thresholds loaded once and served from memory until [`refresh`](Self::refresh).
pub struct ThresholdCache {
    source: Option<Arc<dyn SettingsSource>>,
    defaults: Thresholds,
    cached: RwLock<Option<Thresholds>>,
}

impl ThresholdCache {
    pub fn new(source: Arc<dyn SettingsSource>, defaults: Thresholds) -> Self {
        Self {
            source: Some(source),
            defaults,
            cached: RwLock::new(None),
        }
    }

    /// Always serves `thresholds`.
    pub fn fixed(thresholds: Thresholds) -> Self {
        Self {
            source: None,
            defaults: thresholds,
            cached: RwLock::new(Some(thresholds)),
        }
    }

    pub async fn get(&self) -> Thresholds {
        if let Some(t) = *self.cached.read().await {
            return t;
        }
        let mut guard = self.cached.write().await;
        if let Some(t) = *guard {
            return t;
        }
        match self.load().await {
            Ok(t) => {
                *guard = Some(t);
                t
            }
            Err(e) => {
                tracing::warn!(error = %e, "threshold settings unavailable; using configured defaults");
                self.defaults
            }
        }
    }

    pub async fn refresh(&self) -> Thresholds {
        if self.source.is_some() {
            *self.cached.write().await = None;
        }
        self.get().await
    }

    async fn load(&self) -> anyhow::Result<Thresholds> {
        let Some(source) = &self.source else {
            return Ok(self.defaults);
        };
        let settings = source.load_settings().await?;
        let t = Thresholds {
            initial: read_threshold(&settings, INITIAL_SEARCH_THRESHOLD, self.defaults.initial),
            hyde: read_threshold(&settings, HYDE_SEARCH_THRESHOLD, self.defaults.hyde),
        };
        tracing::info!(initial = t.initial, hyde = t.hyde, "search thresholds loaded");
        Ok(t)
    }
}

fn read_threshold(settings: &BTreeMap<String, String>, key: &str, default: f32) -> f32 {
    let Some(raw) = settings.get(key) else {
        return default;
    };
    match raw.trim().parse::<f32>() {
        Ok(v) if (0.0..=1.0).contains(&v) => v,
        _ => {
            tracing::warn!(key, value = %raw, "ignoring invalid threshold setting");
            default
        }
    }
}

/// Parse and range-check a threshold before it is written.
pub fn parse_threshold_setting(key: &str, raw: &str) -> anyhow::Result<f32> {
    if key != INITIAL_SEARCH_THRESHOLD && key != HYDE_SEARCH_THRESHOLD {
        anyhow::bail!(
            "unknown threshold key {key:?}; expected {INITIAL_SEARCH_THRESHOLD} or {HYDE_SEARCH_THRESHOLD}"
        );
    }
    let v: f32 = raw
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid threshold {raw:?}: {e}"))?;
    if !(0.0..=1.0).contains(&v) {
        anyhow::bail!("threshold must be within [0, 1], got {v}");
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::temp_database;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const DEFAULTS: Thresholds = Thresholds {
        initial: 0.55,
        hyde: 0.5,
    };

    struct FlakySource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SettingsSource for FlakySource {
        async fn load_settings(&self) -> anyhow::Result<BTreeMap<String, String>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("database locked");
            }
            Ok(BTreeMap::from([(
                INITIAL_SEARCH_THRESHOLD.to_string(),
                "0.7".to_string(),
            )]))
        }
    }

    #[tokio::test]
    async fn loads_once_and_refresh_reloads() {
        let (_dir, db) = temp_database().await;
        db.put_setting(INITIAL_SEARCH_THRESHOLD, "0.6").await.unwrap();
        let cache = ThresholdCache::new(Arc::new(db.clone()), DEFAULTS);

        assert_eq!(cache.get().await, Thresholds { initial: 0.6, hyde: 0.5 });

        db.put_setting(HYDE_SEARCH_THRESHOLD, "0.4").await.unwrap();
        assert_eq!(cache.get().await.hyde, 0.5);
        assert_eq!(cache.refresh().await.hyde, 0.4);
    }

    #[tokio::test]
    async fn read_failure_falls_back_without_caching() {
        let source = Arc::new(FlakySource {
            calls: AtomicUsize::new(0),
        });
        let cache = ThresholdCache::new(source.clone(), DEFAULTS);
        assert_eq!(cache.get().await, DEFAULTS);
        assert_eq!(cache.get().await.initial, 0.7);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn out_of_range_values_are_ignored_or_rejected() {
        let settings = BTreeMap::from([(HYDE_SEARCH_THRESHOLD.to_string(), "1.4".to_string())]);
        assert_eq!(read_threshold(&settings, HYDE_SEARCH_THRESHOLD, 0.5), 0.5);
        assert!(parse_threshold_setting(HYDE_SEARCH_THRESHOLD, "1.4").is_err());
        assert!(parse_threshold_setting("OTHER", "0.4").is_err());
        assert_eq!(parse_threshold_setting(INITIAL_SEARCH_THRESHOLD, " 0.65 ").unwrap(), 0.65);
    }
}
