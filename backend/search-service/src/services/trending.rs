//! Batch trending-score computation.
//!
//! Scores are recomputed explicitly (scheduler-triggered), never on the
//! read path, so they can lag the live item data between runs. Each row
//! is written idempotently keyed by `(item_type, item_id)`; concurrent
//! recompute invocations are single-flighted.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::ScoreParams;
use crate::error::{SearchError, StoreError};
use crate::models::{SearchableItem, SourceType, TrendingScoreRow};

/// Composite score weights: engagement, recency, velocity.
const ENGAGEMENT_WEIGHT: f64 = 0.4;
const RECENCY_WEIGHT: f64 = 0.3;
const VELOCITY_WEIGHT: f64 = 0.3;

/// Feed of items eligible for scoring, one per source store.
#[async_trait]
pub trait ScoreSource: Send + Sync {
    fn source(&self) -> SourceType;

    /// All items within the source's retention window.
    async fn eligible_items(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<SearchableItem>, StoreError>;
}

/// Persistence for computed scores.
#[async_trait]
pub trait ScoreStore: Send + Sync {
    async fn upsert(&self, row: &TrendingScoreRow) -> Result<(), StoreError>;

    /// Batch lookup for the read path. Keys without a row are simply
    /// absent from the map; orphaned rows are never returned because
    /// only live item keys are requested.
    async fn scores_for(
        &self,
        keys: &[(SourceType, String)],
    ) -> Result<HashMap<(SourceType, String), TrendingScoreRow>, StoreError>;
}

fn normalize(value: f64, scale: f64) -> f64 {
    if scale <= 0.0 {
        return 0.0;
    }
    (value / scale).min(1.0)
}

/// Derives the score row for one item. Pure; identical inputs yield
/// identical scores.
pub fn compute_score(
    item: &SearchableItem,
    params: &ScoreParams,
    now: DateTime<Utc>,
) -> TrendingScoreRow {
    let age_hours = ((now - item.timestamp).num_seconds() as f64 / 3600.0).max(0.0);
    let engagement_score = item.engagement as f64;
    let velocity_score = engagement_score / age_hours.max(1.0);
    let recency_score = (100.0 - age_hours).clamp(0.0, 100.0);
    let trending_score = 100.0
        * (ENGAGEMENT_WEIGHT * normalize(engagement_score, params.engagement_scale)
            + RECENCY_WEIGHT * (recency_score / 100.0)
            + VELOCITY_WEIGHT * normalize(velocity_score, params.velocity_scale));

    TrendingScoreRow {
        item_type: item.source_type,
        item_id: item.id.clone(),
        trending_score,
        velocity_score,
        engagement_score,
        recency_score,
        calculated_at: now,
        metadata: serde_json::json!({
            "age_hours": age_hours,
            "engagement_scale": params.engagement_scale,
            "velocity_scale": params.velocity_scale,
        }),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecomputeSummary {
    pub scored: usize,
    pub failed: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub struct ScoredSource {
    pub source: Arc<dyn ScoreSource>,
    pub params: ScoreParams,
}

pub struct TrendingCalculator {
    sources: Vec<ScoredSource>,
    store: Arc<dyn ScoreStore>,
    // Single-flight guard: overlapping upserts to the same key are a
    // race, so a second recompute is rejected while one runs.
    inflight: tokio::sync::Mutex<()>,
}

impl TrendingCalculator {
    pub fn new(sources: Vec<ScoredSource>, store: Arc<dyn ScoreStore>) -> Self {
        Self {
            sources,
            store,
            inflight: tokio::sync::Mutex::new(()),
        }
    }

    /// Recomputes scores for every eligible item across all sources.
    ///
    /// Per-item failures are counted and logged without aborting the
    /// batch; a whole-source feed failure skips that source. Re-running
    /// with unchanged inputs writes identical scores.
    pub async fn recompute(&self, now: DateTime<Utc>) -> Result<RecomputeSummary, SearchError> {
        let _guard = self
            .inflight
            .try_lock()
            .map_err(|_| SearchError::RecomputeInFlight)?;

        let started_at = now;
        let mut scored = 0usize;
        let mut failed = 0usize;

        for scored_source in &self.sources {
            let source = scored_source.source.source();
            let since = now - Duration::days(scored_source.params.retention_days);

            let items = match scored_source.source.eligible_items(since).await {
                Ok(items) => items,
                Err(err) => {
                    warn!("skipping {:?} in trending recompute: {err}", source);
                    continue;
                }
            };

            for item in &items {
                let row = compute_score(item, &scored_source.params, now);
                match self.store.upsert(&row).await {
                    Ok(()) => scored += 1,
                    Err(err) => {
                        failed += 1;
                        warn!(
                            "failed to persist score for {:?}/{}: {err}",
                            source, item.id
                        );
                    }
                }
            }
        }

        let summary = RecomputeSummary {
            scored,
            failed,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            scored = summary.scored,
            failed = summary.failed,
            "trending recompute finished"
        );
        Ok(summary)
    }
}

// ============================================
// Postgres implementation
// ============================================

pub struct PgScoreStore {
    db: PgPool,
}

impl PgScoreStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[derive(sqlx::FromRow)]
struct ScoreRow {
    item_type: String,
    item_id: String,
    trending_score: f64,
    velocity_score: f64,
    engagement_score: f64,
    recency_score: f64,
    calculated_at: DateTime<Utc>,
    metadata: serde_json::Value,
}

#[async_trait]
impl ScoreStore for PgScoreStore {
    async fn upsert(&self, row: &TrendingScoreRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO trending_scores
                (item_type, item_id, trending_score, velocity_score,
                 engagement_score, recency_score, calculated_at, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (item_type, item_id) DO UPDATE
            SET trending_score = EXCLUDED.trending_score,
                velocity_score = EXCLUDED.velocity_score,
                engagement_score = EXCLUDED.engagement_score,
                recency_score = EXCLUDED.recency_score,
                calculated_at = EXCLUDED.calculated_at,
                metadata = EXCLUDED.metadata
            "#,
        )
        .bind(row.item_type.as_str())
        .bind(&row.item_id)
        .bind(row.trending_score)
        .bind(row.velocity_score)
        .bind(row.engagement_score)
        .bind(row.recency_score)
        .bind(row.calculated_at)
        .bind(&row.metadata)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn scores_for(
        &self,
        keys: &[(SourceType, String)],
    ) -> Result<HashMap<(SourceType, String), TrendingScoreRow>, StoreError> {
        let mut by_type: HashMap<SourceType, Vec<String>> = HashMap::new();
        for (source, id) in keys {
            by_type.entry(*source).or_default().push(id.clone());
        }

        let mut scores = HashMap::new();
        for (source, ids) in by_type {
            let rows: Vec<ScoreRow> = sqlx::query_as(
                r#"
                SELECT item_type, item_id, trending_score, velocity_score,
                       engagement_score, recency_score, calculated_at, metadata
                FROM trending_scores
                WHERE item_type = $1 AND item_id = ANY($2)
                "#,
            )
            .bind(source.as_str())
            .bind(ids)
            .fetch_all(&self.db)
            .await?;

            for row in rows {
                let Some(item_type) = SourceType::parse(&row.item_type) else {
                    continue;
                };
                scores.insert(
                    (item_type, row.item_id.clone()),
                    TrendingScoreRow {
                        item_type,
                        item_id: row.item_id,
                        trending_score: row.trending_score,
                        velocity_score: row.velocity_score,
                        engagement_score: row.engagement_score,
                        recency_score: row.recency_score,
                        calculated_at: row.calculated_at,
                        metadata: row.metadata,
                    },
                );
            }
        }
        Ok(scores)
    }
}

// ============================================
// In-memory implementation (tests, local development)
// ============================================

#[derive(Default)]
pub struct MemoryScoreStore {
    rows: tokio::sync::Mutex<HashMap<(SourceType, String), TrendingScoreRow>>,
}

impl MemoryScoreStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, source: SourceType, id: &str) -> Option<TrendingScoreRow> {
        self.rows
            .lock()
            .await
            .get(&(source, id.to_string()))
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }
}

#[async_trait]
impl ScoreStore for MemoryScoreStore {
    async fn upsert(&self, row: &TrendingScoreRow) -> Result<(), StoreError> {
        self.rows
            .lock()
            .await
            .insert((row.item_type, row.item_id.clone()), row.clone());
        Ok(())
    }

    async fn scores_for(
        &self,
        keys: &[(SourceType, String)],
    ) -> Result<HashMap<(SourceType, String), TrendingScoreRow>, StoreError> {
        let rows = self.rows.lock().await;
        Ok(keys
            .iter()
            .filter_map(|key| rows.get(key).map(|row| (key.clone(), row.clone())))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::retrievers::MemoryRetriever;

    fn params() -> ScoreParams {
        ScoreParams {
            engagement_scale: 1_000.0,
            velocity_scale: 100.0,
            retention_days: 7,
        }
    }

    fn item(id: &str, engagement: i64, hours_old: i64) -> SearchableItem {
        SearchableItem {
            id: id.to_string(),
            source_type: SourceType::Trend,
            title: format!("item {id}"),
            description: None,
            url: None,
            timestamp: Utc::now() - Duration::hours(hours_old),
            engagement,
            category: None,
            tags: Vec::new(),
            language: None,
            text_score: 0.0,
        }
    }

    #[test]
    fn test_velocity_uses_age_floor_of_one_hour() {
        let now = Utc::now();
        let fresh = item("fresh", 600, 0);
        let row = compute_score(&fresh, &params(), now);
        // Age below one hour divides by 1, not by a fraction.
        assert!((row.velocity_score - 600.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_recency_clamped_to_range() {
        let now = Utc::now();

        let ancient = item("old", 10, 500);
        assert_eq!(compute_score(&ancient, &params(), now).recency_score, 0.0);

        let fresh = item("new", 10, 0);
        let recency = compute_score(&fresh, &params(), now).recency_score;
        assert!(recency > 99.0 && recency <= 100.0);
    }

    #[test]
    fn test_trending_score_bounded() {
        let now = Utc::now();
        let viral = item("viral", 10_000_000, 0);
        let row = compute_score(&viral, &params(), now);
        // Normalization caps each component, so the composite tops out at 100.
        assert!(row.trending_score <= 100.0);
        assert!(row.trending_score > 0.0);

        let dead = item("dead", 0, 5_000);
        let row = compute_score(&dead, &params(), now);
        assert_eq!(row.trending_score, 0.0);
    }

    #[test]
    fn test_compute_is_deterministic() {
        let now = Utc::now();
        let it = item("x", 250, 12);
        let first = compute_score(&it, &params(), now);
        let second = compute_score(&it, &params(), now);
        assert_eq!(first.trending_score, second.trending_score);
        assert_eq!(first.velocity_score, second.velocity_score);
    }

    fn calculator(
        items: Vec<SearchableItem>,
        store: Arc<MemoryScoreStore>,
    ) -> TrendingCalculator {
        let source = Arc::new(MemoryRetriever::new(SourceType::Trend, items, 100));
        TrendingCalculator::new(
            vec![ScoredSource {
                source,
                params: params(),
            }],
            store,
        )
    }

    #[tokio::test]
    async fn test_recompute_is_idempotent() {
        let store = Arc::new(MemoryScoreStore::new());
        let calc = calculator(vec![item("a", 500, 3), item("b", 20, 48)], store.clone());

        let now = Utc::now();
        let first = calc.recompute(now).await.unwrap();
        assert_eq!(first.scored, 2);
        assert_eq!(first.failed, 0);
        let score_a = store.get(SourceType::Trend, "a").await.unwrap();

        let second = calc.recompute(now).await.unwrap();
        assert_eq!(second.scored, 2);
        let score_a_again = store.get(SourceType::Trend, "a").await.unwrap();

        assert!((score_a.trending_score - score_a_again.trending_score).abs() < 1e-9);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_retention_window_excludes_old_items() {
        let store = Arc::new(MemoryScoreStore::new());
        let calc = calculator(
            vec![item("recent", 100, 24), item("expired", 100, 24 * 30)],
            store.clone(),
        );

        calc.recompute(Utc::now()).await.unwrap();

        assert!(store.get(SourceType::Trend, "recent").await.is_some());
        assert!(store.get(SourceType::Trend, "expired").await.is_none());
    }

    struct FlakyScoreStore {
        inner: MemoryScoreStore,
        fail_id: String,
    }

    #[async_trait]
    impl ScoreStore for FlakyScoreStore {
        async fn upsert(&self, row: &TrendingScoreRow) -> Result<(), StoreError> {
            if row.item_id == self.fail_id {
                return Err(StoreError::Unavailable("write refused".to_string()));
            }
            self.inner.upsert(row).await
        }

        async fn scores_for(
            &self,
            keys: &[(SourceType, String)],
        ) -> Result<HashMap<(SourceType, String), TrendingScoreRow>, StoreError> {
            self.inner.scores_for(keys).await
        }
    }

    #[tokio::test]
    async fn test_single_item_failure_does_not_abort_batch() {
        let store = Arc::new(FlakyScoreStore {
            inner: MemoryScoreStore::new(),
            fail_id: "poison".to_string(),
        });
        let source = Arc::new(MemoryRetriever::new(
            SourceType::Trend,
            vec![item("ok1", 10, 1), item("poison", 10, 1), item("ok2", 10, 1)],
            100,
        ));
        let calc = TrendingCalculator::new(
            vec![ScoredSource {
                source,
                params: params(),
            }],
            store,
        );

        let summary = calc.recompute(Utc::now()).await.unwrap();
        assert_eq!(summary.scored, 2);
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn test_orphaned_scores_are_ignored_by_lookup() {
        let store = MemoryScoreStore::new();
        let orphan = compute_score(&item("gone", 10, 1), &params(), Utc::now());
        store.upsert(&orphan).await.unwrap();

        // Lookup only asks for live keys; the orphan never surfaces.
        let live_keys = vec![(SourceType::Trend, "alive".to_string())];
        let scores = store.scores_for(&live_keys).await.unwrap();
        assert!(scores.is_empty());
    }
}
