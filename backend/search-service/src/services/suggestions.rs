//! Search history and query suggestions.
//!
//! Every executed search is appended to the history log. Non-empty
//! queries additionally bump a per-query usage counter that feeds the
//! prefix-completion endpoint; the trending-queries endpoint groups the
//! last 24 hours of history case-insensitively.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreError;

const SUGGESTION_LIMIT_MAX: i64 = 20;
const TRENDING_QUERY_LIMIT_MAX: i64 = 50;
const TRENDING_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Suggestion {
    pub query: String,
    pub usage_count: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TrendingQuery {
    pub query: String,
    pub search_count: i64,
}

#[async_trait]
pub trait SuggestionStore: Send + Sync {
    async fn record_search(
        &self,
        caller_id: Option<Uuid>,
        query: &str,
        filters: &serde_json::Value,
        result_count: i64,
    ) -> Result<(), StoreError>;

    /// Increments the usage counter for a query, creating it on first
    /// use. Counters are keyed by the exact query text.
    async fn bump_suggestion(&self, query: &str) -> Result<(), StoreError>;

    async fn suggestions(&self, prefix: &str, limit: i64) -> Result<Vec<Suggestion>, StoreError>;

    /// Most-searched queries since `since`, grouped case-insensitively.
    async fn trending_queries(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TrendingQuery>, StoreError>;
}

pub struct SuggestionService {
    store: std::sync::Arc<dyn SuggestionStore>,
}

impl SuggestionService {
    pub fn new(store: std::sync::Arc<dyn SuggestionStore>) -> Self {
        Self { store }
    }

    /// Logs one executed search. Blank queries still land in history
    /// (filter-only searches are real traffic) but never become
    /// suggestion entries.
    pub async fn record(
        &self,
        caller_id: Option<Uuid>,
        query: &str,
        filters: &serde_json::Value,
        result_count: i64,
    ) -> Result<(), StoreError> {
        self.store
            .record_search(caller_id, query, filters, result_count)
            .await?;
        let trimmed = query.trim();
        if !trimmed.is_empty() {
            self.store.bump_suggestion(trimmed).await?;
        }
        Ok(())
    }

    pub async fn suggestions(
        &self,
        prefix: &str,
        limit: Option<i64>,
    ) -> Result<Vec<Suggestion>, StoreError> {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            return Ok(Vec::new());
        }
        let limit = limit.unwrap_or(10).clamp(1, SUGGESTION_LIMIT_MAX);
        self.store.suggestions(prefix, limit).await
    }

    pub async fn trending_queries(
        &self,
        limit: Option<i64>,
    ) -> Result<Vec<TrendingQuery>, StoreError> {
        let limit = limit.unwrap_or(10).clamp(1, TRENDING_QUERY_LIMIT_MAX);
        let since = Utc::now() - Duration::hours(TRENDING_WINDOW_HOURS);
        self.store.trending_queries(since, limit).await
    }
}

// ============================================
// Postgres implementation
// ============================================

pub struct PgSuggestionStore {
    db: PgPool,
}

impl PgSuggestionStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SuggestionStore for PgSuggestionStore {
    async fn record_search(
        &self,
        caller_id: Option<Uuid>,
        query: &str,
        filters: &serde_json::Value,
        result_count: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO search_history (caller_id, query, filters, result_count, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            "#,
        )
        .bind(caller_id)
        .bind(query)
        .bind(filters)
        .bind(result_count)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn bump_suggestion(&self, query: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO search_suggestions (query, usage_count, last_used_at)
            VALUES ($1, 1, NOW())
            ON CONFLICT (query) DO UPDATE
            SET usage_count = search_suggestions.usage_count + 1,
                last_used_at = NOW()
            "#,
        )
        .bind(query)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn suggestions(&self, prefix: &str, limit: i64) -> Result<Vec<Suggestion>, StoreError> {
        let rows: Vec<Suggestion> = sqlx::query_as(
            r#"
            SELECT query, usage_count
            FROM search_suggestions
            WHERE query ILIKE $1
            ORDER BY usage_count DESC, query ASC
            LIMIT $2
            "#,
        )
        .bind(format!("{prefix}%"))
        .bind(limit)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    async fn trending_queries(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TrendingQuery>, StoreError> {
        let rows: Vec<TrendingQuery> = sqlx::query_as(
            r#"
            SELECT LOWER(query) AS query, COUNT(*) AS search_count
            FROM search_history
            WHERE created_at >= $1 AND query <> ''
            GROUP BY LOWER(query)
            ORDER BY search_count DESC, query ASC
            LIMIT $2
            "#,
        )
        .bind(since)
        .bind(limit)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }
}

// ============================================
// In-memory implementation (tests, local development)
// ============================================

struct HistoryRecord {
    query: String,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemorySuggestionState {
    history: Vec<HistoryRecord>,
    counters: std::collections::HashMap<String, i64>,
}

#[derive(Default)]
pub struct MemorySuggestionStore {
    state: tokio::sync::Mutex<MemorySuggestionState>,
}

impl MemorySuggestionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn usage_of(&self, query: &str) -> Option<i64> {
        self.state.lock().await.counters.get(query).copied()
    }

    pub async fn history_len(&self) -> usize {
        self.state.lock().await.history.len()
    }

    /// Backdates a history record; the trending window tests need
    /// entries older than the cutoff.
    pub async fn record_at(&self, query: &str, created_at: DateTime<Utc>) {
        self.state.lock().await.history.push(HistoryRecord {
            query: query.to_string(),
            created_at,
        });
    }
}

#[async_trait]
impl SuggestionStore for MemorySuggestionStore {
    async fn record_search(
        &self,
        _caller_id: Option<Uuid>,
        query: &str,
        _filters: &serde_json::Value,
        _result_count: i64,
    ) -> Result<(), StoreError> {
        self.state.lock().await.history.push(HistoryRecord {
            query: query.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn bump_suggestion(&self, query: &str) -> Result<(), StoreError> {
        *self
            .state
            .lock()
            .await
            .counters
            .entry(query.to_string())
            .or_insert(0) += 1;
        Ok(())
    }

    async fn suggestions(&self, prefix: &str, limit: i64) -> Result<Vec<Suggestion>, StoreError> {
        let state = self.state.lock().await;
        let lowered = prefix.to_lowercase();
        let mut matches: Vec<Suggestion> = state
            .counters
            .iter()
            .filter(|(query, _)| query.to_lowercase().starts_with(&lowered))
            .map(|(query, count)| Suggestion {
                query: query.clone(),
                usage_count: *count,
            })
            .collect();
        matches.sort_by(|a, b| {
            b.usage_count
                .cmp(&a.usage_count)
                .then_with(|| a.query.cmp(&b.query))
        });
        matches.truncate(limit.max(0) as usize);
        Ok(matches)
    }

    async fn trending_queries(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TrendingQuery>, StoreError> {
        let state = self.state.lock().await;
        let mut grouped: std::collections::HashMap<String, i64> = std::collections::HashMap::new();
        for record in &state.history {
            if record.created_at >= since && !record.query.is_empty() {
                *grouped.entry(record.query.to_lowercase()).or_insert(0) += 1;
            }
        }
        let mut queries: Vec<TrendingQuery> = grouped
            .into_iter()
            .map(|(query, search_count)| TrendingQuery {
                query,
                search_count,
            })
            .collect();
        queries.sort_by(|a, b| {
            b.search_count
                .cmp(&a.search_count)
                .then_with(|| a.query.cmp(&b.query))
        });
        queries.truncate(limit.max(0) as usize);
        Ok(queries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn service() -> (SuggestionService, Arc<MemorySuggestionStore>) {
        let store = Arc::new(MemorySuggestionStore::new());
        (SuggestionService::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_repeated_query_increments_counter() {
        let (service, store) = service();
        let filters = serde_json::json!({});

        service.record(None, "rust async", &filters, 3).await.unwrap();
        service.record(None, "rust async", &filters, 5).await.unwrap();

        assert_eq!(store.usage_of("rust async").await, Some(2));
        assert_eq!(store.history_len().await, 2);
    }

    #[tokio::test]
    async fn test_blank_query_logged_but_not_suggested() {
        let (service, store) = service();
        let filters = serde_json::json!({"categories": ["ai"]});

        service.record(None, "  ", &filters, 12).await.unwrap();

        assert_eq!(store.history_len().await, 1);
        assert_eq!(store.usage_of("").await, None);
    }

    #[tokio::test]
    async fn test_suggestions_ranked_by_usage() {
        let (service, _store) = service();
        let filters = serde_json::json!({});

        service.record(None, "rust web", &filters, 1).await.unwrap();
        service.record(None, "rust web", &filters, 1).await.unwrap();
        service.record(None, "rust cli", &filters, 1).await.unwrap();
        service.record(None, "python", &filters, 1).await.unwrap();

        let suggestions = service.suggestions("rust", None).await.unwrap();
        assert_eq!(suggestions.len(), 2);
        assert_eq!(suggestions[0].query, "rust web");
        assert_eq!(suggestions[0].usage_count, 2);
    }

    #[tokio::test]
    async fn test_empty_prefix_yields_nothing() {
        let (service, _store) = service();
        let suggestions = service.suggestions("   ", None).await.unwrap();
        assert!(suggestions.is_empty());
    }

    #[tokio::test]
    async fn test_trending_groups_case_insensitively() {
        let (service, _store) = service();
        let filters = serde_json::json!({});

        service.record(None, "Rust", &filters, 1).await.unwrap();
        service.record(None, "rust", &filters, 1).await.unwrap();
        service.record(None, "RUST", &filters, 1).await.unwrap();
        service.record(None, "go", &filters, 1).await.unwrap();

        let trending = service.trending_queries(None).await.unwrap();
        assert_eq!(trending[0].query, "rust");
        assert_eq!(trending[0].search_count, 3);
        assert_eq!(trending[1].query, "go");
    }

    #[tokio::test]
    async fn test_trending_window_excludes_stale_history() {
        let (service, store) = service();
        let filters = serde_json::json!({});

        store
            .record_at("yesterday news", Utc::now() - Duration::hours(30))
            .await;
        service.record(None, "fresh topic", &filters, 1).await.unwrap();

        let trending = service.trending_queries(None).await.unwrap();
        assert_eq!(trending.len(), 1);
        assert_eq!(trending[0].query, "fresh topic");
    }
}
