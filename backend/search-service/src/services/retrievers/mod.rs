//! Source retrievers.
//!
//! One retriever per backing store. Each compiles the generic
//! [`SearchFilters`] into its store's native query for the structured
//! predicates, projects rows into [`SearchableItem`], and applies the
//! store-agnostic text grammar on top. Retrievers fail independently: a
//! failed or timed-out retriever degrades to an empty result set and is
//! surfaced in the response metadata.

mod knowledge;
mod repos;
mod trends;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::models::{DegradedSource, SearchFilters, SearchableItem, SourceType};
use crate::services::text_query::{rank_matches, ParsedQuery};

pub use knowledge::PgKnowledgeRetriever;
pub use repos::PgRepoRetriever;
pub use trends::PgTrendRetriever;

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),
}

#[async_trait]
pub trait SourceRetriever: Send + Sync {
    fn source(&self) -> SourceType;

    /// Returns up to the per-source cap of projected items, ordered by
    /// the source's natural recency/popularity (or text relevance when a
    /// query is present).
    async fn retrieve(
        &self,
        filters: &SearchFilters,
        query: Option<&ParsedQuery>,
    ) -> Result<Vec<SearchableItem>, RetrievalError>;
}

/// Applies the text grammar over a structured-predicate candidate set.
/// Shared tail of every retriever.
fn finish(
    items: Vec<SearchableItem>,
    query: Option<&ParsedQuery>,
    cap: i64,
) -> Vec<SearchableItem> {
    let mut items = match query {
        Some(parsed) => rank_matches(items, parsed),
        None => items,
    };
    items.truncate(cap as usize);
    items
}

/// Runs the given retrievers concurrently, each bounded by `deadline`.
///
/// Outputs are concatenated in retriever registration order regardless
/// of completion order, so the merged list is deterministic. A failure
/// or timeout degrades that source to empty rather than failing the
/// request.
pub async fn run_retrievers(
    retrievers: &[Arc<dyn SourceRetriever>],
    filters: &SearchFilters,
    query: Option<&ParsedQuery>,
    deadline: Duration,
) -> (Vec<SearchableItem>, Vec<DegradedSource>) {
    let tasks = retrievers.iter().map(|retriever| {
        let retriever = Arc::clone(retriever);
        async move {
            match tokio::time::timeout(deadline, retriever.retrieve(filters, query)).await {
                Ok(result) => (retriever.source(), result),
                Err(_) => (
                    retriever.source(),
                    Err(RetrievalError::DeadlineExceeded(deadline)),
                ),
            }
        }
    });

    let mut merged = Vec::new();
    let mut degraded = Vec::new();
    for (source, result) in futures::future::join_all(tasks).await {
        match result {
            Ok(items) => merged.extend(items),
            Err(err) => {
                warn!("retriever for {:?} degraded to empty: {err}", source);
                degraded.push(DegradedSource {
                    source,
                    error: err.to_string(),
                });
            }
        }
    }

    (merged, degraded)
}

/// In-memory retriever over a fixed item set. Backs the test suites and
/// local development without a database; applies the same structured
/// predicates the SQL retrievers compile into their queries.
pub struct MemoryRetriever {
    source: SourceType,
    items: Vec<SearchableItem>,
    cap: i64,
}

impl MemoryRetriever {
    pub fn new(source: SourceType, items: Vec<SearchableItem>, cap: i64) -> Self {
        Self { source, items, cap }
    }

    fn passes_filters(item: &SearchableItem, filters: &SearchFilters) -> bool {
        if !filters.categories.is_empty() {
            match &item.category {
                Some(category) if filters.categories.contains(category) => {}
                _ => return false,
            }
        }
        if !filters.tags.is_empty() && !item.tags.iter().any(|t| filters.tags.contains(t)) {
            return false;
        }
        if !filters.languages.is_empty() {
            match &item.language {
                Some(language) if filters.languages.contains(language) => {}
                _ => return false,
            }
        }
        if let Some(from) = filters.date_from {
            if item.timestamp < from {
                return false;
            }
        }
        if let Some(to) = filters.date_to {
            if item.timestamp > to {
                return false;
            }
        }
        if let Some(min) = filters.min_engagement {
            if item.engagement < min {
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl SourceRetriever for MemoryRetriever {
    fn source(&self) -> SourceType {
        self.source
    }

    async fn retrieve(
        &self,
        filters: &SearchFilters,
        query: Option<&ParsedQuery>,
    ) -> Result<Vec<SearchableItem>, RetrievalError> {
        let mut candidates: Vec<SearchableItem> = self
            .items
            .iter()
            .filter(|item| Self::passes_filters(item, filters))
            .cloned()
            .collect();
        candidates.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(finish(candidates, query, self.cap))
    }
}

#[async_trait]
impl crate::services::trending::ScoreSource for MemoryRetriever {
    fn source(&self) -> SourceType {
        self.source
    }

    async fn eligible_items(
        &self,
        since: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<SearchableItem>, crate::error::StoreError> {
        Ok(self
            .items
            .iter()
            .filter(|item| item.timestamp >= since)
            .cloned()
            .collect())
    }
}

/// A retriever that always fails; used to exercise degradation paths.
pub struct FailingRetriever {
    source: SourceType,
}

impl FailingRetriever {
    pub fn new(source: SourceType) -> Self {
        Self { source }
    }
}

#[async_trait]
impl SourceRetriever for FailingRetriever {
    fn source(&self) -> SourceType {
        self.source
    }

    async fn retrieve(
        &self,
        _filters: &SearchFilters,
        _query: Option<&ParsedQuery>,
    ) -> Result<Vec<SearchableItem>, RetrievalError> {
        Err(RetrievalError::Database(sqlx::Error::PoolClosed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample(id: &str, source: SourceType, engagement: i64, tags: &[&str]) -> SearchableItem {
        SearchableItem {
            id: id.to_string(),
            source_type: source,
            title: format!("item {id}"),
            description: None,
            url: None,
            timestamp: Utc::now(),
            engagement,
            category: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            language: None,
            text_score: 0.0,
        }
    }

    #[tokio::test]
    async fn test_memory_retriever_applies_structured_filters() {
        let items = vec![
            sample("1", SourceType::Trend, 10, &["ai"]),
            sample("2", SourceType::Trend, 500, &["rust"]),
        ];
        let retriever = MemoryRetriever::new(SourceType::Trend, items, 100);

        let filters = SearchFilters {
            min_engagement: Some(100),
            ..Default::default()
        };
        let results = retriever.retrieve(&filters, None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "2");

        let filters = SearchFilters {
            tags: vec!["ai".to_string()],
            ..Default::default()
        };
        let results = retriever.retrieve(&filters, None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "1");
    }

    #[tokio::test]
    async fn test_run_retrievers_degrades_failed_source() {
        let retrievers: Vec<Arc<dyn SourceRetriever>> = vec![
            Arc::new(MemoryRetriever::new(
                SourceType::Trend,
                vec![sample("1", SourceType::Trend, 5, &[])],
                100,
            )),
            Arc::new(FailingRetriever::new(SourceType::Repo)),
        ];

        let filters = SearchFilters::default();
        let (items, degraded) =
            run_retrievers(&retrievers, &filters, None, Duration::from_secs(1)).await;

        assert_eq!(items.len(), 1);
        assert_eq!(degraded.len(), 1);
        assert_eq!(degraded[0].source, SourceType::Repo);
    }

    #[tokio::test]
    async fn test_run_retrievers_preserves_registration_order() {
        let retrievers: Vec<Arc<dyn SourceRetriever>> = vec![
            Arc::new(MemoryRetriever::new(
                SourceType::Trend,
                vec![sample("t1", SourceType::Trend, 5, &[])],
                100,
            )),
            Arc::new(MemoryRetriever::new(
                SourceType::Repo,
                vec![sample("r1", SourceType::Repo, 5, &[])],
                100,
            )),
        ];

        let filters = SearchFilters::default();
        let (items, degraded) =
            run_retrievers(&retrievers, &filters, None, Duration::from_secs(1)).await;

        assert!(degraded.is_empty());
        assert_eq!(items[0].source_type, SourceType::Trend);
        assert_eq!(items[1].source_type, SourceType::Repo);
    }

    #[tokio::test]
    async fn test_cap_is_enforced() {
        let items: Vec<SearchableItem> = (0..10)
            .map(|i| sample(&i.to_string(), SourceType::Trend, i, &[]))
            .collect();
        let retriever = MemoryRetriever::new(SourceType::Trend, items, 3);

        let results = retriever
            .retrieve(&SearchFilters::default(), None)
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
    }
}
