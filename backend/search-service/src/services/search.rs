//! The unified search pipeline.
//!
//! Validates filters, fans out to the selected source retrievers, merges
//! their outputs in registration order, decorates results with cached
//! trending scores, then sorts and paginates. History logging and score
//! lookup are best-effort; only validation failures fail the request.

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::error::SearchError;
use crate::models::{
    SearchFilters, SearchResponseBody, SearchResult, SearchableItem, SourceType,
};
use crate::services::merge::aggregate_facets;
use crate::services::ranking::{paginate, sort_results};
use crate::services::retrievers::{run_retrievers, SourceRetriever};
use crate::services::suggestions::SuggestionService;
use crate::services::text_query::ParsedQuery;
use crate::services::trending::ScoreStore;

pub struct SearchService {
    retrievers: Vec<Arc<dyn SourceRetriever>>,
    scores: Arc<dyn ScoreStore>,
    suggestions: Arc<SuggestionService>,
    source_deadline: Duration,
}

impl SearchService {
    pub fn new(
        retrievers: Vec<Arc<dyn SourceRetriever>>,
        scores: Arc<dyn ScoreStore>,
        suggestions: Arc<SuggestionService>,
        source_deadline: Duration,
    ) -> Self {
        Self {
            retrievers,
            scores,
            suggestions,
            source_deadline,
        }
    }

    pub async fn search(
        &self,
        filters: SearchFilters,
        caller_id: Option<Uuid>,
    ) -> Result<SearchResponseBody, SearchError> {
        let filters = filters.validated()?;
        let parsed = filters.query.as_deref().and_then(ParsedQuery::parse);

        let selected = filters.selected_sources();
        let active: Vec<Arc<dyn SourceRetriever>> = self
            .retrievers
            .iter()
            .filter(|r| selected.contains(&r.source()))
            .cloned()
            .collect();

        let (items, degraded) =
            run_retrievers(&active, &filters, parsed.as_ref(), self.source_deadline).await;

        // Facets are tallied over the full merged set, before pagination.
        let facets = aggregate_facets(&items);
        let mut results = self.decorate(items).await;

        sort_results(&mut results, filters.sort_by);
        let (page, total, has_more) = paginate(results, filters.offset, filters.limit);

        self.log_search(&filters, caller_id, total).await;

        Ok(SearchResponseBody {
            results: page,
            total,
            has_more,
            facets,
            search_id: Uuid::new_v4(),
            degraded,
        })
    }

    /// Attaches cached trending scores. A score-store failure degrades
    /// to unscored results rather than failing the search.
    async fn decorate(&self, items: Vec<SearchableItem>) -> Vec<SearchResult> {
        let keys: Vec<(SourceType, String)> = items
            .iter()
            .map(|item| (item.source_type, item.id.clone()))
            .collect();
        let scores = match self.scores.scores_for(&keys).await {
            Ok(scores) => scores,
            Err(err) => {
                warn!("trending score lookup failed, serving unscored results: {err}");
                Default::default()
            }
        };

        items
            .into_iter()
            .map(|item| {
                let score = scores.get(&(item.source_type, item.id.clone()));
                SearchResult {
                    id: item.id,
                    source_type: item.source_type,
                    title: item.title,
                    description: item.description,
                    url: item.url,
                    category: item.category,
                    tags: item.tags,
                    language: item.language,
                    engagement: item.engagement,
                    trending_score: score.map(|s| s.trending_score),
                    velocity_score: score.map(|s| s.velocity_score),
                    timestamp: item.timestamp,
                    metadata: match score {
                        Some(s) => serde_json::json!({ "score_calculated_at": s.calculated_at }),
                        None => serde_json::json!({}),
                    },
                }
            })
            .collect()
    }

    async fn log_search(&self, filters: &SearchFilters, caller_id: Option<Uuid>, total: usize) {
        let query = filters.query.as_deref().unwrap_or("");
        let summary = serde_json::json!({
            "categories": filters.categories,
            "tags": filters.tags,
            "languages": filters.languages,
            "sources": filters.sources,
            "sort_by": filters.sort_by,
            "min_engagement": filters.min_engagement,
        });
        if let Err(err) = self
            .suggestions
            .record(caller_id, query, &summary, total as i64)
            .await
        {
            warn!("failed to log search history: {err}");
        }
    }
}
