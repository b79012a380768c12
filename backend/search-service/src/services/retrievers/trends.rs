use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::{finish, RetrievalError, SourceRetriever};
use crate::error::StoreError;
use crate::models::{SearchFilters, SearchableItem, SourceType};
use crate::services::text_query::ParsedQuery;
use crate::services::trending::ScoreSource;

/// Retriever over the trending-topics store.
pub struct PgTrendRetriever {
    db: PgPool,
    cap: i64,
}

impl PgTrendRetriever {
    pub fn new(db: PgPool, cap: i64) -> Self {
        Self { db, cap }
    }
}

#[derive(sqlx::FromRow)]
struct TrendRow {
    id: Uuid,
    title: String,
    summary: Option<String>,
    url: Option<String>,
    category: Option<String>,
    tags: Vec<String>,
    engagement_count: i64,
    created_at: DateTime<Utc>,
}

const TREND_COLUMNS: &str =
    "id, title, summary, url, category, tags, engagement_count, created_at";

impl From<TrendRow> for SearchableItem {
    fn from(row: TrendRow) -> Self {
        SearchableItem {
            id: row.id.to_string(),
            source_type: SourceType::Trend,
            title: row.title,
            description: row.summary,
            url: row.url,
            timestamp: row.created_at,
            engagement: row.engagement_count,
            category: row.category,
            tags: row.tags,
            language: None,
            text_score: 0.0,
        }
    }
}

#[async_trait]
impl SourceRetriever for PgTrendRetriever {
    fn source(&self) -> SourceType {
        SourceType::Trend
    }

    async fn retrieve(
        &self,
        filters: &SearchFilters,
        query: Option<&ParsedQuery>,
    ) -> Result<Vec<SearchableItem>, RetrievalError> {
        // Trend topics carry no language attribute; a language allow-list
        // can never match this source.
        if !filters.languages.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "SELECT {TREND_COLUMNS} FROM trend_topics WHERE 1 = 1"
        ));
        if !filters.categories.is_empty() {
            builder.push(" AND category = ANY(");
            builder.push_bind(filters.categories.clone());
            builder.push(")");
        }
        if !filters.tags.is_empty() {
            builder.push(" AND tags && ");
            builder.push_bind(filters.tags.clone());
        }
        if let Some(from) = filters.date_from {
            builder.push(" AND created_at >= ");
            builder.push_bind(from);
        }
        if let Some(to) = filters.date_to {
            builder.push(" AND created_at <= ");
            builder.push_bind(to);
        }
        if let Some(min) = filters.min_engagement {
            builder.push(" AND engagement_count >= ");
            builder.push_bind(min);
        }
        builder.push(" ORDER BY created_at DESC LIMIT ");
        builder.push_bind(self.cap);

        let rows: Vec<TrendRow> = builder.build_query_as().fetch_all(&self.db).await?;
        let items = rows.into_iter().map(SearchableItem::from).collect();
        Ok(finish(items, query, self.cap))
    }
}

#[async_trait]
impl ScoreSource for PgTrendRetriever {
    fn source(&self) -> SourceType {
        SourceType::Trend
    }

    async fn eligible_items(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<SearchableItem>, StoreError> {
        let rows: Vec<TrendRow> = sqlx::query_as(&format!(
            "SELECT {TREND_COLUMNS} FROM trend_topics WHERE created_at >= $1"
        ))
        .bind(since)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(SearchableItem::from).collect())
    }
}
