use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::{finish, RetrievalError, SourceRetriever};
use crate::error::StoreError;
use crate::models::{SearchFilters, SearchableItem, SourceType};
use crate::services::text_query::ParsedQuery;
use crate::services::trending::ScoreSource;

/// Retriever over the curated knowledge-entry store.
pub struct PgKnowledgeRetriever {
    db: PgPool,
    cap: i64,
}

impl PgKnowledgeRetriever {
    pub fn new(db: PgPool, cap: i64) -> Self {
        Self { db, cap }
    }
}

#[derive(sqlx::FromRow)]
struct KnowledgeRow {
    id: Uuid,
    title: String,
    summary: Option<String>,
    url: Option<String>,
    category: Option<String>,
    tags: Vec<String>,
    language: Option<String>,
    view_count: i64,
    updated_at: DateTime<Utc>,
}

const KNOWLEDGE_COLUMNS: &str =
    "id, title, summary, url, category, tags, language, view_count, updated_at";

impl From<KnowledgeRow> for SearchableItem {
    fn from(row: KnowledgeRow) -> Self {
        SearchableItem {
            id: row.id.to_string(),
            source_type: SourceType::KnowledgeEntry,
            title: row.title,
            description: row.summary,
            url: row.url,
            timestamp: row.updated_at,
            engagement: row.view_count,
            category: row.category,
            tags: row.tags,
            language: row.language,
            text_score: 0.0,
        }
    }
}

#[async_trait]
impl SourceRetriever for PgKnowledgeRetriever {
    fn source(&self) -> SourceType {
        SourceType::KnowledgeEntry
    }

    async fn retrieve(
        &self,
        filters: &SearchFilters,
        query: Option<&ParsedQuery>,
    ) -> Result<Vec<SearchableItem>, RetrievalError> {
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "SELECT {KNOWLEDGE_COLUMNS} FROM knowledge_entries WHERE 1 = 1"
        ));
        if !filters.categories.is_empty() {
            builder.push(" AND category = ANY(");
            builder.push_bind(filters.categories.clone());
            builder.push(")");
        }
        if !filters.languages.is_empty() {
            builder.push(" AND language = ANY(");
            builder.push_bind(filters.languages.clone());
            builder.push(")");
        }
        if !filters.tags.is_empty() {
            builder.push(" AND tags && ");
            builder.push_bind(filters.tags.clone());
        }
        if let Some(from) = filters.date_from {
            builder.push(" AND updated_at >= ");
            builder.push_bind(from);
        }
        if let Some(to) = filters.date_to {
            builder.push(" AND updated_at <= ");
            builder.push_bind(to);
        }
        if let Some(min) = filters.min_engagement {
            builder.push(" AND view_count >= ");
            builder.push_bind(min);
        }
        builder.push(" ORDER BY updated_at DESC LIMIT ");
        builder.push_bind(self.cap);

        let rows: Vec<KnowledgeRow> = builder.build_query_as().fetch_all(&self.db).await?;
        let items = rows.into_iter().map(SearchableItem::from).collect();
        Ok(finish(items, query, self.cap))
    }
}

#[async_trait]
impl ScoreSource for PgKnowledgeRetriever {
    fn source(&self) -> SourceType {
        SourceType::KnowledgeEntry
    }

    async fn eligible_items(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<SearchableItem>, StoreError> {
        let rows: Vec<KnowledgeRow> = sqlx::query_as(&format!(
            "SELECT {KNOWLEDGE_COLUMNS} FROM knowledge_entries WHERE updated_at >= $1"
        ))
        .bind(since)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(SearchableItem::from).collect())
    }
}
