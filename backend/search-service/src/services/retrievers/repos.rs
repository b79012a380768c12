use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};

use super::{finish, RetrievalError, SourceRetriever};
use crate::error::StoreError;
use crate::models::{SearchFilters, SearchableItem, SourceType};
use crate::services::text_query::ParsedQuery;
use crate::services::trending::ScoreSource;

/// Retriever over the trending-repositories store.
pub struct PgRepoRetriever {
    db: PgPool,
    cap: i64,
}

impl PgRepoRetriever {
    pub fn new(db: PgPool, cap: i64) -> Self {
        Self { db, cap }
    }
}

#[derive(sqlx::FromRow)]
struct RepoRow {
    id: i64,
    full_name: String,
    description: Option<String>,
    html_url: Option<String>,
    language: Option<String>,
    topics: Vec<String>,
    stars: i64,
    pushed_at: DateTime<Utc>,
}

const REPO_COLUMNS: &str =
    "id, full_name, description, html_url, language, topics, stars, pushed_at";

impl From<RepoRow> for SearchableItem {
    fn from(row: RepoRow) -> Self {
        SearchableItem {
            id: row.id.to_string(),
            source_type: SourceType::Repo,
            title: row.full_name,
            description: row.description,
            url: row.html_url,
            timestamp: row.pushed_at,
            engagement: row.stars,
            category: None,
            tags: row.topics,
            language: row.language,
            text_score: 0.0,
        }
    }
}

#[async_trait]
impl SourceRetriever for PgRepoRetriever {
    fn source(&self) -> SourceType {
        SourceType::Repo
    }

    async fn retrieve(
        &self,
        filters: &SearchFilters,
        query: Option<&ParsedQuery>,
    ) -> Result<Vec<SearchableItem>, RetrievalError> {
        // Repositories carry no category attribute.
        if !filters.categories.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "SELECT {REPO_COLUMNS} FROM trending_repos WHERE 1 = 1"
        ));
        if !filters.languages.is_empty() {
            builder.push(" AND language = ANY(");
            builder.push_bind(filters.languages.clone());
            builder.push(")");
        }
        if !filters.tags.is_empty() {
            builder.push(" AND topics && ");
            builder.push_bind(filters.tags.clone());
        }
        if let Some(from) = filters.date_from {
            builder.push(" AND pushed_at >= ");
            builder.push_bind(from);
        }
        if let Some(to) = filters.date_to {
            builder.push(" AND pushed_at <= ");
            builder.push_bind(to);
        }
        if let Some(min) = filters.min_engagement {
            builder.push(" AND stars >= ");
            builder.push_bind(min);
        }
        builder.push(" ORDER BY stars DESC, pushed_at DESC LIMIT ");
        builder.push_bind(self.cap);

        let rows: Vec<RepoRow> = builder.build_query_as().fetch_all(&self.db).await?;
        let items = rows.into_iter().map(SearchableItem::from).collect();
        Ok(finish(items, query, self.cap))
    }
}

#[async_trait]
impl ScoreSource for PgRepoRetriever {
    fn source(&self) -> SourceType {
        SourceType::Repo
    }

    async fn eligible_items(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<SearchableItem>, StoreError> {
        let rows: Vec<RepoRow> = sqlx::query_as(&format!(
            "SELECT {REPO_COLUMNS} FROM trending_repos WHERE pushed_at >= $1"
        ))
        .bind(since)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(SearchableItem::from).collect())
    }
}
