use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json,
    },
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

use search_service::config::Config;
use search_service::error::SearchError;
use search_service::events::{LocalBus, RedisBus, RefreshBus, RefreshEvent};
use search_service::models::{SearchFilters, SortKey, SourceType, SubscriptionTier};
use search_service::services::quota::{
    caller_key, parse_caller, PgQuotaStore, PgTierStore, QuotaTracker, TierResolver,
};
use search_service::services::retrievers::{
    PgKnowledgeRetriever, PgRepoRetriever, PgTrendRetriever, SourceRetriever,
};
use search_service::services::search::SearchService;
use search_service::services::suggestions::{PgSuggestionStore, SuggestionService};
use search_service::services::trending::{
    PgScoreStore, ScoreSource, ScoredSource, TrendingCalculator,
};

struct AppState {
    search: SearchService,
    quota: QuotaTracker,
    tiers: TierResolver,
    suggestions: Arc<SuggestionService>,
    calculator: TrendingCalculator,
    bus: Arc<dyn RefreshBus>,
    service_name: String,
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: Option<String>,
    /// Comma-separated source types; absent means all.
    types: Option<String>,
    categories: Option<String>,
    tags: Option<String>,
    languages: Option<String>,
    sort_by: Option<String>,
    date_from: Option<DateTime<Utc>>,
    date_to: Option<DateTime<Utc>>,
    min_engagement: Option<i64>,
    limit: Option<i64>,
    offset: Option<i64>,
}

fn csv(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

impl SearchParams {
    fn into_filters(self) -> Result<SearchFilters, SearchError> {
        let mut sources = Vec::new();
        for raw in csv(self.types.as_deref()) {
            match SourceType::parse(&raw) {
                Some(source) => sources.push(source),
                None => {
                    return Err(SearchError::validation(
                        "types",
                        format!("unknown source type '{raw}'"),
                    ))
                }
            }
        }
        let sort_by = match self.sort_by.as_deref() {
            Some(raw) => SortKey::parse(raw)?,
            None => SortKey::default(),
        };
        let defaults = SearchFilters::default();

        Ok(SearchFilters {
            query: self.q,
            categories: csv(self.categories.as_deref()),
            tags: csv(self.tags.as_deref()),
            languages: csv(self.languages.as_deref()),
            sources,
            date_from: self.date_from,
            date_to: self.date_to,
            min_engagement: self.min_engagement,
            sort_by,
            limit: self.limit.unwrap_or(defaults.limit),
            offset: self.offset.unwrap_or(defaults.offset),
        })
    }
}

fn caller_from_headers(headers: &HeaderMap) -> Result<Option<uuid::Uuid>, SearchError> {
    let raw = match headers.get("x-caller-id") {
        Some(value) => Some(value.to_str().map_err(|_| SearchError::Auth)?),
        None => None,
    };
    parse_caller(raw)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": state.service_name,
    }))
}

async fn unified_search(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse, SearchError> {
    let caller = caller_from_headers(&headers)?;
    let caller_id = caller_key(caller);
    let tier = state.tiers.resolve(caller).await;

    let decision = state
        .quota
        .try_admit(&caller_id, &tier, Utc::now())
        .await
        .map_err(SearchError::Store)?;
    if !decision.allowed {
        state
            .quota
            .log_usage(&caller_id, "/api/v1/search", "GET", 429, 0)
            .await;
        return Err(SearchError::QuotaExceeded(decision));
    }

    let filters = params.into_filters()?;
    let body = state.search.search(filters, caller).await?;

    state
        .quota
        .log_usage(&caller_id, "/api/v1/search", "GET", 200, decision.remaining)
        .await;

    let rate_headers = [
        ("x-ratelimit-limit", decision.limit.to_string()),
        ("x-ratelimit-remaining", decision.remaining.to_string()),
        ("x-ratelimit-reset", decision.reset_at.to_rfc3339()),
    ];
    Ok((rate_headers, Json(body)))
}

async fn quota_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, SearchError> {
    let caller = caller_from_headers(&headers)?;
    let caller_id = caller_key(caller);
    let tier = state.tiers.resolve(caller).await;

    let decision = state
        .quota
        .check_quota(&caller_id, &tier, Utc::now())
        .await
        .map_err(SearchError::Store)?;

    Ok(Json(serde_json::json!({
        "tier": tier.name,
        "allowed": decision.allowed,
        "remaining": decision.remaining,
        "limit": decision.limit,
        "reset_at": decision.reset_at,
    })))
}

#[derive(Debug, Deserialize)]
struct SuggestionParams {
    q: Option<String>,
    limit: Option<i64>,
}

async fn suggestions(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SuggestionParams>,
) -> Result<impl IntoResponse, SearchError> {
    let suggestions = state
        .suggestions
        .suggestions(params.q.as_deref().unwrap_or(""), params.limit)
        .await
        .map_err(SearchError::Store)?;
    Ok(Json(serde_json::json!({ "suggestions": suggestions })))
}

#[derive(Debug, Deserialize)]
struct TrendingQueryParams {
    limit: Option<i64>,
}

async fn trending_queries(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TrendingQueryParams>,
) -> Result<impl IntoResponse, SearchError> {
    let queries = state
        .suggestions
        .trending_queries(params.limit)
        .await
        .map_err(SearchError::Store)?;
    Ok(Json(serde_json::json!({ "queries": queries })))
}

async fn recompute_trending(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, SearchError> {
    let summary = state.calculator.recompute(Utc::now()).await?;
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
struct RefreshRequest {
    source: String,
}

async fn internal_refresh(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RefreshRequest>,
) -> Result<impl IntoResponse, SearchError> {
    let source = SourceType::parse(&request.source).ok_or_else(|| {
        SearchError::validation("source", format!("unknown source type '{}'", request.source))
    })?;
    state
        .bus
        .publish(RefreshEvent::now(source))
        .await
        .map_err(SearchError::Store)?;
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "status": "accepted" }))))
}

async fn refresh_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.bus.subscribe()).filter_map(|msg| async move {
        // Lagged receivers just skip; the stream itself never errors.
        let event = msg.ok()?;
        Event::default().json_data(&event).ok().map(Ok::<_, Infallible>)
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/search", get(unified_search))
        .route("/api/v1/search/suggestions", get(suggestions))
        .route("/api/v1/search/trending-queries", get(trending_queries))
        .route("/api/v1/search/events", get(refresh_events))
        .route("/api/v1/quota", get(quota_status))
        .route("/api/v1/trending/recompute", post(recompute_trending))
        .route("/internal/refresh", post(internal_refresh))
        .with_state(state)
}

async fn build_state(config: &Config) -> anyhow::Result<Arc<AppState>> {
    let db = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await?;
    info!("connected to postgres");

    let bus: Arc<dyn RefreshBus> = match redis::Client::open(config.redis.url.as_str()) {
        Ok(client) => {
            match RedisBus::connect(client, config.redis.refresh_channel.clone()).await {
                Ok(bus) => Arc::new(bus),
                Err(err) => {
                    warn!("redis unavailable, refresh events stay process-local: {err}");
                    Arc::new(LocalBus::new())
                }
            }
        }
        Err(err) => {
            warn!("invalid redis url, refresh events stay process-local: {err}");
            Arc::new(LocalBus::new())
        }
    };

    let cap = config.search.source_fetch_cap;
    let trends = Arc::new(PgTrendRetriever::new(db.clone(), cap));
    let repos = Arc::new(PgRepoRetriever::new(db.clone(), cap));
    let knowledge = Arc::new(PgKnowledgeRetriever::new(db.clone(), cap));

    let retrievers: Vec<Arc<dyn SourceRetriever>> =
        vec![trends.clone(), repos.clone(), knowledge.clone()];
    let score_sources: Vec<Arc<dyn ScoreSource>> = vec![trends, repos, knowledge];

    let scores = Arc::new(PgScoreStore::new(db.clone()));
    let suggestions = Arc::new(SuggestionService::new(Arc::new(PgSuggestionStore::new(
        db.clone(),
    ))));

    let search = SearchService::new(
        retrievers,
        scores.clone(),
        suggestions.clone(),
        Duration::from_millis(config.search.source_deadline_ms),
    );

    let calculator = TrendingCalculator::new(
        score_sources
            .into_iter()
            .map(|source| {
                let params = config.trending.params_for(source.source());
                ScoredSource { source, params }
            })
            .collect(),
        scores,
    );

    let default_tier = SubscriptionTier::default_free(
        config.quota.default_hourly_limit,
        config.quota.default_daily_limit,
    );

    Ok(Arc::new(AppState {
        search,
        quota: QuotaTracker::new(Arc::new(PgQuotaStore::new(db.clone()))),
        tiers: TierResolver::new(Arc::new(PgTierStore::new(db)), default_tier),
        suggestions,
        calculator,
        bus,
        service_name: config.service.service_name.clone(),
    }))
}


#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "search_service=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    let state = build_state(&config).await?;
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", config.service.port);
    info!("{} listening on {addr}", config.service.service_name);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
