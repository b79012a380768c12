use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;

use crate::models::SourceType;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub search: SearchConfig,
    pub trending: TrendingConfig,
    pub quota: QuotaConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub port: u16,
    pub service_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    pub refresh_channel: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    /// Per-source retrieval cap applied before merging.
    pub source_fetch_cap: i64,
    /// Deadline for one retriever before it is degraded to empty.
    pub source_deadline_ms: u64,
}

/// Scale constants and retention windows for the trending batch.
///
/// The per-source engagement scales are deliberately distinct; trend
/// engagement and repo stars are not comparable quantities.
#[derive(Debug, Clone, Deserialize)]
pub struct TrendingConfig {
    pub trend_engagement_scale: f64,
    pub trend_velocity_scale: f64,
    pub trend_retention_days: i64,
    pub repo_engagement_scale: f64,
    pub repo_velocity_scale: f64,
    pub repo_retention_days: i64,
    pub knowledge_engagement_scale: f64,
    pub knowledge_velocity_scale: f64,
    pub knowledge_retention_days: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct ScoreParams {
    pub engagement_scale: f64,
    pub velocity_scale: f64,
    pub retention_days: i64,
}

impl TrendingConfig {
    pub fn params_for(&self, source: SourceType) -> ScoreParams {
        match source {
            SourceType::Trend => ScoreParams {
                engagement_scale: self.trend_engagement_scale,
                velocity_scale: self.trend_velocity_scale,
                retention_days: self.trend_retention_days,
            },
            SourceType::Repo => ScoreParams {
                engagement_scale: self.repo_engagement_scale,
                velocity_scale: self.repo_velocity_scale,
                retention_days: self.repo_retention_days,
            },
            SourceType::KnowledgeEntry => ScoreParams {
                engagement_scale: self.knowledge_engagement_scale,
                velocity_scale: self.knowledge_velocity_scale,
                retention_days: self.knowledge_retention_days,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    pub default_hourly_limit: i64,
    pub default_daily_limit: i64,
}

fn env_or<T: std::str::FromStr>(key: &str, default: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse::<T>()
        .with_context(|| format!("{key} must be a valid {}", std::any::type_name::<T>()))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Config {
            service: ServiceConfig {
                port: env_or("PORT", "8084")?,
                service_name: env::var("SERVICE_NAME")
                    .unwrap_or_else(|_| "search-service".to_string()),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", "10")?,
            },
            redis: RedisConfig {
                url: env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
                refresh_channel: env::var("REFRESH_CHANNEL")
                    .unwrap_or_else(|_| "search:refresh".to_string()),
            },
            search: SearchConfig {
                source_fetch_cap: env_or("SOURCE_FETCH_CAP", "100")?,
                source_deadline_ms: env_or("SOURCE_DEADLINE_MS", "2000")?,
            },
            trending: TrendingConfig {
                trend_engagement_scale: env_or("TREND_ENGAGEMENT_SCALE", "100000")?,
                trend_velocity_scale: env_or("TREND_VELOCITY_SCALE", "5000")?,
                trend_retention_days: env_or("TREND_RETENTION_DAYS", "7")?,
                repo_engagement_scale: env_or("REPO_ENGAGEMENT_SCALE", "50000")?,
                repo_velocity_scale: env_or("REPO_VELOCITY_SCALE", "500")?,
                repo_retention_days: env_or("REPO_RETENTION_DAYS", "30")?,
                knowledge_engagement_scale: env_or("KNOWLEDGE_ENGAGEMENT_SCALE", "10000")?,
                knowledge_velocity_scale: env_or("KNOWLEDGE_VELOCITY_SCALE", "100")?,
                knowledge_retention_days: env_or("KNOWLEDGE_RETENTION_DAYS", "90")?,
            },
            quota: QuotaConfig {
                default_hourly_limit: env_or("DEFAULT_HOURLY_LIMIT", "50")?,
                default_daily_limit: env_or("DEFAULT_DAILY_LIMIT", "500")?,
            },
        })
    }
}
