//! Tier resolution and quota-based admission control.
//!
//! Buckets are keyed `(caller_id, date, hour_of_day)` in UTC. The hourly
//! counter resets with every new hour bucket; the daily counter is
//! carried forward from the latest prior bucket of the same date, so the
//! newest bucket of a date always holds that day's running total.
//!
//! Admission is a single conditional increment ([`QuotaStore::conditional_increment`]):
//! the counter only moves when both limits still hold, so two concurrent
//! requests can never both slip through a last remaining slot. The
//! read-only [`QuotaTracker::check_quota`] exists for status reporting
//! and never consumes quota.

use async_trait::async_trait;
use chrono::{DateTime, Days, Duration, NaiveDate, NaiveTime, Timelike, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::error::{SearchError, StoreError};
use crate::models::{QuotaDecision, QuotaDenialReason, RateLimitBucket, SubscriptionTier};

/// Caller id used for quota accounting of unauthenticated requests.
pub const ANONYMOUS_CALLER: &str = "anonymous";

/// Parses the caller credential header. Absent means anonymous; a
/// malformed value is an authentication error.
pub fn parse_caller(header: Option<&str>) -> Result<Option<Uuid>, SearchError> {
    match header {
        None => Ok(None),
        Some(raw) => Uuid::parse_str(raw.trim())
            .map(Some)
            .map_err(|_| SearchError::Auth),
    }
}

pub fn caller_key(caller: Option<Uuid>) -> String {
    match caller {
        Some(id) => id.to_string(),
        None => ANONYMOUS_CALLER.to_string(),
    }
}

pub fn bucket_key(now: DateTime<Utc>) -> (NaiveDate, i16) {
    (now.date_naive(), now.hour() as i16)
}

/// Start of the next hour bucket.
pub fn next_hour(now: DateTime<Utc>) -> DateTime<Utc> {
    let day_start = now.date_naive().and_time(NaiveTime::MIN).and_utc();
    day_start + Duration::hours(now.hour() as i64 + 1)
}

/// Start of the next UTC date.
pub fn next_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    (now.date_naive() + Days::new(1))
        .and_time(NaiveTime::MIN)
        .and_utc()
}

fn admitted(
    hourly_count: i64,
    daily_count: i64,
    tier: &SubscriptionTier,
    now: DateTime<Utc>,
) -> QuotaDecision {
    let remaining = (tier.hourly_limit - hourly_count)
        .min(tier.daily_limit - daily_count)
        .max(0);
    QuotaDecision {
        allowed: true,
        remaining,
        limit: tier.hourly_limit,
        reset_at: next_hour(now),
        reason: None,
    }
}

fn denied(
    hourly_count: i64,
    _daily_count: i64,
    tier: &SubscriptionTier,
    now: DateTime<Utc>,
) -> QuotaDecision {
    if hourly_count >= tier.hourly_limit {
        QuotaDecision {
            allowed: false,
            remaining: 0,
            limit: tier.hourly_limit,
            reset_at: next_hour(now),
            reason: Some(QuotaDenialReason::Hourly),
        }
    } else {
        QuotaDecision {
            allowed: false,
            remaining: 0,
            limit: tier.daily_limit,
            reset_at: next_midnight(now),
            reason: Some(QuotaDenialReason::Daily),
        }
    }
}

/// Store access for the quota tracker.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Atomically increments the caller's current bucket, creating it
    /// with the carried-forward daily count when absent, but only while
    /// both limits hold. Returns the post-increment bucket on admission,
    /// `None` on denial.
    async fn conditional_increment(
        &self,
        caller: &str,
        date: NaiveDate,
        hour: i16,
        hourly_limit: i64,
        daily_limit: i64,
    ) -> Result<Option<RateLimitBucket>, StoreError>;

    async fn bucket(
        &self,
        caller: &str,
        date: NaiveDate,
        hour: i16,
    ) -> Result<Option<RateLimitBucket>, StoreError>;

    /// Daily count of the latest bucket before `hour` on `date`, 0 when
    /// none exists.
    async fn carried_daily(
        &self,
        caller: &str,
        date: NaiveDate,
        hour: i16,
    ) -> Result<i64, StoreError>;

    /// Appends one row to the append-only usage log.
    async fn log_usage(
        &self,
        caller: &str,
        endpoint: &str,
        method: &str,
        status: u16,
        remaining: i64,
    ) -> Result<(), StoreError>;
}

pub struct QuotaTracker {
    store: Arc<dyn QuotaStore>,
}

impl QuotaTracker {
    pub fn new(store: Arc<dyn QuotaStore>) -> Self {
        Self { store }
    }

    /// Read-only admission check. Falls back to zero hourly usage when
    /// the current hour has no bucket yet; the daily count is read from
    /// the latest bucket of the date so earlier hours still count.
    pub async fn check_quota(
        &self,
        caller: &str,
        tier: &SubscriptionTier,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision, StoreError> {
        let (date, hour) = bucket_key(now);
        let (hourly_count, daily_count) = match self.store.bucket(caller, date, hour).await? {
            Some(bucket) => (bucket.hourly_count, bucket.daily_count),
            None => (0, self.store.carried_daily(caller, date, hour).await?),
        };

        if hourly_count >= tier.hourly_limit || daily_count >= tier.daily_limit {
            Ok(denied(hourly_count, daily_count, tier, now))
        } else {
            Ok(admitted(hourly_count, daily_count, tier, now))
        }
    }

    /// Atomic admission: checks and consumes one unit of quota in a
    /// single conditional increment.
    pub async fn try_admit(
        &self,
        caller: &str,
        tier: &SubscriptionTier,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision, StoreError> {
        let (date, hour) = bucket_key(now);
        let outcome = self
            .store
            .conditional_increment(caller, date, hour, tier.hourly_limit, tier.daily_limit)
            .await?;

        match outcome {
            Some(bucket) => Ok(admitted(bucket.hourly_count, bucket.daily_count, tier, now)),
            None => {
                let (hourly_count, daily_count) =
                    match self.store.bucket(caller, date, hour).await? {
                        Some(bucket) => (bucket.hourly_count, bucket.daily_count),
                        // No current bucket means the carried daily count
                        // alone exhausted the daily limit.
                        None => (0, self.store.carried_daily(caller, date, hour).await?),
                    };
                Ok(denied(hourly_count, daily_count, tier, now))
            }
        }
    }

    pub async fn log_usage(
        &self,
        caller: &str,
        endpoint: &str,
        method: &str,
        status: u16,
        remaining: i64,
    ) {
        if let Err(err) = self
            .store
            .log_usage(caller, endpoint, method, status, remaining)
            .await
        {
            warn!("failed to append usage log for {caller}: {err}");
        }
    }
}

/// Store access for tier resolution.
#[async_trait]
pub trait TierStore: Send + Sync {
    async fn active_tier(&self, caller: Uuid) -> Result<Option<SubscriptionTier>, StoreError>;
}

/// Maps a caller to the single tier in effect. Read-only and infallible:
/// missing data and store failures degrade to the default tier.
pub struct TierResolver {
    store: Arc<dyn TierStore>,
    default_tier: SubscriptionTier,
}

impl TierResolver {
    pub fn new(store: Arc<dyn TierStore>, default_tier: SubscriptionTier) -> Self {
        Self {
            store,
            default_tier,
        }
    }

    pub async fn resolve(&self, caller: Option<Uuid>) -> SubscriptionTier {
        let Some(caller) = caller else {
            return self.default_tier.clone();
        };
        match self.store.active_tier(caller).await {
            Ok(Some(tier)) => tier,
            Ok(None) => self.default_tier.clone(),
            Err(err) => {
                warn!("tier lookup failed for {caller}, using default tier: {err}");
                self.default_tier.clone()
            }
        }
    }
}

// ============================================
// Postgres implementations
// ============================================

pub struct PgQuotaStore {
    db: PgPool,
}

impl PgQuotaStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[derive(sqlx::FromRow)]
struct BucketCounts {
    hourly_count: i64,
    daily_count: i64,
}

#[async_trait]
impl QuotaStore for PgQuotaStore {
    async fn conditional_increment(
        &self,
        caller: &str,
        date: NaiveDate,
        hour: i16,
        hourly_limit: i64,
        daily_limit: i64,
    ) -> Result<Option<RateLimitBucket>, StoreError> {
        // One statement so concurrent admissions serialize on the row:
        // the insert arm seeds the daily count from the latest prior
        // bucket of the date and refuses when the carried count already
        // meets the daily limit; the update arm increments only while
        // both limits hold. No row returned means denial.
        let row: Option<BucketCounts> = sqlx::query_as(
            r#"
            WITH carried AS (
                SELECT COALESCE(
                    (SELECT daily_count
                     FROM rate_limit_buckets
                     WHERE caller_id = $1 AND bucket_date = $2 AND bucket_hour < $3
                     ORDER BY bucket_hour DESC
                     LIMIT 1),
                    0
                ) AS daily
            )
            INSERT INTO rate_limit_buckets AS b
                (caller_id, bucket_date, bucket_hour, hourly_count, daily_count)
            SELECT $1, $2, $3, 1, carried.daily + 1
            FROM carried
            WHERE carried.daily < $5 AND $4 > 0
            ON CONFLICT (caller_id, bucket_date, bucket_hour) DO UPDATE
            SET hourly_count = b.hourly_count + 1,
                daily_count = b.daily_count + 1
            WHERE b.hourly_count < $4 AND b.daily_count < $5
            RETURNING hourly_count, daily_count
            "#,
        )
        .bind(caller)
        .bind(date)
        .bind(hour)
        .bind(hourly_limit)
        .bind(daily_limit)
        .fetch_optional(&self.db)
        .await?;

        Ok(row.map(|counts| RateLimitBucket {
            caller_id: caller.to_string(),
            bucket_date: date,
            bucket_hour: hour,
            hourly_count: counts.hourly_count,
            daily_count: counts.daily_count,
        }))
    }

    async fn bucket(
        &self,
        caller: &str,
        date: NaiveDate,
        hour: i16,
    ) -> Result<Option<RateLimitBucket>, StoreError> {
        let row: Option<BucketCounts> = sqlx::query_as(
            r#"
            SELECT hourly_count, daily_count
            FROM rate_limit_buckets
            WHERE caller_id = $1 AND bucket_date = $2 AND bucket_hour = $3
            "#,
        )
        .bind(caller)
        .bind(date)
        .bind(hour)
        .fetch_optional(&self.db)
        .await?;

        Ok(row.map(|counts| RateLimitBucket {
            caller_id: caller.to_string(),
            bucket_date: date,
            bucket_hour: hour,
            hourly_count: counts.hourly_count,
            daily_count: counts.daily_count,
        }))
    }

    async fn carried_daily(
        &self,
        caller: &str,
        date: NaiveDate,
        hour: i16,
    ) -> Result<i64, StoreError> {
        let carried: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT daily_count
            FROM rate_limit_buckets
            WHERE caller_id = $1 AND bucket_date = $2 AND bucket_hour < $3
            ORDER BY bucket_hour DESC
            LIMIT 1
            "#,
        )
        .bind(caller)
        .bind(date)
        .bind(hour)
        .fetch_optional(&self.db)
        .await?;

        Ok(carried.map(|(daily,)| daily).unwrap_or(0))
    }

    async fn log_usage(
        &self,
        caller: &str,
        endpoint: &str,
        method: &str,
        status: u16,
        remaining: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO api_usage_log (caller_id, endpoint, method, status_code, remaining_quota)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(caller)
        .bind(endpoint)
        .bind(method)
        .bind(status as i32)
        .bind(remaining)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

pub struct PgTierStore {
    db: PgPool,
}

impl PgTierStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[derive(sqlx::FromRow)]
struct TierRow {
    name: String,
    hourly_limit: i64,
    daily_limit: i64,
    features: Vec<String>,
}

#[async_trait]
impl TierStore for PgTierStore {
    async fn active_tier(&self, caller: Uuid) -> Result<Option<SubscriptionTier>, StoreError> {
        let row: Option<TierRow> = sqlx::query_as(
            r#"
            SELECT t.name, t.hourly_limit, t.daily_limit, t.features
            FROM subscriptions s
            JOIN subscription_tiers t ON t.name = s.tier_name
            WHERE s.user_id = $1
              AND s.status = 'active'
              AND (s.current_period_end IS NULL OR s.current_period_end > NOW())
            ORDER BY s.created_at DESC
            LIMIT 1
            "#,
        )
        .bind(caller)
        .fetch_optional(&self.db)
        .await?;

        Ok(row.map(|tier| SubscriptionTier {
            name: tier.name,
            hourly_limit: tier.hourly_limit,
            daily_limit: tier.daily_limit,
            features: tier.features,
        }))
    }
}

// ============================================
// In-memory implementations (tests, local development)
// ============================================

#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub caller: String,
    pub endpoint: String,
    pub method: String,
    pub status: u16,
    pub remaining: i64,
}

#[derive(Default)]
struct MemoryQuotaState {
    buckets: HashMap<(String, NaiveDate, i16), (i64, i64)>,
    usage: Vec<UsageRecord>,
}

/// Mutex-serialized quota store; the whole check-and-increment runs
/// under one lock, matching the atomicity of the SQL statement.
#[derive(Default)]
pub struct MemoryQuotaStore {
    state: tokio::sync::Mutex<MemoryQuotaState>,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn usage_records(&self) -> Vec<UsageRecord> {
        self.state.lock().await.usage.clone()
    }

    fn carried(state: &MemoryQuotaState, caller: &str, date: NaiveDate, hour: i16) -> i64 {
        state
            .buckets
            .iter()
            .filter(|((c, d, h), _)| c == caller && *d == date && *h < hour)
            .max_by_key(|((_, _, h), _)| *h)
            .map(|(_, (_, daily))| *daily)
            .unwrap_or(0)
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn conditional_increment(
        &self,
        caller: &str,
        date: NaiveDate,
        hour: i16,
        hourly_limit: i64,
        daily_limit: i64,
    ) -> Result<Option<RateLimitBucket>, StoreError> {
        let mut state = self.state.lock().await;
        let key = (caller.to_string(), date, hour);
        let (hourly, daily) = match state.buckets.get(&key) {
            Some(&counts) => counts,
            None => (0, Self::carried(&state, caller, date, hour)),
        };

        if hourly >= hourly_limit || daily >= daily_limit {
            return Ok(None);
        }

        let updated = (hourly + 1, daily + 1);
        state.buckets.insert(key, updated);
        Ok(Some(RateLimitBucket {
            caller_id: caller.to_string(),
            bucket_date: date,
            bucket_hour: hour,
            hourly_count: updated.0,
            daily_count: updated.1,
        }))
    }

    async fn bucket(
        &self,
        caller: &str,
        date: NaiveDate,
        hour: i16,
    ) -> Result<Option<RateLimitBucket>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .buckets
            .get(&(caller.to_string(), date, hour))
            .map(|&(hourly_count, daily_count)| RateLimitBucket {
                caller_id: caller.to_string(),
                bucket_date: date,
                bucket_hour: hour,
                hourly_count,
                daily_count,
            }))
    }

    async fn carried_daily(
        &self,
        caller: &str,
        date: NaiveDate,
        hour: i16,
    ) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        Ok(Self::carried(&state, caller, date, hour))
    }

    async fn log_usage(
        &self,
        caller: &str,
        endpoint: &str,
        method: &str,
        status: u16,
        remaining: i64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.usage.push(UsageRecord {
            caller: caller.to_string(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            status,
            remaining,
        });
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryTierStore {
    tiers: HashMap<Uuid, SubscriptionTier>,
}

impl MemoryTierStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tier(mut self, caller: Uuid, tier: SubscriptionTier) -> Self {
        self.tiers.insert(caller, tier);
        self
    }
}

#[async_trait]
impl TierStore for MemoryTierStore {
    async fn active_tier(&self, caller: Uuid) -> Result<Option<SubscriptionTier>, StoreError> {
        Ok(self.tiers.get(&caller).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tier(hourly: i64, daily: i64) -> SubscriptionTier {
        SubscriptionTier {
            name: "test".to_string(),
            hourly_limit: hourly,
            daily_limit: daily,
            features: Vec::new(),
        }
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 15, hour, minute, 0).unwrap()
    }

    fn tracker() -> (QuotaTracker, Arc<MemoryQuotaStore>) {
        let store = Arc::new(MemoryQuotaStore::new());
        (QuotaTracker::new(store.clone()), store)
    }

    #[test]
    fn test_next_hour_and_midnight() {
        let now = at(9, 41);
        assert_eq!(next_hour(now), at(10, 0));
        assert_eq!(
            next_midnight(now),
            Utc.with_ymd_and_hms(2025, 6, 16, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_parse_caller() {
        assert_eq!(parse_caller(None).unwrap(), None);
        let id = Uuid::new_v4();
        assert_eq!(
            parse_caller(Some(&id.to_string())).unwrap(),
            Some(id)
        );
        assert!(matches!(
            parse_caller(Some("not-a-uuid")),
            Err(SearchError::Auth)
        ));
    }

    #[tokio::test]
    async fn test_hourly_quota_scenario() {
        let (tracker, _) = tracker();
        let tier = tier(10, 1_000);
        let now = at(9, 0);

        for expected_remaining in (0..10).rev() {
            let decision = tracker.try_admit("caller", &tier, now).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }

        let denial = tracker.try_admit("caller", &tier, now).await.unwrap();
        assert!(!denial.allowed);
        assert_eq!(denial.reason, Some(QuotaDenialReason::Hourly));
        assert_eq!(denial.reset_at, at(10, 0));

        // New hour bucket: hourly usage resets, remaining is 9 again.
        let next = tracker.try_admit("caller", &tier, at(10, 5)).await.unwrap();
        assert!(next.allowed);
        assert_eq!(next.remaining, 9);
    }

    #[tokio::test]
    async fn test_daily_count_carries_forward() {
        let (tracker, store) = tracker();
        let tier = tier(2, 100);

        for hour in 0..3 {
            for _ in 0..2 {
                let decision = tracker
                    .try_admit("caller", &tier, at(hour, 30))
                    .await
                    .unwrap();
                assert!(decision.allowed);
            }
        }

        // The latest bucket's daily count equals the sum of the day's calls.
        let (date, _) = bucket_key(at(2, 30));
        let latest = store.bucket("caller", date, 2).await.unwrap().unwrap();
        assert_eq!(latest.daily_count, 6);
        assert_eq!(latest.hourly_count, 2);
    }

    #[tokio::test]
    async fn test_daily_limit_denial() {
        let (tracker, _) = tracker();
        let tier = tier(100, 3);

        for hour in 0..3 {
            let decision = tracker
                .try_admit("caller", &tier, at(hour, 0))
                .await
                .unwrap();
            assert!(decision.allowed);
        }

        let denial = tracker.try_admit("caller", &tier, at(3, 0)).await.unwrap();
        assert!(!denial.allowed);
        assert_eq!(denial.reason, Some(QuotaDenialReason::Daily));
        assert_eq!(
            denial.reset_at,
            Utc.with_ymd_and_hms(2025, 6, 16, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_admissions_never_over_admit() {
        let store = Arc::new(MemoryQuotaStore::new());
        let tracker = Arc::new(QuotaTracker::new(store));
        let tier = tier(1, 100);
        let now = at(9, 0);

        let a = {
            let tracker = tracker.clone();
            let tier = tier.clone();
            tokio::spawn(async move { tracker.try_admit("caller", &tier, now).await.unwrap() })
        };
        let b = {
            let tracker = tracker.clone();
            let tier = tier.clone();
            tokio::spawn(async move { tracker.try_admit("caller", &tier, now).await.unwrap() })
        };

        let (first, second) = (a.await.unwrap(), b.await.unwrap());
        let admitted = [&first, &second].iter().filter(|d| d.allowed).count();
        assert_eq!(admitted, 1, "exactly one of two racing admissions may pass");
    }

    #[tokio::test]
    async fn test_check_quota_is_read_only() {
        let (tracker, _) = tracker();
        let tier = tier(5, 50);
        let now = at(12, 0);

        for _ in 0..3 {
            let decision = tracker.check_quota("caller", &tier, now).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, 5, "check must not consume quota");
        }
    }

    #[tokio::test]
    async fn test_check_quota_sees_carried_daily_usage() {
        let (tracker, _) = tracker();
        let tier = tier(10, 4);

        for _ in 0..4 {
            tracker.try_admit("caller", &tier, at(8, 0)).await.unwrap();
        }

        // New hour, no bucket yet; the day's usage still applies.
        let decision = tracker.check_quota("caller", &tier, at(9, 0)).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(QuotaDenialReason::Daily));
    }

    struct FailingTierStore;

    #[async_trait]
    impl TierStore for FailingTierStore {
        async fn active_tier(
            &self,
            _caller: Uuid,
        ) -> Result<Option<SubscriptionTier>, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_tier_resolver_degrades_to_default() {
        let default_tier = SubscriptionTier::default_free(50, 500);

        // No caller.
        let resolver = TierResolver::new(Arc::new(MemoryTierStore::new()), default_tier.clone());
        assert_eq!(resolver.resolve(None).await.name, "free");

        // Caller without a subscription.
        let unknown = Uuid::new_v4();
        assert_eq!(resolver.resolve(Some(unknown)).await.name, "free");

        // Store failure degrades instead of erroring.
        let resolver = TierResolver::new(Arc::new(FailingTierStore), default_tier.clone());
        assert_eq!(resolver.resolve(Some(unknown)).await.name, "free");

        // Active subscription wins.
        let subscriber = Uuid::new_v4();
        let resolver = TierResolver::new(
            Arc::new(MemoryTierStore::new().with_tier(subscriber, tier(1_000, 10_000))),
            default_tier,
        );
        let resolved = resolver.resolve(Some(subscriber)).await;
        assert_eq!(resolved.hourly_limit, 1_000);
    }
}
