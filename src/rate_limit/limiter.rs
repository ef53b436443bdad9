use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{Duration, Utc};
use tracing::warn;

use crate::config::AccessConfig;
use crate::error::{Error, ErrorDetails};
use crate::identity::{Identity, IdentityKind};
use crate::rate_limit::{
    RateLimitAnalytics, RateLimitStatus, RateLimitTier, RateLimiterMetrics,
};
use crate::store::{CounterStore, CounterUpdate};

/// Tiered per-day rate limiter over an injected counter store.
///
/// The limiter owns policy (which tier gets which ceiling, what happens when
/// the store is down); the store owns the per-key atomicity. Counter keys are
/// tier-qualified so a tier change starts a fresh bucket instead of inheriting
/// a half-consumed one.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    config: Arc<ArcSwap<AccessConfig>>,
    metrics: RateLimiterMetrics,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, config: Arc<ArcSwap<AccessConfig>>) -> Self {
        Self {
            store,
            config,
            metrics: RateLimiterMetrics::default(),
        }
    }

    pub fn metrics(&self) -> &RateLimiterMetrics {
        &self.metrics
    }

    fn counter_key(identity: &Identity, tier: RateLimitTier) -> String {
        format!("{}|{tier}", identity.counting_key())
    }

    fn status_from_update(
        update: CounterUpdate,
        tier: RateLimitTier,
        daily_limit: Option<u32>,
    ) -> RateLimitStatus {
        let requests_remaining = match daily_limit {
            Some(limit) => limit.saturating_sub(update.count),
            None => u32::MAX,
        };
        RateLimitStatus {
            allowed: update.admitted,
            requests_remaining,
            daily_limit,
            reset_at: update.bucket_end,
            tier,
        }
    }

    /// Synthetic "allowed" status used when the store is unavailable and the
    /// policy says to fail open. Never persisted.
    fn fail_open_status(config: &AccessConfig, tier: RateLimitTier) -> RateLimitStatus {
        let daily_limit = config.daily_limit(tier);
        RateLimitStatus {
            allowed: true,
            requests_remaining: daily_limit.unwrap_or(u32::MAX),
            daily_limit,
            reset_at: config.day_bucket.bucket_for(Utc::now()).1,
            tier,
        }
    }

    /// Count this request and decide admission.
    ///
    /// Returns the post-increment status; a denied status means the counter
    /// was at its ceiling and the request was recorded as blocked. Store
    /// failures (including timeouts) fail open only for anonymous identities,
    /// and only when configured to; reflink-tied checks always fail closed
    /// because their ceilings back monetary guarantees.
    pub async fn check(
        &self,
        identity: &Identity,
        tier: RateLimitTier,
    ) -> Result<RateLimitStatus, Error> {
        self.check_with_ceiling(identity, tier, None).await
    }

    /// Like [`RateLimiter::check`] but with a per-caller ceiling override,
    /// used for reflinks that carry their own daily limit.
    pub async fn check_with_ceiling(
        &self,
        identity: &Identity,
        tier: RateLimitTier,
        ceiling_override: Option<u32>,
    ) -> Result<RateLimitStatus, Error> {
        let config = self.config.load();
        let daily_limit = ceiling_override.or_else(|| config.daily_limit(tier));
        let key = Self::counter_key(identity, tier);
        let now = Utc::now();

        let outcome = tokio::time::timeout(
            config.store_timeout(),
            self.store
                .increment(&key, tier, config.day_bucket, now, daily_limit),
        )
        .await;

        let update = match outcome {
            Ok(Ok(update)) => update,
            Ok(Err(e)) => return self.handle_store_failure(&config, identity, tier, e),
            Err(_) => {
                let e = Error::new(ErrorDetails::StoreUnavailable {
                    operation: "counter_increment",
                    message: format!(
                        "Counter store timed out after {}ms",
                        config.store_timeout_ms
                    ),
                });
                return self.handle_store_failure(&config, identity, tier, e);
            }
        };

        let status = Self::status_from_update(update, tier, daily_limit);
        if status.allowed {
            self.metrics.record_allowed();
        } else {
            self.metrics.record_denied();
        }
        Ok(status)
    }

    fn handle_store_failure(
        &self,
        config: &AccessConfig,
        identity: &Identity,
        tier: RateLimitTier,
        error: Error,
    ) -> Result<RateLimitStatus, Error> {
        self.metrics.record_store_error();

        if config.fail_open_anonymous && identity.kind() != IdentityKind::Reflink {
            warn!(
                identity = %identity,
                error = %error,
                "Counter store unavailable; failing open for anonymous identity"
            );
            self.metrics.record_fail_open_allow();
            return Ok(Self::fail_open_status(config, tier));
        }

        Err(error)
    }

    /// Non-consuming view of an identity's current standing. A missing or
    /// elapsed bucket reads as a full allowance.
    pub async fn status(
        &self,
        identity: &Identity,
        tier: RateLimitTier,
    ) -> Result<RateLimitStatus, Error> {
        let config = self.config.load();
        let daily_limit = config.daily_limit(tier);
        let key = Self::counter_key(identity, tier);
        let now = Utc::now();

        let update = tokio::time::timeout(config.store_timeout(), self.store.peek(&key, now))
            .await
            .map_err(|_| {
                Error::new(ErrorDetails::StoreUnavailable {
                    operation: "counter_peek",
                    message: format!(
                        "Counter store timed out after {}ms",
                        config.store_timeout_ms
                    ),
                })
            })??;

        Ok(match update {
            Some(update) => {
                let mut status = Self::status_from_update(update, tier, daily_limit);
                // A peek never denies; it reports standing.
                status.allowed = daily_limit.is_none_or(|limit| update.count < limit);
                status
            }
            None => RateLimitStatus {
                allowed: true,
                requests_remaining: daily_limit.unwrap_or(u32::MAX),
                daily_limit,
                reset_at: config.day_bucket.bucket_for(now).1,
                tier,
            },
        })
    }

    /// Aggregate traffic over the trailing window for the admin dashboard.
    pub async fn analytics(&self, window_days: u32) -> Result<RateLimitAnalytics, Error> {
        let since = Utc::now() - Duration::days(i64::from(window_days));
        let snapshots = self.store.scan_counters(since).await?;

        let mut analytics = RateLimitAnalytics {
            window_days,
            ..Default::default()
        };
        let mut identities = HashSet::new();
        for snapshot in snapshots {
            analytics.total_requests += u64::from(snapshot.admitted) + u64::from(snapshot.blocked);
            analytics.blocked_requests += u64::from(snapshot.blocked);
            // Strip the tier qualifier so one identity on two tiers counts
            // once.
            let identity = snapshot
                .key
                .rsplit_once('|')
                .map_or(snapshot.key.clone(), |(prefix, _)| prefix.to_string());
            identities.insert(identity);
        }
        analytics.unique_identities = identities.len() as u64;

        Ok(analytics)
    }

    /// Drop counters whose bucket elapsed before the retention margin.
    pub async fn cleanup(&self) -> Result<u64, Error> {
        let config = self.config.load();
        let cutoff = Utc::now() - Duration::days(i64::from(config.counter_retention_days));
        self.store.sweep_counters(cutoff).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use crate::rate_limit::DayBucketPolicy;
    use crate::store::{CounterSnapshot, MemoryStore};

    fn limiter_with(store: Arc<dyn CounterStore>, config: AccessConfig) -> RateLimiter {
        RateLimiter::new(store, Arc::new(ArcSwap::from_pointee(config)))
    }

    /// Store double whose every call fails.
    struct DownStore;

    #[async_trait]
    impl CounterStore for DownStore {
        async fn increment(
            &self,
            _key: &str,
            _tier: RateLimitTier,
            _policy: DayBucketPolicy,
            _now: DateTime<Utc>,
            _ceiling: Option<u32>,
        ) -> Result<CounterUpdate, Error> {
            Err(Error::new_without_logging(ErrorDetails::StoreUnavailable {
                operation: "counter_increment",
                message: "connection refused".to_string(),
            }))
        }

        async fn peek(
            &self,
            _key: &str,
            _now: DateTime<Utc>,
        ) -> Result<Option<CounterUpdate>, Error> {
            Err(Error::new_without_logging(ErrorDetails::StoreUnavailable {
                operation: "counter_peek",
                message: "connection refused".to_string(),
            }))
        }

        async fn scan_counters(
            &self,
            _since: DateTime<Utc>,
        ) -> Result<Vec<CounterSnapshot>, Error> {
            Ok(vec![])
        }

        async fn sweep_counters(&self, _expired_before: DateTime<Utc>) -> Result<u64, Error> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_denies_once_ceiling_reached() {
        let mut config = AccessConfig::default();
        config.tiers.standard = 3;
        let limiter = limiter_with(Arc::new(MemoryStore::new()), config);
        let identity = Identity::Session("sess-1".to_string());

        for remaining in [2u32, 1, 0] {
            let status = limiter
                .check(&identity, RateLimitTier::Standard)
                .await
                .expect("check");
            assert!(status.allowed);
            assert_eq!(status.requests_remaining, remaining);
        }

        let status = limiter
            .check(&identity, RateLimitTier::Standard)
            .await
            .expect("check");
        assert!(!status.allowed);
        assert_eq!(status.requests_remaining, 0);
        assert_eq!(limiter.metrics().denied.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_unlimited_tier_never_denies() {
        let limiter = limiter_with(Arc::new(MemoryStore::new()), AccessConfig::default());
        let identity = Identity::Session("admin".to_string());

        for _ in 0..100 {
            let status = limiter
                .check(&identity, RateLimitTier::Unlimited)
                .await
                .expect("check");
            assert!(status.allowed);
            assert_eq!(status.daily_limit, None);
        }
    }

    #[tokio::test]
    async fn test_tiers_count_separately() {
        let limiter = limiter_with(Arc::new(MemoryStore::new()), AccessConfig::default());
        let identity = Identity::Ip("198.51.100.9".parse().expect("valid IP"));

        limiter
            .check(&identity, RateLimitTier::Standard)
            .await
            .expect("check");
        let extended = limiter
            .check(&identity, RateLimitTier::Extended)
            .await
            .expect("check");

        // Fresh bucket on the new tier, nothing inherited.
        assert_eq!(extended.requests_remaining, 199);
    }

    #[tokio::test]
    async fn test_fail_open_for_anonymous_identity() {
        let limiter = limiter_with(Arc::new(DownStore), AccessConfig::default());
        let identity = Identity::Ip("198.51.100.10".parse().expect("valid IP"));

        let status = limiter
            .check(&identity, RateLimitTier::Standard)
            .await
            .expect("fails open");
        assert!(status.allowed);
        assert_eq!(limiter.metrics().fail_open_allows.load(Ordering::Relaxed), 1);
        assert_eq!(limiter.metrics().store_errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_reflink_identity_fails_closed() {
        let limiter = limiter_with(Arc::new(DownStore), AccessConfig::default());
        let identity = Identity::Reflink("rfl_abc".to_string());

        let result = limiter.check(&identity, RateLimitTier::Premium).await;
        assert!(result.is_err());
        assert_eq!(limiter.metrics().fail_open_allows.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_fail_closed_when_configured() {
        let config = AccessConfig {
            fail_open_anonymous: false,
            ..Default::default()
        };
        let limiter = limiter_with(Arc::new(DownStore), config);
        let identity = Identity::Ip("198.51.100.11".parse().expect("valid IP"));

        assert!(limiter.check(&identity, RateLimitTier::Standard).await.is_err());
    }

    #[tokio::test]
    async fn test_status_does_not_consume() {
        let mut config = AccessConfig::default();
        config.tiers.standard = 5;
        let limiter = limiter_with(Arc::new(MemoryStore::new()), config);
        let identity = Identity::Session("sess-2".to_string());

        limiter
            .check(&identity, RateLimitTier::Standard)
            .await
            .expect("check");

        for _ in 0..10 {
            let status = limiter
                .status(&identity, RateLimitTier::Standard)
                .await
                .expect("status");
            assert!(status.allowed);
            assert_eq!(status.requests_remaining, 4);
        }
    }

    #[tokio::test]
    async fn test_analytics_aggregates_and_dedupes() {
        let mut config = AccessConfig::default();
        config.tiers.standard = 2;
        let limiter = limiter_with(Arc::new(MemoryStore::new()), config);
        let first = Identity::Ip("198.51.100.12".parse().expect("valid IP"));
        let second = Identity::Session("sess-3".to_string());

        for _ in 0..3 {
            limiter
                .check(&first, RateLimitTier::Standard)
                .await
                .expect("check");
        }
        limiter
            .check(&first, RateLimitTier::Extended)
            .await
            .expect("check");
        limiter
            .check(&second, RateLimitTier::Standard)
            .await
            .expect("check");

        let analytics = limiter.analytics(7).await.expect("analytics");
        assert_eq!(analytics.total_requests, 5);
        assert_eq!(analytics.blocked_requests, 1);
        assert_eq!(analytics.unique_identities, 2);
    }
}
