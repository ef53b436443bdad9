use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;

use crate::abuse::{AbuseDetector, AbuseVerdict, ContentClassifier, KeywordClassifier};
use crate::blacklist::BlacklistManager;
use crate::cache::{CacheStats, TtlCache};
use crate::config::AccessConfig;
use crate::error::{Error, ErrorDetails};
use crate::identity::{Identity, RequestIdentity};
use crate::rate_limit::{RateLimitStatus, RateLimitTier, RateLimiter};
use crate::reflink::{AiFeature, BudgetStatus, Reflink, ReflinkManager, ReflinkValidation};
use crate::store::{BlacklistStore, CounterStore, ReflinkStore, UsageReceipt};

/// What a caller wants to do, as extracted from the inbound request.
#[derive(Debug, Clone)]
pub struct AccessRequest {
    pub identity: RequestIdentity,
    pub feature: AiFeature,
}

/// Proof that a request passed every gate, with the telemetry routes attach
/// to the response.
#[derive(Debug, Clone)]
pub struct AccessGrant {
    pub identity: Identity,
    pub tier: RateLimitTier,
    pub rate_limit: RateLimitStatus,
    /// Present when access came through a reflink.
    pub reflink: Option<Reflink>,
    pub budget: Option<BudgetStatus>,
}

/// Cached feature-availability snapshot for UI gating. Advisory only; the
/// authoritative decision is [`AccessControl::check_access`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureStatus {
    pub feature: AiFeature,
    pub enabled: bool,
    pub tier: RateLimitTier,
    pub rate_limit: RateLimitStatus,
    pub budget: Option<BudgetStatus>,
}

/// What one maintenance sweep removed or retired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub counters_swept: u64,
    pub reflinks_retired: u64,
    pub blacklist_swept: u64,
    pub status_cache_swept: u64,
}

/// The access control facade: one entry point composing the blacklist,
/// reflink validation, feature gating, and rate limiting, in that order.
///
/// Ordering is deliberate. The blacklist is cheapest and most severe, so it
/// runs first; the rate-limit counter runs last so a denied request never
/// consumes quota.
pub struct AccessControl {
    config: Arc<ArcSwap<AccessConfig>>,
    rate_limiter: Arc<RateLimiter>,
    reflinks: Arc<ReflinkManager>,
    blacklist: Arc<BlacklistManager>,
    abuse: Arc<AbuseDetector>,
    status_cache: TtlCache<String, FeatureStatus>,
}

impl AccessControl {
    /// Wire the facade over a single store implementing all three store
    /// traits, with the default keyword classifier.
    pub fn new<S>(config: AccessConfig, store: Arc<S>) -> Self
    where
        S: CounterStore + ReflinkStore + BlacklistStore + 'static,
    {
        Self::with_classifier(config, store, Arc::new(KeywordClassifier))
    }

    pub fn with_classifier<S>(
        config: AccessConfig,
        store: Arc<S>,
        classifier: Arc<dyn ContentClassifier>,
    ) -> Self
    where
        S: CounterStore + ReflinkStore + BlacklistStore + 'static,
    {
        let status_cache_ttl = Duration::from_secs(config.status_cache_ttl_secs);
        let config = Arc::new(ArcSwap::from_pointee(config));

        let rate_limiter = Arc::new(RateLimiter::new(
            store.clone() as Arc<dyn CounterStore>,
            config.clone(),
        ));
        let reflinks = Arc::new(ReflinkManager::new(
            store.clone() as Arc<dyn ReflinkStore>,
            config.clone(),
        ));
        let blacklist = Arc::new(BlacklistManager::new(
            store as Arc<dyn BlacklistStore>,
            config.clone(),
        ));
        let abuse = Arc::new(AbuseDetector::new(classifier, blacklist.clone()));

        Self {
            config,
            rate_limiter,
            reflinks,
            blacklist,
            abuse,
            status_cache: TtlCache::new(status_cache_ttl),
        }
    }

    pub fn config(&self) -> Arc<AccessConfig> {
        self.config.load_full()
    }

    /// Swap the runtime configuration. In-flight checks keep the snapshot
    /// they loaded; the next check sees the new one.
    pub fn update_config(&self, config: AccessConfig) {
        self.config.store(Arc::new(config));
        self.status_cache.clear();
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn reflinks(&self) -> &ReflinkManager {
        &self.reflinks
    }

    pub fn blacklist(&self) -> &BlacklistManager {
        &self.blacklist
    }

    pub fn abuse(&self) -> &AbuseDetector {
        &self.abuse
    }

    pub fn status_cache_stats(&self) -> CacheStats {
        self.status_cache.stats()
    }

    pub fn status_cache_entries(&self) -> Vec<(String, FeatureStatus)> {
        self.status_cache.entries()
    }

    /// Run every gate for a request. Returns a grant carrying rate-limit and
    /// budget telemetry, or the first applicable denial.
    ///
    /// Gate order: blacklist, then reflink validity and feature gating, then
    /// the rate-limit counter. A request denied by an earlier gate never
    /// reaches a later one, so a blacklisted caller cannot burn reflink quota
    /// and a rejected reflink never consumes a rate-limit slot.
    pub async fn check_access(&self, request: &AccessRequest) -> Result<AccessGrant, Error> {
        // Gate 1: blacklist. An unknown blacklist state never admits
        // traffic: an actively blocked IP must stay blocked while the store
        // is down, so this gate fails closed for everyone. The anonymous
        // fail-open policy applies only to the rate-limit counter.
        if let Some(ip) = request.identity.ip {
            let check = self.blacklist.check(ip).await?;
            if check.blacklisted {
                let (reason, violation_count) = check
                    .entry
                    .map(|entry| (entry.reason, entry.violation_count))
                    .unwrap_or_default();
                return Err(Error::new(ErrorDetails::SecurityViolation {
                    reason,
                    ip_address: ip,
                    violation_count,
                }));
            }
        }

        // Gate 2: reflink validity and feature gating.
        let mut reflink = None;
        let mut budget = None;
        if let Some(code) = &request.identity.reflink_code {
            match self.reflinks.validate(code).await? {
                ReflinkValidation::Valid {
                    reflink: found,
                    budget: status,
                } => {
                    if !found.allows(request.feature) {
                        return Err(Error::new(ErrorDetails::FeatureDisabled {
                            feature: request.feature,
                        }));
                    }
                    reflink = Some(found);
                    budget = Some(status);
                }
                ReflinkValidation::Invalid { reason } => {
                    return Err(Error::new(ErrorDetails::Reflink {
                        code: code.clone(),
                        reason,
                    }));
                }
            }
        } else if request.feature != AiFeature::Chat {
            // Premium features are reflink-only.
            return Err(Error::new(ErrorDetails::FeatureDisabled {
                feature: request.feature,
            }));
        }

        // Gate 3: the rate-limit counter, last so denials above cost nothing.
        let identity = request.identity.identity().ok_or_else(|| {
            Error::new(ErrorDetails::InvalidRequest {
                message: "Request carries no identifying information".to_string(),
            })
        })?;
        let (tier, ceiling_override) = match &reflink {
            Some(reflink) => (reflink.rate_limit_tier, reflink.daily_limit),
            None => (RateLimitTier::Standard, None),
        };

        let status = self
            .rate_limiter
            .check_with_ceiling(&identity, tier, ceiling_override)
            .await?;
        if !status.allowed {
            return Err(Error::new(ErrorDetails::RateLimitExceeded { status }));
        }

        Ok(AccessGrant {
            identity,
            tier,
            rate_limit: status,
            reflink,
            budget,
        })
    }

    /// Charge actual provider usage after a granted request completes.
    pub async fn record_usage(
        &self,
        grant: &AccessGrant,
        tokens: u64,
        spend: f64,
    ) -> Result<Option<UsageReceipt>, Error> {
        match &grant.reflink {
            Some(reflink) => {
                let receipt = self.reflinks.record_usage(reflink.id, tokens, spend).await?;
                Ok(Some(receipt))
            }
            // Anonymous usage has no budget to charge.
            None => Ok(None),
        }
    }

    /// Classify request content and feed the blacklist on abuse.
    pub async fn inspect_content(&self, identity: &RequestIdentity, content: &str) -> AbuseVerdict {
        self.abuse.inspect(identity.ip, content).await
    }

    /// Advisory feature availability for UI gating, cached per identity and
    /// feature. Never consumes quota.
    pub async fn feature_status(
        &self,
        identity: &RequestIdentity,
        feature: AiFeature,
    ) -> Result<FeatureStatus, Error> {
        let Some(counting_identity) = identity.identity() else {
            return Err(Error::new(ErrorDetails::InvalidRequest {
                message: "Request carries no identifying information".to_string(),
            }));
        };
        let cache_key = format!("{}|{feature}", counting_identity.counting_key());
        if let Some(status) = self.status_cache.get(&cache_key) {
            return Ok(status);
        }

        let mut tier = RateLimitTier::Standard;
        let mut enabled = feature == AiFeature::Chat;
        let mut budget = None;
        if let Some(code) = &identity.reflink_code {
            if let ReflinkValidation::Valid {
                reflink,
                budget: status,
            } = self.reflinks.validate(code).await?
            {
                tier = reflink.rate_limit_tier;
                enabled = reflink.allows(feature);
                budget = Some(status);
            } else {
                enabled = false;
            }
        }

        let rate_limit = self.rate_limiter.status(&counting_identity, tier).await?;
        let status = FeatureStatus {
            feature,
            enabled: enabled && rate_limit.allowed,
            tier,
            rate_limit,
            budget,
        };
        self.status_cache.insert(cache_key, status.clone());
        Ok(status)
    }

    /// One maintenance pass over every retention policy. Intended to run on
    /// a timer; each sweep is independent and a failure in one aborts the
    /// pass.
    pub async fn cleanup(&self) -> Result<CleanupReport, Error> {
        Ok(CleanupReport {
            counters_swept: self.rate_limiter.cleanup().await?,
            reflinks_retired: self.reflinks.cleanup().await?,
            blacklist_swept: self.blacklist.cleanup().await?,
            status_cache_swept: self.status_cache.sweep(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::IpAddr;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use uuid::Uuid;

    use crate::blacklist::{BlacklistEntry, BlacklistQuery};
    use crate::rate_limit::DayBucketPolicy;
    use crate::reflink::{Budget, CreateReflinkInput, UpdateReflinkInput};
    use crate::store::{ConsumeOutcome, CounterSnapshot, CounterUpdate, MemoryStore};

    fn facade() -> AccessControl {
        AccessControl::new(AccessConfig::default(), Arc::new(MemoryStore::new()))
    }

    /// Store double: counters and reflinks behave normally, every blacklist
    /// operation fails.
    struct BrokenBlacklistStore {
        inner: MemoryStore,
    }

    fn blacklist_down(operation: &'static str) -> Error {
        Error::new_without_logging(ErrorDetails::StoreUnavailable {
            operation,
            message: "connection refused".to_string(),
        })
    }

    #[async_trait]
    impl CounterStore for BrokenBlacklistStore {
        async fn increment(
            &self,
            key: &str,
            tier: RateLimitTier,
            policy: DayBucketPolicy,
            now: DateTime<Utc>,
            ceiling: Option<u32>,
        ) -> Result<CounterUpdate, Error> {
            self.inner.increment(key, tier, policy, now, ceiling).await
        }

        async fn peek(
            &self,
            key: &str,
            now: DateTime<Utc>,
        ) -> Result<Option<CounterUpdate>, Error> {
            self.inner.peek(key, now).await
        }

        async fn scan_counters(
            &self,
            since: DateTime<Utc>,
        ) -> Result<Vec<CounterSnapshot>, Error> {
            self.inner.scan_counters(since).await
        }

        async fn sweep_counters(&self, expired_before: DateTime<Utc>) -> Result<u64, Error> {
            self.inner.sweep_counters(expired_before).await
        }
    }

    #[async_trait]
    impl ReflinkStore for BrokenBlacklistStore {
        async fn insert(&self, reflink: Reflink) -> Result<(), Error> {
            self.inner.insert(reflink).await
        }

        async fn fetch(&self, id: Uuid) -> Result<Option<Reflink>, Error> {
            ReflinkStore::fetch(&self.inner, id).await
        }

        async fn fetch_by_code(&self, code: &str) -> Result<Option<Reflink>, Error> {
            self.inner.fetch_by_code(code).await
        }

        async fn list(&self) -> Result<Vec<Reflink>, Error> {
            ReflinkStore::list(&self.inner).await
        }

        async fn apply_update(
            &self,
            id: Uuid,
            update: UpdateReflinkInput,
            now: DateTime<Utc>,
        ) -> Result<Option<Reflink>, Error> {
            self.inner.apply_update(id, update, now).await
        }

        async fn delete(&self, id: Uuid) -> Result<bool, Error> {
            self.inner.delete(id).await
        }

        async fn consume(
            &self,
            id: Uuid,
            tokens: u64,
            spend: f64,
            now: DateTime<Utc>,
        ) -> Result<ConsumeOutcome, Error> {
            self.inner.consume(id, tokens, spend, now).await
        }

        async fn reset_usage(
            &self,
            id: Uuid,
            now: DateTime<Utc>,
        ) -> Result<Option<Reflink>, Error> {
            self.inner.reset_usage(id, now).await
        }

        async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<u64, Error> {
            self.inner.deactivate_expired(now).await
        }
    }

    #[async_trait]
    impl BlacklistStore for BrokenBlacklistStore {
        async fn fetch(&self, _ip: IpAddr) -> Result<Option<BlacklistEntry>, Error> {
            Err(blacklist_down("blacklist_fetch"))
        }

        async fn record_violation(
            &self,
            _ip: IpAddr,
            _reason: &str,
            _metadata: Option<serde_json::Value>,
            _threshold: u32,
            _now: DateTime<Utc>,
        ) -> Result<BlacklistEntry, Error> {
            Err(blacklist_down("blacklist_record"))
        }

        async fn put(&self, _entry: BlacklistEntry) -> Result<(), Error> {
            Err(blacklist_down("blacklist_put"))
        }

        async fn reinstate(
            &self,
            _ip: IpAddr,
            _reinstated_by: &str,
            _reason: Option<&str>,
            _now: DateTime<Utc>,
        ) -> Result<Option<BlacklistEntry>, Error> {
            Err(blacklist_down("blacklist_reinstate"))
        }

        async fn remove(&self, _ip: IpAddr) -> Result<bool, Error> {
            Err(blacklist_down("blacklist_remove"))
        }

        async fn list(&self, _query: &BlacklistQuery) -> Result<Vec<BlacklistEntry>, Error> {
            Err(blacklist_down("blacklist_list"))
        }

        async fn sweep(&self, _before: DateTime<Utc>) -> Result<u64, Error> {
            Err(blacklist_down("blacklist_sweep"))
        }
    }

    fn anonymous(ip: &str) -> RequestIdentity {
        RequestIdentity {
            ip: Some(ip.parse().expect("valid IP")),
            session_id: None,
            reflink_code: None,
        }
    }

    #[tokio::test]
    async fn test_anonymous_chat_allowed_on_standard_tier() {
        let facade = facade();
        let grant = facade
            .check_access(&AccessRequest {
                identity: anonymous("198.51.100.30"),
                feature: AiFeature::Chat,
            })
            .await
            .expect("granted");

        assert_eq!(grant.tier, RateLimitTier::Standard);
        assert_eq!(grant.rate_limit.requests_remaining, 49);
        assert!(grant.reflink.is_none());
    }

    #[tokio::test]
    async fn test_premium_feature_requires_reflink() {
        let facade = facade();
        let error = facade
            .check_access(&AccessRequest {
                identity: anonymous("198.51.100.31"),
                feature: AiFeature::VoiceAi,
            })
            .await
            .expect_err("denied");
        assert!(matches!(
            error.get_details(),
            ErrorDetails::FeatureDisabled {
                feature: AiFeature::VoiceAi
            }
        ));
    }

    #[tokio::test]
    async fn test_reflink_grants_tier_and_features() {
        let facade = facade();
        let reflink = facade
            .reflinks()
            .create(
                CreateReflinkInput {
                    rate_limit_tier: Some(RateLimitTier::Premium),
                    enable_voice_ai: true,
                    spend_limit: Budget::Limited(10.0),
                    ..Default::default()
                },
                "admin",
            )
            .await
            .expect("create");

        let mut identity = anonymous("198.51.100.32");
        identity.reflink_code = Some(reflink.code.clone());

        let grant = facade
            .check_access(&AccessRequest {
                identity,
                feature: AiFeature::VoiceAi,
            })
            .await
            .expect("granted");
        assert_eq!(grant.tier, RateLimitTier::Premium);
        assert_eq!(grant.identity, Identity::Reflink(reflink.code));
        assert!(grant.budget.expect("budget present").spend_remaining == Some(10.0));
    }

    #[tokio::test]
    async fn test_reflink_without_feature_flag_is_denied() {
        let facade = facade();
        let reflink = facade
            .reflinks()
            .create(CreateReflinkInput::default(), "admin")
            .await
            .expect("create");

        let mut identity = anonymous("198.51.100.33");
        identity.reflink_code = Some(reflink.code);

        let error = facade
            .check_access(&AccessRequest {
                identity,
                feature: AiFeature::JobAnalysis,
            })
            .await
            .expect_err("denied");
        assert!(matches!(
            error.get_details(),
            ErrorDetails::FeatureDisabled { .. }
        ));
    }

    #[tokio::test]
    async fn test_blacklisted_ip_short_circuits_before_quota() {
        let facade = facade();
        let identity = anonymous("198.51.100.34");
        let ip = identity.ip.expect("ip set");

        for _ in 0..2 {
            facade
                .blacklist()
                .record_violation(ip, "abuse", None)
                .await
                .expect("record");
        }

        let error = facade
            .check_access(&AccessRequest {
                identity: identity.clone(),
                feature: AiFeature::Chat,
            })
            .await
            .expect_err("denied");
        assert!(matches!(
            error.get_details(),
            ErrorDetails::SecurityViolation {
                violation_count: 2,
                ..
            }
        ));

        // The denial consumed no rate-limit quota.
        let status = facade
            .rate_limiter()
            .status(
                &identity.identity().expect("identity"),
                RateLimitTier::Standard,
            )
            .await
            .expect("status");
        assert_eq!(status.requests_remaining, 50);
    }

    #[tokio::test]
    async fn test_blacklist_outage_fails_closed_even_for_anonymous() {
        let facade = AccessControl::new(
            AccessConfig::default(),
            Arc::new(BrokenBlacklistStore {
                inner: MemoryStore::new(),
            }),
        );
        // The anonymous fail-open policy is on, and must not apply here.
        assert!(facade.config().fail_open_anonymous);

        let error = facade
            .check_access(&AccessRequest {
                identity: anonymous("198.51.100.45"),
                feature: AiFeature::Chat,
            })
            .await
            .expect_err("blacklist down");
        assert!(matches!(
            error.get_details(),
            ErrorDetails::StoreUnavailable { .. }
        ));
    }

    #[tokio::test]
    async fn test_invalid_reflink_consumes_no_quota() {
        let facade = facade();
        let mut identity = anonymous("198.51.100.35");
        identity.reflink_code = Some("rfl_bogus".to_string());

        let error = facade
            .check_access(&AccessRequest {
                identity: identity.clone(),
                feature: AiFeature::Chat,
            })
            .await
            .expect_err("denied");
        assert!(matches!(
            error.get_details(),
            ErrorDetails::Reflink { .. }
        ));

        let status = facade
            .rate_limiter()
            .status(
                &identity.identity().expect("identity"),
                RateLimitTier::Standard,
            )
            .await
            .expect("status");
        assert_eq!(status.requests_remaining, 50);
    }

    #[tokio::test]
    async fn test_reflink_daily_limit_overrides_tier() {
        let facade = facade();
        let reflink = facade
            .reflinks()
            .create(
                CreateReflinkInput {
                    rate_limit_tier: Some(RateLimitTier::Premium),
                    daily_limit: Some(2),
                    ..Default::default()
                },
                "admin",
            )
            .await
            .expect("create");

        let mut identity = anonymous("198.51.100.36");
        identity.reflink_code = Some(reflink.code);
        let request = AccessRequest {
            identity,
            feature: AiFeature::Chat,
        };

        for _ in 0..2 {
            facade.check_access(&request).await.expect("granted");
        }
        let error = facade.check_access(&request).await.expect_err("denied");
        assert!(matches!(
            error.get_details(),
            ErrorDetails::RateLimitExceeded { .. }
        ));
    }

    #[tokio::test]
    async fn test_record_usage_flows_to_reflink() {
        let facade = facade();
        let reflink = facade
            .reflinks()
            .create(
                CreateReflinkInput {
                    token_limit: Budget::Limited(100),
                    ..Default::default()
                },
                "admin",
            )
            .await
            .expect("create");

        let mut identity = anonymous("198.51.100.37");
        identity.reflink_code = Some(reflink.code);
        let grant = facade
            .check_access(&AccessRequest {
                identity,
                feature: AiFeature::Chat,
            })
            .await
            .expect("granted");

        let receipt = facade
            .record_usage(&grant, 40, 0.1)
            .await
            .expect("record")
            .expect("receipt");
        assert_eq!(receipt.tokens_used, 40);
        assert!(!receipt.exhausted);

        // Anonymous grants have nothing to charge.
        let anon_grant = facade
            .check_access(&AccessRequest {
                identity: anonymous("198.51.100.38"),
                feature: AiFeature::Chat,
            })
            .await
            .expect("granted");
        assert!(facade
            .record_usage(&anon_grant, 40, 0.1)
            .await
            .expect("record")
            .is_none());
    }

    #[tokio::test]
    async fn test_feature_status_is_advisory_and_cached() {
        let facade = facade();
        let identity = anonymous("198.51.100.39");

        let status = facade
            .feature_status(&identity, AiFeature::Chat)
            .await
            .expect("status");
        assert!(status.enabled);
        assert_eq!(status.rate_limit.requests_remaining, 50);

        let again = facade
            .feature_status(&identity, AiFeature::Chat)
            .await
            .expect("status");
        assert_eq!(status, again);
        assert!(facade.status_cache_stats().hits >= 1);

        // Premium features read as disabled without a reflink.
        let voice = facade
            .feature_status(&identity, AiFeature::VoiceAi)
            .await
            .expect("status");
        assert!(!voice.enabled);
    }

    #[tokio::test]
    async fn test_update_config_applies_to_next_check() {
        let facade = facade();
        let identity = anonymous("198.51.100.40");

        let mut config = AccessConfig::default();
        config.tiers.standard = 1;
        facade.update_config(config);

        let request = AccessRequest {
            identity,
            feature: AiFeature::Chat,
        };
        facade.check_access(&request).await.expect("granted");
        assert!(facade.check_access(&request).await.is_err());
    }
}
