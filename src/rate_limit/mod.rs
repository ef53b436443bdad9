pub mod limiter;

pub use limiter::RateLimiter;

use axum::http::{HeaderMap, HeaderValue};
use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// A named rate-limit class mapping to a daily request ceiling.
///
/// Tiers are static configuration, not persisted per-request; the ceiling for
/// each tier lives in [`crate::config::AccessConfig`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RateLimitTier {
    Standard,
    Extended,
    Premium,
    /// Admin/internal: no ceiling.
    Unlimited,
}

/// How the per-identity day bucket is anchored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayBucketPolicy {
    /// UTC calendar day: every counter resets at midnight UTC.
    #[default]
    CalendarDay,
    /// Rolling 24h window anchored at the identity's first request.
    Rolling,
}

impl DayBucketPolicy {
    /// Bucket boundaries for a fresh counter created at `now`.
    pub fn bucket_for(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        match self {
            DayBucketPolicy::CalendarDay => {
                let start = now.date_naive().and_time(NaiveTime::MIN).and_utc();
                (start, start + Duration::days(1))
            }
            DayBucketPolicy::Rolling => (now, now + Duration::days(1)),
        }
    }
}

/// Ephemeral result of a rate-limit check, also used for telemetry headers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitStatus {
    pub allowed: bool,
    pub requests_remaining: u32,
    /// `None` for the unlimited tier.
    pub daily_limit: Option<u32>,
    /// Start of the next bucket for this identity.
    pub reset_at: DateTime<Utc>,
    pub tier: RateLimitTier,
}

impl RateLimitStatus {
    pub fn retry_after_secs(&self) -> i64 {
        (self.reset_at - Utc::now()).num_seconds().max(0)
    }

    /// Render the standard `X-RateLimit-*` response headers.
    pub fn to_header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        if let Some(limit) = self.daily_limit {
            if let Ok(value) = HeaderValue::from_str(&limit.to_string()) {
                headers.insert("X-RateLimit-Limit", value);
            }
        }

        if let Ok(value) = HeaderValue::from_str(&self.requests_remaining.to_string()) {
            headers.insert("X-RateLimit-Remaining", value);
        }

        if let Ok(value) = HeaderValue::from_str(&self.reset_at.timestamp().to_string()) {
            headers.insert("X-RateLimit-Reset", value);
        }

        if !self.allowed {
            if let Ok(value) = HeaderValue::from_str(&self.retry_after_secs().to_string()) {
                headers.insert("Retry-After", value);
            }
        }

        headers
    }
}

/// Read-only aggregation for admin dashboards; never affects decisions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RateLimitAnalytics {
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub unique_identities: u64,
    pub window_days: u32,
}

/// Performance counters for the limiter.
#[derive(Debug, Default)]
pub struct RateLimiterMetrics {
    pub allowed: std::sync::atomic::AtomicU64,
    pub denied: std::sync::atomic::AtomicU64,
    pub store_errors: std::sync::atomic::AtomicU64,
    pub fail_open_allows: std::sync::atomic::AtomicU64,
}

impl RateLimiterMetrics {
    pub fn record_allowed(&self) {
        self.allowed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn record_denied(&self) {
        self.denied.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn record_store_error(&self) {
        self.store_errors
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn record_fail_open_allow(&self) {
        self.fail_open_allows
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}
