use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};
use crate::rate_limit::{DayBucketPolicy, RateLimitTier};

/// Configuration for the access control subsystem.
///
/// Everything an operator might want to tune lives here as an explicit
/// constant rather than a hard-coded assumption: tier ceilings, the day-bucket
/// boundary policy, the blacklist escalation threshold, and the fail-open
/// policy for the anonymous tier. Loaded from TOML and hot-swappable via
/// `arc_swap` at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessConfig {
    /// Daily request ceilings per rate-limit tier.
    #[serde(default)]
    pub tiers: TierLimits,

    /// How the per-identity day bucket is anchored.
    #[serde(default)]
    pub day_bucket: DayBucketPolicy,

    /// Violation count at which an IP flips to actively blocked.
    /// The default of 2 means the first violation is a recorded warning.
    #[serde(default = "default_violation_threshold")]
    pub violation_threshold: u32,

    /// Whether anonymous (non-reflink) rate limiting fails open when the
    /// counter store is unavailable. Reflink-tied checks always fail closed.
    #[serde(default = "default_fail_open_anonymous")]
    pub fail_open_anonymous: bool,

    /// Store operation timeout in milliseconds. A timeout is treated as a
    /// store failure, not an implicit allow.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Retention margin for expired rate-limit counters, in days.
    #[serde(default = "default_counter_retention_days")]
    pub counter_retention_days: u32,

    /// Retention for inactive blacklist entries, in days. Active blocks are
    /// never swept.
    #[serde(default = "default_blacklist_retention_days")]
    pub blacklist_retention_days: u32,

    /// Average provider cost per request, used only for the
    /// `estimated_requests_remaining` UX heuristic, never for enforcement.
    #[serde(default = "default_avg_cost_per_request")]
    pub avg_cost_per_request: f64,

    /// TTL for the hot-path blacklist read cache, in milliseconds.
    #[serde(default = "default_blacklist_cache_ttl_ms")]
    pub blacklist_cache_ttl_ms: u64,

    /// TTL for cached feature-status snapshots, in seconds.
    #[serde(default = "default_status_cache_ttl_secs")]
    pub status_cache_ttl_secs: u64,
}

/// Daily request ceilings for the non-unlimited tiers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierLimits {
    #[serde(default = "default_standard_limit")]
    pub standard: u32,
    #[serde(default = "default_extended_limit")]
    pub extended: u32,
    #[serde(default = "default_premium_limit")]
    pub premium: u32,
}

fn default_standard_limit() -> u32 {
    50
}

fn default_extended_limit() -> u32 {
    200
}

fn default_premium_limit() -> u32 {
    1000
}

fn default_violation_threshold() -> u32 {
    2
}

fn default_fail_open_anonymous() -> bool {
    true
}

fn default_store_timeout_ms() -> u64 {
    100
}

fn default_counter_retention_days() -> u32 {
    7
}

fn default_blacklist_retention_days() -> u32 {
    90
}

fn default_avg_cost_per_request() -> f64 {
    0.02
}

fn default_blacklist_cache_ttl_ms() -> u64 {
    5_000
}

fn default_status_cache_ttl_secs() -> u64 {
    30
}

impl Default for TierLimits {
    fn default() -> Self {
        Self {
            standard: default_standard_limit(),
            extended: default_extended_limit(),
            premium: default_premium_limit(),
        }
    }
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            tiers: TierLimits::default(),
            day_bucket: DayBucketPolicy::default(),
            violation_threshold: default_violation_threshold(),
            fail_open_anonymous: default_fail_open_anonymous(),
            store_timeout_ms: default_store_timeout_ms(),
            counter_retention_days: default_counter_retention_days(),
            blacklist_retention_days: default_blacklist_retention_days(),
            avg_cost_per_request: default_avg_cost_per_request(),
            blacklist_cache_ttl_ms: default_blacklist_cache_ttl_ms(),
            status_cache_ttl_secs: default_status_cache_ttl_secs(),
        }
    }
}

impl AccessConfig {
    /// Daily request ceiling for a tier; `None` means no ceiling.
    pub fn daily_limit(&self, tier: RateLimitTier) -> Option<u32> {
        match tier {
            RateLimitTier::Standard => Some(self.tiers.standard),
            RateLimitTier::Extended => Some(self.tiers.extended),
            RateLimitTier::Premium => Some(self.tiers.premium),
            RateLimitTier::Unlimited => None,
        }
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn load_from_toml(raw: &str) -> Result<Self, Error> {
        toml::from_str(raw).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse access control config: {e}"),
            })
        })
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!(
                    "Failed to read access control config {}: {e}",
                    path.as_ref().display()
                ),
            })
        })?;
        Self::load_from_toml(&raw)
    }
}
