pub mod memory;

pub use memory::MemoryStore;

use std::net::IpAddr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::blacklist::{BlacklistEntry, BlacklistQuery};
use crate::error::Error;
use crate::rate_limit::{DayBucketPolicy, RateLimitTier};
use crate::reflink::{Reflink, ReflinkRejection, UpdateReflinkInput};

/// Result of an atomic counter increment-and-check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CounterUpdate {
    /// Whether this request fit under the ceiling. When false the counter was
    /// not incremented; the blocked total was.
    pub admitted: bool,
    /// Admitted requests in the current bucket, including this one if
    /// admitted.
    pub count: u32,
    pub bucket_start: DateTime<Utc>,
    pub bucket_end: DateTime<Utc>,
}

/// One counter bucket, live or archived, as seen by analytics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CounterSnapshot {
    pub key: String,
    pub tier: RateLimitTier,
    pub admitted: u32,
    pub blocked: u32,
    pub bucket_start: DateTime<Utc>,
    pub bucket_end: DateTime<Utc>,
}

/// Per-identity daily request counters.
///
/// `increment` is the only mutating entry point on the hot path and must be
/// linearizable per key: two concurrent calls at the ceiling boundary must
/// never both be admitted when only one slot remains.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically roll the bucket forward if it has elapsed, then admit and
    /// count the request iff `ceiling` (when set) has not been reached.
    async fn increment(
        &self,
        key: &str,
        tier: RateLimitTier,
        policy: DayBucketPolicy,
        now: DateTime<Utc>,
        ceiling: Option<u32>,
    ) -> Result<CounterUpdate, Error>;

    /// Non-consuming read of the current bucket, if one exists.
    async fn peek(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CounterUpdate>, Error>;

    /// All buckets overlapping `[since, now]`, for analytics.
    async fn scan_counters(&self, since: DateTime<Utc>) -> Result<Vec<CounterSnapshot>, Error>;

    /// Delete buckets that fully elapsed before `expired_before`. Live
    /// buckets are never deleted; safe to run concurrently with traffic.
    async fn sweep_counters(&self, expired_before: DateTime<Utc>) -> Result<u64, Error>;
}

/// What actually got charged by an atomic budget consumption.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageReceipt {
    pub reflink_id: Uuid,
    /// Tokens applied after capping at the ceiling.
    pub tokens_charged: u64,
    /// Spend applied after capping at the ceiling.
    pub spend_charged: f64,
    pub tokens_used: u64,
    pub spend_used: f64,
    /// True when this charge reached a ceiling; later calls will be rejected.
    pub exhausted: bool,
}

/// Outcome of an atomic consume: either a capped charge or a typed rejection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumeOutcome {
    Charged(UsageReceipt),
    Rejected(ReflinkRejection),
}

/// Durable reflink records.
///
/// `consume` and `reset_usage` are the budget critical sections and must be
/// linearizable per reflink id; a spend ceiling is a monetary guarantee, and
/// races here translate directly into uncapped provider billing.
#[async_trait]
pub trait ReflinkStore: Send + Sync {
    /// Insert a new reflink; fails if the code is already taken.
    async fn insert(&self, reflink: Reflink) -> Result<(), Error>;

    async fn fetch(&self, id: Uuid) -> Result<Option<Reflink>, Error>;

    async fn fetch_by_code(&self, code: &str) -> Result<Option<Reflink>, Error>;

    async fn list(&self) -> Result<Vec<Reflink>, Error>;

    /// Apply an administrative patch under the per-id lock, stamping
    /// `updated_at`. Returns the updated record, or `None` if absent.
    async fn apply_update(
        &self,
        id: Uuid,
        update: UpdateReflinkInput,
        now: DateTime<Utc>,
    ) -> Result<Option<Reflink>, Error>;

    async fn delete(&self, id: Uuid) -> Result<bool, Error>;

    /// Atomically charge token/spend usage, capping at the ceilings. Inactive
    /// or expired reflinks are rejected without mutation.
    async fn consume(
        &self,
        id: Uuid,
        tokens: u64,
        spend: f64,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, Error>;

    /// Zero `tokens_used`/`spend_used`. Idempotent. Does not resurrect a past
    /// `expires_at` or force `is_active`.
    async fn reset_usage(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Reflink>, Error>;

    /// Deactivate reflinks whose `expires_at` has passed; returns how many
    /// were retired.
    async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<u64, Error>;
}

/// Durable per-IP violation history.
///
/// `record_violation` must be linearizable per IP so concurrent violations
/// never lose an increment or escalate independently.
#[async_trait]
pub trait BlacklistStore: Send + Sync {
    async fn fetch(&self, ip: IpAddr) -> Result<Option<BlacklistEntry>, Error>;

    /// Create or escalate the entry for `ip`; flips `is_active` once the
    /// violation count reaches `threshold`. Returns the post-update entry.
    async fn record_violation(
        &self,
        ip: IpAddr,
        reason: &str,
        metadata: Option<serde_json::Value>,
        threshold: u32,
        now: DateTime<Utc>,
    ) -> Result<BlacklistEntry, Error>;

    /// Replace (or create) the entry wholesale; administrative path.
    async fn put(&self, entry: BlacklistEntry) -> Result<(), Error>;

    /// Clear the active block and stamp who/when. Preserves
    /// `violation_count`. Returns the updated entry, or `None` if absent.
    async fn reinstate(
        &self,
        ip: IpAddr,
        reinstated_by: &str,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<BlacklistEntry>, Error>;

    async fn remove(&self, ip: IpAddr) -> Result<bool, Error>;

    async fn list(&self, query: &BlacklistQuery) -> Result<Vec<BlacklistEntry>, Error>;

    /// Delete inactive entries whose last violation predates `before`.
    /// Active blocks are never swept.
    async fn sweep(&self, before: DateTime<Utc>) -> Result<u64, Error>;
}
