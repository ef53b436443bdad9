use std::net::IpAddr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::blacklist::{BlacklistEntry, BlacklistQuery};
use crate::error::{Error, ErrorDetails};
use crate::rate_limit::{DayBucketPolicy, RateLimitTier};
use crate::reflink::{Budget, Reflink, ReflinkRejection, UpdateReflinkInput};
use crate::store::{
    BlacklistStore, ConsumeOutcome, CounterSnapshot, CounterStore, CounterUpdate, ReflinkStore,
    UsageReceipt,
};

/// In-process store backing all three managers.
///
/// Every increment-and-check runs inside a `DashMap` entry guard, which holds
/// the shard lock for the key and is therefore the per-key critical section
/// the traits require. A deployment against a shared backend would implement
/// the same traits with conditional atomic updates instead.
#[derive(Default)]
pub struct MemoryStore {
    counters: DashMap<String, CounterCell>,
    /// Elapsed buckets, retained for analytics until swept.
    counter_archive: DashMap<String, CounterSnapshot>,
    reflinks: DashMap<Uuid, Reflink>,
    reflink_codes: DashMap<String, Uuid>,
    blacklist: DashMap<IpAddr, BlacklistEntry>,
}

#[derive(Debug, Clone)]
struct CounterCell {
    tier: RateLimitTier,
    admitted: u32,
    blocked: u32,
    bucket_start: DateTime<Utc>,
    bucket_end: DateTime<Utc>,
}

impl CounterCell {
    fn fresh(tier: RateLimitTier, policy: DayBucketPolicy, now: DateTime<Utc>) -> Self {
        let (bucket_start, bucket_end) = policy.bucket_for(now);
        Self {
            tier,
            admitted: 0,
            blocked: 0,
            bucket_start,
            bucket_end,
        }
    }

    fn admit(&mut self, ceiling: Option<u32>) -> CounterUpdate {
        let admitted = ceiling.is_none_or(|ceiling| self.admitted < ceiling);
        if admitted {
            self.admitted += 1;
        } else {
            self.blocked += 1;
        }
        CounterUpdate {
            admitted,
            count: self.admitted,
            bucket_start: self.bucket_start,
            bucket_end: self.bucket_end,
        }
    }

    fn snapshot(&self, key: &str) -> CounterSnapshot {
        CounterSnapshot {
            key: key.to_string(),
            tier: self.tier,
            admitted: self.admitted,
            blocked: self.blocked,
            bucket_start: self.bucket_start,
            bucket_end: self.bucket_end,
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn archive_key(key: &str, bucket_start: DateTime<Utc>) -> String {
        format!("{key}@{}", bucket_start.timestamp())
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(
        &self,
        key: &str,
        tier: RateLimitTier,
        policy: DayBucketPolicy,
        now: DateTime<Utc>,
        ceiling: Option<u32>,
    ) -> Result<CounterUpdate, Error> {
        match self.counters.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let cell = occupied.get_mut();
                if now >= cell.bucket_end {
                    // Bucket rollover: archive the elapsed bucket for
                    // analytics, then start over. Count resets to 0 exactly
                    // here and nowhere else.
                    self.counter_archive.insert(
                        Self::archive_key(key, cell.bucket_start),
                        cell.snapshot(key),
                    );
                    *cell = CounterCell::fresh(tier, policy, now);
                }
                cell.tier = tier;
                Ok(cell.admit(ceiling))
            }
            Entry::Vacant(vacant) => {
                let mut cell = CounterCell::fresh(tier, policy, now);
                let update = cell.admit(ceiling);
                vacant.insert(cell);
                Ok(update)
            }
        }
    }

    async fn peek(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CounterUpdate>, Error> {
        Ok(self.counters.get(key).and_then(|cell| {
            if now < cell.bucket_end {
                Some(CounterUpdate {
                    admitted: true,
                    count: cell.admitted,
                    bucket_start: cell.bucket_start,
                    bucket_end: cell.bucket_end,
                })
            } else {
                None
            }
        }))
    }

    async fn scan_counters(&self, since: DateTime<Utc>) -> Result<Vec<CounterSnapshot>, Error> {
        let mut snapshots: Vec<CounterSnapshot> = self
            .counters
            .iter()
            .filter(|entry| entry.value().bucket_end > since)
            .map(|entry| entry.value().snapshot(entry.key()))
            .collect();

        snapshots.extend(
            self.counter_archive
                .iter()
                .filter(|entry| entry.value().bucket_end > since)
                .map(|entry| entry.value().clone()),
        );

        Ok(snapshots)
    }

    async fn sweep_counters(&self, expired_before: DateTime<Utc>) -> Result<u64, Error> {
        let mut removed = 0u64;

        // retain holds the shard lock per entry, so a bucket still being
        // written is either not yet visible here or judged by its final
        // bucket_end; live buckets never satisfy the cutoff.
        self.counters.retain(|_, cell| {
            if cell.bucket_end <= expired_before {
                removed += 1;
                false
            } else {
                true
            }
        });
        self.counter_archive.retain(|_, snapshot| {
            if snapshot.bucket_end <= expired_before {
                removed += 1;
                false
            } else {
                true
            }
        });

        Ok(removed)
    }
}

#[async_trait]
impl ReflinkStore for MemoryStore {
    async fn insert(&self, reflink: Reflink) -> Result<(), Error> {
        match self.reflink_codes.entry(reflink.code.clone()) {
            Entry::Occupied(_) => Err(Error::new(ErrorDetails::InternalError {
                message: format!("Reflink code collision: {}", reflink.code),
            })),
            Entry::Vacant(vacant) => {
                vacant.insert(reflink.id);
                self.reflinks.insert(reflink.id, reflink);
                Ok(())
            }
        }
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<Reflink>, Error> {
        Ok(self.reflinks.get(&id).map(|entry| entry.value().clone()))
    }

    async fn fetch_by_code(&self, code: &str) -> Result<Option<Reflink>, Error> {
        let Some(id) = self.reflink_codes.get(code).map(|entry| *entry.value()) else {
            return Ok(None);
        };
        ReflinkStore::fetch(self, id).await
    }

    async fn list(&self) -> Result<Vec<Reflink>, Error> {
        let mut reflinks: Vec<Reflink> = self
            .reflinks
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        reflinks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(reflinks)
    }

    async fn apply_update(
        &self,
        id: Uuid,
        update: UpdateReflinkInput,
        now: DateTime<Utc>,
    ) -> Result<Option<Reflink>, Error> {
        match self.reflinks.entry(id) {
            Entry::Occupied(mut occupied) => {
                let reflink = occupied.get_mut();
                update.apply(reflink);
                reflink.updated_at = now;
                Ok(Some(reflink.clone()))
            }
            Entry::Vacant(_) => Ok(None),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<bool, Error> {
        let Some((_, reflink)) = self.reflinks.remove(&id) else {
            return Ok(false);
        };
        self.reflink_codes.remove(&reflink.code);
        Ok(true)
    }

    async fn consume(
        &self,
        id: Uuid,
        tokens: u64,
        spend: f64,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, Error> {
        match self.reflinks.entry(id) {
            Entry::Vacant(_) => Ok(ConsumeOutcome::Rejected(ReflinkRejection::NotFound)),
            Entry::Occupied(mut occupied) => {
                let reflink = occupied.get_mut();

                // No budget mutation once retired: validity checks first, in
                // the same precedence order as validation.
                if !reflink.is_active {
                    return Ok(ConsumeOutcome::Rejected(ReflinkRejection::Inactive));
                }
                if reflink.is_expired(now) {
                    return Ok(ConsumeOutcome::Rejected(ReflinkRejection::Expired));
                }
                if reflink.budget_exhausted() {
                    return Ok(ConsumeOutcome::Rejected(ReflinkRejection::BudgetExhausted));
                }

                // Cap each dimension at its ceiling: the charge that reaches
                // the limit lands exactly on it, never past it.
                let tokens_charged = match reflink.token_limit {
                    Budget::Unbounded => tokens,
                    Budget::Limited(limit) => {
                        tokens.min(limit.saturating_sub(reflink.tokens_used))
                    }
                };
                let spend_charged = match reflink.spend_limit {
                    Budget::Unbounded => spend,
                    Budget::Limited(limit) => spend.min((limit - reflink.spend_used).max(0.0)),
                };

                reflink.tokens_used += tokens_charged;
                reflink.spend_used += spend_charged;
                reflink.last_used_at = Some(now);
                reflink.updated_at = now;

                Ok(ConsumeOutcome::Charged(UsageReceipt {
                    reflink_id: id,
                    tokens_charged,
                    spend_charged,
                    tokens_used: reflink.tokens_used,
                    spend_used: reflink.spend_used,
                    exhausted: reflink.budget_exhausted(),
                }))
            }
        }
    }

    async fn reset_usage(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Reflink>, Error> {
        match self.reflinks.entry(id) {
            Entry::Occupied(mut occupied) => {
                let reflink = occupied.get_mut();
                reflink.tokens_used = 0;
                reflink.spend_used = 0.0;
                reflink.updated_at = now;
                Ok(Some(reflink.clone()))
            }
            Entry::Vacant(_) => Ok(None),
        }
    }

    async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<u64, Error> {
        let mut retired = 0u64;
        for mut entry in self.reflinks.iter_mut() {
            let reflink = entry.value_mut();
            if reflink.is_active && reflink.is_expired(now) {
                reflink.is_active = false;
                reflink.updated_at = now;
                retired += 1;
            }
        }
        Ok(retired)
    }
}

#[async_trait]
impl BlacklistStore for MemoryStore {
    async fn fetch(&self, ip: IpAddr) -> Result<Option<BlacklistEntry>, Error> {
        Ok(self.blacklist.get(&ip).map(|entry| entry.value().clone()))
    }

    async fn record_violation(
        &self,
        ip: IpAddr,
        reason: &str,
        metadata: Option<serde_json::Value>,
        threshold: u32,
        now: DateTime<Utc>,
    ) -> Result<BlacklistEntry, Error> {
        match self.blacklist.entry(ip) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.violation_count += 1;
                entry.last_violation_at = now;
                entry.reason = reason.to_string();
                if metadata.is_some() {
                    entry.metadata = metadata;
                }
                if entry.violation_count >= threshold {
                    entry.is_active = true;
                }
                Ok(entry.clone())
            }
            Entry::Vacant(vacant) => {
                let entry = BlacklistEntry {
                    ip_address: ip,
                    reason: reason.to_string(),
                    violation_count: 1,
                    first_violation_at: now,
                    last_violation_at: now,
                    is_active: 1 >= threshold,
                    reinstated_by: None,
                    reinstated_at: None,
                    metadata,
                };
                Ok(vacant.insert(entry).clone())
            }
        }
    }

    async fn put(&self, entry: BlacklistEntry) -> Result<(), Error> {
        self.blacklist.insert(entry.ip_address, entry);
        Ok(())
    }

    async fn reinstate(
        &self,
        ip: IpAddr,
        reinstated_by: &str,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<BlacklistEntry>, Error> {
        match self.blacklist.entry(ip) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.is_active = false;
                entry.reinstated_by = Some(reinstated_by.to_string());
                entry.reinstated_at = Some(now);
                if let Some(reason) = reason {
                    let metadata = entry
                        .metadata
                        .get_or_insert_with(|| serde_json::Value::Object(Default::default()));
                    if let Some(object) = metadata.as_object_mut() {
                        object.insert(
                            "reinstate_reason".to_string(),
                            serde_json::Value::String(reason.to_string()),
                        );
                    }
                }
                Ok(Some(entry.clone()))
            }
            Entry::Vacant(_) => Ok(None),
        }
    }

    async fn remove(&self, ip: IpAddr) -> Result<bool, Error> {
        Ok(self.blacklist.remove(&ip).is_some())
    }

    async fn list(&self, query: &BlacklistQuery) -> Result<Vec<BlacklistEntry>, Error> {
        let mut entries: Vec<BlacklistEntry> = self
            .blacklist
            .iter()
            .filter(|entry| !query.active_only || entry.value().is_active)
            .map(|entry| entry.value().clone())
            .collect();

        entries.sort_by(|a, b| b.last_violation_at.cmp(&a.last_violation_at));

        let entries = entries
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(entries)
    }

    async fn sweep(&self, before: DateTime<Utc>) -> Result<u64, Error> {
        let mut removed = 0u64;
        self.blacklist.retain(|_, entry| {
            if !entry.is_active && entry.last_violation_at < before {
                removed += 1;
                false
            } else {
                true
            }
        });
        Ok(removed)
    }
}
