use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::Utc;
use moka::future::Cache;
use tracing::{info, warn};

use crate::blacklist::{
    BlacklistCheck, BlacklistEntry, BlacklistIpParams, BlacklistQuery, OffenderSummary,
    SecurityAnalytics,
};
use crate::config::AccessConfig;
use crate::error::{Error, ErrorDetails};
use crate::store::BlacklistStore;

const CACHE_CAPACITY: u64 = 10_000;
const TOP_OFFENDERS: usize = 5;

/// Escalating IP blacklist with a short-TTL read cache on the hot path.
///
/// The store holds the violation history; the manager holds the escalation
/// policy and keeps the cache honest by invalidating on every mutation, so a
/// reinstatement takes effect immediately rather than after the TTL.
pub struct BlacklistManager {
    store: Arc<dyn BlacklistStore>,
    config: Arc<ArcSwap<AccessConfig>>,
    cache: Cache<IpAddr, BlacklistCheck>,
}

impl BlacklistManager {
    pub fn new(store: Arc<dyn BlacklistStore>, config: Arc<ArcSwap<AccessConfig>>) -> Self {
        let ttl_ms = config.load().blacklist_cache_ttl_ms;
        let cache = Cache::builder()
            .max_capacity(CACHE_CAPACITY)
            .time_to_live(Duration::from_millis(ttl_ms))
            .build();
        Self {
            store,
            config,
            cache,
        }
    }

    /// Hot-path check. Cached reads never block a recently reinstated IP
    /// because every mutation invalidates the cache entry first.
    pub async fn check(&self, ip: IpAddr) -> Result<BlacklistCheck, Error> {
        if let Some(check) = self.cache.get(&ip).await {
            return Ok(check);
        }

        let config = self.config.load();
        let entry = tokio::time::timeout(config.store_timeout(), self.store.fetch(ip))
            .await
            .map_err(|_| {
                Error::new(ErrorDetails::StoreUnavailable {
                    operation: "blacklist_fetch",
                    message: format!(
                        "Blacklist store timed out after {}ms",
                        config.store_timeout_ms
                    ),
                })
            })??;

        let check = BlacklistCheck {
            blacklisted: entry.as_ref().is_some_and(|e| e.is_active),
            entry,
        };
        self.cache.insert(ip, check.clone()).await;
        Ok(check)
    }

    /// Record a violation and escalate if the threshold is reached. Returns
    /// the post-update entry so callers can see the new standing.
    pub async fn record_violation(
        &self,
        ip: IpAddr,
        reason: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<BlacklistEntry, Error> {
        let threshold = self.config.load().violation_threshold;
        let entry = self
            .store
            .record_violation(ip, reason, metadata, threshold, Utc::now())
            .await?;
        // Invalidate after the write: a read landing mid-mutation may cache
        // the old entry, and only a post-write invalidation evicts it.
        self.cache.invalidate(&ip).await;

        if entry.is_active {
            warn!(
                ip = %ip,
                violation_count = entry.violation_count,
                reason,
                "IP crossed violation threshold and is now blocked"
            );
        } else {
            info!(
                ip = %ip,
                violation_count = entry.violation_count,
                reason,
                "Recorded IP violation"
            );
        }
        Ok(entry)
    }

    /// Direct administrative block, bypassing escalation. Blocking an IP that
    /// is already actively blocked is rejected so an admin sees the existing
    /// entry instead of silently rewriting it.
    pub async fn blacklist_ip(&self, params: BlacklistIpParams) -> Result<BlacklistEntry, Error> {
        let now = Utc::now();
        let existing = self.store.fetch(params.ip_address).await?;

        let entry = match existing {
            Some(entry) if entry.is_active => {
                return Err(Error::new(ErrorDetails::InvalidRequest {
                    message: format!("IP {} is already blacklisted", params.ip_address),
                }));
            }
            Some(mut entry) => {
                entry.is_active = true;
                entry.reason = params.reason.clone();
                entry.last_violation_at = now;
                entry
            }
            None => BlacklistEntry {
                ip_address: params.ip_address,
                reason: params.reason.clone(),
                violation_count: 1,
                first_violation_at: now,
                last_violation_at: now,
                is_active: true,
                reinstated_by: None,
                reinstated_at: None,
                metadata: params
                    .blocked_by
                    .as_deref()
                    .map(|by| serde_json::json!({ "blocked_by": by })),
            },
        };

        self.store.put(entry.clone()).await?;
        self.cache.invalidate(&params.ip_address).await;
        warn!(
            ip = %params.ip_address,
            reason = %params.reason,
            blocked_by = params.blocked_by.as_deref().unwrap_or("unknown"),
            "IP blacklisted by administrator"
        );
        Ok(entry)
    }

    /// Lift an active block. The violation count survives, so the next
    /// violation re-escalates immediately.
    pub async fn reinstate(
        &self,
        ip: IpAddr,
        reinstated_by: &str,
        reason: Option<&str>,
    ) -> Result<BlacklistEntry, Error> {
        let entry = self
            .store
            .reinstate(ip, reinstated_by, reason, Utc::now())
            .await?
            .ok_or_else(|| {
                Error::new(ErrorDetails::InvalidRequest {
                    message: format!("IP {ip} has no blacklist entry"),
                })
            })?;
        self.cache.invalidate(&ip).await;

        info!(ip = %ip, reinstated_by, "IP reinstated");
        Ok(entry)
    }

    /// Delete the entry and its history outright.
    pub async fn remove(&self, ip: IpAddr) -> Result<(), Error> {
        if self.store.remove(ip).await? {
            self.cache.invalidate(&ip).await;
            info!(ip = %ip, "Removed blacklist entry");
            Ok(())
        } else {
            Err(Error::new(ErrorDetails::InvalidRequest {
                message: format!("IP {ip} has no blacklist entry"),
            }))
        }
    }

    pub async fn get(&self, ip: IpAddr) -> Result<Option<BlacklistEntry>, Error> {
        self.store.fetch(ip).await
    }

    pub async fn list(&self, query: &BlacklistQuery) -> Result<Vec<BlacklistEntry>, Error> {
        self.store.list(query).await
    }

    /// Aggregate the violation history for the admin dashboard.
    pub async fn analytics(&self, window_days: u32) -> Result<SecurityAnalytics, Error> {
        let entries = self.store.list(&BlacklistQuery::default()).await?;
        let since = Utc::now() - chrono::Duration::days(i64::from(window_days));

        let mut analytics = SecurityAnalytics {
            window_days,
            ..Default::default()
        };
        let mut offenders: Vec<OffenderSummary> = Vec::with_capacity(entries.len());
        for entry in &entries {
            analytics.total_entries += 1;
            analytics.total_violations += u64::from(entry.violation_count);
            if entry.is_active {
                analytics.actively_blocked += 1;
            }
            if entry.last_violation_at >= since {
                analytics.recent_violations += 1;
            }
            if entry.reinstated_at.is_some() {
                analytics.reinstated += 1;
            }
            offenders.push(OffenderSummary {
                ip_address: entry.ip_address,
                violation_count: entry.violation_count,
                is_active: entry.is_active,
            });
        }

        offenders.sort_by(|a, b| b.violation_count.cmp(&a.violation_count));
        offenders.truncate(TOP_OFFENDERS);
        analytics.top_offenders = offenders;

        Ok(analytics)
    }

    /// Drop inactive entries older than the retention window. Active blocks
    /// are never swept.
    pub async fn cleanup(&self) -> Result<u64, Error> {
        let retention = self.config.load().blacklist_retention_days;
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention));
        self.store.sweep(cutoff).await
    }
}
