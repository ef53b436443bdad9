pub mod manager;

pub use manager::BlacklistManager;

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-IP violation history with escalating enforcement.
///
/// `violation_count` only ever grows while the entry exists; reinstatement
/// clears the active block and stamps who/when but never zeroes the count, so
/// a repeat offender re-escalates from its prior standing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub ip_address: IpAddr,
    /// Most recent violation reason.
    pub reason: String,
    pub violation_count: u32,
    pub first_violation_at: DateTime<Utc>,
    pub last_violation_at: DateTime<Utc>,
    /// True once the escalation threshold has been crossed; only an active
    /// entry blocks requests.
    pub is_active: bool,
    pub reinstated_by: Option<String>,
    pub reinstated_at: Option<DateTime<Utc>>,
    /// Classifier scores, endpoint, or other context for the admin UI.
    pub metadata: Option<serde_json::Value>,
}

/// Hot-path check result.
#[derive(Debug, Clone, PartialEq)]
pub struct BlacklistCheck {
    pub blacklisted: bool,
    pub entry: Option<BlacklistEntry>,
}

impl BlacklistCheck {
    pub fn clear() -> Self {
        Self {
            blacklisted: false,
            entry: None,
        }
    }
}

/// Listing options for the admin surface.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BlacklistQuery {
    /// Only entries that are currently blocking.
    #[serde(default)]
    pub active_only: bool,
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

/// Parameters for a direct administrative block.
#[derive(Debug, Clone, Deserialize)]
pub struct BlacklistIpParams {
    pub ip_address: IpAddr,
    pub reason: String,
    pub blocked_by: Option<String>,
}

/// Read-only security aggregation for admin dashboards.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SecurityAnalytics {
    pub total_entries: u64,
    pub total_violations: u64,
    pub actively_blocked: u64,
    /// Violations whose last occurrence falls inside the trailing window.
    pub recent_violations: u64,
    pub reinstated: u64,
    /// Worst offenders by violation count, capped at five.
    pub top_offenders: Vec<OffenderSummary>,
    pub window_days: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OffenderSummary {
    pub ip_address: IpAddr,
    pub violation_count: u32,
    pub is_active: bool,
}
