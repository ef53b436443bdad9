pub mod manager;

pub use manager::ReflinkManager;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::rate_limit::RateLimitTier;

/// A budget dimension: either uncapped or bounded by a ceiling.
///
/// Modeled as a first-class sum type rather than a nullable limit so the
/// "no ceiling" case cannot be mistaken for "zero ceiling". Serialized as a
/// nullable value for wire/storage compatibility.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum Budget<T> {
    #[default]
    Unbounded,
    Limited(T),
}

impl<T: Copy + PartialOrd> Budget<T> {
    pub fn limit(&self) -> Option<T> {
        match self {
            Budget::Unbounded => None,
            Budget::Limited(limit) => Some(*limit),
        }
    }

    /// Whether `used` has reached the ceiling. Unbounded never exhausts.
    pub fn is_reached(&self, used: T) -> bool {
        match self {
            Budget::Unbounded => false,
            Budget::Limited(limit) => used >= *limit,
        }
    }
}

impl<T> From<Option<T>> for Budget<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            None => Budget::Unbounded,
            Some(limit) => Budget::Limited(limit),
        }
    }
}

impl<T: Serialize> Serialize for Budget<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Budget::Unbounded => serializer.serialize_none(),
            Budget::Limited(limit) => serializer.serialize_some(limit),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Budget<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Option::<T>::deserialize(deserializer).map(Budget::from)
    }
}

/// AI features a reflink can grant. `Chat` is the baseline feature and is
/// always available once budget and rate limit pass; the rest are gated by
/// per-reflink capability flags.
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
pub enum AiFeature {
    Chat,
    VoiceAi,
    JobAnalysis,
    AdvancedNavigation,
}

/// A shareable invitation code granting bounded, revocable access to AI
/// features with its own rate tier and spend/token budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reflink {
    pub id: Uuid,
    /// Unique, unguessable code handed to the invitee.
    pub code: String,
    pub rate_limit_tier: RateLimitTier,
    /// Per-reflink override of the tier's daily ceiling.
    pub daily_limit: Option<u32>,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub token_limit: Budget<u64>,
    pub tokens_used: u64,
    pub spend_limit: Budget<f64>,
    pub spend_used: f64,
    pub enable_voice_ai: bool,
    pub enable_job_analysis: bool,
    pub enable_advanced_navigation: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Reflink {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    pub fn budget_exhausted(&self) -> bool {
        self.token_limit.is_reached(self.tokens_used)
            || self.spend_limit.is_reached(self.spend_used)
    }

    pub fn allows(&self, feature: AiFeature) -> bool {
        match feature {
            AiFeature::Chat => true,
            AiFeature::VoiceAi => self.enable_voice_ai,
            AiFeature::JobAnalysis => self.enable_job_analysis,
            AiFeature::AdvancedNavigation => self.enable_advanced_navigation,
        }
    }

    /// Remaining-budget snapshot. `avg_cost_per_request` feeds the
    /// estimated-requests heuristic used only for UX messaging.
    pub fn budget_status(&self, avg_cost_per_request: f64) -> BudgetStatus {
        let tokens_remaining = self
            .token_limit
            .limit()
            .map(|limit| limit.saturating_sub(self.tokens_used));
        let spend_remaining = self
            .spend_limit
            .limit()
            .map(|limit| (limit - self.spend_used).max(0.0));

        let estimated_requests_remaining = spend_remaining.and_then(|remaining| {
            if avg_cost_per_request > 0.0 {
                Some((remaining / avg_cost_per_request).floor() as u64)
            } else {
                None
            }
        });

        BudgetStatus {
            tokens_remaining,
            spend_remaining,
            is_exhausted: self.budget_exhausted(),
            estimated_requests_remaining,
        }
    }
}

/// Remaining-budget telemetry attached to a successful validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetStatus {
    /// `None` when the token dimension is unbounded.
    pub tokens_remaining: Option<u64>,
    /// `None` when the spend dimension is unbounded.
    pub spend_remaining: Option<f64>,
    pub is_exhausted: bool,
    /// Heuristic (remaining spend ÷ average cost-per-request); UX only.
    pub estimated_requests_remaining: Option<u64>,
}

/// Why a reflink was rejected, in validation-order precedence.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReflinkRejection {
    NotFound,
    Inactive,
    Expired,
    BudgetExhausted,
}

/// Result of validating a reflink code.
#[derive(Debug, Clone, PartialEq)]
pub enum ReflinkValidation {
    Valid {
        reflink: Reflink,
        budget: BudgetStatus,
    },
    Invalid {
        reason: ReflinkRejection,
    },
}

impl ReflinkValidation {
    pub fn is_valid(&self) -> bool {
        matches!(self, ReflinkValidation::Valid { .. })
    }
}

/// Admin input for creating a reflink.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateReflinkInput {
    pub rate_limit_tier: Option<RateLimitTier>,
    pub daily_limit: Option<u32>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub token_limit: Budget<u64>,
    #[serde(default)]
    pub spend_limit: Budget<f64>,
    #[serde(default)]
    pub enable_voice_ai: bool,
    #[serde(default)]
    pub enable_job_analysis: bool,
    #[serde(default)]
    pub enable_advanced_navigation: bool,
}

/// Admin patch for an existing reflink. Unset fields are left unchanged;
/// `clear_expiry` removes an expiration outright.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateReflinkInput {
    pub rate_limit_tier: Option<RateLimitTier>,
    pub daily_limit: Option<u32>,
    pub is_active: Option<bool>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub clear_expiry: bool,
    pub token_limit: Option<Budget<u64>>,
    pub spend_limit: Option<Budget<f64>>,
    pub enable_voice_ai: Option<bool>,
    pub enable_job_analysis: Option<bool>,
    pub enable_advanced_navigation: Option<bool>,
}

impl UpdateReflinkInput {
    pub(crate) fn apply(&self, reflink: &mut Reflink) {
        if let Some(tier) = self.rate_limit_tier {
            reflink.rate_limit_tier = tier;
        }
        if let Some(limit) = self.daily_limit {
            reflink.daily_limit = Some(limit);
        }
        if let Some(active) = self.is_active {
            reflink.is_active = active;
        }
        if self.clear_expiry {
            reflink.expires_at = None;
        } else if let Some(expires_at) = self.expires_at {
            reflink.expires_at = Some(expires_at);
        }
        if let Some(token_limit) = self.token_limit {
            reflink.token_limit = token_limit;
        }
        if let Some(spend_limit) = self.spend_limit {
            reflink.spend_limit = spend_limit;
        }
        if let Some(enabled) = self.enable_voice_ai {
            reflink.enable_voice_ai = enabled;
        }
        if let Some(enabled) = self.enable_job_analysis {
            reflink.enable_job_analysis = enabled;
        }
        if let Some(enabled) = self.enable_advanced_navigation {
            reflink.enable_advanced_navigation = enabled;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_reflink() -> Reflink {
        let now = Utc::now();
        Reflink {
            id: Uuid::now_v7(),
            code: "rfl_test".to_string(),
            rate_limit_tier: RateLimitTier::Extended,
            daily_limit: None,
            is_active: true,
            expires_at: None,
            token_limit: Budget::Limited(1000),
            tokens_used: 0,
            spend_limit: Budget::Limited(5.0),
            spend_used: 0.0,
            enable_voice_ai: false,
            enable_job_analysis: true,
            enable_advanced_navigation: false,
            created_by: "admin".to_string(),
            created_at: now,
            updated_at: now,
            last_used_at: None,
        }
    }

    #[test]
    fn test_budget_serde_as_nullable() {
        let bounded: Budget<u64> = Budget::Limited(100);
        assert_eq!(serde_json::to_string(&bounded).expect("serializes"), "100");

        let unbounded: Budget<u64> = Budget::Unbounded;
        assert_eq!(serde_json::to_string(&unbounded).expect("serializes"), "null");

        let parsed: Budget<u64> = serde_json::from_str("null").expect("deserializes");
        assert_eq!(parsed, Budget::Unbounded);
        let parsed: Budget<u64> = serde_json::from_str("42").expect("deserializes");
        assert_eq!(parsed, Budget::Limited(42));
    }

    #[test]
    fn test_budget_is_reached() {
        let budget: Budget<u64> = Budget::Limited(10);
        assert!(!budget.is_reached(9));
        assert!(budget.is_reached(10));
        assert!(budget.is_reached(11));
        assert!(!Budget::<u64>::Unbounded.is_reached(u64::MAX));
    }

    #[test]
    fn test_expiry_is_inclusive_at_boundary() {
        let now = Utc::now();
        let mut reflink = sample_reflink();
        reflink.expires_at = Some(now);
        assert!(reflink.is_expired(now));
        reflink.expires_at = Some(now + Duration::seconds(1));
        assert!(!reflink.is_expired(now));
    }

    #[test]
    fn test_feature_gating() {
        let reflink = sample_reflink();
        assert!(reflink.allows(AiFeature::Chat));
        assert!(reflink.allows(AiFeature::JobAnalysis));
        assert!(!reflink.allows(AiFeature::VoiceAi));
        assert!(!reflink.allows(AiFeature::AdvancedNavigation));
    }

    #[test]
    fn test_budget_status_estimate() {
        let mut reflink = sample_reflink();
        reflink.tokens_used = 400;
        reflink.spend_used = 1.0;

        let status = reflink.budget_status(0.02);
        assert_eq!(status.tokens_remaining, Some(600));
        assert_eq!(status.spend_remaining, Some(4.0));
        assert!(!status.is_exhausted);
        assert_eq!(status.estimated_requests_remaining, Some(200));
    }

    #[test]
    fn test_budget_status_unbounded() {
        let mut reflink = sample_reflink();
        reflink.token_limit = Budget::Unbounded;
        reflink.spend_limit = Budget::Unbounded;
        reflink.tokens_used = 1_000_000;

        let status = reflink.budget_status(0.02);
        assert_eq!(status.tokens_remaining, None);
        assert_eq!(status.spend_remaining, None);
        assert_eq!(status.estimated_requests_remaining, None);
        assert!(!status.is_exhausted);
    }

    #[test]
    fn test_update_apply_clear_expiry() {
        let mut reflink = sample_reflink();
        reflink.expires_at = Some(Utc::now());

        let update = UpdateReflinkInput {
            clear_expiry: true,
            enable_voice_ai: Some(true),
            ..Default::default()
        };
        update.apply(&mut reflink);

        assert_eq!(reflink.expires_at, None);
        assert!(reflink.enable_voice_ai);
        // Untouched fields survive.
        assert!(reflink.enable_job_analysis);
        assert_eq!(reflink.token_limit, Budget::Limited(1000));
    }
}
