use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::Utc;
use rand::distr::Alphanumeric;
use rand::Rng;
use tracing::info;
use uuid::Uuid;

use crate::config::AccessConfig;
use crate::error::{Error, ErrorDetails};
use crate::rate_limit::RateLimitTier;
use crate::reflink::{
    BudgetStatus, CreateReflinkInput, Reflink, ReflinkRejection, ReflinkValidation,
    UpdateReflinkInput,
};
use crate::store::{ConsumeOutcome, ReflinkStore, UsageReceipt};

/// Length of the random suffix after the `rfl_` prefix.
const CODE_SUFFIX_LEN: usize = 24;

/// How many fresh codes to try before giving up on a collision streak.
const CODE_RETRIES: usize = 3;

/// Lifecycle and validation of invitation reflinks.
///
/// Validation is the hot-path read; everything else is administrative. The
/// store owns budget atomicity, the manager owns code generation, precedence
/// of rejection reasons, and the error surface.
pub struct ReflinkManager {
    store: Arc<dyn ReflinkStore>,
    config: Arc<ArcSwap<AccessConfig>>,
}

impl ReflinkManager {
    pub fn new(store: Arc<dyn ReflinkStore>, config: Arc<ArcSwap<AccessConfig>>) -> Self {
        Self { store, config }
    }

    fn generate_code() -> String {
        let suffix: String = rand::rng()
            .sample_iter(Alphanumeric)
            .take(CODE_SUFFIX_LEN)
            .map(char::from)
            .collect();
        format!("rfl_{suffix}")
    }

    /// Mint a new reflink. The code is generated server-side and returned
    /// exactly once here; it is not derivable from the id.
    pub async fn create(
        &self,
        input: CreateReflinkInput,
        created_by: &str,
    ) -> Result<Reflink, Error> {
        let now = Utc::now();

        for _ in 0..CODE_RETRIES {
            let reflink = Reflink {
                id: Uuid::now_v7(),
                code: Self::generate_code(),
                rate_limit_tier: input.rate_limit_tier.unwrap_or(RateLimitTier::Standard),
                daily_limit: input.daily_limit,
                is_active: true,
                expires_at: input.expires_at,
                token_limit: input.token_limit,
                tokens_used: 0,
                spend_limit: input.spend_limit,
                spend_used: 0.0,
                enable_voice_ai: input.enable_voice_ai,
                enable_job_analysis: input.enable_job_analysis,
                enable_advanced_navigation: input.enable_advanced_navigation,
                created_by: created_by.to_string(),
                created_at: now,
                updated_at: now,
                last_used_at: None,
            };

            match self.store.insert(reflink.clone()).await {
                Ok(()) => {
                    info!(
                        reflink_id = %reflink.id,
                        tier = %reflink.rate_limit_tier,
                        created_by,
                        "Created reflink"
                    );
                    return Ok(reflink);
                }
                // 62^24 codes; a collision here means something else is
                // wrong, but one retry is cheap.
                Err(_) => continue,
            }
        }

        Err(Error::new(ErrorDetails::InternalError {
            message: format!("Failed to generate a unique reflink code after {CODE_RETRIES} attempts"),
        }))
    }

    /// Validate a code for use. Rejection reasons are checked in a fixed
    /// precedence so a reflink that is both inactive and expired always
    /// reports `inactive`. The store call runs under the configured timeout
    /// and fails closed; an unknown validity never admits traffic.
    pub async fn validate(&self, code: &str) -> Result<ReflinkValidation, Error> {
        let config = self.config.load();
        let fetched = tokio::time::timeout(config.store_timeout(), self.store.fetch_by_code(code))
            .await
            .map_err(|_| {
                Error::new(ErrorDetails::StoreUnavailable {
                    operation: "reflink_fetch",
                    message: format!("Reflink store timed out after {}ms", config.store_timeout_ms),
                })
            })??;

        let Some(reflink) = fetched else {
            return Ok(ReflinkValidation::Invalid {
                reason: ReflinkRejection::NotFound,
            });
        };

        if !reflink.is_active {
            return Ok(ReflinkValidation::Invalid {
                reason: ReflinkRejection::Inactive,
            });
        }
        if reflink.is_expired(Utc::now()) {
            return Ok(ReflinkValidation::Invalid {
                reason: ReflinkRejection::Expired,
            });
        }
        if reflink.budget_exhausted() {
            return Ok(ReflinkValidation::Invalid {
                reason: ReflinkRejection::BudgetExhausted,
            });
        }

        let budget = reflink.budget_status(config.avg_cost_per_request);
        Ok(ReflinkValidation::Valid { reflink, budget })
    }

    pub async fn get(&self, id: Uuid) -> Result<Reflink, Error> {
        self.store
            .fetch(id)
            .await?
            .ok_or_else(|| Error::new(ErrorDetails::ReflinkNotFound { id }))
    }

    pub async fn list(&self) -> Result<Vec<Reflink>, Error> {
        self.store.list().await
    }

    pub async fn update(&self, id: Uuid, input: UpdateReflinkInput) -> Result<Reflink, Error> {
        self.store
            .apply_update(id, input, Utc::now())
            .await?
            .ok_or_else(|| Error::new(ErrorDetails::ReflinkNotFound { id }))
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), Error> {
        if self.store.delete(id).await? {
            info!(reflink_id = %id, "Deleted reflink");
            Ok(())
        } else {
            Err(Error::new(ErrorDetails::ReflinkNotFound { id }))
        }
    }

    /// Charge actual provider usage against the reflink's budget. Charges cap
    /// at the ceilings; once a ceiling is reached the receipt says so and
    /// subsequent charges are rejected.
    pub async fn record_usage(
        &self,
        id: Uuid,
        tokens: u64,
        spend: f64,
    ) -> Result<UsageReceipt, Error> {
        match self.store.consume(id, tokens, spend, Utc::now()).await? {
            ConsumeOutcome::Charged(receipt) => {
                if receipt.exhausted {
                    info!(reflink_id = %id, "Reflink budget exhausted");
                }
                Ok(receipt)
            }
            ConsumeOutcome::Rejected(ReflinkRejection::NotFound) => {
                Err(Error::new(ErrorDetails::ReflinkNotFound { id }))
            }
            ConsumeOutcome::Rejected(reason) => {
                let code = self
                    .store
                    .fetch(id)
                    .await?
                    .map(|reflink| reflink.code)
                    .unwrap_or_default();
                Err(Error::new(ErrorDetails::Reflink { code, reason }))
            }
        }
    }

    /// Zero the usage counters, reopening the budget. Idempotent; does not
    /// touch `is_active` or `expires_at`.
    pub async fn reset_usage(&self, id: Uuid) -> Result<Reflink, Error> {
        let reflink = self
            .store
            .reset_usage(id, Utc::now())
            .await?
            .ok_or_else(|| Error::new(ErrorDetails::ReflinkNotFound { id }))?;
        info!(reflink_id = %id, "Reset reflink usage");
        Ok(reflink)
    }

    /// Current budget standing for the admin surface.
    pub async fn budget_status(&self, id: Uuid) -> Result<BudgetStatus, Error> {
        let reflink = self.get(id).await?;
        Ok(reflink.budget_status(self.config.load().avg_cost_per_request))
    }

    /// Retire reflinks whose expiration has passed; returns how many flipped.
    pub async fn cleanup(&self) -> Result<u64, Error> {
        let retired = self.store.deactivate_expired(Utc::now()).await?;
        if retired > 0 {
            info!(retired, "Deactivated expired reflinks");
        }
        Ok(retired)
    }
}
