// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Referral codes, referrer links and completed referrals.

use super::events::{EventEmitter, ReferralCompletedData, UserEvent};
use super::BatchReport;
use crate::codes;
use crate::db::IdentityStore;
use crate::error::AppError;
use crate::models::{normalize_vin, Referral, User};
use crate::time_utils::Clock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Attempts at finding an unused referral code before giving up.
pub const MAX_CODE_ATTEMPTS: usize = 5;

/// Result of processing a device registration.
#[derive(Debug, Clone, PartialEq)]
pub enum ReferralOutcome {
    Recorded(Referral),
    /// The registering user was not referred by anyone.
    NoReferrer,
    /// No such user (e.g. deleted since the device was registered).
    UnknownUser,
    /// The VIN already earned a referral credit.
    AlreadyCredited,
}

pub struct ReferralEngine {
    store: Arc<dyn IdentityStore>,
    events: EventEmitter,
    clock: Arc<dyn Clock>,
}

impl ReferralEngine {
    pub fn new(store: Arc<dyn IdentityStore>, events: EventEmitter, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            events,
            clock,
        }
    }

    /// Insert a new user built by `seed` around a fresh referral code,
    /// regenerating the code whenever it collides with an existing one.
    pub async fn create_with_unique_code(
        &self,
        seed: impl Fn(String) -> User,
    ) -> Result<(User, bool), AppError> {
        for attempt in 1..=MAX_CODE_ATTEMPTS {
            let user = seed(codes::referral_code()?);
            match self.store.create_user_if_absent(&user).await {
                Err(AppError::Conflict(reason)) => {
                    tracing::warn!(user_id = %user.id, attempt, reason = %reason, "Referral code collision, regenerating");
                }
                result => return result,
            }
        }

        Err(AppError::Internal(anyhow::anyhow!(
            "no unique referral code after {} attempts",
            MAX_CODE_ATTEMPTS
        )))
    }

    /// Resolve a code presented at signup.
    ///
    /// Unknown, stale and blank codes resolve to no referrer. Signup is never
    /// blocked by a bad code.
    pub async fn resolve_presented_code(&self, code: Option<&str>) -> Result<Option<User>, AppError> {
        let Some(code) = code.map(str::trim).filter(|c| !c.is_empty()) else {
            return Ok(None);
        };

        let referrer = self.store.find_user_by_referral_code(code).await?;
        if referrer.is_none() {
            tracing::info!(referral_code = %code, "Ignoring unknown referral code at signup");
        }
        Ok(referrer)
    }

    /// Link an existing user to the owner of `code`.
    pub async fn submit_referral_code(&self, user_id: &str, code: &str) -> Result<User, AppError> {
        let code = code.trim();
        let referrer = self
            .store
            .find_user_by_referral_code(code)
            .await?
            .ok_or_else(|| AppError::InvalidInput(format!("unknown referral code: {code}")))?;

        if referrer.id == user_id {
            return Err(AppError::InvalidInput(
                "cannot use your own referral code".to_string(),
            ));
        }

        let user = self
            .store
            .modify_user(user_id, &|u: &mut User| {
                if u.referrer_id.is_some() {
                    return Err(AppError::InvalidState("already referred".to_string()));
                }
                u.referrer_id = Some(referrer.id.clone());
                Ok(())
            })
            .await?;

        tracing::info!(user_id = %user_id, referrer_id = %referrer.id, "Referral code submitted");
        Ok(user)
    }

    /// Credit the referrer of `user_id` for the registration of `vin`.
    ///
    /// Each VIN is credited at most once. Repeats are reported as
    /// [`ReferralOutcome::AlreadyCredited`], not as errors.
    pub async fn complete_referral(&self, user_id: &str, vin: &str) -> Result<ReferralOutcome, AppError> {
        let vin = normalize_vin(vin)
            .ok_or_else(|| AppError::InvalidInput(format!("invalid VIN: {vin}")))?;

        let Some(user) = self.store.get_user(user_id).await? else {
            tracing::info!(user_id = %user_id, vin = %vin, "Device registered for unknown user");
            return Ok(ReferralOutcome::UnknownUser);
        };
        let Some(referrer_id) = user.referrer_id else {
            tracing::debug!(user_id = %user_id, vin = %vin, "Device registered by unreferred user");
            return Ok(ReferralOutcome::NoReferrer);
        };

        let referral = Referral {
            vin,
            referrer_user_id: referrer_id,
            referred_user_id: user.id,
            created_at: self.clock.now(),
        };

        match self.store.insert_referral(&referral).await {
            Ok(()) => {}
            Err(AppError::Conflict(_)) => {
                tracing::info!(user_id = %user_id, vin = %referral.vin, "VIN already credited");
                return Ok(ReferralOutcome::AlreadyCredited);
            }
            Err(e) => return Err(e),
        }

        tracing::info!(
            user_id = %referral.referred_user_id,
            referrer_id = %referral.referrer_user_id,
            vin = %referral.vin,
            "Referral completed"
        );
        self.events
            .emit(UserEvent::ReferralCompleted(ReferralCompletedData {
                timestamp: referral.created_at,
                user_id: referral.referred_user_id.clone(),
                referring_user_id: referral.referrer_user_id.clone(),
            }));

        Ok(ReferralOutcome::Recorded(referral))
    }

    async fn assign_unique_code(&self, user_id: &str) -> Result<User, AppError> {
        for attempt in 1..=MAX_CODE_ATTEMPTS {
            let code = codes::referral_code()?;
            match self.store.assign_referral_code(user_id, &code).await {
                Err(AppError::Conflict(reason)) => {
                    tracing::warn!(user_id = %user_id, attempt, reason = %reason, "Referral code collision, regenerating");
                }
                result => return result,
            }
        }

        Err(AppError::Internal(anyhow::anyhow!(
            "no unique referral code after {} attempts",
            MAX_CODE_ATTEMPTS
        )))
    }

    /// Give every legacy user without a referral code a fresh one.
    ///
    /// Individual failures are logged and counted; the batch carries on.
    /// `stop` is checked between users.
    pub async fn backfill_referral_codes(&self, stop: &AtomicBool) -> Result<BatchReport, AppError> {
        let users = self.store.list_users_missing_referral_code().await?;
        tracing::info!(count = users.len(), "Starting referral code backfill");

        let mut report = BatchReport::default();
        for user in users {
            if stop.load(Ordering::SeqCst) {
                report.interrupted = true;
                tracing::warn!("Referral code backfill interrupted");
                break;
            }

            match self.assign_unique_code(&user.id).await {
                Ok(updated) => {
                    report.succeeded += 1;
                    tracing::info!(
                        user_id = %updated.id,
                        referral_code = updated.referral_code.as_deref().unwrap_or_default(),
                        "Assigned referral code"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(user_id = %user.id, error = %e, "Failed to assign referral code");
                }
            }
        }

        tracing::info!(
            succeeded = report.succeeded,
            failed = report.failed,
            interrupted = report.interrupted,
            "Referral code backfill finished"
        );
        Ok(report)
    }
}
