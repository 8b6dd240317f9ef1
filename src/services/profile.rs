// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Profile service: the entry point for everything the transport layer does
//! with a user record.

use super::email::ConfirmationMailer;
use super::ethereum::{SignatureRecovery, TokenBalances};
use super::events::{EventEmitter, UserCreatedData, UserEvent};
use super::referral::ReferralEngine;
use super::verification::{
    parse_email, parse_eth_address, EmailProof, EthereumProof, Proof, VerificationEngine,
};
use crate::db::IdentityStore;
use crate::error::AppError;
use crate::models::{is_valid_country_code, EthAddress, User};
use crate::time_utils::Clock;
use futures_util::{stream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;

// Balance lookups in flight at once for one email check.
const MAX_CONCURRENT_BALANCE_CHECKS: usize = 8;

/// Facts the identity provider has already verified, used to seed a new
/// record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileHints {
    pub verified_email: Option<String>,
    pub verified_ethereum_address: Option<EthAddress>,
    pub in_app_wallet: bool,
    /// Reported in the user-created event
    pub signup_method: String,
}

/// Requested profile changes. `None` leaves a field as it is.
#[derive(Debug, Clone, Default)]
pub struct ProfilePatch {
    pub email_address: Option<String>,
    pub country_code: Option<String>,
    pub ethereum_address: Option<String>,
}

/// Distinct token-holding wallets, by custody.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalletCounts {
    pub in_app: u32,
    pub external: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmailUsage {
    pub in_use: bool,
    pub wallet_counts: WalletCounts,
}

/// A user together with its referrer's proven wallet.
#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub user: User,
    pub referrer_ethereum_address: Option<EthAddress>,
}

pub struct ProfileService {
    store: Arc<dyn IdentityStore>,
    verification: VerificationEngine,
    referrals: ReferralEngine,
    balances: Arc<dyn TokenBalances>,
    events: EventEmitter,
    clock: Arc<dyn Clock>,
}

impl ProfileService {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        mailer: Arc<dyn ConfirmationMailer>,
        signatures: Arc<dyn SignatureRecovery>,
        balances: Arc<dyn TokenBalances>,
        events: EventEmitter,
        clock: Arc<dyn Clock>,
        app_name: &str,
    ) -> Self {
        Self {
            verification: VerificationEngine::new(
                store.clone(),
                mailer,
                signatures,
                clock.clone(),
                app_name,
            ),
            referrals: ReferralEngine::new(store.clone(), events.clone(), clock.clone()),
            store,
            balances,
            events,
            clock,
        }
    }

    pub fn verification(&self) -> &VerificationEngine {
        &self.verification
    }

    pub fn referrals(&self) -> &ReferralEngine {
        &self.referrals
    }

    /// Load the caller's record, creating it on first sight.
    ///
    /// Concurrent first requests for the same subject converge on a single
    /// record. `referral_code` only matters when the record is created.
    pub async fn get_or_create(
        &self,
        subject_id: &str,
        hints: &ProfileHints,
        referral_code: Option<&str>,
    ) -> Result<User, AppError> {
        if let Some(user) = self.store.get_user(subject_id).await? {
            return Ok(user);
        }

        let referrer_id = self
            .referrals
            .resolve_presented_code(referral_code)
            .await?
            .map(|r| r.id);
        let now = self.clock.now();

        let (user, created) = self
            .referrals
            .create_with_unique_code(|code| {
                let mut user = User::new(subject_id, code, now);
                if let Some(email) = &hints.verified_email {
                    EmailProof::set_subject(&mut user, email.clone());
                    EmailProof::redeem(&mut user);
                }
                if let Some(address) = hints.verified_ethereum_address {
                    EthereumProof::set_subject(&mut user, address);
                    EthereumProof::redeem(&mut user);
                    user.in_app_wallet = hints.in_app_wallet;
                }
                user.referrer_id = referrer_id.clone();
                user
            })
            .await?;

        if created {
            tracing::info!(
                user_id = %user.id,
                referrer_id = user.referrer_id.as_deref().unwrap_or_default(),
                method = %hints.signup_method,
                "User created"
            );
            self.events.emit(UserEvent::Created(UserCreatedData {
                timestamp: user.created_at,
                user_id: user.id.clone(),
                method: hints.signup_method.clone(),
            }));
        }

        Ok(user)
    }

    /// Apply a validated patch. Nothing is written unless every field is valid.
    pub async fn update_profile(&self, user_id: &str, patch: &ProfilePatch) -> Result<User, AppError> {
        let country_code = patch
            .country_code
            .as_deref()
            .map(|raw| {
                let code = raw.trim().to_ascii_uppercase();
                if is_valid_country_code(&code) {
                    Ok(code)
                } else {
                    Err(AppError::InvalidInput(format!("invalid country code: {raw}")))
                }
            })
            .transpose()?;
        let email = patch.email_address.as_deref().map(parse_email).transpose()?;
        let address = patch
            .ethereum_address
            .as_deref()
            .map(parse_eth_address)
            .transpose()?;

        let user = self
            .store
            .modify_user(user_id, &|u: &mut User| {
                if let Some(code) = &country_code {
                    u.country_code = Some(code.clone());
                }
                if let Some(email) = &email {
                    EmailProof::set_subject(u, email.clone());
                }
                if let Some(address) = address {
                    EthereumProof::set_subject(u, address);
                }
                Ok(())
            })
            .await?;

        tracing::info!(user_id = %user_id, "Profile updated");
        Ok(user)
    }

    /// Hard delete. Completed referrals involving the user are kept.
    pub async fn delete_profile(&self, user_id: &str) -> Result<(), AppError> {
        self.store.delete_user(user_id).await?;
        tracing::info!(user_id = %user_id, "User deleted");
        Ok(())
    }

    pub async fn agree_tos(&self, user_id: &str) -> Result<User, AppError> {
        let now = self.clock.now();
        self.store
            .modify_user(user_id, &|u: &mut User| {
                u.agreed_tos_at = Some(now);
                Ok(())
            })
            .await
    }

    /// Whether a fully confirmed user owns `email`, and how many distinct
    /// token-holding wallets those users have.
    ///
    /// Each address is classified by the first (oldest) record carrying it.
    pub async fn check_email_in_use(&self, email: &str) -> Result<EmailUsage, AppError> {
        let email = parse_email(email)?;
        let users = self.store.list_users_by_email(&email).await?;

        let mut first_seen: HashMap<EthAddress, bool> = HashMap::new();
        let mut in_use = false;
        for user in users.iter().filter(|u| u.is_fully_confirmed()) {
            in_use = true;
            if let Some(address) = user.confirmed_ethereum_address() {
                first_seen.entry(address).or_insert(user.in_app_wallet);
            }
        }

        let holdings = stream::iter(first_seen)
            .map(|(address, in_app)| async move {
                let holds = self.balances.holds_tokens(&address).await?;
                Ok::<_, AppError>((holds, in_app))
            })
            .buffer_unordered(MAX_CONCURRENT_BALANCE_CHECKS)
            .collect::<Vec<Result<(bool, bool), AppError>>>()
            .await
            .into_iter()
            .collect::<Result<Vec<_>, AppError>>()?;

        let mut counts = WalletCounts::default();
        for (holds, in_app) in holdings {
            if !holds {
                continue;
            }
            if in_app {
                counts.in_app += 1;
            } else {
                counts.external += 1;
            }
        }

        Ok(EmailUsage {
            in_use,
            wallet_counts: counts,
        })
    }

    pub async fn get_user_record(&self, user_id: &str) -> Result<UserRecord, AppError> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {user_id} not found")))?;
        self.with_referrer(user).await
    }

    pub async fn get_user_by_eth_address(&self, address: &str) -> Result<UserRecord, AppError> {
        let address = parse_eth_address(address)?;
        let user = self
            .store
            .find_user_by_eth_address(&address)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("No user with address {address}")))?;
        self.with_referrer(user).await
    }

    async fn with_referrer(&self, user: User) -> Result<UserRecord, AppError> {
        let referrer_ethereum_address = match &user.referrer_id {
            Some(id) => self
                .store
                .get_user(id)
                .await?
                .and_then(|r| r.confirmed_ethereum_address()),
            None => None,
        };

        Ok(UserRecord {
            user,
            referrer_ethereum_address,
        })
    }
}
