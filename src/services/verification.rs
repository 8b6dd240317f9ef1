// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Email and Ethereum ownership proofs.
//!
//! Both follow the same lifecycle: a subject (address) is set, an artifact
//! (confirmation key or challenge) is issued with a timestamp, and the
//! artifact is redeemed once within a fixed window. [`Proof`] describes
//! where a kind of proof lives on the [`User`]; [`ProofSlot`] implements the
//! shared transitions.

use crate::codes;
use crate::db::IdentityStore;
use crate::error::AppError;
use crate::models::{EthAddress, User};
use crate::services::email::ConfirmationMailer;
use crate::services::ethereum::{parse_signature, SignatureRecovery};
use crate::time_utils::{format_utc_rfc3339, Clock};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use validator::ValidateEmail;

pub const EMAIL_CONFIRMATION_WINDOW_SECS: i64 = 5 * 60;
pub const ETHEREUM_CHALLENGE_WINDOW_SECS: i64 = 5 * 60;

/// Mutable view of one proof's fields on a user record.
pub struct ProofSlot<'a, S> {
    pub subject: &'a mut Option<S>,
    pub confirmed: &'a mut bool,
    pub pending: &'a mut Option<String>,
    pub issued_at: &'a mut Option<DateTime<Utc>>,
}

impl<S: PartialEq> ProofSlot<'_, S> {
    /// Store a new subject. A changed subject loses its confirmation and any
    /// pending artifact; an unchanged one is left alone. Returns whether it
    /// changed.
    pub fn replace_subject(&mut self, subject: S) -> bool {
        if self.subject.as_ref() == Some(&subject) {
            return false;
        }
        *self.subject = Some(subject);
        *self.confirmed = false;
        self.clear_pending();
        true
    }

    fn clear_pending(&mut self) {
        *self.pending = None;
        *self.issued_at = None;
    }

    /// Record a freshly issued artifact, replacing any earlier one.
    pub fn issue(&mut self, kind: &str, artifact: String, now: DateTime<Utc>) -> Result<(), AppError> {
        if self.subject.is_none() {
            return Err(AppError::InvalidState(format!("no {kind} on file")));
        }
        if *self.confirmed {
            return Err(AppError::InvalidState(format!("{kind} already confirmed")));
        }
        *self.pending = Some(artifact);
        *self.issued_at = Some(now);
        Ok(())
    }

    /// The outstanding artifact, if it can still be redeemed at `now`.
    pub fn pending_artifact(
        &self,
        kind: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<&str, AppError> {
        if *self.confirmed {
            return Err(AppError::InvalidState(format!("{kind} already confirmed")));
        }
        let (Some(artifact), Some(issued_at)) = (self.pending.as_deref(), *self.issued_at) else {
            return Err(AppError::InvalidState(format!(
                "no {kind} confirmation in progress"
            )));
        };
        if now - issued_at > window {
            return Err(AppError::Expired(format!("{kind} confirmation expired")));
        }
        Ok(artifact)
    }

    /// Mark the subject proven and consume the artifact.
    pub fn redeem(&mut self) {
        *self.confirmed = true;
        self.clear_pending();
    }
}

/// A kind of ownership proof stored on a [`User`].
pub trait Proof {
    /// Human-readable name used in error messages.
    const KIND: &'static str;
    const WINDOW_SECS: i64;
    type Subject: PartialEq + Clone;

    fn slot(user: &mut User) -> ProofSlot<'_, Self::Subject>;

    fn window() -> Duration {
        Duration::seconds(Self::WINDOW_SECS)
    }

    fn set_subject(user: &mut User, subject: Self::Subject) -> bool {
        Self::slot(user).replace_subject(subject)
    }

    fn issue(user: &mut User, artifact: String, now: DateTime<Utc>) -> Result<(), AppError> {
        Self::slot(user).issue(Self::KIND, artifact, now)
    }

    /// Subject and artifact of a redeemable proof.
    fn pending(user: &mut User, now: DateTime<Utc>) -> Result<(Self::Subject, String), AppError> {
        let slot = Self::slot(user);
        let artifact = slot
            .pending_artifact(Self::KIND, Self::window(), now)?
            .to_string();
        let subject = slot
            .subject
            .clone()
            .ok_or_else(|| AppError::InvalidState(format!("no {} on file", Self::KIND)))?;
        Ok((subject, artifact))
    }

    fn redeem(user: &mut User) {
        Self::slot(user).redeem()
    }
}

pub struct EmailProof;

impl Proof for EmailProof {
    const KIND: &'static str = "email";
    const WINDOW_SECS: i64 = EMAIL_CONFIRMATION_WINDOW_SECS;
    type Subject = String;

    fn slot(user: &mut User) -> ProofSlot<'_, String> {
        ProofSlot {
            subject: &mut user.email_address,
            confirmed: &mut user.email_confirmed,
            pending: &mut user.email_confirmation_key,
            issued_at: &mut user.email_confirmation_sent_at,
        }
    }
}

pub struct EthereumProof;

impl Proof for EthereumProof {
    const KIND: &'static str = "Ethereum address";
    const WINDOW_SECS: i64 = ETHEREUM_CHALLENGE_WINDOW_SECS;
    type Subject = EthAddress;

    fn slot(user: &mut User) -> ProofSlot<'_, EthAddress> {
        ProofSlot {
            subject: &mut user.ethereum_address,
            confirmed: &mut user.ethereum_confirmed,
            pending: &mut user.ethereum_challenge,
            issued_at: &mut user.ethereum_challenge_sent_at,
        }
    }
}

/// Validate and normalize an email address.
pub fn parse_email(raw: &str) -> Result<String, AppError> {
    let email = raw.trim();
    if !email.validate_email() {
        return Err(AppError::InvalidInput(format!(
            "invalid email address: {email}"
        )));
    }
    Ok(email.to_string())
}

/// Validate and normalize an Ethereum address.
pub fn parse_eth_address(raw: &str) -> Result<EthAddress, AppError> {
    raw.trim()
        .parse()
        .map_err(|e| AppError::InvalidInput(format!("{e}")))
}

/// Caller context recorded when a wallet is proven.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalletContext {
    pub in_app_wallet: bool,
}

/// Runs the email confirmation and Ethereum challenge flows.
pub struct VerificationEngine {
    store: Arc<dyn IdentityStore>,
    mailer: Arc<dyn ConfirmationMailer>,
    signatures: Arc<dyn SignatureRecovery>,
    clock: Arc<dyn Clock>,
    app_name: String,
}

impl VerificationEngine {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        mailer: Arc<dyn ConfirmationMailer>,
        signatures: Arc<dyn SignatureRecovery>,
        clock: Arc<dyn Clock>,
        app_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            mailer,
            signatures,
            clock,
            app_name: app_name.into(),
        }
    }

    /// Store a new confirmation key, then mail it.
    pub async fn send_confirmation(&self, user_id: &str) -> Result<User, AppError> {
        let key = codes::confirmation_key()?;
        let now = self.clock.now();

        let user = self
            .store
            .modify_user(user_id, &|u: &mut User| EmailProof::issue(u, key.clone(), now))
            .await?;

        let to = user
            .email_address
            .as_deref()
            .ok_or_else(|| AppError::InvalidState("no email on file".to_string()))?;
        if let Err(e) = self.mailer.send_confirmation(to, &key).await {
            tracing::error!(user_id = %user_id, error = %e, "Failed to send confirmation email");
            return Err(e);
        }

        tracing::info!(user_id = %user_id, "Email confirmation sent");
        Ok(user)
    }

    /// Check `supplied` against the stored key and confirm the email.
    ///
    /// The comparison and the state change happen in one atomic update, so
    /// a key can be redeemed at most once.
    pub async fn confirm_email(&self, user_id: &str, supplied: &str) -> Result<User, AppError> {
        let supplied = supplied.trim();
        let now = self.clock.now();

        let user = self
            .store
            .modify_user(user_id, &|u: &mut User| {
                let (_, key) = EmailProof::pending(u, now)?;
                if !bool::from(key.as_bytes().ct_eq(supplied.as_bytes())) {
                    return Err(AppError::Mismatch(
                        "confirmation key does not match".to_string(),
                    ));
                }
                EmailProof::redeem(u);
                Ok(())
            })
            .await?;

        tracing::info!(user_id = %user_id, "Email confirmed");
        Ok(user)
    }

    /// Issue a signed-message challenge for the address on file.
    pub async fn generate_challenge(&self, user_id: &str) -> Result<String, AppError> {
        let current = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {user_id} not found")))?;
        let address = current
            .ethereum_address
            .ok_or_else(|| AppError::InvalidState("no Ethereum address on file".to_string()))?;

        let now = self.clock.now();
        let challenge = self.challenge_text(user_id, &address, &codes::challenge_nonce()?, now);

        self.store
            .modify_user(user_id, &|u: &mut User| {
                if u.ethereum_address != Some(address) {
                    return Err(AppError::InvalidState(
                        "Ethereum address changed".to_string(),
                    ));
                }
                EthereumProof::issue(u, challenge.clone(), now)
            })
            .await?;

        tracing::info!(user_id = %user_id, address = %address, "Ethereum challenge issued");
        Ok(challenge)
    }

    fn challenge_text(
        &self,
        user_id: &str,
        address: &EthAddress,
        nonce: &str,
        now: DateTime<Utc>,
    ) -> String {
        let expires = now + EthereumProof::window();
        format!(
            "{} wants you to prove that you own this Ethereum address.\n\
             \n\
             Address: {}\n\
             User: {}\n\
             Nonce: {}\n\
             Issued At: {}\n\
             Expires At: {}",
            self.app_name,
            address,
            user_id,
            nonce,
            format_utc_rfc3339(now),
            format_utc_rfc3339(expires),
        )
    }

    /// Verify a signature over the outstanding challenge.
    ///
    /// The signer is recovered outside the store update; the update then
    /// requires the same challenge to still be pending.
    pub async fn submit_signature(
        &self,
        user_id: &str,
        signature: &str,
        context: WalletContext,
    ) -> Result<User, AppError> {
        let signature = parse_signature(signature)?;

        let mut current = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {user_id} not found")))?;
        let (address, challenge) = EthereumProof::pending(&mut current, self.clock.now())?;

        let signer = self.signatures.recover_signer(&challenge, &signature).await?;
        if signer != address {
            tracing::info!(user_id = %user_id, expected = %address, recovered = %signer, "Ethereum signature mismatch");
            return Err(AppError::Mismatch(
                "signature was not produced by the address on file".to_string(),
            ));
        }

        let now = self.clock.now();
        let user = self
            .store
            .modify_user(user_id, &|u: &mut User| {
                let (still_address, still_challenge) = EthereumProof::pending(u, now)?;
                if still_address != address || still_challenge != challenge {
                    return Err(AppError::InvalidState(
                        "challenge was replaced".to_string(),
                    ));
                }
                EthereumProof::redeem(u);
                u.in_app_wallet = context.in_app_wallet;
                Ok(())
            })
            .await?;

        tracing::info!(
            user_id = %user_id,
            address = %address,
            in_app_wallet = context.in_app_wallet,
            "Ethereum address confirmed"
        );
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> User {
        User::new("u1", "CODE0001", Utc::now())
    }

    #[test]
    fn test_replace_subject_resets_only_on_change() {
        let mut u = user();
        let now = Utc::now();
        assert!(EmailProof::set_subject(&mut u, "a@x.com".to_string()));
        EmailProof::issue(&mut u, "12345678".to_string(), now).unwrap();
        EmailProof::redeem(&mut u);
        assert!(u.email_confirmed);

        assert!(!EmailProof::set_subject(&mut u, "a@x.com".to_string()));
        assert!(u.email_confirmed);

        assert!(EmailProof::set_subject(&mut u, "b@x.com".to_string()));
        assert!(!u.email_confirmed);
        assert!(u.email_confirmation_key.is_none());
        assert!(u.email_confirmation_sent_at.is_none());
    }

    #[test]
    fn test_issue_requires_unconfirmed_subject() {
        let mut u = user();
        let now = Utc::now();
        assert!(matches!(
            EthereumProof::issue(&mut u, "c".to_string(), now),
            Err(AppError::InvalidState(_))
        ));

        let address: EthAddress = "0x52908400098527886e0f7030069857d2e4169ee7".parse().unwrap();
        EthereumProof::set_subject(&mut u, address);
        EthereumProof::issue(&mut u, "c".to_string(), now).unwrap();
        EthereumProof::redeem(&mut u);

        assert!(u.ethereum_confirmed);
        assert!(u.ethereum_challenge.is_none());
        assert!(matches!(
            EthereumProof::issue(&mut u, "again".to_string(), now),
            Err(AppError::InvalidState(_))
        ));
    }

    #[test]
    fn test_pending_expires_after_window() {
        let mut u = user();
        let issued = Utc::now();
        EmailProof::set_subject(&mut u, "a@x.com".to_string());
        EmailProof::issue(&mut u, "12345678".to_string(), issued).unwrap();

        let at_edge = issued + Duration::seconds(EMAIL_CONFIRMATION_WINDOW_SECS);
        assert!(EmailProof::pending(&mut u, at_edge).is_ok());

        let late = at_edge + Duration::seconds(1);
        assert!(matches!(
            EmailProof::pending(&mut u, late),
            Err(AppError::Expired(_))
        ));
    }

    #[test]
    fn test_pending_without_issue_is_invalid_state() {
        let mut u = user();
        EmailProof::set_subject(&mut u, "a@x.com".to_string());
        assert!(matches!(
            EmailProof::pending(&mut u, Utc::now()),
            Err(AppError::InvalidState(_))
        ));
    }

    #[test]
    fn test_parse_email() {
        assert_eq!(parse_email("  a@x.com ").unwrap(), "a@x.com");
        assert!(matches!(parse_email("not-an-email"), Err(AppError::InvalidInput(_))));
        assert!(matches!(parse_email(""), Err(AppError::InvalidInput(_))));
    }
}
