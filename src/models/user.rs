// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! User model for storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::EthAddress;

/// User profile stored in Firestore (document ID is `id`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Subject identifier asserted by the identity provider
    pub id: String,

    // ─── Email ───────────────────────────────────────────────────
    pub email_address: Option<String>,
    #[serde(default)]
    pub email_confirmed: bool,
    /// Pending 8-digit confirmation key
    pub email_confirmation_key: Option<String>,
    pub email_confirmation_sent_at: Option<DateTime<Utc>>,

    // ─── Ethereum ────────────────────────────────────────────────
    pub ethereum_address: Option<EthAddress>,
    #[serde(default)]
    pub ethereum_confirmed: bool,
    /// Pending challenge message awaiting a signature
    pub ethereum_challenge: Option<String>,
    pub ethereum_challenge_sent_at: Option<DateTime<Utc>>,
    /// Custodial wallet managed on the user's behalf
    #[serde(default)]
    pub in_app_wallet: bool,

    /// ISO 3166-1 alpha-3
    pub country_code: Option<String>,

    // ─── Referrals ───────────────────────────────────────────────
    /// This user's own shareable code. Only missing on legacy records.
    pub referral_code: Option<String>,
    /// User whose code was presented at signup (lookup only, never owned)
    pub referrer_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub agreed_tos_at: Option<DateTime<Utc>>,
}

impl User {
    /// A fresh record with nothing but an id, a referral code and a creation time.
    pub fn new(id: impl Into<String>, referral_code: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            email_address: None,
            email_confirmed: false,
            email_confirmation_key: None,
            email_confirmation_sent_at: None,
            ethereum_address: None,
            ethereum_confirmed: false,
            ethereum_challenge: None,
            ethereum_challenge_sent_at: None,
            in_app_wallet: false,
            country_code: None,
            referral_code: Some(referral_code.into()),
            referrer_id: None,
            created_at: now,
            agreed_tos_at: None,
        }
    }

    /// Both the email address and the Ethereum address are proven.
    pub fn is_fully_confirmed(&self) -> bool {
        self.email_confirmed
            && self.email_address.is_some()
            && self.ethereum_confirmed
            && self.ethereum_address.is_some()
    }

    /// Ethereum address, only if ownership has been proven.
    pub fn confirmed_ethereum_address(&self) -> Option<EthAddress> {
        self.ethereum_address.filter(|_| self.ethereum_confirmed)
    }
}
