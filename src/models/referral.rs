// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Completed referral records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const VIN_LENGTH: usize = 17;

/// A referral credited after the referred user registered a vehicle.
///
/// Keyed by VIN: one vehicle can only ever earn a single credit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Referral {
    /// Vehicle identification number (also used as document ID)
    pub vin: String,
    pub referrer_user_id: String,
    pub referred_user_id: String,
    pub created_at: DateTime<Utc>,
}

/// Normalize a VIN to upper case, rejecting anything that is not
/// 17 ASCII alphanumerics.
pub fn normalize_vin(raw: &str) -> Option<String> {
    let vin = raw.trim();
    if vin.len() != VIN_LENGTH || !vin.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(vin.to_ascii_uppercase())
}
