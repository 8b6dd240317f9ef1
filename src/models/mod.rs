// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Data models for the application.

pub mod country;
pub mod ethereum;
pub mod referral;
pub mod user;

pub use country::is_valid_country_code;
pub use ethereum::{EthAddress, InvalidEthAddress};
pub use referral::{normalize_vin, Referral};
pub use user::User;
