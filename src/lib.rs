// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Users API: account records, email and wallet ownership proofs, and the
//! referral program.
//!
//! This crate provides the backend for user profiles: lazy creation from
//! identity provider tokens, confirmation flows, referral tracking, and the
//! lifecycle events other services consume.

pub mod codes;
pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod time_utils;

use config::Config;
use services::{OidcVerifier, ProfileService};

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub profiles: ProfileService,
    /// Verifies end-user tokens from the identity provider
    pub user_verifier: OidcVerifier,
    /// Verifies Google-signed service account tokens
    pub service_verifier: OidcVerifier,
}
