// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Read-only lookups for other services.
//!
//! Protected by `require_internal_caller`. A missing user is a 404, a
//! store failure a 500, so callers can tell them apart.

use crate::error::Result;
use crate::services::{EmailUsage, UserRecord};
use crate::time_utils::format_utc_rfc3339;
use crate::AppState;
use axum::{
    extract::{rejection::PathRejection, rejection::QueryRejection, Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/internal/v1/users/{id}", get(get_user))
        .route(
            "/internal/v1/users/by-eth-address/{address}",
            get(get_user_by_eth_address),
        )
        .route("/internal/v1/email-usage", get(get_email_usage))
}

/// Projection of a user for other services.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecordResponse {
    pub id: String,
    pub email_address: Option<String>,
    pub email_confirmed: bool,
    pub ethereum_address: Option<String>,
    pub ethereum_confirmed: bool,
    pub in_app_wallet: bool,
    pub country_code: Option<String>,
    pub referral_code: Option<String>,
    pub referrer_id: Option<String>,
    /// Proven wallet of the referrer, if any
    pub referrer_ethereum_address: Option<String>,
    pub created_at: String,
    pub agreed_tos_at: Option<String>,
}

impl From<UserRecord> for UserRecordResponse {
    fn from(record: UserRecord) -> Self {
        let user = record.user;
        Self {
            id: user.id,
            email_address: user.email_address,
            email_confirmed: user.email_confirmed,
            ethereum_address: user.ethereum_address.map(|a| a.to_string()),
            ethereum_confirmed: user.ethereum_confirmed,
            in_app_wallet: user.in_app_wallet,
            country_code: user.country_code,
            referral_code: user.referral_code,
            referrer_id: user.referrer_id,
            referrer_ethereum_address: record.referrer_ethereum_address.map(|a| a.to_string()),
            created_at: format_utc_rfc3339(user.created_at),
            agreed_tos_at: user.agreed_tos_at.map(format_utc_rfc3339),
        }
    }
}

async fn get_user(
    State(state): State<Arc<AppState>>,
    id: std::result::Result<Path<String>, PathRejection>,
) -> Result<Json<UserRecordResponse>> {
    let Path(id) = id?;
    let record = state.profiles.get_user_record(&id).await?;
    Ok(Json(record.into()))
}

async fn get_user_by_eth_address(
    State(state): State<Arc<AppState>>,
    address: std::result::Result<Path<String>, PathRejection>,
) -> Result<Json<UserRecordResponse>> {
    let Path(address) = address?;
    let record = state.profiles.get_user_by_eth_address(&address).await?;
    Ok(Json(record.into()))
}

#[derive(Debug, Deserialize)]
struct EmailUsageQuery {
    email: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletCountsResponse {
    pub in_app: u32,
    pub external: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailUsageResponse {
    pub in_use: bool,
    pub wallet_counts: WalletCountsResponse,
}

impl From<EmailUsage> for EmailUsageResponse {
    fn from(usage: EmailUsage) -> Self {
        Self {
            in_use: usage.in_use,
            wallet_counts: WalletCountsResponse {
                in_app: usage.wallet_counts.in_app,
                external: usage.wallet_counts.external,
            },
        }
    }
}

async fn get_email_usage(
    State(state): State<Arc<AppState>>,
    query: std::result::Result<Query<EmailUsageQuery>, QueryRejection>,
) -> Result<Json<EmailUsageResponse>> {
    let Query(query) = query?;
    let usage = state.profiles.check_email_in_use(&query.email).await?;
    Ok(Json(usage.into()))
}
