// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! User profile API for authenticated users.

use crate::error::Result;
use crate::middleware::auth::AuthUser;
use crate::models::User;
use crate::services::ProfilePatch;
use crate::time_utils::format_utc_rfc3339;
use crate::AppState;
use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Query, State},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

/// User API routes (require authentication).
/// The auth middleware is applied in routes/mod.rs for these routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/v1/user",
            get(get_user).put(update_user).delete(delete_user),
        )
        .route("/v1/user/send-confirmation-email", post(send_confirmation_email))
        .route("/v1/user/confirm-email", post(confirm_email))
        .route(
            "/v1/user/generate-ethereum-challenge",
            post(generate_ethereum_challenge),
        )
        .route(
            "/v1/user/submit-ethereum-challenge",
            post(submit_ethereum_challenge),
        )
        .route("/v1/user/agree-tos", post(agree_tos))
        .route("/v1/user/submit-referral-code", post(submit_referral_code))
}

// ─── Profile ─────────────────────────────────────────────────

/// The caller's own profile.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct UserProfileResponse {
    pub id: String,
    pub email_address: Option<String>,
    pub email_confirmed: bool,
    pub ethereum_address: Option<String>,
    pub ethereum_confirmed: bool,
    pub in_app_wallet: bool,
    pub country_code: Option<String>,
    pub referral_code: Option<String>,
    pub referred: bool,
    pub created_at: String,
    pub agreed_tos_at: Option<String>,
}

impl From<User> for UserProfileResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email_address: user.email_address,
            email_confirmed: user.email_confirmed,
            ethereum_address: user.ethereum_address.map(|a| a.to_string()),
            ethereum_confirmed: user.ethereum_confirmed,
            in_app_wallet: user.in_app_wallet,
            country_code: user.country_code,
            referral_code: user.referral_code,
            referred: user.referrer_id.is_some(),
            created_at: format_utc_rfc3339(user.created_at),
            agreed_tos_at: user.agreed_tos_at.map(format_utc_rfc3339),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetUserQuery {
    /// Only used when this request creates the profile
    referral_code: Option<String>,
}

/// Make sure the caller has a record. Every user route may be a first touch.
async fn ensure_user(state: &AppState, auth: &AuthUser) -> Result<User> {
    state
        .profiles
        .get_or_create(&auth.user_id, &auth.claims.hints(), None)
        .await
}

/// Get the current profile, creating it on first sight.
async fn get_user(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    query: std::result::Result<Query<GetUserQuery>, QueryRejection>,
) -> Result<Json<UserProfileResponse>> {
    let Query(query) = query?;
    let user = state
        .profiles
        .get_or_create(
            &auth.user_id,
            &auth.claims.hints(),
            query.referral_code.as_deref(),
        )
        .await?;
    Ok(Json(user.into()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct UpdateUserRequest {
    pub email_address: Option<String>,
    pub country_code: Option<String>,
    pub ethereum_address: Option<String>,
}

async fn update_user(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    body: std::result::Result<Json<UpdateUserRequest>, JsonRejection>,
) -> Result<Json<UserProfileResponse>> {
    let Json(body) = body?;
    ensure_user(&state, &auth).await?;

    let patch = ProfilePatch {
        email_address: body.email_address,
        country_code: body.country_code,
        ethereum_address: body.ethereum_address,
    };
    let user = state.profiles.update_profile(&auth.user_id, &patch).await?;
    Ok(Json(user.into()))
}

async fn delete_user(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
) -> Result<StatusCode> {
    tracing::info!(user_id = %auth.user_id, "User-initiated account deletion");
    state.profiles.delete_profile(&auth.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn agree_tos(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
) -> Result<Json<UserProfileResponse>> {
    ensure_user(&state, &auth).await?;
    let user = state.profiles.agree_tos(&auth.user_id).await?;
    Ok(Json(user.into()))
}

// ─── Email confirmation ──────────────────────────────────────

async fn send_confirmation_email(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
) -> Result<Json<UserProfileResponse>> {
    ensure_user(&state, &auth).await?;
    let user = state
        .profiles
        .verification()
        .send_confirmation(&auth.user_id)
        .await?;
    Ok(Json(user.into()))
}

#[derive(Debug, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct ConfirmEmailRequest {
    pub key: String,
}

async fn confirm_email(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    body: std::result::Result<Json<ConfirmEmailRequest>, JsonRejection>,
) -> Result<Json<UserProfileResponse>> {
    let Json(body) = body?;
    ensure_user(&state, &auth).await?;
    let user = state
        .profiles
        .verification()
        .confirm_email(&auth.user_id, &body.key)
        .await?;
    Ok(Json(user.into()))
}

// ─── Ethereum ownership ──────────────────────────────────────

#[derive(Debug, Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct EthereumChallengeResponse {
    /// Message for the wallet to sign with `personal_sign`
    pub challenge: String,
}

async fn generate_ethereum_challenge(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
) -> Result<Json<EthereumChallengeResponse>> {
    ensure_user(&state, &auth).await?;
    let challenge = state
        .profiles
        .verification()
        .generate_challenge(&auth.user_id)
        .await?;
    Ok(Json(EthereumChallengeResponse { challenge }))
}

#[derive(Debug, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct SubmitEthereumChallengeRequest {
    pub signature: String,
}

async fn submit_ethereum_challenge(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    body: std::result::Result<Json<SubmitEthereumChallengeRequest>, JsonRejection>,
) -> Result<Json<UserProfileResponse>> {
    let Json(body) = body?;
    ensure_user(&state, &auth).await?;
    let user = state
        .profiles
        .verification()
        .submit_signature(&auth.user_id, &body.signature, auth.claims.wallet_context())
        .await?;
    Ok(Json(user.into()))
}

// ─── Referrals ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct SubmitReferralCodeRequest {
    pub referral_code: String,
}

async fn submit_referral_code(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    body: std::result::Result<Json<SubmitReferralCodeRequest>, JsonRejection>,
) -> Result<Json<UserProfileResponse>> {
    let Json(body) = body?;
    ensure_user(&state, &auth).await?;
    let user = state
        .profiles
        .referrals()
        .submit_referral_code(&auth.user_id, &body.referral_code)
        .await?;
    Ok(Json(user.into()))
}
