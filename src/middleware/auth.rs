// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Bearer token authentication for end users.

use crate::error::AppError;
use crate::models::EthAddress;
use crate::services::oidc::{IdTokenClaims, OidcError};
use crate::services::verification::parse_email;
use crate::services::{ProfileHints, WalletContext};
use crate::AppState;
use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

/// `provider_id` of custodial wallets.
pub const IN_APP_WALLET_PROVIDER: &str = "in-app-wallet";

/// Identity provider claims, typed once at the edge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentityClaims {
    pub email: Option<String>,
    pub email_verified: bool,
    pub ethereum_address: Option<EthAddress>,
    pub provider_id: Option<String>,
}

impl IdentityClaims {
    fn from_token(claims: &IdTokenClaims) -> Self {
        let ethereum_address = claims.ethereum_address.as_deref().and_then(|raw| {
            raw.parse::<EthAddress>()
                .inspect_err(|e| {
                    tracing::warn!(subject = %claims.sub, error = %e, "Ignoring malformed ethereum_address claim");
                })
                .ok()
        });

        Self {
            email: claims.email.clone(),
            email_verified: claims.email_verified.unwrap_or(false),
            ethereum_address,
            provider_id: claims.provider_id.clone(),
        }
    }

    pub fn is_in_app_wallet(&self) -> bool {
        self.provider_id.as_deref() == Some(IN_APP_WALLET_PROVIDER)
    }

    /// Facts safe to seed a new profile with.
    pub fn hints(&self) -> ProfileHints {
        let verified_email = self
            .email
            .as_deref()
            .filter(|_| self.email_verified)
            .and_then(|e| parse_email(e).ok());

        ProfileHints {
            verified_email,
            verified_ethereum_address: self.ethereum_address,
            in_app_wallet: self.is_in_app_wallet(),
            signup_method: self
                .provider_id
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
        }
    }

    pub fn wallet_context(&self) -> WalletContext {
        WalletContext {
            in_app_wallet: self.is_in_app_wallet(),
        }
    }
}

/// Authenticated caller.
#[derive(Debug, Clone)]
pub struct AuthUser {
    /// Subject id, the user's primary key
    pub user_id: String,
    pub claims: IdentityClaims,
}

/// Middleware that requires a valid identity provider token.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = state
        .user_verifier
        .verify(request.headers().get(header::AUTHORIZATION))
        .await
        .map_err(|err| match err {
            OidcError::Rejected(reason) => {
                tracing::debug!(reason = %reason, "Rejected user token");
                AppError::Unauthorized
            }
            OidcError::Transient(reason) => {
                AppError::Internal(anyhow::anyhow!("token verification unavailable: {reason}"))
            }
        })?;

    let auth_user = AuthUser {
        claims: IdentityClaims::from_token(&token),
        user_id: token.sub,
    };
    request.extensions_mut().insert(auth_user);

    Ok(next.run(request).await)
}
