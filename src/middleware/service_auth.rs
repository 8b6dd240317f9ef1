// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Service-to-service authentication (internal API and Pub/Sub push).

use crate::error::AppError;
use crate::services::oidc::OidcError;
use crate::AppState;
use axum::{
    extract::{Request, State},
    http::{header, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

/// Require a Google-signed token from one of `INTERNAL_CALLERS`.
pub async fn require_internal_caller(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let (auth_header, path) = caller_credentials(&request);
    verify_service_caller(
        &state,
        auth_header.as_ref(),
        &path,
        &state.config.internal_callers,
    )
    .await?;
    Ok(next.run(request).await)
}

/// Require a Google-signed token from the Pub/Sub push service account.
pub async fn require_push_sender(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let (auth_header, path) = caller_credentials(&request);
    verify_service_caller(
        &state,
        auth_header.as_ref(),
        &path,
        std::slice::from_ref(&state.config.push_service_account),
    )
    .await?;
    Ok(next.run(request).await)
}

/// Owned copies of what verification needs, so the request is not held
/// across an await.
fn caller_credentials(request: &Request) -> (Option<HeaderValue>, String) {
    (
        request.headers().get(header::AUTHORIZATION).cloned(),
        request.uri().path().to_string(),
    )
}

async fn verify_service_caller(
    state: &AppState,
    auth_header: Option<&HeaderValue>,
    path: &str,
    allowed: &[String],
) -> Result<(), AppError> {
    let claims = state
        .service_verifier
        .verify(auth_header)
        .await
        .map_err(|err| match err {
            OidcError::Rejected(reason) => {
                tracing::warn!(path = %path, reason = %reason, "Blocked service request: invalid OIDC token");
                AppError::Forbidden("invalid service token".to_string())
            }
            OidcError::Transient(reason) => {
                tracing::error!(reason = %reason, "Service OIDC verification transient failure");
                AppError::Internal(anyhow::anyhow!("token verification unavailable: {reason}"))
            }
        })?;

    if claims.email_verified != Some(true) {
        tracing::warn!(subject = %claims.sub, "Blocked service request: email not verified");
        return Err(AppError::Forbidden("invalid service token".to_string()));
    }

    let email = claims.email.unwrap_or_default();
    if !allowed.iter().any(|a| a == &email) {
        tracing::warn!(email = %email, path = %path, "Blocked service request: caller not allowed");
        return Err(AppError::Forbidden("caller not allowed".to_string()));
    }

    tracing::debug!(email = %email, subject = %claims.sub, "Service caller verified");
    Ok(())
}
