// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! OpenID Connect ID token verification.
//!
//! Used twice: for end-user tokens from the identity provider, and for
//! Google-signed service-account tokens on internal and push endpoints.
//! Signing keys are discovered through the issuer's
//! `.well-known/openid-configuration` and cached per `Cache-Control`.

use anyhow::Context;
use axum::http::HeaderValue;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use reqwest::header::CACHE_CONTROL;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, RwLock};

const GOOGLE_ISSUERS: [&str; 2] = ["https://accounts.google.com", "accounts.google.com"];
const GOOGLE_DISCOVERY_URL: &str = "https://accounts.google.com/.well-known/openid-configuration";
const GOOGLE_JWKS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);
const CLOCK_SKEW_SECS: u64 = 60;

/// Claims of a verified ID token.
#[derive(Debug, Clone, Deserialize)]
pub struct IdTokenClaims {
    pub iss: String,
    pub sub: String,
    pub exp: usize,
    pub iat: Option<usize>,
    pub email: Option<String>,
    pub email_verified: Option<bool>,
    /// Wallet address asserted by the identity provider
    pub ethereum_address: Option<String>,
    /// Login method (e.g. `google`, `in-app-wallet`)
    pub provider_id: Option<String>,
}

/// Verification failures.
#[derive(Debug, Clone)]
pub enum OidcError {
    /// Missing, malformed or untrusted token.
    Rejected(String),
    /// Key discovery failed; the token may be fine.
    Transient(String),
}

enum KeySource {
    Discovery {
        discovery_url: String,
        fallback_jwks_url: Option<String>,
    },
    Static {
        kid: String,
        algorithm: Algorithm,
        decoding_key: Arc<DecodingKey>,
    },
}

struct CachedJwksUri {
    uri: String,
    expires_at: Instant,
}

struct CachedKeys {
    by_kid: HashMap<String, Arc<DecodingKey>>,
    expires_at: Instant,
}

/// Verifies bearer tokens for one issuer and audience.
pub struct OidcVerifier {
    http_client: reqwest::Client,
    issuers: Vec<String>,
    audience: String,
    source: KeySource,
    jwks_uri: RwLock<Option<CachedJwksUri>>,
    keys: RwLock<Option<CachedKeys>>,
    refresh_lock: Mutex<()>,
}

impl OidcVerifier {
    fn build(issuers: Vec<String>, audience: &str, source: KeySource) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed building OIDC HTTP client")?;

        Ok(Self {
            http_client,
            issuers,
            audience: canonicalize_url(audience),
            source,
            jwks_uri: RwLock::new(None),
            keys: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        })
    }

    /// Verifier for tokens minted by `issuer`, discovered at
    /// `{issuer}/.well-known/openid-configuration`.
    pub fn for_issuer(issuer: &str, audience: &str) -> anyhow::Result<Self> {
        let issuer = canonicalize_url(issuer);
        let discovery_url = format!("{issuer}/.well-known/openid-configuration");

        tracing::info!(issuer = %issuer, audience = %audience, "Initialized OIDC verifier");
        Self::build(
            vec![issuer],
            audience,
            KeySource::Discovery {
                discovery_url,
                fallback_jwks_url: None,
            },
        )
    }

    /// Verifier for Google-signed service account tokens.
    pub fn google(audience: &str) -> anyhow::Result<Self> {
        tracing::info!(audience = %audience, "Initialized Google service token verifier");
        Self::build(
            GOOGLE_ISSUERS.iter().map(|s| s.to_string()).collect(),
            audience,
            KeySource::Discovery {
                discovery_url: GOOGLE_DISCOVERY_URL.to_string(),
                fallback_jwks_url: Some(GOOGLE_JWKS_URL.to_string()),
            },
        )
    }

    /// Verifier with a single fixed key, for deterministic tests.
    pub fn with_static_key(
        issuer: &str,
        audience: &str,
        kid: impl Into<String>,
        algorithm: Algorithm,
        decoding_key: DecodingKey,
    ) -> anyhow::Result<Self> {
        let kid = kid.into();
        if kid.trim().is_empty() {
            anyhow::bail!("static OIDC kid must not be empty");
        }

        Self::build(
            vec![canonicalize_url(issuer)],
            audience,
            KeySource::Static {
                kid,
                algorithm,
                decoding_key: Arc::new(decoding_key),
            },
        )
    }

    /// Verify the bearer token in an `Authorization` header.
    pub async fn verify(&self, auth_header: Option<&HeaderValue>) -> Result<IdTokenClaims, OidcError> {
        let token = extract_bearer_token(auth_header)?;

        let header = decode_header(token)
            .map_err(|e| OidcError::Rejected(format!("invalid JWT header: {e}")))?;

        let expected_alg = match &self.source {
            KeySource::Static { algorithm, .. } => *algorithm,
            KeySource::Discovery { .. } => Algorithm::RS256,
        };
        if header.alg != expected_alg {
            return Err(OidcError::Rejected(format!(
                "unexpected JWT alg: {:?}",
                header.alg
            )));
        }

        let kid = header
            .kid
            .ok_or_else(|| OidcError::Rejected("missing JWT kid".to_string()))?;
        let decoding_key = self.key_for(&kid).await?;

        let mut validation = Validation::new(expected_alg);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.set_issuer(self.issuers.as_slice());
        validation.set_audience(&[self.audience.as_str()]);
        validation.validate_nbf = true;
        validation.leeway = CLOCK_SKEW_SECS;

        let claims = decode::<IdTokenClaims>(token, decoding_key.as_ref(), &validation)
            .map_err(|e| OidcError::Rejected(format!("JWT validation failed: {e}")))?
            .claims;

        validate_iat(claims.iat)?;

        tracing::debug!(
            subject = %claims.sub,
            issuer = %claims.iss,
            email_verified = ?claims.email_verified,
            provider_id = claims.provider_id.as_deref().unwrap_or("<none>"),
            "ID token verified"
        );
        Ok(claims)
    }

    async fn key_for(&self, kid: &str) -> Result<Arc<DecodingKey>, OidcError> {
        if let KeySource::Static {
            kid: static_kid,
            decoding_key,
            ..
        } = &self.source
        {
            return if kid == static_kid {
                Ok(decoding_key.clone())
            } else {
                Err(OidcError::Rejected(format!("unknown JWT kid: {kid}")))
            };
        }

        if let Some(key) = self.cached_key(kid).await {
            return Ok(key);
        }

        // A missing kid may mean the issuer rotated keys; refetch once.
        for force in [false, true] {
            self.refresh_keys(force).await?;
            if let Some(key) = self.cached_key(kid).await {
                return Ok(key);
            }
        }

        Err(OidcError::Rejected(format!(
            "JWT kid not found in JWKS after refresh: {kid}"
        )))
    }

    async fn cached_key(&self, kid: &str) -> Option<Arc<DecodingKey>> {
        let now = Instant::now();
        self.keys
            .read()
            .await
            .as_ref()
            .filter(|cached| cached.expires_at > now)
            .and_then(|cached| cached.by_kid.get(kid))
            .cloned()
    }

    async fn refresh_keys(&self, force: bool) -> Result<(), OidcError> {
        let _guard = self.refresh_lock.lock().await;

        if !force
            && self
                .keys
                .read()
                .await
                .as_ref()
                .is_some_and(|cached| cached.expires_at > Instant::now())
        {
            return Ok(());
        }

        let jwks_uri = self.resolve_jwks_uri(force).await.inspect_err(|e| {
            tracing::error!(error = ?e, "Failed to resolve JWKS URI");
        })?;

        tracing::debug!(jwks_uri = %jwks_uri, "Refreshing JWKS cache");

        let response = self
            .http_client
            .get(&jwks_uri)
            .send()
            .await
            .map_err(|e| OidcError::Transient(format!("JWKS request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(OidcError::Transient(format!(
                "JWKS request returned status {}",
                response.status()
            )));
        }

        let ttl = cache_ttl(response.headers());
        let jwks: Jwks = response
            .json()
            .await
            .map_err(|e| OidcError::Transient(format!("invalid JWKS JSON: {e}")))?;

        let by_kid = usable_rsa_keys(jwks);
        if by_kid.is_empty() {
            return Err(OidcError::Transient(
                "JWKS response did not include any usable RSA keys".to_string(),
            ));
        }

        *self.keys.write().await = Some(CachedKeys {
            by_kid,
            expires_at: Instant::now() + ttl,
        });

        tracing::debug!(ttl_secs = ttl.as_secs(), "JWKS cache refreshed");
        Ok(())
    }

    async fn resolve_jwks_uri(&self, force: bool) -> Result<String, OidcError> {
        let KeySource::Discovery {
            discovery_url,
            fallback_jwks_url,
        } = &self.source
        else {
            return Err(OidcError::Transient(
                "static verifier has no JWKS URI".to_string(),
            ));
        };

        let previous = {
            let cached = self.jwks_uri.read().await;
            if let Some(entry) = cached.as_ref() {
                if !force && entry.expires_at > Instant::now() {
                    return Ok(entry.uri.clone());
                }
            }
            cached.as_ref().map(|entry| entry.uri.clone())
        };

        let failure = match self.http_client.get(discovery_url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let ttl = cache_ttl(resp.headers());
                let discovery: OpenIdConfiguration = resp
                    .json()
                    .await
                    .map_err(|e| OidcError::Transient(format!("invalid discovery JSON: {e}")))?;

                *self.jwks_uri.write().await = Some(CachedJwksUri {
                    uri: discovery.jwks_uri.clone(),
                    expires_at: Instant::now() + ttl,
                });
                return Ok(discovery.jwks_uri);
            }
            Ok(resp) => format!("status {}", resp.status()),
            Err(e) => e.to_string(),
        };

        match previous.or_else(|| fallback_jwks_url.clone()) {
            Some(uri) => {
                tracing::warn!(reason = %failure, jwks_uri = %uri, "OIDC discovery failed; using known JWKS URI");
                Ok(uri)
            }
            None => Err(OidcError::Transient(format!(
                "OIDC discovery failed: {failure}"
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenIdConfiguration {
    jwks_uri: String,
}

#[derive(Debug, Deserialize)]
struct Jwks {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kid: String,
    kty: String,
    alg: Option<String>,
    n: String,
    e: String,
    #[serde(rename = "use")]
    use_: Option<String>,
}

fn usable_rsa_keys(jwks: Jwks) -> HashMap<String, Arc<DecodingKey>> {
    jwks.keys
        .into_iter()
        .filter(|jwk| jwk.kty == "RSA" && !jwk.kid.trim().is_empty())
        .filter(|jwk| jwk.alg.as_deref().map_or(true, |alg| alg == "RS256"))
        .filter(|jwk| jwk.use_.as_deref().map_or(true, |u| u == "sig"))
        .filter_map(|jwk| match DecodingKey::from_rsa_components(&jwk.n, &jwk.e) {
            Ok(key) => Some((jwk.kid, Arc::new(key))),
            Err(e) => {
                tracing::warn!(error = %e, kid = %jwk.kid, "Skipping invalid RSA JWKS key");
                None
            }
        })
        .collect()
}

fn extract_bearer_token(auth_header: Option<&HeaderValue>) -> Result<&str, OidcError> {
    let value = auth_header
        .ok_or_else(|| OidcError::Rejected("missing Authorization header".to_string()))?
        .to_str()
        .map_err(|_| OidcError::Rejected("invalid Authorization header".to_string()))?;

    match value.strip_prefix("Bearer ") {
        Some(token) if !token.trim().is_empty() => Ok(token.trim()),
        Some(_) => Err(OidcError::Rejected("Bearer token is empty".to_string())),
        None => Err(OidcError::Rejected(
            "Authorization header must be Bearer token".to_string(),
        )),
    }
}

fn validate_iat(iat: Option<usize>) -> Result<(), OidcError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    match iat {
        None => Err(OidcError::Rejected("missing iat claim".to_string())),
        Some(iat) if iat as u64 > now + CLOCK_SKEW_SECS => Err(OidcError::Rejected(
            "iat claim is in the future".to_string(),
        )),
        Some(_) => Ok(()),
    }
}

fn cache_ttl(headers: &reqwest::header::HeaderMap) -> Duration {
    headers
        .get(CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .and_then(max_age)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_CACHE_TTL)
}

fn max_age(cache_control: &str) -> Option<u64> {
    cache_control
        .split(',')
        .filter_map(|directive| directive.trim().strip_prefix("max-age="))
        .find_map(|raw| raw.trim_matches('"').parse().ok())
}

fn canonicalize_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}
