// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application configuration loaded from environment variables.
//!
//! Cloud Run injects secrets (mail API key) as environment variables via
//! secret bindings, so everything is read from the environment at startup.

use crate::models::EthAddress;
use std::env;
use std::time::Duration;

/// Application configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server port
    pub port: u16,
    /// GCP project ID (Firestore, Pub/Sub)
    pub gcp_project_id: String,
    /// Public URL of this API; audience of service-to-service tokens
    pub api_url: String,
    /// Frontend origin allowed by CORS
    pub frontend_url: String,
    /// Name shown in emails and wallet challenges
    pub app_name: String,
    /// Per-request deadline
    pub request_timeout: Duration,
    /// How long shutdown waits for queued events to publish
    pub event_drain_timeout: Duration,

    // --- Identity provider ---
    pub identity_issuer_url: String,
    pub identity_audience: String,

    // --- Events ---
    /// Pub/Sub topic for user lifecycle events
    pub events_topic: String,
    /// CloudEvents `source` attribute
    pub events_source: String,
    /// Service account that Pub/Sub push deliveries are signed by
    pub push_service_account: String,
    /// Service accounts allowed to call `/internal/*`
    pub internal_callers: Vec<String>,

    // --- Email ---
    pub email_api_url: String,
    /// Mail API key (secret)
    pub email_api_key: String,
    pub email_from: String,

    // --- Ethereum ---
    pub ethereum_rpc_url: String,
    /// Token contracts whose holders are counted by the email-usage lookup
    pub token_contracts: Vec<EthAddress>,
}

impl Config {
    /// Default config for testing only.
    pub fn test_default() -> Self {
        Self {
            port: 8080,
            gcp_project_id: "test-project".to_string(),
            api_url: "http://localhost:8080".to_string(),
            frontend_url: "http://localhost:5173".to_string(),
            app_name: "Users".to_string(),
            request_timeout: Duration::from_secs(30),
            event_drain_timeout: Duration::from_secs(5),
            identity_issuer_url: "https://identity.test".to_string(),
            identity_audience: "users-api-test".to_string(),
            events_topic: "user-events".to_string(),
            events_source: "users-api".to_string(),
            push_service_account: "pubsub-push@test-project.iam.gserviceaccount.com"
                .to_string(),
            internal_callers: vec!["vehicles-api@test-project.iam.gserviceaccount.com".to_string()],
            email_api_url: "http://localhost:9999/send".to_string(),
            email_api_key: "test_mail_key".to_string(),
            email_from: "no-reply@example.com".to_string(),
            ethereum_rpc_url: "http://localhost:8545".to_string(),
            token_contracts: Vec::new(),
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let gcp_project_id = env::var("GCP_PROJECT_ID").unwrap_or_else(|_| "local-dev".to_string());
        let push_service_account = env::var("PUSH_SERVICE_ACCOUNT").unwrap_or_else(|_| {
            format!("pubsub-push@{gcp_project_id}.iam.gserviceaccount.com")
        });

        Ok(Self {
            port: parse_or("PORT", 8080)?,
            api_url: required("API_URL")?,
            frontend_url: env::var("FRONTEND_URL")
                .unwrap_or_else(|_| "http://localhost:5173".to_string()),
            app_name: env::var("APP_NAME").unwrap_or_else(|_| "Users".to_string()),
            request_timeout: Duration::from_secs(parse_or("REQUEST_TIMEOUT_SECS", 30)?),
            event_drain_timeout: Duration::from_secs(parse_or("EVENT_DRAIN_TIMEOUT_SECS", 10)?),
            identity_issuer_url: required("IDENTITY_ISSUER_URL")?,
            identity_audience: required("IDENTITY_AUDIENCE")?,
            events_topic: env::var("EVENTS_TOPIC").unwrap_or_else(|_| "user-events".to_string()),
            events_source: env::var("EVENTS_SOURCE").unwrap_or_else(|_| "users-api".to_string()),
            push_service_account,
            internal_callers: list("INTERNAL_CALLERS"),
            email_api_url: required("EMAIL_API_URL")?,
            email_api_key: required("EMAIL_API_KEY")?.trim().to_string(),
            email_from: required("EMAIL_FROM")?,
            ethereum_rpc_url: required("ETHEREUM_RPC_URL")?,
            token_contracts: list("TOKEN_CONTRACTS")
                .iter()
                .map(|raw| {
                    raw.parse::<EthAddress>()
                        .map_err(|_| ConfigError::Invalid("TOKEN_CONTRACTS", raw.clone()))
                })
                .collect::<Result<_, _>>()?,
            gcp_project_id,
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(name))
}

fn parse_or<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(name, raw)),
        Err(_) => Ok(default),
    }
}

/// Comma-separated list; empty entries are skipped.
fn list(name: &str) -> Vec<String> {
    env::var(name)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {0}: {1:?}")]
    Invalid(&'static str, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_env() {
        env::set_var("API_URL", "https://users.example.com");
        env::set_var("IDENTITY_ISSUER_URL", "https://identity.example.com");
        env::set_var("IDENTITY_AUDIENCE", "users");
        env::set_var("EMAIL_API_URL", "https://mail.example.com/send");
        env::set_var("EMAIL_API_KEY", " key \n");
        env::set_var("EMAIL_FROM", "no-reply@example.com");
        env::set_var("ETHEREUM_RPC_URL", "https://rpc.example.com");
        env::set_var("INTERNAL_CALLERS", "a@p.iam.gserviceaccount.com, ,b@p.iam.gserviceaccount.com");
        env::set_var(
            "TOKEN_CONTRACTS",
            "0x52908400098527886E0F7030069857D2E4169EE7,0xde709f2102306220921060314715629080e2fb77",
        );

        let config = Config::from_env().expect("Config should load");

        assert_eq!(config.email_api_key, "key");
        assert_eq!(config.internal_callers.len(), 2);
        assert_eq!(config.token_contracts.len(), 2);
        assert_eq!(
            config.token_contracts[0].to_string(),
            "0x52908400098527886e0f7030069857d2e4169ee7"
        );
    }
}
