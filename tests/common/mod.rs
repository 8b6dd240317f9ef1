// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, DecodingKey, EncodingKey, Header};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tower::ServiceExt;
use users_api::config::Config;
use users_api::db::{FirestoreDb, MemoryStore};
use users_api::routes::create_router;
use users_api::services::{
    EventEmitter, KnownSignatures, OidcVerifier, ProfileService, RecordingMailer, RecordingSink,
    StaticBalances,
};
use users_api::time_utils::ManualClock;
use users_api::AppState;

pub const TEST_SECRET: &[u8] = b"integration-test-signing-secret";
pub const USER_KID: &str = "test-user-key";
pub const SERVICE_KID: &str = "test-service-key";
pub const GOOGLE_ISSUER: &str = "https://accounts.google.com";

/// Check if emulator is available via environment variable.
#[allow(dead_code)]
pub fn emulator_available() -> bool {
    std::env::var("FIRESTORE_EMULATOR_HOST").is_ok()
}

/// Skip test with message if emulator not available.
#[macro_export]
macro_rules! require_emulator {
    () => {
        if !crate::common::emulator_available() {
            eprintln!("⚠️  Skipping: FIRESTORE_EMULATOR_HOST not set");
            return;
        }
    };
}

/// Create a test database connection.
#[allow(dead_code)]
pub async fn test_db() -> FirestoreDb {
    FirestoreDb::new("test-project")
        .await
        .expect("Failed to connect to Firestore emulator")
}

/// Fixed start time for the manual clock.
#[allow(dead_code)]
pub fn start_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_704_103_200, 0).unwrap()
}

/// Everything a test may want to poke at behind the router.
#[allow(dead_code)]
pub struct TestApp {
    pub router: axum::Router,
    pub state: Arc<AppState>,
    pub store: Arc<MemoryStore>,
    pub mailer: Arc<RecordingMailer>,
    pub sink: Arc<RecordingSink>,
    pub signatures: Arc<KnownSignatures>,
    pub clock: Arc<ManualClock>,
}

/// Create a test app with offline dependencies and no token holders.
///
/// Must be called inside a Tokio runtime.
#[allow(dead_code)]
pub fn create_test_app() -> TestApp {
    create_test_app_with_balances(StaticBalances::default())
}

#[allow(dead_code)]
pub fn create_test_app_with_balances(balances: StaticBalances) -> TestApp {
    let config = Config::test_default();
    let store = Arc::new(MemoryStore::new());
    let mailer = Arc::new(RecordingMailer::new());
    let sink = Arc::new(RecordingSink::new());
    let signatures = Arc::new(KnownSignatures::new());
    let clock = Arc::new(ManualClock::new(start_time()));

    // The publisher runs until the test runtime shuts down.
    let (events, _publisher) = EventEmitter::spawn(sink.clone(), config.events_source.clone());
    let profiles = ProfileService::new(
        store.clone(),
        mailer.clone(),
        signatures.clone(),
        Arc::new(balances),
        events,
        clock.clone(),
        &config.app_name,
    );

    let user_verifier = OidcVerifier::with_static_key(
        &config.identity_issuer_url,
        &config.identity_audience,
        USER_KID,
        Algorithm::HS256,
        DecodingKey::from_secret(TEST_SECRET),
    )
    .unwrap();
    let service_verifier = OidcVerifier::with_static_key(
        GOOGLE_ISSUER,
        &config.api_url,
        SERVICE_KID,
        Algorithm::HS256,
        DecodingKey::from_secret(TEST_SECRET),
    )
    .unwrap();

    let state = Arc::new(AppState {
        config,
        profiles,
        user_verifier,
        service_verifier,
    });

    TestApp {
        router: create_router(state.clone()),
        state,
        store,
        mailer,
        sink,
        signatures,
        clock,
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

fn sign(kid: &str, claims: &Value) -> String {
    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some(kid.to_string());
    encode(&header, claims, &EncodingKey::from_secret(TEST_SECRET)).unwrap()
}

/// Identity provider token for `sub`. `extra` claims are merged in.
#[allow(dead_code)]
pub fn user_token(sub: &str, extra: Value) -> String {
    let config = Config::test_default();
    let now = now_secs();
    let mut claims = json!({
        "iss": config.identity_issuer_url,
        "aud": config.identity_audience,
        "sub": sub,
        "iat": now,
        "exp": now + 3600,
    });
    if let (Some(base), Value::Object(extra)) = (claims.as_object_mut(), extra) {
        base.extend(extra);
    }
    sign(USER_KID, &claims)
}

/// Google-style service account token.
#[allow(dead_code)]
pub fn service_token(email: &str) -> String {
    let config = Config::test_default();
    let now = now_secs();
    sign(
        SERVICE_KID,
        &json!({
            "iss": GOOGLE_ISSUER,
            "aud": config.api_url,
            "sub": "1234567890",
            "email": email,
            "email_verified": true,
            "iat": now,
            "exp": now + 3600,
        }),
    )
}

/// Build a request with an optional bearer token and JSON body.
#[allow(dead_code)]
pub fn request(method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("Authorization", format!("Bearer {token}"));
    }
    match body {
        Some(body) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

/// Send a request and decode the JSON body (`Value::Null` when empty).
#[allow(dead_code)]
pub async fn send(router: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, body)
}
