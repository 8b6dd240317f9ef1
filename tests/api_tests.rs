// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! User API over HTTP: authentication, profile CRUD and the confirmation
//! flows, end to end through the router.

use axum::http::StatusCode;
use serde_json::json;
use users_api::db::IdentityStore;
use users_api::models::EthAddress;

mod common;

use common::{request, send, user_token};

const ADDRESS: &str = "0x52908400098527886e0f7030069857d2e4169ee7";

#[tokio::test]
async fn test_health_is_public() {
    let app = common::create_test_app();
    let (status, body) = send(&app.router, request("GET", "/health", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_missing_token_is_401_with_error_message() {
    let app = common::create_test_app();
    let (status, body) = send(&app.router, request("GET", "/v1/user", None, None)).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["errorMessage"].is_string());
    assert_eq!(app.store.user_count(), 0);
}

#[tokio::test]
async fn test_invalid_tokens_are_rejected() {
    let app = common::create_test_app();

    let garbage = request("GET", "/v1/user", Some("not-a-jwt"), None);
    assert_eq!(send(&app.router, garbage).await.0, StatusCode::UNAUTHORIZED);

    // Service tokens are signed for a different issuer and audience.
    let wrong_issuer = common::service_token("vehicles-api@test-project.iam.gserviceaccount.com");
    let req = request("GET", "/v1/user", Some(&wrong_issuer), None);
    assert_eq!(send(&app.router, req).await.0, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_get_user_creates_profile_from_claims() {
    let app = common::create_test_app();
    let token = user_token(
        "sub-1",
        json!({
            "email": "a@x.com",
            "email_verified": true,
            "ethereum_address": ADDRESS,
            "provider_id": "in-app-wallet",
        }),
    );

    let (status, body) = send(&app.router, request("GET", "/v1/user", Some(&token), None)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "sub-1");
    assert_eq!(body["emailAddress"], "a@x.com");
    assert_eq!(body["emailConfirmed"], true);
    assert_eq!(body["ethereumAddress"], ADDRESS);
    assert_eq!(body["ethereumConfirmed"], true);
    assert_eq!(body["inAppWallet"], true);
    assert_eq!(body["referred"], false);
    assert_eq!(body["createdAt"], "2024-01-01T10:00:00Z");
    assert!(body["referralCode"].is_string());
    // Internal fields stay internal.
    assert!(body.get("emailConfirmationKey").is_none());
    assert!(body.get("referrerId").is_none());

    // Second call returns the same record.
    let (_, again) = send(&app.router, request("GET", "/v1/user", Some(&token), None)).await;
    assert_eq!(again["referralCode"], body["referralCode"]);
    assert_eq!(app.store.user_count(), 1);
}

#[tokio::test]
async fn test_unverified_email_claim_is_not_trusted() {
    let app = common::create_test_app();
    let token = user_token("sub-1", json!({ "email": "a@x.com", "email_verified": false }));

    let (status, body) = send(&app.router, request("GET", "/v1/user", Some(&token), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["emailAddress"].is_null());
    assert_eq!(body["emailConfirmed"], false);
}

#[tokio::test]
async fn test_get_user_with_referral_code() {
    let app = common::create_test_app();
    let referrer = user_token("referrer", json!({}));
    let (_, body) = send(&app.router, request("GET", "/v1/user", Some(&referrer), None)).await;
    let code = body["referralCode"].as_str().unwrap().to_string();

    let token = user_token("sub-1", json!({}));
    let uri = format!("/v1/user?referralCode={code}");
    let (status, body) = send(&app.router, request("GET", &uri, Some(&token), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["referred"], true);

    // Unknown codes do not block signup.
    let token = user_token("sub-2", json!({}));
    let req = request("GET", "/v1/user?referralCode=NOSUCHCD", Some(&token), None);
    let (status, body) = send(&app.router, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["referred"], false);
}

#[tokio::test]
async fn test_update_user() {
    let app = common::create_test_app();
    let token = user_token("sub-1", json!({}));

    let req = request(
        "PUT",
        "/v1/user",
        Some(&token),
        Some(json!({ "emailAddress": "a@x.com", "countryCode": "usa" })),
    );
    let (status, body) = send(&app.router, req).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["emailAddress"], "a@x.com");
    assert_eq!(body["emailConfirmed"], false);
    assert_eq!(body["countryCode"], "USA");
}

#[tokio::test]
async fn test_update_user_validation_errors_are_400() {
    let app = common::create_test_app();
    let token = user_token("sub-1", json!({}));

    let cases = [
        json!({ "countryCode": "ZZZ" }),
        json!({ "emailAddress": "nope" }),
        json!({ "ethereumAddress": "0x1234" }),
        json!({ "countryCode": 840 }),
    ];
    for body in cases {
        let req = request("PUT", "/v1/user", Some(&token), Some(body.clone()));
        let (status, response) = send(&app.router, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "body: {body}");
        assert!(response["errorMessage"].is_string(), "body: {body}");
    }
}

#[tokio::test]
async fn test_delete_user() {
    let app = common::create_test_app();
    let token = user_token("sub-1", json!({}));
    send(&app.router, request("GET", "/v1/user", Some(&token), None)).await;

    let (status, _) = send(&app.router, request("DELETE", "/v1/user", Some(&token), None)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(app.store.get_user("sub-1").await.unwrap().is_none());

    let (status, body) = send(&app.router, request("DELETE", "/v1/user", Some(&token), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["errorMessage"].is_string());
}

#[tokio::test]
async fn test_email_confirmation_over_http() {
    let app = common::create_test_app();
    let token = user_token("sub-1", json!({}));
    let req = request(
        "PUT",
        "/v1/user",
        Some(&token),
        Some(json!({ "emailAddress": "a@x.com" })),
    );
    send(&app.router, req).await;

    let req = request("POST", "/v1/user/send-confirmation-email", Some(&token), None);
    let (status, _) = send(&app.router, req).await;
    assert_eq!(status, StatusCode::OK);

    let key = app.mailer.last_key_for("a@x.com").unwrap();
    let req = request(
        "POST",
        "/v1/user/confirm-email",
        Some(&token),
        Some(json!({ "key": "not-it" })),
    );
    let (status, body) = send(&app.router, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["errorMessage"].is_string());

    let req = request(
        "POST",
        "/v1/user/confirm-email",
        Some(&token),
        Some(json!({ "key": key })),
    );
    let (status, body) = send(&app.router, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["emailConfirmed"], true);
}

#[tokio::test]
async fn test_ethereum_challenge_over_http() {
    let app = common::create_test_app();
    let token = user_token("sub-1", json!({}));
    let req = request(
        "PUT",
        "/v1/user",
        Some(&token),
        Some(json!({ "ethereumAddress": ADDRESS })),
    );
    send(&app.router, req).await;

    let req = request("POST", "/v1/user/generate-ethereum-challenge", Some(&token), None);
    let (status, body) = send(&app.router, req).await;
    assert_eq!(status, StatusCode::OK);
    let challenge = body["challenge"].as_str().unwrap().to_string();

    let address: EthAddress = ADDRESS.parse().unwrap();
    let signature = app.signatures.sign(&challenge, address);
    let req = request(
        "POST",
        "/v1/user/submit-ethereum-challenge",
        Some(&token),
        Some(json!({ "signature": signature })),
    );
    let (status, body) = send(&app.router, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ethereumConfirmed"], true);
    assert_eq!(body["inAppWallet"], false);
}

#[tokio::test]
async fn test_agree_tos_and_referral_code_over_http() {
    let app = common::create_test_app();
    let referrer = user_token("referrer", json!({}));
    let (_, body) = send(&app.router, request("GET", "/v1/user", Some(&referrer), None)).await;
    let code = body["referralCode"].as_str().unwrap().to_string();

    let token = user_token("sub-1", json!({}));
    let (status, body) = send(&app.router, request("POST", "/v1/user/agree-tos", Some(&token), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["agreedTosAt"], "2024-01-01T10:00:00Z");

    let req = request(
        "POST",
        "/v1/user/submit-referral-code",
        Some(&token),
        Some(json!({ "referralCode": code })),
    );
    let (status, body) = send(&app.router, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["referred"], true);

    // Already referred.
    let req = request(
        "POST",
        "/v1/user/submit-referral-code",
        Some(&token),
        Some(json!({ "referralCode": code })),
    );
    assert_eq!(send(&app.router, req).await.0, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_malformed_json_body_is_400() {
    let app = common::create_test_app();
    let token = user_token("sub-1", json!({}));
    let req = axum::http::Request::builder()
        .method("POST")
        .uri("/v1/user/confirm-email")
        .header("Authorization", format!("Bearer {token}"))
        .header("Content-Type", "application/json")
        .body(axum::body::Body::from("{not json"))
        .unwrap();

    let (status, body) = send(&app.router, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["errorMessage"].is_string());
}

#[tokio::test]
async fn test_store_failure_is_500_without_details() {
    let app = common::create_test_app();
    let token = user_token("sub-1", json!({}));
    send(&app.router, request("GET", "/v1/user", Some(&token), None)).await;
    app.store.set_failing_user_ids(["sub-1".to_string()]);

    let (status, body) = send(&app.router, request("POST", "/v1/user/agree-tos", Some(&token), None)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["errorMessage"], "Internal server error");
}

#[tokio::test]
async fn test_security_headers_present() {
    let app = common::create_test_app();
    let token = user_token("sub-1", json!({}));
    let response = tower::ServiceExt::oneshot(
        app.router.clone(),
        request("GET", "/v1/user", Some(&token), None),
    )
    .await
    .unwrap();

    let headers = response.headers();
    assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
    assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
    assert_eq!(headers.get("cache-control").unwrap(), "no-store");
    assert!(headers.contains_key("strict-transport-security"));
}
