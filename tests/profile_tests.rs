// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Profile service tests: lazy creation, updates, and lookups.

use std::collections::HashSet;
use std::time::Duration;
use users_api::db::IdentityStore;
use users_api::error::AppError;
use users_api::models::{EthAddress, User};
use users_api::services::events::USER_CREATED_EVENT;
use users_api::services::{ProfileHints, ProfilePatch, StaticBalances, WalletCounts};

mod common;

const ADDRESS_A: &str = "0x52908400098527886e0f7030069857d2e4169ee7";
const ADDRESS_B: &str = "0xde709f2102306220921060314715629080e2fb77";

fn addr(s: &str) -> EthAddress {
    s.parse().unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_get_or_create_yields_one_record() {
    let app = common::create_test_app();
    let hints = ProfileHints::default();

    // Every caller has seen "no record" before any of them writes.
    app.store.hold_creations(16);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let state = app.state.clone();
        let hints = hints.clone();
        handles.push(tokio::spawn(async move {
            state.profiles.get_or_create("new-subject", &hints, None).await
        }));
    }

    let mut codes = HashSet::new();
    for handle in handles {
        let user = handle.await.unwrap().unwrap();
        assert_eq!(user.id, "new-subject");
        codes.insert(user.referral_code.unwrap());
    }

    assert_eq!(codes.len(), 1, "every caller sees the same referral code");
    assert_eq!(app.store.user_count(), 1);
    assert_eq!(app.store.lost_creation_races(), 15);
    // Only the winner's code stays reserved.
    assert_eq!(app.store.code_reservation_attempts(), 1);

    let created = app.sink.wait_for(1, Duration::from_secs(2)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(app.sink.events_of_type(USER_CREATED_EVENT).len(), 1);
    assert_eq!(created[0].subject, "new-subject");
}

#[tokio::test]
async fn test_get_or_create_seeds_only_verified_hints() {
    let app = common::create_test_app();
    let hints = ProfileHints {
        verified_email: Some("a@x.com".to_string()),
        verified_ethereum_address: Some(addr(ADDRESS_A)),
        in_app_wallet: true,
        signup_method: "in-app-wallet".to_string(),
    };

    let user = app
        .state
        .profiles
        .get_or_create("seeded", &hints, None)
        .await
        .unwrap();

    assert_eq!(user.email_address.as_deref(), Some("a@x.com"));
    assert!(user.email_confirmed);
    assert_eq!(user.ethereum_address, Some(addr(ADDRESS_A)));
    assert!(user.ethereum_confirmed);
    assert!(user.in_app_wallet);
    assert!(user.email_confirmation_key.is_none());

    let events = app.sink.wait_for(1, Duration::from_secs(2)).await;
    assert_eq!(events[0].data["method"], "in-app-wallet");
    assert_eq!(events[0].data["userId"], "seeded");
}

#[tokio::test]
async fn test_existing_user_is_not_reseeded() {
    let app = common::create_test_app();
    let profiles = &app.state.profiles;
    let first = profiles
        .get_or_create("u1", &ProfileHints::default(), None)
        .await
        .unwrap();

    let hints = ProfileHints {
        verified_email: Some("late@x.com".to_string()),
        ..Default::default()
    };
    let again = profiles.get_or_create("u1", &hints, None).await.unwrap();
    assert_eq!(again, first);
}

#[tokio::test]
async fn test_signup_with_referral_code_links_referrer() {
    let app = common::create_test_app();
    let profiles = &app.state.profiles;
    let referrer = profiles
        .get_or_create("referrer", &ProfileHints::default(), None)
        .await
        .unwrap();
    let code = referrer.referral_code.clone().unwrap();

    let user = profiles
        .get_or_create("referred", &ProfileHints::default(), Some(&code))
        .await
        .unwrap();
    assert_eq!(user.referrer_id.as_deref(), Some("referrer"));
}

#[tokio::test]
async fn test_signup_with_unknown_referral_code_is_a_no_op() {
    let app = common::create_test_app();
    let user = app
        .state
        .profiles
        .get_or_create("u1", &ProfileHints::default(), Some("NOSUCHCD"))
        .await
        .unwrap();

    assert_eq!(user.referrer_id, None);
    assert_eq!(app.store.user_count(), 1);
}

#[tokio::test]
async fn test_referral_code_only_applies_on_creation() {
    let app = common::create_test_app();
    let profiles = &app.state.profiles;
    let referrer = profiles
        .get_or_create("referrer", &ProfileHints::default(), None)
        .await
        .unwrap();
    profiles
        .get_or_create("u1", &ProfileHints::default(), None)
        .await
        .unwrap();

    let user = profiles
        .get_or_create("u1", &ProfileHints::default(), referrer.referral_code.as_deref())
        .await
        .unwrap();
    assert_eq!(user.referrer_id, None);
}

#[tokio::test]
async fn test_email_change_resets_confirmation() {
    let app = common::create_test_app();
    let hints = ProfileHints {
        verified_email: Some("a@x.com".to_string()),
        ..Default::default()
    };
    let profiles = &app.state.profiles;
    let user = profiles.get_or_create("u1", &hints, None).await.unwrap();
    assert!(user.email_confirmed);

    let patch = ProfilePatch {
        email_address: Some("b@x.com".to_string()),
        ..Default::default()
    };
    let user = profiles.update_profile("u1", &patch).await.unwrap();

    assert_eq!(user.email_address.as_deref(), Some("b@x.com"));
    assert!(!user.email_confirmed);
    assert!(user.email_confirmation_key.is_none());
    assert!(user.email_confirmation_sent_at.is_none());
}

#[tokio::test]
async fn test_same_email_keeps_confirmation() {
    let app = common::create_test_app();
    let hints = ProfileHints {
        verified_email: Some("a@x.com".to_string()),
        ..Default::default()
    };
    let profiles = &app.state.profiles;
    profiles.get_or_create("u1", &hints, None).await.unwrap();

    let patch = ProfilePatch {
        email_address: Some("a@x.com".to_string()),
        ..Default::default()
    };
    let user = profiles.update_profile("u1", &patch).await.unwrap();
    assert!(user.email_confirmed);
}

#[tokio::test]
async fn test_ethereum_address_change_resets_confirmation() {
    let app = common::create_test_app();
    let hints = ProfileHints {
        verified_ethereum_address: Some(addr(ADDRESS_A)),
        in_app_wallet: true,
        ..Default::default()
    };
    let profiles = &app.state.profiles;
    profiles.get_or_create("u1", &hints, None).await.unwrap();

    let patch = ProfilePatch {
        ethereum_address: Some(ADDRESS_B.to_uppercase().replace("0X", "0x")),
        ..Default::default()
    };
    let user = profiles.update_profile("u1", &patch).await.unwrap();
    assert_eq!(user.ethereum_address, Some(addr(ADDRESS_B)));
    assert!(!user.ethereum_confirmed);
    assert!(user.ethereum_challenge.is_none());
}

#[tokio::test]
async fn test_country_code_validation() {
    let app = common::create_test_app();
    let profiles = &app.state.profiles;
    profiles
        .get_or_create("u1", &ProfileHints::default(), None)
        .await
        .unwrap();

    let valid = ProfilePatch {
        country_code: Some("USA".to_string()),
        ..Default::default()
    };
    let user = profiles.update_profile("u1", &valid).await.unwrap();
    assert_eq!(user.country_code.as_deref(), Some("USA"));

    let invalid = ProfilePatch {
        country_code: Some("ZZZ".to_string()),
        ..Default::default()
    };
    let err = profiles.update_profile("u1", &invalid).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));

    let stored = app.store.get_user("u1").await.unwrap().unwrap();
    assert_eq!(stored.country_code.as_deref(), Some("USA"));
}

#[tokio::test]
async fn test_invalid_patch_writes_nothing() {
    let app = common::create_test_app();
    let profiles = &app.state.profiles;
    profiles
        .get_or_create("u1", &ProfileHints::default(), None)
        .await
        .unwrap();

    let patch = ProfilePatch {
        country_code: Some("CAN".to_string()),
        email_address: Some("not an email".to_string()),
        ..Default::default()
    };
    assert!(matches!(
        profiles.update_profile("u1", &patch).await,
        Err(AppError::InvalidInput(_))
    ));

    let stored = app.store.get_user("u1").await.unwrap().unwrap();
    assert_eq!(stored.country_code, None);
    assert_eq!(stored.email_address, None);
}

#[tokio::test]
async fn test_delete_keeps_referred_users() {
    let app = common::create_test_app();
    let profiles = &app.state.profiles;
    let referrer = profiles
        .get_or_create("referrer", &ProfileHints::default(), None)
        .await
        .unwrap();
    profiles
        .get_or_create("referred", &ProfileHints::default(), referrer.referral_code.as_deref())
        .await
        .unwrap();

    profiles.delete_profile("referrer").await.unwrap();

    assert!(app.store.get_user("referrer").await.unwrap().is_none());
    let referred = app.store.get_user("referred").await.unwrap().unwrap();
    assert_eq!(referred.referrer_id.as_deref(), Some("referrer"));

    assert!(matches!(
        profiles.delete_profile("referrer").await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_agree_tos_stamps_time() {
    let app = common::create_test_app();
    let profiles = &app.state.profiles;
    profiles
        .get_or_create("u1", &ProfileHints::default(), None)
        .await
        .unwrap();

    let user = profiles.agree_tos("u1").await.unwrap();
    assert_eq!(user.agreed_tos_at, Some(common::start_time()));
}

/// Insert a fully confirmed user directly into the store.
async fn confirmed_user(
    store: &dyn IdentityStore,
    id: &str,
    email: &str,
    address: &str,
    in_app_wallet: bool,
    created_offset_secs: i64,
) {
    let mut user = User::new(
        id,
        format!("CODE{id:0>4}"),
        common::start_time() + chrono::Duration::seconds(created_offset_secs),
    );
    user.email_address = Some(email.to_string());
    user.email_confirmed = true;
    user.ethereum_address = Some(addr(address));
    user.ethereum_confirmed = true;
    user.in_app_wallet = in_app_wallet;
    store.create_user_if_absent(&user).await.unwrap();
}

#[tokio::test]
async fn test_check_email_in_use_dedupes_by_first_seen_address() {
    let app = common::create_test_app_with_balances(StaticBalances::new([addr(ADDRESS_A)]));
    let store = app.store.as_ref();

    // Same address twice: the older record says in-app, the newer external.
    confirmed_user(store, "u1", "shared@x.com", ADDRESS_A, true, 0).await;
    confirmed_user(store, "u2", "shared@x.com", ADDRESS_A, false, 60).await;

    let usage = app
        .state
        .profiles
        .check_email_in_use("shared@x.com")
        .await
        .unwrap();

    assert!(usage.in_use);
    assert_eq!(
        usage.wallet_counts,
        WalletCounts {
            in_app: 1,
            external: 0
        }
    );
}

#[tokio::test]
async fn test_check_email_in_use_ignores_empty_wallets_and_unconfirmed_users() {
    let app = common::create_test_app_with_balances(StaticBalances::new([addr(ADDRESS_A)]));
    let store = app.store.as_ref();

    confirmed_user(store, "u1", "a@x.com", ADDRESS_A, false, 0).await;
    confirmed_user(store, "u2", "a@x.com", ADDRESS_B, true, 10).await;

    // Unconfirmed record with a token-holding address does not count.
    let mut pending = User::new("u3", "CODE0003", common::start_time());
    pending.email_address = Some("b@x.com".to_string());
    pending.ethereum_address = Some(addr(ADDRESS_A));
    store.create_user_if_absent(&pending).await.unwrap();

    let profiles = &app.state.profiles;
    let usage = profiles.check_email_in_use("a@x.com").await.unwrap();
    assert!(usage.in_use);
    assert_eq!(usage.wallet_counts, WalletCounts { in_app: 0, external: 1 });

    let usage = profiles.check_email_in_use("b@x.com").await.unwrap();
    assert!(!usage.in_use);
    assert_eq!(usage.wallet_counts, WalletCounts::default());

    assert!(matches!(
        profiles.check_email_in_use("nope").await,
        Err(AppError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn test_user_record_includes_referrer_wallet() {
    let app = common::create_test_app();
    let store = app.store.as_ref();
    confirmed_user(store, "ref", "r@x.com", ADDRESS_A, false, 0).await;

    let profiles = &app.state.profiles;
    profiles
        .get_or_create("u1", &ProfileHints::default(), Some("CODE0ref"))
        .await
        .unwrap();

    let record = profiles.get_user_record("u1").await.unwrap();
    assert_eq!(record.user.referrer_id.as_deref(), Some("ref"));
    assert_eq!(record.referrer_ethereum_address, Some(addr(ADDRESS_A)));

    let by_address = profiles.get_user_by_eth_address(ADDRESS_A).await.unwrap();
    assert_eq!(by_address.user.id, "ref");
    assert_eq!(by_address.referrer_ethereum_address, None);

    assert!(matches!(
        profiles.get_user_record("missing").await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        profiles.get_user_by_eth_address(ADDRESS_B).await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        profiles.get_user_by_eth_address("0x1234").await,
        Err(AppError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn test_unconfirmed_address_is_not_found_by_lookup() {
    let app = common::create_test_app();
    let profiles = &app.state.profiles;
    profiles
        .get_or_create("u1", &ProfileHints::default(), None)
        .await
        .unwrap();
    let patch = ProfilePatch {
        ethereum_address: Some(ADDRESS_A.to_string()),
        ..Default::default()
    };
    profiles.update_profile("u1", &patch).await.unwrap();

    assert!(matches!(
        profiles.get_user_by_eth_address(ADDRESS_A).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_store_failure_surfaces_as_internal() {
    let app = common::create_test_app();
    let profiles = &app.state.profiles;
    profiles
        .get_or_create("u1", &ProfileHints::default(), None)
        .await
        .unwrap();
    app.store.set_failing_user_ids(["u1".to_string()]);

    let err = profiles.agree_tos("u1").await.unwrap_err();
    assert!(err.is_internal());
}
