// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Firestore client wrapper with typed operations.
//!
//! Layout:
//! - `users/{id}` (profile and verification state)
//! - `referral_codes/{code}` (one document per issued code; document-ID
//!   uniqueness is what makes codes unique)
//! - `referrals/{vin}` (completed referrals)

use super::{collections, sort_by_creation, IdentityStore, UserMutation};
use crate::error::AppError;
use crate::models::{EthAddress, Referral, User};
use async_trait::async_trait;
use firestore::errors::FirestoreError;
use firestore::FirestoreConsistencySelector;
use serde::{Deserialize, Serialize};

// Commit failures under contention are retried with a fresh read.
const MAX_TRANSACTION_ATTEMPTS: u32 = 5;

/// Reservation document proving ownership of a referral code.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CodeReservation {
    user_id: String,
}

/// Firestore database client.
#[derive(Clone)]
pub struct FirestoreDb {
    client: Option<firestore::FirestoreDb>,
}

impl FirestoreDb {
    /// Create a new Firestore client.
    ///
    /// For local development with emulator, set FIRESTORE_EMULATOR_HOST.
    pub async fn new(project_id: &str) -> Result<Self, AppError> {
        // If the emulator environment variable is set, use unauthenticated connection
        // to avoid local credential warnings and leakage.
        if std::env::var("FIRESTORE_EMULATOR_HOST").is_ok() {
            return Self::create_emulator_client(project_id).await;
        }

        let client = firestore::FirestoreDb::new(project_id)
            .await
            .map_err(|e| AppError::Database(format!("Failed to connect to Firestore: {}", e)))?;

        tracing::info!(project = project_id, "Connected to Firestore");

        Ok(Self {
            client: Some(client),
        })
    }

    /// Create a Firestore client for the emulator with unauthenticated access.
    async fn create_emulator_client(project_id: &str) -> Result<Self, AppError> {
        tracing::info!("Using unauthenticated connection for Firestore Emulator");

        let token_source = gcloud_sdk::ExternalJwtFunctionSource::new(|| async {
            Ok(gcloud_sdk::Token {
                token_type: "Bearer".to_string(),
                token: gcloud_sdk::SecretValue::new(
                    "eyJhbGciOiJub25lIn0.eyJ1aWQiOiJ0ZXN0In0."
                        .to_string()
                        .into(),
                ),
                expiry: chrono::Utc::now() + chrono::Duration::hours(1),
            })
        });

        let options = firestore::FirestoreDbOptions::new(project_id.to_string());

        let client = firestore::FirestoreDb::with_options_token_source(
            options,
            gcloud_sdk::GCP_DEFAULT_SCOPES.clone(),
            gcloud_sdk::TokenSourceType::ExternalSource(Box::new(token_source)),
        )
        .await
        .map_err(|e| {
            AppError::Database(format!("Failed to connect to Firestore Emulator: {}", e))
        })?;

        tracing::info!(
            project = project_id,
            "Connected to Firestore (Emulator/Unauthenticated)"
        );

        Ok(Self {
            client: Some(client),
        })
    }

    /// Create a disconnected client for testing (offline mode).
    ///
    /// All database operations will return an error if called.
    pub fn new_mock() -> Self {
        Self { client: None }
    }

    /// Helper to get the client or return an error if offline.
    fn get_client(&self) -> Result<&firestore::FirestoreDb, AppError> {
        self.client
            .as_ref()
            .ok_or_else(|| AppError::Database("Database not connected (offline mode)".to_string()))
    }

    // ─── Referral Code Reservations ─────────────────────────────

    /// Claim `code` for `user_id`. `Conflict` if already claimed.
    async fn reserve_code(&self, code: &str, user_id: &str) -> Result<(), AppError> {
        let reservation = CodeReservation {
            user_id: user_id.to_string(),
        };

        let result: Result<CodeReservation, FirestoreError> = self
            .get_client()?
            .fluent()
            .insert()
            .into(collections::REFERRAL_CODES)
            .document_id(code)
            .object(&reservation)
            .execute()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(FirestoreError::DataConflictError(_)) => {
                Err(AppError::Conflict(format!("referral code {code} taken")))
            }
            Err(e) => Err(AppError::Database(e.to_string())),
        }
    }

    async fn release_code(&self, code: &str) -> Result<(), AppError> {
        self.get_client()?
            .fluent()
            .delete()
            .from(collections::REFERRAL_CODES)
            .document_id(code)
            .execute()
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Drop the user's code reservation, logging instead of failing.
    async fn release_code_quietly(&self, user: &User) {
        if let Some(code) = &user.referral_code {
            if let Err(e) = self.release_code(code).await {
                tracing::warn!(user_id = %user.id, code = %code, error = %e, "Failed to release referral code");
            }
        }
    }

    /// One read-modify-write attempt inside a transaction.
    ///
    /// `Ok(None)` means the commit failed and the caller may retry.
    async fn try_modify_user(
        &self,
        id: &str,
        mutate: UserMutation<'_>,
    ) -> Result<Option<User>, AppError> {
        let client = self.get_client()?;

        let mut transaction = client
            .begin_transaction()
            .await
            .map_err(|e| AppError::Database(format!("Failed to begin transaction: {}", e)))?;

        // Reads through this handle register the document for conflict detection.
        let tx_client = client.clone_with_consistency_selector(
            FirestoreConsistencySelector::Transaction(transaction.transaction_id().clone()),
        );

        let current: Option<User> = tx_client
            .fluent()
            .select()
            .by_id_in(collections::USERS)
            .obj()
            .one(id)
            .await
            .map_err(|e| AppError::Database(format!("Failed to read user in transaction: {}", e)))?;

        let Some(mut user) = current else {
            let _ = transaction.rollback().await;
            return Err(AppError::NotFound(format!("User {id} not found")));
        };

        if let Err(e) = mutate(&mut user) {
            let _ = transaction.rollback().await;
            return Err(e);
        }

        if let Err(e) = client
            .fluent()
            .update()
            .in_col(collections::USERS)
            .document_id(id)
            .object(&user)
            .add_to_transaction(&mut transaction)
        {
            let _ = transaction.rollback().await;
            return Err(AppError::Database(format!(
                "Failed to add user to transaction: {}",
                e
            )));
        }

        match transaction.commit().await {
            Ok(_) => Ok(Some(user)),
            Err(e) => {
                tracing::warn!(user_id = %id, error = %e, "User transaction commit failed");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl IdentityStore for FirestoreDb {
    async fn get_user(&self, id: &str) -> Result<Option<User>, AppError> {
        self.get_client()?
            .fluent()
            .select()
            .by_id_in(collections::USERS)
            .obj()
            .one(id)
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    async fn create_user_if_absent(&self, user: &User) -> Result<(User, bool), AppError> {
        if let Some(existing) = self.get_user(&user.id).await? {
            return Ok((existing, false));
        }

        if let Some(code) = &user.referral_code {
            self.reserve_code(code, &user.id).await?;
        }

        let result: Result<User, FirestoreError> = self
            .get_client()?
            .fluent()
            .insert()
            .into(collections::USERS)
            .document_id(&user.id)
            .object(user)
            .execute()
            .await;

        match result {
            Ok(created) => Ok((created, true)),
            Err(FirestoreError::DataConflictError(_)) => {
                // Lost the first-touch race: give back our code, use the winner's record.
                tracing::debug!(user_id = %user.id, "Concurrent user creation, fetching winner");
                self.release_code_quietly(user).await;
                let existing = self.get_user(&user.id).await?.ok_or_else(|| {
                    AppError::Database(format!("User {} vanished after conflict", user.id))
                })?;
                Ok((existing, false))
            }
            Err(e) => {
                self.release_code_quietly(user).await;
                Err(AppError::Database(e.to_string()))
            }
        }
    }

    async fn modify_user(&self, id: &str, mutate: UserMutation<'_>) -> Result<User, AppError> {
        for attempt in 1..=MAX_TRANSACTION_ATTEMPTS {
            if let Some(user) = self.try_modify_user(id, mutate).await? {
                return Ok(user);
            }
            tracing::debug!(user_id = %id, attempt, "Retrying user transaction");
        }

        Err(AppError::Database(format!(
            "User {id} transaction failed after {MAX_TRANSACTION_ATTEMPTS} attempts"
        )))
    }

    async fn delete_user(&self, id: &str) -> Result<(), AppError> {
        let user = self
            .get_user(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {id} not found")))?;

        self.get_client()?
            .fluent()
            .delete()
            .from(collections::USERS)
            .document_id(id)
            .execute()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        // The profile is gone; a stale reservation only resolves to nobody.
        self.release_code_quietly(&user).await;

        tracing::info!(user_id = %id, "Deleted user profile");
        Ok(())
    }

    async fn find_user_by_eth_address(
        &self,
        address: &EthAddress,
    ) -> Result<Option<User>, AppError> {
        let address = address.to_string();
        let mut users: Vec<User> = self
            .get_client()?
            .fluent()
            .select()
            .from(collections::USERS)
            .filter(move |q| {
                q.for_all([
                    q.field("ethereum_address").eq(address.clone()),
                    q.field("ethereum_confirmed").eq(true),
                ])
            })
            .obj()
            .query()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        sort_by_creation(&mut users);
        Ok(users.into_iter().next())
    }

    async fn find_user_by_referral_code(&self, code: &str) -> Result<Option<User>, AppError> {
        let reservation: Option<CodeReservation> = self
            .get_client()?
            .fluent()
            .select()
            .by_id_in(collections::REFERRAL_CODES)
            .obj()
            .one(code)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        // A reservation left behind by a failed release points at a user
        // who does not hold the code.
        match reservation {
            Some(r) => Ok(self
                .get_user(&r.user_id)
                .await?
                .filter(|u| u.referral_code.as_deref() == Some(code))),
            None => Ok(None),
        }
    }

    async fn list_users_by_email(&self, email: &str) -> Result<Vec<User>, AppError> {
        let email = email.to_string();
        let mut users: Vec<User> = self
            .get_client()?
            .fluent()
            .select()
            .from(collections::USERS)
            .filter(move |q| q.for_all([q.field("email_address").eq(email.clone())]))
            .obj()
            .query()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        sort_by_creation(&mut users);
        Ok(users)
    }

    async fn list_users_missing_referral_code(&self) -> Result<Vec<User>, AppError> {
        // Legacy documents may lack the field entirely, which a null filter
        // would not match.
        let users = self.list_all_users().await?;
        Ok(users
            .into_iter()
            .filter(|u| u.referral_code.is_none())
            .collect())
    }

    async fn assign_referral_code(&self, id: &str, code: &str) -> Result<User, AppError> {
        self.reserve_code(code, id).await?;

        let new_code = code.to_string();
        let result = self
            .modify_user(id, &move |user: &mut User| {
                user.referral_code = Some(new_code.clone());
                Ok(())
            })
            .await;

        if result.is_err() {
            if let Err(e) = self.release_code(code).await {
                tracing::warn!(code = %code, error = %e, "Failed to release referral code");
            }
        }
        result
    }

    async fn insert_referral(&self, referral: &Referral) -> Result<(), AppError> {
        let result: Result<Referral, FirestoreError> = self
            .get_client()?
            .fluent()
            .insert()
            .into(collections::REFERRALS)
            .document_id(&referral.vin)
            .object(referral)
            .execute()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(FirestoreError::DataConflictError(_)) => Err(AppError::Conflict(format!(
                "VIN {} already credited",
                referral.vin
            ))),
            Err(e) => Err(AppError::Database(e.to_string())),
        }
    }

    async fn list_all_users(&self) -> Result<Vec<User>, AppError> {
        let mut users: Vec<User> = self
            .get_client()?
            .fluent()
            .select()
            .from(collections::USERS)
            .obj()
            .query()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        sort_by_creation(&mut users);
        Ok(users)
    }

    async fn list_all_referrals(&self) -> Result<Vec<Referral>, AppError> {
        let mut referrals: Vec<Referral> = self
            .get_client()?
            .fluent()
            .select()
            .from(collections::REFERRALS)
            .obj()
            .query()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        referrals.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.vin.cmp(&b.vin)));
        Ok(referrals)
    }
}
