// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Identity store: persistence of users, referral-code reservations and
//! completed referrals.

pub mod firestore;
pub mod memory;

pub use firestore::FirestoreDb;
pub use memory::MemoryStore;

use crate::error::AppError;
use crate::models::{EthAddress, Referral, User};
use async_trait::async_trait;

/// Collection names as constants.
pub mod collections {
    pub const USERS: &str = "users";
    /// Uniqueness reservations, keyed by referral code
    pub const REFERRAL_CODES: &str = "referral_codes";
    /// Completed referrals, keyed by VIN
    pub const REFERRALS: &str = "referrals";
}

/// Mutation applied to a user inside an atomic read-modify-write.
///
/// Returning an error aborts the write and is passed back to the caller.
/// May be invoked more than once if the backend retries.
pub type UserMutation<'a> = &'a (dyn Fn(&mut User) -> Result<(), AppError> + Send + Sync);

/// Persistence contract shared by every backend.
///
/// All writes are single-document and strongly consistent. Uniqueness
/// violations (user id, referral code, VIN) surface as [`AppError::Conflict`].
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Get a user by subject id.
    async fn get_user(&self, id: &str) -> Result<Option<User>, AppError>;

    /// Insert `user` unless a record with the same id exists.
    ///
    /// Returns the stored record and whether it was created by this call.
    /// A losing concurrent writer gets the winner's record back. Fails with
    /// `Conflict` only when the id is new but the referral code is taken.
    async fn create_user_if_absent(&self, user: &User) -> Result<(User, bool), AppError>;

    /// Atomically apply `mutate` to the stored user and persist the result.
    ///
    /// Fails with `NotFound` if the user does not exist.
    async fn modify_user(&self, id: &str, mutate: UserMutation<'_>) -> Result<User, AppError>;

    /// Hard-delete a user and release its referral code.
    async fn delete_user(&self, id: &str) -> Result<(), AppError>;

    /// Find the user that has proven ownership of `address`.
    async fn find_user_by_eth_address(
        &self,
        address: &EthAddress,
    ) -> Result<Option<User>, AppError>;

    async fn find_user_by_referral_code(&self, code: &str) -> Result<Option<User>, AppError>;

    /// All users with this email address, oldest first.
    async fn list_users_by_email(&self, email: &str) -> Result<Vec<User>, AppError>;

    /// Legacy users that were never given a referral code.
    async fn list_users_missing_referral_code(&self) -> Result<Vec<User>, AppError>;

    /// Reserve `code` and assign it to the user.
    ///
    /// Fails with `Conflict` if another user holds the code.
    async fn assign_referral_code(&self, id: &str, code: &str) -> Result<User, AppError>;

    /// Record a completed referral. Fails with `Conflict` if the VIN was
    /// already credited.
    async fn insert_referral(&self, referral: &Referral) -> Result<(), AppError>;

    async fn list_all_users(&self) -> Result<Vec<User>, AppError>;

    async fn list_all_referrals(&self) -> Result<Vec<Referral>, AppError>;
}

/// Sort users oldest first, breaking ties by id.
pub(crate) fn sort_by_creation(users: &mut [User]) {
    users.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}
