// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! In-process identity store for tests and local development.
//!
//! Enforces the same uniqueness rules as Firestore. Atomicity comes from
//! DashMap shard locks; when two maps are locked together the order is
//! always `users` then `codes`.

use super::{sort_by_creation, IdentityStore, UserMutation};
use crate::error::AppError;
use crate::models::{EthAddress, Referral, User};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Barrier;

/// DashMap-backed identity store.
#[derive(Default)]
pub struct MemoryStore {
    users: DashMap<String, User>,
    /// referral code -> owning user id
    codes: DashMap<String, String>,
    /// VIN -> completed referral
    referrals: DashMap<String, Referral>,

    /// Number of upcoming code reservations that report a collision.
    forced_code_conflicts: AtomicUsize,
    code_reservations: AtomicUsize,
    /// Users whose writes fail with a database error.
    failing_user_ids: Mutex<HashSet<String>>,
    /// When armed, creations wait here until the whole group has arrived.
    creation_gate: Mutex<Option<Arc<Barrier>>>,
    /// Creations that found the record already written by another caller.
    lost_creation_races: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` referral-code reservations fail with `Conflict`.
    pub fn force_code_conflicts(&self, n: usize) {
        self.forced_code_conflicts.store(n, Ordering::SeqCst);
    }

    /// Total referral-code reservations attempted so far.
    pub fn code_reservation_attempts(&self) -> usize {
        self.code_reservations.load(Ordering::SeqCst)
    }

    /// Make writes for these users fail with a database error.
    pub fn set_failing_user_ids(&self, ids: impl IntoIterator<Item = String>) {
        let mut guard = self
            .failing_user_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        guard.clear();
        guard.extend(ids);
    }

    /// Hold the next `n` user creations until all of them have arrived.
    pub fn hold_creations(&self, n: usize) {
        let mut gate = self.creation_gate.lock().unwrap_or_else(|e| e.into_inner());
        *gate = Some(Arc::new(Barrier::new(n)));
    }

    /// Creations that lost to a concurrent writer of the same user.
    pub fn lost_creation_races(&self) -> usize {
        self.lost_creation_races.load(Ordering::SeqCst)
    }

    async fn pass_creation_gate(&self) {
        let gate = self
            .creation_gate
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(barrier) = gate {
            if barrier.wait().await.is_leader() {
                let mut guard = self.creation_gate.lock().unwrap_or_else(|e| e.into_inner());
                if guard.as_ref().is_some_and(|g| Arc::ptr_eq(g, &barrier)) {
                    *guard = None;
                }
            }
        }
    }

    /// Number of stored users (tests assert on row counts).
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn referral_count(&self) -> usize {
        self.referrals.len()
    }

    fn check_failing(&self, id: &str) -> Result<(), AppError> {
        let guard = self
            .failing_user_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if guard.contains(id) {
            return Err(AppError::Database(format!("injected write failure for {id}")));
        }
        Ok(())
    }

    /// Count a reservation attempt and consume one forced conflict if armed.
    fn forced_conflict(&self) -> bool {
        self.code_reservations.fetch_add(1, Ordering::SeqCst);
        self.forced_code_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn get_user(&self, id: &str) -> Result<Option<User>, AppError> {
        Ok(self.users.get(id).map(|u| u.value().clone()))
    }

    async fn create_user_if_absent(&self, user: &User) -> Result<(User, bool), AppError> {
        self.pass_creation_gate().await;
        match self.users.entry(user.id.clone()) {
            Entry::Occupied(existing) => {
                self.lost_creation_races.fetch_add(1, Ordering::SeqCst);
                Ok((existing.get().clone(), false))
            }
            Entry::Vacant(slot) => {
                if let Some(code) = &user.referral_code {
                    if self.forced_conflict() {
                        return Err(AppError::Conflict(format!("referral code {code} taken")));
                    }
                    match self.codes.entry(code.clone()) {
                        Entry::Occupied(_) => {
                            return Err(AppError::Conflict(format!("referral code {code} taken")));
                        }
                        Entry::Vacant(code_slot) => {
                            code_slot.insert(user.id.clone());
                        }
                    }
                }
                slot.insert(user.clone());
                Ok((user.clone(), true))
            }
        }
    }

    async fn modify_user(&self, id: &str, mutate: UserMutation<'_>) -> Result<User, AppError> {
        self.check_failing(id)?;
        let mut entry = self
            .users
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("User {id} not found")))?;

        let mut updated = entry.value().clone();
        mutate(&mut updated)?;
        *entry.value_mut() = updated.clone();
        Ok(updated)
    }

    async fn delete_user(&self, id: &str) -> Result<(), AppError> {
        let (_, user) = self
            .users
            .remove(id)
            .ok_or_else(|| AppError::NotFound(format!("User {id} not found")))?;

        if let Some(code) = user.referral_code {
            self.codes.remove_if(&code, |_, owner| owner == id);
        }
        Ok(())
    }

    async fn find_user_by_eth_address(
        &self,
        address: &EthAddress,
    ) -> Result<Option<User>, AppError> {
        let mut matches: Vec<User> = self
            .users
            .iter()
            .filter(|u| u.confirmed_ethereum_address().as_ref() == Some(address))
            .map(|u| u.value().clone())
            .collect();
        sort_by_creation(&mut matches);
        Ok(matches.into_iter().next())
    }

    async fn find_user_by_referral_code(&self, code: &str) -> Result<Option<User>, AppError> {
        let Some(owner) = self.codes.get(code).map(|o| o.value().clone()) else {
            return Ok(None);
        };
        Ok(self.users.get(&owner).map(|u| u.value().clone()))
    }

    async fn list_users_by_email(&self, email: &str) -> Result<Vec<User>, AppError> {
        let mut users: Vec<User> = self
            .users
            .iter()
            .filter(|u| u.email_address.as_deref() == Some(email))
            .map(|u| u.value().clone())
            .collect();
        sort_by_creation(&mut users);
        Ok(users)
    }

    async fn list_users_missing_referral_code(&self) -> Result<Vec<User>, AppError> {
        let mut users: Vec<User> = self
            .users
            .iter()
            .filter(|u| u.referral_code.is_none())
            .map(|u| u.value().clone())
            .collect();
        sort_by_creation(&mut users);
        Ok(users)
    }

    async fn assign_referral_code(&self, id: &str, code: &str) -> Result<User, AppError> {
        self.check_failing(id)?;
        let mut entry = self
            .users
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("User {id} not found")))?;

        if self.forced_conflict() {
            return Err(AppError::Conflict(format!("referral code {code} taken")));
        }
        match self.codes.entry(code.to_string()) {
            Entry::Occupied(_) => {
                return Err(AppError::Conflict(format!("referral code {code} taken")));
            }
            Entry::Vacant(slot) => {
                slot.insert(id.to_string());
            }
        }

        if let Some(old) = entry.referral_code.replace(code.to_string()) {
            self.codes.remove_if(&old, |_, owner| owner == id);
        }
        Ok(entry.value().clone())
    }

    async fn insert_referral(&self, referral: &Referral) -> Result<(), AppError> {
        self.check_failing(&referral.referred_user_id)?;
        match self.referrals.entry(referral.vin.clone()) {
            Entry::Occupied(_) => Err(AppError::Conflict(format!(
                "VIN {} already credited",
                referral.vin
            ))),
            Entry::Vacant(slot) => {
                slot.insert(referral.clone());
                Ok(())
            }
        }
    }

    async fn list_all_users(&self) -> Result<Vec<User>, AppError> {
        let mut users: Vec<User> = self.users.iter().map(|u| u.value().clone()).collect();
        sort_by_creation(&mut users);
        Ok(users)
    }

    async fn list_all_referrals(&self) -> Result<Vec<Referral>, AppError> {
        let mut referrals: Vec<Referral> =
            self.referrals.iter().map(|r| r.value().clone()).collect();
        referrals.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.vin.cmp(&b.vin)));
        Ok(referrals)
    }
}
