// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Services module - business logic layer.

pub mod email;
pub mod ethereum;
pub mod events;
pub mod oidc;
pub mod profile;
pub mod referral;
pub mod verification;

pub use email::{ConfirmationMailer, HttpMailer, RecordingMailer};
pub use ethereum::{EthRpcClient, KnownSignatures, SignatureRecovery, StaticBalances, TokenBalances};
pub use events::{EventEmitter, EventSink, PublisherHandle, PubSubSink, RecordingSink};
pub use oidc::{IdTokenClaims, OidcError, OidcVerifier};
pub use profile::{EmailUsage, ProfileHints, ProfilePatch, ProfileService, UserRecord, WalletCounts};
pub use referral::{ReferralEngine, ReferralOutcome};
pub use verification::{VerificationEngine, WalletContext};

/// Tally of a batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: u32,
    pub failed: u32,
    /// Stopped before every row was visited
    pub interrupted: bool,
}

impl BatchReport {
    pub fn is_complete_success(&self) -> bool {
        self.failed == 0 && !self.interrupted
    }
}
