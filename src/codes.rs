// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Random short codes (confirmation keys, referral codes, challenge nonces).

use crate::error::AppError;
use ring::rand::{SecureRandom, SystemRandom};

const DIGITS: &[u8] = b"0123456789";
const ALPHANUMERIC: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

pub const CONFIRMATION_KEY_LENGTH: usize = 8;
pub const REFERRAL_CODE_LENGTH: usize = 8;

/// Uniform random string over `alphabet`.
///
/// Bytes at or above the largest multiple of the alphabet size are rejected
/// so every symbol is equally likely.
fn random_string(rng: &SystemRandom, alphabet: &[u8], len: usize) -> Result<String, AppError> {
    let limit = 256 - (256 % alphabet.len());
    let mut out = String::with_capacity(len);
    let mut buf = [0u8; 32];

    while out.len() < len {
        rng.fill(&mut buf)
            .map_err(|_| AppError::Internal(anyhow::anyhow!("system RNG failure")))?;
        for &b in &buf {
            if (b as usize) < limit {
                out.push(alphabet[b as usize % alphabet.len()] as char);
                if out.len() == len {
                    break;
                }
            }
        }
    }

    Ok(out)
}

/// 8 decimal digits proving control of an inbox.
pub fn confirmation_key() -> Result<String, AppError> {
    random_string(&SystemRandom::new(), DIGITS, CONFIRMATION_KEY_LENGTH)
}

/// 8 characters from `[A-Za-z0-9]`.
pub fn referral_code() -> Result<String, AppError> {
    random_string(&SystemRandom::new(), ALPHANUMERIC, REFERRAL_CODE_LENGTH)
}

/// 16 random bytes as hex, embedded in Ethereum challenges.
pub fn challenge_nonce() -> Result<String, AppError> {
    let mut bytes = [0u8; 16];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| AppError::Internal(anyhow::anyhow!("system RNG failure")))?;
    Ok(hex::encode(bytes))
}
