// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! On-chain reads and signature recovery via Ethereum JSON-RPC.

use crate::error::AppError;
use crate::models::EthAddress;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// ERC-20 `balanceOf(address)` selector.
const BALANCE_OF_SELECTOR: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];
const RPC_TIMEOUT: Duration = Duration::from_secs(10);
const METHOD_NOT_FOUND: i64 = -32601;

/// Length of a recoverable secp256k1 signature (r, s, v).
pub const SIGNATURE_LENGTH: usize = 65;

/// Whether an address holds any of the tracked tokens.
#[async_trait]
pub trait TokenBalances: Send + Sync {
    async fn holds_tokens(&self, owner: &EthAddress) -> Result<bool, AppError>;
}

/// Recover the address that produced a personal-message signature.
#[async_trait]
pub trait SignatureRecovery: Send + Sync {
    /// `signature` is 0x-prefixed hex. Returns `Mismatch` if no signer can be
    /// recovered.
    async fn recover_signer(&self, message: &str, signature: &str)
        -> Result<EthAddress, AppError>;
}

/// Normalize a user-supplied signature to lowercase `0x` + 130 hex digits.
pub fn parse_signature(raw: &str) -> Result<String, AppError> {
    let raw = raw.trim();
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);

    match hex::decode(digits) {
        Ok(bytes) if bytes.len() == SIGNATURE_LENGTH => Ok(format!("0x{}", hex::encode(bytes))),
        Ok(bytes) => Err(AppError::InvalidInput(format!(
            "signature must be {} bytes, got {}",
            SIGNATURE_LENGTH,
            bytes.len()
        ))),
        Err(_) => Err(AppError::InvalidInput(
            "signature must be hex encoded".to_string(),
        )),
    }
}

// ─── JSON-RPC client ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// Failure modes of a single RPC call.
enum CallError {
    /// The node answered with a JSON-RPC error object.
    Rejected(RpcError),
    Transport(String),
}

/// Ethereum node client.
pub struct EthRpcClient {
    http_client: reqwest::Client,
    rpc_url: String,
    token_contracts: Vec<EthAddress>,
    next_id: AtomicU64,
}

impl EthRpcClient {
    pub fn new(rpc_url: impl Into<String>, token_contracts: Vec<EthAddress>) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder().timeout(RPC_TIMEOUT).build()?;
        Ok(Self {
            http_client,
            rpc_url: rpc_url.into(),
            token_contracts,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, CallError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .http_client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CallError::Transport(format!("{method} request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(CallError::Transport(format!(
                "{method} returned status {}",
                response.status()
            )));
        }

        let parsed: RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| CallError::Transport(format!("invalid {method} response: {e}")))?;

        if let Some(error) = parsed.error {
            return Err(CallError::Rejected(error));
        }
        parsed
            .result
            .ok_or_else(|| CallError::Transport(format!("{method} response has no result")))
    }

    async fn balance_of(&self, contract: &EthAddress, owner: &EthAddress) -> Result<bool, AppError> {
        let mut data = BALANCE_OF_SELECTOR.to_vec();
        data.extend_from_slice(&owner.to_abi_word());

        let params = json!([
            { "to": contract.to_string(), "data": format!("0x{}", hex::encode(data)) },
            "latest"
        ]);

        let result: String = self.call("eth_call", params).await.map_err(|e| {
            let reason = match e {
                CallError::Rejected(err) => format!("eth_call rejected ({}): {}", err.code, err.message),
                CallError::Transport(reason) => reason,
            };
            AppError::Internal(anyhow::anyhow!(reason))
        })?;

        Ok(is_nonzero_quantity(&result))
    }
}

/// True if a hex-encoded uint is nonzero.
fn is_nonzero_quantity(value: &str) -> bool {
    value
        .trim_start_matches("0x")
        .chars()
        .any(|c| c != '0')
}

#[async_trait]
impl TokenBalances for EthRpcClient {
    async fn holds_tokens(&self, owner: &EthAddress) -> Result<bool, AppError> {
        for contract in &self.token_contracts {
            if self.balance_of(contract, owner).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl SignatureRecovery for EthRpcClient {
    async fn recover_signer(
        &self,
        message: &str,
        signature: &str,
    ) -> Result<EthAddress, AppError> {
        let params = json!([format!("0x{}", hex::encode(message.as_bytes())), signature]);

        match self.call::<String>("personal_ecRecover", params).await {
            Ok(address) => address.parse().map_err(|e| {
                AppError::Internal(anyhow::anyhow!("node returned bad address: {}", e))
            }),
            Err(CallError::Rejected(err)) if err.code != METHOD_NOT_FOUND => {
                tracing::debug!(code = err.code, message = %err.message, "Signature recovery rejected");
                Err(AppError::Mismatch(
                    "signature could not be verified".to_string(),
                ))
            }
            Err(CallError::Rejected(err)) => Err(AppError::Internal(anyhow::anyhow!(
                "personal_ecRecover unsupported: {}",
                err.message
            ))),
            Err(CallError::Transport(reason)) => Err(AppError::Internal(anyhow::anyhow!(reason))),
        }
    }
}

// ─── Offline implementations ─────────────────────────────────

/// Fixed set of token holders.
#[derive(Default)]
pub struct StaticBalances {
    holders: HashSet<EthAddress>,
}

impl StaticBalances {
    pub fn new(holders: impl IntoIterator<Item = EthAddress>) -> Self {
        Self {
            holders: holders.into_iter().collect(),
        }
    }
}

#[async_trait]
impl TokenBalances for StaticBalances {
    async fn holds_tokens(&self, owner: &EthAddress) -> Result<bool, AppError> {
        Ok(self.holders.contains(owner))
    }
}

/// Signatures registered ahead of time, keyed by (message, signature).
#[derive(Default)]
pub struct KnownSignatures {
    signers: DashMap<(String, String), EthAddress>,
}

impl KnownSignatures {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce a signature over `message` that recovers to `signer`.
    pub fn sign(&self, message: &str, signer: EthAddress) -> String {
        let n = self.signers.len() as u8;
        let mut bytes = [n; SIGNATURE_LENGTH];
        bytes[..20].copy_from_slice(signer.as_bytes());
        let signature = format!("0x{}", hex::encode(bytes));
        self.signers
            .insert((message.to_string(), signature.clone()), signer);
        signature
    }
}

#[async_trait]
impl SignatureRecovery for KnownSignatures {
    async fn recover_signer(
        &self,
        message: &str,
        signature: &str,
    ) -> Result<EthAddress, AppError> {
        self.signers
            .get(&(message.to_string(), signature.to_string()))
            .map(|s| *s.value())
            .ok_or_else(|| AppError::Mismatch("signature could not be verified".to_string()))
    }
}
