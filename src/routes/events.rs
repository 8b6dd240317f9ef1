// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Pub/Sub push endpoint for device registrations.
//!
//! Any 2xx acknowledges the message. Payloads that can never be processed
//! are acknowledged and logged; internal failures return 500 so Pub/Sub
//! redelivers.

use crate::error::AppError;
use crate::services::events::CloudEvent;
use crate::services::ReferralOutcome;
use crate::AppState;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    routing::post,
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use std::sync::Arc;
use tracing::Instrument;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/events/device-registered", post(device_registered))
}

#[derive(Debug, Deserialize)]
struct PushEnvelope {
    message: PushMessage,
    subscription: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushMessage {
    data: String,
    message_id: Option<String>,
}

/// `data` of a device-registered CloudEvent.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRegisteredData {
    pub user_id: String,
    pub vin: String,
}

/// Decode a push body into the device registration it carries.
fn decode_push(body: &[u8]) -> Result<(Option<String>, CloudEvent<DeviceRegisteredData>), String> {
    let envelope: PushEnvelope =
        serde_json::from_slice(body).map_err(|e| format!("invalid push envelope: {e}"))?;
    let data = STANDARD
        .decode(envelope.message.data.as_bytes())
        .map_err(|e| format!("invalid base64 data: {e}"))?;
    let event = serde_json::from_slice(&data).map_err(|e| format!("invalid CloudEvent: {e}"))?;

    tracing::debug!(subscription = ?envelope.subscription, "Decoded push message");
    Ok((envelope.message.message_id, event))
}

async fn device_registered(State(state): State<Arc<AppState>>, body: Bytes) -> StatusCode {
    let (message_id, event) = match decode_push(&body) {
        Ok(decoded) => decoded,
        Err(reason) => {
            tracing::warn!(reason = %reason, "Dropping malformed device registration");
            return StatusCode::NO_CONTENT;
        }
    };

    let span = tracing::info_span!(
        "device_registered",
        message_id = message_id.as_deref().unwrap_or_default(),
        event_id = %event.id,
        user_id = %event.data.user_id,
    );
    let outcome = state
        .profiles
        .referrals()
        .complete_referral(&event.data.user_id, &event.data.vin)
        .instrument(span.clone())
        .await;
    let _enter = span.enter();

    match outcome {
        Ok(ReferralOutcome::Recorded(_)) => StatusCode::NO_CONTENT,
        Ok(other) => {
            tracing::debug!(outcome = ?other, "Device registration needed no referral");
            StatusCode::NO_CONTENT
        }
        Err(e) if e.is_internal() => {
            tracing::error!(error = %e, "Failed to process device registration");
            StatusCode::INTERNAL_SERVER_ERROR
        }
        Err(AppError::InvalidInput(reason)) => {
            tracing::warn!(reason = %reason, "Dropping invalid device registration");
            StatusCode::NO_CONTENT
        }
        Err(e) => {
            tracing::warn!(error = %e, "Device registration rejected");
            StatusCode::NO_CONTENT
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn push_body(event: serde_json::Value) -> Vec<u8> {
        let data = STANDARD.encode(serde_json::to_vec(&event).unwrap());
        serde_json::to_vec(&json!({
            "message": { "data": data, "messageId": "m-1" },
            "subscription": "projects/p/subscriptions/s",
        }))
        .unwrap()
    }

    #[test]
    fn test_decode_push() {
        let body = push_body(json!({
            "id": "e-1",
            "source": "devices",
            "specversion": "1.0",
            "subject": "u1",
            "time": "2024-01-01T10:00:00Z",
            "type": "com.devices.device.registered",
            "data": { "userId": "u1", "vin": "1HGCM82633A004352" },
        }));

        let (message_id, event) = decode_push(&body).unwrap();
        assert_eq!(message_id.as_deref(), Some("m-1"));
        assert_eq!(event.data.user_id, "u1");
        assert_eq!(event.data.vin, "1HGCM82633A004352");
    }

    #[test]
    fn test_decode_push_rejects_garbage() {
        assert!(decode_push(b"not json").is_err());
        assert!(decode_push(br#"{"message":{"data":"!!!"}}"#).is_err());
        assert!(decode_push(&push_body(json!({"id": "e-1"}))).is_err());
    }
}
