// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! User lifecycle events published as CloudEvents.
//!
//! Callers hand events to [`EventEmitter::emit`], which only enqueues. A
//! background task drains the queue into an [`EventSink`]; publish failures
//! are logged and dropped, never reported to the request that caused them.

use super::BatchReport;
use crate::db::IdentityStore;
use crate::error::AppError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gcloud_sdk::google::pubsub::v1::publisher_client::PublisherClient;
use gcloud_sdk::google::pubsub::v1::{PublishRequest, PubsubMessage};
use gcloud_sdk::{GoogleApi, GoogleAuthMiddleware};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

pub const USER_CREATED_EVENT: &str = "com.users.user.created";
pub const REFERRAL_COMPLETED_EVENT: &str = "com.users.referral.completed";
pub const CLOUDEVENTS_SPEC_VERSION: &str = "1.0";

const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// CloudEvents 1.0 envelope (JSON structured mode).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent<T = serde_json::Value> {
    pub id: String,
    pub source: String,
    pub specversion: String,
    #[serde(default)]
    pub subject: String,
    pub time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: T,
}

/// Payload of `com.users.user.created`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCreatedData {
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub method: String,
}

/// Payload of `com.users.referral.completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralCompletedData {
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub referring_user_id: String,
}

/// A state transition other systems observe.
#[derive(Debug, Clone, PartialEq)]
pub enum UserEvent {
    Created(UserCreatedData),
    ReferralCompleted(ReferralCompletedData),
}

impl UserEvent {
    /// Wrap in an envelope with a fresh id.
    pub fn into_envelope(self, source: &str) -> Result<CloudEvent, AppError> {
        let (event_type, subject, time, data) = match self {
            UserEvent::Created(data) => (
                USER_CREATED_EVENT,
                data.user_id.clone(),
                data.timestamp,
                serde_json::to_value(data),
            ),
            UserEvent::ReferralCompleted(data) => (
                REFERRAL_COMPLETED_EVENT,
                data.user_id.clone(),
                data.timestamp,
                serde_json::to_value(data),
            ),
        };

        Ok(CloudEvent {
            id: uuid::Uuid::new_v4().to_string(),
            source: source.to_string(),
            specversion: CLOUDEVENTS_SPEC_VERSION.to_string(),
            subject,
            time,
            event_type: event_type.to_string(),
            data: data.map_err(|e| AppError::Internal(anyhow::anyhow!("JSON error: {}", e)))?,
        })
    }
}

/// Destination for serialized events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &CloudEvent) -> Result<(), AppError>;
}

// ─── Pub/Sub ─────────────────────────────────────────────────

/// Publishes events to a single Pub/Sub topic.
pub struct PubSubSink {
    client: GoogleApi<PublisherClient<GoogleAuthMiddleware>>,
    topic: String,
}

impl PubSubSink {
    pub async fn new(project_id: &str, topic: &str) -> Result<Self, AppError> {
        let client = GoogleApi::from_function(
            PublisherClient::new,
            "https://pubsub.googleapis.com",
            None,
        )
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Pub/Sub client error: {}", e)))?;

        let topic = format!("projects/{}/topics/{}", project_id, topic);
        tracing::info!(topic = %topic, "Pub/Sub event sink initialized");

        Ok(Self { client, topic })
    }
}

#[async_trait]
impl EventSink for PubSubSink {
    async fn publish(&self, event: &CloudEvent) -> Result<(), AppError> {
        let data = serde_json::to_vec(event)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("JSON error: {}", e)))?;

        let message = PubsubMessage {
            data,
            attributes: std::collections::HashMap::from([
                ("ce-type".to_string(), event.event_type.clone()),
                ("ce-id".to_string(), event.id.clone()),
                (
                    "content-type".to_string(),
                    "application/cloudevents+json".to_string(),
                ),
            ]),
            ..Default::default()
        };

        self.client
            .get()
            .publish(PublishRequest {
                topic: self.topic.clone(),
                messages: vec![message],
            })
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Pub/Sub publish failed: {}", e)))?;

        Ok(())
    }
}

// ─── Offline sinks ───────────────────────────────────────────

/// Keeps published events in memory (tests, local development).
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<CloudEvent>>,
    fail: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every publish fail until reset.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<CloudEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<CloudEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    /// Poll until at least `count` events arrived or `timeout` elapsed.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<CloudEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let events = self.events();
            if events.len() >= count || tokio::time::Instant::now() >= deadline {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, event: &CloudEvent) -> Result<(), AppError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::Internal(anyhow::anyhow!("recording sink failure")));
        }
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }
}

// ─── Emitter ─────────────────────────────────────────────────

/// Non-blocking handle for publishing lifecycle events.
#[derive(Clone)]
pub struct EventEmitter {
    tx: mpsc::Sender<CloudEvent>,
    /// Accepted events not yet handed to the sink.
    pending: Arc<AtomicUsize>,
    source: String,
}

/// Owns the background publisher so shutdown can drain its queue.
pub struct PublisherHandle {
    stop: Arc<Notify>,
    pending: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl EventEmitter {
    /// Start the background publisher.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(sink: Arc<dyn EventSink>, source: impl Into<String>) -> (Self, PublisherHandle) {
        Self::spawn_with_capacity(sink, source, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn spawn_with_capacity(
        sink: Arc<dyn EventSink>,
        source: impl Into<String>,
        capacity: usize,
    ) -> (Self, PublisherHandle) {
        let (tx, rx) = mpsc::channel(capacity);
        let stop = Arc::new(Notify::new());
        let pending = Arc::new(AtomicUsize::new(0));
        let task = tokio::spawn(run_publisher(sink, rx, stop.clone(), pending.clone()));

        let emitter = Self {
            tx,
            pending: pending.clone(),
            source: source.into(),
        };
        (emitter, PublisherHandle { stop, pending, task })
    }

    /// Queue an event for publishing. Never fails and never waits.
    pub fn emit(&self, event: UserEvent) {
        let envelope = match event.into_envelope(&self.source) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(error = %e, "Failed to build event envelope");
                return;
            }
        };

        // Counted before sending so the publisher never sees it go negative.
        self.pending.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.tx.try_send(envelope) {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            let (reason, dropped) = match e {
                mpsc::error::TrySendError::Full(ev) => ("queue full", ev),
                mpsc::error::TrySendError::Closed(ev) => ("publisher stopped", ev),
            };
            tracing::warn!(
                event_id = %dropped.id,
                event_type = %dropped.event_type,
                subject = %dropped.subject,
                reason,
                "Dropping event"
            );
        }
    }
}

impl PublisherHandle {
    /// Stop accepting events and wait up to `timeout` for the queue to drain.
    ///
    /// Returns how many accepted events were left undelivered.
    pub async fn shutdown(self, timeout: Duration) -> usize {
        let Self { stop, pending, task } = self;
        stop.notify_one();
        tracing::info!(queued = pending.load(Ordering::SeqCst), "Draining event queue");

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(())) => {
                tracing::info!("Event queue drained");
                0
            }
            Ok(Err(e)) => {
                let undelivered = pending.load(Ordering::SeqCst);
                tracing::error!(error = %e, undelivered, "Event publisher task failed");
                undelivered
            }
            Err(_) => {
                let undelivered = pending.load(Ordering::SeqCst);
                tracing::error!(
                    undelivered,
                    timeout_secs = timeout.as_secs_f64(),
                    "Event queue not drained before shutdown deadline"
                );
                undelivered
            }
        }
    }
}

async fn run_publisher(
    sink: Arc<dyn EventSink>,
    mut rx: mpsc::Receiver<CloudEvent>,
    stop: Arc<Notify>,
    pending: Arc<AtomicUsize>,
) {
    let mut stopping = false;
    loop {
        let next = tokio::select! {
            biased;
            _ = stop.notified(), if !stopping => {
                // Refuse new events; whatever is already queued still drains.
                stopping = true;
                rx.close();
                continue;
            }
            next = rx.recv() => next,
        };
        let Some(event) = next else { break };

        match sink.publish(&event).await {
            Ok(()) => tracing::debug!(
                event_id = %event.id,
                event_type = %event.event_type,
                subject = %event.subject,
                "Event published"
            ),
            Err(e) => tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                subject = %event.subject,
                error = %e,
                "Failed to publish event"
            ),
        }
        pending.fetch_sub(1, Ordering::SeqCst);
    }
    tracing::debug!("Event publisher stopped");
}

// ─── Backfill ────────────────────────────────────────────────

/// Re-publish creation events for every user and completion events for
/// every referral, awaiting each publish so the tally is exact.
///
/// `stop` is checked between rows.
pub async fn backfill_events(
    store: &dyn IdentityStore,
    sink: &dyn EventSink,
    source: &str,
    stop: &AtomicBool,
) -> Result<BatchReport, AppError> {
    let mut report = BatchReport::default();

    let users = store.list_all_users().await?;
    let referrals = store.list_all_referrals().await?;
    tracing::info!(
        users = users.len(),
        referrals = referrals.len(),
        "Starting event backfill"
    );

    let events = users
        .into_iter()
        .map(|u| {
            UserEvent::Created(UserCreatedData {
                timestamp: u.created_at,
                user_id: u.id,
                method: "backfill".to_string(),
            })
        })
        .chain(referrals.into_iter().map(|r| {
            UserEvent::ReferralCompleted(ReferralCompletedData {
                timestamp: r.created_at,
                user_id: r.referred_user_id,
                referring_user_id: r.referrer_user_id,
            })
        }));

    for event in events {
        if stop.load(Ordering::SeqCst) {
            report.interrupted = true;
            tracing::warn!("Event backfill interrupted");
            break;
        }

        let result = match event.into_envelope(source) {
            Ok(envelope) => sink.publish(&envelope).await.map(|_| envelope),
            Err(e) => Err(e),
        };
        match result {
            Ok(envelope) => {
                report.succeeded += 1;
                tracing::debug!(subject = %envelope.subject, event_type = %envelope.event_type, "Backfilled event");
            }
            Err(e) => {
                report.failed += 1;
                tracing::warn!(error = %e, "Failed to backfill event");
            }
        }
    }

    tracing::info!(
        succeeded = report.succeeded,
        failed = report.failed,
        interrupted = report.interrupted,
        "Event backfill finished"
    );
    Ok(report)
}
