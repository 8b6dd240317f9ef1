// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Users API server and administrative batch tools.

use clap::{Parser, Subcommand};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use users_api::{
    config::Config,
    db::{FirestoreDb, IdentityStore},
    services::{
        events::backfill_events, BatchReport, EthRpcClient, EventEmitter, HttpMailer,
        OidcVerifier, ProfileService, PubSubSink,
    },
    time_utils::SystemClock,
    AppState,
};

#[derive(Parser)]
#[command(name = "users-api", version, about = "User accounts, verification and referrals")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Assign referral codes to users that have none
    BackfillReferralCodes,
    /// Re-publish creation and referral events for every stored record
    BackfillEvents,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured JSON logging for GCP
    init_logging();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let store: Arc<dyn IdentityStore> = Arc::new(FirestoreDb::new(&config.gcp_project_id).await?);
    let sink = Arc::new(PubSubSink::new(&config.gcp_project_id, &config.events_topic).await?);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, store, sink).await,
        Command::BackfillReferralCodes => {
            let (events, publisher) = EventEmitter::spawn(sink, config.events_source.clone());
            let profiles = build_profiles(&config, store, events)?;
            let stop = stop_on_ctrl_c();
            let report = profiles.referrals().backfill_referral_codes(&stop).await?;
            publisher.shutdown(config.event_drain_timeout).await;
            finish_batch("backfill-referral-codes", &report)
        }
        Command::BackfillEvents => {
            let stop = stop_on_ctrl_c();
            let report =
                backfill_events(store.as_ref(), sink.as_ref(), &config.events_source, &stop).await?;
            finish_batch("backfill-events", &report)
        }
    }
}

fn build_profiles(
    config: &Config,
    store: Arc<dyn IdentityStore>,
    events: EventEmitter,
) -> anyhow::Result<ProfileService> {
    let ethereum = Arc::new(EthRpcClient::new(
        &config.ethereum_rpc_url,
        config.token_contracts.clone(),
    )?);
    let mailer = Arc::new(HttpMailer::new(
        &config.email_api_url,
        &config.email_api_key,
        &config.email_from,
        &config.app_name,
    )?);

    Ok(ProfileService::new(
        store,
        mailer,
        ethereum.clone(),
        ethereum,
        events,
        Arc::new(SystemClock),
        &config.app_name,
    ))
}

async fn serve(
    config: Config,
    store: Arc<dyn IdentityStore>,
    sink: Arc<PubSubSink>,
) -> anyhow::Result<()> {
    tracing::info!(port = config.port, "Starting Users API");

    let (events, publisher) = EventEmitter::spawn(sink, config.events_source.clone());
    let profiles = build_profiles(&config, store, events)?;
    let user_verifier =
        OidcVerifier::for_issuer(&config.identity_issuer_url, &config.identity_audience)?;
    let service_verifier = OidcVerifier::google(&config.api_url)?;

    let state = Arc::new(AppState {
        config: config.clone(),
        profiles,
        user_verifier,
        service_verifier,
    });

    let app = users_api::routes::create_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutting down");
        })
        .await?;

    publisher.shutdown(config.event_drain_timeout).await;
    Ok(())
}

/// Flag set on Ctrl-C; batch tools check it between rows.
fn stop_on_ctrl_c() -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received; stopping after the current row");
            flag.store(true, Ordering::SeqCst);
        }
    });
    stop
}

fn finish_batch(name: &str, report: &BatchReport) -> anyhow::Result<()> {
    tracing::info!(
        job = name,
        succeeded = report.succeeded,
        failed = report.failed,
        interrupted = report.interrupted,
        "Batch finished"
    );
    if report.is_complete_success() {
        Ok(())
    } else {
        anyhow::bail!(
            "{name}: {} succeeded, {} failed{}",
            report.succeeded,
            report.failed,
            if report.interrupted { " (interrupted)" } else { "" }
        )
    }
}

/// Initialize structured JSON logging (GCP-compliant).
fn init_logging() {
    let format = tracing_subscriber::fmt::layer()
        .json()
        .with_target(false)
        .with_current_span(true)
        .flatten_event(true);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("users_api=debug,info"));

    tracing_subscriber::registry().with(filter).with(format).init();
}
