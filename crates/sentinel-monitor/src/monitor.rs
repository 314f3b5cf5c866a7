//! Redis ingestion loop.
//!
//! Each inbound message is handled on its own task, so the matcher and the
//! cluster detector run concurrently. Malformed payloads are dropped with a
//! warning; transient store failures are retried with backoff.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use admission::{SentinelEngine, Signal};
use anyhow::Result;
use chrono::Utc;
use futures_util::StreamExt;
use risk_manager::TripReason;
use rust_decimal::Decimal;
use sentinel_core::types::{TradeEvent, TransferEvent, WithdrawalEvent};
use serde::Deserialize;
use signal_attribution::TradeCompletion;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::publisher::{channels, SignalPublisher};

const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF_MS: u64 = 200;
const MAINTENANCE_INTERVAL_SECS: u64 = 30;

/// A decoded inbound message.
#[derive(Debug)]
pub enum Inbound {
    Transfer(TransferEvent),
    Withdrawal(WithdrawalEvent),
    Trade(TradeEvent),
    TradeCompleted(TradeCompletion),
    PositionOpened(Decimal),
}

#[derive(Deserialize)]
struct PositionOpened {
    size: Decimal,
}

/// Decode a payload by the channel it arrived on.
pub fn decode(channel: &str, payload: &str) -> std::result::Result<Inbound, String> {
    let decoded = match channel {
        channels::TRANSFERS => serde_json::from_str(payload).map(Inbound::Transfer),
        channels::WITHDRAWALS => serde_json::from_str(payload).map(Inbound::Withdrawal),
        channels::TRADES => serde_json::from_str(payload).map(Inbound::Trade),
        channels::TRADE_COMPLETED => serde_json::from_str(payload).map(Inbound::TradeCompleted),
        channels::POSITION_OPENED => serde_json::from_str::<PositionOpened>(payload)
            .map(|p| Inbound::PositionOpened(p.size)),
        other => return Err(format!("unexpected channel {other}")),
    };
    decoded.map_err(|e| e.to_string())
}

pub struct SentinelMonitor {
    engine: Arc<SentinelEngine>,
    publisher: Arc<SignalPublisher>,
    redis_url: String,
}

impl SentinelMonitor {
    pub fn new(engine: Arc<SentinelEngine>, publisher: Arc<SignalPublisher>, redis_url: String) -> Self {
        Self {
            engine,
            publisher,
            redis_url,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let mut inbound = spawn_listener(self.redis_url.clone());
        let mut maintenance = tokio::time::interval(StdDuration::from_secs(MAINTENANCE_INTERVAL_SECS));
        let mut handled = 0u64;

        info!("Sentinel monitor running");

        loop {
            tokio::select! {
                _ = maintenance.tick() => {
                    self.maintain().await;
                    crate::touch_health_file();
                }
                message = inbound.recv() => {
                    let Some((channel, payload)) = message else {
                        warn!("Inbound channel closed, stopping monitor");
                        return Ok(());
                    };
                    match decode(&channel, &payload) {
                        Ok(event) => {
                            let engine = self.engine.clone();
                            let publisher = self.publisher.clone();
                            tokio::spawn(async move {
                                handle(engine, publisher, event).await;
                            });
                        }
                        Err(e) => warn!(channel = %channel, error = %e, "Dropping malformed payload"),
                    }
                    handled += 1;
                    if handled % 10_000 == 0 {
                        info!(messages = handled, "Sentinel monitor processed messages");
                    }
                }
            }
        }
    }

    async fn maintain(&self) {
        match self.engine.run_maintenance(Utc::now()).await {
            Ok(report) => {
                if report.day_rolled {
                    info!("New trading day started");
                }
                if let Some(outcome) = report.reset {
                    info!(outcome = ?outcome, "Scheduled breaker reset attempted");
                }
                if report.unsynced_edges > 0 {
                    warn!(edges = report.unsynced_edges, "Correlation edges not yet persisted");
                }
                for alert in &report.cluster_alerts {
                    evaluate_and_publish(&self.engine, &self.publisher, Signal::Cabal(alert.clone())).await;
                }
            }
            Err(e) => error!(error = %e, "Maintenance pass failed"),
        }

        let snapshot = self.engine.breaker_status().await;
        if let Err(e) = self.publisher.store_breaker_status(&snapshot).await {
            warn!(error = %e, "Failed to cache breaker status");
        }
    }
}

async fn handle(engine: Arc<SentinelEngine>, publisher: Arc<SignalPublisher>, event: Inbound) {
    match event {
        Inbound::Transfer(transfer) => {
            let matches = with_retry("transfer", || engine.ingest_transfer(&transfer)).await;
            for m in matches.unwrap_or_default() {
                evaluate_and_publish(&engine, &publisher, Signal::FreshWallet(m)).await;
            }
        }
        Inbound::Withdrawal(withdrawal) => {
            let matches = with_retry("withdrawal", || engine.ingest_withdrawal(&withdrawal)).await;
            for m in matches.unwrap_or_default() {
                evaluate_and_publish(&engine, &publisher, Signal::FreshWallet(m)).await;
            }
        }
        Inbound::Trade(trade) => {
            let alerts = with_retry("trade", || engine.ingest_trade(&trade)).await;
            for alert in alerts.unwrap_or_default() {
                evaluate_and_publish(&engine, &publisher, Signal::Cabal(alert)).await;
            }
        }
        Inbound::TradeCompleted(completion) => {
            engine.notify_trade_completed(completion);
        }
        Inbound::PositionOpened(size) => {
            open_position(&engine, size).await;
        }
    }
}

/// Account for an opened position; returns the trip it caused.
async fn open_position(engine: &SentinelEngine, size: Decimal) -> Option<TripReason> {
    let tripped = with_retry("position_opened", || engine.notify_position_opened(size))
        .await
        .flatten();
    if let Some(reason) = tripped {
        warn!(size = %size, reason = reason.as_str(), "Position opening tripped the breaker");
    }
    tripped
}

async fn evaluate_and_publish(engine: &SentinelEngine, publisher: &SignalPublisher, signal: Signal) {
    let decision = engine.evaluate(&signal);
    if let Err(e) = publisher.publish_decision(&decision).await {
        error!(source_id = %decision.source_id, error = %e, "Failed to publish decision");
    }
}

/// Run `op`, retrying transient failures with exponential backoff.
/// Invalid events are dropped; other failures are logged.
async fn with_retry<T, F, Fut>(what: &str, op: F) -> Option<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = sentinel_core::Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Some(value),
            Err(sentinel_core::Error::InvalidEvent(reason)) => {
                warn!(event = what, reason = %reason, "Dropping invalid event");
                return None;
            }
            Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                let backoff = BASE_BACKOFF_MS * 2u64.pow(attempt - 1);
                warn!(event = what, attempt, backoff_ms = backoff, error = %e, "Transient failure, retrying");
                tokio::time::sleep(StdDuration::from_millis(backoff)).await;
            }
            Err(e) => {
                error!(event = what, attempt, error = %e, "Failed to process event");
                return None;
            }
        }
    }
}

fn spawn_listener(redis_url: String) -> mpsc::Receiver<(String, String)> {
    let (tx, rx) = mpsc::channel(10_000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = run_listener_once(&redis_url, &tx).await {
                warn!(error = %e, "Redis listener failed; reconnecting");
            }
            if tx.is_closed() {
                break;
            }
            tokio::time::sleep(StdDuration::from_secs(5)).await;
        }
    });

    rx
}

async fn run_listener_once(redis_url: &str, tx: &mpsc::Sender<(String, String)>) -> Result<()> {
    let client = redis::Client::open(redis_url)?;
    let mut pubsub = client.get_async_pubsub().await?;
    for channel in channels::INBOUND {
        pubsub.subscribe(channel).await?;
    }
    info!(channels = ?channels::INBOUND, "Subscribed to event channels");

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let payload: String = match msg.get_payload() {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Invalid payload encoding");
                continue;
            }
        };
        let channel = msg.get_channel_name().to_string();
        debug!(channel = %channel, "Received event");
        if tx.send((channel, payload)).await.is_err() {
            break;
        }
    }

    Ok(())
}
