//! Publishing decisions and alerts to Redis and chat webhooks.

use admission::{Alert, AlertSink, Decision};
use anyhow::Result;
use async_trait::async_trait;
use redis::AsyncCommands;
use sentinel_core::config::AlertsConfig;
use tracing::{debug, warn};

/// Redis channels for pub/sub.
pub mod channels {
    pub const TRANSFERS: &str = "sentinel:transfers";
    pub const WITHDRAWALS: &str = "sentinel:withdrawals";
    pub const TRADES: &str = "sentinel:trades";
    pub const TRADE_COMPLETED: &str = "sentinel:trade_completed";
    pub const POSITION_OPENED: &str = "sentinel:position_opened";
    pub const DECISIONS: &str = "sentinel:decisions";
    pub const ALERTS: &str = "sentinel:alerts";
    pub const BREAKER_STATUS_LATEST: &str = "sentinel:breaker:latest";

    pub const INBOUND: [&str; 5] = [
        TRANSFERS,
        WITHDRAWALS,
        TRADES,
        TRADE_COMPLETED,
        POSITION_OPENED,
    ];
}

/// Publishes decisions and alerts to Redis and configured webhooks.
pub struct SignalPublisher {
    redis: redis::aio::ConnectionManager,
    alerts_config: AlertsConfig,
    http_client: reqwest::Client,
}

impl SignalPublisher {
    pub async fn new(redis_client: redis::Client, alerts_config: AlertsConfig) -> Result<Self> {
        let redis = redis::aio::ConnectionManager::new(redis_client).await?;
        Ok(Self {
            redis,
            alerts_config,
            http_client: reqwest::Client::new(),
        })
    }

    /// Publish an admission decision for the execution layer.
    pub async fn publish_decision(&self, decision: &Decision) -> Result<()> {
        let payload = serde_json::to_string(decision)?;
        let mut conn = self.redis.clone();
        let _: () = conn.publish(channels::DECISIONS, payload).await?;
        debug!(
            source_id = %decision.source_id,
            approve = decision.approve,
            "Published decision"
        );
        Ok(())
    }

    /// Cache the latest breaker snapshot for dashboards.
    pub async fn store_breaker_status(&self, snapshot: &risk_manager::BreakerSnapshot) -> Result<()> {
        let payload = serde_json::to_string(snapshot)?;
        let mut conn = self.redis.clone();
        let _: () = conn.set(channels::BREAKER_STATUS_LATEST, payload).await?;
        Ok(())
    }

    async fn publish_alert(&self, alert: &Alert) -> Result<()> {
        let payload = serde_json::to_string(alert)?;
        let mut conn = self.redis.clone();
        let _: () = conn.publish(channels::ALERTS, payload).await?;
        self.send_webhooks(&alert.message()).await;
        Ok(())
    }

    async fn send_webhooks(&self, message: &str) {
        if let Some((token, chat_id)) = self.alerts_config.telegram() {
            if let Err(e) = self.send_telegram(token, chat_id, message).await {
                warn!("Failed to send Telegram alert: {}", e);
            }
        }

        if let Some(webhook_url) = &self.alerts_config.discord_webhook_url {
            if let Err(e) = self.send_discord(webhook_url, message).await {
                warn!("Failed to send Discord alert: {}", e);
            }
        }
    }

    async fn send_telegram(&self, token: &str, chat_id: &str, message: &str) -> Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", token);
        self.http_client
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": chat_id,
                "text": message,
            }))
            .send()
            .await?
            .error_for_status()?;
        debug!("Sent Telegram alert");
        Ok(())
    }

    async fn send_discord(&self, webhook_url: &str, message: &str) -> Result<()> {
        self.http_client
            .post(webhook_url)
            .json(&serde_json::json!({ "content": message }))
            .send()
            .await?
            .error_for_status()?;
        debug!("Sent Discord alert");
        Ok(())
    }
}

#[async_trait]
impl AlertSink for SignalPublisher {
    async fn publish(&self, alert: &Alert) -> sentinel_core::Result<()> {
        self.publish_alert(alert)
            .await
            .map_err(|e| sentinel_core::Error::store(format!("alert publish failed: {e}")))
    }
}
