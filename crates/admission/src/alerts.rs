//! Operational alerts: cluster alerts, high-confidence matches, breaker trips.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use risk_manager::TripReason;
use sentinel_core::types::{ClusterAlert, FreshWalletMatch};
use sentinel_core::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Alert {
    Cabal(ClusterAlert),
    FreshWallet(FreshWalletMatch),
    BreakerTripped {
        reason: TripReason,
        locked_at: DateTime<Utc>,
        unlock_at: Option<DateTime<Utc>>,
    },
}

impl Alert {
    /// One-line human-readable summary for chat webhooks.
    pub fn message(&self) -> String {
        match self {
            Alert::Cabal(a) => format!(
                "Cabal detected: {} wallets, score {:.2}, {} shared tokens (cluster {})",
                a.members.len(),
                a.aggregate_score,
                a.shared_contract_count,
                a.cluster_id
            ),
            Alert::FreshWallet(m) => format!(
                "Fresh wallet {} funded from {} ({} in {}ms, score {:.2})",
                m.target_wallet, m.source_exchange, m.amount, m.time_delta_ms, m.match_score
            ),
            Alert::BreakerTripped {
                reason, unlock_at, ..
            } => match unlock_at {
                Some(at) => format!(
                    "CIRCUIT BREAKER TRIPPED ({}), locked until {}",
                    reason.as_str(),
                    at.format("%Y-%m-%d %H:%M UTC")
                ),
                None => format!("CIRCUIT BREAKER TRIPPED ({})", reason.as_str()),
            },
        }
    }
}

/// Destination for operational alerts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn publish(&self, alert: &Alert) -> Result<()>;
}

/// Sink that keeps alerts in memory.
#[derive(Default)]
pub struct MemoryAlertSink {
    alerts: RwLock<Vec<Alert>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.alerts.read().await.clone()
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn publish(&self, alert: &Alert) -> Result<()> {
        self.alerts.write().await.push(alert.clone());
        Ok(())
    }
}
