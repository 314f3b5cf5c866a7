//! Signals emitted by the detectors.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A fresh wallet funded from an exchange withdrawal. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreshWalletMatch {
    pub id: Uuid,
    /// `tx_sig` of the matched withdrawal.
    pub withdrawal_ref: String,
    pub source_exchange: String,
    pub target_wallet: String,
    /// Transaction that funded the target.
    pub transfer_tx: String,
    /// Transfer time minus withdrawal time, in milliseconds.
    pub time_delta_ms: i64,
    pub match_score: f64,
    pub amount: Decimal,
    /// Earlier fresh wallet that funded this one, for layered funding.
    pub linked_parent: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl FreshWalletMatch {
    /// Attribution source for fresh-wallet signals from this exchange.
    pub fn source_id(&self) -> String {
        format!("fresh_wallet:{}", self.source_exchange)
    }
}

/// Raised once each time a cluster crosses the alert threshold upward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterAlert {
    pub alert_id: Uuid,
    pub cluster_id: Uuid,
    pub members: Vec<String>,
    pub aggregate_score: f64,
    pub shared_contract_count: u32,
    pub triggered_at: DateTime<Utc>,
}

impl ClusterAlert {
    pub fn source_id(&self) -> String {
        format!("cabal:{}", self.cluster_id)
    }
}
