//! Windowed event store backing the correlation detectors.
//!
//! Detectors keep private in-memory indices for speed, but everything they
//! hold can be rebuilt from a `CorrelationStore` after a restart.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgCorrelationStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{
    Cluster, CorrelationEdge, FreshWalletMatch, TradeEvent, TransferEvent, WalletNode,
    WithdrawalEvent,
};
use crate::Result;

/// Range query over stored transfers. Both bounds are inclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub min_amount: Decimal,
    pub max_amount: Decimal,
}

impl TransferWindow {
    pub fn contains(&self, event: &TransferEvent) -> bool {
        event.time >= self.from
            && event.time <= self.to
            && event.amount >= self.min_amount
            && event.amount <= self.max_amount
    }
}

/// Relationship mirrored into the traversal graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GraphLink {
    /// Fresh wallet funded by an exchange or an earlier fresh wallet.
    FundedBy {
        wallet: String,
        funder: String,
        tx: String,
        score: f64,
    },
    CorrelatedWith {
        wallet_a: String,
        wallet_b: String,
        score: f64,
    },
    MemberOf {
        wallet: String,
        cluster_id: Uuid,
    },
}

impl GraphLink {
    pub fn kind(&self) -> &'static str {
        match self {
            GraphLink::FundedBy { .. } => "FUNDED_BY",
            GraphLink::CorrelatedWith { .. } => "CORRELATED_WITH",
            GraphLink::MemberOf { .. } => "MEMBER_OF",
        }
    }
}

/// Persistence seam for events, matches, the wallet registry and the
/// correlation graph.
///
/// Event inserts are idempotent on the event's dedup key and report whether
/// the event was new. Any failure to reach the backing store is
/// `Error::StoreUnavailable`; an empty result is never an error.
#[async_trait]
pub trait CorrelationStore: Send + Sync {
    async fn insert_transfer(&self, event: &TransferEvent) -> Result<bool>;

    async fn insert_withdrawal(&self, event: &WithdrawalEvent) -> Result<bool>;

    async fn insert_trade(&self, event: &TradeEvent) -> Result<bool>;

    async fn transfers_in_window(&self, window: &TransferWindow) -> Result<Vec<TransferEvent>>;

    /// Withdrawals at or after `since`, oldest first.
    async fn withdrawals_since(&self, since: DateTime<Utc>) -> Result<Vec<WithdrawalEvent>>;

    /// Trades of `token` with `from <= time <= to`.
    async fn trades_for_token(
        &self,
        token: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TradeEvent>>;

    /// Trades at or after `since`, oldest first.
    async fn trades_since(&self, since: DateTime<Utc>) -> Result<Vec<TradeEvent>>;

    /// Persist a match. Returns false if this exact withdrawal/transfer pair
    /// was already recorded.
    async fn record_match(&self, record: &FreshWalletMatch) -> Result<bool>;

    async fn matches_for_wallet(&self, wallet: &str) -> Result<Vec<FreshWalletMatch>>;

    async fn upsert_wallet(&self, node: &WalletNode) -> Result<()>;

    async fn get_wallet(&self, address: &str) -> Result<Option<WalletNode>>;

    async fn upsert_edge(&self, edge: &CorrelationEdge) -> Result<()>;

    async fn load_edges(&self) -> Result<Vec<CorrelationEdge>>;

    /// Insert or replace a cluster and its membership.
    async fn upsert_cluster(&self, cluster: &Cluster) -> Result<()>;

    /// Delete a dissolved cluster and its membership links.
    async fn remove_cluster(&self, cluster_id: Uuid) -> Result<()>;

    async fn load_clusters(&self) -> Result<Vec<Cluster>>;

    async fn mirror_link(&self, link: &GraphLink) -> Result<()>;
}
