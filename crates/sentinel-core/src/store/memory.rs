//! In-memory store used in tests, benches and single-process deployments.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::{CorrelationStore, GraphLink, TransferWindow};
use crate::types::{
    Cluster, CorrelationEdge, DedupKey, EdgeKey, FreshWalletMatch, TradeEvent, TransferEvent,
    WalletNode, WithdrawalEvent,
};
use crate::{Error, Result};

#[derive(Default)]
struct Inner {
    transfers: Vec<TransferEvent>,
    transfer_keys: HashSet<DedupKey>,
    withdrawals: Vec<WithdrawalEvent>,
    withdrawal_keys: HashSet<DedupKey>,
    trades: Vec<TradeEvent>,
    trade_keys: HashSet<DedupKey>,
    matches: Vec<FreshWalletMatch>,
    match_keys: HashSet<(String, String, String)>,
    wallets: HashMap<String, WalletNode>,
    edges: HashMap<EdgeKey, CorrelationEdge>,
    clusters: HashMap<Uuid, Cluster>,
    links: Vec<GraphLink>,
}

/// `CorrelationStore` held entirely in process memory.
///
/// [`MemoryStore::set_available`] simulates an outage: while unavailable
/// every call fails with `Error::StoreUnavailable`.
/// [`MemoryStore::fail_next`] fails the next calls of one operation.
pub struct MemoryStore {
    inner: RwLock<Inner>,
    available: AtomicBool,
    injected: Mutex<HashMap<&'static str, u32>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            available: AtomicBool::new(true),
            injected: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make the next `calls` calls of `op` (a `CorrelationStore` method
    /// name) fail with `Error::StoreUnavailable`.
    pub async fn fail_next(&self, op: &'static str, calls: u32) {
        if calls == 0 {
            return;
        }
        *self.injected.lock().await.entry(op).or_insert(0) += calls;
    }

    async fn check(&self, op: &'static str) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::store("memory store marked unavailable"));
        }
        let mut injected = self.injected.lock().await;
        if let Some(remaining) = injected.get_mut(op) {
            *remaining -= 1;
            if *remaining == 0 {
                injected.remove(op);
            }
            return Err(Error::store(format!("injected failure in {op}")));
        }
        Ok(())
    }

    /// Every mirrored graph link, in write order.
    pub async fn links(&self) -> Vec<GraphLink> {
        self.inner.read().await.links.clone()
    }

    pub async fn match_count(&self) -> usize {
        self.inner.read().await.matches.len()
    }

    pub async fn trade_count(&self) -> usize {
        self.inner.read().await.trades.len()
    }
}

#[async_trait]
impl CorrelationStore for MemoryStore {
    async fn insert_transfer(&self, event: &TransferEvent) -> Result<bool> {
        self.check("insert_transfer").await?;
        let mut inner = self.inner.write().await;
        if !inner.transfer_keys.insert(event.dedup_key()) {
            return Ok(false);
        }
        inner.transfers.push(event.clone());
        Ok(true)
    }

    async fn insert_withdrawal(&self, event: &WithdrawalEvent) -> Result<bool> {
        self.check("insert_withdrawal").await?;
        let mut inner = self.inner.write().await;
        if !inner.withdrawal_keys.insert(event.dedup_key()) {
            return Ok(false);
        }
        inner.withdrawals.push(event.clone());
        Ok(true)
    }

    async fn insert_trade(&self, event: &TradeEvent) -> Result<bool> {
        self.check("insert_trade").await?;
        let mut inner = self.inner.write().await;
        if !inner.trade_keys.insert(event.dedup_key()) {
            return Ok(false);
        }
        inner.trades.push(event.clone());
        Ok(true)
    }

    async fn transfers_in_window(&self, window: &TransferWindow) -> Result<Vec<TransferEvent>> {
        self.check("transfers_in_window").await?;
        let inner = self.inner.read().await;
        Ok(inner
            .transfers
            .iter()
            .filter(|t| window.contains(t))
            .cloned()
            .collect())
    }

    async fn withdrawals_since(&self, since: DateTime<Utc>) -> Result<Vec<WithdrawalEvent>> {
        self.check("withdrawals_since").await?;
        let inner = self.inner.read().await;
        let mut out: Vec<_> = inner
            .withdrawals
            .iter()
            .filter(|w| w.time >= since)
            .cloned()
            .collect();
        out.sort_by_key(|w| w.time);
        Ok(out)
    }

    async fn trades_for_token(
        &self,
        token: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TradeEvent>> {
        self.check("trades_for_token").await?;
        let inner = self.inner.read().await;
        Ok(inner
            .trades
            .iter()
            .filter(|t| t.token == token && t.time >= from && t.time <= to)
            .cloned()
            .collect())
    }

    async fn trades_since(&self, since: DateTime<Utc>) -> Result<Vec<TradeEvent>> {
        self.check("trades_since").await?;
        let inner = self.inner.read().await;
        let mut out: Vec<_> = inner
            .trades
            .iter()
            .filter(|t| t.time >= since)
            .cloned()
            .collect();
        out.sort_by_key(|t| t.time);
        Ok(out)
    }

    async fn record_match(&self, record: &FreshWalletMatch) -> Result<bool> {
        self.check("record_match").await?;
        let mut inner = self.inner.write().await;
        let key = (
            record.withdrawal_ref.clone(),
            record.transfer_tx.clone(),
            record.target_wallet.clone(),
        );
        if !inner.match_keys.insert(key) {
            return Ok(false);
        }
        inner.matches.push(record.clone());
        Ok(true)
    }

    async fn matches_for_wallet(&self, wallet: &str) -> Result<Vec<FreshWalletMatch>> {
        self.check("matches_for_wallet").await?;
        let inner = self.inner.read().await;
        Ok(inner
            .matches
            .iter()
            .filter(|m| m.target_wallet == wallet)
            .cloned()
            .collect())
    }

    async fn upsert_wallet(&self, node: &WalletNode) -> Result<()> {
        self.check("upsert_wallet").await?;
        let mut inner = self.inner.write().await;
        let entry = inner
            .wallets
            .entry(node.address.clone())
            .or_insert_with(|| node.clone());
        entry.category = node.category;
        entry.confidence = node.confidence;
        entry.first_seen = entry.first_seen.min(node.first_seen);
        Ok(())
    }

    async fn get_wallet(&self, address: &str) -> Result<Option<WalletNode>> {
        self.check("get_wallet").await?;
        Ok(self.inner.read().await.wallets.get(address).cloned())
    }

    async fn upsert_edge(&self, edge: &CorrelationEdge) -> Result<()> {
        self.check("upsert_edge").await?;
        let mut inner = self.inner.write().await;
        inner.edges.insert(edge.key(), edge.clone());
        Ok(())
    }

    async fn load_edges(&self) -> Result<Vec<CorrelationEdge>> {
        self.check("load_edges").await?;
        Ok(self.inner.read().await.edges.values().cloned().collect())
    }

    async fn upsert_cluster(&self, cluster: &Cluster) -> Result<()> {
        self.check("upsert_cluster").await?;
        let mut inner = self.inner.write().await;
        inner.clusters.insert(cluster.cluster_id, cluster.clone());
        Ok(())
    }

    async fn remove_cluster(&self, cluster_id: Uuid) -> Result<()> {
        self.check("remove_cluster").await?;
        let mut inner = self.inner.write().await;
        inner.clusters.remove(&cluster_id);
        inner.links.retain(|link| {
            !matches!(link, GraphLink::MemberOf { cluster_id: id, .. } if *id == cluster_id)
        });
        Ok(())
    }

    async fn load_clusters(&self) -> Result<Vec<Cluster>> {
        self.check("load_clusters").await?;
        Ok(self.inner.read().await.clusters.values().cloned().collect())
    }

    async fn mirror_link(&self, link: &GraphLink) -> Result<()> {
        self.check("mirror_link").await?;
        let mut inner = self.inner.write().await;
        if !inner.links.contains(link) {
            inner.links.push(link.clone());
        }
        Ok(())
    }
}
