//! Coordinated-trading ("cabal") cluster detection.
//!
//! Every trade strengthens the correlation edge between its wallet and each
//! other wallet that traded the same token inside the co-occurrence window.
//! After edges change, a clustering pass takes a snapshot of decayed edge
//! scores, finds connected components over strong edges, and folds
//! qualifying components into clusters. Alerts are edge-triggered on the
//! cluster's aggregate score.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use sentinel_core::config::{require_positive, require_unit};
use sentinel_core::store::{CorrelationStore, GraphLink};
use sentinel_core::types::{
    clamp_unit, Cluster, ClusterAlert, CorrelationEdge, EdgeKey, TradeEvent, WalletCategory,
    WalletNode,
};
use sentinel_core::{Error, Result};

/// Trades older than this many windows behind the newest trade of a token
/// are dropped from the in-memory index.
const RETAINED_WINDOWS: i64 = 8;

const TIE_EPSILON: f64 = 1e-9;

/// Edges decayed below this score are dropped from memory.
const EDGE_EVICTION_SCORE: f64 = 1e-4;

/// Detector thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CabalConfig {
    /// Two trades of the same token correlate when this close in time.
    pub window_ms: u64,
    /// EMA weight of the newest co-occurrence.
    pub alpha: f64,
    /// Minimum decayed edge score to connect two wallets.
    pub edge_threshold: f64,
    /// Minimum average pairwise score for a cluster (and its alert).
    pub cluster_threshold: f64,
    pub min_members: usize,
    /// Edges seen within this long are not decayed.
    pub decay_grace_secs: u64,
    pub half_life_secs: u64,
    /// Cap on co-traders considered for a single trade.
    pub max_peers_per_event: usize,
    /// How far back trades are replayed into the index on restore.
    pub restore_lookback_hours: u64,
}

impl Default for CabalConfig {
    fn default() -> Self {
        Self {
            window_ms: 4_000,
            alpha: 0.3,
            edge_threshold: 0.5,
            cluster_threshold: 0.6,
            min_members: 3,
            decay_grace_secs: 3_600,
            half_life_secs: 1_800,
            max_peers_per_event: 50,
            restore_lookback_hours: 24,
        }
    }
}

impl CabalConfig {
    pub fn validate(&self) -> Result<()> {
        require_positive("cabal.window_ms", self.window_ms as f64)?;
        require_positive("cabal.alpha", self.alpha)?;
        require_unit("cabal.alpha", self.alpha)?;
        require_unit("cabal.edge_threshold", self.edge_threshold)?;
        require_unit("cabal.cluster_threshold", self.cluster_threshold)?;
        require_positive("cabal.half_life_secs", self.half_life_secs as f64)?;
        if self.min_members < 2 {
            return Err(Error::config(format!(
                "cabal.min_members must be at least 2, got {}",
                self.min_members
            )));
        }
        if self.max_peers_per_event == 0 {
            return Err(Error::config("cabal.max_peers_per_event must be positive"));
        }
        Ok(())
    }

    fn window(&self) -> Duration {
        Duration::milliseconds(self.window_ms as i64)
    }

    fn grace(&self) -> Duration {
        Duration::seconds(self.decay_grace_secs as i64)
    }

    fn half_life(&self) -> Duration {
        Duration::seconds(self.half_life_secs as i64)
    }

    /// Co-occurrence strength: 1.0 for simultaneous trades, 0.0 at the
    /// window edge, `None` outside the window.
    pub fn event_score(&self, a: DateTime<Utc>, b: DateTime<Utc>) -> Option<f64> {
        let delta_ms = (a - b).num_milliseconds().unsigned_abs();
        if delta_ms > self.window_ms {
            return None;
        }
        Some(1.0 - delta_ms as f64 / self.window_ms as f64)
    }
}

/// Read-only view of a cluster for operational tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterHealth {
    pub cluster_id: Uuid,
    pub member_count: usize,
    /// Average pairwise score decayed to the snapshot time.
    pub aggregate_score: f64,
    pub shared_contract_count: u32,
    pub alerting: bool,
    pub updated_at: DateTime<Utc>,
    /// Member-pair edges whose latest score has not reached the store.
    pub unsynced_edges: usize,
}

/// Result of an explicit member demotion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Demotion {
    /// Wallet removed; cluster still has two or more members.
    Removed { cluster_id: Uuid },
    /// Removing the wallet would have left fewer than two members.
    Dissolved { cluster_id: Uuid },
}

#[derive(Default)]
struct TokenWindow {
    trades: Vec<TradeEvent>,
    /// Trades before this instant were evicted and live only in the store.
    pruned_before: Option<DateTime<Utc>>,
}

/// Cabal cluster detector.
pub struct CabalDetector {
    config: CabalConfig,
    store: Arc<dyn CorrelationStore>,
    edges: DashMap<EdgeKey, CorrelationEdge>,
    /// Edges whose last write to the store failed.
    unsynced_edges: DashSet<EdgeKey>,
    windows: DashMap<String, TokenWindow>,
    /// Token windows idle before this instant (ms) were dropped.
    windows_dropped_before_ms: AtomicI64,
    /// Latest trade time per token, per wallet.
    wallet_tokens: DashMap<String, HashMap<String, DateTime<Utc>>>,
    clusters: DashMap<Uuid, Arc<Mutex<Cluster>>>,
    wallet_index: DashMap<String, Uuid>,
    pass_guard: Mutex<()>,
    clock_ms: AtomicI64,
    last_prune_ms: AtomicI64,
}

impl CabalDetector {
    pub fn new(store: Arc<dyn CorrelationStore>, config: CabalConfig) -> Self {
        Self {
            config,
            store,
            edges: DashMap::new(),
            unsynced_edges: DashSet::new(),
            windows: DashMap::new(),
            windows_dropped_before_ms: AtomicI64::new(i64::MIN),
            wallet_tokens: DashMap::new(),
            clusters: DashMap::new(),
            wallet_index: DashMap::new(),
            pass_guard: Mutex::new(()),
            clock_ms: AtomicI64::new(0),
            last_prune_ms: AtomicI64::new(i64::MIN),
        }
    }

    pub fn config(&self) -> &CabalConfig {
        &self.config
    }

    /// Ingest one trade.
    ///
    /// Returns the alerts raised by the clustering pass it triggered.
    /// A duplicate delivery changes nothing and returns no alerts. A store
    /// error leaves the trade unrecorded, so a retry applies it in full.
    pub async fn process_trade(&self, trade: &TradeEvent) -> Result<Vec<ClusterAlert>> {
        trade.validate()?;

        // Fallible reads precede the dedup insert.
        let stored = if self.needs_backfill(trade) {
            self.store
                .trades_for_token(
                    &trade.token,
                    trade.time - self.config.window(),
                    trade.time + self.config.window(),
                )
                .await?
        } else {
            Vec::new()
        };

        if !self.store.insert_trade(trade).await? {
            debug!(tx = %trade.tx_hash, wallet = %trade.wallet, "Duplicate trade ignored");
            return Ok(Vec::new());
        }

        self.advance_clock(trade.time);
        self.note_token(trade);

        let mut peers = self.index_trade(trade);
        for other in &stored {
            self.offer_peer(&mut peers, trade, other);
        }

        let updated = self.apply_co_occurrences(trade, peers);
        if updated.is_empty() {
            return Ok(Vec::new());
        }
        self.persist_edges(&updated).await;

        self.run_clustering_at(self.clock()).await
    }

    /// Whether the trade's window reaches back past what the in-memory
    /// index still holds for its token.
    fn needs_backfill(&self, trade: &TradeEvent) -> bool {
        let start = trade.time - self.config.window();
        let pruned = self
            .windows
            .get(&trade.token)
            .and_then(|window| window.pruned_before);
        let dropped_ms = self.windows_dropped_before_ms.load(Ordering::SeqCst);
        let dropped = (dropped_ms != i64::MIN)
            .then(|| Utc.timestamp_millis_opt(dropped_ms).single())
            .flatten();
        pruned.into_iter().chain(dropped).any(|cutoff| start < cutoff)
    }

    fn note_token(&self, trade: &TradeEvent) {
        let mut tokens = self.wallet_tokens.entry(trade.wallet.clone()).or_default();
        let last = tokens.entry(trade.token.clone()).or_insert(trade.time);
        *last = (*last).max(trade.time);
    }

    /// Add the trade to its token's window and collect co-traders.
    fn index_trade(&self, trade: &TradeEvent) -> HashMap<String, f64> {
        let mut peers = HashMap::new();
        let mut window = self.windows.entry(trade.token.clone()).or_default();

        for other in &window.trades {
            self.offer_peer(&mut peers, trade, other);
        }

        window.trades.push(trade.clone());
        let newest = window
            .trades
            .iter()
            .map(|t| t.time)
            .max()
            .unwrap_or(trade.time);
        let cutoff = newest - self.config.window() * RETAINED_WINDOWS as i32;
        let before = window.trades.len();
        window.trades.retain(|t| t.time >= cutoff);
        if window.trades.len() < before {
            window.pruned_before = Some(window.pruned_before.map_or(cutoff, |c| c.max(cutoff)));
        }

        peers
    }

    fn offer_peer(&self, peers: &mut HashMap<String, f64>, trade: &TradeEvent, other: &TradeEvent) {
        if other.wallet == trade.wallet || other.token != trade.token {
            return;
        }
        if let Some(score) = self.config.event_score(trade.time, other.time) {
            let best = peers.entry(other.wallet.clone()).or_insert(0.0);
            *best = best.max(score);
        }
    }

    /// EMA-update the edge to every peer. Returns the updated edges.
    fn apply_co_occurrences(
        &self,
        trade: &TradeEvent,
        peers: HashMap<String, f64>,
    ) -> Vec<CorrelationEdge> {
        let mut peers: Vec<(String, f64)> = peers.into_iter().collect();
        if peers.len() > self.config.max_peers_per_event {
            peers.sort_by(|a, b| b.1.total_cmp(&a.1));
            peers.truncate(self.config.max_peers_per_event);
        }

        let alpha = self.config.alpha;
        let mut updated = Vec::with_capacity(peers.len());
        for (peer, event_score) in peers {
            let Some(key) = EdgeKey::new(&trade.wallet, &peer) else {
                continue;
            };
            let mut edge = self
                .edges
                .entry(key.clone())
                .or_insert_with(|| CorrelationEdge {
                    wallet_a: key.a.clone(),
                    wallet_b: key.b.clone(),
                    score: 0.0,
                    occurrences: 0,
                    last_seen: trade.time,
                });

            let at = edge.last_seen.max(trade.time);
            let old = edge.decayed_score(at, self.config.grace(), self.config.half_life());
            edge.score = clamp_unit(alpha * event_score + (1.0 - alpha) * old);
            edge.occurrences += 1;
            edge.last_seen = at;
            updated.push(edge.clone());
        }
        updated
    }

    /// Write updated edges, plus any whose earlier write failed.
    async fn persist_edges(&self, edges: &[CorrelationEdge]) {
        for edge in edges {
            self.write_edge(edge).await;
        }
        if !self.unsynced_edges.is_empty() {
            self.sync_edges().await;
        }
    }

    async fn write_edge(&self, edge: &CorrelationEdge) -> bool {
        let link = GraphLink::CorrelatedWith {
            wallet_a: edge.wallet_a.clone(),
            wallet_b: edge.wallet_b.clone(),
            score: edge.score,
        };
        let write = async {
            self.store.upsert_edge(edge).await?;
            self.store.mirror_link(&link).await
        };
        match write.await {
            Ok(()) => {
                self.unsynced_edges.remove(&edge.key());
                true
            }
            Err(e) => {
                self.unsynced_edges.insert(edge.key());
                error!(
                    wallet_a = %edge.wallet_a,
                    wallet_b = %edge.wallet_b,
                    unsynced = self.unsynced_edges.len(),
                    error = %e,
                    "Failed to persist correlation edge"
                );
                false
            }
        }
    }

    /// Retry edges whose last write failed. Returns how many are still
    /// unsynced.
    pub async fn sync_edges(&self) -> usize {
        let keys: Vec<EdgeKey> = self.unsynced_edges.iter().map(|k| k.key().clone()).collect();
        for key in keys {
            let Some(edge) = self.edges.get(&key).map(|e| e.clone()) else {
                self.unsynced_edges.remove(&key);
                continue;
            };
            if !self.write_edge(&edge).await {
                break;
            }
        }
        self.unsynced_edges.len()
    }

    pub fn unsynced_edge_count(&self) -> usize {
        self.unsynced_edges.len()
    }

    /// Run a clustering pass with decay evaluated at `now`.
    ///
    /// Passes are serialized. Edge updates continue concurrently; the pass
    /// works from a snapshot.
    pub async fn run_clustering_at(&self, now: DateTime<Utc>) -> Result<Vec<ClusterAlert>> {
        let _pass = self.pass_guard.lock().await;
        self.prune_idle(self.clock());

        let scores = self.snapshot_scores(now);
        let mut dirty: HashSet<Uuid> = HashSet::new();

        for component in self.strong_components(&scores) {
            let average = pairwise_average(&scores, &component);
            if average < self.config.cluster_threshold {
                continue;
            }
            dirty.extend(self.absorb_component(component, &scores, now).await);
        }

        self.refresh_clusters(&scores, dirty, now).await
    }

    /// Drop edges decayed to nothing, token windows idle past the retention
    /// span and token memberships older than the restore lookback. Runs at
    /// most once per retention span of event time.
    fn prune_idle(&self, clock: DateTime<Utc>) {
        let retention = self.config.window() * RETAINED_WINDOWS as i32;
        let clock_ms = clock.timestamp_millis();
        let last = self.last_prune_ms.load(Ordering::SeqCst);
        if last != i64::MIN && clock_ms - last < retention.num_milliseconds() {
            return;
        }
        self.last_prune_ms.store(clock_ms, Ordering::SeqCst);

        let (grace, half_life) = (self.config.grace(), self.config.half_life());
        let edges_before = self.edges.len();
        self.edges
            .retain(|_, e| e.decayed_score(clock, grace, half_life) >= EDGE_EVICTION_SCORE);

        let idle_cutoff = clock - retention;
        let windows_before = self.windows.len();
        self.windows
            .retain(|_, w| w.trades.iter().any(|t| t.time >= idle_cutoff));
        if self.windows.len() < windows_before {
            self.windows_dropped_before_ms
                .fetch_max(idle_cutoff.timestamp_millis(), Ordering::SeqCst);
        }

        let token_cutoff = clock - Duration::hours(self.config.restore_lookback_hours as i64);
        self.wallet_tokens.retain(|_, tokens| {
            tokens.retain(|_, last| *last >= token_cutoff);
            !tokens.is_empty()
        });

        debug!(
            edges_evicted = edges_before - self.edges.len(),
            windows_evicted = windows_before - self.windows.len(),
            wallets_tracked = self.wallet_tokens.len(),
            "Pruned idle detector state"
        );
    }

    fn snapshot_scores(&self, now: DateTime<Utc>) -> HashMap<EdgeKey, f64> {
        let grace = self.config.grace();
        let half_life = self.config.half_life();
        self.edges
            .iter()
            .map(|e| (e.key().clone(), e.decayed_score(now, grace, half_life)))
            .collect()
    }

    /// Connected components over edges at or above the edge threshold,
    /// keeping only those with enough members.
    fn strong_components(&self, scores: &HashMap<EdgeKey, f64>) -> Vec<BTreeSet<String>> {
        let mut sets = DisjointSet::default();
        for (key, score) in scores {
            if *score >= self.config.edge_threshold {
                sets.union(&key.a, &key.b);
            }
        }
        sets.groups()
            .into_iter()
            .filter(|g| g.len() >= self.config.min_members)
            .collect()
    }

    /// Fold a qualifying component into the cluster set. Returns the ids of
    /// clusters created or grown.
    async fn absorb_component(
        &self,
        component: BTreeSet<String>,
        scores: &HashMap<EdgeKey, f64>,
        now: DateTime<Utc>,
    ) -> Vec<Uuid> {
        let mut touched: BTreeSet<Uuid> = BTreeSet::new();
        let mut unassigned = Vec::new();
        for wallet in &component {
            match self.wallet_index.get(wallet) {
                Some(id) => {
                    touched.insert(*id);
                }
                None => unassigned.push(wallet.clone()),
            }
        }

        if unassigned.is_empty() {
            return Vec::new();
        }

        if touched.is_empty() {
            let average = pairwise_average(scores, &component);
            let cluster = Cluster::new(component, average, now);
            let id = cluster.cluster_id;
            for wallet in &cluster.members {
                self.wallet_index.insert(wallet.clone(), id);
            }
            info!(
                cluster_id = %id,
                members = cluster.size(),
                "New cabal cluster formed"
            );
            self.clusters.insert(id, Arc::new(Mutex::new(cluster)));
            return vec![id];
        }

        let mut grown = Vec::new();
        for wallet in unassigned {
            let mut ranked = Vec::with_capacity(touched.len());
            for id in &touched {
                if let Some(cell) = self.cluster_cell(id) {
                    let members = cell.lock().await.members.clone();
                    ranked.push((*id, affinity(scores, &wallet, &members)));
                }
            }
            let Some(best) = ranked.iter().map(|(_, s)| *s).reduce(f64::max) else {
                continue;
            };
            let winners: Vec<Uuid> = ranked
                .iter()
                .filter(|(_, s)| (best - s).abs() < TIE_EPSILON)
                .map(|(id, _)| *id)
                .collect();

            let target = if winners.len() > 1 {
                let survivor = self.merge_clusters(&winners, now).await;
                for id in &winners {
                    if *id != survivor {
                        touched.remove(id);
                    }
                }
                survivor
            } else {
                winners[0]
            };

            if let Some(cell) = self.cluster_cell(&target) {
                let mut cluster = cell.lock().await;
                cluster.members.insert(wallet.clone());
                cluster.updated_at = now;
                self.wallet_index.insert(wallet.clone(), target);
                debug!(cluster_id = %target, wallet = %wallet, "Wallet joined cluster");
            }
            grown.push(target);
        }
        grown
    }

    /// Merge tied clusters into the largest (oldest on a size tie).
    async fn merge_clusters(&self, ids: &[Uuid], now: DateTime<Utc>) -> Uuid {
        let mut cells = Vec::new();
        for id in ids {
            if let Some(cell) = self.cluster_cell(id) {
                let cluster = cell.lock().await;
                cells.push((*id, cluster.size(), cluster.created_at));
            }
        }
        cells.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)).then(a.0.cmp(&b.0)));
        let Some(&(survivor, _, _)) = cells.first() else {
            return ids[0];
        };

        let mut absorbed = BTreeSet::new();
        let mut was_alerting = false;
        for (id, _, _) in cells.iter().skip(1) {
            if let Some((_, cell)) = self.clusters.remove(id) {
                let cluster = cell.lock().await;
                absorbed.extend(cluster.members.iter().cloned());
                was_alerting |= cluster.alerting;
            }
            if let Err(e) = self.store.remove_cluster(*id).await {
                error!(cluster_id = %id, error = %e, "Failed to remove merged cluster");
            }
        }

        if let Some(cell) = self.cluster_cell(&survivor) {
            let mut cluster = cell.lock().await;
            for wallet in absorbed {
                self.wallet_index.insert(wallet.clone(), survivor);
                cluster.members.insert(wallet);
            }
            cluster.alerting |= was_alerting;
            cluster.updated_at = now;
            info!(
                cluster_id = %survivor,
                merged = ids.len() - 1,
                members = cluster.size(),
                "Merged clusters over a bridging wallet"
            );
        }
        survivor
    }

    /// Recompute scores and alert state for every cluster; persist the ones
    /// that changed.
    async fn refresh_clusters(
        &self,
        scores: &HashMap<EdgeKey, f64>,
        mut dirty: HashSet<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClusterAlert>> {
        let cells: Vec<(Uuid, Arc<Mutex<Cluster>>)> = self
            .clusters
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut alerts = Vec::new();
        let mut to_persist = Vec::new();
        for (id, cell) in cells {
            let mut cluster = cell.lock().await;
            let aggregate = pairwise_average(scores, &cluster.members);
            let shared = self.shared_token_count(&cluster.members);
            if (aggregate - cluster.aggregate_score).abs() > 1e-6
                || shared != cluster.shared_contract_count
            {
                dirty.insert(id);
            }
            cluster.aggregate_score = aggregate;
            cluster.shared_contract_count = shared;

            let above = aggregate >= self.config.cluster_threshold;
            if above && !cluster.alerting {
                cluster.alerting = true;
                cluster.updated_at = now;
                dirty.insert(id);
                warn!(
                    cluster_id = %id,
                    members = cluster.size(),
                    score = aggregate,
                    shared_contracts = shared,
                    "Cabal cluster alert"
                );
                alerts.push(ClusterAlert {
                    alert_id: Uuid::new_v4(),
                    cluster_id: id,
                    members: cluster.members.iter().cloned().collect(),
                    aggregate_score: aggregate,
                    shared_contract_count: shared,
                    triggered_at: now,
                });
            } else if !above && cluster.alerting {
                cluster.alerting = false;
                cluster.updated_at = now;
                dirty.insert(id);
                info!(cluster_id = %id, score = aggregate, "Cluster fell below alert threshold");
            }

            if dirty.contains(&id) {
                to_persist.push(cluster.clone());
            }
        }

        for cluster in &to_persist {
            self.persist_cluster(cluster).await;
        }
        Ok(alerts)
    }

    async fn persist_cluster(&self, cluster: &Cluster) {
        let write = async {
            self.store.upsert_cluster(cluster).await?;
            for wallet in &cluster.members {
                let node = WalletNode::new(
                    wallet.clone(),
                    WalletCategory::Cabal,
                    cluster.aggregate_score,
                    cluster.created_at,
                );
                self.store.upsert_wallet(&node).await?;
                self.store
                    .mirror_link(&GraphLink::MemberOf {
                        wallet: wallet.clone(),
                        cluster_id: cluster.cluster_id,
                    })
                    .await?;
            }
            Ok::<_, Error>(())
        };
        if let Err(e) = write.await {
            error!(cluster_id = %cluster.cluster_id, error = %e, "Failed to persist cluster");
        }
    }

    /// Explicitly remove `wallet` from its cluster.
    ///
    /// The wallet's edges to the remaining members are zeroed so the next
    /// pass does not immediately re-admit it. A cluster that would drop
    /// below two members is dissolved.
    pub async fn demote_member(&self, wallet: &str) -> Result<Option<Demotion>> {
        let _pass = self.pass_guard.lock().await;

        let Some(cluster_id) = self.wallet_index.get(wallet).map(|id| *id) else {
            return Ok(None);
        };
        let Some(cell) = self.cluster_cell(&cluster_id) else {
            self.wallet_index.remove(wallet);
            return Ok(None);
        };

        let mut cluster = cell.lock().await;
        cluster.members.remove(wallet);
        self.wallet_index.remove(wallet);

        let mut zeroed = Vec::new();
        for member in &cluster.members {
            if let Some(key) = EdgeKey::new(wallet, member) {
                if let Some(mut edge) = self.edges.get_mut(&key) {
                    edge.score = 0.0;
                    zeroed.push(edge.clone());
                }
            }
        }

        let outcome = if cluster.members.len() < 2 {
            for member in &cluster.members {
                self.wallet_index.remove(member);
            }
            drop(cluster);
            self.clusters.remove(&cluster_id);
            self.store.remove_cluster(cluster_id).await?;
            info!(cluster_id = %cluster_id, wallet = %wallet, "Cluster dissolved by demotion");
            Demotion::Dissolved { cluster_id }
        } else {
            let snapshot = cluster.clone();
            drop(cluster);
            self.store.upsert_cluster(&snapshot).await?;
            info!(cluster_id = %cluster_id, wallet = %wallet, "Wallet demoted from cluster");
            Demotion::Removed { cluster_id }
        };

        for edge in &zeroed {
            self.store.upsert_edge(edge).await?;
        }
        Ok(Some(outcome))
    }

    pub async fn cluster_for_wallet(&self, wallet: &str) -> Option<Cluster> {
        let id = self.wallet_index.get(wallet).map(|id| *id)?;
        let cell = self.cluster_cell(&id)?;
        let cluster = cell.lock().await;
        Some(cluster.clone())
    }

    pub async fn cluster(&self, cluster_id: &Uuid) -> Option<Cluster> {
        let cell = self.cluster_cell(cluster_id)?;
        let cluster = cell.lock().await;
        Some(cluster.clone())
    }

    /// Snapshot of every cluster with scores decayed to `now`.
    pub async fn cluster_health(&self, now: DateTime<Utc>) -> Vec<ClusterHealth> {
        let cells: Vec<Arc<Mutex<Cluster>>> =
            self.clusters.iter().map(|e| e.value().clone()).collect();

        let mut health = Vec::with_capacity(cells.len());
        for cell in cells {
            let cluster = cell.lock().await;
            let members: Vec<&String> = cluster.members.iter().collect();
            let mut sum = 0.0;
            let mut pairs = 0usize;
            let mut unsynced = 0usize;
            for (i, a) in members.iter().enumerate() {
                for b in &members[i + 1..] {
                    sum += self.edge_score(a, b, now);
                    pairs += 1;
                    if EdgeKey::new(a, b).is_some_and(|k| self.unsynced_edges.contains(&k)) {
                        unsynced += 1;
                    }
                }
            }
            health.push(ClusterHealth {
                cluster_id: cluster.cluster_id,
                member_count: cluster.size(),
                aggregate_score: if pairs == 0 { 0.0 } else { sum / pairs as f64 },
                shared_contract_count: cluster.shared_contract_count,
                alerting: cluster.alerting,
                updated_at: cluster.updated_at,
                unsynced_edges: unsynced,
            });
        }
        health.sort_by(|a, b| b.aggregate_score.total_cmp(&a.aggregate_score));
        health
    }

    pub fn edge(&self, a: &str, b: &str) -> Option<CorrelationEdge> {
        let key = EdgeKey::new(a, b)?;
        self.edges.get(&key).map(|e| e.clone())
    }

    /// Edge score between two wallets decayed to `now`; zero if never seen.
    pub fn edge_score(&self, a: &str, b: &str, now: DateTime<Utc>) -> f64 {
        self.edge(a, b)
            .map(|e| e.decayed_score(now, self.config.grace(), self.config.half_life()))
            .unwrap_or(0.0)
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    /// Rebuild edges, clusters and recent token windows from the store.
    pub async fn restore(&self, now: DateTime<Utc>) -> Result<()> {
        for edge in self.store.load_edges().await? {
            self.edges.insert(edge.key(), edge);
        }

        for cluster in self.store.load_clusters().await? {
            if cluster.members.len() < 2 {
                warn!(cluster_id = %cluster.cluster_id, "Skipping stored cluster with fewer than two members");
                continue;
            }
            for wallet in &cluster.members {
                self.wallet_index.insert(wallet.clone(), cluster.cluster_id);
            }
            self.clusters
                .insert(cluster.cluster_id, Arc::new(Mutex::new(cluster)));
        }

        let since = now - Duration::hours(self.config.restore_lookback_hours as i64);
        let trades = self.store.trades_since(since).await?;
        for trade in &trades {
            self.advance_clock(trade.time);
            self.note_token(trade);
            self.index_trade(trade);
        }

        info!(
            edges = self.edges.len(),
            clusters = self.clusters.len(),
            trades = trades.len(),
            "Restored cabal detector state"
        );
        Ok(())
    }

    fn cluster_cell(&self, id: &Uuid) -> Option<Arc<Mutex<Cluster>>> {
        self.clusters.get(id).map(|c| c.value().clone())
    }

    fn shared_token_count(&self, members: &BTreeSet<String>) -> u32 {
        let mut holders: HashMap<String, u32> = HashMap::new();
        for wallet in members {
            if let Some(tokens) = self.wallet_tokens.get(wallet) {
                for token in tokens.keys() {
                    *holders.entry(token.clone()).or_insert(0) += 1;
                }
            }
        }
        holders.values().filter(|n| **n >= 2).count() as u32
    }

    fn advance_clock(&self, time: DateTime<Utc>) {
        self.clock_ms
            .fetch_max(time.timestamp_millis(), Ordering::SeqCst);
    }

    fn clock(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.clock_ms.load(Ordering::SeqCst))
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// Mean score over all member pairs; a missing edge counts as zero.
fn pairwise_average(scores: &HashMap<EdgeKey, f64>, members: &BTreeSet<String>) -> f64 {
    let members: Vec<&String> = members.iter().collect();
    if members.len() < 2 {
        return 0.0;
    }
    let mut sum = 0.0;
    let mut pairs = 0usize;
    for (i, a) in members.iter().enumerate() {
        for b in &members[i + 1..] {
            if let Some(key) = EdgeKey::new(a, b) {
                sum += scores.get(&key).copied().unwrap_or(0.0);
                pairs += 1;
            }
        }
    }
    sum / pairs as f64
}

/// Mean score from `wallet` to each member of a cluster.
fn affinity(scores: &HashMap<EdgeKey, f64>, wallet: &str, members: &BTreeSet<String>) -> f64 {
    if members.is_empty() {
        return 0.0;
    }
    let sum: f64 = members
        .iter()
        .filter_map(|m| EdgeKey::new(wallet, m))
        .map(|key| scores.get(&key).copied().unwrap_or(0.0))
        .sum();
    sum / members.len() as f64
}

#[derive(Default)]
struct DisjointSet {
    index: HashMap<String, usize>,
    names: Vec<String>,
    parent: Vec<usize>,
}

impl DisjointSet {
    fn id(&mut self, name: &str) -> usize {
        if let Some(id) = self.index.get(name) {
            return *id;
        }
        let id = self.parent.len();
        self.index.insert(name.to_string(), id);
        self.names.push(name.to_string());
        self.parent.push(id);
        id
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: &str, b: &str) {
        let (a, b) = (self.id(a), self.id(b));
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[rb] = ra;
        }
    }

    fn groups(mut self) -> Vec<BTreeSet<String>> {
        let mut groups: HashMap<usize, BTreeSet<String>> = HashMap::new();
        for id in 0..self.parent.len() {
            let root = self.find(id);
            groups
                .entry(root)
                .or_default()
                .insert(self.names[id].clone());
        }
        groups.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::MemoryStore;
    use tokio_test::{assert_err, assert_ok};

    fn base() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
    }

    fn trade(wallet: &str, token: &str, time: DateTime<Utc>) -> TradeEvent {
        TradeEvent {
            tx_hash: format!("{}-{}-{}", wallet, token, time.timestamp_millis()),
            wallet: wallet.to_string(),
            token: token.to_string(),
            slot: 0,
            time,
        }
    }

    fn detector() -> (Arc<MemoryStore>, CabalDetector) {
        let store = Arc::new(MemoryStore::new());
        let detector = CabalDetector::new(store.clone(), CabalConfig::default());
        (store, detector)
    }

    /// Every wallet trades `token` once, 10ms apart, starting at `start`.
    async fn round(
        detector: &CabalDetector,
        wallets: &[&str],
        token: &str,
        start: DateTime<Utc>,
    ) -> Vec<ClusterAlert> {
        let mut alerts = Vec::new();
        for (i, w) in wallets.iter().enumerate() {
            let t = trade(w, token, start + Duration::milliseconds(10 * i as i64));
            alerts.extend(detector.process_trade(&t).await.unwrap());
        }
        alerts
    }

    #[test]
    fn test_event_score_peaks_and_fades() {
        let config = CabalConfig::default();
        let t = base();
        assert_eq!(config.event_score(t, t), Some(1.0));
        assert_eq!(config.event_score(t, t + Duration::milliseconds(2_000)), Some(0.5));
        assert_eq!(config.event_score(t + Duration::milliseconds(4_000), t), Some(0.0));
        assert_eq!(config.event_score(t, t + Duration::milliseconds(4_001)), None);
    }

    #[tokio::test]
    async fn test_ema_update() {
        let (_, detector) = detector();
        detector.process_trade(&trade("a", "X", base())).await.unwrap();
        detector.process_trade(&trade("b", "X", base())).await.unwrap();
        assert!((detector.edge("a", "b").unwrap().score - 0.3).abs() < 1e-9);

        let later = base() + Duration::seconds(30);
        detector.process_trade(&trade("a", "X", later)).await.unwrap();
        detector.process_trade(&trade("b", "X", later)).await.unwrap();
        let edge = detector.edge("b", "a").unwrap();
        assert!((edge.score - (0.3 + 0.7 * 0.3)).abs() < 1e-9);
        assert_eq!(edge.occurrences, 2);
    }

    #[tokio::test]
    async fn test_duplicate_trade_changes_nothing() {
        let (_, detector) = detector();
        let a = trade("a", "X", base());
        let b = trade("b", "X", base() + Duration::milliseconds(100));
        detector.process_trade(&a).await.unwrap();
        detector.process_trade(&b).await.unwrap();
        let before = detector.edge("a", "b").unwrap();

        detector.process_trade(&b).await.unwrap();
        detector.process_trade(&a).await.unwrap();
        assert_eq!(detector.edge("a", "b").unwrap(), before);
    }

    #[tokio::test]
    async fn test_outside_window_or_other_token_not_correlated() {
        let (_, detector) = detector();
        detector.process_trade(&trade("a", "X", base())).await.unwrap();
        detector
            .process_trade(&trade("b", "X", base() + Duration::seconds(5)))
            .await
            .unwrap();
        detector.process_trade(&trade("c", "Y", base())).await.unwrap();
        assert_eq!(detector.edge_count(), 0);
    }

    #[tokio::test]
    async fn test_five_wallets_alert_exactly_once() {
        let (_, detector) = detector();
        let wallets = ["w1", "w2", "w3", "w4", "w5"];

        let first = round(&detector, &wallets, "X", base()).await;
        assert!(first.is_empty());
        // one edge per pair of the five wallets
        assert_eq!(detector.edge_count(), 10);
        assert_eq!(detector.cluster_count(), 0);

        let mut alerts = first;
        for r in 1..6 {
            let start = base() + Duration::seconds(10 * r);
            alerts.extend(round(&detector, &wallets, "X", start).await);
        }

        assert_eq!(alerts.len(), 1);
        assert_eq!(detector.cluster_count(), 1);
        assert_eq!(alerts[0].members.len(), 5);
        assert!(alerts[0].aggregate_score >= 0.6);

        let cluster = detector.cluster_for_wallet("w3").await.unwrap();
        assert_eq!(cluster.cluster_id, alerts[0].cluster_id);
        assert_eq!(cluster.shared_contract_count, 1);
    }

    #[tokio::test]
    async fn test_alert_rearms_after_decay() {
        let (_, detector) = detector();
        let wallets = ["a", "b", "c"];
        let mut alerts = Vec::new();
        for r in 0..4 {
            alerts.extend(round(&detector, &wallets, "X", base() + Duration::seconds(10 * r)).await);
        }
        assert_eq!(alerts.len(), 1);

        // Long idle: scores decay below threshold, membership is kept.
        let idle = base() + Duration::hours(4);
        assert!(detector.run_clustering_at(idle).await.unwrap().is_empty());
        let cluster = detector.cluster_for_wallet("a").await.unwrap();
        assert!(!cluster.alerting);
        assert_eq!(cluster.size(), 3);

        let mut again = Vec::new();
        for r in 0..6 {
            again.extend(round(&detector, &wallets, "X", idle + Duration::seconds(10 * r)).await);
        }
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].cluster_id, alerts[0].cluster_id);
    }

    #[tokio::test]
    async fn test_decay_is_applied_on_read() {
        let (_, detector) = detector();
        detector.process_trade(&trade("a", "X", base())).await.unwrap();
        detector.process_trade(&trade("b", "X", base())).await.unwrap();

        let stored = detector.edge("a", "b").unwrap().score;
        let later = base() + Duration::hours(1) + Duration::minutes(30);
        assert!((detector.edge_score("a", "b", later) - stored / 2.0).abs() < 1e-9);
        assert_eq!(detector.edge("a", "b").unwrap().score, stored);
    }

    #[tokio::test]
    async fn test_demotion_dissolves_small_cluster() {
        let (store, detector) = detector();
        let wallets = ["a", "b", "c"];
        for r in 0..4 {
            round(&detector, &wallets, "X", base() + Duration::seconds(10 * r)).await;
        }
        let id = detector.cluster_for_wallet("a").await.unwrap().cluster_id;

        assert_eq!(
            detector.demote_member("a").await.unwrap(),
            Some(Demotion::Removed { cluster_id: id })
        );
        assert_eq!(detector.cluster(&id).await.unwrap().size(), 2);
        assert_eq!(detector.edge("a", "b").unwrap().score, 0.0);

        assert_eq!(
            detector.demote_member("b").await.unwrap(),
            Some(Demotion::Dissolved { cluster_id: id })
        );
        assert!(detector.cluster_for_wallet("c").await.is_none());
        assert!(store.load_clusters().await.unwrap().is_empty());
        assert_eq!(detector.demote_member("zzz").await.unwrap(), None);
    }

    /// Process `(wallet, offset_ms)` trades in the given order.
    async fn feed(detector: &CabalDetector, token: &str, at: DateTime<Utc>, trades: &[(&str, i64)]) {
        for (wallet, offset) in trades {
            let t = trade(wallet, token, at + Duration::milliseconds(*offset));
            detector.process_trade(&t).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_bridge_wallet_joins_closer_cluster() {
        let store = Arc::new(MemoryStore::new());
        let config = CabalConfig {
            cluster_threshold: 0.35,
            ..Default::default()
        };
        let detector = CabalDetector::new(store, config);

        for r in 0..4 {
            let start = base() + Duration::seconds(10 * r);
            round(&detector, &["l1", "l2", "l3"], "L", start).await;
            round(&detector, &["r1", "r2", "r3"], "R", start).await;
        }
        let left_id = detector.cluster_for_wallet("l1").await.unwrap().cluster_id;
        let right_id = detector.cluster_for_wallet("r1").await.unwrap().cluster_id;
        assert_ne!(left_id, right_id);

        // The bridge trade is ingested last so its edges to both sides
        // strengthen in the same update. It is close to all of the left
        // cluster but only to r1 on the right.
        for r in 0..5 {
            let at = base() + Duration::seconds(100 + 60 * r);
            feed(
                &detector,
                "Z",
                at,
                &[("l1", -1_000), ("l2", -990), ("l3", -980), ("r1", 1_000), ("bridge", 0)],
            )
            .await;
        }

        let home = detector.cluster_for_wallet("bridge").await.unwrap();
        assert_eq!(home.cluster_id, left_id);
        assert_eq!(home.size(), 4);
        assert_eq!(detector.cluster(&right_id).await.unwrap().size(), 3);
    }

    #[tokio::test]
    async fn test_equal_affinity_merges_clusters() {
        let store = Arc::new(MemoryStore::new());
        let config = CabalConfig {
            window_ms: 10_000,
            cluster_threshold: 0.4,
            ..Default::default()
        };
        let detector = CabalDetector::new(store, config);

        // Mirror-image timing around the bridge trade.
        for r in 0..6 {
            let at = base() + Duration::seconds(60 * r);
            feed(
                &detector,
                "Z",
                at,
                &[
                    ("l1", -4_000),
                    ("l2", -3_990),
                    ("l3", -3_980),
                    ("r1", 3_980),
                    ("r2", 3_990),
                    ("r3", 4_000),
                    ("bridge", 0),
                ],
            )
            .await;
        }

        assert_eq!(detector.cluster_count(), 1);
        let merged = detector.cluster_for_wallet("bridge").await.unwrap();
        assert_eq!(merged.size(), 7);
        assert_eq!(
            detector.cluster_for_wallet("r3").await.unwrap().cluster_id,
            merged.cluster_id
        );
    }

    #[tokio::test]
    async fn test_restore_rebuilds_state() {
        let store = Arc::new(MemoryStore::new());
        let wallets = ["a", "b", "c"];
        let now = Utc::now();
        let id = {
            let detector = CabalDetector::new(store.clone(), CabalConfig::default());
            for r in 0..4 {
                round(&detector, &wallets, "X", now + Duration::seconds(10 * r)).await;
            }
            detector.cluster_for_wallet("a").await.unwrap().cluster_id
        };

        let restored = CabalDetector::new(store.clone(), CabalConfig::default());
        restored.restore(now).await.unwrap();
        assert_eq!(restored.edge_count(), 3);
        let cluster = restored.cluster_for_wallet("b").await.unwrap();
        assert_eq!(cluster.cluster_id, id);
        assert!(cluster.alerting);

        // replaying an already stored trade is still a no-op
        let replay = trade("a", "X", now);
        assert!(restored.process_trade(&replay).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_after_failed_backfill_applies_trade() {
        let (store, detector) = detector();
        detector.process_trade(&trade("a", "X", base())).await.unwrap();
        // pushes `a` out of the in-memory window
        detector
            .process_trade(&trade("c", "X", base() + Duration::seconds(40)))
            .await
            .unwrap();

        let late = trade("b", "X", base() + Duration::seconds(1));
        store.fail_next("trades_for_token", 1).await;
        let err = assert_err!(detector.process_trade(&late).await);
        assert!(err.is_transient());
        assert!(detector.edge("a", "b").is_none());

        assert_ok!(detector.process_trade(&late).await);
        let edge = detector.edge("a", "b").unwrap();
        assert_eq!(edge.occurrences, 1);
        assert!((edge.score - 0.3 * 0.75).abs() < 1e-9);
        assert_eq!(store.trade_count().await, 3);
    }

    #[tokio::test]
    async fn test_failed_edge_write_is_reported_and_retried() {
        let (store, detector) = detector();
        let wallets = ["a", "b", "c"];
        for r in 0..4 {
            round(&detector, &wallets, "X", base() + Duration::seconds(10 * r)).await;
        }
        assert_eq!(detector.unsynced_edge_count(), 0);

        // a single failed write is healed by the immediate retry
        store.fail_next("upsert_edge", 1).await;
        round(&detector, &["a", "b"], "X", base() + Duration::seconds(50)).await;
        assert_eq!(detector.unsynced_edge_count(), 0);

        // both writes and the retry fail
        store.fail_next("upsert_edge", 3).await;
        round(&detector, &["c"], "X", base() + Duration::seconds(50)).await;
        assert_eq!(detector.unsynced_edge_count(), 2);
        let health = detector.cluster_health(base() + Duration::seconds(60)).await;
        assert_eq!(health.len(), 1);
        assert_eq!(health[0].unsynced_edges, 2);

        assert_eq!(detector.sync_edges().await, 0);
        let stored = store.load_edges().await.unwrap();
        assert_eq!(stored.len(), 3);
        for edge in stored {
            assert_eq!(detector.edge(&edge.wallet_a, &edge.wallet_b), Some(edge));
        }
    }

    #[tokio::test]
    async fn test_idle_state_is_pruned() {
        let (_, detector) = detector();
        detector.process_trade(&trade("a", "OLD", base())).await.unwrap();
        detector.process_trade(&trade("b", "OLD", base())).await.unwrap();
        assert_eq!(detector.edge_count(), 1);

        // A day later the old edge has decayed away and its token is idle.
        let later = base() + Duration::hours(26);
        detector.process_trade(&trade("c", "NEW", later)).await.unwrap();
        detector.process_trade(&trade("d", "NEW", later)).await.unwrap();

        assert_eq!(detector.edge_count(), 1);
        assert!(detector.edge("a", "b").is_none());
        assert!(detector.edge("c", "d").is_some());
        assert!(!detector.windows.contains_key("OLD"));
        assert!(!detector.wallet_tokens.contains_key("a"));

        // an out-of-order trade on the dropped token is still matched from the store
        detector
            .process_trade(&trade("e", "OLD", base() + Duration::milliseconds(500)))
            .await
            .unwrap();
        assert!(detector.edge("a", "e").is_some());
    }

    #[tokio::test]
    async fn test_store_outage_surfaces() {
        let (store, detector) = detector();
        store.set_available(false);
        let err = detector
            .process_trade(&trade("a", "X", base()))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_config_validation() {
        assert!(CabalConfig::default().validate().is_ok());
        let bad = CabalConfig {
            min_members: 1,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = CabalConfig {
            alpha: 1.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
