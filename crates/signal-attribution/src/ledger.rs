//! Per-source performance ledger.
//!
//! A trade completion is the only thing that mutates a record. Each update
//! builds a new record and swaps it in whole, so readers always see either
//! the old or the new value and never wait on a writer.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, Distribution};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use sentinel_core::{Error, Result};

use crate::attribution_repo::AttributionRepository;

/// Kind of signal a source produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    FreshWallet,
    Cabal,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::FreshWallet => "fresh_wallet",
            SourceType::Cabal => "cabal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fresh_wallet" => Some(SourceType::FreshWallet),
            "cabal" => Some(SourceType::Cabal),
            _ => None,
        }
    }
}

/// Extra context the execution layer may attach to a completion; used by
/// forensics only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionDiagnostics {
    pub expected_slippage: Option<f64>,
    pub actual_slippage: Option<f64>,
    pub signal_confidence: Option<f64>,
    pub execution_error: Option<String>,
    #[serde(default)]
    pub halted_by_breaker: bool,
}

/// A closed trade reported by the execution layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeCompletion {
    pub trade_id: Uuid,
    pub source_id: String,
    pub source_type: SourceType,
    /// Realized profit or loss in quote currency.
    pub pnl: Decimal,
    /// Realized return as a fraction of position size (-0.25 = -25%).
    pub pnl_pct: f64,
    pub won: bool,
    /// Capital that was deployed; released from breaker exposure on close.
    #[serde(default)]
    pub position_size: Decimal,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub diagnostics: CompletionDiagnostics,
}

impl TradeCompletion {
    pub fn validate(&self) -> Result<()> {
        if self.source_id.trim().is_empty() {
            return Err(Error::InvalidEvent("completion source_id is empty".into()));
        }
        if !self.pnl_pct.is_finite() {
            return Err(Error::InvalidEvent(format!(
                "completion pnl_pct is not finite for trade {}",
                self.trade_id
            )));
        }
        if self.position_size < Decimal::ZERO {
            return Err(Error::InvalidEvent(format!(
                "negative position size for trade {}",
                self.trade_id
            )));
        }
        Ok(())
    }
}

/// Ledger settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributionConfig {
    /// Trailing completions used for Sharpe/Sortino.
    pub rolling_window: usize,
    /// Default minimum trades to appear on the leaderboard.
    pub min_leaderboard_trades: u32,
    /// Minimum trades for a source to count as "hot".
    pub hot_min_trades: u32,
    /// Trade ids remembered for redelivery detection.
    pub dedup_capacity: usize,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            rolling_window: 50,
            min_leaderboard_trades: 5,
            hot_min_trades: 3,
            dedup_capacity: 100_000,
        }
    }
}

impl AttributionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.rolling_window < 2 {
            return Err(Error::config(format!(
                "attribution.rolling_window must be at least 2, got {}",
                self.rolling_window
            )));
        }
        if self.dedup_capacity == 0 {
            return Err(Error::config("attribution.dedup_capacity must be positive"));
        }
        Ok(())
    }
}

/// Rolling performance of one signal source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionRecord {
    pub source_id: String,
    pub source_type: SourceType,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub total_pnl: Decimal,
    pub gross_profit: Decimal,
    pub gross_loss: Decimal,
    pub avg_pnl_pct: f64,
    /// `winning_trades / total_trades`, zero before the first trade.
    pub win_rate: f64,
    pub best_pnl: Option<Decimal>,
    pub worst_pnl: Option<Decimal>,
    pub sharpe_ratio: Option<f64>,
    pub sortino_ratio: Option<f64>,
    /// Trailing per-trade returns, oldest first.
    pub recent_returns: VecDeque<f64>,
    pub last_trade_time: Option<DateTime<Utc>>,
}

impl AttributionRecord {
    pub fn new(source_id: impl Into<String>, source_type: SourceType) -> Self {
        Self {
            source_id: source_id.into(),
            source_type,
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            total_pnl: Decimal::ZERO,
            gross_profit: Decimal::ZERO,
            gross_loss: Decimal::ZERO,
            avg_pnl_pct: 0.0,
            win_rate: 0.0,
            best_pnl: None,
            worst_pnl: None,
            sharpe_ratio: None,
            sortino_ratio: None,
            recent_returns: VecDeque::new(),
            last_trade_time: None,
        }
    }

    /// The record after `completion`, leaving `self` untouched.
    pub fn applied(&self, completion: &TradeCompletion, rolling_window: usize) -> Self {
        let mut next = self.clone();
        next.total_trades += 1;
        if completion.won {
            next.winning_trades += 1;
        } else {
            next.losing_trades += 1;
        }

        next.total_pnl += completion.pnl;
        if completion.pnl > Decimal::ZERO {
            next.gross_profit += completion.pnl;
        } else {
            next.gross_loss += -completion.pnl;
        }

        let n = next.total_trades as f64;
        next.avg_pnl_pct = (self.avg_pnl_pct * (n - 1.0) + completion.pnl_pct) / n;
        next.win_rate = next.winning_trades as f64 / n;

        next.best_pnl = Some(self.best_pnl.map_or(completion.pnl, |b| b.max(completion.pnl)));
        next.worst_pnl = Some(self.worst_pnl.map_or(completion.pnl, |w| w.min(completion.pnl)));

        next.recent_returns.push_back(completion.pnl_pct);
        while next.recent_returns.len() > rolling_window {
            next.recent_returns.pop_front();
        }
        let returns: Vec<f64> = next.recent_returns.iter().copied().collect();
        next.sharpe_ratio = sharpe_ratio(&returns);
        next.sortino_ratio = sortino_ratio(&returns);

        next.last_trade_time = Some(
            self.last_trade_time
                .map_or(completion.completed_at, |t| t.max(completion.completed_at)),
        );
        next
    }

    /// Gross profit over gross loss; `None` until there is a loss.
    pub fn profit_factor(&self) -> Option<f64> {
        if self.gross_loss <= Decimal::ZERO {
            return None;
        }
        (self.gross_profit / self.gross_loss).to_f64()
    }
}

/// Mean over standard deviation of per-trade returns.
pub fn sharpe_ratio(returns: &[f64]) -> Option<f64> {
    if returns.len() < 2 {
        return None;
    }
    let data = Data::new(returns.to_vec());
    let mean = data.mean()?;
    let std_dev = data.std_dev()?;
    if std_dev == 0.0 {
        return None;
    }
    Some(mean / std_dev)
}

/// Mean over downside deviation of per-trade returns.
pub fn sortino_ratio(returns: &[f64]) -> Option<f64> {
    if returns.len() < 2 {
        return None;
    }
    let mean = Data::new(returns.to_vec()).mean()?;
    let downside: Vec<f64> = returns.iter().filter(|r| **r < 0.0).map(|r| r * r).collect();
    if downside.is_empty() {
        return None;
    }
    let downside_dev = (downside.iter().sum::<f64>() / returns.len() as f64).sqrt();
    if downside_dev == 0.0 {
        return None;
    }
    Some(mean / downside_dev)
}

/// Leaderboard filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeaderboardQuery {
    pub source_type: Option<SourceType>,
    pub min_trades: Option<u32>,
    pub limit: Option<usize>,
}

/// Aggregate over every source of one type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeSummary {
    pub source_type: SourceType,
    pub sources: usize,
    pub trades: u64,
    pub wins: u64,
    pub total_pnl: Decimal,
    pub avg_win_rate: f64,
}

/// Recently applied trade ids, oldest evicted first.
struct SeenTrades {
    ids: HashSet<Uuid>,
    order: VecDeque<Uuid>,
    capacity: usize,
}

impl SeenTrades {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// False if `id` is already remembered.
    fn insert(&mut self, id: Uuid) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

/// Concurrent attribution ledger.
pub struct AttributionLedger {
    config: AttributionConfig,
    records: DashMap<String, Arc<AttributionRecord>>,
    /// Serializes writers per source; readers never take these. An entry
    /// lives only while some writer holds or waits on it.
    writers: DashMap<String, Arc<Mutex<()>>>,
    seen: Mutex<SeenTrades>,
    repo: Option<AttributionRepository>,
}

impl AttributionLedger {
    pub fn new(config: AttributionConfig) -> Self {
        Self {
            seen: Mutex::new(SeenTrades::new(config.dedup_capacity)),
            config,
            records: DashMap::new(),
            writers: DashMap::new(),
            repo: None,
        }
    }

    pub fn with_repository(config: AttributionConfig, repo: AttributionRepository) -> Self {
        Self {
            repo: Some(repo),
            ..Self::new(config)
        }
    }

    /// Load persisted records.
    pub async fn load(&self) -> Result<usize> {
        let Some(repo) = &self.repo else {
            return Ok(0);
        };
        let records = repo.load_all().await?;
        let count = records.len();
        for record in records {
            self.records
                .insert(record.source_id.clone(), Arc::new(record));
        }
        info!(sources = count, "Loaded attribution records");
        Ok(count)
    }

    /// Apply a trade completion to its source's record.
    ///
    /// Returns `None` when the trade id was already applied, so redelivered
    /// completions never count twice.
    pub async fn record_completion(
        &self,
        completion: &TradeCompletion,
    ) -> Result<Option<Arc<AttributionRecord>>> {
        completion.validate()?;

        if !self.claim(completion.trade_id).await {
            debug!(
                trade_id = %completion.trade_id,
                source_id = %completion.source_id,
                "Duplicate trade completion ignored"
            );
            return Ok(None);
        }

        let writer = self
            .writers
            .entry(completion.source_id.clone())
            .or_default()
            .clone();
        let guard = writer.lock().await;

        let current = self.get(&completion.source_id);
        let next = match current {
            Some(record) => record.applied(completion, self.config.rolling_window),
            None => AttributionRecord::new(completion.source_id.clone(), completion.source_type)
                .applied(completion, self.config.rolling_window),
        };
        let next = Arc::new(next);
        self.records
            .insert(completion.source_id.clone(), next.clone());

        debug!(
            source_id = %next.source_id,
            total_trades = next.total_trades,
            win_rate = next.win_rate,
            total_pnl = %next.total_pnl,
            "Attribution updated"
        );

        if let Some(repo) = &self.repo {
            if let Err(e) = repo.save(&next).await {
                error!(source_id = %next.source_id, error = %e, "Failed to persist attribution record");
            }
        }

        drop(guard);
        // The map and `writer` are the only holders when nobody is queued.
        self.writers
            .remove_if(&completion.source_id, |_, w| Arc::strong_count(w) == 2);

        Ok(Some(next))
    }

    /// Mark a trade id applied; false if it already was.
    async fn claim(&self, trade_id: Uuid) -> bool {
        if !self.seen.lock().await.insert(trade_id) {
            return false;
        }
        let Some(repo) = &self.repo else {
            return true;
        };
        match repo.claim_completion(trade_id).await {
            Ok(true) => true,
            // applied before a restart
            Ok(false) => false,
            Err(e) => {
                warn!(trade_id = %trade_id, error = %e, "Failed to record completion id");
                true
            }
        }
    }

    /// Writer locks currently allocated.
    pub fn writer_count(&self) -> usize {
        self.writers.len()
    }

    pub fn get(&self, source_id: &str) -> Option<Arc<AttributionRecord>> {
        self.records.get(source_id).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sources ranked by win rate, then total PnL, both descending.
    pub fn leaderboard(&self, query: &LeaderboardQuery) -> Vec<Arc<AttributionRecord>> {
        let min_trades = query
            .min_trades
            .unwrap_or(self.config.min_leaderboard_trades);
        let mut rows: Vec<Arc<AttributionRecord>> = self
            .records
            .iter()
            .map(|r| r.value().clone())
            .filter(|r| r.total_trades >= min_trades)
            .filter(|r| query.source_type.map_or(true, |t| r.source_type == t))
            .collect();
        sort_ranked(&mut rows);
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        rows
    }

    /// Per-type aggregates ordered by total PnL descending.
    pub fn type_summary(&self) -> Vec<TypeSummary> {
        let mut by_type: HashMap<SourceType, (TypeSummary, f64)> = HashMap::new();
        for record in self.records.iter() {
            let (summary, win_rate_sum) = by_type.entry(record.source_type).or_insert_with(|| {
                (
                    TypeSummary {
                        source_type: record.source_type,
                        sources: 0,
                        trades: 0,
                        wins: 0,
                        total_pnl: Decimal::ZERO,
                        avg_win_rate: 0.0,
                    },
                    0.0,
                )
            });
            summary.sources += 1;
            summary.trades += record.total_trades as u64;
            summary.wins += record.winning_trades as u64;
            summary.total_pnl += record.total_pnl;
            *win_rate_sum += record.win_rate;
        }

        let mut summaries: Vec<TypeSummary> = by_type
            .into_values()
            .map(|(mut summary, win_rate_sum)| {
                summary.avg_win_rate = win_rate_sum / summary.sources as f64;
                summary
            })
            .collect();
        summaries.sort_by(|a, b| b.total_pnl.cmp(&a.total_pnl));
        summaries
    }

    /// Recently active sources with a strong win rate, best first.
    pub fn hot_sources(
        &self,
        now: DateTime<Utc>,
        lookback: Duration,
        min_win_rate: f64,
        limit: usize,
    ) -> Vec<Arc<AttributionRecord>> {
        let since = now - lookback;
        let mut rows: Vec<Arc<AttributionRecord>> = self
            .records
            .iter()
            .map(|r| r.value().clone())
            .filter(|r| r.total_trades >= self.config.hot_min_trades)
            .filter(|r| r.win_rate >= min_win_rate)
            .filter(|r| r.last_trade_time.is_some_and(|t| t > since))
            .collect();
        sort_ranked(&mut rows);
        rows.truncate(limit);
        rows
    }
}

fn sort_ranked(rows: &mut [Arc<AttributionRecord>]) {
    rows.sort_by(|a, b| {
        b.win_rate
            .total_cmp(&a.win_rate)
            .then_with(|| b.total_pnl.cmp(&a.total_pnl))
            .then_with(|| a.source_id.cmp(&b.source_id))
    });
}
