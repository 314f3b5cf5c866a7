//! Post-mortem classification of losing trades.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, info};
use uuid::Uuid;

use sentinel_core::Result;

use crate::attribution_repo::AttributionRepository;
use crate::ledger::{SourceType, TradeCompletion};

/// Losses at or beyond this fraction are treated as a rug pull.
const RUG_PULL_LOSS_PCT: f64 = -0.80;
/// Slippage above expectation by more than this is blamed for the loss.
const SLIPPAGE_EXCESS: f64 = 0.05;
const BAD_SIGNAL_MAX_LOSS_PCT: f64 = -0.10;
const BAD_SIGNAL_MIN_LOSS_PCT: f64 = -0.30;

const DEFAULT_REPORT_CAPACITY: usize = 1_000;

/// Why a trade lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    RugPull,
    Slippage,
    BadSignal,
    CircuitBreaker,
    ExecutionError,
    Unknown,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::RugPull => "rug_pull",
            FailureCategory::Slippage => "slippage",
            FailureCategory::BadSignal => "bad_signal",
            FailureCategory::CircuitBreaker => "circuit_breaker",
            FailureCategory::ExecutionError => "execution_error",
            FailureCategory::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "rug_pull" => FailureCategory::RugPull,
            "slippage" => FailureCategory::Slippage,
            "bad_signal" => FailureCategory::BadSignal,
            "circuit_breaker" => FailureCategory::CircuitBreaker,
            "execution_error" => FailureCategory::ExecutionError,
            _ => FailureCategory::Unknown,
        }
    }

    /// Categorize a losing completion. Winning trades are not classified.
    pub fn classify(completion: &TradeCompletion) -> Option<Self> {
        if completion.won {
            return None;
        }
        let diag = &completion.diagnostics;
        if diag.execution_error.is_some() {
            return Some(FailureCategory::ExecutionError);
        }
        if diag.halted_by_breaker {
            return Some(FailureCategory::CircuitBreaker);
        }
        if completion.pnl_pct <= RUG_PULL_LOSS_PCT {
            return Some(FailureCategory::RugPull);
        }
        if let (Some(expected), Some(actual)) = (diag.expected_slippage, diag.actual_slippage) {
            if actual - expected > SLIPPAGE_EXCESS {
                return Some(FailureCategory::Slippage);
            }
        }
        if completion.pnl_pct <= BAD_SIGNAL_MAX_LOSS_PCT
            && completion.pnl_pct > BAD_SIGNAL_MIN_LOSS_PCT
        {
            return Some(FailureCategory::BadSignal);
        }
        Some(FailureCategory::Unknown)
    }
}

/// Forensic record of one losing trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForensicReport {
    pub trade_id: Uuid,
    pub source_id: String,
    pub source_type: SourceType,
    pub category: FailureCategory,
    pub pnl: Decimal,
    pub pnl_pct: f64,
    pub signal_confidence: Option<f64>,
    pub detail: Option<String>,
    pub analyzed_at: DateTime<Utc>,
}

/// Counts per category over a period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub category: FailureCategory,
    pub count: u32,
    pub total_pnl: Decimal,
}

/// Classifies losing completions and keeps the most recent reports.
pub struct TradeForensics {
    reports: RwLock<VecDeque<ForensicReport>>,
    capacity: usize,
    repo: Option<AttributionRepository>,
}

impl Default for TradeForensics {
    fn default() -> Self {
        Self::new()
    }
}

impl TradeForensics {
    pub fn new() -> Self {
        Self {
            reports: RwLock::new(VecDeque::new()),
            capacity: DEFAULT_REPORT_CAPACITY,
            repo: None,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn with_repository(mut self, repo: AttributionRepository) -> Self {
        self.repo = Some(repo);
        self
    }

    /// Analyze a completion; returns the report for losses.
    pub async fn analyze(&self, completion: &TradeCompletion) -> Result<Option<ForensicReport>> {
        let Some(category) = FailureCategory::classify(completion) else {
            return Ok(None);
        };

        let report = ForensicReport {
            trade_id: completion.trade_id,
            source_id: completion.source_id.clone(),
            source_type: completion.source_type,
            category,
            pnl: completion.pnl,
            pnl_pct: completion.pnl_pct,
            signal_confidence: completion.diagnostics.signal_confidence,
            detail: completion.diagnostics.execution_error.clone(),
            analyzed_at: completion.completed_at,
        };

        info!(
            trade_id = %report.trade_id,
            source_id = %report.source_id,
            category = report.category.as_str(),
            pnl_pct = report.pnl_pct,
            "Loss classified"
        );

        {
            let mut reports = self.reports.write().await;
            reports.push_back(report.clone());
            while reports.len() > self.capacity {
                reports.pop_front();
            }
        }

        if let Some(repo) = &self.repo {
            if let Err(e) = repo.save_report(&report).await {
                error!(trade_id = %report.trade_id, error = %e, "Failed to persist forensic report");
            }
        }

        Ok(Some(report))
    }

    pub async fn recent(&self, limit: usize) -> Vec<ForensicReport> {
        let reports = self.reports.read().await;
        reports.iter().rev().take(limit).cloned().collect()
    }

    /// Category counts for reports analyzed within `days` of `now`, most
    /// frequent first.
    pub async fn failure_summary(&self, now: DateTime<Utc>, days: i64) -> Vec<FailureSummary> {
        let since = now - Duration::days(days);
        let reports = self.reports.read().await;

        let mut by_category: HashMap<FailureCategory, FailureSummary> = HashMap::new();
        for report in reports.iter().filter(|r| r.analyzed_at >= since) {
            let entry = by_category
                .entry(report.category)
                .or_insert_with(|| FailureSummary {
                    category: report.category,
                    count: 0,
                    total_pnl: Decimal::ZERO,
                });
            entry.count += 1;
            entry.total_pnl += report.pnl;
        }

        let mut summary: Vec<FailureSummary> = by_category.into_values().collect();
        summary.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.category.as_str().cmp(b.category.as_str()))
        });
        summary
    }
}
