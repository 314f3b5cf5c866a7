//! `SentinelEngine`: the detectors, ledger, breaker and coordinator wired
//! together behind the interfaces the execution layer and operators use.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use correlation_engine::{
    CabalConfig, CabalDetector, ClusterHealth, Demotion, FreshWalletMatcher, MatcherConfig,
};
use risk_manager::{BreakerSnapshot, CircuitBreaker, ResetOutcome, RiskLimits, TripReason};
use sentinel_core::config::load_layered;
use sentinel_core::store::CorrelationStore;
use sentinel_core::types::{ClusterAlert, FreshWalletMatch, TradeEvent, TransferEvent, WithdrawalEvent};
use sentinel_core::Result;
use signal_attribution::{
    AttributionConfig, AttributionLedger, AttributionRecord, FailureSummary, LeaderboardQuery,
    TradeCompletion, TradeForensics, TypeSummary,
};

use crate::alerts::{Alert, AlertSink};
use crate::audit::AuditLogger;
use crate::coordinator::{AdmissionConfig, AdmissionCoordinator, Decision, Signal};

/// Environment prefix for layered settings (`SENTINEL__CABAL__ALPHA=0.4`).
pub const SETTINGS_ENV_PREFIX: &str = "SENTINEL";

/// Every tunable threshold, grouped by component.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub matcher: MatcherConfig,
    pub cabal: CabalConfig,
    pub attribution: AttributionConfig,
    pub risk: RiskLimits,
    pub admission: AdmissionConfig,
    /// Attempt a breaker reset during maintenance once `unlock_at` passes.
    pub auto_reset: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            matcher: MatcherConfig::default(),
            cabal: CabalConfig::default(),
            attribution: AttributionConfig::default(),
            risk: RiskLimits::default(),
            admission: AdmissionConfig::default(),
            auto_reset: true,
        }
    }
}

impl EngineSettings {
    /// Load from an optional TOML file plus `SENTINEL__*` overrides, then
    /// validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let settings: Self = load_layered(path, SETTINGS_ENV_PREFIX)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.matcher.validate()?;
        self.cabal.validate()?;
        self.attribution.validate()?;
        self.risk.validate()?;
        self.admission.validate()?;
        Ok(())
    }
}

/// Shared components, so callers can inject persistent variants.
pub struct EngineComponents {
    pub breaker: Arc<CircuitBreaker>,
    pub ledger: Arc<AttributionLedger>,
    pub forensics: Arc<TradeForensics>,
    pub audit: Option<Arc<AuditLogger>>,
}

impl EngineComponents {
    /// Non-persistent components built from `settings`.
    pub fn in_memory(settings: &EngineSettings) -> Self {
        Self {
            breaker: Arc::new(CircuitBreaker::new(settings.risk.clone())),
            ledger: Arc::new(AttributionLedger::new(settings.attribution.clone())),
            forensics: Arc::new(TradeForensics::new()),
            audit: None,
        }
    }
}

/// What a maintenance tick did.
#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub day_rolled: bool,
    pub reset: Option<ResetOutcome>,
    pub cluster_alerts: Vec<ClusterAlert>,
    /// Correlation edges still not written to the store after the retry.
    pub unsynced_edges: usize,
}

pub struct SentinelEngine {
    settings: EngineSettings,
    matcher: FreshWalletMatcher,
    detector: CabalDetector,
    ledger: Arc<AttributionLedger>,
    forensics: Arc<TradeForensics>,
    breaker: Arc<CircuitBreaker>,
    coordinator: AdmissionCoordinator,
    alerts: Arc<dyn AlertSink>,
}

impl SentinelEngine {
    pub fn new(
        settings: EngineSettings,
        store: Arc<dyn CorrelationStore>,
        components: EngineComponents,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let mut coordinator = AdmissionCoordinator::new(
            settings.admission.clone(),
            components.ledger.clone(),
            components.breaker.clone(),
        );
        if let Some(audit) = components.audit {
            coordinator = coordinator.with_audit(audit);
        }

        Self {
            matcher: FreshWalletMatcher::new(store.clone(), settings.matcher.clone()),
            detector: CabalDetector::new(store, settings.cabal.clone()),
            ledger: components.ledger,
            forensics: components.forensics,
            breaker: components.breaker,
            coordinator,
            alerts,
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Rebuild in-memory state from the stores after a restart.
    pub async fn restore(&self, now: DateTime<Utc>) -> Result<()> {
        let pending = self.matcher.restore(now).await?;
        self.detector.restore(now).await?;
        let sources = self.ledger.load().await?;
        let breaker_loaded = self.breaker.load_state().await?;
        info!(
            pending_withdrawals = pending,
            clusters = self.detector.cluster_count(),
            edges = self.detector.edge_count(),
            sources,
            breaker_loaded,
            "Engine state restored"
        );
        Ok(())
    }

    // ---- ingestion ----

    pub async fn ingest_withdrawal(&self, withdrawal: &WithdrawalEvent) -> Result<Vec<FreshWalletMatch>> {
        let matches = self.matcher.process_withdrawal(withdrawal).await?;
        self.announce_matches(&matches).await;
        Ok(matches)
    }

    pub async fn ingest_transfer(&self, transfer: &TransferEvent) -> Result<Vec<FreshWalletMatch>> {
        let matches = self.matcher.process_transfer(transfer).await?;
        self.announce_matches(&matches).await;
        Ok(matches)
    }

    pub async fn ingest_trade(&self, trade: &TradeEvent) -> Result<Vec<ClusterAlert>> {
        let alerts = self.detector.process_trade(trade).await?;
        for alert in &alerts {
            self.publish(Alert::Cabal(alert.clone())).await;
        }
        Ok(alerts)
    }

    // ---- execution layer ----

    /// Admission decision for a signal. Never approves while the breaker is
    /// tripped.
    pub fn evaluate(&self, signal: &Signal) -> Decision {
        self.coordinator.evaluate(signal)
    }

    /// Fire-and-forget completion hook.
    pub fn notify_trade_completed(self: &Arc<Self>, completion: TradeCompletion) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = engine.apply_trade_completed(&completion).await {
                error!(
                    trade_id = %completion.trade_id,
                    source_id = %completion.source_id,
                    error = %e,
                    "Failed to apply trade completion"
                );
            }
        });
    }

    /// Apply a completion to the ledger, forensics and breaker. Returns the
    /// trip reason if this completion tripped the breaker. A redelivered
    /// trade id changes nothing.
    pub async fn apply_trade_completed(
        &self,
        completion: &TradeCompletion,
    ) -> Result<Option<TripReason>> {
        if self.ledger.record_completion(completion).await?.is_none() {
            return Ok(None);
        }

        if let Err(e) = self.forensics.analyze(completion).await {
            warn!(trade_id = %completion.trade_id, error = %e, "Forensic analysis failed");
        }

        let tripped = self
            .breaker
            .record_trade_result(completion.pnl, completion.won, completion.position_size)
            .await?;
        if let Some(reason) = tripped {
            self.report_trip(reason).await;
        }
        Ok(tripped)
    }

    /// Account for a position the execution layer opened.
    pub async fn notify_position_opened(&self, size: Decimal) -> Result<Option<TripReason>> {
        let tripped = self.breaker.record_position_opened(size).await?;
        if let Some(reason) = tripped {
            self.report_trip(reason).await;
        }
        Ok(tripped)
    }

    // ---- operator actions ----

    pub async fn manual_trip(&self) -> Result<bool> {
        let tripped = self.breaker.manual_trip().await?;
        if tripped {
            self.report_trip(TripReason::Manual).await;
        }
        Ok(tripped)
    }

    pub async fn reset_breaker(&self) -> Result<ResetOutcome> {
        let outcome = self.breaker.reset().await?;
        if let ResetOutcome::Retripped { reason } = outcome {
            self.report_trip(reason).await;
        }
        Ok(outcome)
    }

    pub async fn demote_member(&self, wallet: &str) -> Result<Option<Demotion>> {
        self.detector.demote_member(wallet).await
    }

    /// Periodic upkeep: day roll, scheduled reset and a clustering pass.
    pub async fn run_maintenance(&self, now: DateTime<Utc>) -> Result<MaintenanceReport> {
        let mut report = MaintenanceReport {
            day_rolled: self.breaker.roll_day_at(now).await?,
            ..Default::default()
        };

        if self.settings.auto_reset && self.breaker.is_locked() {
            let unlock_at = self.breaker.state().await.unlock_at;
            if unlock_at.is_some_and(|at| now >= at) {
                let outcome = self.breaker.reset_at(now).await?;
                if let ResetOutcome::Retripped { reason } = outcome {
                    self.report_trip(reason).await;
                }
                report.reset = Some(outcome);
            }
        }

        report.unsynced_edges = self.detector.sync_edges().await;
        report.cluster_alerts = self.detector.run_clustering_at(now).await?;
        for alert in &report.cluster_alerts {
            self.publish(Alert::Cabal(alert.clone())).await;
        }
        Ok(report)
    }

    // ---- read-only views ----

    pub async fn cluster_health(&self, now: DateTime<Utc>) -> Vec<ClusterHealth> {
        self.detector.cluster_health(now).await
    }

    pub async fn breaker_status(&self) -> BreakerSnapshot {
        self.breaker.snapshot().await
    }

    pub fn is_locked(&self) -> bool {
        self.breaker.is_locked()
    }

    pub fn leaderboard(&self, query: &LeaderboardQuery) -> Vec<Arc<AttributionRecord>> {
        self.ledger.leaderboard(query)
    }

    pub fn type_summary(&self) -> Vec<TypeSummary> {
        self.ledger.type_summary()
    }

    pub fn hot_sources(&self, now: DateTime<Utc>, hours: i64, min_win_rate: f64) -> Vec<Arc<AttributionRecord>> {
        self.ledger
            .hot_sources(now, Duration::hours(hours), min_win_rate, 10)
    }

    pub async fn failure_summary(&self, now: DateTime<Utc>, days: i64) -> Vec<FailureSummary> {
        self.forensics.failure_summary(now, days).await
    }

    pub fn matcher(&self) -> &FreshWalletMatcher {
        &self.matcher
    }

    pub fn detector(&self) -> &CabalDetector {
        &self.detector
    }

    pub fn ledger(&self) -> &AttributionLedger {
        &self.ledger
    }

    async fn announce_matches(&self, matches: &[FreshWalletMatch]) {
        let floor = self.settings.admission.fresh_wallet_floor;
        for m in matches.iter().filter(|m| m.match_score >= floor) {
            self.publish(Alert::FreshWallet(m.clone())).await;
        }
    }

    async fn report_trip(&self, reason: TripReason) {
        let state = self.breaker.state().await;
        self.publish(Alert::BreakerTripped {
            reason,
            locked_at: state.locked_at.unwrap_or_else(Utc::now),
            unlock_at: state.unlock_at,
        })
        .await;
    }

    async fn publish(&self, alert: Alert) {
        if let Err(e) = self.alerts.publish(&alert).await {
            error!(error = %e, alert = %alert.message(), "Failed to publish alert");
        }
    }
}
