//! Admission Coordinator: signal in, approve/deny plus sizing out.
//!
//! `evaluate` reads the breaker's lock flag, the source's attribution record
//! and the risk limits. Its only side effect is an audit append.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use risk_manager::CircuitBreaker;
use sentinel_core::config::require_unit;
use sentinel_core::types::{ClusterAlert, FreshWalletMatch};
use sentinel_core::{Error, Result};
use signal_attribution::{AttributionLedger, SourceType};

use crate::audit::AuditLogger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    FreshWallet,
    Cabal,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::FreshWallet => "fresh_wallet",
            SignalKind::Cabal => "cabal",
        }
    }

    pub fn source_type(&self) -> SourceType {
        match self {
            SignalKind::FreshWallet => SourceType::FreshWallet,
            SignalKind::Cabal => SourceType::Cabal,
        }
    }
}

/// A detector output offered for admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "signal", rename_all = "snake_case")]
pub enum Signal {
    FreshWallet(FreshWalletMatch),
    Cabal(ClusterAlert),
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::FreshWallet(_) => SignalKind::FreshWallet,
            Signal::Cabal(_) => SignalKind::Cabal,
        }
    }

    /// Attribution source this signal is credited to.
    pub fn source_id(&self) -> String {
        match self {
            Signal::FreshWallet(m) => m.source_id(),
            Signal::Cabal(a) => a.source_id(),
        }
    }

    pub fn confidence(&self) -> f64 {
        let raw = match self {
            Signal::FreshWallet(m) => m.match_score,
            Signal::Cabal(a) => a.aggregate_score,
        };
        sentinel_core::types::clamp_unit(raw)
    }
}

/// Machine-readable decision reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    Approved,
    BreakerTripped,
    BelowConfidenceFloor,
    DustSize,
    SizeLimitExceeded,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::Approved => "approved",
            DecisionReason::BreakerTripped => "breaker_tripped",
            DecisionReason::BelowConfidenceFloor => "below_confidence_floor",
            DecisionReason::DustSize => "dust_size",
            DecisionReason::SizeLimitExceeded => "size_limit_exceeded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "approved" => Some(DecisionReason::Approved),
            "breaker_tripped" => Some(DecisionReason::BreakerTripped),
            "below_confidence_floor" => Some(DecisionReason::BelowConfidenceFloor),
            "dust_size" => Some(DecisionReason::DustSize),
            "size_limit_exceeded" => Some(DecisionReason::SizeLimitExceeded),
            _ => None,
        }
    }
}

/// Admission decision returned to the execution layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub decision_id: Uuid,
    pub source_id: String,
    pub signal_kind: SignalKind,
    pub approve: bool,
    pub reason: DecisionReason,
    /// Capital to deploy; zero on denial.
    pub suggested_size: Decimal,
    /// `suggested_size / capital`, within `[0, max_single_trade_pct]`.
    pub suggested_fraction: Decimal,
    pub confidence: f64,
    pub multiplier: f64,
    pub decided_at: DateTime<Utc>,
}

/// Admission settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Minimum match score for fresh-wallet signals.
    pub fresh_wallet_floor: f64,
    /// Minimum aggregate score for cabal signals.
    pub cabal_floor: f64,
    /// Multiplier for sources without enough history.
    pub default_multiplier: f64,
    /// Trades needed before a source's win rate is trusted.
    pub min_history_trades: u32,
    /// Win rate that maps to a multiplier of 1.0.
    pub baseline_win_rate: f64,
    pub max_multiplier: f64,
    /// Smallest size worth trading, as a fraction of capital.
    pub dust_pct: Decimal,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            fresh_wallet_floor: 0.75,
            cabal_floor: 0.60,
            default_multiplier: 0.5,
            min_history_trades: 5,
            baseline_win_rate: 0.5,
            max_multiplier: 2.0,
            dust_pct: Decimal::new(1, 3),
        }
    }
}

impl AdmissionConfig {
    pub fn validate(&self) -> Result<()> {
        require_unit("admission.fresh_wallet_floor", self.fresh_wallet_floor)?;
        require_unit("admission.cabal_floor", self.cabal_floor)?;
        require_unit("admission.baseline_win_rate", self.baseline_win_rate)?;
        if self.baseline_win_rate == 0.0 {
            return Err(Error::config("admission.baseline_win_rate must be positive"));
        }
        if !(0.0..=self.max_multiplier).contains(&self.default_multiplier) {
            return Err(Error::config(format!(
                "admission.default_multiplier must be within [0, {}], got {}",
                self.max_multiplier, self.default_multiplier
            )));
        }
        if self.dust_pct < Decimal::ZERO || self.dust_pct >= Decimal::ONE {
            return Err(Error::config(format!(
                "admission.dust_pct must be within [0, 1), got {}",
                self.dust_pct
            )));
        }
        Ok(())
    }

    pub fn floor(&self, kind: SignalKind) -> f64 {
        match kind {
            SignalKind::FreshWallet => self.fresh_wallet_floor,
            SignalKind::Cabal => self.cabal_floor,
        }
    }
}

/// Admission Coordinator.
pub struct AdmissionCoordinator {
    config: AdmissionConfig,
    ledger: Arc<AttributionLedger>,
    breaker: Arc<CircuitBreaker>,
    audit: Option<Arc<AuditLogger>>,
}

impl AdmissionCoordinator {
    pub fn new(
        config: AdmissionConfig,
        ledger: Arc<AttributionLedger>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            config,
            ledger,
            breaker,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    pub fn evaluate(&self, signal: &Signal) -> Decision {
        self.evaluate_at(signal, Utc::now())
    }

    pub fn evaluate_at(&self, signal: &Signal, now: DateTime<Utc>) -> Decision {
        let decision = self.decide(signal, now);

        if decision.approve {
            info!(
                source_id = %decision.source_id,
                size = %decision.suggested_size,
                confidence = decision.confidence,
                multiplier = decision.multiplier,
                "Signal admitted"
            );
        } else {
            debug!(
                source_id = %decision.source_id,
                reason = decision.reason.as_str(),
                "Signal denied"
            );
        }

        if let Some(audit) = &self.audit {
            audit.log(decision.clone());
        }
        decision
    }

    fn decide(&self, signal: &Signal, now: DateTime<Utc>) -> Decision {
        let mut decision = Decision {
            decision_id: Uuid::new_v4(),
            source_id: signal.source_id(),
            signal_kind: signal.kind(),
            approve: false,
            reason: DecisionReason::BreakerTripped,
            suggested_size: Decimal::ZERO,
            suggested_fraction: Decimal::ZERO,
            confidence: signal.confidence(),
            multiplier: 0.0,
            decided_at: now,
        };

        if self.breaker.is_locked() {
            return decision;
        }

        if decision.confidence < self.config.floor(decision.signal_kind) {
            decision.reason = DecisionReason::BelowConfidenceFloor;
            return decision;
        }

        decision.multiplier = self.history_multiplier(&decision.source_id);

        let limits = self.breaker.limits();
        let weight = Decimal::from_f64(decision.confidence * decision.multiplier)
            .unwrap_or(Decimal::ZERO);
        let fraction = (weight * limits.max_single_trade_pct)
            .max(Decimal::ZERO)
            .min(limits.max_single_trade_pct);
        let size = (limits.capital * fraction).round_dp(6);

        if size < limits.capital * self.config.dust_pct || size <= Decimal::ZERO {
            decision.reason = DecisionReason::DustSize;
            return decision;
        }

        if self.breaker.check_trade_size(size, Decimal::ZERO).is_err() {
            decision.reason = DecisionReason::SizeLimitExceeded;
            return decision;
        }

        decision.approve = true;
        decision.reason = DecisionReason::Approved;
        decision.suggested_size = size;
        decision.suggested_fraction = fraction;
        decision
    }

    /// Historical win rate relative to baseline, or the conservative
    /// default when the source has too little history.
    fn history_multiplier(&self, source_id: &str) -> f64 {
        match self.ledger.get(source_id) {
            Some(record) if record.total_trades >= self.config.min_history_trades => {
                (record.win_rate / self.config.baseline_win_rate)
                    .clamp(0.0, self.config.max_multiplier)
            }
            _ => self.config.default_multiplier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use risk_manager::RiskLimits;
    use signal_attribution::{AttributionConfig, CompletionDiagnostics, TradeCompletion};

    fn fresh_signal(score: f64) -> Signal {
        Signal::FreshWallet(FreshWalletMatch {
            id: Uuid::new_v4(),
            withdrawal_ref: "wd-1".into(),
            source_exchange: "binance".into(),
            target_wallet: "fresh-1".into(),
            transfer_tx: "tx-1".into(),
            time_delta_ms: 10_000,
            match_score: score,
            amount: Decimal::new(995, 1),
            linked_parent: None,
            created_at: Utc::now(),
        })
    }

    fn cabal_signal(score: f64) -> Signal {
        Signal::Cabal(ClusterAlert {
            alert_id: Uuid::new_v4(),
            cluster_id: Uuid::new_v4(),
            members: vec!["a".into(), "b".into(), "c".into()],
            aggregate_score: score,
            shared_contract_count: 2,
            triggered_at: Utc::now(),
        })
    }

    fn coordinator() -> (AdmissionCoordinator, Arc<AttributionLedger>, Arc<CircuitBreaker>) {
        let ledger = Arc::new(AttributionLedger::new(AttributionConfig::default()));
        let breaker = Arc::new(CircuitBreaker::new(RiskLimits::default()));
        let coord =
            AdmissionCoordinator::new(AdmissionConfig::default(), ledger.clone(), breaker.clone());
        (coord, ledger, breaker)
    }

    async fn seed(ledger: &AttributionLedger, source: &str, wins: u32, losses: u32) {
        for i in 0..(wins + losses) {
            let won = i < wins;
            ledger
                .record_completion(&TradeCompletion {
                    trade_id: Uuid::new_v4(),
                    source_id: source.to_string(),
                    source_type: SourceType::FreshWallet,
                    pnl: if won { Decimal::new(5, 0) } else { Decimal::new(-5, 0) },
                    pnl_pct: if won { 0.05 } else { -0.05 },
                    won,
                    position_size: Decimal::new(10, 0),
                    completed_at: Utc::now(),
                    diagnostics: CompletionDiagnostics::default(),
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_unknown_source_gets_conservative_size() {
        let (coord, _, _) = coordinator();
        let decision = coord.evaluate(&fresh_signal(0.8));

        assert!(decision.approve);
        assert_eq!(decision.reason, DecisionReason::Approved);
        assert_eq!(decision.multiplier, 0.5);
        // 0.8 * 0.5 * 2% of 1000
        assert_eq!(decision.suggested_size, Decimal::new(8, 0));
        assert_eq!(decision.source_id, "fresh_wallet:binance");
    }

    #[tokio::test]
    async fn test_history_scales_size_and_clamps() {
        let (coord, ledger, _) = coordinator();
        seed(&ledger, "fresh_wallet:binance", 5, 0).await;

        let decision = coord.evaluate(&fresh_signal(0.9));
        assert!(decision.approve);
        assert_eq!(decision.multiplier, 2.0);
        // 0.9 * 2.0 = 1.8 is capped at the full single-trade fraction
        assert_eq!(decision.suggested_fraction, Decimal::new(2, 2));
        assert_eq!(decision.suggested_size, Decimal::new(20, 0));
    }

    #[tokio::test]
    async fn test_denials_carry_reasons() {
        let (coord, ledger, breaker) = coordinator();

        let low = coord.evaluate(&fresh_signal(0.7));
        assert!(!low.approve);
        assert_eq!(low.reason, DecisionReason::BelowConfidenceFloor);
        assert_eq!(low.suggested_size, Decimal::ZERO);

        // cabal floor is lower than the fresh wallet floor
        assert!(coord.evaluate(&cabal_signal(0.7)).approve);
        assert!(!coord.evaluate(&cabal_signal(0.5)).approve);

        seed(&ledger, "fresh_wallet:binance", 0, 5).await;
        let dust = coord.evaluate(&fresh_signal(0.95));
        assert_eq!(dust.reason, DecisionReason::DustSize);

        breaker.manual_trip().await.unwrap();
        let locked = coord.evaluate(&cabal_signal(0.99));
        assert!(!locked.approve);
        assert_eq!(locked.reason, DecisionReason::BreakerTripped);
    }

    #[tokio::test]
    async fn test_never_approves_while_tripped() {
        let (coord, ledger, breaker) = coordinator();
        seed(&ledger, "fresh_wallet:binance", 10, 0).await;
        breaker.manual_trip().await.unwrap();

        for score in [0.0, 0.5, 0.75, 0.9, 1.0, 7.0] {
            assert!(!coord.evaluate(&fresh_signal(score)).approve);
            assert!(!coord.evaluate(&cabal_signal(score)).approve);
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(AdmissionConfig::default().validate().is_ok());
        let bad = AdmissionConfig {
            cabal_floor: 1.5,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(Error::Configuration { .. })));
    }

    #[test]
    fn test_reason_roundtrip() {
        for reason in [
            DecisionReason::Approved,
            DecisionReason::BreakerTripped,
            DecisionReason::BelowConfidenceFloor,
            DecisionReason::DustSize,
            DecisionReason::SizeLimitExceeded,
        ] {
            assert_eq!(DecisionReason::parse(reason.as_str()), Some(reason));
        }
    }
}
