//! Circuit breaker for emergency trading halts.
//!
//! All state transitions go through [`CircuitBreaker::transition`], which
//! holds the write lock for the whole read-modify-persist cycle. Persisted
//! saves are compare-and-set on the last version known to be stored; a lost
//! race reloads the row, re-applies the operation once and otherwise
//! surfaces `StateConflict`. A save that fails for any other reason leaves
//! memory ahead of the store until the next transition catches it up.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use sentinel_core::{Error, Result};

use crate::circuit_breaker_repo::BreakerStore;

/// Reason for circuit breaker activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripReason {
    /// Daily P&L fell to or below the drawdown limit.
    DailyDrawdown,
    /// Too many losing trades in a row.
    ConsecutiveLosses,
    /// More open positions than allowed.
    OpenPositions,
    /// Deployed capital above the exposure cap.
    Exposure,
    /// Operator panic button.
    Manual,
}

impl TripReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TripReason::DailyDrawdown => "daily_drawdown",
            TripReason::ConsecutiveLosses => "consecutive_losses",
            TripReason::OpenPositions => "open_positions",
            TripReason::Exposure => "exposure",
            TripReason::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "daily_drawdown" => Some(TripReason::DailyDrawdown),
            "consecutive_losses" => Some(TripReason::ConsecutiveLosses),
            "open_positions" => Some(TripReason::OpenPositions),
            "exposure" => Some(TripReason::Exposure),
            "manual" => Some(TripReason::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStatus {
    Armed,
    Tripped,
}

impl BreakerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerStatus::Armed => "armed",
            BreakerStatus::Tripped => "tripped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "armed" => Some(BreakerStatus::Armed),
            "tripped" => Some(BreakerStatus::Tripped),
            _ => None,
        }
    }
}

/// Risk thresholds. Percentages are fractions of `capital`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    pub capital: Decimal,
    pub max_daily_drawdown_pct: Decimal,
    pub max_single_trade_pct: Decimal,
    pub max_position_size_pct: Decimal,
    pub max_open_positions: u32,
    pub max_consecutive_losses: u32,
    pub max_total_exposure_pct: Decimal,
    pub lockdown_hours: i64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            capital: Decimal::new(1000, 0),
            max_daily_drawdown_pct: Decimal::new(10, 2),
            max_single_trade_pct: Decimal::new(2, 2),
            max_position_size_pct: Decimal::new(5, 2),
            max_open_positions: 10,
            max_consecutive_losses: 3,
            max_total_exposure_pct: Decimal::new(50, 2),
            lockdown_hours: 24,
        }
    }
}

impl RiskLimits {
    pub fn validate(&self) -> Result<()> {
        if self.capital <= Decimal::ZERO {
            return Err(Error::config(format!(
                "risk.capital must be positive, got {}",
                self.capital
            )));
        }
        for (name, value) in [
            ("risk.max_daily_drawdown_pct", self.max_daily_drawdown_pct),
            ("risk.max_single_trade_pct", self.max_single_trade_pct),
            ("risk.max_position_size_pct", self.max_position_size_pct),
            ("risk.max_total_exposure_pct", self.max_total_exposure_pct),
        ] {
            if value <= Decimal::ZERO || value > Decimal::ONE {
                return Err(Error::config(format!(
                    "{name} must be in (0, 1], got {value}"
                )));
            }
        }
        if self.max_consecutive_losses == 0 {
            return Err(Error::config("risk.max_consecutive_losses must be positive"));
        }
        if self.lockdown_hours <= 0 {
            return Err(Error::config(format!(
                "risk.lockdown_hours must be positive, got {}",
                self.lockdown_hours
            )));
        }
        Ok(())
    }

    pub fn single_trade_cap(&self) -> Decimal {
        self.capital * self.max_single_trade_pct
    }

    pub fn position_cap(&self) -> Decimal {
        self.capital * self.max_position_size_pct
    }

    pub fn exposure_cap(&self) -> Decimal {
        self.capital * self.max_total_exposure_pct
    }

    pub fn lockdown(&self) -> Duration {
        Duration::hours(self.lockdown_hours)
    }
}

/// Per-trade size violation. Denies the trade without tripping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SizeViolation {
    NonPositive { size: Decimal },
    SingleTrade { size: Decimal, limit: Decimal },
    PositionSize { size: Decimal, limit: Decimal },
}

/// The breaker's singleton state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub status: BreakerStatus,
    pub lock_reason: Option<TripReason>,
    pub locked_at: Option<DateTime<Utc>>,
    pub unlock_at: Option<DateTime<Utc>>,
    pub daily_pnl: Decimal,
    /// `daily_pnl / capital`.
    pub daily_pnl_pct: Decimal,
    pub consecutive_losses: u32,
    pub open_position_count: u32,
    pub total_exposure: Decimal,
    pub trips_today: u32,
    /// UTC day `daily_pnl` belongs to.
    pub trading_day: NaiveDate,
    /// Bumped on every persisted change.
    pub version: i64,
}

impl CircuitBreakerState {
    pub fn new(trading_day: NaiveDate) -> Self {
        Self {
            status: BreakerStatus::Armed,
            lock_reason: None,
            locked_at: None,
            unlock_at: None,
            daily_pnl: Decimal::ZERO,
            daily_pnl_pct: Decimal::ZERO,
            consecutive_losses: 0,
            open_position_count: 0,
            total_exposure: Decimal::ZERO,
            trips_today: 0,
            trading_day,
            version: 0,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.status == BreakerStatus::Tripped
    }

    /// First limit currently breached, if any.
    pub fn breached(&self, limits: &RiskLimits) -> Option<TripReason> {
        if self.daily_pnl_pct <= -limits.max_daily_drawdown_pct {
            return Some(TripReason::DailyDrawdown);
        }
        if self.consecutive_losses >= limits.max_consecutive_losses {
            return Some(TripReason::ConsecutiveLosses);
        }
        if self.open_position_count > limits.max_open_positions {
            return Some(TripReason::OpenPositions);
        }
        if self.total_exposure > limits.exposure_cap() {
            return Some(TripReason::Exposure);
        }
        None
    }

    fn trip(&mut self, reason: TripReason, limits: &RiskLimits, now: DateTime<Utc>) {
        self.status = BreakerStatus::Tripped;
        self.lock_reason = Some(reason);
        self.locked_at = Some(now);
        self.unlock_at = Some(now + limits.lockdown());
        self.trips_today += 1;
    }

    /// Trip on a breached limit unless already tripped.
    fn trip_if_breached(&mut self, limits: &RiskLimits, now: DateTime<Utc>) -> Option<TripReason> {
        if self.is_locked() {
            return None;
        }
        let reason = self.breached(limits)?;
        self.trip(reason, limits, now);
        Some(reason)
    }

    fn arm(&mut self) {
        self.status = BreakerStatus::Armed;
        self.lock_reason = None;
        self.locked_at = None;
        self.unlock_at = None;
    }

    /// Start a new trading day if `now` is past the current one.
    fn roll_day(&mut self, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        if today <= self.trading_day {
            return false;
        }
        self.trading_day = today;
        self.daily_pnl = Decimal::ZERO;
        self.daily_pnl_pct = Decimal::ZERO;
        self.trips_today = 0;
        true
    }

    fn recompute_pnl_pct(&mut self, limits: &RiskLimits) {
        self.daily_pnl_pct = if limits.capital > Decimal::ZERO {
            self.daily_pnl / limits.capital
        } else {
            Decimal::ZERO
        };
    }

    fn release(&mut self, size: Decimal) {
        self.open_position_count = self.open_position_count.saturating_sub(1);
        self.total_exposure = (self.total_exposure - size).max(Decimal::ZERO);
    }

    /// Carry a lock and loss streak that never reached the store onto a
    /// freshly loaded row.
    fn keep_unsaved_lock(&mut self, local: &CircuitBreakerState) {
        self.consecutive_losses = self.consecutive_losses.max(local.consecutive_losses);
        if !local.is_locked() || self.is_locked() {
            return;
        }
        self.status = local.status;
        self.lock_reason = local.lock_reason;
        self.locked_at = local.locked_at;
        self.unlock_at = local.unlock_at;
        self.trips_today = self.trips_today.max(local.trips_today);
    }
}

/// Outcome of a reset attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResetOutcome {
    Rearmed,
    AlreadyArmed,
    StillLocked { unlock_at: DateTime<Utc> },
    /// Unlocked, but a limit other than the loss streak still holds.
    Retripped { reason: TripReason },
}

/// Read-only view for operational tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: CircuitBreakerState,
    pub limits: RiskLimits,
}

/// Circuit breaker for emergency trading halts.
pub struct CircuitBreaker {
    limits: RiskLimits,
    state: Arc<RwLock<CircuitBreakerState>>,
    /// Fast path flag for checking if locked.
    locked: AtomicBool,
    /// Version of the row as last written or read. Lags `state.version`
    /// while a save is outstanding.
    persisted_version: AtomicI64,
    store: Option<Arc<dyn BreakerStore>>,
}

impl CircuitBreaker {
    /// Create a circuit breaker without persistence.
    pub fn new(limits: RiskLimits) -> Self {
        Self::from_state(limits, CircuitBreakerState::new(Utc::now().date_naive()))
    }

    /// Create a circuit breaker starting from a known state.
    pub fn from_state(limits: RiskLimits, state: CircuitBreakerState) -> Self {
        Self {
            limits,
            locked: AtomicBool::new(state.is_locked()),
            persisted_version: AtomicI64::new(state.version),
            state: Arc::new(RwLock::new(state)),
            store: None,
        }
    }

    /// Create a circuit breaker persisting through `store`.
    pub fn with_store(limits: RiskLimits, store: Arc<dyn BreakerStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::new(limits)
        }
    }

    /// Load persisted state. Call once during startup.
    pub async fn load_state(&self) -> Result<bool> {
        let Some(store) = &self.store else {
            warn!("Cannot load circuit breaker state: no store configured");
            return Ok(false);
        };
        let Some(loaded) = store.load().await? else {
            return Ok(false);
        };

        info!(
            status = loaded.status.as_str(),
            daily_pnl = %loaded.daily_pnl,
            consecutive_losses = loaded.consecutive_losses,
            version = loaded.version,
            "Loaded circuit breaker state"
        );
        let mut state = self.state.write().await;
        self.persisted_version.store(loaded.version, Ordering::SeqCst);
        self.install(&mut state, loaded);
        Ok(true)
    }

    /// Check if trading is halted (fast path).
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    pub async fn state(&self) -> CircuitBreakerState {
        self.state.read().await.clone()
    }

    pub async fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state().await,
            limits: self.limits.clone(),
        }
    }

    /// Check a proposed trade against the per-trade limits.
    ///
    /// `existing_position` is capital already deployed in the same token.
    /// Independent of lock state and never trips the breaker.
    pub fn check_trade_size(
        &self,
        size: Decimal,
        existing_position: Decimal,
    ) -> std::result::Result<(), SizeViolation> {
        if size <= Decimal::ZERO {
            return Err(SizeViolation::NonPositive { size });
        }
        let single = self.limits.single_trade_cap();
        if size > single {
            return Err(SizeViolation::SingleTrade {
                size,
                limit: single,
            });
        }
        let position = self.limits.position_cap();
        if existing_position + size > position {
            return Err(SizeViolation::PositionSize {
                size: existing_position + size,
                limit: position,
            });
        }
        Ok(())
    }

    /// Record a completed trade. Returns the trip reason if this completion
    /// tripped the breaker.
    pub async fn record_trade_result(
        &self,
        pnl: Decimal,
        won: bool,
        released: Decimal,
    ) -> Result<Option<TripReason>> {
        self.record_trade_result_at(pnl, won, released, Utc::now())
            .await
    }

    pub async fn record_trade_result_at(
        &self,
        pnl: Decimal,
        won: bool,
        released: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Option<TripReason>> {
        let tripped = self
            .transition(|state, limits| {
                state.roll_day(now);
                state.daily_pnl += pnl;
                state.recompute_pnl_pct(limits);
                if won {
                    state.consecutive_losses = 0;
                } else {
                    state.consecutive_losses += 1;
                }
                state.release(released);
                state.trip_if_breached(limits, now)
            })
            .await?;

        if let Some(reason) = tripped {
            self.log_trip(reason, now);
        }
        Ok(tripped)
    }

    /// Account for a newly opened position.
    pub async fn record_position_opened(&self, size: Decimal) -> Result<Option<TripReason>> {
        self.record_position_opened_at(size, Utc::now()).await
    }

    pub async fn record_position_opened_at(
        &self,
        size: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Option<TripReason>> {
        let tripped = self
            .transition(|state, limits| {
                state.roll_day(now);
                state.open_position_count += 1;
                state.total_exposure += size;
                state.trip_if_breached(limits, now)
            })
            .await?;

        if let Some(reason) = tripped {
            self.log_trip(reason, now);
        }
        Ok(tripped)
    }

    /// Operator halt. Returns false if already locked.
    pub async fn manual_trip(&self) -> Result<bool> {
        self.manual_trip_at(Utc::now()).await
    }

    pub async fn manual_trip_at(&self, now: DateTime<Utc>) -> Result<bool> {
        let tripped = self
            .transition(|state, limits| {
                if state.is_locked() {
                    return false;
                }
                state.trip(TripReason::Manual, limits, now);
                true
            })
            .await?;

        if tripped {
            self.log_trip(TripReason::Manual, now);
        }
        Ok(tripped)
    }

    /// Attempt to re-arm. Succeeds only once `unlock_at` has passed; clears
    /// the loss streak but keeps today's P&L.
    pub async fn reset(&self) -> Result<ResetOutcome> {
        self.reset_at(Utc::now()).await
    }

    pub async fn reset_at(&self, now: DateTime<Utc>) -> Result<ResetOutcome> {
        let outcome = self
            .transition(|state, limits| {
                state.roll_day(now);
                if !state.is_locked() {
                    return ResetOutcome::AlreadyArmed;
                }
                let unlock_at = state.unlock_at.unwrap_or(now);
                if now < unlock_at {
                    return ResetOutcome::StillLocked { unlock_at };
                }
                state.consecutive_losses = 0;
                state.arm();
                match state.trip_if_breached(limits, now) {
                    Some(reason) => ResetOutcome::Retripped { reason },
                    None => ResetOutcome::Rearmed,
                }
            })
            .await?;

        match &outcome {
            ResetOutcome::Rearmed => info!("Circuit breaker re-armed"),
            ResetOutcome::Retripped { reason } => self.log_trip(*reason, now),
            _ => {}
        }
        Ok(outcome)
    }

    /// Start a new trading day if the UTC date has changed. Lock state is
    /// untouched.
    pub async fn roll_day(&self) -> Result<bool> {
        self.roll_day_at(Utc::now()).await
    }

    pub async fn roll_day_at(&self, now: DateTime<Utc>) -> Result<bool> {
        let rolled = self.transition(|state, _| state.roll_day(now)).await?;
        if rolled {
            info!(day = %now.date_naive(), "Circuit breaker daily counters reset");
        }
        Ok(rolled)
    }

    /// The single serialized update path.
    async fn transition<T, F>(&self, op: F) -> Result<T>
    where
        F: Fn(&mut CircuitBreakerState, &RiskLimits) -> T,
    {
        let mut current = self.state.write().await;
        let persisted = self.persisted_version.load(Ordering::SeqCst);
        let unsaved = current.version != persisted;

        let mut next = current.clone();
        let outcome = op(&mut next, &self.limits);
        if next == *current && !unsaved {
            return Ok(outcome);
        }
        next.version = current.version + 1;

        let Some(store) = &self.store else {
            self.persisted_version.store(next.version, Ordering::SeqCst);
            self.install(&mut current, next);
            return Ok(outcome);
        };

        match store.save(&next, persisted).await {
            Ok(()) => {
                if unsaved {
                    info!(version = next.version, "Circuit breaker state caught up with store");
                }
                self.persisted_version.store(next.version, Ordering::SeqCst);
                self.install(&mut current, next);
                Ok(outcome)
            }
            Err(Error::StateConflict { message }) => {
                warn!(message = %message, "Circuit breaker update lost a race, retrying once");
                let mut retried = store
                    .load()
                    .await?
                    .ok_or_else(|| Error::conflict("circuit breaker state row missing"))?;
                let base_version = retried.version;
                let outcome = op(&mut retried, &self.limits);
                if unsaved {
                    retried.keep_unsaved_lock(&current);
                }
                retried.version = base_version + 1;
                match store.save(&retried, base_version).await {
                    Ok(()) => {
                        self.persisted_version.store(retried.version, Ordering::SeqCst);
                        self.install(&mut current, retried);
                        Ok(outcome)
                    }
                    Err(e @ Error::StateConflict { .. }) => Err(e),
                    Err(e) => {
                        error!(error = %e, "Failed to persist circuit breaker state");
                        self.persisted_version.store(base_version, Ordering::SeqCst);
                        self.install(&mut current, retried);
                        Ok(outcome)
                    }
                }
            }
            Err(e) => {
                error!(
                    error = %e,
                    persisted_version = persisted,
                    "Failed to persist circuit breaker state"
                );
                self.install(&mut current, next);
                Ok(outcome)
            }
        }
    }

    fn install(&self, current: &mut CircuitBreakerState, next: CircuitBreakerState) {
        self.locked.store(next.is_locked(), Ordering::SeqCst);
        *current = next;
    }

    fn log_trip(&self, reason: TripReason, now: DateTime<Utc>) {
        error!(
            reason = reason.as_str(),
            unlock_at = %(now + self.limits.lockdown()),
            "CIRCUIT BREAKER TRIPPED"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker_repo::MemoryBreakerStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use tokio_test::assert_ok;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).unwrap()
    }

    fn breaker(limits: RiskLimits) -> CircuitBreaker {
        CircuitBreaker::from_state(limits, CircuitBreakerState::new(at(0).date_naive()))
    }

    fn loss() -> Decimal {
        Decimal::new(-1, 0)
    }

    #[tokio::test]
    async fn test_consecutive_losses_trip() {
        let cb = breaker(RiskLimits::default());
        let now = at(9);

        assert_eq!(cb.record_trade_result_at(loss(), false, Decimal::ZERO, now).await.unwrap(), None);
        assert_eq!(cb.record_trade_result_at(loss(), false, Decimal::ZERO, now).await.unwrap(), None);
        assert!(!cb.is_locked());

        let reason = cb
            .record_trade_result_at(loss(), false, Decimal::ZERO, now)
            .await
            .unwrap();
        assert_eq!(reason, Some(TripReason::ConsecutiveLosses));
        assert!(cb.is_locked());

        let state = cb.state().await;
        assert_eq!(state.locked_at, Some(now));
        assert_eq!(state.unlock_at, Some(now + Duration::hours(24)));
    }

    #[tokio::test]
    async fn test_loss_at_limit_trips_with_full_lockdown() {
        let mut state = CircuitBreakerState::new(at(0).date_naive());
        state.consecutive_losses = 3;
        let cb = CircuitBreaker::from_state(RiskLimits::default(), state);
        let now = at(14);

        cb.record_trade_result_at(loss(), false, Decimal::ZERO, now)
            .await
            .unwrap();

        let state = cb.state().await;
        assert_eq!(state.status, BreakerStatus::Tripped);
        assert_eq!(state.unlock_at, Some(now + Duration::hours(24)));
    }

    #[tokio::test]
    async fn test_win_while_armed_keeps_status() {
        let cb = breaker(RiskLimits::default());
        let reason = cb
            .record_trade_result_at(Decimal::new(5, 0), true, Decimal::ZERO, at(9))
            .await
            .unwrap();
        assert_eq!(reason, None);

        let state = cb.state().await;
        assert_eq!(state.status, BreakerStatus::Armed);
        assert_eq!(state.lock_reason, None);
        assert_eq!(state.unlock_at, None);
        assert_eq!(state.consecutive_losses, 0);
    }

    #[tokio::test]
    async fn test_concurrent_losses_trip_once() {
        let cb = Arc::new(breaker(RiskLimits::default()));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let cb = cb.clone();
            handles.push(tokio::spawn(async move {
                cb.record_trade_result_at(loss(), false, Decimal::ZERO, at(9))
                    .await
                    .unwrap()
            }));
        }

        let mut trips = 0;
        for h in handles {
            if h.await.unwrap().is_some() {
                trips += 1;
            }
        }
        assert_eq!(trips, 1);

        let state = cb.state().await;
        assert_eq!(state.trips_today, 1);
        assert_eq!(state.consecutive_losses, 10);
    }

    #[tokio::test]
    async fn test_reset_waits_for_unlock_and_keeps_daily_pnl() {
        let cb = breaker(RiskLimits::default());
        assert_eq!(cb.reset_at(at(1)).await.unwrap(), ResetOutcome::AlreadyArmed);

        for _ in 0..3 {
            cb.record_trade_result_at(Decimal::new(-10, 0), false, Decimal::ZERO, at(1))
                .await
                .unwrap();
        }
        assert!(cb.is_locked());

        let early = cb.reset_at(at(5)).await.unwrap();
        assert_eq!(
            early,
            ResetOutcome::StillLocked {
                unlock_at: at(1) + Duration::hours(24)
            }
        );
        assert!(cb.is_locked());

        // past unlock but still the next day: daily P&L was rolled
        let later = at(1) + Duration::hours(24);
        assert_eq!(cb.reset_at(later).await.unwrap(), ResetOutcome::Rearmed);
        assert!(!cb.is_locked());
        assert_eq!(cb.state().await.consecutive_losses, 0);
    }

    #[tokio::test]
    async fn test_reset_does_not_forgive_drawdown() {
        let limits = RiskLimits {
            max_consecutive_losses: 100,
            lockdown_hours: 1,
            ..Default::default()
        };
        let cb = breaker(limits);

        let reason = cb
            .record_trade_result_at(Decimal::new(-100, 0), false, Decimal::ZERO, at(1))
            .await
            .unwrap();
        assert_eq!(reason, Some(TripReason::DailyDrawdown));
        assert_eq!(cb.state().await.daily_pnl_pct, Decimal::new(-10, 2));

        let outcome = cb.reset_at(at(3)).await.unwrap();
        assert_eq!(
            outcome,
            ResetOutcome::Retripped {
                reason: TripReason::DailyDrawdown
            }
        );
        let state = cb.state().await;
        assert!(state.is_locked());
        assert_eq!(state.daily_pnl, Decimal::new(-100, 0));
        assert_eq!(state.unlock_at, Some(at(3) + Duration::hours(1)));
    }

    #[tokio::test]
    async fn test_day_roll_keeps_lock() {
        let cb = breaker(RiskLimits::default());
        cb.manual_trip_at(at(23)).await.unwrap();
        cb.record_trade_result_at(Decimal::new(-30, 0), false, Decimal::ZERO, at(23))
            .await
            .unwrap();

        assert!(cb.roll_day_at(at(23) + Duration::hours(2)).await.unwrap());
        let state = cb.state().await;
        assert!(state.is_locked());
        assert_eq!(state.daily_pnl, Decimal::ZERO);
        assert_eq!(state.trips_today, 0);

        assert!(!cb.roll_day_at(at(23) + Duration::hours(3)).await.unwrap());
    }

    #[tokio::test]
    async fn test_position_limits_trip() {
        let limits = RiskLimits {
            max_open_positions: 2,
            ..Default::default()
        };
        let cb = breaker(limits);
        let size = Decimal::new(10, 0);

        assert_eq!(cb.record_position_opened_at(size, at(9)).await.unwrap(), None);
        assert_eq!(cb.record_position_opened_at(size, at(9)).await.unwrap(), None);
        assert_eq!(
            cb.record_position_opened_at(size, at(9)).await.unwrap(),
            Some(TripReason::OpenPositions)
        );

        let exposure = breaker(RiskLimits::default());
        assert_eq!(
            exposure
                .record_position_opened_at(Decimal::new(600, 0), at(9))
                .await
                .unwrap(),
            Some(TripReason::Exposure)
        );
    }

    #[tokio::test]
    async fn test_completion_releases_exposure() {
        let cb = breaker(RiskLimits::default());
        cb.record_position_opened_at(Decimal::new(20, 0), at(9))
            .await
            .unwrap();
        cb.record_trade_result_at(Decimal::new(2, 0), true, Decimal::new(20, 0), at(10))
            .await
            .unwrap();

        let state = cb.state().await;
        assert_eq!(state.open_position_count, 0);
        assert_eq!(state.total_exposure, Decimal::ZERO);
    }

    #[test]
    fn test_trade_size_checks() {
        let cb = breaker(RiskLimits::default());
        assert!(cb.check_trade_size(Decimal::new(20, 0), Decimal::ZERO).is_ok());
        assert!(matches!(
            cb.check_trade_size(Decimal::new(21, 0), Decimal::ZERO),
            Err(SizeViolation::SingleTrade { .. })
        ));
        assert!(matches!(
            cb.check_trade_size(Decimal::new(15, 0), Decimal::new(40, 0)),
            Err(SizeViolation::PositionSize { .. })
        ));
        assert!(matches!(
            cb.check_trade_size(Decimal::ZERO, Decimal::ZERO),
            Err(SizeViolation::NonPositive { .. })
        ));
        assert!(!cb.is_locked());
    }

    #[tokio::test]
    async fn test_manual_trip_is_not_repeated() {
        let cb = breaker(RiskLimits::default());
        assert!(cb.manual_trip_at(at(9)).await.unwrap());
        assert!(!cb.manual_trip_at(at(10)).await.unwrap());
        let state = cb.state().await;
        assert_eq!(state.lock_reason, Some(TripReason::Manual));
        assert_eq!(state.unlock_at, Some(at(9) + Duration::hours(24)));
    }

    #[tokio::test]
    async fn test_lost_race_is_retried_against_fresh_state() {
        let store = Arc::new(MemoryBreakerStore::new(CircuitBreakerState::new(
            at(0).date_naive(),
        )));
        let first = CircuitBreaker::with_store(RiskLimits::default(), store.clone());
        let second = CircuitBreaker::with_store(RiskLimits::default(), store.clone());
        first.load_state().await.unwrap();
        second.load_state().await.unwrap();

        first
            .record_trade_result_at(loss(), false, Decimal::ZERO, at(9))
            .await
            .unwrap();
        // second still holds version 0
        second
            .record_trade_result_at(loss(), false, Decimal::ZERO, at(9))
            .await
            .unwrap();

        let persisted = store.current().await.unwrap();
        assert_eq!(persisted.consecutive_losses, 2);
        assert_eq!(persisted.version, 2);
        assert_eq!(second.state().await, persisted);
    }

    struct AlwaysConflicting;

    #[async_trait]
    impl BreakerStore for AlwaysConflicting {
        async fn load(&self) -> Result<Option<CircuitBreakerState>> {
            Ok(Some(CircuitBreakerState::new(at(0).date_naive())))
        }

        async fn save(&self, _state: &CircuitBreakerState, _expected: i64) -> Result<()> {
            Err(Error::conflict("version moved"))
        }
    }

    #[tokio::test]
    async fn test_second_conflict_is_surfaced() {
        let cb = CircuitBreaker::with_store(RiskLimits::default(), Arc::new(AlwaysConflicting));
        let result = cb
            .record_trade_result_at(loss(), false, Decimal::ZERO, at(9))
            .await;
        assert!(matches!(result, Err(Error::StateConflict { .. })));
        assert_eq!(cb.state().await.consecutive_losses, 0);
    }

    #[tokio::test]
    async fn test_store_outage_keeps_local_state() {
        let store = Arc::new(MemoryBreakerStore::new(CircuitBreakerState::new(
            at(0).date_naive(),
        )));
        let cb = CircuitBreaker::with_store(RiskLimits::default(), store.clone());
        cb.load_state().await.unwrap();
        store.set_available(false);

        cb.manual_trip_at(at(9)).await.unwrap();
        assert!(cb.is_locked());
        assert!(!store.current().await.unwrap().is_locked());
    }

    #[tokio::test]
    async fn test_trip_survives_store_outage_and_is_written_later() {
        let store = Arc::new(MemoryBreakerStore::new(CircuitBreakerState::new(
            at(0).date_naive(),
        )));
        let cb = CircuitBreaker::with_store(RiskLimits::default(), store.clone());
        cb.load_state().await.unwrap();

        store.set_available(false);
        assert_ok!(cb.manual_trip_at(at(9)).await);
        store.set_available(true);

        assert_ok!(
            cb.record_trade_result_at(Decimal::new(5, 0), true, Decimal::ZERO, at(10))
                .await
        );

        let state = cb.state().await;
        assert!(cb.is_locked());
        assert_eq!(state.status, BreakerStatus::Tripped);
        assert_eq!(state.unlock_at, Some(at(9) + Duration::hours(24)));

        let persisted = store.current().await.unwrap();
        assert!(persisted.is_locked());
        assert_eq!(persisted, state);
    }

    #[tokio::test]
    async fn test_unsaved_trip_kept_when_another_writer_moved_the_row() {
        let store = Arc::new(MemoryBreakerStore::new(CircuitBreakerState::new(
            at(0).date_naive(),
        )));
        let local = CircuitBreaker::with_store(RiskLimits::default(), store.clone());
        let other = CircuitBreaker::with_store(RiskLimits::default(), store.clone());
        local.load_state().await.unwrap();
        other.load_state().await.unwrap();

        store.set_available(false);
        local.manual_trip_at(at(9)).await.unwrap();
        store.set_available(true);
        other
            .record_trade_result_at(loss(), false, Decimal::ZERO, at(9))
            .await
            .unwrap();

        local
            .record_trade_result_at(Decimal::new(5, 0), true, Decimal::ZERO, at(10))
            .await
            .unwrap();

        assert!(local.is_locked());
        let persisted = store.current().await.unwrap();
        assert!(persisted.is_locked());
        assert_eq!(persisted.lock_reason, Some(TripReason::Manual));
        assert_eq!(persisted.unlock_at, Some(at(9) + Duration::hours(24)));
        assert_eq!(persisted.daily_pnl, Decimal::new(4, 0));
    }

    #[test]
    fn test_limits_validation() {
        assert!(RiskLimits::default().validate().is_ok());
        let bad = RiskLimits {
            max_single_trade_pct: Decimal::new(15, 1),
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(Error::Configuration { .. })));
        let bad = RiskLimits {
            lockdown_hours: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
