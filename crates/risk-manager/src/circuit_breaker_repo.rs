//! Persistence for circuit breaker state.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;
use tracing::{debug, info};

use sentinel_core::db::classify;
use sentinel_core::{Error, Result};

use crate::circuit_breaker::{BreakerStatus, CircuitBreakerState, TripReason};

/// Storage for the singleton breaker row.
///
/// `save` is compare-and-set: it must fail with `StateConflict` when the
/// stored version differs from `expected_version`.
#[async_trait]
pub trait BreakerStore: Send + Sync {
    async fn load(&self) -> Result<Option<CircuitBreakerState>>;

    async fn save(&self, state: &CircuitBreakerState, expected_version: i64) -> Result<()>;
}

/// Repository for `circuit_breaker_state` (row `id = 1`).
pub struct CircuitBreakerRepository {
    pool: PgPool,
}

impl CircuitBreakerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BreakerStore for CircuitBreakerRepository {
    async fn load(&self) -> Result<Option<CircuitBreakerState>> {
        let row = sqlx::query(
            r#"
            SELECT
                status, lock_reason, locked_at, unlock_at,
                daily_pnl, daily_pnl_pct, consecutive_losses,
                open_position_count, total_exposure, trips_today,
                trading_day, version
            FROM circuit_breaker_state
            WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        let state = row.map(|r| {
            let status: String = r.get("status");
            let lock_reason: Option<String> = r.get("lock_reason");
            CircuitBreakerState {
                status: BreakerStatus::parse(&status).unwrap_or(BreakerStatus::Armed),
                lock_reason: lock_reason.and_then(|s| TripReason::parse(&s)),
                locked_at: r.get("locked_at"),
                unlock_at: r.get("unlock_at"),
                daily_pnl: r.get("daily_pnl"),
                daily_pnl_pct: r.get("daily_pnl_pct"),
                consecutive_losses: r.get::<i32, _>("consecutive_losses") as u32,
                open_position_count: r.get::<i32, _>("open_position_count") as u32,
                total_exposure: r.get("total_exposure"),
                trips_today: r.get::<i32, _>("trips_today") as u32,
                trading_day: r.get("trading_day"),
                version: r.get("version"),
            }
        });

        if let Some(ref s) = state {
            info!(
                status = s.status.as_str(),
                version = s.version,
                "Loaded circuit breaker state from database"
            );
        }
        Ok(state)
    }

    async fn save(&self, state: &CircuitBreakerState, expected_version: i64) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE circuit_breaker_state SET
                status = $1,
                lock_reason = $2,
                locked_at = $3,
                unlock_at = $4,
                daily_pnl = $5,
                daily_pnl_pct = $6,
                consecutive_losses = $7,
                open_position_count = $8,
                total_exposure = $9,
                trips_today = $10,
                trading_day = $11,
                version = $12,
                updated_at = NOW()
            WHERE id = 1 AND version = $13
            "#,
        )
        .bind(state.status.as_str())
        .bind(state.lock_reason.map(|r| r.as_str()))
        .bind(state.locked_at)
        .bind(state.unlock_at)
        .bind(state.daily_pnl)
        .bind(state.daily_pnl_pct)
        .bind(state.consecutive_losses as i32)
        .bind(state.open_position_count as i32)
        .bind(state.total_exposure)
        .bind(state.trips_today as i32)
        .bind(state.trading_day)
        .bind(state.version)
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        if result.rows_affected() == 0 {
            return Err(Error::conflict(format!(
                "circuit breaker row is no longer at version {expected_version}"
            )));
        }

        debug!(
            status = state.status.as_str(),
            version = state.version,
            "Saved circuit breaker state"
        );
        Ok(())
    }
}

/// In-process breaker store with the same compare-and-set contract.
pub struct MemoryBreakerStore {
    state: Mutex<Option<CircuitBreakerState>>,
    available: AtomicBool,
}

impl MemoryBreakerStore {
    pub fn new(initial: CircuitBreakerState) -> Self {
        Self {
            state: Mutex::new(Some(initial)),
            available: AtomicBool::new(true),
        }
    }

    pub fn empty() -> Self {
        Self {
            state: Mutex::new(None),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub async fn current(&self) -> Option<CircuitBreakerState> {
        self.state.lock().await.clone()
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::store("breaker store offline"))
        }
    }
}

#[async_trait]
impl BreakerStore for MemoryBreakerStore {
    async fn load(&self) -> Result<Option<CircuitBreakerState>> {
        self.check()?;
        Ok(self.state.lock().await.clone())
    }

    async fn save(&self, state: &CircuitBreakerState, expected_version: i64) -> Result<()> {
        self.check()?;
        let mut current = self.state.lock().await;
        let stored_version = current.as_ref().map_or(0, |s| s.version);
        if stored_version != expected_version {
            return Err(Error::conflict(format!(
                "expected version {expected_version}, found {stored_version}"
            )));
        }
        *current = Some(state.clone());
        Ok(())
    }
}
