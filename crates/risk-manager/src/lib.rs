//! Risk Manager
//!
//! Global circuit breaker gating trade admission, with per-trade size checks
//! and compare-and-set persistence.

pub mod circuit_breaker;
pub mod circuit_breaker_repo;

pub use circuit_breaker::{
    BreakerSnapshot, BreakerStatus, CircuitBreaker, CircuitBreakerState, ResetOutcome,
    RiskLimits, SizeViolation, TripReason,
};
pub use circuit_breaker_repo::{BreakerStore, CircuitBreakerRepository, MemoryBreakerStore};
