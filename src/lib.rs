//! Wallet Sentinel: on-chain signal correlation and risk gating.
//!
//! This root crate exists for benchmarks and cross-crate integration tests.
//! The functionality lives in the workspace crates:
//!
//! - `sentinel-core`: event and graph types, the correlation store, database access
//! - `correlation-engine`: fresh wallet matching and cabal cluster detection
//! - `signal-attribution`: per-source performance ledger and loss forensics
//! - `risk-manager`: daily circuit breaker and position limits
//! - `admission`: signal admission, audit trail, engine wiring

pub use admission;
pub use correlation_engine as correlation;
pub use risk_manager as risk;
pub use sentinel_core as core;
pub use signal_attribution as attribution;
