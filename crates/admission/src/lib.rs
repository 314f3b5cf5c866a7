//! Admission
//!
//! Turns detector signals into approve/deny sizing decisions for the
//! execution layer, and wires the detectors, ledger and breaker together
//! behind [`SentinelEngine`].

pub mod alerts;
pub mod audit;
pub mod coordinator;
pub mod engine;

pub use alerts::{Alert, AlertSink, MemoryAlertSink};
pub use audit::{AuditFilter, AuditLogger, AuditStorage, MemoryAuditStorage, PgAuditStorage};
pub use coordinator::{
    AdmissionConfig, AdmissionCoordinator, Decision, DecisionReason, Signal, SignalKind,
};
pub use engine::{EngineComponents, EngineSettings, MaintenanceReport, SentinelEngine};
