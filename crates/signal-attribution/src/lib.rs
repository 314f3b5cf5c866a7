//! Signal Attribution
//!
//! Per-source performance ledger fed by trade completions, plus post-trade
//! forensics for losing trades.

pub mod attribution_repo;
pub mod forensics;
pub mod ledger;

pub use attribution_repo::AttributionRepository;
pub use forensics::{FailureCategory, FailureSummary, ForensicReport, TradeForensics};
pub use ledger::{
    AttributionConfig, AttributionLedger, AttributionRecord, CompletionDiagnostics,
    LeaderboardQuery, SourceType, TradeCompletion, TypeSummary,
};
