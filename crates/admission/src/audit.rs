//! Append-only audit log of admission decisions.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use sentinel_core::db::classify;
use sentinel_core::Result;

use crate::coordinator::{Decision, DecisionReason, SignalKind};

/// Storage backend for decision audit records.
#[async_trait::async_trait]
pub trait AuditStorage: Send + Sync {
    /// Append a decision; returns its row id.
    async fn store(&self, decision: &Decision) -> Result<i64>;

    async fn query(&self, filter: &AuditFilter) -> Result<Vec<Decision>>;

    async fn count(&self, filter: &AuditFilter) -> Result<u64>;
}

/// Filter for querying decisions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditFilter {
    pub source_id: Option<String>,
    pub reason: Option<DecisionReason>,
    pub approved: Option<bool>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl AuditFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn reason(mut self, reason: DecisionReason) -> Self {
        self.reason = Some(reason);
        self
    }

    pub fn approved(mut self, approved: bool) -> Self {
        self.approved = Some(approved);
        self
    }

    pub fn time_range(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, d: &Decision) -> bool {
        self.source_id.as_ref().map_or(true, |s| &d.source_id == s)
            && self.reason.map_or(true, |r| d.reason == r)
            && self.approved.map_or(true, |a| d.approve == a)
            && self.from.map_or(true, |from| d.decided_at >= from)
            && self.to.map_or(true, |to| d.decided_at <= to)
    }
}

/// In-memory audit storage.
pub struct MemoryAuditStorage {
    decisions: Arc<RwLock<Vec<Decision>>>,
    next_id: Arc<AtomicI64>,
}

impl MemoryAuditStorage {
    pub fn new() -> Self {
        Self {
            decisions: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicI64::new(1)),
        }
    }
}

impl Default for MemoryAuditStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl AuditStorage for MemoryAuditStorage {
    async fn store(&self, decision: &Decision) -> Result<i64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.decisions.write().await.push(decision.clone());
        Ok(id)
    }

    async fn query(&self, filter: &AuditFilter) -> Result<Vec<Decision>> {
        let decisions = self.decisions.read().await;
        let offset = filter.offset.unwrap_or(0) as usize;
        let limit = filter.limit.unwrap_or(100) as usize;
        Ok(decisions
            .iter()
            .filter(|d| filter.matches(d))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count(&self, filter: &AuditFilter) -> Result<u64> {
        let decisions = self.decisions.read().await;
        Ok(decisions.iter().filter(|d| filter.matches(d)).count() as u64)
    }
}

/// PostgreSQL-backed audit storage (`decision_audit`).
pub struct PgAuditStorage {
    pool: PgPool,
}

impl PgAuditStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn decision_from_row(row: &PgRow) -> Decision {
        let kind: String = row.get("signal_kind");
        let reason: String = row.get("reason");
        Decision {
            decision_id: row.get("decision_id"),
            source_id: row.get("source_id"),
            signal_kind: if kind == "cabal" {
                SignalKind::Cabal
            } else {
                SignalKind::FreshWallet
            },
            approve: row.get("approve"),
            reason: DecisionReason::parse(&reason).unwrap_or(DecisionReason::BreakerTripped),
            suggested_size: row.get::<Decimal, _>("suggested_size"),
            suggested_fraction: row.get::<Decimal, _>("suggested_fraction"),
            confidence: row.get("confidence"),
            multiplier: row.get("multiplier"),
            decided_at: row.get("decided_at"),
        }
    }
}

#[async_trait::async_trait]
impl AuditStorage for PgAuditStorage {
    async fn store(&self, decision: &Decision) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO decision_audit (
                decision_id, source_id, signal_kind, approve, reason,
                suggested_size, suggested_fraction, confidence, multiplier, decided_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id
            "#,
        )
        .bind(decision.decision_id)
        .bind(&decision.source_id)
        .bind(decision.signal_kind.as_str())
        .bind(decision.approve)
        .bind(decision.reason.as_str())
        .bind(decision.suggested_size)
        .bind(decision.suggested_fraction)
        .bind(decision.confidence)
        .bind(decision.multiplier)
        .bind(decision.decided_at)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)?;

        Ok(row.get("id"))
    }

    async fn query(&self, filter: &AuditFilter) -> Result<Vec<Decision>> {
        let rows = sqlx::query(
            r#"
            SELECT decision_id, source_id, signal_kind, approve, reason,
                   suggested_size, suggested_fraction, confidence, multiplier, decided_at
            FROM decision_audit
            WHERE ($1::text IS NULL OR source_id = $1)
              AND ($2::text IS NULL OR reason = $2)
              AND ($3::boolean IS NULL OR approve = $3)
              AND ($4::timestamptz IS NULL OR decided_at >= $4)
              AND ($5::timestamptz IS NULL OR decided_at <= $5)
            ORDER BY decided_at DESC
            LIMIT $6 OFFSET $7
            "#,
        )
        .bind(&filter.source_id)
        .bind(filter.reason.map(|r| r.as_str()))
        .bind(filter.approved)
        .bind(filter.from)
        .bind(filter.to)
        .bind(filter.limit.unwrap_or(100) as i64)
        .bind(filter.offset.unwrap_or(0) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        Ok(rows.iter().map(Self::decision_from_row).collect())
    }

    async fn count(&self, filter: &AuditFilter) -> Result<u64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
            FROM decision_audit
            WHERE ($1::text IS NULL OR source_id = $1)
              AND ($2::text IS NULL OR reason = $2)
              AND ($3::boolean IS NULL OR approve = $3)
              AND ($4::timestamptz IS NULL OR decided_at >= $4)
              AND ($5::timestamptz IS NULL OR decided_at <= $5)
            "#,
        )
        .bind(&filter.source_id)
        .bind(filter.reason.map(|r| r.as_str()))
        .bind(filter.approved)
        .bind(filter.from)
        .bind(filter.to)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)?;

        Ok(row.get::<i64, _>("total") as u64)
    }
}

/// Non-blocking decision audit logger.
pub struct AuditLogger {
    storage: Arc<dyn AuditStorage>,
    tx: mpsc::Sender<Decision>,
}

impl AuditLogger {
    /// Spawns the writer task; must be called inside a Tokio runtime.
    pub fn new(storage: Arc<dyn AuditStorage>) -> Self {
        let (tx, mut rx) = mpsc::channel::<Decision>(10_000);

        let writer = storage.clone();
        tokio::spawn(async move {
            while let Some(decision) = rx.recv().await {
                if let Err(e) = writer.store(&decision).await {
                    tracing::error!(
                        decision_id = %decision.decision_id,
                        error = %e,
                        "Failed to store decision audit record"
                    );
                }
            }
        });

        Self { storage, tx }
    }

    /// Append a decision without waiting for storage.
    pub fn log(&self, decision: Decision) {
        if self.tx.try_send(decision).is_err() {
            tracing::warn!("Audit channel full, decision record dropped");
        }
    }

    /// Append a decision and wait for the write.
    pub async fn log_sync(&self, decision: &Decision) -> Result<i64> {
        self.storage.store(decision).await
    }

    pub async fn query(&self, filter: &AuditFilter) -> Result<Vec<Decision>> {
        self.storage.query(filter).await
    }

    pub async fn count(&self, filter: &AuditFilter) -> Result<u64> {
        self.storage.count(filter).await
    }

    /// Look up one decision by id.
    pub async fn find(&self, decision_id: Uuid) -> Result<Option<Decision>> {
        let all = self.storage.query(&AuditFilter::new().limit(u32::MAX)).await?;
        Ok(all.into_iter().find(|d| d.decision_id == decision_id))
    }
}
