//! Database repository for attribution records and forensic reports.

use std::collections::VecDeque;

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use sentinel_core::db::classify;
use sentinel_core::Result;

use crate::forensics::{FailureCategory, ForensicReport};
use crate::ledger::{AttributionRecord, SourceType};

/// Repository for `signal_attribution`, `processed_completions` and
/// `trade_forensics`.
#[derive(Clone)]
pub struct AttributionRepository {
    pool: PgPool,
}

impl AttributionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Load every source record.
    pub async fn load_all(&self) -> Result<Vec<AttributionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT
                source_id, source_type, total_trades, winning_trades, losing_trades,
                total_pnl, gross_profit, gross_loss, avg_pnl_pct, win_rate,
                best_pnl, worst_pnl, sharpe_ratio, sortino_ratio,
                recent_returns, last_trade_time
            FROM signal_attribution
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            match Self::record_from_row(&row) {
                Some(record) => records.push(record),
                None => {
                    let source_id: String = row.get("source_id");
                    warn!(source_id = %source_id, "Skipping attribution row with unknown source type");
                }
            }
        }
        Ok(records)
    }

    /// Upsert one source record.
    pub async fn save(&self, record: &AttributionRecord) -> Result<()> {
        let returns: Vec<f64> = record.recent_returns.iter().copied().collect();

        sqlx::query(
            r#"
            INSERT INTO signal_attribution (
                source_id, source_type, total_trades, winning_trades, losing_trades,
                total_pnl, gross_profit, gross_loss, avg_pnl_pct, win_rate,
                best_pnl, worst_pnl, sharpe_ratio, sortino_ratio,
                recent_returns, last_trade_time, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, NOW())
            ON CONFLICT (source_id) DO UPDATE SET
                total_trades = EXCLUDED.total_trades,
                winning_trades = EXCLUDED.winning_trades,
                losing_trades = EXCLUDED.losing_trades,
                total_pnl = EXCLUDED.total_pnl,
                gross_profit = EXCLUDED.gross_profit,
                gross_loss = EXCLUDED.gross_loss,
                avg_pnl_pct = EXCLUDED.avg_pnl_pct,
                win_rate = EXCLUDED.win_rate,
                best_pnl = EXCLUDED.best_pnl,
                worst_pnl = EXCLUDED.worst_pnl,
                sharpe_ratio = EXCLUDED.sharpe_ratio,
                sortino_ratio = EXCLUDED.sortino_ratio,
                recent_returns = EXCLUDED.recent_returns,
                last_trade_time = EXCLUDED.last_trade_time,
                updated_at = NOW()
            "#,
        )
        .bind(&record.source_id)
        .bind(record.source_type.as_str())
        .bind(record.total_trades as i32)
        .bind(record.winning_trades as i32)
        .bind(record.losing_trades as i32)
        .bind(record.total_pnl)
        .bind(record.gross_profit)
        .bind(record.gross_loss)
        .bind(record.avg_pnl_pct)
        .bind(record.win_rate)
        .bind(record.best_pnl)
        .bind(record.worst_pnl)
        .bind(record.sharpe_ratio)
        .bind(record.sortino_ratio)
        .bind(sqlx::types::Json(returns))
        .bind(record.last_trade_time)
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        debug!(source_id = %record.source_id, "Saved attribution record");
        Ok(())
    }

    /// Record a completion's trade id; false if it was already recorded.
    pub async fn claim_completion(&self, trade_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_completions (trade_id)
            VALUES ($1)
            ON CONFLICT (trade_id) DO NOTHING
            "#,
        )
        .bind(trade_id)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(result.rows_affected() == 1)
    }

    /// Insert a forensic report; a repeated trade id is ignored.
    pub async fn save_report(&self, report: &ForensicReport) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trade_forensics (
                trade_id, source_id, source_type, category, pnl, pnl_pct,
                signal_confidence, detail, analyzed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (trade_id) DO NOTHING
            "#,
        )
        .bind(report.trade_id)
        .bind(&report.source_id)
        .bind(report.source_type.as_str())
        .bind(report.category.as_str())
        .bind(report.pnl)
        .bind(report.pnl_pct)
        .bind(report.signal_confidence)
        .bind(&report.detail)
        .bind(report.analyzed_at)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }

    /// Most recent reports for a category.
    pub async fn reports_by_category(
        &self,
        category: FailureCategory,
        limit: i64,
    ) -> Result<Vec<ForensicReport>> {
        let rows = sqlx::query(
            r#"
            SELECT trade_id, source_id, source_type, category, pnl, pnl_pct,
                   signal_confidence, detail, analyzed_at
            FROM trade_forensics
            WHERE category = $1
            ORDER BY analyzed_at DESC
            LIMIT $2
            "#,
        )
        .bind(category.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        Ok(rows.iter().filter_map(Self::report_from_row).collect())
    }

    fn record_from_row(row: &PgRow) -> Option<AttributionRecord> {
        let source_type = SourceType::parse(&row.get::<String, _>("source_type"))?;
        let returns: sqlx::types::Json<Vec<f64>> = row.get("recent_returns");
        Some(AttributionRecord {
            source_id: row.get("source_id"),
            source_type,
            total_trades: row.get::<i32, _>("total_trades") as u32,
            winning_trades: row.get::<i32, _>("winning_trades") as u32,
            losing_trades: row.get::<i32, _>("losing_trades") as u32,
            total_pnl: row.get("total_pnl"),
            gross_profit: row.get("gross_profit"),
            gross_loss: row.get("gross_loss"),
            avg_pnl_pct: row.get("avg_pnl_pct"),
            win_rate: row.get("win_rate"),
            best_pnl: row.get("best_pnl"),
            worst_pnl: row.get("worst_pnl"),
            sharpe_ratio: row.get("sharpe_ratio"),
            sortino_ratio: row.get("sortino_ratio"),
            recent_returns: VecDeque::from(returns.0),
            last_trade_time: row.get("last_trade_time"),
        })
    }

    fn report_from_row(row: &PgRow) -> Option<ForensicReport> {
        let source_type = SourceType::parse(&row.get::<String, _>("source_type"))?;
        Some(ForensicReport {
            trade_id: row.get("trade_id"),
            source_id: row.get("source_id"),
            source_type,
            category: FailureCategory::parse(&row.get::<String, _>("category")),
            pnl: row.get("pnl"),
            pnl_pct: row.get("pnl_pct"),
            signal_confidence: row.get("signal_confidence"),
            detail: row.get("detail"),
            analyzed_at: row.get("analyzed_at"),
        })
    }
}
