//! PostgreSQL implementation of the correlation store.
//!
//! Relational tables mirror the domain types; `graph_nodes`/`graph_edges`
//! hold the traversal mirror (FUNDED_BY, CORRELATED_WITH, MEMBER_OF).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use super::{CorrelationStore, GraphLink, TransferWindow};
use crate::db::classify;
use crate::types::{
    Cluster, CorrelationEdge, FreshWalletMatch, TradeEvent, TransferAction, TransferEvent,
    WalletCategory, WalletNode, WithdrawalEvent,
};
use crate::{Error, Result};

/// `CorrelationStore` backed by PostgreSQL.
#[derive(Clone)]
pub struct PgCorrelationStore {
    pool: PgPool,
}

impl PgCorrelationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn upsert_node(&self, id: &str, label: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO graph_nodes (id, label)
            VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET label = EXCLUDED.label
            "#,
        )
        .bind(id)
        .bind(label)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }

    fn action_to_str(action: TransferAction) -> &'static str {
        match action {
            TransferAction::Transfer => "transfer",
            TransferAction::Swap => "swap",
            TransferAction::Other => "other",
        }
    }

    fn parse_action(s: &str) -> TransferAction {
        match s {
            "transfer" => TransferAction::Transfer,
            "swap" => TransferAction::Swap,
            _ => TransferAction::Other,
        }
    }

    fn transfer_from_row(r: &PgRow) -> TransferEvent {
        let action: String = r.get("action");
        TransferEvent {
            source_tx: r.get("source_tx"),
            wallet: r.get("wallet"),
            counterparty: r.get("counterparty"),
            action: Self::parse_action(&action),
            amount: r.get("amount"),
            decimals: r.get::<i16, _>("decimals") as u8,
            target_tx_count: r.get::<i32, _>("target_tx_count") as u32,
            time: r.get("event_time"),
        }
    }

    fn trade_from_row(r: &PgRow) -> TradeEvent {
        TradeEvent {
            tx_hash: r.get("tx_hash"),
            wallet: r.get("wallet"),
            token: r.get("token"),
            slot: r.get::<i64, _>("slot") as u64,
            time: r.get("event_time"),
        }
    }

    fn match_from_row(r: &PgRow) -> FreshWalletMatch {
        FreshWalletMatch {
            id: r.get("id"),
            withdrawal_ref: r.get("withdrawal_ref"),
            source_exchange: r.get("source_exchange"),
            target_wallet: r.get("target_wallet"),
            transfer_tx: r.get("transfer_tx"),
            time_delta_ms: r.get("time_delta_ms"),
            match_score: r.get("match_score"),
            amount: r.get("amount"),
            linked_parent: r.get("linked_parent"),
            created_at: r.get("created_at"),
        }
    }
}

#[async_trait]
impl CorrelationStore for PgCorrelationStore {
    async fn insert_transfer(&self, event: &TransferEvent) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO transfer_events
                (source_tx, wallet, event_time, counterparty, action, amount, decimals, target_tx_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (source_tx, event_time, wallet) DO NOTHING
            "#,
        )
        .bind(&event.source_tx)
        .bind(&event.wallet)
        .bind(event.time)
        .bind(&event.counterparty)
        .bind(Self::action_to_str(event.action))
        .bind(event.amount)
        .bind(event.decimals as i16)
        .bind(event.target_tx_count as i32)
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        Ok(result.rows_affected() == 1)
    }

    async fn insert_withdrawal(&self, event: &WithdrawalEvent) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO withdrawal_events (tx_sig, source_exchange, event_time, amount, decimals)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (tx_sig, event_time, source_exchange) DO NOTHING
            "#,
        )
        .bind(&event.tx_sig)
        .bind(&event.source_exchange)
        .bind(event.time)
        .bind(event.amount)
        .bind(event.decimals as i16)
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        Ok(result.rows_affected() == 1)
    }

    async fn insert_trade(&self, event: &TradeEvent) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO trade_events (tx_hash, wallet, token, slot, event_time)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (tx_hash, event_time, wallet) DO NOTHING
            "#,
        )
        .bind(&event.tx_hash)
        .bind(&event.wallet)
        .bind(&event.token)
        .bind(event.slot as i64)
        .bind(event.time)
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        Ok(result.rows_affected() == 1)
    }

    async fn transfers_in_window(&self, window: &TransferWindow) -> Result<Vec<TransferEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT source_tx, wallet, event_time, counterparty, action, amount, decimals, target_tx_count
            FROM transfer_events
            WHERE event_time BETWEEN $1 AND $2
              AND amount BETWEEN $3 AND $4
            ORDER BY event_time
            "#,
        )
        .bind(window.from)
        .bind(window.to)
        .bind(window.min_amount)
        .bind(window.max_amount)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        Ok(rows.iter().map(Self::transfer_from_row).collect())
    }

    async fn withdrawals_since(&self, since: DateTime<Utc>) -> Result<Vec<WithdrawalEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT tx_sig, source_exchange, event_time, amount, decimals
            FROM withdrawal_events
            WHERE event_time >= $1
            ORDER BY event_time
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        Ok(rows
            .iter()
            .map(|r| WithdrawalEvent {
                source_exchange: r.get("source_exchange"),
                tx_sig: r.get("tx_sig"),
                time: r.get("event_time"),
                amount: r.get("amount"),
                decimals: r.get::<i16, _>("decimals") as u8,
            })
            .collect())
    }

    async fn trades_for_token(
        &self,
        token: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TradeEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT tx_hash, wallet, token, slot, event_time
            FROM trade_events
            WHERE token = $1 AND event_time BETWEEN $2 AND $3
            ORDER BY event_time
            "#,
        )
        .bind(token)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        Ok(rows.iter().map(Self::trade_from_row).collect())
    }

    async fn trades_since(&self, since: DateTime<Utc>) -> Result<Vec<TradeEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT tx_hash, wallet, token, slot, event_time
            FROM trade_events
            WHERE event_time >= $1
            ORDER BY event_time
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        Ok(rows.iter().map(Self::trade_from_row).collect())
    }

    async fn record_match(&self, record: &FreshWalletMatch) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO fresh_wallet_matches
                (id, withdrawal_ref, source_exchange, target_wallet, transfer_tx,
                 time_delta_ms, match_score, amount, linked_parent, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (withdrawal_ref, transfer_tx, target_wallet) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(&record.withdrawal_ref)
        .bind(&record.source_exchange)
        .bind(&record.target_wallet)
        .bind(&record.transfer_tx)
        .bind(record.time_delta_ms)
        .bind(record.match_score)
        .bind(record.amount)
        .bind(&record.linked_parent)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        Ok(result.rows_affected() == 1)
    }

    async fn matches_for_wallet(&self, wallet: &str) -> Result<Vec<FreshWalletMatch>> {
        let rows = sqlx::query(
            r#"
            SELECT id, withdrawal_ref, source_exchange, target_wallet, transfer_tx,
                   time_delta_ms, match_score, amount, linked_parent, created_at
            FROM fresh_wallet_matches
            WHERE target_wallet = $1
            ORDER BY created_at
            "#,
        )
        .bind(wallet)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        Ok(rows.iter().map(Self::match_from_row).collect())
    }

    async fn upsert_wallet(&self, node: &WalletNode) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO wallets (address, category, confidence, first_seen)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (address) DO UPDATE SET
                category = EXCLUDED.category,
                confidence = EXCLUDED.confidence,
                first_seen = LEAST(wallets.first_seen, EXCLUDED.first_seen)
            "#,
        )
        .bind(&node.address)
        .bind(node.category.as_str())
        .bind(node.confidence)
        .bind(node.first_seen)
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        self.upsert_node(&node.address, node.category.as_str()).await
    }

    async fn get_wallet(&self, address: &str) -> Result<Option<WalletNode>> {
        let row = sqlx::query(
            "SELECT address, category, confidence, first_seen FROM wallets WHERE address = $1",
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        row.map(|r| {
            let category: String = r.get("category");
            let category = WalletCategory::parse(&category).ok_or_else(|| {
                Error::InvalidEvent(format!("unknown wallet category '{}'", category))
            })?;
            Ok(WalletNode::new(
                r.get::<String, _>("address"),
                category,
                r.get("confidence"),
                r.get("first_seen"),
            ))
        })
        .transpose()
    }

    async fn upsert_edge(&self, edge: &CorrelationEdge) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO correlation_edges (wallet_a, wallet_b, score, occurrences, last_seen)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (wallet_a, wallet_b) DO UPDATE SET
                score = EXCLUDED.score,
                occurrences = EXCLUDED.occurrences,
                last_seen = EXCLUDED.last_seen
            "#,
        )
        .bind(&edge.wallet_a)
        .bind(&edge.wallet_b)
        .bind(edge.score)
        .bind(edge.occurrences as i32)
        .bind(edge.last_seen)
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        Ok(())
    }

    async fn load_edges(&self) -> Result<Vec<CorrelationEdge>> {
        let rows = sqlx::query(
            "SELECT wallet_a, wallet_b, score, occurrences, last_seen FROM correlation_edges",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        Ok(rows
            .iter()
            .map(|r| CorrelationEdge {
                wallet_a: r.get("wallet_a"),
                wallet_b: r.get("wallet_b"),
                score: r.get("score"),
                occurrences: r.get::<i32, _>("occurrences") as u32,
                last_seen: r.get("last_seen"),
            })
            .collect())
    }

    async fn upsert_cluster(&self, cluster: &Cluster) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(classify)?;

        sqlx::query(
            r#"
            INSERT INTO clusters
                (cluster_id, aggregate_score, shared_contract_count, alerting, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (cluster_id) DO UPDATE SET
                aggregate_score = EXCLUDED.aggregate_score,
                shared_contract_count = EXCLUDED.shared_contract_count,
                alerting = EXCLUDED.alerting,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(cluster.cluster_id)
        .bind(cluster.aggregate_score)
        .bind(cluster.shared_contract_count as i32)
        .bind(cluster.alerting)
        .bind(cluster.created_at)
        .bind(cluster.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;

        sqlx::query("DELETE FROM cluster_members WHERE cluster_id = $1")
            .bind(cluster.cluster_id)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;

        let members: Vec<String> = cluster.members.iter().cloned().collect();
        sqlx::query(
            r#"
            INSERT INTO cluster_members (cluster_id, wallet)
            SELECT $1, UNNEST($2::text[])
            "#,
        )
        .bind(cluster.cluster_id)
        .bind(&members)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;

        tx.commit().await.map_err(classify)?;

        self.upsert_node(&cluster.cluster_id.to_string(), "cluster")
            .await
    }

    async fn remove_cluster(&self, cluster_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(classify)?;

        sqlx::query("DELETE FROM clusters WHERE cluster_id = $1")
            .bind(cluster_id)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;

        sqlx::query("DELETE FROM graph_edges WHERE kind = 'MEMBER_OF' AND dst = $1")
            .bind(cluster_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(classify)?;

        sqlx::query("DELETE FROM graph_nodes WHERE id = $1")
            .bind(cluster_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(classify)?;

        tx.commit().await.map_err(classify)?;
        debug!(cluster_id = %cluster_id, "Removed cluster");
        Ok(())
    }

    async fn load_clusters(&self) -> Result<Vec<Cluster>> {
        let rows = sqlx::query(
            r#"
            SELECT c.cluster_id, c.aggregate_score, c.shared_contract_count, c.alerting,
                   c.created_at, c.updated_at,
                   COALESCE(ARRAY_AGG(m.wallet) FILTER (WHERE m.wallet IS NOT NULL), '{}') AS members
            FROM clusters c
            LEFT JOIN cluster_members m ON m.cluster_id = c.cluster_id
            GROUP BY c.cluster_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        Ok(rows
            .iter()
            .map(|r| {
                let members: Vec<String> = r.get("members");
                Cluster {
                    cluster_id: r.get("cluster_id"),
                    members: members.into_iter().collect(),
                    aggregate_score: r.get("aggregate_score"),
                    shared_contract_count: r.get::<i32, _>("shared_contract_count") as u32,
                    alerting: r.get("alerting"),
                    created_at: r.get("created_at"),
                    updated_at: r.get("updated_at"),
                }
            })
            .collect())
    }

    async fn mirror_link(&self, link: &GraphLink) -> Result<()> {
        let (src, dst, weight, properties) = match link {
            GraphLink::FundedBy {
                wallet,
                funder,
                tx,
                score,
            } => (
                wallet.clone(),
                funder.clone(),
                *score,
                serde_json::json!({ "tx": tx }),
            ),
            GraphLink::CorrelatedWith {
                wallet_a,
                wallet_b,
                score,
            } => (
                wallet_a.clone(),
                wallet_b.clone(),
                *score,
                serde_json::Value::Null,
            ),
            GraphLink::MemberOf { wallet, cluster_id } => (
                wallet.clone(),
                cluster_id.to_string(),
                1.0,
                serde_json::Value::Null,
            ),
        };

        sqlx::query(
            r#"
            INSERT INTO graph_edges (kind, src, dst, weight, properties, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (kind, src, dst) DO UPDATE SET
                weight = EXCLUDED.weight,
                properties = EXCLUDED.properties,
                updated_at = NOW()
            "#,
        )
        .bind(link.kind())
        .bind(&src)
        .bind(&dst)
        .bind(weight)
        .bind(&properties)
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        Ok(())
    }
}
