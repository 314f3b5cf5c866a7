//! Ingested chain events: transfers, CEX withdrawals, and token trades.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Highest token precision accepted from ingestion.
pub const MAX_DECIMALS: u8 = 18;

/// What a decoded instruction did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferAction {
    Transfer,
    Swap,
    Other,
}

/// Delivery dedup key: tx hash + event time + wallet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupKey {
    pub tx_hash: String,
    pub time_ms: i64,
    pub wallet: String,
}

impl DedupKey {
    pub fn new(tx_hash: &str, time: DateTime<Utc>, wallet: &str) -> Self {
        Self {
            tx_hash: tx_hash.to_string(),
            time_ms: time.timestamp_millis(),
            wallet: wallet.to_string(),
        }
    }
}

/// A value moving into a wallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferEvent {
    /// Transaction signature that carried the transfer.
    pub source_tx: String,
    /// Receiving wallet.
    pub wallet: String,
    /// Funding wallet, when the decoder could resolve it.
    #[serde(default)]
    pub counterparty: Option<String>,
    pub action: TransferAction,
    pub amount: Decimal,
    pub decimals: u8,
    /// Transactions the receiving wallet had made before this one.
    pub target_tx_count: u32,
    pub time: DateTime<Utc>,
}

impl TransferEvent {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey::new(&self.source_tx, self.time, &self.wallet)
    }

    /// Wallet had never transacted before this transfer.
    pub fn is_fresh(&self) -> bool {
        self.target_tx_count == 0
    }

    pub fn validate(&self) -> Result<()> {
        require_id(&self.source_tx, "transfer source_tx")?;
        require_id(&self.wallet, "transfer wallet")?;
        require_amount(self.amount, self.decimals, "transfer")
    }
}

/// A withdrawal leaving a centralized exchange hot wallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalEvent {
    /// Exchange label, e.g. "binance".
    pub source_exchange: String,
    pub tx_sig: String,
    pub time: DateTime<Utc>,
    pub amount: Decimal,
    pub decimals: u8,
}

impl WithdrawalEvent {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey::new(&self.tx_sig, self.time, &self.source_exchange)
    }

    pub fn validate(&self) -> Result<()> {
        require_id(&self.tx_sig, "withdrawal tx_sig")?;
        require_id(&self.source_exchange, "withdrawal source_exchange")?;
        require_amount(self.amount, self.decimals, "withdrawal")
    }
}

/// A wallet buying or selling a token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub tx_hash: String,
    pub wallet: String,
    /// Token mint or contract traded.
    pub token: String,
    #[serde(default)]
    pub slot: u64,
    pub time: DateTime<Utc>,
}

impl TradeEvent {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey::new(&self.tx_hash, self.time, &self.wallet)
    }

    pub fn validate(&self) -> Result<()> {
        require_id(&self.tx_hash, "trade tx_hash")?;
        require_id(&self.wallet, "trade wallet")?;
        require_id(&self.token, "trade token")
    }
}

fn require_id(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidEvent(format!("{} is empty", field)));
    }
    Ok(())
}

fn require_amount(amount: Decimal, decimals: u8, kind: &str) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(Error::InvalidEvent(format!(
            "{} amount must be positive, got {}",
            kind, amount
        )));
    }
    if decimals > MAX_DECIMALS {
        return Err(Error::InvalidEvent(format!(
            "{} decimals {} exceeds {}",
            kind, decimals, MAX_DECIMALS
        )));
    }
    Ok(())
}
