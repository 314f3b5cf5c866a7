//! Wallet registry types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::clamp_unit;

/// Role inferred for a wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletCategory {
    Influencer,
    Cabal,
    FreshWallet,
    MarketMaker,
    CexHot,
}

impl WalletCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalletCategory::Influencer => "influencer",
            WalletCategory::Cabal => "cabal",
            WalletCategory::FreshWallet => "fresh_wallet",
            WalletCategory::MarketMaker => "market_maker",
            WalletCategory::CexHot => "cex_hot",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "influencer" => Some(WalletCategory::Influencer),
            "cabal" => Some(WalletCategory::Cabal),
            "fresh_wallet" => Some(WalletCategory::FreshWallet),
            "market_maker" => Some(WalletCategory::MarketMaker),
            "cex_hot" => Some(WalletCategory::CexHot),
            _ => None,
        }
    }
}

/// A wallet known to the engine.
///
/// Created on first sighting. Confidence is only changed by the detector
/// that owns the wallet's category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletNode {
    pub address: String,
    pub category: WalletCategory,
    /// Always within `[0, 1]`.
    pub confidence: f64,
    pub first_seen: DateTime<Utc>,
}

impl WalletNode {
    pub fn new(
        address: impl Into<String>,
        category: WalletCategory,
        confidence: f64,
        first_seen: DateTime<Utc>,
    ) -> Self {
        Self {
            address: address.into(),
            category,
            confidence: clamp_unit(confidence),
            first_seen,
        }
    }

    /// Exchange hot wallets are keyed by label rather than address.
    pub fn exchange(exchange: &str, first_seen: DateTime<Utc>) -> Self {
        Self::new(
            format!("CEX:{}", exchange),
            WalletCategory::CexHot,
            1.0,
            first_seen,
        )
    }
}
