//! CEX withdrawal to fresh wallet matching.
//!
//! A withdrawal is matched against transfers into never-used wallets that
//! land shortly after it with almost the same amount. Transfers may arrive
//! before or after the withdrawal, so both sides are handled:
//! - [`FreshWalletMatcher::process_withdrawal`] queries stored transfers
//! - [`FreshWalletMatcher::process_transfer`] checks withdrawals still
//!   inside their window

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use sentinel_core::config::{require_positive, require_unit};
use sentinel_core::store::{CorrelationStore, GraphLink, TransferWindow};
use sentinel_core::types::{
    FreshWalletMatch, TransferAction, TransferEvent, WalletCategory, WalletNode, WithdrawalEvent,
};
use sentinel_core::{Error, Result};

/// Matching thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Transfer must land within this many ms after the withdrawal.
    pub window_ms: u64,
    /// Lowest accepted transfer amount as a fraction of the withdrawal.
    pub amount_floor: Decimal,
    pub time_weight: f64,
    pub uniqueness_weight: f64,
    /// Fractional digits that earn a full uniqueness score.
    pub uniqueness_digits: u32,
    /// Hard deadline for a withdrawal's candidate query.
    pub deadline_ms: u64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            amount_floor: Decimal::new(99, 2),
            time_weight: 0.7,
            uniqueness_weight: 0.3,
            uniqueness_digits: 8,
            deadline_ms: 60_000,
        }
    }
}

impl MatcherConfig {
    pub fn validate(&self) -> Result<()> {
        require_positive("matcher.window_ms", self.window_ms as f64)?;
        require_positive("matcher.deadline_ms", self.deadline_ms as f64)?;
        require_positive("matcher.uniqueness_digits", self.uniqueness_digits as f64)?;
        require_unit("matcher.time_weight", self.time_weight)?;
        require_unit("matcher.uniqueness_weight", self.uniqueness_weight)?;
        if (self.time_weight + self.uniqueness_weight - 1.0).abs() > 1e-9 {
            return Err(Error::config(format!(
                "matcher weights must sum to 1, got {} + {}",
                self.time_weight, self.uniqueness_weight
            )));
        }
        if self.amount_floor <= Decimal::ZERO || self.amount_floor > Decimal::ONE {
            return Err(Error::config(format!(
                "matcher.amount_floor must be within (0, 1], got {}",
                self.amount_floor
            )));
        }
        Ok(())
    }

    fn window(&self) -> Duration {
        Duration::milliseconds(self.window_ms as i64)
    }
}

/// Digits after the decimal point once trailing zeros are stripped.
pub fn fractional_digits(amount: Decimal) -> u32 {
    amount.normalize().scale()
}

/// Matches CEX withdrawals to freshly funded wallets.
pub struct FreshWalletMatcher {
    config: MatcherConfig,
    store: Arc<dyn CorrelationStore>,
    /// Withdrawals whose window may still receive transfers, by tx_sig.
    pending: DashMap<String, WithdrawalEvent>,
    /// Latest event time seen, in ms. Drives pending eviction.
    clock_ms: AtomicI64,
}

impl FreshWalletMatcher {
    pub fn new(store: Arc<dyn CorrelationStore>, config: MatcherConfig) -> Self {
        Self {
            config,
            store,
            pending: DashMap::new(),
            clock_ms: AtomicI64::new(i64::MIN),
        }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Whether `transfer` is the kind of event a withdrawal can fund:
    /// a plain transfer into a wallet with no prior transactions.
    pub fn is_candidate(transfer: &TransferEvent) -> bool {
        transfer.action == TransferAction::Transfer && transfer.is_fresh()
    }

    /// Score a transfer against a withdrawal.
    ///
    /// Returns `None` when the pair falls outside the time or amount window,
    /// or the transfer is not a fresh-wallet funding.
    pub fn score_candidate(
        &self,
        withdrawal: &WithdrawalEvent,
        transfer: &TransferEvent,
    ) -> Option<f64> {
        if !Self::is_candidate(transfer) {
            return None;
        }

        let floor = withdrawal.amount * self.config.amount_floor;
        if transfer.amount < floor || transfer.amount > withdrawal.amount {
            return None;
        }

        let delta_ms = (transfer.time - withdrawal.time).num_milliseconds();
        if delta_ms < 0 || delta_ms as u64 > self.config.window_ms {
            return None;
        }

        let time_score = 1.0 - delta_ms as f64 / self.config.window_ms as f64;

        // Uniqueness follows the more precise of the two amounts.
        let digits = fractional_digits(withdrawal.amount).max(fractional_digits(transfer.amount));
        let uniqueness_score = (digits as f64 / self.config.uniqueness_digits as f64).min(1.0);

        let score =
            self.config.time_weight * time_score + self.config.uniqueness_weight * uniqueness_score;
        Some(score.clamp(0.0, 1.0))
    }

    /// Match a withdrawal against transfers already stored.
    ///
    /// Every qualifying transfer yields one persisted match. An empty vector
    /// means no match (including a deadline expiry); store failures are
    /// returned as errors.
    ///
    /// A redelivered withdrawal is matched again so that a retry after a
    /// partial failure completes; matches already recorded are not
    /// returned twice.
    pub async fn process_withdrawal(
        &self,
        withdrawal: &WithdrawalEvent,
    ) -> Result<Vec<FreshWalletMatch>> {
        withdrawal.validate()?;

        if !self.store.insert_withdrawal(withdrawal).await? {
            debug!(tx_sig = %withdrawal.tx_sig, "Withdrawal already stored, re-checking matches");
        }

        self.advance_clock(withdrawal.time);
        self.pending
            .insert(withdrawal.tx_sig.clone(), withdrawal.clone());

        let window = TransferWindow {
            from: withdrawal.time,
            to: withdrawal.time + self.config.window(),
            min_amount: withdrawal.amount * self.config.amount_floor,
            max_amount: withdrawal.amount,
        };

        let deadline = std::time::Duration::from_millis(self.config.deadline_ms);
        let candidates =
            match tokio::time::timeout(deadline, self.store.transfers_in_window(&window)).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!(
                        tx_sig = %withdrawal.tx_sig,
                        deadline_ms = self.config.deadline_ms,
                        "Candidate query exceeded deadline, treating as no match"
                    );
                    return Ok(Vec::new());
                }
            };

        let candidates: Vec<&TransferEvent> =
            candidates.iter().filter(|t| Self::is_candidate(t)).collect();
        debug!(
            tx_sig = %withdrawal.tx_sig,
            candidates = candidates.len(),
            "Scoring fresh wallet candidates"
        );

        let mut matches = Vec::new();
        for transfer in candidates {
            if let Some(score) = self.score_candidate(withdrawal, transfer) {
                if let Some(record) = self.record(withdrawal, transfer, score).await? {
                    matches.push(record);
                }
            }
        }

        self.evict_expired();
        Ok(matches)
    }

    /// Store a transfer and match it against withdrawals still in window.
    ///
    /// Redelivery behaves as in [`Self::process_withdrawal`].
    pub async fn process_transfer(&self, transfer: &TransferEvent) -> Result<Vec<FreshWalletMatch>> {
        transfer.validate()?;

        if !self.store.insert_transfer(transfer).await? {
            debug!(tx = %transfer.source_tx, "Transfer already stored, re-checking matches");
        }

        self.advance_clock(transfer.time);
        if !Self::is_candidate(transfer) {
            return Ok(Vec::new());
        }

        let scored: Vec<(WithdrawalEvent, f64)> = self
            .pending
            .iter()
            .filter_map(|entry| {
                self.score_candidate(entry.value(), transfer)
                    .map(|score| (entry.value().clone(), score))
            })
            .collect();

        let mut matches = Vec::new();
        for (withdrawal, score) in scored {
            if let Some(record) = self.record(&withdrawal, transfer, score).await? {
                matches.push(record);
            }
        }

        self.evict_expired();
        Ok(matches)
    }

    /// Rebuild the pending index from withdrawals newer than one window
    /// before `now`.
    pub async fn restore(&self, now: DateTime<Utc>) -> Result<usize> {
        let withdrawals = self.store.withdrawals_since(now - self.config.window()).await?;
        let count = withdrawals.len();
        for withdrawal in withdrawals {
            self.advance_clock(withdrawal.time);
            self.pending.insert(withdrawal.tx_sig.clone(), withdrawal);
        }
        info!(pending = count, "Restored pending withdrawals");
        Ok(count)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    async fn record(
        &self,
        withdrawal: &WithdrawalEvent,
        transfer: &TransferEvent,
        score: f64,
    ) -> Result<Option<FreshWalletMatch>> {
        let linked_parent = self.find_parent(transfer).await?;

        let record = FreshWalletMatch {
            id: Uuid::new_v4(),
            withdrawal_ref: withdrawal.tx_sig.clone(),
            source_exchange: withdrawal.source_exchange.clone(),
            target_wallet: transfer.wallet.clone(),
            transfer_tx: transfer.source_tx.clone(),
            time_delta_ms: (transfer.time - withdrawal.time).num_milliseconds(),
            match_score: score,
            amount: transfer.amount,
            linked_parent,
            created_at: Utc::now(),
        };

        if !self.store.record_match(&record).await? {
            return Ok(None);
        }

        info!(
            exchange = %record.source_exchange,
            wallet = %record.target_wallet,
            score = record.match_score,
            time_delta_ms = record.time_delta_ms,
            amount = %record.amount,
            "Fresh wallet matched"
        );

        self.mirror(&record, withdrawal).await;
        Ok(Some(record))
    }

    /// The funding counterparty, if it is itself a matched fresh wallet.
    async fn find_parent(&self, transfer: &TransferEvent) -> Result<Option<String>> {
        let Some(counterparty) = transfer.counterparty.as_deref() else {
            return Ok(None);
        };
        if counterparty == transfer.wallet {
            return Ok(None);
        }
        let prior = self.store.matches_for_wallet(counterparty).await?;
        Ok((!prior.is_empty()).then(|| counterparty.to_string()))
    }

    /// Registry and graph writes are best effort once the match is stored.
    async fn mirror(&self, record: &FreshWalletMatch, withdrawal: &WithdrawalEvent) {
        let confidence = match self.store.get_wallet(&record.target_wallet).await {
            Ok(Some(existing)) if existing.category == WalletCategory::FreshWallet => {
                existing.confidence.max(record.match_score)
            }
            _ => record.match_score,
        };

        let exchange = WalletNode::exchange(&withdrawal.source_exchange, withdrawal.time);
        let target = WalletNode::new(
            record.target_wallet.clone(),
            WalletCategory::FreshWallet,
            confidence,
            withdrawal.time,
        );

        let mut links = vec![GraphLink::FundedBy {
            wallet: record.target_wallet.clone(),
            funder: exchange.address.clone(),
            tx: record.transfer_tx.clone(),
            score: record.match_score,
        }];
        if let Some(parent) = &record.linked_parent {
            links.push(GraphLink::FundedBy {
                wallet: record.target_wallet.clone(),
                funder: parent.clone(),
                tx: record.transfer_tx.clone(),
                score: record.match_score,
            });
        }

        let writes = async {
            self.store.upsert_wallet(&exchange).await?;
            self.store.upsert_wallet(&target).await?;
            for link in &links {
                self.store.mirror_link(link).await?;
            }
            Ok::<_, Error>(())
        };
        if let Err(e) = writes.await {
            error!(wallet = %record.target_wallet, error = %e, "Failed to mirror match to graph");
        }
    }

    fn advance_clock(&self, time: DateTime<Utc>) {
        self.clock_ms
            .fetch_max(time.timestamp_millis(), Ordering::SeqCst);
    }

    /// Drop withdrawals whose window closed more than one window ago,
    /// leaving slack for out-of-order delivery.
    fn evict_expired(&self) {
        let clock = self.clock_ms.load(Ordering::SeqCst);
        let horizon = clock.saturating_sub(2 * self.config.window_ms as i64);
        self.pending
            .retain(|_, w| w.time.timestamp_millis() >= horizon);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sentinel_core::MemoryStore;
    use std::str::FromStr;
    use tokio_test::{assert_err, assert_ok};

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
    }

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn withdrawal(sig: &str, amount: &str, time: DateTime<Utc>) -> WithdrawalEvent {
        WithdrawalEvent {
            source_exchange: "binance".to_string(),
            tx_sig: sig.to_string(),
            time,
            amount: dec(amount),
            decimals: 9,
        }
    }

    fn transfer(tx: &str, wallet: &str, amount: &str, time: DateTime<Utc>) -> TransferEvent {
        TransferEvent {
            source_tx: tx.to_string(),
            wallet: wallet.to_string(),
            counterparty: None,
            action: TransferAction::Transfer,
            amount: dec(amount),
            decimals: 9,
            target_tx_count: 0,
            time,
        }
    }

    fn matcher() -> (Arc<MemoryStore>, FreshWalletMatcher) {
        let store = Arc::new(MemoryStore::new());
        let matcher = FreshWalletMatcher::new(store.clone(), MatcherConfig::default());
        (store, matcher)
    }

    #[test]
    fn test_fractional_digits() {
        assert_eq!(fractional_digits(dec("100.123456")), 6);
        assert_eq!(fractional_digits(dec("99.50")), 1);
        assert_eq!(fractional_digits(dec("100")), 0);
        assert_eq!(fractional_digits(dec("0.000000001")), 9);
    }

    #[test]
    fn test_worked_example_score() {
        let (_, matcher) = matcher();
        let w = withdrawal("w1", "100.123456", t0());
        let t = transfer("t1", "fresh1", "99.5", t0() + Duration::milliseconds(10_000));

        let score = matcher.score_candidate(&w, &t).unwrap();
        let expected = 0.7 * (1.0 - 10_000.0 / 60_000.0) + 0.3 * 0.75;
        assert!((score - expected).abs() < 1e-9);
        assert!((score - 0.8083).abs() < 1e-4);
    }

    #[test]
    fn test_window_boundaries() {
        let (_, matcher) = matcher();
        let w = withdrawal("w1", "100", t0());

        // amount floor and ceiling are inclusive
        assert!(matcher.score_candidate(&w, &transfer("a", "x", "99", t0())).is_some());
        assert!(matcher.score_candidate(&w, &transfer("b", "x", "100", t0())).is_some());
        assert!(matcher.score_candidate(&w, &transfer("c", "x", "98.99", t0())).is_none());
        assert!(matcher.score_candidate(&w, &transfer("d", "x", "100.01", t0())).is_none());

        // time window is [W.time, W.time + 60s]
        let edge = transfer("e", "x", "100", t0() + Duration::milliseconds(60_000));
        assert_eq!(matcher.score_candidate(&w, &edge), Some(0.0));
        let late = transfer("f", "x", "100", t0() + Duration::milliseconds(60_001));
        assert!(matcher.score_candidate(&w, &late).is_none());
        let early = transfer("g", "x", "100", t0() - Duration::milliseconds(1));
        assert!(matcher.score_candidate(&w, &early).is_none());
    }

    #[test]
    fn test_non_fresh_or_swap_rejected() {
        let (_, matcher) = matcher();
        let w = withdrawal("w1", "100", t0());

        let mut used = transfer("a", "x", "100", t0());
        used.target_tx_count = 3;
        assert!(matcher.score_candidate(&w, &used).is_none());

        let mut swap = transfer("b", "x", "100", t0());
        swap.action = TransferAction::Swap;
        assert!(matcher.score_candidate(&w, &swap).is_none());
    }

    #[test]
    fn test_score_non_increasing_in_delay() {
        let (_, matcher) = matcher();
        let w = withdrawal("w1", "100.5", t0());
        let mut previous = f64::MAX;
        for ms in (0..=60_000).step_by(5_000) {
            let t = transfer("t", "x", "100.5", t0() + Duration::milliseconds(ms));
            let score = matcher.score_candidate(&w, &t).unwrap();
            assert!(score <= previous);
            previous = score;
        }
    }

    #[tokio::test]
    async fn test_withdrawal_matches_stored_transfers() {
        let (store, matcher) = matcher();
        let early = transfer("t1", "fresh1", "99.5", t0() + Duration::seconds(10));
        let second = transfer("t2", "fresh2", "100", t0() + Duration::seconds(30));
        let outside = transfer("t3", "fresh3", "99.5", t0() + Duration::seconds(90));
        for t in [&early, &second, &outside] {
            matcher.process_transfer(t).await.unwrap();
        }

        let matches = matcher
            .process_withdrawal(&withdrawal("w1", "100.123456", t0()))
            .await
            .unwrap();

        assert_eq!(matches.len(), 2);
        for m in &matches {
            assert!(m.time_delta_ms >= 0 && m.time_delta_ms <= 60_000);
            assert_eq!(m.withdrawal_ref, "w1");
        }
        assert_eq!(store.match_count().await, 2);

        let node = store.get_wallet("fresh1").await.unwrap().unwrap();
        assert_eq!(node.category, WalletCategory::FreshWallet);
        assert!(store
            .links()
            .await
            .iter()
            .any(|l| matches!(l, GraphLink::FundedBy { funder, .. } if funder == "CEX:binance")));
    }

    #[tokio::test]
    async fn test_late_transfer_matches_pending_withdrawal() {
        let (_, matcher) = matcher();
        let none = matcher
            .process_withdrawal(&withdrawal("w1", "42.42", t0()))
            .await
            .unwrap();
        assert!(none.is_empty());
        assert_eq!(matcher.pending_count(), 1);

        let matches = matcher
            .process_transfer(&transfer("t1", "fresh1", "42.4", t0() + Duration::seconds(5)))
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].target_wallet, "fresh1");
    }

    #[tokio::test]
    async fn test_same_wallet_matches_multiple_withdrawals() {
        let (_, matcher) = matcher();
        matcher
            .process_withdrawal(&withdrawal("w1", "10", t0()))
            .await
            .unwrap();
        matcher
            .process_withdrawal(&withdrawal("w2", "10", t0() + Duration::seconds(1)))
            .await
            .unwrap();

        let matches = matcher
            .process_transfer(&transfer("t1", "fresh1", "10", t0() + Duration::seconds(2)))
            .await
            .unwrap();
        assert_eq!(matches.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_idempotent() {
        let (store, matcher) = matcher();
        let t = transfer("t1", "fresh1", "5", t0() + Duration::seconds(1));
        matcher.process_transfer(&t).await.unwrap();

        let w = withdrawal("w1", "5", t0());
        assert_eq!(matcher.process_withdrawal(&w).await.unwrap().len(), 1);
        assert!(matcher.process_withdrawal(&w).await.unwrap().is_empty());
        assert!(matcher.process_transfer(&t).await.unwrap().is_empty());
        assert_eq!(store.match_count().await, 1);
    }

    #[test]
    fn test_uniqueness_follows_more_precise_amount() {
        let (_, matcher) = matcher();
        let at = t0();
        let precise_w = withdrawal("w1", "10.12345678", at);
        let round_t = transfer("t1", "x", "10.1", at);
        let score = matcher.score_candidate(&precise_w, &round_t).unwrap();
        assert!((score - 1.0).abs() < 1e-9);

        let round_w = withdrawal("w2", "10.2", at);
        let precise_t = transfer("t2", "x", "10.1234", at);
        let score = matcher.score_candidate(&round_w, &precise_t).unwrap();
        assert!((score - (0.7 + 0.3 * 0.5)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_used_wallets_do_not_crowd_out_fresh_one() {
        let (store, matcher) = matcher();
        for i in 0..100 {
            let mut used = transfer(&format!("used-{i}"), &format!("old{i}"), "10", t0());
            used.target_tx_count = 12;
            matcher.process_transfer(&used).await.unwrap();
        }
        matcher
            .process_transfer(&transfer("fresh-tx", "fresh1", "10", t0() + Duration::seconds(1)))
            .await
            .unwrap();

        let matches = matcher
            .process_withdrawal(&withdrawal("w1", "10", t0()))
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].target_wallet, "fresh1");
        assert_eq!(store.match_count().await, 1);
    }

    #[tokio::test]
    async fn test_every_qualifying_candidate_matches() {
        let (store, matcher) = matcher();
        for i in 0..150 {
            let t = transfer(&format!("t{i}"), &format!("fresh{i}"), "20", t0() + Duration::milliseconds(i));
            matcher.process_transfer(&t).await.unwrap();
        }

        let matches = matcher
            .process_withdrawal(&withdrawal("w1", "20", t0()))
            .await
            .unwrap();
        assert_eq!(matches.len(), 150);
        assert_eq!(store.match_count().await, 150);
    }

    #[tokio::test]
    async fn test_retry_after_failed_candidate_query_still_matches() {
        let (store, matcher) = matcher();
        matcher
            .process_transfer(&transfer("t1", "fresh1", "8", t0() + Duration::seconds(2)))
            .await
            .unwrap();

        let w = withdrawal("w1", "8", t0());
        store.fail_next("transfers_in_window", 1).await;
        let err = assert_err!(matcher.process_withdrawal(&w).await);
        assert!(err.is_transient());

        let matches = assert_ok!(matcher.process_withdrawal(&w).await);
        assert_eq!(matches.len(), 1);
        assert!(matcher.process_withdrawal(&w).await.unwrap().is_empty());
        assert_eq!(store.match_count().await, 1);
    }

    #[tokio::test]
    async fn test_retry_after_failed_match_write_still_matches() {
        let (store, matcher) = matcher();
        matcher
            .process_withdrawal(&withdrawal("w1", "3.3", t0()))
            .await
            .unwrap();

        let t = transfer("t1", "fresh1", "3.3", t0() + Duration::seconds(1));
        store.fail_next("record_match", 1).await;
        assert_err!(matcher.process_transfer(&t).await);

        let matches = assert_ok!(matcher.process_transfer(&t).await);
        assert_eq!(matches.len(), 1);
        assert_eq!(store.match_count().await, 1);
    }

    #[tokio::test]
    async fn test_parent_link_for_layered_funding() {
        let (_, matcher) = matcher();
        matcher
            .process_withdrawal(&withdrawal("w1", "50", t0()))
            .await
            .unwrap();
        matcher
            .process_transfer(&transfer("t1", "fresh1", "50", t0() + Duration::seconds(1)))
            .await
            .unwrap();

        matcher
            .process_withdrawal(&withdrawal("w2", "20", t0() + Duration::seconds(2)))
            .await
            .unwrap();
        let mut child = transfer("t2", "fresh2", "20", t0() + Duration::seconds(3));
        child.counterparty = Some("fresh1".to_string());
        let matches = matcher.process_transfer(&child).await.unwrap();

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].linked_parent.as_deref(), Some("fresh1"));
    }

    #[tokio::test]
    async fn test_store_outage_is_an_error_not_no_match() {
        let (store, matcher) = matcher();
        store.set_available(false);
        let err = matcher
            .process_withdrawal(&withdrawal("w1", "5", t0()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_invalid_event_rejected() {
        let (_, matcher) = matcher();
        let err = matcher
            .process_withdrawal(&withdrawal("w1", "-5", t0()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidEvent(_)));
    }

    #[tokio::test]
    async fn test_restore_rebuilds_pending() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        {
            let first = FreshWalletMatcher::new(store.clone(), MatcherConfig::default());
            first
                .process_withdrawal(&withdrawal("w1", "7.77", now - Duration::seconds(10)))
                .await
                .unwrap();
        }

        let second = FreshWalletMatcher::new(store.clone(), MatcherConfig::default());
        assert_eq!(second.restore(now).await.unwrap(), 1);
        let matches = second
            .process_transfer(&transfer("t1", "fresh1", "7.7", now))
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn test_config_validation() {
        assert!(MatcherConfig::default().validate().is_ok());
        let bad = MatcherConfig {
            time_weight: 0.9,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(Error::Configuration { .. })));
        let bad = MatcherConfig {
            amount_floor: Decimal::new(11, 1),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
