//! Correlation graph types: edges between wallets and the clusters they form.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::clamp_unit;

/// Undirected wallet pair with canonical ordering (`a <= b`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeKey {
    pub a: String,
    pub b: String,
}

impl EdgeKey {
    /// Returns `None` for a self-pair.
    pub fn new(x: &str, y: &str) -> Option<Self> {
        match x.cmp(y) {
            std::cmp::Ordering::Less => Some(Self {
                a: x.to_string(),
                b: y.to_string(),
            }),
            std::cmp::Ordering::Greater => Some(Self {
                a: y.to_string(),
                b: x.to_string(),
            }),
            std::cmp::Ordering::Equal => None,
        }
    }

    pub fn contains(&self, wallet: &str) -> bool {
        self.a == wallet || self.b == wallet
    }

    pub fn other(&self, wallet: &str) -> Option<&str> {
        if self.a == wallet {
            Some(&self.b)
        } else if self.b == wallet {
            Some(&self.a)
        } else {
            None
        }
    }
}

/// Weighted co-trading relationship between two wallets.
///
/// The stored `score` is the value at `last_seen`. Staleness is applied by
/// [`CorrelationEdge::decayed_score`] at read time; the record itself is only
/// rewritten when the pair trades together again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationEdge {
    pub wallet_a: String,
    pub wallet_b: String,
    pub score: f64,
    pub occurrences: u32,
    pub last_seen: DateTime<Utc>,
}

impl CorrelationEdge {
    pub fn new(key: &EdgeKey, score: f64, seen: DateTime<Utc>) -> Self {
        Self {
            wallet_a: key.a.clone(),
            wallet_b: key.b.clone(),
            score: clamp_unit(score),
            occurrences: 1,
            last_seen: seen,
        }
    }

    pub fn key(&self) -> EdgeKey {
        EdgeKey {
            a: self.wallet_a.clone(),
            b: self.wallet_b.clone(),
        }
    }

    /// Score as observed at `now`.
    ///
    /// Within `grace` of `last_seen` the stored score is returned unchanged.
    /// Past that it halves every `half_life`.
    pub fn decayed_score(&self, now: DateTime<Utc>, grace: Duration, half_life: Duration) -> f64 {
        let idle = now - self.last_seen;
        if idle <= grace {
            return self.score;
        }
        let half_life_ms = half_life.num_milliseconds();
        if half_life_ms <= 0 {
            return 0.0;
        }
        let overdue_ms = (idle - grace).num_milliseconds() as f64;
        clamp_unit(self.score * 0.5f64.powf(overdue_ms / half_life_ms as f64))
    }
}

/// A detected group of coordinated wallets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub cluster_id: Uuid,
    /// Never fewer than two while the cluster exists.
    pub members: BTreeSet<String>,
    /// Average pairwise (decayed) edge score across members.
    pub aggregate_score: f64,
    /// Distinct tokens traded by at least two members.
    pub shared_contract_count: u32,
    /// Currently above the alert threshold; an alert is owed on each
    /// transition from false to true.
    pub alerting: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Cluster {
    pub fn new(members: BTreeSet<String>, aggregate_score: f64, now: DateTime<Utc>) -> Self {
        Self {
            cluster_id: Uuid::new_v4(),
            members,
            aggregate_score: clamp_unit(aggregate_score),
            shared_contract_count: 0,
            alerting: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }
}
