//! Ledger records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::provider::CallKind;
use crate::state::{ChapterId, JobId, UserId};

/// Unique identifier for a credit reservation
pub type ReservationId = String;

/// Unique identifier for a ledger transaction
pub type TransactionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Credits added to the balance
    Deposit,
    /// Provisional hold against the balance
    Reserve,
    /// Settlement of one or more reservations at metered cost
    Commit,
    /// Release of a reservation with no balance impact
    Rollback,
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deposit => write!(f, "deposit"),
            Self::Reserve => write!(f, "reserve"),
            Self::Commit => write!(f, "commit"),
            Self::Rollback => write!(f, "rollback"),
        }
    }
}

/// What a charge is for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeTag {
    pub job_id: Option<JobId>,
    pub chapter_id: Option<ChapterId>,
    pub call: Option<CallKind>,
}

impl ChargeTag {
    pub fn chapter(job_id: Option<JobId>, chapter_id: impl Into<ChapterId>) -> Self {
        Self {
            job_id,
            chapter_id: Some(chapter_id.into()),
            call: None,
        }
    }

    pub fn with_call(mut self, call: CallKind) -> Self {
        self.call = Some(call);
        self
    }
}

/// One append-only ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: TransactionId,
    pub user_id: UserId,
    pub kind: TransactionKind,
    pub amount: u64,
    /// Reservations created (reserve) or closed (commit, rollback) by this entry.
    #[serde(default)]
    pub reservation_ids: Vec<ReservationId>,
    #[serde(default)]
    pub tag: ChargeTag,
    /// Available balance after this entry.
    pub resulting_balance: u64,
    pub timestamp: DateTime<Utc>,
}

/// Balance folded from a user's transaction log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub deposited: u64,
    pub committed: u64,
    /// Sum of reservations still open.
    pub reserved: u64,
    pub available: u64,
}

/// Settlement state of a reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    Open,
    Committed,
    RolledBack,
}

impl std::fmt::Display for ReservationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Committed => write!(f, "committed"),
            Self::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// A reservation and its actual metered cost, ready to commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub reservation_id: ReservationId,
    pub actual_cost: u64,
}

impl Settlement {
    pub fn new(reservation_id: impl Into<ReservationId>, actual_cost: u64) -> Self {
        Self {
            reservation_id: reservation_id.into(),
            actual_cost,
        }
    }
}

/// Fold a transaction log into a balance.
///
/// A reservation counts as held until a commit or rollback entry names it.
pub fn fold_balance(transactions: &[CreditTransaction]) -> Balance {
    use std::collections::HashMap;

    let mut balance = Balance::default();
    let mut open: HashMap<&str, u64> = HashMap::new();

    for tx in transactions {
        match tx.kind {
            TransactionKind::Deposit => balance.deposited += tx.amount,
            TransactionKind::Reserve => {
                for id in &tx.reservation_ids {
                    open.insert(id.as_str(), tx.amount);
                }
            }
            TransactionKind::Commit => {
                balance.committed += tx.amount;
                for id in &tx.reservation_ids {
                    open.remove(id.as_str());
                }
            }
            TransactionKind::Rollback => {
                for id in &tx.reservation_ids {
                    open.remove(id.as_str());
                }
            }
        }
    }

    balance.reserved = open.values().sum();
    balance.available = balance
        .deposited
        .saturating_sub(balance.committed)
        .saturating_sub(balance.reserved);
    balance
}
