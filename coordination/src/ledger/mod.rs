//! Credit ledger: reservation / commit / rollback accounting
//!
//! The ledger is an append-only transaction log per user. Balances are never
//! stored; they are folded from the log on demand. Reservations are indexed
//! by id so that commit and rollback are conditional updates on a single
//! reservation's state rather than read-then-write on a balance.
//!
//! ```text
//! reserve ──► Open ──commit──► Committed
//!               └──rollback──► RolledBack
//! ```
//!
//! A reservation settles exactly once; a second commit or rollback of the
//! same id is rejected with [`LedgerError::AlreadySettled`].

pub mod cost;
pub mod types;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use cost::{BookEstimate, CostModel, CostRates, TokenEstimator, WordCountEstimator};
pub use types::{
    fold_balance, Balance, ChargeTag, CreditTransaction, ReservationId, ReservationState,
    Settlement, TransactionId, TransactionKind,
};

use crate::state::UserId;

/// Errors from ledger operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("Insufficient credits: required {required}, available {available}")]
    InsufficientCredits { required: u64, available: u64 },

    #[error("Reservation not found: {0}")]
    ReservationNotFound(ReservationId),

    #[error("Reservation {id} already {state}")]
    AlreadySettled {
        id: ReservationId,
        state: ReservationState,
    },

    #[error("Settlement spans multiple users")]
    MixedUsers,

    #[error("Nothing to settle")]
    EmptySettlement,

    #[error("Amount must be positive")]
    InvalidAmount,

    #[error("Ledger lock poisoned")]
    LockPoisoned,
}

impl LedgerError {
    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::InsufficientCredits { .. } => "INSUFFICIENT_CREDITS",
            Self::ReservationNotFound(_) => "RESERVATION_NOT_FOUND",
            Self::AlreadySettled { .. } => "RESERVATION_SETTLED",
            Self::MixedUsers => "MIXED_USERS",
            Self::EmptySettlement => "EMPTY_SETTLEMENT",
            Self::InvalidAmount => "INVALID_AMOUNT",
            Self::LockPoisoned => "LEDGER_UNAVAILABLE",
        }
    }
}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Shared reference to CreditLedger
pub type SharedLedger = Arc<CreditLedger>;

#[derive(Debug, Clone)]
struct Reservation {
    user_id: UserId,
    amount: u64,
    state: ReservationState,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct LedgerInner {
    logs: HashMap<UserId, Vec<CreditTransaction>>,
    reservations: HashMap<ReservationId, Reservation>,
}

impl LedgerInner {
    fn balance(&self, user_id: &str) -> Balance {
        self.logs
            .get(user_id)
            .map(|log| fold_balance(log))
            .unwrap_or_default()
    }

    fn append(
        &mut self,
        user_id: &str,
        kind: TransactionKind,
        amount: u64,
        reservation_ids: Vec<ReservationId>,
        tag: ChargeTag,
    ) -> CreditTransaction {
        let log = self.logs.entry(user_id.to_string()).or_default();
        let mut tx = CreditTransaction {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            kind,
            amount,
            reservation_ids,
            tag,
            resulting_balance: 0,
            timestamp: Utc::now(),
        };
        log.push(tx.clone());
        let available = fold_balance(log).available;
        if let Some(last) = log.last_mut() {
            last.resulting_balance = available;
        }
        tx.resulting_balance = available;
        tx
    }

    /// Look up an open reservation, rejecting unknown or settled ids.
    fn open_reservation(&self, id: &str) -> LedgerResult<&Reservation> {
        let reservation = self
            .reservations
            .get(id)
            .ok_or_else(|| LedgerError::ReservationNotFound(id.to_string()))?;
        if reservation.state != ReservationState::Open {
            return Err(LedgerError::AlreadySettled {
                id: id.to_string(),
                state: reservation.state,
            });
        }
        Ok(reservation)
    }

    fn rollback(&mut self, id: &str, tag: ChargeTag) -> LedgerResult<CreditTransaction> {
        let (user_id, amount) = {
            let r = self.open_reservation(id)?;
            (r.user_id.clone(), r.amount)
        };
        if let Some(r) = self.reservations.get_mut(id) {
            r.state = ReservationState::RolledBack;
        }
        Ok(self.append(
            &user_id,
            TransactionKind::Rollback,
            amount,
            vec![id.to_string()],
            tag,
        ))
    }
}

/// Per-user credit ledger. All mutations serialize on one lock.
#[derive(Default)]
pub struct CreditLedger {
    inner: Mutex<LedgerInner>,
}

impl CreditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared reference to this ledger
    pub fn shared(self) -> SharedLedger {
        Arc::new(self)
    }

    /// Add credits to a user's balance.
    pub fn deposit(&self, user_id: &str, amount: u64) -> LedgerResult<CreditTransaction> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let mut inner = self.inner.lock().map_err(|_| LedgerError::LockPoisoned)?;
        let tx = inner.append(
            user_id,
            TransactionKind::Deposit,
            amount,
            Vec::new(),
            ChargeTag::default(),
        );
        info!(user_id, amount, balance = tx.resulting_balance, "Credits deposited");
        Ok(tx)
    }

    /// Hold `estimate` credits for an upcoming call.
    ///
    /// Rejected synchronously when the available balance is below the estimate.
    pub fn reserve(
        &self,
        user_id: &str,
        estimate: u64,
        tag: ChargeTag,
    ) -> LedgerResult<ReservationId> {
        if estimate == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let mut inner = self.inner.lock().map_err(|_| LedgerError::LockPoisoned)?;
        let available = inner.balance(user_id).available;
        if available < estimate {
            warn!(
                user_id,
                required = estimate,
                available,
                "Reservation rejected: insufficient credits"
            );
            return Err(LedgerError::InsufficientCredits {
                required: estimate,
                available,
            });
        }

        let id = uuid::Uuid::new_v4().to_string();
        inner.reservations.insert(
            id.clone(),
            Reservation {
                user_id: user_id.to_string(),
                amount: estimate,
                state: ReservationState::Open,
                created_at: Utc::now(),
            },
        );
        let tx = inner.append(
            user_id,
            TransactionKind::Reserve,
            estimate,
            vec![id.clone()],
            tag,
        );
        debug!(
            user_id,
            reservation_id = %id,
            amount = estimate,
            available = tx.resulting_balance,
            "Credits reserved"
        );
        Ok(id)
    }

    /// Settle one reservation at its metered cost.
    pub fn commit(
        &self,
        reservation_id: &str,
        actual_cost: u64,
        tag: ChargeTag,
    ) -> LedgerResult<CreditTransaction> {
        self.commit_batch(&[Settlement::new(reservation_id, actual_cost)], tag)
    }

    /// Settle several reservations of one user as a single commit entry.
    ///
    /// The committed amount is the sum of actual costs; unused reserved
    /// credit is released. If actual cost exceeds what the reservations plus
    /// the remaining balance can cover, the charge is clamped so the balance
    /// never goes negative. Either every reservation settles or none does.
    pub fn commit_batch(
        &self,
        settlements: &[Settlement],
        tag: ChargeTag,
    ) -> LedgerResult<CreditTransaction> {
        if settlements.is_empty() {
            return Err(LedgerError::EmptySettlement);
        }
        let mut inner = self.inner.lock().map_err(|_| LedgerError::LockPoisoned)?;

        let mut user: Option<UserId> = None;
        let mut reserved_total = 0u64;
        for s in settlements {
            let r = inner.open_reservation(&s.reservation_id)?;
            match &user {
                Some(u) if *u != r.user_id => return Err(LedgerError::MixedUsers),
                Some(_) => {}
                None => user = Some(r.user_id.clone()),
            }
            reserved_total += r.amount;
        }
        let user_id = user.ok_or(LedgerError::EmptySettlement)?;

        let mut ids: Vec<&str> = settlements
            .iter()
            .map(|s| s.reservation_id.as_str())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != settlements.len() {
            // Duplicate ids in one batch would settle a reservation twice.
            let dup = settlements
                .iter()
                .find(|s| settlements.iter().filter(|o| o.reservation_id == s.reservation_id).count() > 1)
                .map(|s| s.reservation_id.clone())
                .unwrap_or_default();
            return Err(LedgerError::AlreadySettled {
                id: dup,
                state: ReservationState::Open,
            });
        }

        let actual_total: u64 = settlements.iter().map(|s| s.actual_cost).sum();
        let coverable = inner.balance(&user_id).available + reserved_total;
        let charge = if actual_total > coverable {
            warn!(
                user_id = %user_id,
                actual = actual_total,
                coverable,
                "Metered cost exceeds balance; clamping commit"
            );
            coverable
        } else {
            actual_total
        };

        for s in settlements {
            if let Some(r) = inner.reservations.get_mut(&s.reservation_id) {
                r.state = ReservationState::Committed;
            }
        }
        let tx = inner.append(
            &user_id,
            TransactionKind::Commit,
            charge,
            settlements.iter().map(|s| s.reservation_id.clone()).collect(),
            tag,
        );
        info!(
            user_id = %user_id,
            reservations = settlements.len(),
            reserved = reserved_total,
            charged = charge,
            balance = tx.resulting_balance,
            "Credits committed"
        );
        Ok(tx)
    }

    /// Release a reservation without charging.
    pub fn rollback(&self, reservation_id: &str) -> LedgerResult<CreditTransaction> {
        let mut inner = self.inner.lock().map_err(|_| LedgerError::LockPoisoned)?;
        let tx = inner.rollback(reservation_id, ChargeTag::default())?;
        debug!(reservation_id, amount = tx.amount, "Reservation rolled back");
        Ok(tx)
    }

    /// Roll back every open reservation created before `now - ttl`.
    ///
    /// Settled reservations older than the cutoff are forgotten first; a late
    /// commit or rollback of one fails with `ReservationNotFound`.
    pub fn sweep_expired(&self, now: DateTime<Utc>, ttl: Duration) -> LedgerResult<Vec<ReservationId>> {
        let mut inner = self.inner.lock().map_err(|_| LedgerError::LockPoisoned)?;
        let cutoff = now - ttl;
        let held = inner.reservations.len();
        inner
            .reservations
            .retain(|_, r| r.state == ReservationState::Open || r.created_at >= cutoff);
        let pruned = held - inner.reservations.len();
        if pruned > 0 {
            debug!(pruned, "Forgot settled reservations");
        }
        let mut expired: Vec<(DateTime<Utc>, ReservationId)> = inner
            .reservations
            .iter()
            .filter(|(_, r)| r.state == ReservationState::Open && r.created_at < cutoff)
            .map(|(id, r)| (r.created_at, id.clone()))
            .collect();
        expired.sort();

        let mut swept = Vec::with_capacity(expired.len());
        for (_, id) in expired {
            inner.rollback(&id, ChargeTag::default())?;
            swept.push(id);
        }
        if !swept.is_empty() {
            warn!(count = swept.len(), "Swept orphaned reservations");
        }
        Ok(swept)
    }

    /// Balance folded from the user's transaction log.
    pub fn balance(&self, user_id: &str) -> LedgerResult<Balance> {
        let inner = self.inner.lock().map_err(|_| LedgerError::LockPoisoned)?;
        Ok(inner.balance(user_id))
    }

    /// The user's full transaction log, oldest first.
    pub fn transactions(&self, user_id: &str) -> LedgerResult<Vec<CreditTransaction>> {
        let inner = self.inner.lock().map_err(|_| LedgerError::LockPoisoned)?;
        Ok(inner.logs.get(user_id).cloned().unwrap_or_default())
    }

    /// State of a reservation, if it exists.
    pub fn reservation_state(&self, reservation_id: &str) -> LedgerResult<Option<ReservationState>> {
        let inner = self.inner.lock().map_err(|_| LedgerError::LockPoisoned)?;
        Ok(inner.reservations.get(reservation_id).map(|r| r.state))
    }
}
