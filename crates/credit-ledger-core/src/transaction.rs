//! Ledger transactions and their lifecycle.
//!
//! Every balance-affecting event is a [`Transaction`]. Transactions are
//! append-only: they are created, moved through the status state machine
//! exactly once, and never deleted.
//!
//! ```text
//!             ┌──complete──► Completed
//!   Pending ──┼──fail──────► Failed
//!             └──cancel────► Cancelled
//! ```
//!
//! All three outcomes are terminal.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CreditError, Result};
use crate::metadata::Metadata;
use crate::{TransactionId, UserId};

/// Type of ledger transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    /// Credits bought through the payment gateway.
    Purchase,
    /// Credits spent on a product action.
    Usage,
    /// Reversal of an earlier purchase or usage.
    Refund,
    /// Promotional credits.
    Bonus,
    /// Trial grant.
    Trial,
    /// Subscription grant.
    Subscription,
    /// Credits removed because they expired.
    Expiry,
}

impl TransactionType {
    /// Balance direction implied by the type alone.
    ///
    /// Refunds return `None`: their direction depends on what they reverse.
    #[must_use]
    pub const fn natural_direction(self) -> Option<Direction> {
        match self {
            Self::Purchase | Self::Bonus | Self::Trial | Self::Subscription => {
                Some(Direction::Credit)
            }
            Self::Usage | Self::Expiry => Some(Direction::Debit),
            Self::Refund => None,
        }
    }

    /// Stable upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Purchase => "PURCHASE",
            Self::Usage => "USAGE",
            Self::Refund => "REFUND",
            Self::Bonus => "BONUS",
            Self::Trial => "TRIAL",
            Self::Subscription => "SUBSCRIPTION",
            Self::Expiry => "EXPIRY",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a transaction adds to or removes from the balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Adds credits on completion.
    Credit,
    /// Removes credits; reserved at creation, settled on completion.
    Debit,
}

/// Lifecycle status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    /// Created, awaiting settlement.
    Pending,
    /// Settled; balance effects applied.
    Completed,
    /// Rejected by the gateway or the ledger.
    Failed,
    /// Withdrawn before settlement.
    Cancelled,
}

impl TransactionStatus {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Whether `self -> to` is a legal move.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Completed | Self::Failed | Self::Cancelled)
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        })
    }
}

/// One ledger event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique id (ULID, time-ordered).
    pub id: TransactionId,

    /// Owner of the balance.
    pub user_id: UserId,

    /// Kind of event.
    pub transaction_type: TransactionType,

    /// Balance direction, fixed at creation.
    pub direction: Direction,

    /// Credits moved, always positive. Includes `bonus_credits`.
    pub credits: u64,

    /// Portion of `credits` granted as a package bonus.
    #[serde(default)]
    pub bonus_credits: u64,

    /// Lifecycle status.
    pub status: TransactionStatus,

    /// Human-readable description.
    pub description: String,

    /// Product action or gateway charge this transaction is tied to.
    pub reference_id: Option<String>,

    /// Kind of `reference_id` (e.g. `job_application`, `gateway_charge`).
    pub reference_type: Option<String>,

    /// For refunds: the transaction being reversed.
    pub reverses: Option<TransactionId>,

    /// When purchased credits stop being spendable.
    pub expires_at: Option<DateTime<Utc>>,

    /// Sanitized caller metadata.
    #[serde(default)]
    pub metadata: Metadata,

    /// Why the transaction failed or was cancelled.
    pub failure_reason: Option<String>,

    /// Creation time.
    pub created_at: DateTime<Utc>,

    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Create a pending transaction.
    ///
    /// # Errors
    ///
    /// Returns a validation error when `credits` is zero.
    pub fn pending(
        user_id: UserId,
        transaction_type: TransactionType,
        direction: Direction,
        credits: u64,
        description: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if credits == 0 {
            return Err(CreditError::validation(
                "transaction credits must be a positive integer",
            ));
        }
        Ok(Self {
            id: TransactionId::generate(),
            user_id,
            transaction_type,
            direction,
            credits,
            bonus_credits: 0,
            status: TransactionStatus::Pending,
            description: description.into(),
            reference_id: None,
            reference_type: None,
            reverses: None,
            expires_at: None,
            metadata: Metadata::new(),
            failure_reason: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Signed balance effect once completed (zero otherwise).
    #[must_use]
    pub fn settled_delta(&self) -> i128 {
        if self.status != TransactionStatus::Completed {
            return 0;
        }
        match self.direction {
            Direction::Credit => i128::from(self.credits),
            Direction::Debit => -i128::from(self.credits),
        }
    }

    /// Whether this is a pending debit holding a reservation.
    #[must_use]
    pub fn holds_reservation(&self) -> bool {
        self.status == TransactionStatus::Pending && self.direction == Direction::Debit
    }

    /// Move to `to`, stamping `updated_at`.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::InvalidTransition`] for any move out of a
    /// terminal state or back to `Pending`.
    pub fn transition(&mut self, to: TransactionStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(CreditError::invalid_transaction_transition(
                self.id,
                self.status,
                to,
            ));
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_purchase() -> Transaction {
        Transaction::pending(
            UserId::generate(),
            TransactionType::Purchase,
            Direction::Credit,
            30,
            "Standard package",
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn zero_credit_transactions_are_rejected() {
        let err = Transaction::pending(
            UserId::generate(),
            TransactionType::Bonus,
            Direction::Credit,
            0,
            "nothing",
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, CreditError::Validation { .. }));
    }

    #[test]
    fn pending_moves_to_each_terminal_state() {
        for to in [
            TransactionStatus::Completed,
            TransactionStatus::Failed,
            TransactionStatus::Cancelled,
        ] {
            let mut tx = pending_purchase();
            tx.transition(to, Utc::now()).unwrap();
            assert_eq!(tx.status, to);
            assert!(tx.status.is_terminal());
        }
    }

    #[test]
    fn terminal_states_never_move() {
        let all = [
            TransactionStatus::Pending,
            TransactionStatus::Completed,
            TransactionStatus::Failed,
            TransactionStatus::Cancelled,
        ];
        for from in &all[1..] {
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be illegal");
            }
        }

        let mut tx = pending_purchase();
        tx.transition(TransactionStatus::Failed, Utc::now()).unwrap();
        let err = tx
            .transition(TransactionStatus::Completed, Utc::now())
            .unwrap_err();
        assert!(matches!(err, CreditError::InvalidTransition { .. }));
        assert_eq!(tx.status, TransactionStatus::Failed);
    }

    #[test]
    fn settled_delta_only_counts_completed() {
        let mut tx = pending_purchase();
        assert_eq!(tx.settled_delta(), 0);
        tx.transition(TransactionStatus::Completed, Utc::now()).unwrap();
        assert_eq!(tx.settled_delta(), 30);

        let mut usage = Transaction::pending(
            tx.user_id,
            TransactionType::Usage,
            Direction::Debit,
            4,
            "profile boost",
            Utc::now(),
        )
        .unwrap();
        assert!(usage.holds_reservation());
        usage
            .transition(TransactionStatus::Completed, Utc::now())
            .unwrap();
        assert_eq!(usage.settled_delta(), -4);
    }

    #[test]
    fn natural_directions() {
        assert_eq!(
            TransactionType::Purchase.natural_direction(),
            Some(Direction::Credit)
        );
        assert_eq!(
            TransactionType::Expiry.natural_direction(),
            Some(Direction::Debit)
        );
        assert_eq!(TransactionType::Refund.natural_direction(), None);
    }

    #[test]
    fn wire_names_are_upper_case() {
        let json = serde_json::to_string(&TransactionType::Subscription).unwrap();
        assert_eq!(json, "\"SUBSCRIPTION\"");
        let json = serde_json::to_string(&TransactionStatus::Cancelled).unwrap();
        assert_eq!(json, "\"CANCELLED\"");
    }
}
