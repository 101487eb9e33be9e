//! Per-user account balance.
//!
//! The balance row is owned by the ledger. Callers read it but never write
//! it; every mutation goes through [`AccountBalance::settle`],
//! [`AccountBalance::reserve`] or [`AccountBalance::release`] as part of a
//! transaction state change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CreditError, Result};
use crate::transaction::{Direction, Transaction, TransactionType};
use crate::UserId;

/// Authoritative credit balance for one user.
///
/// Invariant (checked by [`AccountBalance::is_consistent`]):
///
/// `current_balance = total_purchased + total_bonus + total_refunded
///                    - total_used - total_expired - total_reversed`
///
/// and `reserved_credits <= current_balance`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    /// Owner.
    pub user_id: UserId,

    /// Signed sum of completed transactions. Never negative.
    pub current_balance: u64,

    /// Credits held by pending debits (usage holds, purchase refunds).
    pub reserved_credits: u64,

    /// Lifetime purchased credits (package base amount).
    pub total_purchased: u64,

    /// Lifetime bonus, trial and subscription credits.
    pub total_bonus: u64,

    /// Lifetime credits spent.
    pub total_used: u64,

    /// Lifetime credits returned by usage refunds.
    pub total_refunded: u64,

    /// Lifetime credits removed by expiry.
    pub total_expired: u64,

    /// Lifetime credits withdrawn by purchase refunds (money returned).
    #[serde(default)]
    pub total_reversed: u64,

    /// Last completed purchase.
    pub last_purchase_at: Option<DateTime<Utc>>,

    /// Last completed usage.
    pub last_usage_at: Option<DateTime<Utc>>,

    /// Optimistic concurrency version; bumped on every write.
    pub version: u64,

    /// Last write.
    pub updated_at: DateTime<Utc>,
}

impl AccountBalance {
    /// A zero balance that has never been written.
    #[must_use]
    pub fn empty(user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            current_balance: 0,
            reserved_credits: 0,
            total_purchased: 0,
            total_bonus: 0,
            total_used: 0,
            total_refunded: 0,
            total_expired: 0,
            total_reversed: 0,
            last_purchase_at: None,
            last_usage_at: None,
            version: 0,
            updated_at: now,
        }
    }

    /// Credits that can be spent right now.
    #[must_use]
    pub fn available(&self) -> u64 {
        self.current_balance.saturating_sub(self.reserved_credits)
    }

    /// Hold `credits` for a pending debit.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::InsufficientBalance`] when fewer than `credits`
    /// are available.
    pub fn reserve(&mut self, credits: u64) -> Result<()> {
        let available = self.available();
        if available < credits {
            return Err(CreditError::InsufficientBalance {
                available,
                required: credits,
            });
        }
        self.reserved_credits += credits;
        Ok(())
    }

    /// Drop a reservation taken by [`AccountBalance::reserve`].
    pub fn release(&mut self, credits: u64) {
        self.reserved_credits = self.reserved_credits.saturating_sub(credits);
    }

    /// Apply the balance effect of a transaction reaching `Completed`.
    ///
    /// Debits consume their reservation; the caller reserved them when the
    /// transaction was created.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::InsufficientBalance`] if a debit would drive
    /// the balance negative, which means its reservation was lost.
    pub fn settle(&mut self, tx: &Transaction, now: DateTime<Utc>) -> Result<()> {
        match tx.direction {
            Direction::Credit => {
                self.current_balance += tx.credits;
                match tx.transaction_type {
                    TransactionType::Purchase => {
                        self.total_purchased += tx.credits - tx.bonus_credits;
                        self.total_bonus += tx.bonus_credits;
                        self.last_purchase_at = Some(now);
                    }
                    TransactionType::Refund => self.total_refunded += tx.credits,
                    _ => self.total_bonus += tx.credits,
                }
            }
            Direction::Debit => {
                if self.current_balance < tx.credits {
                    return Err(CreditError::InsufficientBalance {
                        available: self.current_balance,
                        required: tx.credits,
                    });
                }
                self.current_balance -= tx.credits;
                self.release(tx.credits);
                match tx.transaction_type {
                    TransactionType::Usage => {
                        self.total_used += tx.credits;
                        self.last_usage_at = Some(now);
                    }
                    TransactionType::Expiry => self.total_expired += tx.credits,
                    _ => self.total_reversed += tx.credits,
                }
            }
        }
        Ok(())
    }

    /// Check the counter identity and the reservation bound.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let inflow = u128::from(self.total_purchased)
            + u128::from(self.total_bonus)
            + u128::from(self.total_refunded);
        let outflow = u128::from(self.total_used)
            + u128::from(self.total_expired)
            + u128::from(self.total_reversed);
        inflow >= outflow
            && inflow - outflow == u128::from(self.current_balance)
            && self.reserved_credits <= self.current_balance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TransactionStatus;

    fn completed(
        user_id: UserId,
        transaction_type: TransactionType,
        direction: Direction,
        credits: u64,
    ) -> Transaction {
        let mut tx =
            Transaction::pending(user_id, transaction_type, direction, credits, "t", Utc::now())
                .unwrap();
        tx.transition(TransactionStatus::Completed, Utc::now())
            .unwrap();
        tx
    }

    #[test]
    fn new_balance_is_empty_and_consistent() {
        let balance = AccountBalance::empty(UserId::generate(), Utc::now());
        assert_eq!(balance.current_balance, 0);
        assert_eq!(balance.available(), 0);
        assert!(balance.is_consistent());
    }

    #[test]
    fn purchase_splits_base_and_bonus() {
        let user_id = UserId::generate();
        let mut balance = AccountBalance::empty(user_id, Utc::now());
        let mut tx = completed(user_id, TransactionType::Purchase, Direction::Credit, 30);
        tx.bonus_credits = 5;

        balance.settle(&tx, Utc::now()).unwrap();
        assert_eq!(balance.current_balance, 30);
        assert_eq!(balance.total_purchased, 25);
        assert_eq!(balance.total_bonus, 5);
        assert!(balance.last_purchase_at.is_some());
        assert!(balance.is_consistent());
    }

    #[test]
    fn reservations_limit_availability() {
        let user_id = UserId::generate();
        let mut balance = AccountBalance::empty(user_id, Utc::now());
        balance
            .settle(
                &completed(user_id, TransactionType::Bonus, Direction::Credit, 10),
                Utc::now(),
            )
            .unwrap();

        balance.reserve(7).unwrap();
        assert_eq!(balance.available(), 3);
        let err = balance.reserve(4).unwrap_err();
        assert_eq!(
            err,
            CreditError::InsufficientBalance {
                available: 3,
                required: 4
            }
        );

        balance.release(7);
        assert_eq!(balance.available(), 10);
    }

    #[test]
    fn debit_settlement_consumes_reservation() {
        let user_id = UserId::generate();
        let mut balance = AccountBalance::empty(user_id, Utc::now());
        balance
            .settle(
                &completed(user_id, TransactionType::Bonus, Direction::Credit, 10),
                Utc::now(),
            )
            .unwrap();
        balance.reserve(4).unwrap();

        let usage = completed(user_id, TransactionType::Usage, Direction::Debit, 4);
        balance.settle(&usage, Utc::now()).unwrap();

        assert_eq!(balance.current_balance, 6);
        assert_eq!(balance.reserved_credits, 0);
        assert_eq!(balance.total_used, 4);
        assert!(balance.is_consistent());
    }

    #[test]
    fn refund_direction_selects_counter() {
        let user_id = UserId::generate();
        let mut balance = AccountBalance::empty(user_id, Utc::now());
        balance
            .settle(
                &completed(user_id, TransactionType::Purchase, Direction::Credit, 20),
                Utc::now(),
            )
            .unwrap();
        balance
            .settle(
                &completed(user_id, TransactionType::Refund, Direction::Credit, 3),
                Utc::now(),
            )
            .unwrap();
        balance.reserve(5).unwrap();
        balance
            .settle(
                &completed(user_id, TransactionType::Refund, Direction::Debit, 5),
                Utc::now(),
            )
            .unwrap();

        assert_eq!(balance.total_refunded, 3);
        assert_eq!(balance.total_reversed, 5);
        assert_eq!(balance.current_balance, 18);
        assert!(balance.is_consistent());
    }
}
