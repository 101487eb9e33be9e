//! The credit ledger.
//!
//! Owns every balance mutation. Each write runs under the user's lock and
//! is committed with a compare-and-swap on the balance version, retrying a
//! bounded number of times if another process moved the row underneath.
//!
//! Credits are only added when a transaction completes. Debits reserve
//! their credits when they are created, so a pending usage hold or purchase
//! refund can never be overdrawn by a concurrent request.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use credit_ledger_core::limits::validate_refund_eligibility;
use credit_ledger_core::{
    AccountBalance, CreditError, Direction, Metadata, PurchaseQuote, RefundPolicy, Result,
    Transaction, TransactionId, TransactionStatus, TransactionType, UserId, ValidationReport,
};
use credit_ledger_store::{LedgerCommit, Store, StoreError};

use crate::locks::KeyedLocks;

/// Reference type recorded on refunds pointing at the transaction they reverse.
pub const REFUND_REFERENCE_TYPE: &str = "transaction";

/// Reference type recorded by [`Ledger::attach_gateway_reference`].
pub const GATEWAY_REFERENCE_TYPE: &str = "gateway_payment";

/// Metadata key holding the gateway refund id of a refund transaction.
pub const GATEWAY_REFUND_METADATA_KEY: &str = "gateway_refund_id";

/// Optional fields for [`Ledger::apply_transaction`].
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Description; a default is derived from the type when absent.
    pub description: Option<String>,
    /// Product action or gateway object the transaction is tied to.
    pub reference_id: Option<String>,
    /// Kind of `reference_id`.
    pub reference_type: Option<String>,
    /// Expiry of purchased credits.
    pub expires_at: Option<DateTime<Utc>>,
    /// Sanitized metadata.
    pub metadata: Metadata,
    /// Portion of `credits` that is a package bonus (purchases only).
    pub bonus_credits: u64,
    /// Required for refunds; must match the type's direction otherwise.
    pub direction: Option<Direction>,
    /// Transaction this one reverses.
    pub reverses: Option<TransactionId>,
    /// Override whether the transaction waits for external confirmation.
    /// Purchases and money-back refunds wait by default; everything else
    /// completes immediately.
    pub await_confirmation: Option<bool>,
}

impl ApplyOptions {
    /// Options for the pending purchase that pays `quote`.
    ///
    /// The priced amount and package land in system metadata so gateway
    /// reconciliation and operators can see what was charged.
    #[must_use]
    pub fn for_quote(quote: &PurchaseQuote, currency: &str, now: DateTime<Utc>) -> Self {
        let mut metadata = Metadata::new();
        metadata.insert_system("amount", quote.final_amount.to_string());
        metadata.insert_system("currency", currency);
        if let Some(package_type) = quote.package_type {
            metadata.insert_system("package_type", package_type.as_str());
        }
        if let Some(promo_code) = &quote.promo_code {
            metadata.insert_system("promo_code", promo_code.as_str());
        }

        let description = match quote.package_type {
            Some(package_type) => format!(
                "{package_type} package: {} credits",
                quote.total_credits
            ),
            None => format!("Bulk purchase: {} credits", quote.total_credits),
        };

        Self {
            description: Some(description),
            expires_at: quote
                .validity_days
                .map(|days| now + Duration::days(i64::from(days))),
            metadata,
            bonus_credits: quote.bonus_credits,
            ..Self::default()
        }
    }
}

/// What a write closure decided.
enum Plan {
    /// Persist these transactions with the mutated balance. The first one
    /// is returned to the caller.
    Commit(Vec<Transaction>),
    /// Nothing to write; return this record as is.
    Unchanged(Transaction),
}

/// Authoritative per-user balances and the append-only transaction log.
pub struct Ledger {
    store: Arc<dyn Store>,
    locks: KeyedLocks<UserId>,
    max_commit_attempts: u32,
}

impl Ledger {
    /// Create a ledger over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, max_commit_attempts: u32) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
            max_commit_attempts: max_commit_attempts.max(1),
        }
    }

    /// Underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Current balance; a zero balance for users with no history.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    pub fn get_balance(&self, user_id: &UserId) -> Result<AccountBalance> {
        Ok(self
            .store
            .get_balance(user_id)?
            .unwrap_or_else(|| AccountBalance::empty(*user_id, Utc::now())))
    }

    /// Look up a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::NotFound`] if it does not exist.
    pub fn get_transaction(&self, transaction_id: &TransactionId) -> Result<Transaction> {
        self.store
            .get_transaction(transaction_id)?
            .ok_or_else(|| CreditError::transaction_not_found(transaction_id))
    }

    /// A user's transactions, newest first.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    pub fn list_transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Transaction>> {
        Ok(self.store.list_transactions_by_user(user_id, limit, offset)?)
    }

    /// Record a new transaction.
    ///
    /// Transactions awaiting confirmation are stored `Pending`; debits
    /// among them reserve their credits. Everything else completes in the
    /// same atomic write, so a usage either debits the balance or fails with
    /// [`CreditError::InsufficientBalance`].
    ///
    /// # Errors
    ///
    /// - [`CreditError::Validation`] for a zero amount, a missing or
    ///   contradictory direction, or a misplaced bonus.
    /// - [`CreditError::InsufficientBalance`] when a debit exceeds the
    ///   available balance.
    pub async fn apply_transaction(
        &self,
        user_id: UserId,
        transaction_type: TransactionType,
        credits: u64,
        options: ApplyOptions,
    ) -> Result<Transaction> {
        let direction = resolve_direction(transaction_type, options.direction)?;
        if options.bonus_credits > 0
            && (transaction_type != TransactionType::Purchase || options.bonus_credits > credits)
        {
            return Err(CreditError::validation(
                "bonus credits only apply to purchases and cannot exceed the total",
            ));
        }
        let awaits = options.await_confirmation.unwrap_or(matches!(
            (transaction_type, direction),
            (TransactionType::Purchase, _) | (TransactionType::Refund, Direction::Debit)
        ));

        let description = options
            .description
            .clone()
            .unwrap_or_else(|| default_description(transaction_type, credits));

        let result = self
            .write(user_id, |balance, now| {
                let mut tx = Transaction::pending(
                    user_id,
                    transaction_type,
                    direction,
                    credits,
                    description.clone(),
                    now,
                )?;
                tx.bonus_credits = options.bonus_credits;
                tx.reference_id.clone_from(&options.reference_id);
                tx.reference_type.clone_from(&options.reference_type);
                tx.expires_at = options.expires_at;
                tx.metadata = options.metadata.clone();
                tx.reverses = options.reverses;

                if direction == Direction::Debit {
                    balance.reserve(credits)?;
                }
                if !awaits {
                    tx.transition(TransactionStatus::Completed, now)?;
                    balance.settle(&tx, now)?;
                }
                Ok(Plan::Commit(vec![tx]))
            })
            .await;

        match &result {
            Ok(tx) => info!(
                user_id = %user_id,
                transaction_id = %tx.id,
                transaction_type = %transaction_type,
                status = %tx.status,
                credits,
                "Transaction recorded"
            ),
            Err(CreditError::InsufficientBalance {
                available,
                required,
            }) => warn!(
                user_id = %user_id,
                transaction_type = %transaction_type,
                available,
                required,
                "Insufficient balance"
            ),
            Err(e) => warn!(user_id = %user_id, error = %e, "Transaction rejected"),
        }
        result
    }

    /// Complete a pending transaction and apply its balance effect.
    ///
    /// Completing an already completed transaction returns it unchanged.
    ///
    /// # Errors
    ///
    /// - [`CreditError::NotFound`] for an unknown id.
    /// - [`CreditError::InvalidTransition`] if it already failed or was cancelled.
    pub async fn complete_transaction(&self, transaction_id: TransactionId) -> Result<Transaction> {
        self.finish(transaction_id, TransactionStatus::Completed, None)
            .await
    }

    /// Fail a pending transaction, releasing any reservation.
    ///
    /// Failing an already failed transaction returns it unchanged.
    ///
    /// # Errors
    ///
    /// - [`CreditError::NotFound`] for an unknown id.
    /// - [`CreditError::InvalidTransition`] if it completed or was cancelled.
    pub async fn fail_transaction(
        &self,
        transaction_id: TransactionId,
        reason: impl Into<String>,
    ) -> Result<Transaction> {
        self.finish(transaction_id, TransactionStatus::Failed, Some(reason.into()))
            .await
    }

    /// Cancel a pending transaction, releasing any reservation.
    ///
    /// Cancelling an already cancelled transaction returns it unchanged.
    ///
    /// # Errors
    ///
    /// - [`CreditError::NotFound`] for an unknown id.
    /// - [`CreditError::InvalidTransition`] if it completed or failed.
    pub async fn cancel_transaction(
        &self,
        transaction_id: TransactionId,
        reason: Option<String>,
    ) -> Result<Transaction> {
        self.finish(transaction_id, TransactionStatus::Cancelled, reason)
            .await
    }

    /// Create a refund reversing (part of) a completed transaction.
    ///
    /// The refund moves credits in the opposite direction of the original.
    /// A refund of a purchase returns money through the gateway: it reserves
    /// the credits and stays pending until the gateway confirms. Any other
    /// refund completes immediately. The refunds of one transaction never
    /// add up to more than its credits.
    ///
    /// # Errors
    ///
    /// - [`CreditError::NotFound`] for an unknown original.
    /// - [`CreditError::Validation`] if the original is not a completed,
    ///   refundable transaction or the amount exceeds what is left.
    /// - [`CreditError::InsufficientBalance`] if the credits to withdraw are
    ///   no longer available.
    pub async fn reverse_transaction(
        &self,
        original_id: TransactionId,
        credits: Option<u64>,
        reason: impl Into<String>,
    ) -> Result<Transaction> {
        self.reverse(original_id, credits, reason.into(), None).await
    }

    /// Refund (part of) a completed purchase to its payment method.
    ///
    /// Like [`Ledger::reverse_transaction`], but the purchase must also be
    /// eligible under `policy`. Usage is counted under the same lock that
    /// records the refund, so credits spent concurrently are never missed.
    ///
    /// # Errors
    ///
    /// As [`Ledger::reverse_transaction`], plus [`CreditError::Validation`]
    /// when the original is not a purchase or is no longer eligible.
    pub async fn refund_purchase(
        &self,
        original_id: TransactionId,
        credits: Option<u64>,
        reason: impl Into<String>,
        policy: &RefundPolicy,
    ) -> Result<Transaction> {
        self.reverse(original_id, credits, reason.into(), Some(policy))
            .await
    }

    async fn reverse(
        &self,
        original_id: TransactionId,
        credits: Option<u64>,
        reason: String,
        policy: Option<&RefundPolicy>,
    ) -> Result<Transaction> {
        let original = self.get_transaction(&original_id)?;
        if original.status != TransactionStatus::Completed {
            return Err(CreditError::validation(format!(
                "only completed transactions can be refunded (transaction is {})",
                original.status
            )));
        }
        if matches!(
            original.transaction_type,
            TransactionType::Refund | TransactionType::Expiry
        ) {
            return Err(CreditError::validation(format!(
                "{} transactions cannot be refunded",
                original.transaction_type
            )));
        }

        let direction = match original.direction {
            Direction::Credit => Direction::Debit,
            Direction::Debit => Direction::Credit,
        };
        let awaits = original.transaction_type == TransactionType::Purchase;
        let reference = original.id.to_string();

        let result = self
            .write(original.user_id, |balance, now| {
                if let Some(policy) = policy {
                    let consumed = self
                        .store
                        .transactions_since(&original.user_id, original.updated_at)?
                        .iter()
                        .filter(|t| {
                            t.transaction_type == TransactionType::Usage
                                && t.status == TransactionStatus::Completed
                        })
                        .fold(0, |sum: u64, t| sum.saturating_add(t.credits));
                    ValidationReport::new()
                        .with(validate_refund_eligibility(&original, consumed, now, policy))
                        .into_result()?;
                }

                let already: u64 = self
                    .store
                    .transactions_by_reference(&reference)?
                    .iter()
                    .filter(|t| {
                        t.reverses == Some(original.id)
                            && matches!(
                                t.status,
                                TransactionStatus::Pending | TransactionStatus::Completed
                            )
                    })
                    .map(|t| t.credits)
                    .sum();
                let remaining = original.credits.saturating_sub(already);
                let amount = credits.unwrap_or(remaining);
                if amount == 0 || amount > remaining {
                    return Err(CreditError::validation(format!(
                        "refund of {amount} credits exceeds the {remaining} refundable credits left"
                    )));
                }

                let mut tx = Transaction::pending(
                    original.user_id,
                    TransactionType::Refund,
                    direction,
                    amount,
                    reason.clone(),
                    now,
                )?;
                tx.reference_id = Some(reference.clone());
                tx.reference_type = Some(REFUND_REFERENCE_TYPE.to_string());
                tx.reverses = Some(original.id);
                if let Some(gateway_reference) = original
                    .reference_id
                    .as_deref()
                    .filter(|_| original.reference_type.as_deref() == Some(GATEWAY_REFERENCE_TYPE))
                {
                    tx.metadata
                        .insert_system("gateway_reference", gateway_reference);
                }

                if direction == Direction::Debit {
                    balance.reserve(amount)?;
                }
                if !(awaits && direction == Direction::Debit) {
                    tx.transition(TransactionStatus::Completed, now)?;
                    balance.settle(&tx, now)?;
                }
                Ok(Plan::Commit(vec![tx]))
            })
            .await;

        match &result {
            Ok(tx) => info!(
                user_id = %original.user_id,
                transaction_id = %tx.id,
                original_id = %original.id,
                credits = tx.credits,
                status = %tx.status,
                "Refund recorded"
            ),
            Err(e) => warn!(original_id = %original.id, error = %e, "Refund rejected"),
        }
        result
    }

    /// Remove up to `credits` expired credits, clamped to what is available.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::Validation`] when nothing is available to expire.
    pub async fn expire_credits(
        &self,
        user_id: UserId,
        credits: u64,
        description: impl Into<String>,
    ) -> Result<Transaction> {
        let description = description.into();
        let tx = self
            .write(user_id, |balance, now| {
                let amount = credits.min(balance.available());
                if amount == 0 {
                    return Err(CreditError::validation("no available credits to expire"));
                }
                let mut tx = Transaction::pending(
                    user_id,
                    TransactionType::Expiry,
                    Direction::Debit,
                    amount,
                    description.clone(),
                    now,
                )?;
                balance.reserve(amount)?;
                tx.transition(TransactionStatus::Completed, now)?;
                balance.settle(&tx, now)?;
                Ok(Plan::Commit(vec![tx]))
            })
            .await?;
        info!(user_id = %user_id, transaction_id = %tx.id, credits = tx.credits, "Credits expired");
        Ok(tx)
    }

    /// Record the gateway id of a pending transaction so webhook events can
    /// be correlated by it.
    ///
    /// A purchase takes its payment id as reference. A refund already
    /// references the transaction it reverses, so its gateway refund id is
    /// kept in metadata under [`GATEWAY_REFUND_METADATA_KEY`].
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::Validation`] when the transaction is no longer
    /// pending or already carries a different gateway id.
    pub async fn attach_gateway_reference(
        &self,
        transaction_id: TransactionId,
        gateway_reference: impl Into<String>,
    ) -> Result<Transaction> {
        let gateway_reference = gateway_reference.into();
        let user_id = self.get_transaction(&transaction_id)?.user_id;
        self.write(user_id, |_, now| {
            let mut tx = self.get_transaction(&transaction_id)?;
            let is_refund = tx.transaction_type == TransactionType::Refund;
            let existing = if is_refund {
                tx.metadata
                    .get(GATEWAY_REFUND_METADATA_KEY)
                    .map(str::to_string)
            } else {
                tx.reference_id.clone()
            };
            if existing.as_deref() == Some(gateway_reference.as_str()) {
                return Ok(Plan::Unchanged(tx));
            }
            if tx.status != TransactionStatus::Pending {
                return Err(CreditError::validation(format!(
                    "transaction {transaction_id} is {} and cannot take a gateway reference",
                    tx.status
                )));
            }
            if let Some(existing) = existing {
                return Err(CreditError::validation(format!(
                    "transaction {transaction_id} already references {existing}"
                )));
            }
            if is_refund {
                tx.metadata
                    .insert_system(GATEWAY_REFUND_METADATA_KEY, gateway_reference.clone());
            } else {
                tx.reference_id = Some(gateway_reference.clone());
                tx.reference_type = Some(GATEWAY_REFERENCE_TYPE.to_string());
            }
            tx.updated_at = now;
            Ok(Plan::Commit(vec![tx]))
        })
        .await
    }

    async fn finish(
        &self,
        transaction_id: TransactionId,
        to: TransactionStatus,
        reason: Option<String>,
    ) -> Result<Transaction> {
        let user_id = self.get_transaction(&transaction_id)?.user_id;
        let result = self
            .write(user_id, |balance, now| {
                let mut tx = self.get_transaction(&transaction_id)?;
                if tx.status == to {
                    return Ok(Plan::Unchanged(tx));
                }
                tx.transition(to, now)?;
                match to {
                    TransactionStatus::Completed => balance.settle(&tx, now)?,
                    TransactionStatus::Failed | TransactionStatus::Cancelled => {
                        if tx.direction == Direction::Debit {
                            balance.release(tx.credits);
                        }
                        tx.failure_reason.clone_from(&reason);
                    }
                    TransactionStatus::Pending => {}
                }
                Ok(Plan::Commit(vec![tx]))
            })
            .await;

        match &result {
            Ok(tx) => info!(
                user_id = %user_id,
                transaction_id = %transaction_id,
                status = %tx.status,
                "Transaction finished"
            ),
            Err(e @ CreditError::InvalidTransition { .. }) => error!(
                user_id = %user_id,
                transaction_id = %transaction_id,
                error = %e,
                "Illegal transaction transition"
            ),
            Err(e) => warn!(transaction_id = %transaction_id, error = %e, "Transition failed"),
        }
        result
    }

    /// Run `plan` against a fresh balance under the user's lock and commit
    /// the result, retrying on version conflicts.
    async fn write<F>(&self, user_id: UserId, mut plan: F) -> Result<Transaction>
    where
        F: FnMut(&mut AccountBalance, DateTime<Utc>) -> Result<Plan>,
    {
        let _guard = self.locks.lock(user_id).await;

        let mut attempt = 1;
        loop {
            let mut balance = self.get_balance(&user_id)?;
            let transactions = match plan(&mut balance, Utc::now())? {
                Plan::Unchanged(tx) => return Ok(tx),
                Plan::Commit(transactions) => transactions,
            };
            debug_assert!(balance.is_consistent(), "balance invariant violated");
            let Some(primary) = transactions.first().cloned() else {
                return Err(CreditError::Storage("empty ledger commit".into()));
            };

            let commit = LedgerCommit {
                transactions,
                ..LedgerCommit::new(balance)
            };
            match self.store.commit(commit) {
                Ok(stored) => {
                    debug!(
                        user_id = %user_id,
                        version = stored.version,
                        balance = stored.current_balance,
                        reserved = stored.reserved_credits,
                        "Ledger commit"
                    );
                    return Ok(primary);
                }
                Err(StoreError::VersionConflict {
                    expected, actual, ..
                }) if attempt < self.max_commit_attempts => {
                    debug!(
                        user_id = %user_id,
                        attempt,
                        expected,
                        actual,
                        "Balance version conflict, retrying"
                    );
                    attempt += 1;
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn resolve_direction(
    transaction_type: TransactionType,
    requested: Option<Direction>,
) -> Result<Direction> {
    match (transaction_type.natural_direction(), requested) {
        (Some(natural), Some(requested)) if natural != requested => {
            Err(CreditError::validation(format!(
                "{transaction_type} transactions cannot be {requested:?}s"
            )))
        }
        (Some(natural), _) => Ok(natural),
        (None, Some(requested)) => Ok(requested),
        (None, None) => Err(CreditError::validation(format!(
            "{transaction_type} transactions need an explicit direction"
        ))),
    }
}

fn default_description(transaction_type: TransactionType, credits: u64) -> String {
    match transaction_type {
        TransactionType::Purchase => format!("Purchase of {credits} credits"),
        TransactionType::Usage => format!("Used {credits} credits"),
        TransactionType::Refund => format!("Refund of {credits} credits"),
        TransactionType::Bonus => format!("Bonus of {credits} credits"),
        TransactionType::Trial => format!("Trial grant of {credits} credits"),
        TransactionType::Subscription => format!("Subscription grant of {credits} credits"),
        TransactionType::Expiry => format!("Expiry of {credits} credits"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use credit_ledger_store::MemoryStore;

    fn ledger() -> Ledger {
        Ledger::new(Arc::new(MemoryStore::new()), 5)
    }

    async fn grant(ledger: &Ledger, user_id: UserId, credits: u64) {
        ledger
            .apply_transaction(user_id, TransactionType::Bonus, credits, ApplyOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn purchase_credits_only_on_completion() {
        let ledger = ledger();
        let user_id = UserId::generate();
        let options = ApplyOptions {
            bonus_credits: 5,
            ..ApplyOptions::default()
        };
        let tx = ledger
            .apply_transaction(user_id, TransactionType::Purchase, 30, options)
            .await
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::Pending);
        assert_eq!(ledger.get_balance(&user_id).unwrap().current_balance, 0);

        let done = ledger.complete_transaction(tx.id).await.unwrap();
        assert_eq!(done.status, TransactionStatus::Completed);
        let again = ledger.complete_transaction(tx.id).await.unwrap();
        assert_eq!(again, done);

        let balance = ledger.get_balance(&user_id).unwrap();
        assert_eq!(balance.current_balance, 30);
        assert_eq!(balance.total_purchased, 25);
        assert_eq!(balance.total_bonus, 5);
    }

    #[tokio::test]
    async fn usage_debits_atomically() {
        let ledger = ledger();
        let user_id = UserId::generate();
        grant(&ledger, user_id, 3).await;

        let tx = ledger
            .apply_transaction(user_id, TransactionType::Usage, 2, ApplyOptions::default())
            .await
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::Completed);

        let err = ledger
            .apply_transaction(user_id, TransactionType::Usage, 2, ApplyOptions::default())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CreditError::InsufficientBalance {
                available: 1,
                required: 2
            }
        );
        assert_eq!(ledger.get_balance(&user_id).unwrap().current_balance, 1);
    }

    #[tokio::test]
    async fn usage_hold_reserves_until_settled() {
        let ledger = ledger();
        let user_id = UserId::generate();
        grant(&ledger, user_id, 5).await;

        let hold = ledger
            .apply_transaction(
                user_id,
                TransactionType::Usage,
                4,
                ApplyOptions {
                    await_confirmation: Some(true),
                    ..ApplyOptions::default()
                },
            )
            .await
            .unwrap();
        let balance = ledger.get_balance(&user_id).unwrap();
        assert_eq!((balance.current_balance, balance.available()), (5, 1));

        ledger
            .cancel_transaction(hold.id, Some("job withdrawn".into()))
            .await
            .unwrap();
        let balance = ledger.get_balance(&user_id).unwrap();
        assert_eq!((balance.current_balance, balance.available()), (5, 5));
    }

    #[tokio::test]
    async fn terminal_states_are_final() {
        let ledger = ledger();
        let user_id = UserId::generate();
        let tx = ledger
            .apply_transaction(user_id, TransactionType::Purchase, 10, ApplyOptions::default())
            .await
            .unwrap();
        ledger.fail_transaction(tx.id, "card_declined").await.unwrap();
        // Same terminal state again is a no-op.
        let failed = ledger.fail_transaction(tx.id, "card_declined").await.unwrap();
        assert_eq!(failed.failure_reason.as_deref(), Some("card_declined"));

        let err = ledger.complete_transaction(tx.id).await.unwrap_err();
        assert!(matches!(err, CreditError::InvalidTransition { .. }));
        assert_eq!(ledger.get_balance(&user_id).unwrap().current_balance, 0);
    }

    #[tokio::test]
    async fn refund_direction_follows_original() {
        let ledger = ledger();
        let user_id = UserId::generate();
        grant(&ledger, user_id, 10).await;
        let usage = ledger
            .apply_transaction(user_id, TransactionType::Usage, 5, ApplyOptions::default())
            .await
            .unwrap();

        let refund = ledger
            .reverse_transaction(usage.id, None, "job cancelled")
            .await
            .unwrap();
        assert_eq!(refund.direction, Direction::Credit);
        assert_eq!(refund.status, TransactionStatus::Completed);
        assert_eq!(refund.reverses, Some(usage.id));
        assert_eq!(ledger.get_balance(&user_id).unwrap().current_balance, 10);

        let err = ledger
            .reverse_transaction(usage.id, Some(1), "again")
            .await
            .unwrap_err();
        assert!(matches!(err, CreditError::Validation { .. }));
    }

    #[tokio::test]
    async fn purchase_refund_waits_for_gateway() {
        let ledger = ledger();
        let user_id = UserId::generate();
        let purchase = ledger
            .apply_transaction(user_id, TransactionType::Purchase, 30, ApplyOptions::default())
            .await
            .unwrap();
        ledger.complete_transaction(purchase.id).await.unwrap();

        let refund = ledger
            .reverse_transaction(purchase.id, Some(20), "requested")
            .await
            .unwrap();
        assert_eq!(refund.direction, Direction::Debit);
        assert_eq!(refund.status, TransactionStatus::Pending);
        let balance = ledger.get_balance(&user_id).unwrap();
        assert_eq!((balance.current_balance, balance.available()), (30, 10));

        // Only 10 left to refund.
        assert!(ledger
            .reverse_transaction(purchase.id, Some(11), "more")
            .await
            .is_err());

        ledger.complete_transaction(refund.id).await.unwrap();
        let balance = ledger.get_balance(&user_id).unwrap();
        assert_eq!(balance.current_balance, 10);
        assert_eq!(balance.reserved_credits, 0);
        assert_eq!(balance.total_reversed, 20);
        assert!(balance.is_consistent());
    }

    #[tokio::test]
    async fn expiry_is_clamped_to_available() {
        let ledger = ledger();
        let user_id = UserId::generate();
        assert!(ledger.expire_credits(user_id, 5, "expired").await.is_err());

        grant(&ledger, user_id, 3).await;
        let tx = ledger.expire_credits(user_id, 5, "expired").await.unwrap();
        assert_eq!(tx.credits, 3);
        let balance = ledger.get_balance(&user_id).unwrap();
        assert_eq!(balance.current_balance, 0);
        assert_eq!(balance.total_expired, 3);
    }

    #[tokio::test]
    async fn gateway_reference_is_indexed() {
        let ledger = ledger();
        let user_id = UserId::generate();
        let tx = ledger
            .apply_transaction(user_id, TransactionType::Purchase, 10, ApplyOptions::default())
            .await
            .unwrap();
        ledger.attach_gateway_reference(tx.id, "pi_123").await.unwrap();
        ledger.attach_gateway_reference(tx.id, "pi_123").await.unwrap();
        assert!(ledger.attach_gateway_reference(tx.id, "pi_456").await.is_err());

        let found = ledger.store().transactions_by_reference("pi_123").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, tx.id);
    }

    #[tokio::test]
    async fn refund_keeps_gateway_refund_id_in_metadata() {
        let ledger = ledger();
        let user_id = UserId::generate();
        let purchase = ledger
            .apply_transaction(user_id, TransactionType::Purchase, 10, ApplyOptions::default())
            .await
            .unwrap();
        ledger.complete_transaction(purchase.id).await.unwrap();
        let refund = ledger
            .reverse_transaction(purchase.id, Some(4), "requested")
            .await
            .unwrap();

        let tagged = ledger.attach_gateway_reference(refund.id, "re_1").await.unwrap();
        assert_eq!(tagged.metadata.get(GATEWAY_REFUND_METADATA_KEY), Some("re_1"));
        assert_eq!(tagged.reference_id, Some(purchase.id.to_string()));
        ledger.attach_gateway_reference(refund.id, "re_1").await.unwrap();
        assert!(ledger.attach_gateway_reference(refund.id, "re_2").await.is_err());
    }

    #[tokio::test]
    async fn purchase_refund_checks_usage_under_the_lock() {
        let ledger = ledger();
        let user_id = UserId::generate();
        let policy = RefundPolicy::default();
        let purchase = ledger
            .apply_transaction(user_id, TransactionType::Purchase, 30, ApplyOptions::default())
            .await
            .unwrap();
        ledger.complete_transaction(purchase.id).await.unwrap();

        for _ in 0..3 {
            ledger
                .apply_transaction(user_id, TransactionType::Usage, 5, ApplyOptions::default())
                .await
                .unwrap();
        }
        let err = ledger
            .refund_purchase(purchase.id, Some(5), "requested", &policy)
            .await
            .unwrap_err();
        assert!(err.user_message().contains("already used"));

        // Without a policy the same amount is still reversible.
        ledger
            .reverse_transaction(purchase.id, Some(5), "operator override")
            .await
            .unwrap();

        let usage = ledger
            .apply_transaction(user_id, TransactionType::Usage, 5, ApplyOptions::default())
            .await
            .unwrap();
        assert!(ledger
            .refund_purchase(usage.id, None, "not a purchase", &policy)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn refund_needs_direction_and_bonus_needs_purchase() {
        let ledger = ledger();
        let user_id = UserId::generate();
        assert!(ledger
            .apply_transaction(user_id, TransactionType::Refund, 1, ApplyOptions::default())
            .await
            .is_err());
        assert!(ledger
            .apply_transaction(
                user_id,
                TransactionType::Bonus,
                5,
                ApplyOptions {
                    bonus_credits: 1,
                    ..ApplyOptions::default()
                },
            )
            .await
            .is_err());
        assert!(ledger
            .apply_transaction(
                user_id,
                TransactionType::Usage,
                1,
                ApplyOptions {
                    direction: Some(Direction::Credit),
                    ..ApplyOptions::default()
                },
            )
            .await
            .is_err());
    }
}
