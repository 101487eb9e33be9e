//! Auto-topup engine.
//!
//! Evaluates stored policies against the ledger and starts topup purchases.
//! Policy writes are serialized per user with their own lock; the ledger
//! lock is never held while a policy lock is taken.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use credit_ledger_core::{
    AutoTopupConfig, AutoTopupPolicy, CreditError, PackageCatalogue, PackageType,
    PricingConfig, Result, SkipReason, TopupDecision, TopupStatus, Transaction,
    TransactionStatus, TransactionType, UserId,
};
use credit_ledger_store::Store;

use crate::ledger::{ApplyOptions, Ledger};
use crate::locks::KeyedLocks;

/// Metadata flag set on purchases started by auto-topup.
pub const AUTO_TOPUP_METADATA_KEY: &str = "auto_topup";

/// Result of [`AutoTopupEngine::trigger`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopupRun {
    /// What the policy decided.
    pub decision: TopupDecision,
    /// Pending purchase created when the decision was to trigger.
    pub transaction: Option<Transaction>,
}

/// Requested policy settings for [`AutoTopupEngine::configure`].
#[derive(Debug, Clone)]
pub struct TopupSettings {
    /// Trigger when the available balance is at or below this.
    pub trigger_balance: u64,
    /// Credits to buy when no package is set.
    pub topup_amount: u64,
    /// Package to buy instead of `topup_amount`.
    pub package_type: Option<PackageType>,
    /// Saved gateway payment method.
    pub payment_method_id: String,
}

/// Auto-topup evaluation and policy management.
pub struct AutoTopupEngine {
    ledger: Arc<Ledger>,
    catalogue: Arc<dyn PackageCatalogue>,
    pricing: PricingConfig,
    config: AutoTopupConfig,
    locks: KeyedLocks<UserId>,
}

impl AutoTopupEngine {
    /// Create an engine.
    #[must_use]
    pub fn new(
        ledger: Arc<Ledger>,
        catalogue: Arc<dyn PackageCatalogue>,
        pricing: PricingConfig,
        config: AutoTopupConfig,
    ) -> Self {
        Self {
            ledger,
            catalogue,
            pricing,
            config,
            locks: KeyedLocks::new(),
        }
    }

    /// The user's policy, if any.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    pub fn get_policy(&self, user_id: &UserId) -> Result<Option<AutoTopupPolicy>> {
        Ok(self.ledger.store().get_topup_policy(user_id)?)
    }

    /// Decide whether the user's balance should trigger a topup now. No side
    /// effects.
    ///
    /// # Errors
    ///
    /// Returns a storage error if a read fails.
    pub fn evaluate(&self, user_id: &UserId) -> Result<TopupDecision> {
        let Some(policy) = self.get_policy(user_id)? else {
            return Ok(TopupDecision::Skip(SkipReason::NoPolicy));
        };
        let balance = self.ledger.get_balance(user_id)?;
        Ok(policy.evaluate(balance.available(), Utc::now(), &self.config))
    }

    /// Evaluate and, if due, create the pending topup purchase and move the
    /// policy to `Processing`.
    ///
    /// A policy already `Processing` never triggers again until its
    /// purchase settles.
    ///
    /// # Errors
    ///
    /// Returns pricing, ledger or storage errors from starting the purchase.
    pub async fn trigger(&self, user_id: UserId) -> Result<TopupRun> {
        let _guard = self.locks.lock(user_id).await;

        let Some(mut policy) = self.get_policy(&user_id)? else {
            return Ok(TopupRun {
                decision: TopupDecision::Skip(SkipReason::NoPolicy),
                transaction: None,
            });
        };
        let now = Utc::now();
        let balance = self.ledger.get_balance(&user_id)?;
        let decision = policy.evaluate(balance.available(), now, &self.config);

        let TopupDecision::Trigger {
            package_type,
            credits,
            payment_method_id,
        } = &decision
        else {
            debug!(user_id = %user_id, decision = ?decision, "Auto-topup skipped");
            return Ok(TopupRun {
                decision,
                transaction: None,
            });
        };

        let quote = match package_type {
            Some(package_type) => {
                self.pricing
                    .calculate_purchase(self.catalogue.as_ref(), *package_type, None)?
            }
            None => self.pricing.calculate_bulk(*credits, None)?,
        };
        let mut options = ApplyOptions::for_quote(&quote, &self.pricing.currency, now);
        options.metadata.insert_system(AUTO_TOPUP_METADATA_KEY, "true");
        options
            .metadata
            .insert_system("payment_method_id", payment_method_id.as_str());

        let tx = self
            .ledger
            .apply_transaction(
                user_id,
                TransactionType::Purchase,
                quote.total_credits,
                options,
            )
            .await?;

        policy.begin(tx.id, now)?;
        self.ledger.store().put_topup_policy(&policy)?;

        info!(
            user_id = %user_id,
            transaction_id = %tx.id,
            credits = tx.credits,
            amount = %quote.final_amount,
            "Auto-topup triggered"
        );
        Ok(TopupRun {
            decision,
            transaction: Some(tx),
        })
    }

    /// Record the settlement of an auto-topup purchase on its policy.
    ///
    /// Transactions that are not auto-topup purchases, or that no longer
    /// match the policy's in-flight purchase, are ignored.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the policy cannot be written.
    pub async fn record_settlement(&self, tx: &Transaction) -> Result<()> {
        if tx.transaction_type != TransactionType::Purchase
            || !tx.metadata.flag(AUTO_TOPUP_METADATA_KEY)
            || !tx.status.is_terminal()
        {
            return Ok(());
        }

        let _guard = self.locks.lock(tx.user_id).await;
        let Some(mut policy) = self.get_policy(&tx.user_id)? else {
            return Ok(());
        };
        if policy.pending_transaction_id != Some(tx.id) {
            debug!(
                user_id = %tx.user_id,
                transaction_id = %tx.id,
                "Auto-topup settlement does not match the in-flight purchase"
            );
            return Ok(());
        }

        let now = Utc::now();
        if tx.status == TransactionStatus::Completed {
            policy.record_success(now);
            info!(user_id = %tx.user_id, transaction_id = %tx.id, "Auto-topup succeeded");
        } else {
            let reason = tx
                .failure_reason
                .clone()
                .unwrap_or_else(|| format!("topup purchase {}", tx.status));
            policy.record_failure(reason.as_str(), now, &self.config);
            warn!(
                user_id = %tx.user_id,
                transaction_id = %tx.id,
                failure_count = policy.failure_count,
                status = %policy.status,
                reason = %reason,
                "Auto-topup failed"
            );
        }
        self.ledger.store().put_topup_policy(&policy)?;
        Ok(())
    }

    /// Create or update the user's policy.
    ///
    /// Updating keeps the runtime state (status, failures, in-flight
    /// purchase) of an existing policy.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::Validation`] for unusable settings.
    pub async fn configure(
        &self,
        user_id: UserId,
        settings: TopupSettings,
    ) -> Result<AutoTopupPolicy> {
        let _guard = self.locks.lock(user_id).await;
        let now = Utc::now();
        let mut policy = AutoTopupPolicy::new(
            user_id,
            settings.trigger_balance,
            settings.topup_amount,
            settings.package_type,
            settings.payment_method_id,
            now,
        )?;
        if let Some(existing) = self.get_policy(&user_id)? {
            policy.status = existing.status;
            policy.failure_count = existing.failure_count;
            policy.last_triggered_at = existing.last_triggered_at;
            policy.last_failure_reason = existing.last_failure_reason;
            policy.pending_transaction_id = existing.pending_transaction_id;
            policy.created_at = existing.created_at;
        }
        self.ledger.store().put_topup_policy(&policy)?;
        info!(
            user_id = %user_id,
            trigger_balance = policy.trigger_balance,
            status = %policy.status,
            "Auto-topup configured"
        );
        Ok(policy)
    }

    /// Turn the policy off.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::NotFound`] without a policy.
    pub async fn disable(&self, user_id: UserId) -> Result<AutoTopupPolicy> {
        self.update(user_id, |policy, now| {
            policy.transition(TopupStatus::Disabled, now)
        })
        .await
    }

    /// Re-enable a disabled or suspended policy and clear its failures.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::NotFound`] without a policy and
    /// [`CreditError::InvalidTransition`] while a topup is processing.
    pub async fn reenable(&self, user_id: UserId) -> Result<AutoTopupPolicy> {
        self.update(user_id, AutoTopupPolicy::reenable).await
    }

    async fn update<F>(&self, user_id: UserId, change: F) -> Result<AutoTopupPolicy>
    where
        F: FnOnce(&mut AutoTopupPolicy, chrono::DateTime<Utc>) -> Result<()>,
    {
        let _guard = self.locks.lock(user_id).await;
        let mut policy = self
            .get_policy(&user_id)?
            .ok_or_else(|| CreditError::NotFound {
                entity: "auto_topup_policy",
                id: user_id.to_string(),
            })?;
        change(&mut policy, Utc::now())?;
        self.ledger.store().put_topup_policy(&policy)?;
        info!(user_id = %user_id, status = %policy.status, "Auto-topup policy updated");
        Ok(policy)
    }
}
