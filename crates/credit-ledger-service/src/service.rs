//! The credit service: one explicitly constructed engine per process.
//!
//! Wires the ledger, pricing, limits, auto-topup and webhook processing
//! together and exposes the operations collaborators call.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{info, warn};

use credit_ledger_core::limits::{start_of_month, validate_purchase, validate_usage_cost};
use credit_ledger_core::{
    AccountBalance, AutoTopupPolicy, CreditError, DefaultLimits, LimitsProvider, Metadata,
    PackageCatalogue, PackageType, ProcessingResult, PurchaseCounters, PurchaseQuote, Result,
    Role, StaticCatalogue, TopupDecision, Transaction, TransactionId, TransactionType,
    UsageType, UserId, ValidationReport, ValidationResult,
};
use credit_ledger_store::Store;

use crate::config::ServiceConfig;
use crate::ledger::{ApplyOptions, Ledger};
use crate::locks::KeyedLocks;
use crate::sweep::Sweeper;
use crate::topup::{AutoTopupEngine, TopupRun, TopupSettings};
use crate::webhooks::WebhookProcessor;

/// A request to spend credits on a product action.
#[derive(Debug, Clone)]
pub struct UsageRequest {
    /// What is being paid for.
    pub usage_type: UsageType,
    /// Amount the caller expects to pay; must equal the configured cost.
    pub credits: Option<u64>,
    /// Product entity the usage is for (job, profile, ...).
    pub reference_id: String,
    /// Kind of `reference_id`.
    pub reference_type: String,
    /// Caller metadata, sanitized before it is stored.
    pub metadata: Vec<(String, String)>,
    /// Hold the credits instead of spending them now; the caller completes
    /// or cancels the hold later.
    pub hold: bool,
}

impl UsageRequest {
    /// Spend the configured cost of `usage_type` on `reference_id`.
    #[must_use]
    pub fn new(
        usage_type: UsageType,
        reference_id: impl Into<String>,
        reference_type: impl Into<String>,
    ) -> Self {
        Self {
            usage_type,
            credits: None,
            reference_id: reference_id.into(),
            reference_type: reference_type.into(),
            metadata: Vec::new(),
            hold: false,
        }
    }
}

/// The credit engine.
pub struct CreditService {
    config: ServiceConfig,
    ledger: Arc<Ledger>,
    topups: Arc<AutoTopupEngine>,
    webhooks: Arc<WebhookProcessor>,
    sweeper: Arc<Sweeper>,
    catalogue: Arc<dyn PackageCatalogue>,
    limits: Arc<dyn LimitsProvider>,
    purchase_locks: KeyedLocks<UserId>,
}

impl CreditService {
    /// Create a service with the built-in price table and role limits.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: ServiceConfig) -> Self {
        Self::with_collaborators(
            store,
            config,
            Arc::new(StaticCatalogue::default()),
            Arc::new(DefaultLimits),
        )
    }

    /// Create a service with an external price table and role limits.
    #[must_use]
    pub fn with_collaborators(
        store: Arc<dyn Store>,
        config: ServiceConfig,
        catalogue: Arc<dyn PackageCatalogue>,
        limits: Arc<dyn LimitsProvider>,
    ) -> Self {
        let ledger = Arc::new(Ledger::new(Arc::clone(&store), config.max_commit_attempts));
        let topups = Arc::new(AutoTopupEngine::new(
            Arc::clone(&ledger),
            Arc::clone(&catalogue),
            config.pricing.clone(),
            config.auto_topup.clone(),
        ));
        let webhooks = Arc::new(WebhookProcessor::new(
            Arc::clone(&ledger),
            Arc::clone(&topups),
            config.webhook.clone(),
        ));
        let sweeper = Arc::new(Sweeper::new(
            store,
            Arc::clone(&webhooks),
            config.stuck_pending_minutes,
            config.sweep_batch_size,
        ));

        Self {
            config,
            ledger,
            topups,
            webhooks,
            sweeper,
            catalogue,
            limits,
            purchase_locks: KeyedLocks::new(),
        }
    }

    /// Configuration the service was built with.
    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// The ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// The webhook processor.
    #[must_use]
    pub fn webhooks(&self) -> &Arc<WebhookProcessor> {
        &self.webhooks
    }

    /// The maintenance sweeper.
    #[must_use]
    pub fn sweeper(&self) -> &Arc<Sweeper> {
        &self.sweeper
    }

    /// Price a package.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::Validation`] for an unknown package or promo code.
    pub fn quote(&self, package_type: PackageType, promo_code: Option<&str>) -> Result<PurchaseQuote> {
        Ok(self
            .config
            .pricing
            .calculate_purchase(self.catalogue.as_ref(), package_type, promo_code)?)
    }

    /// Start a package purchase: validate limits, price it and record a
    /// pending purchase awaiting the gateway.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::Validation`] with every failed limit, or for an
    /// unknown package or promo code.
    pub async fn create_purchase(
        &self,
        user_id: UserId,
        role: Role,
        package_type: PackageType,
        promo_code: Option<&str>,
    ) -> Result<Transaction> {
        let quote = self.quote(package_type, promo_code)?;
        self.start_purchase(user_id, role, &quote).await
    }

    /// Start an ad-hoc purchase of `credits` at the bulk price.
    ///
    /// # Errors
    ///
    /// Same as [`CreditService::create_purchase`].
    pub async fn create_bulk_purchase(
        &self,
        user_id: UserId,
        role: Role,
        credits: u64,
        promo_code: Option<&str>,
    ) -> Result<Transaction> {
        let quote = self.config.pricing.calculate_bulk(credits, promo_code)?;
        self.start_purchase(user_id, role, &quote).await
    }

    async fn start_purchase(
        &self,
        user_id: UserId,
        role: Role,
        quote: &PurchaseQuote,
    ) -> Result<Transaction> {
        // Limits count pending purchases; checking and creating under one
        // lock keeps two concurrent purchases from both fitting.
        let _guard = self.purchase_locks.lock(user_id).await;
        let now = Utc::now();
        let limits = self.limits.get_limits_for_role(role);

        let since = start_of_month(now)
            .min(now - Duration::minutes(i64::from(limits.cooldown_minutes)));
        let balance = self.ledger.get_balance(&user_id)?;
        let recent = self.ledger.store().transactions_since(&user_id, since)?;
        let pending = self.ledger.store().list_pending_by_user(&user_id)?;
        let counters = PurchaseCounters::from_transactions(balance.current_balance, &recent, now)
            .with_pending_purchases(&pending);

        let report = validate_purchase(
            quote.total_credits,
            &counters,
            &limits,
            &self.config.global_limits,
            now,
        );
        if !report.is_valid() {
            warn!(
                user_id = %user_id,
                role = %role,
                credits = quote.total_credits,
                reasons = ?report.reasons(),
                "Purchase rejected by limits"
            );
        }
        report.into_result()?;

        let mut options = ApplyOptions::for_quote(quote, &self.config.pricing.currency, now);
        options.metadata.insert_system("role", role.to_string());
        let tx = self
            .ledger
            .apply_transaction(user_id, TransactionType::Purchase, quote.total_credits, options)
            .await?;
        info!(
            user_id = %user_id,
            transaction_id = %tx.id,
            amount = %quote.final_amount,
            "Purchase started"
        );
        Ok(tx)
    }

    /// Spend the configured cost of `usage_type`.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::InsufficientBalance`] when the balance does not
    /// cover the cost, or [`CreditError::Validation`] for a blank reference.
    pub async fn use_credits(
        &self,
        user_id: UserId,
        usage_type: UsageType,
        reference_id: impl Into<String>,
        reference_type: impl Into<String>,
    ) -> Result<Transaction> {
        self.use_credits_with(
            user_id,
            UsageRequest::new(usage_type, reference_id, reference_type),
        )
        .await
    }

    /// Spend credits as described by `request`, then give auto-topup a
    /// chance to refill the balance.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::Validation`] for a wrong amount, a blank
    /// reference or bad metadata, and [`CreditError::InsufficientBalance`]
    /// when the balance does not cover the cost.
    pub async fn use_credits_with(
        &self,
        user_id: UserId,
        request: UsageRequest,
    ) -> Result<Transaction> {
        let cost = self.config.usage_costs.cost(request.usage_type);
        let mut report = ValidationReport::new();
        if let Some(credits) = request.credits {
            report.push(validate_usage_cost(
                request.usage_type,
                credits,
                &self.config.usage_costs,
            ));
        }
        if request.reference_id.trim().is_empty() {
            report.push(ValidationResult::fail(
                "Usage needs a reference to the item it pays for",
            ));
        }
        report.into_result()?;

        let mut metadata = Metadata::sanitize(request.metadata)?;
        metadata.insert_system("usage_type", request.usage_type.as_str());

        let options = ApplyOptions {
            description: Some(format!("{} ({cost} credits)", request.usage_type)),
            reference_id: Some(request.reference_id),
            reference_type: Some(request.reference_type),
            metadata,
            await_confirmation: Some(request.hold),
            ..ApplyOptions::default()
        };
        let result = self
            .ledger
            .apply_transaction(user_id, TransactionType::Usage, cost, options)
            .await;

        if matches!(result, Ok(_) | Err(CreditError::InsufficientBalance { .. })) {
            self.auto_topup_after_usage(user_id).await;
        }
        result
    }

    /// Refund (part of) a completed transaction.
    ///
    /// Purchases must still be eligible: inside the refund window and with
    /// less than the allowed share of their credits used since.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::Validation`] for a blank reason, an ineligible
    /// purchase or an amount above what is left to refund.
    pub async fn refund(
        &self,
        transaction_id: TransactionId,
        credits: Option<u64>,
        reason: &str,
    ) -> Result<Transaction> {
        if reason.trim().is_empty() {
            return Err(CreditError::validation("A refund needs a reason"));
        }
        let original = self.ledger.get_transaction(&transaction_id)?;
        if original.transaction_type == TransactionType::Purchase {
            self.ledger
                .refund_purchase(transaction_id, credits, reason, &self.config.refund_policy)
                .await
        } else {
            self.ledger
                .reverse_transaction(transaction_id, credits, reason)
                .await
        }
    }

    /// Record the gateway id of a pending purchase or refund.
    ///
    /// # Errors
    ///
    /// See [`Ledger::attach_gateway_reference`].
    pub async fn attach_gateway_reference(
        &self,
        transaction_id: TransactionId,
        gateway_reference: &str,
    ) -> Result<Transaction> {
        self.ledger
            .attach_gateway_reference(transaction_id, gateway_reference)
            .await
    }

    /// Expire up to `credits` of the user's balance.
    ///
    /// # Errors
    ///
    /// See [`Ledger::expire_credits`].
    pub async fn expire_credits(&self, user_id: UserId, credits: u64) -> Result<Transaction> {
        self.ledger
            .expire_credits(user_id, credits, format!("Expired {credits} credits"))
            .await
    }

    /// Current balance; zero for unknown users.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    pub fn get_balance(&self, user_id: &UserId) -> Result<AccountBalance> {
        self.ledger.get_balance(user_id)
    }

    /// Transaction history, newest first.
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
        self.ledger.list_transactions(user_id, limit, offset)
    }

    /// Reconcile one gateway webhook delivery.
    ///
    /// # Errors
    ///
    /// See [`WebhookProcessor::process`].
    pub async fn handle_webhook(&self, payload: &str, signature: &str) -> Result<ProcessingResult> {
        self.webhooks.process(payload, signature).await
    }

    /// Whether the user's balance should trigger a topup now.
    ///
    /// # Errors
    ///
    /// Returns a storage error if a read fails.
    pub fn evaluate_auto_topup(&self, user_id: &UserId) -> Result<TopupDecision> {
        self.topups.evaluate(user_id)
    }

    /// Evaluate and, if due, start a topup purchase.
    ///
    /// # Errors
    ///
    /// See [`AutoTopupEngine::trigger`].
    pub async fn trigger_auto_topup(&self, user_id: UserId) -> Result<TopupRun> {
        self.topups.trigger(user_id).await
    }

    /// The user's auto-topup policy.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    pub fn get_auto_topup(&self, user_id: &UserId) -> Result<Option<AutoTopupPolicy>> {
        self.topups.get_policy(user_id)
    }

    /// Create or update the user's auto-topup policy.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::Validation`] for unusable settings.
    pub async fn configure_auto_topup(
        &self,
        user_id: UserId,
        settings: TopupSettings,
    ) -> Result<AutoTopupPolicy> {
        if let Some(package_type) = settings.package_type {
            self.quote(package_type, None)?;
        }
        self.topups.configure(user_id, settings).await
    }

    /// Turn auto-topup off.
    ///
    /// # Errors
    ///
    /// See [`AutoTopupEngine::disable`].
    pub async fn disable_auto_topup(&self, user_id: UserId) -> Result<AutoTopupPolicy> {
        self.topups.disable(user_id).await
    }

    /// Re-enable a disabled or suspended policy.
    ///
    /// # Errors
    ///
    /// See [`AutoTopupEngine::reenable`].
    pub async fn reenable_auto_topup(&self, user_id: UserId) -> Result<AutoTopupPolicy> {
        self.topups.reenable(user_id).await
    }

    async fn auto_topup_after_usage(&self, user_id: UserId) {
        match self.topups.trigger(user_id).await {
            Ok(TopupRun {
                transaction: Some(tx),
                ..
            }) => info!(user_id = %user_id, transaction_id = %tx.id, "Low balance auto-topup started"),
            Ok(_) => {}
            Err(e) => warn!(user_id = %user_id, error = %e, "Auto-topup after usage failed"),
        }
    }
}
