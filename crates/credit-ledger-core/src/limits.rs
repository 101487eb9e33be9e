//! Limits and validation engine.
//!
//! Every validator here is a pure function of its inputs: the caller
//! supplies role limits, counters and the clock. Validators return a
//! [`ValidationResult`] instead of an error so several checks can run and
//! report every failure at once through a [`ValidationReport`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CreditError, Result};
use crate::transaction::{Transaction, TransactionStatus, TransactionType};

/// Marketplace role of the account holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// Tradesperson applying for jobs.
    Worker,
    /// Customer posting jobs.
    Client,
    /// Platform staff.
    Admin,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Worker => "WORKER",
            Self::Client => "CLIENT",
            Self::Admin => "ADMIN",
        })
    }
}

/// Per-role purchase limits, in credits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditLimitsConfig {
    /// Credits that may be bought per calendar day.
    pub daily_purchase_limit: u64,
    /// Credits that may be bought per calendar month.
    pub monthly_purchase_limit: u64,
    /// Highest balance the account may hold.
    pub max_balance: u64,
    /// Minimum gap between two purchases.
    pub cooldown_minutes: u32,
    /// Smallest single purchase.
    pub min_transaction: u64,
    /// Largest single purchase.
    pub max_transaction: u64,
}

impl CreditLimitsConfig {
    /// Built-in limits for a role.
    #[must_use]
    pub const fn for_role(role: Role) -> Self {
        match role {
            Role::Worker => Self {
                daily_purchase_limit: 500,
                monthly_purchase_limit: 2_000,
                max_balance: 5_000,
                cooldown_minutes: 1,
                min_transaction: 1,
                max_transaction: 500,
            },
            Role::Client => Self {
                daily_purchase_limit: 200,
                monthly_purchase_limit: 1_000,
                max_balance: 2_000,
                cooldown_minutes: 5,
                min_transaction: 1,
                max_transaction: 200,
            },
            Role::Admin => Self {
                daily_purchase_limit: 100_000,
                monthly_purchase_limit: 1_000_000,
                max_balance: 1_000_000,
                cooldown_minutes: 0,
                min_transaction: 1,
                max_transaction: 100_000,
            },
        }
    }
}

/// Read-only role limit lookup.
pub trait LimitsProvider: Send + Sync {
    /// Limits that apply to `role`.
    fn get_limits_for_role(&self, role: Role) -> CreditLimitsConfig;
}

/// [`LimitsProvider`] backed by [`CreditLimitsConfig::for_role`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultLimits;

impl LimitsProvider for DefaultLimits {
    fn get_limits_for_role(&self, role: Role) -> CreditLimitsConfig {
        CreditLimitsConfig::for_role(role)
    }
}

/// Platform-wide bounds on a single purchase, independent of role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalLimits {
    /// Smallest purchase accepted anywhere.
    pub min_purchase_credits: u64,
    /// Largest purchase accepted anywhere.
    pub max_purchase_credits: u64,
}

impl Default for GlobalLimits {
    fn default() -> Self {
        Self {
            min_purchase_credits: 1,
            max_purchase_credits: 10_000,
        }
    }
}

/// Product actions that cost credits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UsageType {
    /// Apply for a job.
    JobApplication,
    /// Boost a profile in search.
    ProfileBoost,
    /// Unlock a premium job listing.
    PremiumJobUnlock,
    /// Feature a profile on the home page.
    FeaturedProfile,
}

impl UsageType {
    /// Stable snake-case name, also used as the transaction reference type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::JobApplication => "job_application",
            Self::ProfileBoost => "profile_boost",
            Self::PremiumJobUnlock => "premium_job_unlock",
            Self::FeaturedProfile => "featured_profile",
        }
    }
}

impl fmt::Display for UsageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UsageType {
    type Err = CreditError;

    fn from_str(s: &str) -> Result<Self> {
        [
            Self::JobApplication,
            Self::ProfileBoost,
            Self::PremiumJobUnlock,
            Self::FeaturedProfile,
        ]
        .into_iter()
        .find(|u| u.as_str().eq_ignore_ascii_case(s))
        .ok_or_else(|| CreditError::validation(format!("unknown usage type: {s}")))
    }
}

/// Credit cost of each usage type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCosts {
    /// Cost of [`UsageType::JobApplication`].
    pub job_application: u64,
    /// Cost of [`UsageType::ProfileBoost`].
    pub profile_boost: u64,
    /// Cost of [`UsageType::PremiumJobUnlock`].
    pub premium_job_unlock: u64,
    /// Cost of [`UsageType::FeaturedProfile`].
    pub featured_profile: u64,
}

impl Default for UsageCosts {
    fn default() -> Self {
        Self {
            job_application: 1,
            profile_boost: 5,
            premium_job_unlock: 3,
            featured_profile: 10,
        }
    }
}

impl UsageCosts {
    /// Credits charged for `usage_type`.
    #[must_use]
    pub const fn cost(&self, usage_type: UsageType) -> u64 {
        match usage_type {
            UsageType::JobApplication => self.job_application,
            UsageType::ProfileBoost => self.profile_boost,
            UsageType::PremiumJobUnlock => self.premium_job_unlock,
            UsageType::FeaturedProfile => self.featured_profile,
        }
    }
}

/// When a purchase may be refunded.
///
/// Both conditions apply: the purchase must be younger than `window_days`
/// and less than `max_used_percent` of its credits may have been consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundPolicy {
    /// Days after completion during which a purchase is refundable.
    pub window_days: u32,
    /// Consumed share of the purchase, in percent, at which refunds stop.
    pub max_used_percent: u32,
}

impl Default for RefundPolicy {
    fn default() -> Self {
        Self {
            window_days: 14,
            max_used_percent: 50,
        }
    }
}

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Whether the check passed.
    pub valid: bool,
    /// Actionable explanation when it did not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ValidationResult {
    /// Passed.
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    /// Failed with `reason`.
    #[must_use]
    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

/// Aggregate of several checks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    reasons: Vec<String>,
}

impl ValidationReport {
    /// Empty report.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a check's outcome.
    pub fn push(&mut self, result: ValidationResult) {
        if !result.valid {
            self.reasons
                .push(result.reason.unwrap_or_else(|| "validation failed".to_string()));
        }
    }

    /// Record a check's outcome, builder style.
    #[must_use]
    pub fn with(mut self, result: ValidationResult) -> Self {
        self.push(result);
        self
    }

    /// Whether every recorded check passed.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.reasons.is_empty()
    }

    /// Failure reasons in the order they were recorded.
    #[must_use]
    pub fn reasons(&self) -> &[String] {
        &self.reasons
    }

    /// Convert into a `Result`, failing with every collected reason.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::Validation`] when any check failed.
    pub fn into_result(self) -> Result<()> {
        if self.reasons.is_empty() {
            Ok(())
        } else {
            Err(CreditError::Validation {
                reasons: self.reasons,
            })
        }
    }
}

/// Purchase counters the caller reads from the ledger before validating.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurchaseCounters {
    /// Credits bought (completed or pending) since the start of today.
    pub purchased_today: u64,
    /// Credits bought (completed or pending) since the start of the month.
    pub purchased_this_month: u64,
    /// Current balance.
    pub current_balance: u64,
    /// Credits of every purchase still awaiting payment, however old.
    pub pending_purchase_credits: u64,
    /// Most recent purchase, completed or pending.
    pub last_purchase_at: Option<DateTime<Utc>>,
}

impl PurchaseCounters {
    /// Fold recent purchases into counters relative to `now`.
    ///
    /// Failed and cancelled purchases are ignored; pending ones count so a
    /// burst of unpaid purchases cannot exceed the allowance.
    #[must_use]
    pub fn from_transactions<'a>(
        current_balance: u64,
        transactions: impl IntoIterator<Item = &'a Transaction>,
        now: DateTime<Utc>,
    ) -> Self {
        let day_start = start_of_day(now);
        let month_start = start_of_month(now);
        let mut counters = Self {
            current_balance,
            ..Self::default()
        };
        for tx in transactions {
            if tx.transaction_type != TransactionType::Purchase
                || matches!(
                    tx.status,
                    TransactionStatus::Failed | TransactionStatus::Cancelled
                )
            {
                continue;
            }
            if tx.created_at >= month_start {
                counters.purchased_this_month += tx.credits;
            }
            if tx.created_at >= day_start {
                counters.purchased_today += tx.credits;
            }
            if counters.last_purchase_at.map_or(true, |t| tx.created_at > t) {
                counters.last_purchase_at = Some(tx.created_at);
            }
        }
        counters
    }

    /// Record the user's pending purchases, which land on the balance once
    /// paid. Anything that is not a pending purchase is ignored.
    #[must_use]
    pub fn with_pending_purchases<'a>(
        mut self,
        transactions: impl IntoIterator<Item = &'a Transaction>,
    ) -> Self {
        self.pending_purchase_credits = transactions
            .into_iter()
            .filter(|tx| {
                tx.transaction_type == TransactionType::Purchase
                    && tx.status == TransactionStatus::Pending
            })
            .fold(0, |sum: u64, tx| sum.saturating_add(tx.credits));
        self
    }

    /// Balance once every pending purchase is paid.
    #[must_use]
    pub const fn committed_balance(&self) -> u64 {
        self.current_balance
            .saturating_add(self.pending_purchase_credits)
    }
}

/// Midnight UTC of `now`'s day.
#[must_use]
pub fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(chrono::NaiveTime::MIN).and_utc()
}

/// Midnight UTC of the first day of `now`'s month.
#[must_use]
pub fn start_of_month(now: DateTime<Utc>) -> DateTime<Utc> {
    let day = start_of_day(now);
    day - Duration::days(i64::from(chrono::Datelike::day(&now)) - 1)
}

/// Purchase size within both global and role bounds.
#[must_use]
pub fn validate_purchase_amount(
    credits: u64,
    limits: &CreditLimitsConfig,
    global: &GlobalLimits,
) -> ValidationResult {
    let min = limits.min_transaction.max(global.min_purchase_credits);
    let max = limits.max_transaction.min(global.max_purchase_credits);
    if credits < min {
        return ValidationResult::fail(format!(
            "Purchase must be at least {min} credits (requested {credits})"
        ));
    }
    if credits > max {
        return ValidationResult::fail(format!(
            "Purchase cannot exceed {max} credits (requested {credits})"
        ));
    }
    ValidationResult::ok()
}

/// Purchase fits the remaining daily and monthly allowance.
#[must_use]
pub fn validate_purchase_allowance(
    credits: u64,
    counters: &PurchaseCounters,
    limits: &CreditLimitsConfig,
) -> ValidationResult {
    let daily_left = limits
        .daily_purchase_limit
        .saturating_sub(counters.purchased_today);
    if credits > daily_left {
        return ValidationResult::fail(format!(
            "Daily purchase limit reached: {daily_left} of {} credits remaining today",
            limits.daily_purchase_limit
        ));
    }
    let monthly_left = limits
        .monthly_purchase_limit
        .saturating_sub(counters.purchased_this_month);
    if credits > monthly_left {
        return ValidationResult::fail(format!(
            "Monthly purchase limit reached: {monthly_left} of {} credits remaining this month",
            limits.monthly_purchase_limit
        ));
    }
    ValidationResult::ok()
}

/// Balance after the purchase stays at or below the role ceiling.
///
/// `committed_balance` must include purchases that are still pending.
#[must_use]
pub fn validate_balance_ceiling(
    credits: u64,
    committed_balance: u64,
    limits: &CreditLimitsConfig,
) -> ValidationResult {
    let after = committed_balance.saturating_add(credits);
    if after > limits.max_balance {
        return ValidationResult::fail(format!(
            "Balance would reach {after} credits, above the maximum of {}; \
             you can buy at most {} more",
            limits.max_balance,
            limits.max_balance.saturating_sub(committed_balance)
        ));
    }
    ValidationResult::ok()
}

/// Enough time has passed since the previous purchase.
#[must_use]
pub fn validate_purchase_cooldown(
    last_purchase_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    limits: &CreditLimitsConfig,
) -> ValidationResult {
    let Some(last) = last_purchase_at else {
        return ValidationResult::ok();
    };
    let ready_at = last + Duration::minutes(i64::from(limits.cooldown_minutes));
    if now < ready_at {
        let wait = (ready_at - now).num_seconds().max(1);
        let minutes = (wait + 59) / 60;
        return ValidationResult::fail(format!(
            "Please wait {minutes} more minute(s) before purchasing again"
        ));
    }
    ValidationResult::ok()
}

/// Usage amount equals the configured cost exactly.
#[must_use]
pub fn validate_usage_cost(
    usage_type: UsageType,
    credits: u64,
    costs: &UsageCosts,
) -> ValidationResult {
    let expected = costs.cost(usage_type);
    if credits == expected {
        ValidationResult::ok()
    } else {
        ValidationResult::fail(format!(
            "{usage_type} costs exactly {expected} credits (got {credits})"
        ))
    }
}

/// A completed purchase is still refundable.
///
/// `credits_consumed` is how much of the purchase has been spent since it
/// completed; it is capped at the purchase size.
#[must_use]
pub fn validate_refund_eligibility(
    purchase: &Transaction,
    credits_consumed: u64,
    now: DateTime<Utc>,
    policy: &RefundPolicy,
) -> ValidationResult {
    if purchase.transaction_type != TransactionType::Purchase {
        return ValidationResult::fail("Only purchases can be refunded to the payment method");
    }
    if purchase.status != TransactionStatus::Completed {
        return ValidationResult::fail(format!(
            "Purchase is {} and cannot be refunded",
            purchase.status
        ));
    }
    if now - purchase.updated_at > Duration::days(i64::from(policy.window_days)) {
        return ValidationResult::fail(format!(
            "Refund window of {} days has passed",
            policy.window_days
        ));
    }
    let consumed = u128::from(credits_consumed.min(purchase.credits));
    if consumed * 100 >= u128::from(purchase.credits) * u128::from(policy.max_used_percent) {
        return ValidationResult::fail(format!(
            "{consumed} of {} credits already used; refunds are only possible below {}% usage",
            purchase.credits, policy.max_used_percent
        ));
    }
    ValidationResult::ok()
}

/// Run every purchase check and collect all failures.
#[must_use]
pub fn validate_purchase(
    credits: u64,
    counters: &PurchaseCounters,
    limits: &CreditLimitsConfig,
    global: &GlobalLimits,
    now: DateTime<Utc>,
) -> ValidationReport {
    ValidationReport::new()
        .with(validate_purchase_amount(credits, limits, global))
        .with(validate_purchase_allowance(credits, counters, limits))
        .with(validate_balance_ceiling(
            credits,
            counters.committed_balance(),
            limits,
        ))
        .with(validate_purchase_cooldown(
            counters.last_purchase_at,
            now,
            limits,
        ))
}
