//! Auto-topup policy and trigger rules.
//!
//! A policy moves through a small state machine:
//!
//! ```text
//!   Disabled ──► Enabled ◄──► Processing
//!       ▲        │  ▲  │          │
//!       └────────┘  │  ▼          ▼
//!                  Suspended ◄────┘
//! ```
//!
//! `Processing` marks a topup purchase in flight and absorbs repeated
//! triggers for the same low balance. Consecutive failures back off
//! exponentially and eventually suspend the policy until it is re-enabled.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CreditError, Result};
use crate::pricing::PackageType;
use crate::{TransactionId, UserId};

/// Auto-topup policy status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TopupStatus {
    /// Armed; may trigger.
    Enabled,
    /// Turned off by the user.
    Disabled,
    /// Turned off after repeated failures; needs an explicit re-enable.
    Suspended,
    /// A topup purchase is in flight.
    Processing,
}

impl TopupStatus {
    /// Whether `self -> to` is a legal move.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        use TopupStatus::{Disabled, Enabled, Processing, Suspended};
        matches!(
            (self, to),
            (Enabled, Disabled | Suspended | Processing)
                | (Disabled | Suspended, Enabled)
                | (Suspended, Disabled)
                | (Processing, Enabled | Suspended | Disabled | Processing)
        )
    }
}

impl fmt::Display for TopupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Enabled => "ENABLED",
            Self::Disabled => "DISABLED",
            Self::Suspended => "SUSPENDED",
            Self::Processing => "PROCESSING",
        })
    }
}

/// Trigger and backoff parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoTopupConfig {
    /// Minimum gap between two triggers.
    pub cooldown_hours: u32,
    /// Consecutive failures that suspend the policy.
    pub max_failures: u32,
    /// Base of the failure backoff, in minutes: `base^failure_count`.
    pub backoff_base: u32,
    /// Upper bound on the failure backoff.
    pub backoff_cap_minutes: u32,
}

impl Default for AutoTopupConfig {
    fn default() -> Self {
        Self {
            cooldown_hours: 1,
            max_failures: 3,
            backoff_base: 2,
            backoff_cap_minutes: 24 * 60,
        }
    }
}

impl AutoTopupConfig {
    /// Delay imposed by `failure_count` consecutive failures.
    #[must_use]
    pub fn failure_backoff(&self, failure_count: u32) -> Duration {
        if failure_count == 0 {
            return Duration::zero();
        }
        let minutes = self
            .backoff_base
            .checked_pow(failure_count)
            .map_or(self.backoff_cap_minutes, |m| m.min(self.backoff_cap_minutes));
        Duration::minutes(i64::from(minutes))
    }

    /// Time that must pass after a trigger before the next one.
    #[must_use]
    pub fn required_wait(&self, failure_count: u32) -> Duration {
        Duration::hours(i64::from(self.cooldown_hours)).max(self.failure_backoff(failure_count))
    }
}

/// A user's standing auto-topup instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoTopupPolicy {
    /// Owner.
    pub user_id: UserId,
    /// Current status.
    pub status: TopupStatus,
    /// Trigger when the available balance is at or below this.
    pub trigger_balance: u64,
    /// Credits to buy when no package is set.
    pub topup_amount: u64,
    /// Package to buy; overrides `topup_amount`.
    pub package_type: Option<PackageType>,
    /// Saved gateway payment method.
    pub payment_method_id: String,
    /// Consecutive failed topups.
    pub failure_count: u32,
    /// Last trigger.
    pub last_triggered_at: Option<DateTime<Utc>>,
    /// Most recent failure reason.
    pub last_failure_reason: Option<String>,
    /// Purchase created by the in-flight trigger.
    pub pending_transaction_id: Option<TransactionId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

/// Why [`AutoTopupPolicy::evaluate`] declined to trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// The user has no policy.
    NoPolicy,
    /// The policy is not `Enabled`.
    NotEnabled {
        /// Actual status.
        status: TopupStatus,
    },
    /// The balance is above the trigger.
    AboveThreshold {
        /// Available balance.
        balance: u64,
        /// Configured trigger.
        trigger_balance: u64,
    },
    /// Cooldown or failure backoff still running.
    CoolingDown {
        /// Earliest next trigger.
        retry_at: DateTime<Utc>,
    },
}

/// Result of evaluating a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum TopupDecision {
    /// Start a topup purchase.
    Trigger {
        /// Package to buy, if any.
        package_type: Option<PackageType>,
        /// Credits to buy when no package is set.
        credits: u64,
        /// Payment method to charge.
        payment_method_id: String,
    },
    /// Do nothing.
    Skip(SkipReason),
}

impl TopupDecision {
    /// Whether this decision starts a purchase.
    #[must_use]
    pub const fn is_trigger(&self) -> bool {
        matches!(self, Self::Trigger { .. })
    }
}

impl AutoTopupPolicy {
    /// A new, enabled policy.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the amount is zero, the payment
    /// method is blank, or no package is set and `topup_amount` is zero.
    pub fn new(
        user_id: UserId,
        trigger_balance: u64,
        topup_amount: u64,
        package_type: Option<PackageType>,
        payment_method_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let payment_method_id = payment_method_id.into();
        let mut reasons = Vec::new();
        if package_type.is_none() && topup_amount == 0 {
            reasons.push("auto-topup amount must be positive".to_string());
        }
        if payment_method_id.trim().is_empty() {
            reasons.push("auto-topup needs a saved payment method".to_string());
        }
        if !reasons.is_empty() {
            return Err(CreditError::Validation { reasons });
        }
        Ok(Self {
            user_id,
            status: TopupStatus::Enabled,
            trigger_balance,
            topup_amount,
            package_type,
            payment_method_id,
            failure_count: 0,
            last_triggered_at: None,
            last_failure_reason: None,
            pending_transaction_id: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Decide whether `balance` should trigger a topup at `now`.
    #[must_use]
    pub fn evaluate(
        &self,
        balance: u64,
        now: DateTime<Utc>,
        config: &AutoTopupConfig,
    ) -> TopupDecision {
        if self.status != TopupStatus::Enabled {
            return TopupDecision::Skip(SkipReason::NotEnabled {
                status: self.status,
            });
        }
        if balance > self.trigger_balance {
            return TopupDecision::Skip(SkipReason::AboveThreshold {
                balance,
                trigger_balance: self.trigger_balance,
            });
        }
        if let Some(last) = self.last_triggered_at {
            let retry_at = last + config.required_wait(self.failure_count);
            if now <= retry_at {
                return TopupDecision::Skip(SkipReason::CoolingDown { retry_at });
            }
        }
        TopupDecision::Trigger {
            package_type: self.package_type,
            credits: self.topup_amount,
            payment_method_id: self.payment_method_id.clone(),
        }
    }

    /// Move to `to`. `Processing -> Processing` is accepted and changes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::InvalidTransition`] for an illegal move.
    pub fn transition(&mut self, to: TopupStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(CreditError::InvalidTransition {
                entity: "auto_topup_policy",
                id: self.user_id.to_string(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        if self.status != to {
            self.status = to;
            self.updated_at = now;
        }
        Ok(())
    }

    /// Mark a topup purchase as started.
    ///
    /// # Errors
    ///
    /// Fails when the policy cannot enter `Processing`.
    pub fn begin(&mut self, transaction_id: TransactionId, now: DateTime<Utc>) -> Result<()> {
        self.transition(TopupStatus::Processing, now)?;
        self.last_triggered_at = Some(now);
        self.pending_transaction_id = Some(transaction_id);
        Ok(())
    }

    /// The in-flight topup was paid.
    ///
    /// A policy that was disabled meanwhile stays disabled.
    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.failure_count = 0;
        self.last_failure_reason = None;
        self.pending_transaction_id = None;
        if self.status == TopupStatus::Processing {
            self.status = TopupStatus::Enabled;
        }
        self.updated_at = now;
    }

    /// The in-flight topup failed. Suspends once `max_failures` is reached.
    pub fn record_failure(
        &mut self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
        config: &AutoTopupConfig,
    ) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_reason = Some(reason.into());
        self.pending_transaction_id = None;
        if self.failure_count >= config.max_failures {
            if matches!(self.status, TopupStatus::Processing | TopupStatus::Enabled) {
                self.status = TopupStatus::Suspended;
            }
        } else if self.status == TopupStatus::Processing {
            self.status = TopupStatus::Enabled;
        }
        self.updated_at = now;
    }

    /// Explicit re-enable from `Disabled` or `Suspended`; clears failures.
    ///
    /// # Errors
    ///
    /// Fails when the policy is `Processing`.
    pub fn reenable(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != TopupStatus::Enabled {
            self.transition(TopupStatus::Enabled, now)?;
        }
        self.failure_count = 0;
        self.last_failure_reason = None;
        self.updated_at = now;
        Ok(())
    }
}
