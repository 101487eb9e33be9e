//! Error taxonomy for the credit ledger.
//!
//! Every failure carries a machine-readable [`ErrorKind`] plus a human
//! message. Security and consistency failures hide their detail from end
//! users; [`CreditError::user_message`] is what callers should surface.

use serde::Serialize;

use crate::ids::IdError;
use crate::transaction::TransactionStatus;

/// Result type for credit ledger operations.
pub type Result<T> = std::result::Result<T, CreditError>;

/// Errors raised by ledger, auto-topup and webhook operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CreditError {
    /// A limit, role or amount check failed. The caller can fix the input.
    #[error("validation failed: {}", reasons.join("; "))]
    Validation {
        /// Every failed check, in evaluation order.
        reasons: Vec<String>,
    },

    /// A debit exceeds the available balance.
    #[error("insufficient balance: available={available}, required={required}")]
    InsufficientBalance {
        /// Spendable credits at the time of the check.
        available: u64,
        /// Credits the operation needed.
        required: u64,
    },

    /// An illegal state-machine move was attempted.
    #[error("invalid transition for {entity} {id}: {from} -> {to}")]
    InvalidTransition {
        /// What kind of record was being moved (`transaction`, `auto_topup_policy`).
        entity: &'static str,
        /// Record identifier.
        id: String,
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },

    /// The webhook signature did not verify.
    #[error("invalid webhook signature: {0}")]
    InvalidSignature(String),

    /// The webhook payload could not be parsed into a gateway event.
    #[error("invalid event format: {0}")]
    InvalidEventFormat(String),

    /// Transient failure while dispatching a webhook event.
    #[error("webhook handler failure: {0}")]
    HandlerFailure(String),

    /// The gateway and the ledger disagree and an operator must reconcile.
    #[error("gateway inconsistency: {0}")]
    GatewayInconsistency(String),

    /// A referenced record does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record.
        entity: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// The durable store failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),
}

/// Machine-readable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`CreditError::Validation`].
    ValidationError,
    /// See [`CreditError::InsufficientBalance`].
    InsufficientBalance,
    /// See [`CreditError::InvalidTransition`].
    InvalidTransition,
    /// See [`CreditError::InvalidSignature`].
    InvalidSignature,
    /// See [`CreditError::InvalidEventFormat`].
    InvalidEventFormat,
    /// See [`CreditError::HandlerFailure`].
    HandlerFailure,
    /// See [`CreditError::GatewayInconsistency`].
    GatewayInconsistency,
    /// See [`CreditError::NotFound`].
    NotFound,
    /// Storage, configuration and other internal failures.
    Internal,
}

impl ErrorKind {
    /// Stable wire code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationError => "validation_error",
            Self::InsufficientBalance => "insufficient_balance",
            Self::InvalidTransition => "invalid_transition",
            Self::InvalidSignature => "invalid_signature",
            Self::InvalidEventFormat => "invalid_event_format",
            Self::HandlerFailure => "handler_failure",
            Self::GatewayInconsistency => "gateway_inconsistency",
            Self::NotFound => "not_found",
            Self::Internal => "internal",
        }
    }
}

impl CreditError {
    /// Build a validation error from a single reason.
    #[must_use]
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reasons: vec![reason.into()],
        }
    }

    /// Build a transaction-not-found error.
    #[must_use]
    pub fn transaction_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            entity: "transaction",
            id: id.to_string(),
        }
    }

    /// Build an invalid transaction transition error.
    #[must_use]
    pub fn invalid_transaction_transition(
        id: impl ToString,
        from: TransactionStatus,
        to: TransactionStatus,
    ) -> Self {
        Self::InvalidTransition {
            entity: "transaction",
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Category of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::ValidationError,
            Self::InsufficientBalance { .. } => ErrorKind::InsufficientBalance,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::InvalidSignature(_) => ErrorKind::InvalidSignature,
            Self::InvalidEventFormat(_) => ErrorKind::InvalidEventFormat,
            Self::HandlerFailure(_) => ErrorKind::HandlerFailure,
            Self::GatewayInconsistency(_) => ErrorKind::GatewayInconsistency,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Storage(_) | Self::Configuration(_) | Self::InvalidId(_) => ErrorKind::Internal,
        }
    }

    /// Whether a webhook dispatch that failed with this error may be retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::HandlerFailure(_) | Self::Storage(_))
    }

    /// Text safe to show an end user.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation { reasons } => reasons.join("; "),
            Self::InsufficientBalance {
                available,
                required,
            } => format!(
                "You need {required} credits but only have {available}. \
                 Top up at least {} credits to continue.",
                required.saturating_sub(*available)
            ),
            Self::NotFound { entity, .. } => format!("{entity} not found"),
            Self::InvalidSignature(_) | Self::InvalidEventFormat(_) => {
                "The request could not be verified".to_string()
            }
            Self::InvalidTransition { .. }
            | Self::HandlerFailure(_)
            | Self::GatewayInconsistency(_)
            | Self::Storage(_)
            | Self::Configuration(_)
            | Self::InvalidId(_) => "An internal error occurred".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_balance_suggests_top_up() {
        let err = CreditError::InsufficientBalance {
            available: 2,
            required: 5,
        };
        assert_eq!(err.kind(), ErrorKind::InsufficientBalance);
        assert!(err.user_message().contains("Top up at least 3 credits"));
    }

    #[test]
    fn security_errors_hide_detail() {
        let err = CreditError::InvalidSignature("v1 mismatch for secret whsec_abc".into());
        assert_eq!(err.kind().as_str(), "invalid_signature");
        assert!(!err.user_message().contains("whsec"));
    }

    #[test]
    fn validation_joins_all_reasons() {
        let err = CreditError::Validation {
            reasons: vec!["too small".into(), "cooldown active".into()],
        };
        assert_eq!(err.to_string(), "validation failed: too small; cooldown active");
        assert_eq!(err.user_message(), "too small; cooldown active");
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(CreditError::HandlerFailure("timeout".into()).is_retryable());
        assert!(CreditError::Storage("io".into()).is_retryable());
        assert!(!CreditError::GatewayInconsistency("missing".into()).is_retryable());
        assert!(!CreditError::validation("bad").is_retryable());
    }
}
