//! Payment gateway events and their reconciliation records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CreditError, Result};
use crate::TransactionId;

/// Metadata key the purchase flow sets on gateway objects.
pub const TRANSACTION_ID_METADATA_KEY: &str = "transaction_id";

/// A gateway webhook event, as delivered.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GatewayEvent {
    /// Gateway-assigned event id; the dedup key.
    pub id: String,
    /// Event type (e.g. `payment_intent.succeeded`).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Created timestamp (Unix).
    #[serde(default)]
    pub created: i64,
    /// Event data.
    pub data: GatewayEventData,
}

/// Event data container.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GatewayEventData {
    /// The gateway object the event is about (payment intent, charge, ...).
    pub object: serde_json::Value,
}

/// What the ledger does with an event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayEventKind {
    /// Payment confirmed; complete the purchase.
    PaymentSucceeded,
    /// Payment declined; fail the purchase.
    PaymentFailed,
    /// Payment abandoned; cancel the purchase.
    PaymentCanceled,
    /// Money returned; complete the pending refund.
    ChargeRefunded,
    /// The gateway could not return the money; fail the pending refund.
    RefundFailed,
    /// Chargeback opened; flag for manual review.
    DisputeCreated,
    /// Not relevant to the ledger.
    Unhandled,
}

impl GatewayEvent {
    /// Parse a raw payload.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::InvalidEventFormat`] when the payload is not a
    /// well-formed event or has an empty id or type.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let event: Self = serde_json::from_slice(payload)
            .map_err(|e| CreditError::InvalidEventFormat(e.to_string()))?;
        if event.id.trim().is_empty() {
            return Err(CreditError::InvalidEventFormat("missing event id".into()));
        }
        if event.event_type.trim().is_empty() {
            return Err(CreditError::InvalidEventFormat("missing event type".into()));
        }
        Ok(event)
    }

    /// Classify the event.
    #[must_use]
    pub fn kind(&self) -> GatewayEventKind {
        match self.event_type.as_str() {
            "payment_intent.succeeded" => GatewayEventKind::PaymentSucceeded,
            "checkout.session.completed" => {
                if self.object_str("payment_status") == Some("paid") {
                    GatewayEventKind::PaymentSucceeded
                } else {
                    GatewayEventKind::Unhandled
                }
            }
            "payment_intent.payment_failed" | "charge.failed" => GatewayEventKind::PaymentFailed,
            "payment_intent.canceled" | "checkout.session.expired" => {
                GatewayEventKind::PaymentCanceled
            }
            "charge.refunded" => GatewayEventKind::ChargeRefunded,
            "refund.failed" => GatewayEventKind::RefundFailed,
            "refund.updated" | "charge.refund.updated" => match self.object_str("status") {
                Some("succeeded") => GatewayEventKind::ChargeRefunded,
                Some("failed" | "canceled") => GatewayEventKind::RefundFailed,
                _ => GatewayEventKind::Unhandled,
            },
            "charge.dispute.created" => GatewayEventKind::DisputeCreated,
            _ => GatewayEventKind::Unhandled,
        }
    }

    /// Id of the gateway object.
    #[must_use]
    pub fn object_id(&self) -> Option<&str> {
        self.object_str("id")
    }

    /// String field of the gateway object.
    #[must_use]
    pub fn object_str(&self, field: &str) -> Option<&str> {
        self.data.object.get(field).and_then(serde_json::Value::as_str)
    }

    /// String metadata entry on the gateway object.
    #[must_use]
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.data
            .object
            .get("metadata")
            .and_then(|m| m.get(key))
            .and_then(serde_json::Value::as_str)
    }

    /// Gateway ids this event may be correlated by, most specific first.
    ///
    /// Charges carry their payment intent; checkout sessions carry theirs too.
    #[must_use]
    pub fn correlation_ids(&self) -> Vec<&str> {
        let mut ids = Vec::new();
        for field in ["id", "payment_intent", "charge"] {
            if let Some(id) = self.object_str(field) {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        ids
    }

    /// Gateway refunds the event reports.
    ///
    /// A refund object reports itself; a charge reports every refund listed
    /// under `refunds.data`.
    #[must_use]
    pub fn refund_entries(&self) -> Vec<RefundEntry<'_>> {
        let object = &self.data.object;
        if self.object_str("object") == Some("refund") {
            return vec![RefundEntry::from_object(object)];
        }
        object
            .get("refunds")
            .and_then(|r| r.get("data"))
            .and_then(serde_json::Value::as_array)
            .map(|data| data.iter().map(RefundEntry::from_object).collect())
            .unwrap_or_default()
    }

    /// Human-readable failure reason the gateway supplied, if any.
    #[must_use]
    pub fn failure_message(&self) -> Option<&str> {
        let object = &self.data.object;
        object
            .get("last_payment_error")
            .and_then(|e| e.get("message"))
            .and_then(serde_json::Value::as_str)
            .or_else(|| object.get("failure_message").and_then(serde_json::Value::as_str))
            .or_else(|| object.get("failure_reason").and_then(serde_json::Value::as_str))
            .or_else(|| {
                object
                    .get("cancellation_reason")
                    .and_then(serde_json::Value::as_str)
            })
    }

    /// Transaction id from the object's metadata.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::InvalidEventFormat`] when the entry is present
    /// but not a valid transaction id.
    pub fn transaction_id(&self) -> Result<Option<TransactionId>> {
        self.metadata(TRANSACTION_ID_METADATA_KEY)
            .map(|raw| {
                raw.parse()
                    .map_err(|_| CreditError::InvalidEventFormat(format!("bad transaction_id: {raw}")))
            })
            .transpose()
    }
}

/// One gateway refund as reported by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefundEntry<'a> {
    /// Gateway refund id.
    pub id: Option<&'a str>,
    /// Gateway refund status (`succeeded`, `pending`, `failed`, ...).
    pub status: Option<&'a str>,
    /// Ledger refund transaction id from the refund's metadata.
    pub transaction_id: Option<&'a str>,
}

impl<'a> RefundEntry<'a> {
    fn from_object(object: &'a serde_json::Value) -> Self {
        let field = |name: &str| object.get(name).and_then(serde_json::Value::as_str);
        Self {
            id: field("id"),
            status: field("status"),
            transaction_id: object
                .get("metadata")
                .and_then(|m| m.get(TRANSACTION_ID_METADATA_KEY))
                .and_then(serde_json::Value::as_str),
        }
    }

    /// Whether the gateway reports the money as returned. Entries without
    /// a status count as returned.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status.map_or(true, |status| status == "succeeded")
    }
}

/// What processing an event did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// Purchase completed and credited.
    TransactionCompleted,
    /// Purchase failed.
    TransactionFailed,
    /// Purchase cancelled.
    TransactionCancelled,
    /// Pending refund completed and debited.
    RefundCompleted,
    /// Pending refund failed; its reserved credits are available again.
    RefundFailed,
    /// Dispute recorded; no balance change.
    FlaggedForReview,
    /// Event type the ledger does not act on.
    Ignored,
    /// Handling failed; a retry is scheduled.
    RetryScheduled {
        /// Attempts so far.
        attempt: u32,
        /// When the sweeper may retry.
        next_retry_at: DateTime<Utc>,
    },
    /// Parked for an operator.
    DeadLettered {
        /// Last error.
        reason: String,
    },
}

impl WebhookOutcome {
    /// Whether this outcome finishes the event.
    #[must_use]
    pub const fn is_final(&self) -> bool {
        !matches!(self, Self::RetryScheduled { .. })
    }
}

impl fmt::Display for WebhookOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransactionCompleted => f.write_str("transaction_completed"),
            Self::TransactionFailed => f.write_str("transaction_failed"),
            Self::TransactionCancelled => f.write_str("transaction_cancelled"),
            Self::RefundCompleted => f.write_str("refund_completed"),
            Self::RefundFailed => f.write_str("refund_failed"),
            Self::FlaggedForReview => f.write_str("flagged_for_review"),
            Self::Ignored => f.write_str("ignored"),
            Self::RetryScheduled { attempt, .. } => write!(f, "retry_scheduled({attempt})"),
            Self::DeadLettered { .. } => f.write_str("dead_lettered"),
        }
    }
}

/// Result of processing one webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingResult {
    /// Gateway event id.
    pub event_id: String,
    /// Gateway event type.
    pub event_type: String,
    /// What happened.
    pub outcome: WebhookOutcome,
    /// Ledger transaction touched, if any.
    pub transaction_id: Option<TransactionId>,
    /// Whether the event is finished (successfully handled).
    pub processed: bool,
}

/// Durable record of a gateway event, one per `stripe_event_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEventRecord {
    /// Gateway event id; unique.
    pub stripe_event_id: String,
    /// Gateway event type.
    pub event_type: String,
    /// Raw verified payload, kept for retries.
    pub payload: String,
    /// Handled successfully.
    pub processed: bool,
    /// Failed handling attempts.
    pub retry_count: u32,
    /// Result of the last handling attempt.
    pub processing_result: Option<ProcessingResult>,
    /// Last handler error.
    pub last_error: Option<String>,
    /// Earliest automatic retry.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Removed from automatic retry.
    pub dead_lettered: bool,
    /// First delivery.
    pub created_at: DateTime<Utc>,
    /// Successful handling, or dead-lettering.
    pub processed_at: Option<DateTime<Utc>>,
}

impl WebhookEventRecord {
    /// Unprocessed record for a freshly received event.
    #[must_use]
    pub fn received(event: &GatewayEvent, payload: String, now: DateTime<Utc>) -> Self {
        Self {
            stripe_event_id: event.id.clone(),
            event_type: event.event_type.clone(),
            payload,
            processed: false,
            retry_count: 0,
            processing_result: None,
            last_error: None,
            next_retry_at: None,
            dead_lettered: false,
            created_at: now,
            processed_at: None,
        }
    }

    /// Whether a redelivery must return the stored result unchanged.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        self.processed || self.dead_lettered
    }

    /// Whether the retry sweep should pick this record up at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.is_settled() && self.next_retry_at.map_or(true, |at| at <= now)
    }

    /// Record a successful handling.
    pub fn mark_processed(&mut self, result: ProcessingResult, now: DateTime<Utc>) {
        self.processed = true;
        self.processing_result = Some(result);
        self.last_error = None;
        self.next_retry_at = None;
        self.processed_at = Some(now);
    }

    /// Record a failed attempt and when to try again.
    pub fn schedule_retry(
        &mut self,
        error: impl Into<String>,
        next_retry_at: DateTime<Utc>,
        result: ProcessingResult,
    ) {
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_error = Some(error.into());
        self.next_retry_at = Some(next_retry_at);
        self.processing_result = Some(result);
    }

    /// Park the record for an operator.
    pub fn dead_letter(
        &mut self,
        error: impl Into<String>,
        result: ProcessingResult,
        now: DateTime<Utc>,
    ) {
        self.dead_lettered = true;
        self.last_error = Some(error.into());
        self.next_retry_at = None;
        self.processing_result = Some(result);
        self.processed_at = Some(now);
    }

    /// Return a dead-lettered record to automatic retry with a fresh budget.
    pub fn requeue(&mut self, now: DateTime<Utc>) {
        self.dead_lettered = false;
        self.retry_count = 0;
        self.next_retry_at = Some(now);
        self.processed_at = None;
    }
}
