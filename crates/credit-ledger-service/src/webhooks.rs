//! Payment webhook reconciliation.
//!
//! Every delivery is verified, parsed and then handled under a lock on its
//! gateway event id. The durable event record is the dedup point: once an
//! event is processed (or dead-lettered) every redelivery returns the
//! stored result and touches nothing else.
//!
//! Handler failures are acknowledged, not returned: the record keeps the
//! payload and a retry time, and the sweeper retries it out of band.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use credit_ledger_core::{
    CreditError, GatewayEvent, GatewayEventKind, ProcessingResult, RefundEntry, Result,
    Transaction, TransactionId, TransactionStatus, TransactionType, WebhookEventRecord,
    WebhookOutcome,
};
use credit_ledger_store::{Store, StoreError};

use crate::config::WebhookConfig;
use crate::crypto::verify_signature;
use crate::ledger::{Ledger, GATEWAY_REFUND_METADATA_KEY};
use crate::locks::KeyedLocks;
use crate::topup::AutoTopupEngine;

/// Verifies, deduplicates and dispatches gateway webhook events.
pub struct WebhookProcessor {
    ledger: Arc<Ledger>,
    topups: Arc<AutoTopupEngine>,
    config: WebhookConfig,
    locks: KeyedLocks<String>,
}

impl WebhookProcessor {
    /// Create a processor.
    #[must_use]
    pub fn new(ledger: Arc<Ledger>, topups: Arc<AutoTopupEngine>, config: WebhookConfig) -> Self {
        if config.secret.is_none() {
            warn!("Webhook secret not configured - every webhook will be rejected");
        }
        Self {
            ledger,
            topups,
            config,
            locks: KeyedLocks::new(),
        }
    }

    /// Handle one delivery.
    ///
    /// Returns the processing result for new events, the stored result for
    /// settled ones, and a `RetryScheduled` or `DeadLettered` result when
    /// handling failed. Nothing is persisted for a rejected delivery.
    ///
    /// # Errors
    ///
    /// - [`CreditError::InvalidSignature`] if verification fails.
    /// - [`CreditError::InvalidEventFormat`] if the payload is not an event.
    /// - Storage errors while reading or writing the event record.
    pub async fn process(&self, payload: &str, signature: &str) -> Result<ProcessingResult> {
        let now = Utc::now();
        if let Err(e) = verify_signature(
            self.config.secret.as_deref(),
            payload,
            signature,
            self.config.signature_tolerance_seconds,
            now,
        ) {
            warn!(error = %e, "Rejected webhook with invalid signature");
            return Err(e);
        }

        let event = GatewayEvent::parse(payload.as_bytes()).map_err(|e| {
            warn!(error = %e, "Rejected malformed webhook payload");
            e
        })?;

        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Received gateway webhook"
        );

        let _guard = self.locks.lock(event.id.clone()).await;
        let store = self.ledger.store();

        let record = match store.get_webhook_event(&event.id)? {
            Some(record) if record.is_settled() => {
                debug!(event_id = %event.id, "Duplicate webhook delivery");
                return Ok(stored_result(&record));
            }
            Some(record) => record,
            None => {
                let record = WebhookEventRecord::received(&event, payload.to_string(), now);
                if store.insert_webhook_event(&record)? {
                    record
                } else {
                    // Another process inserted it between our read and write.
                    match store.get_webhook_event(&event.id)? {
                        Some(existing) if existing.is_settled() => {
                            return Ok(stored_result(&existing));
                        }
                        Some(existing) => existing,
                        None => record,
                    }
                }
            }
        };

        self.attempt(record, &event, now).await
    }

    /// Retry a stored, unsettled event from its saved payload.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::NotFound`] for an unknown event id and storage
    /// errors while reading or writing the record.
    pub async fn retry(&self, event_id: &str) -> Result<ProcessingResult> {
        let _guard = self.locks.lock(event_id.to_string()).await;
        let now = Utc::now();
        let mut record = self
            .ledger
            .store()
            .get_webhook_event(event_id)?
            .ok_or_else(|| CreditError::NotFound {
                entity: "webhook_event",
                id: event_id.to_string(),
            })?;
        if record.is_settled() {
            return Ok(stored_result(&record));
        }

        match GatewayEvent::parse(record.payload.as_bytes()) {
            Ok(event) => self.attempt(record, &event, now).await,
            Err(e) => {
                let result = ProcessingResult {
                    event_id: record.stripe_event_id.clone(),
                    event_type: record.event_type.clone(),
                    outcome: WebhookOutcome::DeadLettered {
                        reason: e.to_string(),
                    },
                    transaction_id: None,
                    processed: false,
                };
                record.dead_letter(e.to_string(), result.clone(), now);
                self.ledger.store().put_webhook_event(&record)?;
                error!(event_id = %event_id, error = %e, "Stored webhook payload unreadable, dead-lettered");
                Ok(result)
            }
        }
    }

    /// Dead-lettered events, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    pub fn list_dead_letters(&self, limit: usize) -> Result<Vec<WebhookEventRecord>> {
        Ok(self
            .ledger
            .store()
            .list_dead_lettered_webhook_events(limit)?)
    }

    /// Return a dead-lettered event to automatic retry with a fresh attempt
    /// budget.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::NotFound`] for an unknown event and
    /// [`CreditError::Validation`] if it is not dead-lettered.
    pub async fn requeue_dead_letter(&self, event_id: &str) -> Result<WebhookEventRecord> {
        let _guard = self.locks.lock(event_id.to_string()).await;
        let store = self.ledger.store();
        let mut record = store
            .get_webhook_event(event_id)?
            .ok_or_else(|| CreditError::NotFound {
                entity: "webhook_event",
                id: event_id.to_string(),
            })?;
        if !record.dead_lettered {
            return Err(CreditError::validation(format!(
                "webhook event {event_id} is not dead-lettered"
            )));
        }
        record.requeue(Utc::now());
        store.put_webhook_event(&record)?;
        info!(event_id = %event_id, "Dead-lettered webhook requeued");
        Ok(record)
    }

    /// Run the handler once and record the outcome on `record`.
    async fn attempt(
        &self,
        mut record: WebhookEventRecord,
        event: &GatewayEvent,
        now: DateTime<Utc>,
    ) -> Result<ProcessingResult> {
        let store = self.ledger.store();

        match self.dispatch(event).await {
            Ok((outcome, transaction_id)) => {
                let result = ProcessingResult {
                    event_id: event.id.clone(),
                    event_type: event.event_type.clone(),
                    outcome,
                    transaction_id,
                    processed: true,
                };
                record.mark_processed(result.clone(), now);
                store.put_webhook_event(&record)?;
                info!(
                    event_id = %event.id,
                    outcome = %result.outcome,
                    "Webhook processed"
                );
                Ok(result)
            }
            Err(e) => {
                let attempt = record.retry_count.saturating_add(1);
                let exhausted = attempt >= self.config.max_attempts;
                let result = if e.is_retryable() && !exhausted {
                    let next_retry_at = now + self.config.retry_delay(attempt);
                    let result = ProcessingResult {
                        event_id: event.id.clone(),
                        event_type: event.event_type.clone(),
                        outcome: WebhookOutcome::RetryScheduled {
                            attempt,
                            next_retry_at,
                        },
                        transaction_id: None,
                        processed: false,
                    };
                    record.schedule_retry(e.to_string(), next_retry_at, result.clone());
                    warn!(
                        event_id = %event.id,
                        attempt,
                        next_retry_at = %next_retry_at,
                        error = %e,
                        "Webhook handling failed, retry scheduled"
                    );
                    result
                } else {
                    let result = ProcessingResult {
                        event_id: event.id.clone(),
                        event_type: event.event_type.clone(),
                        outcome: WebhookOutcome::DeadLettered {
                            reason: e.to_string(),
                        },
                        transaction_id: None,
                        processed: false,
                    };
                    record.retry_count = attempt;
                    record.dead_letter(e.to_string(), result.clone(), now);
                    error!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        attempt,
                        kind = e.kind().as_str(),
                        error = %e,
                        "Webhook dead-lettered, manual reconciliation required"
                    );
                    result
                };
                store.put_webhook_event(&record)?;
                Ok(result)
            }
        }
    }

    /// Apply the event to the ledger.
    async fn dispatch(
        &self,
        event: &GatewayEvent,
    ) -> Result<(WebhookOutcome, Option<TransactionId>)> {
        match event.kind() {
            GatewayEventKind::PaymentSucceeded => {
                let tx = self.resolve_purchase(event)?;
                let done = self
                    .ledger
                    .complete_transaction(tx.id)
                    .await
                    .map_err(reconciliation_error)?;
                self.settle_topup(&done).await?;
                Ok((WebhookOutcome::TransactionCompleted, Some(done.id)))
            }
            GatewayEventKind::PaymentFailed => {
                let tx = self.resolve_purchase(event)?;
                let reason = event.failure_message().unwrap_or("payment failed");
                let failed = self
                    .ledger
                    .fail_transaction(tx.id, reason)
                    .await
                    .map_err(reconciliation_error)?;
                self.settle_topup(&failed).await?;
                Ok((WebhookOutcome::TransactionFailed, Some(failed.id)))
            }
            GatewayEventKind::PaymentCanceled => {
                let tx = self.resolve_purchase(event)?;
                let reason = event
                    .failure_message()
                    .map_or_else(|| "payment canceled".to_string(), str::to_string);
                let cancelled = self
                    .ledger
                    .cancel_transaction(tx.id, Some(reason))
                    .await
                    .map_err(reconciliation_error)?;
                self.settle_topup(&cancelled).await?;
                Ok((WebhookOutcome::TransactionCancelled, Some(cancelled.id)))
            }
            GatewayEventKind::ChargeRefunded => {
                let refund_id = self.complete_refund(event).await?;
                Ok((WebhookOutcome::RefundCompleted, Some(refund_id)))
            }
            GatewayEventKind::RefundFailed => {
                let refund = self.resolve_failed_refund(event)?;
                let reason = event.failure_message().unwrap_or("refund failed");
                let failed = self
                    .ledger
                    .fail_transaction(refund.id, reason)
                    .await
                    .map_err(reconciliation_error)?;
                warn!(
                    event_id = %event.id,
                    transaction_id = %failed.id,
                    user_id = %failed.user_id,
                    reason,
                    "Gateway refund failed, reserved credits released"
                );
                Ok((WebhookOutcome::RefundFailed, Some(failed.id)))
            }
            GatewayEventKind::DisputeCreated => {
                let tx = match self.resolve(event) {
                    Ok(tx) => Some(tx),
                    Err(CreditError::GatewayInconsistency(_)) => None,
                    Err(e) => return Err(e),
                };
                error!(
                    event_id = %event.id,
                    transaction_id = ?tx.as_ref().map(|t| t.id),
                    user_id = ?tx.as_ref().map(|t| t.user_id),
                    "Payment disputed, flagged for manual review"
                );
                Ok((WebhookOutcome::FlaggedForReview, tx.map(|t| t.id)))
            }
            GatewayEventKind::Unhandled => {
                debug!(event_type = %event.event_type, "Unhandled gateway event");
                Ok((WebhookOutcome::Ignored, None))
            }
        }
    }

    /// Complete the pending refunds a refund event confirms.
    ///
    /// Refunds are matched to the succeeded gateway refunds the event lists,
    /// by the ledger id in their metadata or by the recorded gateway refund
    /// id. An event that identifies none of them may only settle a sole
    /// pending refund. A redelivery after completion changes nothing.
    async fn complete_refund(&self, event: &GatewayEvent) -> Result<TransactionId> {
        let tx = self.resolve(event)?;
        if tx.transaction_type == TransactionType::Refund {
            let done = self
                .ledger
                .complete_transaction(tx.id)
                .await
                .map_err(reconciliation_error)?;
            return Ok(done.id);
        }

        let refunds = self.refunds_of(&tx)?;
        let entries = event.refund_entries();
        let matched: Vec<&Transaction> = refunds
            .iter()
            .filter(|r| {
                entries
                    .iter()
                    .any(|entry| entry.succeeded() && refund_matches(r, entry))
            })
            .collect();
        let confirmed = if matched.is_empty() {
            let pending: Vec<&Transaction> = refunds
                .iter()
                .filter(|r| r.status == TransactionStatus::Pending)
                .collect();
            match pending.as_slice() {
                [] => {
                    return refunds
                        .iter()
                        .rev()
                        .find(|r| r.status == TransactionStatus::Completed)
                        .map(|r| r.id)
                        .ok_or_else(|| {
                            CreditError::GatewayInconsistency(format!(
                                "event {} refunds transaction {} which has no pending refund",
                                event.id, tx.id
                            ))
                        });
                }
                [only] => vec![*only],
                several => {
                    return Err(CreditError::GatewayInconsistency(format!(
                        "event {} does not say which of the {} pending refunds of {} succeeded",
                        event.id,
                        several.len(),
                        tx.id
                    )));
                }
            }
        } else {
            matched
        };

        let mut settled = None;
        for refund in &confirmed {
            if refund.status == TransactionStatus::Pending {
                let done = self
                    .ledger
                    .complete_transaction(refund.id)
                    .await
                    .map_err(reconciliation_error)?;
                settled.get_or_insert(done.id);
            }
        }
        settled
            .or_else(|| confirmed.first().map(|r| r.id))
            .ok_or_else(|| {
                CreditError::GatewayInconsistency(format!(
                    "event {} confirms no refund of transaction {}",
                    event.id, tx.id
                ))
            })
    }

    /// Find the pending refund a refund failure is about.
    fn resolve_failed_refund(&self, event: &GatewayEvent) -> Result<Transaction> {
        let tx = self.resolve(event)?;
        if tx.transaction_type == TransactionType::Refund {
            return Ok(tx);
        }

        let mut refunds = self.refunds_of(&tx)?;
        let entries = event.refund_entries();
        if let Some(index) = refunds
            .iter()
            .position(|r| entries.iter().any(|entry| refund_matches(r, entry)))
        {
            return Ok(refunds.swap_remove(index));
        }

        let mut pending = refunds
            .into_iter()
            .filter(|r| r.status == TransactionStatus::Pending);
        match (pending.next(), pending.next()) {
            (Some(only), None) => Ok(only),
            (None, _) => Err(CreditError::GatewayInconsistency(format!(
                "event {} fails a refund of transaction {} which has no pending refund",
                event.id, tx.id
            ))),
            (Some(_), Some(_)) => Err(CreditError::GatewayInconsistency(format!(
                "event {} does not say which pending refund of {} failed",
                event.id, tx.id
            ))),
        }
    }

    /// Refund transactions reversing `tx`, oldest first.
    fn refunds_of(&self, tx: &Transaction) -> Result<Vec<Transaction>> {
        Ok(self
            .ledger
            .store()
            .transactions_by_reference(&tx.id.to_string())
            .map_err(|e| CreditError::HandlerFailure(e.to_string()))?
            .into_iter()
            .filter(|r| r.transaction_type == TransactionType::Refund && r.reverses == Some(tx.id))
            .collect())
    }

    async fn settle_topup(&self, tx: &Transaction) -> Result<()> {
        self.topups
            .record_settlement(tx)
            .await
            .map_err(|e| CreditError::HandlerFailure(e.to_string()))
    }

    /// Resolve the purchase a payment event is about.
    fn resolve_purchase(&self, event: &GatewayEvent) -> Result<Transaction> {
        let tx = self.resolve(event)?;
        if tx.transaction_type != TransactionType::Purchase {
            return Err(CreditError::GatewayInconsistency(format!(
                "event {} references {} transaction {}, not a purchase",
                event.id, tx.transaction_type, tx.id
            )));
        }
        Ok(tx)
    }

    /// Find the transaction an event refers to: by the transaction id in
    /// its metadata, else by the gateway ids recorded as references.
    fn resolve(&self, event: &GatewayEvent) -> Result<Transaction> {
        let store = self.ledger.store();
        let storage = |e: StoreError| CreditError::HandlerFailure(e.to_string());

        let explicit = event
            .transaction_id()
            .map_err(|e| CreditError::GatewayInconsistency(e.to_string()))?;
        if let Some(id) = explicit {
            return store.get_transaction(&id).map_err(storage)?.ok_or_else(|| {
                CreditError::GatewayInconsistency(format!(
                    "event {} references unknown transaction {id}",
                    event.id
                ))
            });
        }

        for reference in event.correlation_ids() {
            let mut candidates = store.transactions_by_reference(reference).map_err(storage)?;
            if candidates.len() > 1 {
                warn!(
                    event_id = %event.id,
                    reference,
                    matches = candidates.len(),
                    "Gateway reference matches several transactions"
                );
            }
            if let Some(tx) = candidates.pop() {
                return Ok(tx);
            }
        }

        Err(CreditError::GatewayInconsistency(format!(
            "event {} ({}) matches no ledger transaction",
            event.id, event.event_type
        )))
    }
}

/// Whether a gateway refund entry denotes the ledger `refund`.
fn refund_matches(refund: &Transaction, entry: &RefundEntry<'_>) -> bool {
    let by_ledger_id = entry
        .transaction_id
        .is_some_and(|id| id == refund.id.to_string());
    let by_gateway_id = entry.id.is_some()
        && entry.id == refund.metadata.get(GATEWAY_REFUND_METADATA_KEY);
    by_ledger_id || by_gateway_id
}

/// Classify a ledger error raised while applying a gateway event.
///
/// Storage trouble is transient; anything else means the gateway and the
/// ledger disagree.
fn reconciliation_error(err: CreditError) -> CreditError {
    match err {
        CreditError::Storage(message) | CreditError::HandlerFailure(message) => {
            CreditError::HandlerFailure(message)
        }
        CreditError::GatewayInconsistency(message) => CreditError::GatewayInconsistency(message),
        other => CreditError::GatewayInconsistency(other.to_string()),
    }
}

/// Result of a settled record; rebuilt from the record if none was stored.
fn stored_result(record: &WebhookEventRecord) -> ProcessingResult {
    record
        .processing_result
        .clone()
        .unwrap_or_else(|| ProcessingResult {
            event_id: record.stripe_event_id.clone(),
            event_type: record.event_type.clone(),
            outcome: if record.dead_lettered {
                WebhookOutcome::DeadLettered {
                    reason: record.last_error.clone().unwrap_or_default(),
                }
            } else {
                WebhookOutcome::Ignored
            },
            transaction_id: None,
            processed: record.processed,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_errors_are_classified() {
        assert!(matches!(
            reconciliation_error(CreditError::Storage("io".into())),
            CreditError::HandlerFailure(_)
        ));
        assert!(matches!(
            reconciliation_error(CreditError::transaction_not_found("x")),
            CreditError::GatewayInconsistency(_)
        ));
        assert!(matches!(
            reconciliation_error(CreditError::validation("bad")),
            CreditError::GatewayInconsistency(_)
        ));
    }

    #[test]
    fn stored_result_falls_back_to_record_state() {
        let event = GatewayEvent::parse(br#"{"id":"evt_1","type":"x","data":{"object":{}}}"#)
            .unwrap();
        let mut record = WebhookEventRecord::received(&event, "{}".into(), Utc::now());
        record.dead_lettered = true;
        record.last_error = Some("boom".into());
        let result = stored_result(&record);
        assert_eq!(
            result.outcome,
            WebhookOutcome::DeadLettered {
                reason: "boom".into()
            }
        );
        assert!(!result.processed);
    }
}
