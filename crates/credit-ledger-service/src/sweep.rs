//! Out-of-band maintenance: webhook retries and the stuck-pending report.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use credit_ledger_core::{Result, Transaction, TransactionType, WebhookOutcome};
use credit_ledger_store::Store;

use crate::webhooks::WebhookProcessor;

/// Counts from one retry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Events retried.
    pub attempted: usize,
    /// Events that succeeded.
    pub processed: usize,
    /// Events that failed again and were rescheduled.
    pub rescheduled: usize,
    /// Events that ran out of attempts.
    pub dead_lettered: usize,
}

/// Periodic retry of failed webhook events.
pub struct Sweeper {
    store: Arc<dyn Store>,
    webhooks: Arc<WebhookProcessor>,
    stuck_after: Duration,
    batch_size: usize,
}

impl Sweeper {
    /// Create a sweeper.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        webhooks: Arc<WebhookProcessor>,
        stuck_pending_minutes: u32,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            webhooks,
            stuck_after: Duration::minutes(i64::from(stuck_pending_minutes)),
            batch_size,
        }
    }

    /// Retry every event due at `now`, up to the batch size.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the due events cannot be listed. Failures
    /// of single events are logged and counted, not returned.
    pub async fn retry_due(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let due = self
            .store
            .list_retryable_webhook_events(now, self.batch_size)?;
        let mut report = SweepReport::default();

        for record in due {
            report.attempted += 1;
            match self.webhooks.retry(&record.stripe_event_id).await {
                Ok(result) => match result.outcome {
                    WebhookOutcome::RetryScheduled { .. } => report.rescheduled += 1,
                    WebhookOutcome::DeadLettered { .. } => report.dead_lettered += 1,
                    _ => report.processed += 1,
                },
                Err(e) => {
                    error!(event_id = %record.stripe_event_id, error = %e, "Webhook retry failed");
                    report.rescheduled += 1;
                }
            }
        }

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                processed = report.processed,
                rescheduled = report.rescheduled,
                dead_lettered = report.dead_lettered,
                "Webhook retry sweep"
            );
        }
        Ok(report)
    }

    /// Pending purchases and refunds older than the threshold.
    ///
    /// They are reported, never failed: only the gateway or an operator may
    /// end them.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the listing fails.
    pub fn stuck_pending(&self, now: DateTime<Utc>) -> Result<Vec<Transaction>> {
        let stuck: Vec<Transaction> = self
            .store
            .list_pending_older_than(now - self.stuck_after)?
            .into_iter()
            .filter(|tx| {
                matches!(
                    tx.transaction_type,
                    TransactionType::Purchase | TransactionType::Refund
                )
            })
            .collect();
        for tx in &stuck {
            warn!(
                user_id = %tx.user_id,
                transaction_id = %tx.id,
                transaction_type = %tx.transaction_type,
                created_at = %tx.created_at,
                "Transaction stuck pending"
            );
        }
        Ok(stuck)
    }

    /// Run one retry sweep and the stuck-pending report every `interval`
    /// until `shutdown` resolves.
    pub async fn run_until<F>(&self, interval: std::time::Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("Sweeper stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let now = Utc::now();
                    if let Err(e) = self.retry_due(now).await {
                        error!(error = %e, "Webhook retry sweep failed");
                    }
                    match self.stuck_pending(now) {
                        Ok(stuck) if !stuck.is_empty() => {
                            warn!(count = stuck.len(), "Stuck pending transactions");
                        }
                        Ok(_) => debug!("No stuck pending transactions"),
                        Err(e) => error!(error = %e, "Stuck-pending report failed"),
                    }
                }
            }
        }
    }
}
