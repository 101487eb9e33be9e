//! Common test utilities for credit ledger integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use credit_ledger_core::{
    AccountBalance, AutoTopupPolicy, ProcessingResult, Result, Transaction, TransactionId,
    TransactionType, UserId, WebhookEventRecord,
};
use credit_ledger_service::crypto::sign_payload;
use credit_ledger_service::{ApplyOptions, CreditService, ServiceConfig};
use credit_ledger_store::{LedgerCommit, MemoryStore, Store, StoreError};

/// Webhook secret every harness is configured with.
pub const SECRET: &str = "whsec_test_secret";

/// Test harness containing everything needed for integration tests.
pub struct TestHarness {
    /// The engine under test.
    pub service: Arc<CreditService>,
    /// The store behind it, with failure injection.
    pub store: Arc<FlakyStore>,
}

impl TestHarness {
    /// A fresh in-memory service with a webhook secret.
    pub fn new() -> Self {
        Self::with_config(ServiceConfig::with_webhook_secret(SECRET))
    }

    /// A fresh in-memory service with `config`.
    pub fn with_config(config: ServiceConfig) -> Self {
        let store = Arc::new(FlakyStore::default());
        let service = Arc::new(CreditService::new(
            Arc::clone(&store) as Arc<dyn Store>,
            config,
        ));
        Self { service, store }
    }

    /// Grant `credits` as a completed bonus.
    pub async fn fund(&self, user_id: UserId, credits: u64) {
        self.service
            .ledger()
            .apply_transaction(user_id, TransactionType::Bonus, credits, ApplyOptions::default())
            .await
            .expect("funding failed");
    }

    /// Current balance.
    pub fn balance(&self, user_id: UserId) -> AccountBalance {
        self.service.get_balance(&user_id).expect("balance read failed")
    }

    /// Sign and deliver a webhook payload.
    pub async fn deliver(&self, payload: &str) -> Result<ProcessingResult> {
        self.service.handle_webhook(payload, &sign(payload)).await
    }

    /// Stored webhook record.
    pub fn webhook_record(&self, event_id: &str) -> Option<WebhookEventRecord> {
        self.store
            .get_webhook_event(event_id)
            .expect("webhook read failed")
    }

    /// Every transaction of a user, newest first.
    pub fn transactions(&self, user_id: UserId) -> Vec<Transaction> {
        self.service
            .list_transactions(&user_id, 1_000, 0)
            .expect("transaction listing failed")
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Signature header for `payload` signed now with [`SECRET`].
pub fn sign(payload: &str) -> String {
    sign_payload(SECRET, Utc::now().timestamp(), payload).expect("signing failed")
}

/// A gateway event payload.
pub fn event(id: &str, event_type: &str, object: Value) -> String {
    json!({
        "id": id,
        "type": event_type,
        "created": Utc::now().timestamp(),
        "data": { "object": object }
    })
    .to_string()
}

/// A payment intent event carrying the ledger transaction id in its metadata.
pub fn payment_intent_event(id: &str, event_type: &str, transaction_id: TransactionId) -> String {
    event(
        id,
        event_type,
        json!({
            "id": format!("pi_{id}"),
            "object": "payment_intent",
            "metadata": { "transaction_id": transaction_id.to_string() }
        }),
    )
}

/// Signed sum of a user's completed transactions.
pub fn settled_sum(transactions: &[Transaction]) -> i128 {
    transactions.iter().map(Transaction::settled_delta).sum()
}

/// [`MemoryStore`] that can be told to fail ledger commits.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    failing_commits: AtomicU32,
}

impl FlakyStore {
    /// Fail the next `count` commits with a database error.
    pub fn fail_next_commits(&self, count: u32) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Overwrite a stored policy.
    pub fn put_policy(&self, policy: &AutoTopupPolicy) {
        self.inner.put_topup_policy(policy).expect("policy write failed");
    }
}

impl Store for FlakyStore {
    fn get_balance(&self, user_id: &UserId) -> credit_ledger_store::Result<Option<AccountBalance>> {
        self.inner.get_balance(user_id)
    }

    fn commit(&self, commit: LedgerCommit) -> credit_ledger_store::Result<AccountBalance> {
        let failing = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(StoreError::Database("injected failure".into()));
        }
        self.inner.commit(commit)
    }

    fn get_transaction(
        &self,
        transaction_id: &TransactionId,
    ) -> credit_ledger_store::Result<Option<Transaction>> {
        self.inner.get_transaction(transaction_id)
    }

    fn list_transactions_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> credit_ledger_store::Result<Vec<Transaction>> {
        self.inner.list_transactions_by_user(user_id, limit, offset)
    }

    fn transactions_since(
        &self,
        user_id: &UserId,
        since: DateTime<Utc>,
    ) -> credit_ledger_store::Result<Vec<Transaction>> {
        self.inner.transactions_since(user_id, since)
    }

    fn transactions_by_reference(
        &self,
        reference_id: &str,
    ) -> credit_ledger_store::Result<Vec<Transaction>> {
        self.inner.transactions_by_reference(reference_id)
    }

    fn list_pending_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> credit_ledger_store::Result<Vec<Transaction>> {
        self.inner.list_pending_older_than(cutoff)
    }

    fn list_pending_by_user(&self, user_id: &UserId) -> credit_ledger_store::Result<Vec<Transaction>> {
        self.inner.list_pending_by_user(user_id)
    }

    fn insert_webhook_event(&self, record: &WebhookEventRecord) -> credit_ledger_store::Result<bool> {
        self.inner.insert_webhook_event(record)
    }

    fn get_webhook_event(
        &self,
        event_id: &str,
    ) -> credit_ledger_store::Result<Option<WebhookEventRecord>> {
        self.inner.get_webhook_event(event_id)
    }

    fn put_webhook_event(&self, record: &WebhookEventRecord) -> credit_ledger_store::Result<()> {
        self.inner.put_webhook_event(record)
    }

    fn list_retryable_webhook_events(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> credit_ledger_store::Result<Vec<WebhookEventRecord>> {
        self.inner.list_retryable_webhook_events(now, limit)
    }

    fn list_dead_lettered_webhook_events(
        &self,
        limit: usize,
    ) -> credit_ledger_store::Result<Vec<WebhookEventRecord>> {
        self.inner.list_dead_lettered_webhook_events(limit)
    }

    fn get_topup_policy(
        &self,
        user_id: &UserId,
    ) -> credit_ledger_store::Result<Option<AutoTopupPolicy>> {
        self.inner.get_topup_policy(user_id)
    }

    fn put_topup_policy(&self, policy: &AutoTopupPolicy) -> credit_ledger_store::Result<()> {
        self.inner.put_topup_policy(policy)
    }
}
