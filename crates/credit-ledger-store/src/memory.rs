//! In-memory storage implementation.
//!
//! All state lives behind one `RwLock`, so a commit is trivially atomic.
//! Used by tests and by the binary when `RocksDB` is not compiled in.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use credit_ledger_core::{
    AccountBalance, AutoTopupPolicy, Transaction, TransactionId, TransactionStatus, UserId,
    WebhookEventRecord,
};

use crate::error::{Result, StoreError};
use crate::{sort_oldest_first, LedgerCommit, Store};

#[derive(Default)]
struct Inner {
    balances: HashMap<UserId, AccountBalance>,
    transactions: HashMap<TransactionId, Transaction>,
    by_user: HashMap<UserId, BTreeSet<TransactionId>>,
    by_reference: HashMap<String, BTreeSet<TransactionId>>,
    webhook_events: BTreeMap<String, WebhookEventRecord>,
    topup_policies: HashMap<UserId, AutoTopupPolicy>,
}

impl Inner {
    fn collect<'a>(&self, ids: impl Iterator<Item = &'a TransactionId>) -> Vec<Transaction> {
        ids.filter_map(|id| self.transactions.get(id).cloned())
            .collect()
    }

    fn upsert_transaction(&mut self, tx: Transaction) {
        let previous_reference = self
            .transactions
            .get(&tx.id)
            .and_then(|old| old.reference_id.clone());
        if previous_reference != tx.reference_id {
            if let Some(old) = previous_reference {
                if let Some(ids) = self.by_reference.get_mut(&old) {
                    ids.remove(&tx.id);
                }
            }
        }
        if let Some(reference) = &tx.reference_id {
            self.by_reference
                .entry(reference.clone())
                .or_default()
                .insert(tx.id);
        }
        self.by_user.entry(tx.user_id).or_default().insert(tx.id);
        self.transactions.insert(tx.id, tx);
    }
}

/// In-memory [`Store`].
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn get_balance(&self, user_id: &UserId) -> Result<Option<AccountBalance>> {
        Ok(self.inner.read().balances.get(user_id).cloned())
    }

    fn commit(&self, commit: LedgerCommit) -> Result<AccountBalance> {
        commit.validate()?;
        let mut inner = self.inner.write();

        let actual = inner
            .balances
            .get(&commit.user_id)
            .map_or(0, |b| b.version);
        if actual != commit.expected_version {
            return Err(StoreError::VersionConflict {
                user_id: commit.user_id,
                expected: commit.expected_version,
                actual,
            });
        }

        let mut balance = commit.balance;
        balance.version = actual + 1;
        for tx in commit.transactions {
            inner.upsert_transaction(tx);
        }
        inner.balances.insert(commit.user_id, balance.clone());
        Ok(balance)
    }

    fn get_transaction(&self, transaction_id: &TransactionId) -> Result<Option<Transaction>> {
        Ok(self.inner.read().transactions.get(transaction_id).cloned())
    }

    fn list_transactions_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Transaction>> {
        let inner = self.inner.read();
        let Some(ids) = inner.by_user.get(user_id) else {
            return Ok(Vec::new());
        };
        Ok(inner.collect(ids.iter().rev().skip(offset).take(limit)))
    }

    fn transactions_since(
        &self,
        user_id: &UserId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Transaction>> {
        let inner = self.inner.read();
        let Some(ids) = inner.by_user.get(user_id) else {
            return Ok(Vec::new());
        };
        let mut found = inner.collect(ids.iter());
        found.retain(|tx| tx.created_at >= since);
        Ok(found)
    }

    fn transactions_by_reference(&self, reference_id: &str) -> Result<Vec<Transaction>> {
        let inner = self.inner.read();
        Ok(inner
            .by_reference
            .get(reference_id)
            .map(|ids| inner.collect(ids.iter()))
            .unwrap_or_default())
    }

    fn list_pending_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Transaction>> {
        let inner = self.inner.read();
        let mut pending: Vec<Transaction> = inner
            .transactions
            .values()
            .filter(|tx| tx.status == TransactionStatus::Pending && tx.created_at < cutoff)
            .cloned()
            .collect();
        pending.sort_by_key(|tx| tx.id);
        Ok(pending)
    }

    fn list_pending_by_user(&self, user_id: &UserId) -> Result<Vec<Transaction>> {
        let inner = self.inner.read();
        let mut pending = inner
            .by_user
            .get(user_id)
            .map(|ids| inner.collect(ids.iter()))
            .unwrap_or_default();
        pending.retain(|tx| tx.status == TransactionStatus::Pending);
        Ok(pending)
    }

    fn insert_webhook_event(&self, record: &WebhookEventRecord) -> Result<bool> {
        let mut inner = self.inner.write();
        if inner.webhook_events.contains_key(&record.stripe_event_id) {
            return Ok(false);
        }
        inner
            .webhook_events
            .insert(record.stripe_event_id.clone(), record.clone());
        Ok(true)
    }

    fn get_webhook_event(&self, event_id: &str) -> Result<Option<WebhookEventRecord>> {
        Ok(self.inner.read().webhook_events.get(event_id).cloned())
    }

    fn put_webhook_event(&self, record: &WebhookEventRecord) -> Result<()> {
        let mut inner = self.inner.write();
        let slot = inner
            .webhook_events
            .get_mut(&record.stripe_event_id)
            .ok_or(StoreError::NotFound)?;
        *slot = record.clone();
        Ok(())
    }

    fn list_retryable_webhook_events(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookEventRecord>> {
        let mut due: Vec<WebhookEventRecord> = self
            .inner
            .read()
            .webhook_events
            .values()
            .filter(|r| r.is_due(now))
            .cloned()
            .collect();
        sort_oldest_first(&mut due);
        due.truncate(limit);
        Ok(due)
    }

    fn list_dead_lettered_webhook_events(&self, limit: usize) -> Result<Vec<WebhookEventRecord>> {
        let mut dead: Vec<WebhookEventRecord> = self
            .inner
            .read()
            .webhook_events
            .values()
            .filter(|r| r.dead_lettered)
            .cloned()
            .collect();
        sort_oldest_first(&mut dead);
        dead.truncate(limit);
        Ok(dead)
    }

    fn get_topup_policy(&self, user_id: &UserId) -> Result<Option<AutoTopupPolicy>> {
        Ok(self.inner.read().topup_policies.get(user_id).cloned())
    }

    fn put_topup_policy(&self, policy: &AutoTopupPolicy) -> Result<()> {
        self.inner
            .write()
            .topup_policies
            .insert(policy.user_id, policy.clone());
        Ok(())
    }
}
