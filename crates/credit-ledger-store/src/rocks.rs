//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait.
//! Values are CBOR. Writes that must be checked against current state
//! (versioned commits, webhook insert-if-absent) are serialized by a
//! process-local write lock and applied as one `WriteBatch`.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded,
    Options, WriteBatch,
};

use credit_ledger_core::{
    AccountBalance, AutoTopupPolicy, Transaction, TransactionId, TransactionStatus, UserId,
    WebhookEventRecord,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::{sort_oldest_first, LedgerCommit, Store};

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
        })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn get<T: serde::de::DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        self.db
            .get_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    /// Keys in `cf_name` starting with `prefix`, in key order.
    fn keys_with_prefix(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        let cf = self.cf(cf_name)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, rocksdb::Direction::Forward));

        let mut found = Vec::new();
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            found.push(key.to_vec());
        }
        Ok(found)
    }

    /// Load the transactions referenced by the trailing ids of index keys.
    fn load_indexed(&self, index_keys: impl IntoIterator<Item = Vec<u8>>) -> Result<Vec<Transaction>> {
        let mut transactions = Vec::new();
        for key in index_keys {
            let Some(tx_id) = keys::trailing_transaction_id(&key) else {
                continue;
            };
            if let Some(tx) = self.get_transaction(&tx_id)? {
                transactions.push(tx);
            }
        }
        Ok(transactions)
    }

    fn all_webhook_events(&self) -> Result<Vec<WebhookEventRecord>> {
        let cf = self.cf(cf::WEBHOOK_EVENTS)?;
        let mut records = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            records.push(Self::deserialize(&value)?);
        }
        Ok(records)
    }
}

impl Store for RocksStore {
    // =========================================================================
    // Balance Operations
    // =========================================================================

    fn get_balance(&self, user_id: &UserId) -> Result<Option<AccountBalance>> {
        self.get(cf::BALANCES, &keys::user_key(user_id))
    }

    fn commit(&self, commit: LedgerCommit) -> Result<AccountBalance> {
        commit.validate()?;
        let _guard = self.write_lock.lock();

        let actual = self.get_balance(&commit.user_id)?.map_or(0, |b| b.version);
        if actual != commit.expected_version {
            return Err(StoreError::VersionConflict {
                user_id: commit.user_id,
                expected: commit.expected_version,
                actual,
            });
        }

        let cf_balances = self.cf(cf::BALANCES)?;
        let cf_tx = self.cf(cf::TRANSACTIONS)?;
        let cf_by_user = self.cf(cf::TRANSACTIONS_BY_USER)?;
        let cf_by_reference = self.cf(cf::TRANSACTIONS_BY_REFERENCE)?;
        let cf_pending = self.cf(cf::PENDING_TRANSACTIONS)?;

        let mut batch = WriteBatch::default();
        for tx in &commit.transactions {
            let tx_key = keys::transaction_key(&tx.id);

            // Drop a stale reference index entry.
            if let Some(previous) = self.get_transaction(&tx.id)? {
                if let Some(old_reference) = previous.reference_id {
                    if tx.reference_id.as_deref() != Some(old_reference.as_str()) {
                        batch.delete_cf(&cf_by_reference, keys::reference_key(&old_reference, &tx.id));
                    }
                }
            }
            if let Some(reference) = &tx.reference_id {
                batch.put_cf(&cf_by_reference, keys::reference_key(reference, &tx.id), []);
            }
            if tx.status == TransactionStatus::Pending {
                batch.put_cf(&cf_pending, &tx_key, []);
            } else {
                batch.delete_cf(&cf_pending, &tx_key);
            }
            batch.put_cf(&cf_by_user, keys::user_transaction_key(&tx.user_id, &tx.id), []);
            batch.put_cf(&cf_tx, &tx_key, Self::serialize(tx)?);
        }

        let mut balance = commit.balance;
        balance.version = actual + 1;
        batch.put_cf(
            &cf_balances,
            keys::user_key(&commit.user_id),
            Self::serialize(&balance)?,
        );

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(balance)
    }

    // =========================================================================
    // Transaction Operations
    // =========================================================================

    fn get_transaction(&self, transaction_id: &TransactionId) -> Result<Option<Transaction>> {
        self.get(cf::TRANSACTIONS, &keys::transaction_key(transaction_id))
    }

    fn list_transactions_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Transaction>> {
        let prefix = keys::user_transactions_prefix(user_id);
        // ULIDs are time-ordered; reverse for newest first.
        let mut all_keys = self.keys_with_prefix(cf::TRANSACTIONS_BY_USER, &prefix)?;
        all_keys.reverse();
        self.load_indexed(all_keys.into_iter().skip(offset).take(limit))
    }

    fn transactions_since(
        &self,
        user_id: &UserId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Transaction>> {
        let prefix = keys::user_transactions_prefix(user_id);
        let mut found = self.load_indexed(self.keys_with_prefix(cf::TRANSACTIONS_BY_USER, &prefix)?)?;
        found.retain(|tx| tx.created_at >= since);
        Ok(found)
    }

    fn transactions_by_reference(&self, reference_id: &str) -> Result<Vec<Transaction>> {
        let prefix = keys::reference_prefix(reference_id);
        self.load_indexed(self.keys_with_prefix(cf::TRANSACTIONS_BY_REFERENCE, &prefix)?)
    }

    fn list_pending_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Transaction>> {
        let mut pending = self.load_indexed(self.keys_with_prefix(cf::PENDING_TRANSACTIONS, &[])?)?;
        pending.retain(|tx| tx.status == TransactionStatus::Pending && tx.created_at < cutoff);
        Ok(pending)
    }

    fn list_pending_by_user(&self, user_id: &UserId) -> Result<Vec<Transaction>> {
        let mut pending = self.load_indexed(self.keys_with_prefix(cf::PENDING_TRANSACTIONS, &[])?)?;
        pending.retain(|tx| tx.user_id == *user_id && tx.status == TransactionStatus::Pending);
        Ok(pending)
    }

    // =========================================================================
    // Webhook Event Operations
    // =========================================================================

    fn insert_webhook_event(&self, record: &WebhookEventRecord) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let cf = self.cf(cf::WEBHOOK_EVENTS)?;
        let key = keys::webhook_event_key(&record.stripe_event_id);

        let exists = self
            .db
            .get_cf(&cf, &key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .is_some();
        if exists {
            return Ok(false);
        }

        self.db
            .put_cf(&cf, key, Self::serialize(record)?)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(true)
    }

    fn get_webhook_event(&self, event_id: &str) -> Result<Option<WebhookEventRecord>> {
        self.get(cf::WEBHOOK_EVENTS, &keys::webhook_event_key(event_id))
    }

    fn put_webhook_event(&self, record: &WebhookEventRecord) -> Result<()> {
        let _guard = self.write_lock.lock();
        let cf = self.cf(cf::WEBHOOK_EVENTS)?;
        let key = keys::webhook_event_key(&record.stripe_event_id);

        if self
            .db
            .get_cf(&cf, &key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .is_none()
        {
            return Err(StoreError::NotFound);
        }

        self.db
            .put_cf(&cf, key, Self::serialize(record)?)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn list_retryable_webhook_events(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookEventRecord>> {
        let mut due = self.all_webhook_events()?;
        due.retain(|r| r.is_due(now));
        sort_oldest_first(&mut due);
        due.truncate(limit);
        Ok(due)
    }

    fn list_dead_lettered_webhook_events(&self, limit: usize) -> Result<Vec<WebhookEventRecord>> {
        let mut dead = self.all_webhook_events()?;
        dead.retain(|r| r.dead_lettered);
        sort_oldest_first(&mut dead);
        dead.truncate(limit);
        Ok(dead)
    }

    // =========================================================================
    // Auto-Topup Policy Operations
    // =========================================================================

    fn get_topup_policy(&self, user_id: &UserId) -> Result<Option<AutoTopupPolicy>> {
        self.get(cf::TOPUP_POLICIES, &keys::user_key(user_id))
    }

    fn put_topup_policy(&self, policy: &AutoTopupPolicy) -> Result<()> {
        let cf = self.cf(cf::TOPUP_POLICIES)?;
        self.db
            .put_cf(&cf, keys::user_key(&policy.user_id), Self::serialize(policy)?)
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}
