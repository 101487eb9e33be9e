//! Storage layer for the credit ledger.
//!
//! This crate provides durable storage for balances, transactions, webhook
//! event records and auto-topup policies behind the [`Store`] trait.
//!
//! Two implementations ship:
//!
//! - [`MemoryStore`]: in-process maps behind a single lock, always available
//! - `RocksStore`: `RocksDB` column families with CBOR values (feature
//!   `rocksdb-backend`)
//!
//! # Atomicity
//!
//! Every ledger mutation is a [`LedgerCommit`]: the balance row and the
//! transactions it touched are written together, and only if the stored
//! balance version still matches the version the writer read. A mismatch
//! fails with [`StoreError::VersionConflict`] and writes nothing.
//!
//! # Example
//!
//! ```
//! use credit_ledger_store::{MemoryStore, Store};
//! use credit_ledger_core::UserId;
//!
//! let store = MemoryStore::new();
//! assert!(store.get_balance(&UserId::generate()).unwrap().is_none());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod memory;
#[cfg(feature = "rocksdb-backend")]
pub mod rocks;
pub mod schema;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
#[cfg(feature = "rocksdb-backend")]
pub use rocks::RocksStore;

use chrono::{DateTime, Utc};
use credit_ledger_core::{
    AccountBalance, AutoTopupPolicy, Transaction, TransactionId, UserId, WebhookEventRecord,
};

/// One atomic ledger write for a single user.
#[derive(Debug, Clone)]
pub struct LedgerCommit {
    /// Account being written.
    pub user_id: UserId,
    /// Balance version the writer read (`0` when no row existed).
    pub expected_version: u64,
    /// New balance row. Its version is set by the store.
    pub balance: AccountBalance,
    /// Transactions created or updated by this write.
    pub transactions: Vec<Transaction>,
}

impl LedgerCommit {
    /// Start a commit from the balance the writer read.
    #[must_use]
    pub fn new(balance: AccountBalance) -> Self {
        Self {
            user_id: balance.user_id,
            expected_version: balance.version,
            balance,
            transactions: Vec::new(),
        }
    }

    /// Add a created or updated transaction.
    #[must_use]
    pub fn with_transaction(mut self, transaction: Transaction) -> Self {
        self.transactions.push(transaction);
        self
    }

    /// Check that every transaction belongs to the committed user.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ForeignTransaction`] otherwise.
    pub fn validate(&self) -> Result<()> {
        match self.transactions.iter().find(|tx| tx.user_id != self.user_id) {
            Some(tx) => Err(StoreError::ForeignTransaction {
                user_id: self.user_id,
                transaction_id: tx.id.to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// The storage trait defining all database operations.
///
/// This trait abstracts the storage layer, allowing for different implementations
/// (e.g., `RocksDB`, in-memory for testing).
pub trait Store: Send + Sync {
    // =========================================================================
    // Balance Operations
    // =========================================================================

    /// Get a balance row by user ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_balance(&self, user_id: &UserId) -> Result<Option<AccountBalance>>;

    /// Write a balance row and its transactions atomically, bumping the
    /// balance version. Returns the stored balance.
    ///
    /// # Errors
    ///
    /// - `StoreError::VersionConflict` if the stored version is not
    ///   `commit.expected_version`.
    /// - `StoreError::ForeignTransaction` if a transaction belongs to another user.
    fn commit(&self, commit: LedgerCommit) -> Result<AccountBalance>;

    // =========================================================================
    // Transaction Operations
    // =========================================================================

    /// Get a transaction by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_transaction(&self, transaction_id: &TransactionId) -> Result<Option<Transaction>>;

    /// List transactions for a user, ordered by time (newest first).
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_transactions_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Transaction>>;

    /// Transactions for a user created at or after `since`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn transactions_since(&self, user_id: &UserId, since: DateTime<Utc>)
        -> Result<Vec<Transaction>>;

    /// Transactions whose `reference_id` equals `reference_id`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn transactions_by_reference(&self, reference_id: &str) -> Result<Vec<Transaction>>;

    /// Pending transactions created before `cutoff`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_pending_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Transaction>>;

    /// Every pending transaction of a user, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_pending_by_user(&self, user_id: &UserId) -> Result<Vec<Transaction>>;

    // =========================================================================
    // Webhook Event Operations
    // =========================================================================

    /// Insert a webhook event record unless one with the same
    /// `stripe_event_id` exists. Returns whether it was inserted.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn insert_webhook_event(&self, record: &WebhookEventRecord) -> Result<bool>;

    /// Get a webhook event record by gateway event ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_webhook_event(&self, event_id: &str) -> Result<Option<WebhookEventRecord>>;

    /// Overwrite an existing webhook event record.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if no record exists.
    fn put_webhook_event(&self, record: &WebhookEventRecord) -> Result<()>;

    /// Unprocessed, non-dead-lettered records due for retry at `now`,
    /// oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_retryable_webhook_events(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookEventRecord>>;

    /// Dead-lettered records, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_dead_lettered_webhook_events(&self, limit: usize) -> Result<Vec<WebhookEventRecord>>;

    // =========================================================================
    // Auto-Topup Policy Operations
    // =========================================================================

    /// Get a user's auto-topup policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_topup_policy(&self, user_id: &UserId) -> Result<Option<AutoTopupPolicy>>;

    /// Insert or update an auto-topup policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_topup_policy(&self, policy: &AutoTopupPolicy) -> Result<()>;
}

fn sort_oldest_first(records: &mut [WebhookEventRecord]) {
    records.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.stripe_event_id.cmp(&b.stripe_event_id))
    });
}
