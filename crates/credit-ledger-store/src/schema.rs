//! Database schema definitions and column families.
//!
//! This module defines the column families used in `RocksDB` storage.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Balance rows, keyed by `user_id`.
    pub const BALANCES: &str = "balances";

    /// Ledger transactions, keyed by `transaction_id` (ULID).
    pub const TRANSACTIONS: &str = "transactions";

    /// Index: transactions by user, keyed by `user_id || transaction_id`.
    /// Value is empty (index only).
    pub const TRANSACTIONS_BY_USER: &str = "transactions_by_user";

    /// Index: transactions by reference, keyed by
    /// `reference_id || 0x00 || transaction_id`. Value is empty.
    pub const TRANSACTIONS_BY_REFERENCE: &str = "transactions_by_reference";

    /// Index: pending transactions, keyed by `transaction_id`. Value is empty.
    pub const PENDING_TRANSACTIONS: &str = "pending_transactions";

    /// Gateway webhook events, keyed by `stripe_event_id`.
    pub const WEBHOOK_EVENTS: &str = "webhook_events";

    /// Auto-topup policies, keyed by `user_id`.
    pub const TOPUP_POLICIES: &str = "topup_policies";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::BALANCES,
        cf::TRANSACTIONS,
        cf::TRANSACTIONS_BY_USER,
        cf::TRANSACTIONS_BY_REFERENCE,
        cf::PENDING_TRANSACTIONS,
        cf::WEBHOOK_EVENTS,
        cf::TOPUP_POLICIES,
    ]
}
