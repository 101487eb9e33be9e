//! Key encoding utilities for `RocksDB`.
//!
//! This module provides functions for encoding and decoding keys used in column families.

use credit_ledger_core::{TransactionId, UserId};

/// Create a balance or policy key from a user ID.
#[must_use]
pub fn user_key(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Create a transaction key from a transaction ID.
#[must_use]
pub fn transaction_key(transaction_id: &TransactionId) -> Vec<u8> {
    transaction_id.to_bytes().to_vec()
}

/// Create a user-transaction index key.
///
/// Format: `user_id (16 bytes) || transaction_id (16 bytes)`
///
/// Since ULIDs are time-ordered, transactions for a user will be sorted by time.
#[must_use]
pub fn user_transaction_key(user_id: &UserId, transaction_id: &TransactionId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(user_id.as_bytes());
    key.extend_from_slice(&transaction_id.to_bytes());
    key
}

/// Create a prefix for iterating all transactions for a user.
#[must_use]
pub fn user_transactions_prefix(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Create a reference index key.
///
/// Format: `reference_id || 0x00 || transaction_id (16 bytes)`
#[must_use]
pub fn reference_key(reference_id: &str, transaction_id: &TransactionId) -> Vec<u8> {
    let mut key = reference_prefix(reference_id);
    key.extend_from_slice(&transaction_id.to_bytes());
    key
}

/// Create a prefix for iterating all transactions with a reference.
#[must_use]
pub fn reference_prefix(reference_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(reference_id.len() + 17);
    key.extend_from_slice(reference_id.as_bytes());
    key.push(0);
    key
}

/// Extract the trailing transaction ID from an index key.
///
/// Returns `None` if the key is shorter than 16 bytes.
#[must_use]
pub fn trailing_transaction_id(key: &[u8]) -> Option<TransactionId> {
    let start = key.len().checked_sub(16)?;
    let bytes: [u8; 16] = key[start..].try_into().ok()?;
    Some(TransactionId::from_bytes(bytes))
}

/// Create a webhook event key from a gateway event ID.
#[must_use]
pub fn webhook_event_key(event_id: &str) -> Vec<u8> {
    event_id.as_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_key_length() {
        let user_id = UserId::generate();
        assert_eq!(user_key(&user_id).len(), 16);
    }

    #[test]
    fn user_transaction_key_format() {
        let user_id = UserId::generate();
        let tx_id = TransactionId::generate();
        let key = user_transaction_key(&user_id, &tx_id);

        assert_eq!(key.len(), 32);
        assert_eq!(&key[..16], user_id.as_bytes());
        assert_eq!(&key[16..], tx_id.to_bytes());
        assert_eq!(trailing_transaction_id(&key), Some(tx_id));
    }

    #[test]
    fn reference_prefix_does_not_match_longer_references() {
        let tx_id = TransactionId::generate();
        let key = reference_key("pi_12", &tx_id);
        assert!(key.starts_with(&reference_prefix("pi_12")));
        assert!(!key.starts_with(&reference_prefix("pi_1")));
        assert_eq!(trailing_transaction_id(&key), Some(tx_id));
    }

    #[test]
    fn short_keys_have_no_transaction_id() {
        assert_eq!(trailing_transaction_id(&[1, 2, 3]), None);
    }
}
