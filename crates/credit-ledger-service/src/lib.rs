//! Credit ledger engine.
//!
//! This crate runs the credit ledger on top of a [`credit_ledger_store::Store`]:
//!
//! - Ledger writes serialized per user with compare-and-swap commits
//! - Purchases priced and checked against role limits
//! - Usage debits, refunds and expiry
//! - Auto-topup evaluation and policy management
//! - Gateway webhook reconciliation with dedup, retries and dead-lettering
//!
//! # Construction
//!
//! There is no global state. A process builds one [`CreditService`] from a
//! store and a [`ServiceConfig`] and shares it (usually behind an `Arc`).
//!
//! # Webhooks
//!
//! Payloads are verified against the configured gateway secret before
//! anything else happens. Without a secret every webhook is rejected.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod crypto;
pub mod ledger;
pub mod locks;
pub mod service;
pub mod sweep;
pub mod topup;
pub mod webhooks;

pub use config::{ServiceConfig, WebhookConfig};
pub use ledger::{ApplyOptions, Ledger};
pub use service::{CreditService, UsageRequest};
pub use sweep::{SweepReport, Sweeper};
pub use topup::{AutoTopupEngine, TopupRun, TopupSettings};
pub use webhooks::WebhookProcessor;
