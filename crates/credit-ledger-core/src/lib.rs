//! Core types and rules for the credit ledger.
//!
//! This crate is pure: no I/O, no clocks, no locks. Everything that needs
//! the current time takes it as an argument.
//!
//! - **Identifiers**: `UserId`, `TransactionId`
//! - **Ledger**: `Transaction`, `TransactionStatus`, `AccountBalance`
//! - **Pricing**: `PricingConfig`, `PackageCatalogue`, `PurchaseQuote`
//! - **Limits**: role limits, usage costs and the pure validators
//! - **Auto-topup**: `AutoTopupPolicy`, `TopupDecision`
//! - **Webhooks**: `GatewayEvent`, `WebhookEventRecord`, `ProcessingResult`
//!
//! # Credits
//!
//! Credits are whole units stored as `u64`. Money (package prices, tax,
//! fees) is `rust_decimal::Decimal`, rounded to cents per component.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod balance;
pub mod error;
pub mod ids;
pub mod limits;
pub mod metadata;
pub mod pricing;
pub mod topup;
pub mod transaction;
pub mod webhook;

pub use balance::AccountBalance;
pub use error::{CreditError, ErrorKind, Result};
pub use ids::{IdError, TransactionId, UserId};
pub use limits::{
    CreditLimitsConfig, DefaultLimits, GlobalLimits, LimitsProvider, PurchaseCounters,
    RefundPolicy, Role, UsageCosts, UsageType, ValidationReport, ValidationResult,
};
pub use metadata::{Metadata, MetadataError};
pub use pricing::{
    CreditPackage, PackageCatalogue, PackageType, PricingConfig, PricingError, PurchaseQuote,
    StaticCatalogue,
};
pub use topup::{AutoTopupConfig, AutoTopupPolicy, SkipReason, TopupDecision, TopupStatus};
pub use transaction::{Direction, Transaction, TransactionStatus, TransactionType};
pub use webhook::{
    GatewayEvent, GatewayEventKind, ProcessingResult, RefundEntry, WebhookEventRecord,
    WebhookOutcome,
};

impl From<MetadataError> for CreditError {
    fn from(err: MetadataError) -> Self {
        Self::validation(err.to_string())
    }
}

impl From<PricingError> for CreditError {
    fn from(err: PricingError) -> Self {
        Self::validation(err.to_string())
    }
}
