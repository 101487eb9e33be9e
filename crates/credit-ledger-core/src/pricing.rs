//! Credit package pricing.
//!
//! Every price shown to a user or charged through the gateway comes from
//! [`PricingConfig::calculate_purchase`] or [`PricingConfig::calculate_bulk`].
//! There is no other place that derives discounts or totals.
//!
//! # Rounding
//!
//! Each monetary component (discount, tax, processing fee) is rounded to
//! cents, midpoint away from zero, before it is added to the total. The final
//! amount is the sum of already-rounded parts, so it always reconciles with
//! the itemised quote.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Catalogue packages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PackageType {
    /// Entry package.
    Starter,
    /// Most popular package.
    Standard,
    /// Larger package for busy tradespeople.
    Professional,
    /// Bulk package.
    Enterprise,
}

impl PackageType {
    /// Every catalogue package.
    pub const ALL: [Self; 4] = [
        Self::Starter,
        Self::Standard,
        Self::Professional,
        Self::Enterprise,
    ];

    /// Stable upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starter => "STARTER",
            Self::Standard => "STANDARD",
            Self::Professional => "PROFESSIONAL",
            Self::Enterprise => "ENTERPRISE",
        }
    }
}

impl fmt::Display for PackageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PackageType {
    type Err = PricingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| PricingError::UnknownPackage(s.to_string()))
    }
}

/// A package as listed in the price table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditPackage {
    /// Which package.
    pub package_type: PackageType,
    /// Credits bought.
    pub credits_amount: u64,
    /// Extra credits granted on top.
    pub bonus_credits: u64,
    /// Price before discount, tax and fees.
    pub price: Decimal,
    /// Days until purchased credits expire, if they do.
    pub validity_days: Option<u32>,
}

/// Read-only price table lookup.
pub trait PackageCatalogue: Send + Sync {
    /// Find a package, `None` if it is not sold.
    fn get_package(&self, package_type: PackageType) -> Option<CreditPackage>;
}

/// Price table held in memory.
#[derive(Debug, Clone)]
pub struct StaticCatalogue {
    packages: HashMap<PackageType, CreditPackage>,
}

impl StaticCatalogue {
    /// Build a catalogue from explicit packages.
    #[must_use]
    pub fn new(packages: impl IntoIterator<Item = CreditPackage>) -> Self {
        Self {
            packages: packages
                .into_iter()
                .map(|p| (p.package_type, p))
                .collect(),
        }
    }
}

impl Default for StaticCatalogue {
    fn default() -> Self {
        let package = |package_type, credits_amount, bonus_credits, price| CreditPackage {
            package_type,
            credits_amount,
            bonus_credits,
            price,
            validity_days: Some(365),
        };
        Self::new([
            package(PackageType::Starter, 10, 0, dec!(9.99)),
            package(PackageType::Standard, 25, 5, dec!(19.99)),
            package(PackageType::Professional, 50, 15, dec!(34.99)),
            package(PackageType::Enterprise, 100, 40, dec!(59.99)),
        ])
    }
}

impl PackageCatalogue for StaticCatalogue {
    fn get_package(&self, package_type: PackageType) -> Option<CreditPackage> {
        self.packages.get(&package_type).cloned()
    }
}

/// Automatic discount applied once the base price reaches `min_amount`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscountTier {
    /// Minimum base price for the tier to apply.
    pub min_amount: Decimal,
    /// Discount as a fraction (0.10 = 10%).
    pub percent: Decimal,
}

/// A promotional code. Competes with the automatic tiers; the best single
/// discount wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoCode {
    /// Discount as a fraction.
    pub percent: Decimal,
    /// Minimum base price for the code to apply.
    pub min_amount: Decimal,
}

/// Bonus schedule for ad-hoc bulk purchases: `(min_credits, bonus_percent)`.
const BULK_BONUS_SCHEDULE: [(u64, u64); 4] = [(100, 30), (50, 20), (25, 15), (10, 10)];

/// Pricing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Sales tax rate applied to the discounted subtotal.
    pub tax_rate: Decimal,
    /// Gateway processing fee rate applied to the discounted subtotal.
    pub processing_fee_rate: Decimal,
    /// Automatic discount thresholds.
    pub discount_tiers: Vec<DiscountTier>,
    /// Promotional codes, keyed upper-case.
    pub promo_codes: HashMap<String, PromoCode>,
    /// Price per credit for bulk purchases.
    pub bulk_unit_price: Decimal,
    /// ISO currency code; the ledger is single-currency.
    pub currency: String,
}

impl Default for PricingConfig {
    fn default() -> Self {
        let mut promo_codes = HashMap::new();
        promo_codes.insert(
            "WELCOME10".to_string(),
            PromoCode {
                percent: dec!(0.10),
                min_amount: Decimal::ZERO,
            },
        );
        promo_codes.insert(
            "TRADIE20".to_string(),
            PromoCode {
                percent: dec!(0.20),
                min_amount: dec!(30.00),
            },
        );

        Self {
            tax_rate: dec!(0.10),
            processing_fee_rate: dec!(0.029),
            discount_tiers: vec![
                DiscountTier {
                    min_amount: dec!(50.00),
                    percent: dec!(0.05),
                },
                DiscountTier {
                    min_amount: dec!(100.00),
                    percent: dec!(0.10),
                },
            ],
            promo_codes,
            bulk_unit_price: dec!(0.80),
            currency: "USD".to_string(),
        }
    }
}

/// Itemised price for a purchase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseQuote {
    /// Package priced, `None` for bulk purchases.
    pub package_type: Option<PackageType>,
    /// Credits bought.
    pub base_credits: u64,
    /// Bonus credits granted.
    pub bonus_credits: u64,
    /// `base_credits + bonus_credits`.
    pub total_credits: u64,
    /// Price before discount.
    pub base_price: Decimal,
    /// Winning discount rate.
    pub discount_percent: Decimal,
    /// Discount amount.
    pub discount: Decimal,
    /// Tax amount.
    pub tax: Decimal,
    /// Processing fee amount.
    pub processing_fee: Decimal,
    /// Amount charged.
    pub final_amount: Decimal,
    /// `final_amount / total_credits`, four decimal places.
    pub price_per_credit: Decimal,
    /// Promo code that won, if any.
    pub promo_code: Option<String>,
    /// Days until the credits expire.
    pub validity_days: Option<u32>,
}

/// Pricing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PricingError {
    /// The package is not in the catalogue.
    #[error("unknown package: {0}")]
    UnknownPackage(String),

    /// The promo code does not exist.
    #[error("unknown promo code: {0}")]
    UnknownPromoCode(String),

    /// Bulk purchases need at least one credit.
    #[error("bulk purchase must be at least one credit")]
    EmptyBulkPurchase,

    /// The package grants no credits, or more than can be counted.
    #[error("package {0} grants an unusable number of credits")]
    InvalidPackageCredits(String),
}

fn round_cents(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Bonus credits for an ad-hoc bulk quantity, floored.
#[must_use]
pub fn bulk_bonus_credits(credits: u64) -> u64 {
    BULK_BONUS_SCHEDULE
        .iter()
        .find(|(min, _)| credits >= *min)
        .map_or(0, |(_, percent)| credits * percent / 100)
}

impl PricingConfig {
    /// Price a catalogue package.
    ///
    /// # Errors
    ///
    /// Returns [`PricingError::UnknownPackage`] when the catalogue does not
    /// list the package, [`PricingError::InvalidPackageCredits`] when it
    /// lists it without credits, and [`PricingError::UnknownPromoCode`] for
    /// an unrecognised code.
    pub fn calculate_purchase(
        &self,
        catalogue: &dyn PackageCatalogue,
        package_type: PackageType,
        promo_code: Option<&str>,
    ) -> Result<PurchaseQuote, PricingError> {
        let package = catalogue
            .get_package(package_type)
            .ok_or_else(|| PricingError::UnknownPackage(package_type.to_string()))?;

        self.quote(
            Some(package_type),
            package.credits_amount,
            package.bonus_credits,
            package.price,
            promo_code,
            package.validity_days,
        )
    }

    /// Price an arbitrary number of credits at the bulk unit price.
    ///
    /// # Errors
    ///
    /// Returns [`PricingError::EmptyBulkPurchase`] for zero credits and
    /// [`PricingError::UnknownPromoCode`] for an unrecognised code.
    pub fn calculate_bulk(
        &self,
        credits: u64,
        promo_code: Option<&str>,
    ) -> Result<PurchaseQuote, PricingError> {
        if credits == 0 {
            return Err(PricingError::EmptyBulkPurchase);
        }
        let base_price = round_cents(Decimal::from(credits) * self.bulk_unit_price);
        self.quote(
            None,
            credits,
            bulk_bonus_credits(credits),
            base_price,
            promo_code,
            None,
        )
    }

    /// Best single discount rate for `base_price`, and the promo code that
    /// produced it (if it beat the automatic tiers).
    fn best_discount(
        &self,
        base_price: Decimal,
        promo_code: Option<&str>,
    ) -> Result<(Decimal, Option<String>), PricingError> {
        let tier_percent = self
            .discount_tiers
            .iter()
            .filter(|tier| base_price >= tier.min_amount)
            .map(|tier| tier.percent)
            .max()
            .unwrap_or(Decimal::ZERO);

        let Some(code) = promo_code.map(str::trim).filter(|c| !c.is_empty()) else {
            return Ok((tier_percent, None));
        };
        let normalized = code.to_ascii_uppercase();
        let promo = self
            .promo_codes
            .get(&normalized)
            .ok_or_else(|| PricingError::UnknownPromoCode(code.to_string()))?;

        if base_price >= promo.min_amount && promo.percent > tier_percent {
            Ok((promo.percent, Some(normalized)))
        } else {
            Ok((tier_percent, None))
        }
    }

    fn quote(
        &self,
        package_type: Option<PackageType>,
        base_credits: u64,
        bonus_credits: u64,
        base_price: Decimal,
        promo_code: Option<&str>,
        validity_days: Option<u32>,
    ) -> Result<PurchaseQuote, PricingError> {
        let (discount_percent, promo_code) = self.best_discount(base_price, promo_code)?;

        let discount = round_cents(base_price * discount_percent);
        let subtotal = base_price - discount;
        let tax = round_cents(subtotal * self.tax_rate);
        let processing_fee = round_cents(subtotal * self.processing_fee_rate);
        let final_amount = subtotal + tax + processing_fee;

        let total_credits = base_credits
            .checked_add(bonus_credits)
            .filter(|total| *total > 0)
            .ok_or_else(|| {
                PricingError::InvalidPackageCredits(
                    package_type.map_or("BULK", PackageType::as_str).to_string(),
                )
            })?;
        let price_per_credit = (final_amount / Decimal::from(total_credits))
            .round_dp_with_strategy(4, RoundingStrategy::MidpointAwayFromZero);

        Ok(PurchaseQuote {
            package_type,
            base_credits,
            bonus_credits,
            total_credits,
            base_price,
            discount_percent,
            discount,
            tax,
            processing_fee,
            final_amount,
            price_per_credit,
            promo_code,
            validity_days,
        })
    }
}
