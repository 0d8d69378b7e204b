//! Tax regions, rates and per-invoice tax computation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{TaxRateId, TaxRegionId};

/// A billing address. Only the fields tax resolution needs are modelled.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Address {
    /// ISO country code.
    pub country: String,
    /// State or province code.
    #[serde(default)]
    pub province: String,
    /// Postal code.
    #[serde(default)]
    pub postal_code: String,
}

impl Address {
    /// Create an address for a country and province.
    #[must_use]
    pub fn new(country: impl Into<String>, province: impl Into<String>) -> Self {
        Self {
            country: country.into(),
            province: province.into(),
            postal_code: String::new(),
        }
    }
}

/// A taxing jurisdiction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxRegion {
    /// Region identifier.
    pub id: TaxRegionId,
    /// Display name.
    pub name: String,
    /// ISO country code.
    pub country: String,
    /// Province code; empty means the whole country.
    #[serde(default)]
    pub province: String,
    /// When the region was created.
    pub created_at: DateTime<Utc>,
}

impl TaxRegion {
    /// Whether an address falls inside this region.
    #[must_use]
    pub fn matches(&self, address: &Address) -> bool {
        if !self.country.eq_ignore_ascii_case(address.country.trim()) {
            return false;
        }
        let province = self.province.trim();
        province.is_empty() || province.eq_ignore_ascii_case(address.province.trim())
    }
}

/// A tax rate levied by a region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxRate {
    /// Rate identifier.
    pub id: TaxRateId,
    /// The region that levies the rate.
    pub region_id: TaxRegionId,
    /// Display name (e.g. "GST").
    pub name: String,
    /// Decimal rate, e.g. `0.0825` for 8.25%.
    pub rate: f64,
    /// When the rate was created.
    pub created_at: DateTime<Utc>,
}

/// One computed tax amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxLine {
    /// The rate that produced the line.
    pub tax_rate_id: TaxRateId,
    /// The rate's region.
    pub region_id: TaxRegionId,
    /// The rate's display name.
    pub name: String,
    /// Rate in basis points, for display.
    pub rate_bps: i64,
    /// Taxable amount in cents.
    pub taxable_amount: i64,
    /// Tax amount in cents.
    pub amount: i64,
}

/// Result of a tax computation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxCalculation {
    /// One line per applied rate.
    pub lines: Vec<TaxLine>,
    /// Sum of all line amounts.
    pub total: i64,
}

/// Compute tax on `subtotal` for an address.
///
/// No address means no tax. Every region matching the address contributes all of its rates,
/// each rounded to the nearest cent.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
pub fn calculate_tax(
    address: Option<&Address>,
    regions: &[TaxRegion],
    rates: &[TaxRate],
    subtotal: i64,
) -> TaxCalculation {
    let Some(address) = address else {
        return TaxCalculation::default();
    };

    let mut lines = Vec::new();
    for region in regions.iter().filter(|r| r.matches(address)) {
        for rate in rates.iter().filter(|r| r.region_id == region.id) {
            let amount = (subtotal as f64 * rate.rate).round() as i64;
            lines.push(TaxLine {
                tax_rate_id: rate.id.clone(),
                region_id: region.id.clone(),
                name: rate.name.clone(),
                rate_bps: (rate.rate * 10_000.0).round() as i64,
                taxable_amount: subtotal,
                amount,
            });
        }
    }

    let total = lines.iter().map(|l| l.amount).sum();
    TaxCalculation { lines, total }
}
