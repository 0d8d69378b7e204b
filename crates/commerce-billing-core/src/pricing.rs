//! Usage pricing models.
//!
//! A [`PricingRule`] turns an aggregated usage quantity into a cost in cents. Three models are
//! supported:
//!
//! - **Per unit**: every unit costs `unit_price`.
//! - **Tiered**: units fill tiers in order, each tier billing its own units at its own price.
//! - **Volume**: the whole quantity is billed at the price of the single tier it falls into.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{MeterId, PricingRuleId};

/// How usage quantity is converted into cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingModel {
    /// `quantity * unit_price`.
    PerUnit,
    /// Graduated tiers, each tier billing the units it absorbs.
    Tiered,
    /// One tier prices the entire quantity.
    Volume,
    /// Unrecognised model names price per unit.
    #[serde(other)]
    Unknown,
}

/// A pricing tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    /// Units this tier covers; `0` means unbounded (only valid on the last tier).
    pub up_to: i64,
    /// Price per unit in cents.
    pub price: i64,
    /// Flat fee in cents charged when the tier is used.
    pub flat: i64,
}

impl Tier {
    /// Create a tier.
    #[must_use]
    pub const fn new(up_to: i64, price: i64, flat: i64) -> Self {
        Self { up_to, price, flat }
    }

    /// Whether the tier absorbs any remaining quantity.
    #[must_use]
    pub const fn is_unbounded(&self) -> bool {
        self.up_to <= 0
    }
}

/// Pricing attached to a meter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingRule {
    /// Rule identifier.
    pub id: PricingRuleId,
    /// The meter this rule prices.
    pub meter_id: MeterId,
    /// Pricing model.
    pub model: PricingModel,
    /// Unit price in cents (per-unit model).
    pub unit_price: i64,
    /// Ordered tiers (tiered and volume models).
    #[serde(default)]
    pub tiers: Vec<Tier>,
    /// Three-letter currency code.
    pub currency: String,
    /// When the rule was created.
    pub created_at: DateTime<Utc>,
}

impl PricingRule {
    /// Create a per-unit rule.
    #[must_use]
    pub fn per_unit(meter_id: MeterId, unit_price: i64, currency: impl Into<String>) -> Self {
        Self {
            id: PricingRuleId::generate(),
            meter_id,
            model: PricingModel::PerUnit,
            unit_price,
            tiers: Vec::new(),
            currency: currency.into(),
            created_at: Utc::now(),
        }
    }

    /// Create a tiered or volume rule.
    #[must_use]
    pub fn with_tiers(
        meter_id: MeterId,
        model: PricingModel,
        tiers: Vec<Tier>,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            id: PricingRuleId::generate(),
            meter_id,
            model,
            unit_price: 0,
            tiers,
            currency: currency.into(),
            created_at: Utc::now(),
        }
    }

    /// Check that the tier list is well formed.
    ///
    /// Only the last tier may be unbounded, and prices may not be negative.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.unit_price < 0 {
            return Err("unit price must not be negative".into());
        }
        if matches!(self.model, PricingModel::Tiered | PricingModel::Volume)
            && self.tiers.is_empty()
        {
            return Err("tiered and volume pricing need at least one tier".into());
        }
        let last = self.tiers.len().saturating_sub(1);
        for (i, tier) in self.tiers.iter().enumerate() {
            if tier.price < 0 || tier.flat < 0 {
                return Err(format!("tier {i} has a negative price"));
            }
            if tier.is_unbounded() && i != last {
                return Err(format!("tier {i} is unbounded but is not the last tier"));
            }
        }
        Ok(())
    }

    /// Calculate the cost in cents of `quantity` units.
    #[must_use]
    pub fn calculate_cost(&self, quantity: i64) -> i64 {
        if quantity <= 0 {
            return 0;
        }
        match self.model {
            PricingModel::Tiered => tiered_cost(&self.tiers, quantity),
            PricingModel::Volume => volume_cost(&self.tiers, quantity),
            PricingModel::PerUnit | PricingModel::Unknown => {
                quantity.saturating_mul(self.unit_price)
            }
        }
    }
}

fn tiered_cost(tiers: &[Tier], quantity: i64) -> i64 {
    let mut remaining = quantity;
    let mut total: i64 = 0;
    for tier in tiers {
        if remaining <= 0 {
            break;
        }
        let units = if tier.is_unbounded() {
            remaining
        } else {
            remaining.min(tier.up_to)
        };
        total = total
            .saturating_add(units.saturating_mul(tier.price))
            .saturating_add(tier.flat);
        remaining -= units;
    }
    total
}

fn volume_cost(tiers: &[Tier], quantity: i64) -> i64 {
    let Some(tier) = tiers
        .iter()
        .find(|t| t.is_unbounded() || t.up_to >= quantity)
        .or_else(|| tiers.last())
    else {
        return 0;
    };
    tier.flat.saturating_add(quantity.saturating_mul(tier.price))
}
