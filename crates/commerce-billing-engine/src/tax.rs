//! Tax regions and rates.

use commerce_billing_core::{
    calculate_tax, Address, BillingError, Result, TaxCalculation, TaxRate, TaxRateId, TaxRegion,
    TaxRegionId,
};
use commerce_billing_store::StoreExt;

use crate::engine::{BillingEngine, Tx};

impl BillingEngine {
    /// Register a tax region. An empty `province` makes it a country-wide fallback.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the name or country is empty.
    pub fn create_tax_region(
        &self,
        name: &str,
        country: &str,
        province: &str,
    ) -> Result<TaxRegion> {
        if name.trim().is_empty() {
            return Err(BillingError::validation("tax region name is required"));
        }
        if country.trim().is_empty() {
            return Err(BillingError::validation("tax region country is required"));
        }
        let region = TaxRegion {
            id: TaxRegionId::generate(),
            name: name.to_string(),
            country: country.trim().to_string(),
            province: province.trim().to_string(),
            created_at: self.now(),
        };
        self.store().create(&region)?;
        tracing::info!(
            region_id = %region.id,
            country = %region.country,
            province = %region.province,
            "Tax region created"
        );
        Ok(region)
    }

    /// Add a rate (a fraction, `0.07` for 7%) to a region.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the region does not exist.
    /// - `Validation` if the rate is outside `0..=1`.
    pub fn create_tax_rate(
        &self,
        region_id: &TaxRegionId,
        name: &str,
        rate: f64,
    ) -> Result<TaxRate> {
        if !(0.0..=1.0).contains(&rate) {
            return Err(BillingError::validation(format!(
                "tax rate must be between 0 and 1, got {rate}"
            )));
        }
        let tax_rate = TaxRate {
            id: TaxRateId::generate(),
            region_id: region_id.clone(),
            name: name.to_string(),
            rate,
            created_at: self.now(),
        };
        self.store().transaction(|tx| {
            tx.require::<TaxRegion>(region_id.as_str())?;
            tx.create(&tax_rate)
        })?;
        tracing::info!(rate_id = %tax_rate.id, region_id = %region_id, rate, "Tax rate created");
        Ok(tax_rate)
    }

    /// Tax on `subtotal` for `address`. No address means no tax.
    ///
    /// # Errors
    ///
    /// Returns a storage error if regions or rates cannot be read.
    pub fn calculate_invoice_tax(
        &self,
        address: Option<&Address>,
        subtotal: i64,
    ) -> Result<TaxCalculation> {
        self.store()
            .transaction(|tx| self.tax_in(tx, address, subtotal))
    }

    pub(crate) fn tax_in(
        &self,
        tx: &mut Tx<'_>,
        address: Option<&Address>,
        subtotal: i64,
    ) -> Result<TaxCalculation> {
        if address.is_none() {
            return Ok(TaxCalculation::default());
        }
        let regions = tx.get_all::<TaxRegion>()?;
        let rates = tx.get_all::<TaxRate>()?;
        Ok(calculate_tax(address, &regions, &rates, subtotal))
    }
}
