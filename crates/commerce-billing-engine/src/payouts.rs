//! Outbound payouts.

use commerce_billing_core::{event_types, Payout, PayoutId, PayoutStatus, Result};
use commerce_billing_store::StoreExt;

use crate::engine::BillingEngine;

impl BillingEngine {
    /// Create a pending payout.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a non-positive amount or an empty destination.
    pub fn create_payout(
        &self,
        amount: i64,
        currency: Option<&str>,
        destination: &str,
    ) -> Result<Payout> {
        let payout = Payout::new(
            amount,
            self.currency_or_default(currency),
            destination,
            self.now(),
        )?;
        self.store().transaction(|tx| {
            tx.create(&payout)?;
            self.record(tx, event_types::PAYOUT_CREATED, &payout, None)
        })?;
        self.wake_dispatcher();
        tracing::info!(
            payout_id = %payout.id,
            amount = payout.amount,
            destination = %payout.destination,
            "Payout created"
        );
        Ok(payout)
    }

    /// Get a payout.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the payout does not exist.
    pub fn get_payout(&self, id: &PayoutId) -> Result<Payout> {
        Ok(self.store().require(id.as_str())?)
    }

    /// Submit a pending payout.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, or `InvalidState` unless the payout is pending.
    pub fn mark_payout_in_transit(&self, id: &PayoutId) -> Result<Payout> {
        self.move_payout(id, PayoutStatus::InTransit, event_types::PAYOUT_IN_TRANSIT)
    }

    /// Record arrival of an in-transit payout.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, or `InvalidState` unless the payout is in transit.
    pub fn mark_payout_paid(&self, id: &PayoutId) -> Result<Payout> {
        self.move_payout(id, PayoutStatus::Paid, event_types::PAYOUT_PAID)
    }

    /// Cancel a payout that has not arrived.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, or `InvalidState` once the payout settled.
    pub fn cancel_payout(&self, id: &PayoutId) -> Result<Payout> {
        self.move_payout(id, PayoutStatus::Canceled, event_types::PAYOUT_CANCELED)
    }

    /// Fail a payout with the bank's message.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, or `InvalidState` once the payout settled.
    pub fn mark_payout_failed(&self, id: &PayoutId, message: &str) -> Result<Payout> {
        let payout = self.mutate(
            id.as_str(),
            event_types::PAYOUT_FAILED,
            |payout: &mut Payout, now| payout.fail(message, now),
        )?;
        tracing::warn!(payout_id = %payout.id, message, "Payout failed");
        Ok(payout)
    }

    fn move_payout(&self, id: &PayoutId, next: PayoutStatus, event_type: &str) -> Result<Payout> {
        let payout = self.mutate(id.as_str(), event_type, |payout: &mut Payout, now| {
            payout.transition(next, now)
        })?;
        tracing::info!(payout_id = %payout.id, status = %payout.status, "Payout updated");
        Ok(payout)
    }
}
