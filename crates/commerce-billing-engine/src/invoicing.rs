//! Invoice operations.
//!
//! Each operation loads the invoice, applies one state-machine step from
//! `commerce_billing_core::invoice`, stores the result and records the matching event in the
//! same transaction.

use chrono::{DateTime, Utc};

use commerce_billing_core::{
    event_types, Address, BillingError, BillingInvoice, CustomerId, InvoiceId, LineItem, Result,
    SubscriptionId,
};
use commerce_billing_store::StoreExt;

use crate::engine::BillingEngine;
use crate::events::snapshot;

/// Parameters for a new draft invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInvoice {
    /// Billed customer.
    pub customer_id: CustomerId,
    /// Currency; the engine default when `None`.
    pub currency: Option<String>,
    /// Subscription and billing period the invoice covers.
    pub subscription: Option<(SubscriptionId, DateTime<Utc>, DateTime<Utc>)>,
}

impl NewInvoice {
    /// A one-off invoice in the default currency.
    #[must_use]
    pub fn for_customer(customer_id: impl Into<CustomerId>) -> Self {
        Self {
            customer_id: customer_id.into(),
            currency: None,
            subscription: None,
        }
    }

    /// Use `currency`.
    #[must_use]
    pub fn currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = Some(currency.into());
        self
    }

    /// Link to a subscription period.
    #[must_use]
    pub fn for_subscription(
        mut self,
        subscription_id: SubscriptionId,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Self {
        self.subscription = Some((subscription_id, period_start, period_end));
        self
    }
}

impl BillingEngine {
    /// Create a draft invoice.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for an empty customer id or a period that ends before it starts.
    pub fn create_invoice(&self, params: NewInvoice) -> Result<BillingInvoice> {
        if params.customer_id.is_empty() {
            return Err(BillingError::validation("customer_id is required"));
        }
        let currency = self.currency_or_default(params.currency.as_deref());
        let mut invoice = BillingInvoice::draft(params.customer_id, currency, self.now());
        if let Some((subscription_id, start, end)) = params.subscription {
            if end < start {
                return Err(BillingError::validation("invoice period ends before it starts"));
            }
            invoice = invoice.for_subscription(subscription_id, start, end);
        }

        self.store().transaction(|tx| {
            tx.create(&invoice)?;
            self.record(tx, event_types::INVOICE_CREATED, &invoice, None)
        })?;
        self.wake_dispatcher();
        tracing::info!(
            invoice_id = %invoice.id,
            customer_id = %invoice.customer_id,
            "Invoice created"
        );
        Ok(invoice)
    }

    /// Get an invoice.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the invoice does not exist.
    pub fn get_invoice(&self, invoice_id: &InvoiceId) -> Result<BillingInvoice> {
        Ok(self.store().require(invoice_id.as_str())?)
    }

    /// A customer's invoices, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the scan fails.
    pub fn list_invoices(&self, customer_id: &CustomerId) -> Result<Vec<BillingInvoice>> {
        let mut invoices = self
            .store()
            .query::<BillingInvoice>(|i| i.customer_id == *customer_id)?;
        invoices.sort_by_key(|i| i.created_at);
        Ok(invoices)
    }

    /// Append a line item to a draft.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the invoice does not exist.
    /// - `InvalidState` unless the invoice is a draft.
    pub fn add_invoice_line_item(
        &self,
        invoice_id: &InvoiceId,
        item: LineItem,
    ) -> Result<BillingInvoice> {
        self.mutate(
            invoice_id.as_str(),
            event_types::INVOICE_UPDATED,
            |invoice: &mut BillingInvoice, _| invoice.add_line_item(item),
        )
    }

    /// Finalize a draft, computing tax first when an address is given.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the invoice does not exist.
    /// - `InvalidState` unless the invoice is a draft.
    pub fn finalize_invoice(
        &self,
        invoice_id: &InvoiceId,
        address: Option<&Address>,
    ) -> Result<BillingInvoice> {
        let invoice = self.store().transaction(|tx| {
            let mut invoice: BillingInvoice = tx.require(invoice_id.as_str())?;
            let previous = snapshot(&invoice)?;
            if address.is_some() {
                let tax = self.tax_in(tx, address, invoice.subtotal)?;
                invoice.set_tax(tax.lines)?;
            }
            invoice.finalize(self.now())?;
            tx.update(&invoice)?;
            self.record(tx, event_types::INVOICE_FINALIZED, &invoice, Some(previous))?;
            Ok::<_, BillingError>(invoice)
        })?;
        self.wake_dispatcher();
        tracing::info!(
            invoice_id = %invoice.id,
            amount_due = invoice.amount_due,
            tax = invoice.tax,
            "Invoice finalized"
        );
        Ok(invoice)
    }

    /// Mark an open invoice paid outside the collection waterfall.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the invoice does not exist.
    /// - `InvalidState` unless the invoice is open.
    pub fn mark_invoice_paid(
        &self,
        invoice_id: &InvoiceId,
        method: &str,
        reference: Option<String>,
    ) -> Result<BillingInvoice> {
        let invoice = self.mutate(
            invoice_id.as_str(),
            event_types::INVOICE_PAID,
            |invoice: &mut BillingInvoice, now| invoice.mark_paid(method, reference, now),
        )?;
        tracing::info!(invoice_id = %invoice.id, method, "Invoice marked paid");
        Ok(invoice)
    }

    /// Void a draft or open invoice.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the invoice does not exist.
    /// - `InvalidState` from any other status.
    pub fn void_invoice(&self, invoice_id: &InvoiceId) -> Result<BillingInvoice> {
        let invoice = self.mutate(
            invoice_id.as_str(),
            event_types::INVOICE_VOIDED,
            |invoice: &mut BillingInvoice, now| invoice.mark_void(now),
        )?;
        tracing::info!(invoice_id = %invoice.id, "Invoice voided");
        Ok(invoice)
    }

    /// Write off an open invoice.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the invoice does not exist.
    /// - `InvalidState` unless the invoice is open.
    pub fn mark_invoice_uncollectible(&self, invoice_id: &InvoiceId) -> Result<BillingInvoice> {
        let invoice = self.mutate(
            invoice_id.as_str(),
            event_types::INVOICE_MARKED_UNCOLLECTIBLE,
            |invoice: &mut BillingInvoice, _| invoice.mark_uncollectible(),
        )?;
        tracing::warn!(
            invoice_id = %invoice.id,
            amount_due = invoice.amount_due,
            "Invoice marked uncollectible"
        );
        Ok(invoice)
    }
}
