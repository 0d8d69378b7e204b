//! Payment collection waterfall.
//!
//! An open invoice is settled from, in order: prepaid credits (through the injected
//! [`CreditBurner`](crate::processor::CreditBurner)) and the customer balance. Whatever is
//! left is reported as insufficient funds.
//!
//! The whole waterfall runs in one transaction, burner writes included, so credits are
//! only consumed by an attempt that is recorded on the invoice. A failing burner aborts the
//! attempt with a retryable error; a failing balance application is logged and skipped.
//!
//! Partial collections accumulate in `amount_paid`, so a later attempt only asks for what
//! is still outstanding.

use commerce_billing_core::{
    event_types, BillingError, BillingInvoice, InvoiceId, InvoiceStatus, LineItemKind, Result,
};
use commerce_billing_store::StoreExt;

use crate::engine::{BillingEngine, Tx};
use crate::events::snapshot;

/// Message reported when the waterfall leaves an amount unpaid.
pub const INSUFFICIENT_FUNDS: &str = "insufficient funds";

/// Outcome of one collection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionResult {
    /// The invoice collected against.
    pub invoice_id: InvoiceId,
    /// Whether the invoice is now paid.
    pub success: bool,
    /// Amount covered by burning credits.
    pub credit_used: i64,
    /// Amount taken from the customer balance.
    pub balance_used: i64,
    /// `amount_due - remaining`.
    pub amount_charged: i64,
    /// Amount still owed.
    pub remaining: i64,
    /// Failure message.
    pub message: Option<String>,
}

impl BillingEngine {
    /// Run the collection waterfall for an open invoice.
    ///
    /// Every call counts as an attempt on the invoice, successful or not.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the invoice does not exist.
    /// - `InvalidState` unless the invoice is open.
    /// - `External` if the credit burner fails; nothing is recorded then.
    pub fn collect_invoice(&self, invoice_id: &InvoiceId) -> Result<CollectionResult> {
        let (invoice, result) = self.store().transaction(|tx| {
            let mut invoice: BillingInvoice = tx.require(invoice_id.as_str())?;
            ensure_open(&invoice)?;
            let previous = snapshot(&invoice)?;
            let now = self.now();

            let credit_used = self.burn_credits(tx, &invoice)?;

            let mut remaining = (outstanding(&invoice) - credit_used).max(0);
            let balance_used = match self.apply_balance_in(
                tx,
                &invoice.customer_id,
                Some(invoice.currency.as_str()),
                remaining,
                Some(&invoice.id),
            ) {
                Ok(applied) => applied.applied,
                Err(e) => {
                    tracing::warn!(
                        invoice_id = %invoice.id,
                        error = %e,
                        "Balance application failed, skipping"
                    );
                    0
                }
            };
            remaining -= balance_used;

            invoice.record_attempt(now);
            let collected = credit_used.saturating_add(balance_used);
            invoice.credit_applied = invoice.credit_applied.saturating_add(collected);
            invoice.amount_paid = invoice.amount_paid.saturating_add(collected);

            let success = remaining == 0;
            if success {
                let method = if balance_used == 0 && credit_used > 0 {
                    "credit"
                } else {
                    "balance"
                };
                invoice.mark_paid(method, None, now)?;
            }
            tx.update(&invoice)?;
            let event_type = if success {
                event_types::INVOICE_PAID
            } else {
                event_types::INVOICE_PAYMENT_FAILED
            };
            self.record(tx, event_type, &invoice, Some(previous))?;

            let result = CollectionResult {
                invoice_id: invoice.id.clone(),
                success,
                credit_used,
                balance_used,
                amount_charged: invoice.amount_due - remaining,
                remaining,
                message: (!success).then(|| INSUFFICIENT_FUNDS.to_string()),
            };
            Ok::<_, BillingError>((invoice, result))
        })?;
        self.wake_dispatcher();

        if result.success {
            tracing::info!(
                invoice_id = %invoice.id,
                credit_used = result.credit_used,
                balance_used = result.balance_used,
                "Invoice collected"
            );
        } else {
            tracing::warn!(
                invoice_id = %invoice.id,
                attempt = invoice.attempt_count,
                remaining = result.remaining,
                "Invoice collection failed: insufficient funds"
            );
        }
        Ok(result)
    }

    /// Burn credits toward the invoice, returning the amount covered.
    fn burn_credits(&self, tx: &mut Tx<'_>, invoice: &BillingInvoice) -> Result<i64> {
        let amount = outstanding(invoice);
        let Some(burner) = self.credit_burner() else {
            return Ok(0);
        };
        if amount <= 0 {
            return Ok(0);
        }
        let meter_id = invoice
            .line_items
            .iter()
            .find(|l| l.kind == LineItemKind::Usage)
            .and_then(|l| l.meter_id.as_ref());

        match burner.burn(tx, &invoice.customer_id, amount, meter_id) {
            Ok(left) => {
                let burned = amount - left.clamp(0, amount);
                tracing::debug!(invoice_id = %invoice.id, burned, "Credits burned");
                Ok(burned)
            }
            Err(e) => {
                tracing::warn!(
                    invoice_id = %invoice.id,
                    error = %e,
                    "Credit burn failed, attempt aborted"
                );
                Err(BillingError::external("credit_burner", e.to_string()))
            }
        }
    }
}

fn outstanding(invoice: &BillingInvoice) -> i64 {
    (invoice.amount_due - invoice.amount_paid).max(0)
}

fn ensure_open(invoice: &BillingInvoice) -> Result<()> {
    if invoice.status == InvoiceStatus::Open {
        Ok(())
    } else {
        Err(BillingError::invalid_state("invoice", invoice.status, "collect"))
    }
}
