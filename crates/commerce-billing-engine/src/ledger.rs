//! Customer balance ledger.
//!
//! A balance row per (customer, currency) plus an append-only list of balance transactions.
//! The balance and the transaction recording it are always written in the same store
//! transaction, so `ending_balance` on the newest entry equals the stored balance.

use commerce_billing_core::{
    event_types, BalanceTransaction, BalanceTransactionType, BillingError, CreditNoteId,
    CustomerBalance, CustomerId, InvoiceId, Result,
};
use commerce_billing_store::StoreExt;

use crate::engine::{BillingEngine, Tx};
use crate::events::snapshot;

/// A requested balance change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceAdjustment {
    /// Customer whose balance changes.
    pub customer_id: CustomerId,
    /// Currency; the engine default when `None`.
    pub currency: Option<String>,
    /// Signed amount in cents; positive credits the customer.
    pub amount: i64,
    /// Kind of change.
    pub transaction_type: BalanceTransactionType,
    /// Human-readable description.
    pub description: String,
    /// Related invoice.
    pub invoice_id: Option<InvoiceId>,
    /// Related credit note.
    pub credit_note_id: Option<CreditNoteId>,
}

impl BalanceAdjustment {
    /// A change in the default currency with no references.
    #[must_use]
    pub fn new(
        customer_id: CustomerId,
        amount: i64,
        transaction_type: BalanceTransactionType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            customer_id,
            currency: None,
            amount,
            transaction_type,
            description: description.into(),
            invoice_id: None,
            credit_note_id: None,
        }
    }

    /// Use `currency` instead of the default.
    #[must_use]
    pub fn in_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = Some(currency.into());
        self
    }

    /// Reference an invoice.
    #[must_use]
    pub fn for_invoice(mut self, invoice_id: InvoiceId) -> Self {
        self.invoice_id = Some(invoice_id);
        self
    }

    /// Reference a credit note.
    #[must_use]
    pub fn for_credit_note(mut self, credit_note_id: CreditNoteId) -> Self {
        self.credit_note_id = Some(credit_note_id);
        self
    }
}

/// Result of applying a balance to an invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedBalance {
    /// Amount taken from the balance.
    pub applied: i64,
    /// The ledger entry, absent when nothing was applied.
    pub transaction: Option<BalanceTransaction>,
}

impl AppliedBalance {
    const NONE: Self = Self {
        applied: 0,
        transaction: None,
    };
}

impl BillingEngine {
    /// Get the balance for (customer, currency), creating a zero balance on first use.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for an empty customer id, or a storage error.
    pub fn get_or_create_customer_balance(
        &self,
        customer_id: &CustomerId,
        currency: Option<&str>,
    ) -> Result<CustomerBalance> {
        require_customer(customer_id)?;
        let currency = self.currency_or_default(currency);
        self.store().transaction(|tx| {
            let key = CustomerBalance::key_for(customer_id, &currency);
            if let Some(balance) = tx.get::<CustomerBalance>(&key)? {
                return Ok(balance);
            }
            let balance = CustomerBalance::new(customer_id.clone(), currency.as_str(), self.now());
            tx.create(&balance)?;
            tracing::debug!(
                customer_id = %customer_id,
                currency = %currency,
                "Customer balance created"
            );
            Ok::<_, BillingError>(balance)
        })
    }

    /// Apply a signed change to a customer balance and record it in the ledger.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for an empty customer id or a zero amount, or a storage error.
    pub fn adjust_customer_balance(
        &self,
        adjustment: &BalanceAdjustment,
    ) -> Result<BalanceTransaction> {
        let entry = self
            .store()
            .transaction(|tx| self.adjust_balance_in(tx, adjustment))?;
        self.wake_dispatcher();
        Ok(entry)
    }

    /// Take up to `amount_due` from the customer's balance for an invoice.
    ///
    /// Applies `min(amount_due, balance)`; a balance at or below zero applies nothing and
    /// writes no ledger entry.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the balance cannot be read or written.
    pub fn apply_balance_to_invoice(
        &self,
        customer_id: &CustomerId,
        currency: Option<&str>,
        amount_due: i64,
        invoice_id: Option<&InvoiceId>,
    ) -> Result<AppliedBalance> {
        let applied = self.store().transaction(|tx| {
            self.apply_balance_in(tx, customer_id, currency, amount_due, invoice_id)
        })?;
        if applied.applied > 0 {
            self.wake_dispatcher();
        }
        Ok(applied)
    }

    /// Ledger entries for (customer, currency), newest first.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the scan fails.
    pub fn list_balance_transactions(
        &self,
        customer_id: &CustomerId,
        currency: Option<&str>,
    ) -> Result<Vec<BalanceTransaction>> {
        let currency = self.currency_or_default(currency);
        let mut entries = self.store().query::<BalanceTransaction>(|t| {
            t.customer_id == *customer_id && t.currency == currency
        })?;
        entries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.as_str().cmp(a.id.as_str()))
        });
        Ok(entries)
    }

    pub(crate) fn adjust_balance_in(
        &self,
        tx: &mut Tx<'_>,
        adjustment: &BalanceAdjustment,
    ) -> Result<BalanceTransaction> {
        require_customer(&adjustment.customer_id)?;
        if adjustment.amount == 0 {
            return Err(BillingError::validation("balance adjustment amount must be non-zero"));
        }

        let now = self.now();
        let currency = self.currency_or_default(adjustment.currency.as_deref());
        let key = CustomerBalance::key_for(&adjustment.customer_id, &currency);
        let existing = tx.get::<CustomerBalance>(&key)?;
        let previous = existing.as_ref().map(snapshot).transpose()?;

        let mut balance = existing.unwrap_or_else(|| {
            CustomerBalance::new(adjustment.customer_id.clone(), currency.as_str(), now)
        });
        balance.balance = balance.balance.saturating_add(adjustment.amount);
        balance.updated_at = now;

        let entry = BalanceTransaction::record(
            &balance,
            adjustment.amount,
            adjustment.transaction_type,
            adjustment.description.clone(),
            now,
        )
        .with_invoice(adjustment.invoice_id.clone())
        .with_credit_note(adjustment.credit_note_id.clone());

        tx.put(&balance)?;
        tx.create(&entry)?;
        self.record(tx, event_types::CUSTOMER_BALANCE_UPDATED, &balance, previous)?;

        tracing::info!(
            customer_id = %balance.customer_id,
            currency = %balance.currency,
            amount = adjustment.amount,
            ending_balance = balance.balance,
            transaction_type = adjustment.transaction_type.as_str(),
            "Customer balance adjusted"
        );
        Ok(entry)
    }

    pub(crate) fn apply_balance_in(
        &self,
        tx: &mut Tx<'_>,
        customer_id: &CustomerId,
        currency: Option<&str>,
        amount_due: i64,
        invoice_id: Option<&InvoiceId>,
    ) -> Result<AppliedBalance> {
        if amount_due <= 0 {
            return Ok(AppliedBalance::NONE);
        }
        let currency = self.currency_or_default(currency);
        let key = CustomerBalance::key_for(customer_id, &currency);
        let available = tx
            .get::<CustomerBalance>(&key)?
            .map_or(0, |balance| balance.balance);
        if available <= 0 {
            return Ok(AppliedBalance::NONE);
        }

        let applied = amount_due.min(available);
        let description = invoice_id.map_or_else(
            || "Applied to invoice".to_string(),
            |id| format!("Applied to invoice {id}"),
        );
        let mut adjustment = BalanceAdjustment::new(
            customer_id.clone(),
            -applied,
            BalanceTransactionType::AppliedToInvoice,
            description,
        )
        .in_currency(currency);
        adjustment.invoice_id = invoice_id.cloned();

        let entry = self.adjust_balance_in(tx, &adjustment)?;
        Ok(AppliedBalance {
            applied,
            transaction: Some(entry),
        })
    }
}

fn require_customer(customer_id: &CustomerId) -> Result<()> {
    if customer_id.is_empty() {
        return Err(BillingError::validation("customer_id is required"));
    }
    Ok(())
}
