//! Customer balance ledger types.
//!
//! A customer holds one stored-value balance per currency. Every change to a balance creates
//! an immutable [`BalanceTransaction`] recording the signed amount and the resulting balance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{BalanceTransactionId, CreditNoteId, CustomerId, InvoiceId};

/// Stored-value balance of a customer in one currency.
///
/// Amounts are in cents; positive means the customer has credit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerBalance {
    /// The customer.
    pub customer_id: CustomerId,
    /// Lowercase three-letter currency code.
    pub currency: String,
    /// Current balance in cents.
    pub balance: i64,
    /// When the balance row was created.
    pub created_at: DateTime<Utc>,
    /// When the balance last changed.
    pub updated_at: DateTime<Utc>,
}

impl CustomerBalance {
    /// Create a zero balance.
    #[must_use]
    pub fn new(customer_id: CustomerId, currency: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            customer_id,
            currency: currency.into().to_lowercase(),
            balance: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Storage key of the balance row for a (customer, currency) pair.
    #[must_use]
    pub fn key_for(customer_id: &CustomerId, currency: &str) -> String {
        format!("{}:{}", customer_id, currency.to_lowercase())
    }

    /// Storage key of this balance row.
    #[must_use]
    pub fn key(&self) -> String {
        Self::key_for(&self.customer_id, &self.currency)
    }
}

/// An immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceTransaction {
    /// Entry identifier.
    pub id: BalanceTransactionId,
    /// The customer whose balance changed.
    pub customer_id: CustomerId,
    /// Currency of the balance.
    pub currency: String,
    /// Signed amount in cents. Positive = credit, negative = debit.
    pub amount: i64,
    /// Balance after this entry was applied.
    pub ending_balance: i64,
    /// Why the balance changed.
    pub transaction_type: BalanceTransactionType,
    /// Human-readable description.
    pub description: String,
    /// Invoice the entry relates to.
    pub invoice_id: Option<InvoiceId>,
    /// Credit note the entry relates to.
    pub credit_note_id: Option<CreditNoteId>,
    /// When the entry was created.
    pub created_at: DateTime<Utc>,
}

impl BalanceTransaction {
    /// Record a change against a balance that has already been updated.
    #[must_use]
    pub fn record(
        balance: &CustomerBalance,
        amount: i64,
        transaction_type: BalanceTransactionType,
        description: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: BalanceTransactionId::generate(),
            customer_id: balance.customer_id.clone(),
            currency: balance.currency.clone(),
            amount,
            ending_balance: balance.balance,
            transaction_type,
            description: description.into(),
            invoice_id: None,
            credit_note_id: None,
            created_at: now,
        }
    }

    /// Attach an invoice reference.
    #[must_use]
    pub fn with_invoice(mut self, invoice_id: Option<InvoiceId>) -> Self {
        self.invoice_id = invoice_id;
        self
    }

    /// Attach a credit note reference.
    #[must_use]
    pub fn with_credit_note(mut self, credit_note_id: Option<CreditNoteId>) -> Self {
        self.credit_note_id = credit_note_id;
        self
    }
}

/// Type of balance change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceTransactionType {
    /// Manual adjustment.
    Adjustment,
    /// Balance consumed to pay an invoice.
    AppliedToInvoice,
    /// Credit issued through a credit note.
    CreditNote,
    /// Refund credited to the balance.
    Refund,
    /// Invoice overpayment carried forward.
    InvoiceOverpayment,
    /// Promotional credit.
    Promotion,
}

impl BalanceTransactionType {
    /// Get the type name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Adjustment => "adjustment",
            Self::AppliedToInvoice => "applied_to_invoice",
            Self::CreditNote => "credit_note",
            Self::Refund => "refund",
            Self::InvoiceOverpayment => "invoice_overpayment",
            Self::Promotion => "promotion",
        }
    }
}
