//! Billing invoices.
//!
//! An invoice is assembled as a draft, finalized into an open invoice with a fixed amount due,
//! and then settled as paid, voided, or written off as uncollectible:
//!
//! ```text
//! draft ──finalize──▶ open ──mark_paid──────────▶ paid
//!   │                  ├──mark_void──────────▶ void
//!   └──mark_void──────▶┘└──mark_uncollectible──▶ uncollectible
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, Result};
use crate::ids::{CustomerId, InvoiceId, LineItemId, MeterId, SubscriptionId, SubscriptionItemId};
use crate::tax::TaxLine;

/// Invoice status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    /// Being assembled; line items may change.
    Draft,
    /// Finalized and awaiting payment.
    Open,
    /// Paid in full.
    Paid,
    /// Cancelled; never collectible.
    Void,
    /// Written off after collection failed.
    Uncollectible,
}

impl InvoiceStatus {
    /// Get the status name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Open => "open",
            Self::Paid => "paid",
            Self::Void => "void",
            Self::Uncollectible => "uncollectible",
        }
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a line item bills for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineItemKind {
    /// Recurring plan charge.
    Subscription,
    /// Metered usage.
    Usage,
    /// Ad-hoc charge.
    OneOff,
    /// Mid-cycle plan change adjustment (may be negative).
    Proration,
}

/// A single invoice line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    /// Line identifier.
    pub id: LineItemId,
    /// What the line bills for.
    pub kind: LineItemKind,
    /// Human-readable description.
    pub description: String,
    /// Quantity billed.
    pub quantity: i64,
    /// Unit amount in cents, when meaningful.
    pub unit_amount: Option<i64>,
    /// Line total in cents.
    pub amount: i64,
    /// Meter for usage lines.
    pub meter_id: Option<MeterId>,
    /// Subscription item for usage lines.
    pub subscription_item_id: Option<SubscriptionItemId>,
    /// Start of the period the line covers.
    pub period_start: Option<DateTime<Utc>>,
    /// End of the period the line covers.
    pub period_end: Option<DateTime<Utc>>,
}

impl LineItem {
    /// Create a line item with the given kind and amount.
    #[must_use]
    pub fn new(kind: LineItemKind, description: impl Into<String>, amount: i64) -> Self {
        Self {
            id: LineItemId::generate(),
            kind,
            description: description.into(),
            quantity: 1,
            unit_amount: Some(amount),
            amount,
            meter_id: None,
            subscription_item_id: None,
            period_start: None,
            period_end: None,
        }
    }

    /// Set the period the line covers.
    #[must_use]
    pub fn with_period(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.period_start = Some(start);
        self.period_end = Some(end);
        self
    }
}

/// A billing invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingInvoice {
    /// Invoice identifier.
    pub id: InvoiceId,
    /// The billed customer.
    pub customer_id: CustomerId,
    /// The subscription that generated the invoice, if any.
    pub subscription_id: Option<SubscriptionId>,
    /// Currency of every amount on the invoice.
    pub currency: String,
    /// Billing period start.
    pub period_start: Option<DateTime<Utc>>,
    /// Billing period end.
    pub period_end: Option<DateTime<Utc>>,
    /// Ordered line items.
    pub line_items: Vec<LineItem>,
    /// Sum of line amounts.
    pub subtotal: i64,
    /// Tax total.
    pub tax: i64,
    /// Per-rate tax breakdown.
    #[serde(default)]
    pub tax_lines: Vec<TaxLine>,
    /// Discount total.
    pub discount: i64,
    /// Credit applied before collection.
    pub credit_applied: i64,
    /// Amount due once finalized.
    pub amount_due: i64,
    /// Amount paid.
    pub amount_paid: i64,
    /// Current status.
    pub status: InvoiceStatus,
    /// How the invoice was paid ("credit", "balance", ...).
    pub payment_method: Option<String>,
    /// External payment reference.
    pub payment_reference: Option<String>,
    /// Number of collection attempts.
    pub attempt_count: u32,
    /// When collection was last attempted.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// When the next dunning attempt is scheduled.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// When the invoice was finalized.
    pub finalized_at: Option<DateTime<Utc>>,
    /// When the invoice was paid.
    pub paid_at: Option<DateTime<Utc>>,
    /// When the invoice was voided.
    pub voided_at: Option<DateTime<Utc>>,
    /// When the invoice was created.
    pub created_at: DateTime<Utc>,
}

impl BillingInvoice {
    /// Create an empty draft invoice.
    #[must_use]
    pub fn draft(customer_id: CustomerId, currency: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: InvoiceId::generate(),
            customer_id,
            subscription_id: None,
            currency: currency.into().to_lowercase(),
            period_start: None,
            period_end: None,
            line_items: Vec::new(),
            subtotal: 0,
            tax: 0,
            tax_lines: Vec::new(),
            discount: 0,
            credit_applied: 0,
            amount_due: 0,
            amount_paid: 0,
            status: InvoiceStatus::Draft,
            payment_method: None,
            payment_reference: None,
            attempt_count: 0,
            last_attempt_at: None,
            next_attempt_at: None,
            finalized_at: None,
            paid_at: None,
            voided_at: None,
            created_at: now,
        }
    }

    /// Link the invoice to a subscription period.
    #[must_use]
    pub fn for_subscription(
        mut self,
        subscription_id: SubscriptionId,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Self {
        self.subscription_id = Some(subscription_id);
        self.period_start = Some(period_start);
        self.period_end = Some(period_end);
        self
    }

    /// Append a line item and recompute the subtotal.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the invoice is a draft.
    pub fn add_line_item(&mut self, item: LineItem) -> Result<()> {
        self.require(InvoiceStatus::Draft, "add line item to")?;
        self.line_items.push(item);
        self.recompute_subtotal();
        Ok(())
    }

    /// Recompute the subtotal from the line items.
    pub fn recompute_subtotal(&mut self) {
        self.subtotal = self
            .line_items
            .iter()
            .fold(0i64, |acc, item| acc.saturating_add(item.amount));
    }

    /// Set the tax breakdown while the invoice is still a draft.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the invoice is a draft.
    pub fn set_tax(&mut self, lines: Vec<TaxLine>) -> Result<()> {
        self.require(InvoiceStatus::Draft, "set tax on")?;
        self.tax = lines.iter().map(|l| l.amount).sum();
        self.tax_lines = lines;
        Ok(())
    }

    /// Finalize a draft: `amount_due = max(0, subtotal + tax - discount - credit_applied)`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the invoice is a draft.
    pub fn finalize(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.require(InvoiceStatus::Draft, "finalize")?;
        self.amount_due = self
            .subtotal
            .saturating_add(self.tax)
            .saturating_sub(self.discount)
            .saturating_sub(self.credit_applied)
            .max(0);
        self.status = InvoiceStatus::Open;
        self.finalized_at = Some(now);
        Ok(())
    }

    /// Mark an open invoice as paid in full.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the invoice is open.
    pub fn mark_paid(
        &mut self,
        method: impl Into<String>,
        reference: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.require(InvoiceStatus::Open, "mark paid")?;
        self.status = InvoiceStatus::Paid;
        self.amount_paid = self.amount_due;
        self.payment_method = Some(method.into());
        self.payment_reference = reference;
        self.paid_at = Some(now);
        self.next_attempt_at = None;
        Ok(())
    }

    /// Void a draft or open invoice.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` from any other status.
    pub fn mark_void(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !matches!(self.status, InvoiceStatus::Draft | InvoiceStatus::Open) {
            return Err(BillingError::invalid_state("invoice", self.status, "void"));
        }
        self.status = InvoiceStatus::Void;
        self.voided_at = Some(now);
        self.next_attempt_at = None;
        Ok(())
    }

    /// Write off an open invoice.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the invoice is open.
    pub fn mark_uncollectible(&mut self) -> Result<()> {
        self.require(InvoiceStatus::Open, "mark uncollectible")?;
        self.status = InvoiceStatus::Uncollectible;
        self.next_attempt_at = None;
        Ok(())
    }

    /// Record a collection attempt.
    pub fn record_attempt(&mut self, now: DateTime<Utc>) {
        self.attempt_count += 1;
        self.last_attempt_at = Some(now);
    }

    fn require(&self, expected: InvoiceStatus, operation: &'static str) -> Result<()> {
        if self.status == expected {
            Ok(())
        } else {
            Err(BillingError::invalid_state("invoice", self.status, operation))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft_with(amount: i64) -> BillingInvoice {
        let mut invoice = BillingInvoice::draft(CustomerId::from("cus_1"), "usd", Utc::now());
        invoice
            .add_line_item(LineItem::new(LineItemKind::OneOff, "setup fee", amount))
            .unwrap();
        invoice
    }

    #[test]
    fn finalize_computes_amount_due() {
        let mut invoice = draft_with(1000);
        invoice.tax = 80;
        invoice.discount = 100;
        invoice.credit_applied = 30;
        invoice.finalize(Utc::now()).unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Open);
        assert_eq!(invoice.amount_due, 950);
    }

    #[test]
    fn finalize_floors_amount_due_at_zero() {
        let mut invoice = draft_with(1000);
        invoice.discount = 800;
        invoice.credit_applied = 500;
        invoice.finalize(Utc::now()).unwrap();
        assert_eq!(invoice.amount_due, 0);
    }

    #[test]
    fn finalize_only_from_draft() {
        let mut invoice = draft_with(1000);
        invoice.finalize(Utc::now()).unwrap();
        let err = invoice.finalize(Utc::now()).unwrap_err();
        assert_eq!(err.to_string(), "cannot finalize invoice in status open");
    }

    #[test]
    fn paid_records_amount_and_time() {
        let mut invoice = draft_with(1200);
        invoice.finalize(Utc::now()).unwrap();
        invoice.mark_paid("balance", None, Utc::now()).unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Paid);
        assert_eq!(invoice.amount_paid, 1200);
        assert!(invoice.paid_at.is_some());
        assert!(invoice.mark_void(Utc::now()).is_err());
    }

    #[test]
    fn draft_cannot_be_paid_or_written_off() {
        let mut invoice = draft_with(500);
        assert!(matches!(
            invoice.mark_paid("balance", None, Utc::now()),
            Err(BillingError::InvalidState { .. })
        ));
        assert!(invoice.mark_uncollectible().is_err());
        invoice.mark_void(Utc::now()).unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Void);
    }

    #[test]
    fn open_invoice_can_be_written_off() {
        let mut invoice = draft_with(500);
        invoice.finalize(Utc::now()).unwrap();
        invoice.mark_uncollectible().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Uncollectible);
        assert!(invoice.mark_void(Utc::now()).is_err());
    }

    #[test]
    fn line_items_frozen_after_finalize() {
        let mut invoice = draft_with(500);
        invoice.finalize(Utc::now()).unwrap();
        let result = invoice.add_line_item(LineItem::new(LineItemKind::OneOff, "late", 1));
        assert!(result.is_err());
        assert_eq!(invoice.subtotal, 500);
    }
}
