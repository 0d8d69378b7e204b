//! Refunds, credit notes and payouts.
//!
//! Money flowing back out: a [`Refund`] returns part or all of a payment, a [`CreditNote`]
//! reduces what an invoice is worth after it was issued, and a [`Payout`] transfers funds to
//! an external destination.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, Result};
use crate::ids::{CreditNoteId, CustomerId, InvoiceId, PaymentIntentId, PayoutId, RefundId};
use crate::invoice::LineItem;

// =============================================================================
// Refunds
// =============================================================================

/// Refund status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    /// Created, not yet settled.
    Pending,
    /// Funds returned.
    Succeeded,
    /// The processor rejected the refund.
    Failed,
    /// Abandoned before settlement.
    Canceled,
}

impl RefundStatus {
    /// Get the status name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for RefundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a refund returns money for. Exactly one source per refund.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "id")]
pub enum RefundSource {
    /// A succeeded payment intent.
    PaymentIntent(PaymentIntentId),
    /// A paid invoice.
    Invoice(InvoiceId),
}

impl RefundSource {
    /// Resolve the source from two optional ids.
    ///
    /// # Errors
    ///
    /// Returns `Validation` unless exactly one non-empty id is given.
    pub fn from_ids(
        payment_intent_id: Option<PaymentIntentId>,
        invoice_id: Option<InvoiceId>,
    ) -> Result<Self> {
        let payment_intent_id = payment_intent_id.filter(|id| !id.is_empty());
        let invoice_id = invoice_id.filter(|id| !id.is_empty());
        match (payment_intent_id, invoice_id) {
            (Some(pi), None) => Ok(Self::PaymentIntent(pi)),
            (None, Some(inv)) => Ok(Self::Invoice(inv)),
            (None, None) => Err(BillingError::validation(
                "either payment_intent_id or invoice_id is required",
            )),
            (Some(_), Some(_)) => Err(BillingError::validation(
                "only one of payment_intent_id or invoice_id may be given",
            )),
        }
    }
}

/// A return of funds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refund {
    /// Refund identifier.
    pub id: RefundId,
    /// The refunded customer.
    pub customer_id: CustomerId,
    /// Amount in cents.
    pub amount: i64,
    /// Currency code.
    pub currency: String,
    /// Current status.
    pub status: RefundStatus,
    /// What is being refunded.
    pub source: RefundSource,
    /// Why the refund was issued.
    pub reason: Option<String>,
    /// Processor reference once settled.
    pub provider_ref: Option<String>,
    /// Processor error when failed.
    pub failure_message: Option<String>,
    /// When the refund was created.
    pub created_at: DateTime<Utc>,
}

impl Refund {
    /// Create a pending refund.
    #[must_use]
    pub fn new(
        customer_id: CustomerId,
        source: RefundSource,
        amount: i64,
        currency: impl Into<String>,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RefundId::generate(),
            customer_id,
            amount,
            currency: currency.into().to_lowercase(),
            status: RefundStatus::Pending,
            source,
            reason,
            provider_ref: None,
            failure_message: None,
            created_at: now,
        }
    }

    /// Record settlement.
    pub fn mark_succeeded(&mut self, provider_ref: impl Into<String>) {
        self.status = RefundStatus::Succeeded;
        self.provider_ref = Some(provider_ref.into());
    }

    /// Record a processor failure.
    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.status = RefundStatus::Failed;
        self.failure_message = Some(message.into());
    }

    /// Whether this refund counts against the source's refundable amount.
    #[must_use]
    pub fn is_outstanding(&self) -> bool {
        matches!(self.status, RefundStatus::Pending | RefundStatus::Succeeded)
    }
}

/// Amount still refundable from a source, given the refunds already made against it.
#[must_use]
pub fn refundable_amount<'a, I>(source_amount: i64, source: &RefundSource, existing: I) -> i64
where
    I: IntoIterator<Item = &'a Refund>,
{
    let refunded: i64 = existing
        .into_iter()
        .filter(|r| r.source == *source && r.is_outstanding())
        .map(|r| r.amount)
        .sum();
    source_amount.saturating_sub(refunded).max(0)
}

// =============================================================================
// Credit notes
// =============================================================================

/// Credit note status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditNoteStatus {
    /// In effect.
    Issued,
    /// Withdrawn.
    Void,
}

impl fmt::Display for CreditNoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Issued => "issued",
            Self::Void => "void",
        })
    }
}

/// Format a credit note number from its sequence value.
#[must_use]
pub fn credit_note_number(sequence: u64) -> String {
    format!("CN-{sequence:04}")
}

/// A document reducing the value of an issued invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditNote {
    /// Credit note identifier.
    pub id: CreditNoteId,
    /// Human-facing number, `CN-0001` onwards.
    pub number: String,
    /// The credited invoice.
    pub invoice_id: InvoiceId,
    /// The credited customer.
    pub customer_id: CustomerId,
    /// Currency code.
    pub currency: String,
    /// Credited lines.
    #[serde(default)]
    pub line_items: Vec<LineItem>,
    /// Total credited amount.
    pub amount: i64,
    /// Part of the amount settled outside the platform.
    pub out_of_band_amount: i64,
    /// Reason code.
    pub reason: Option<String>,
    /// Free-text memo.
    pub memo: Option<String>,
    /// Current status.
    pub status: CreditNoteStatus,
    /// Whether the amount was credited to the customer balance.
    pub credited_to_balance: bool,
    /// When the note was issued.
    pub issued_at: DateTime<Utc>,
    /// When the note was voided.
    pub voided_at: Option<DateTime<Utc>>,
}

/// Parameters for issuing a credit note.
#[derive(Debug, Clone)]
pub struct CreditNoteParams {
    /// The invoice to credit.
    pub invoice_id: InvoiceId,
    /// Explicit amount; derived from the lines when absent.
    pub amount: Option<i64>,
    /// Credited lines.
    pub line_items: Vec<LineItem>,
    /// Part of the amount settled outside the platform.
    pub out_of_band_amount: i64,
    /// Reason code.
    pub reason: Option<String>,
    /// Free-text memo.
    pub memo: Option<String>,
    /// Credit the amount to the customer balance.
    pub credit_to_balance: bool,
}

impl CreditNoteParams {
    /// Parameters crediting `invoice_id` with nothing set yet.
    #[must_use]
    pub fn for_invoice(invoice_id: InvoiceId) -> Self {
        Self {
            invoice_id,
            amount: None,
            line_items: Vec::new(),
            out_of_band_amount: 0,
            reason: None,
            memo: None,
            credit_to_balance: false,
        }
    }

    /// Amount the note will carry: the explicit amount or the sum of lines plus out-of-band.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the amount is not positive.
    pub fn resolve_amount(&self) -> Result<i64> {
        let amount = self.amount.unwrap_or_else(|| {
            self.line_items
                .iter()
                .fold(self.out_of_band_amount, |acc, l| acc.saturating_add(l.amount))
        });
        if amount <= 0 {
            return Err(BillingError::validation("credit note amount must be positive"));
        }
        Ok(amount)
    }
}

impl CreditNote {
    /// Void an issued note.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the note is already void.
    pub fn void(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != CreditNoteStatus::Issued {
            return Err(BillingError::invalid_state("credit note", self.status, "void"));
        }
        self.status = CreditNoteStatus::Void;
        self.voided_at = Some(now);
        Ok(())
    }
}

// =============================================================================
// Payouts
// =============================================================================

/// Payout status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    /// Created, not yet submitted.
    Pending,
    /// Submitted to the bank.
    InTransit,
    /// Arrived at the destination.
    Paid,
    /// Rejected.
    Failed,
    /// Withdrawn before arrival.
    Canceled,
}

impl PayoutStatus {
    /// Get the status name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InTransit => "in_transit",
            Self::Paid => "paid",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InTransit | Self::Canceled | Self::Failed)
                | (Self::InTransit, Self::Paid | Self::Failed | Self::Canceled)
        )
    }
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outbound transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    /// Payout identifier.
    pub id: PayoutId,
    /// Amount in cents.
    pub amount: i64,
    /// Currency code.
    pub currency: String,
    /// Destination account reference.
    pub destination: String,
    /// Current status.
    pub status: PayoutStatus,
    /// Failure reason.
    pub failure_message: Option<String>,
    /// When the funds arrived.
    pub arrival_date: Option<DateTime<Utc>>,
    /// When the payout was created.
    pub created_at: DateTime<Utc>,
    /// When the payout last changed.
    pub updated_at: DateTime<Utc>,
}

impl Payout {
    /// Create a pending payout.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a non-positive amount or empty destination.
    pub fn new(
        amount: i64,
        currency: impl Into<String>,
        destination: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let destination = destination.into();
        if amount <= 0 {
            return Err(BillingError::validation("payout amount must be positive"));
        }
        if destination.trim().is_empty() {
            return Err(BillingError::validation("payout destination is required"));
        }
        Ok(Self {
            id: PayoutId::generate(),
            amount,
            currency: currency.into().to_lowercase(),
            destination,
            status: PayoutStatus::Pending,
            failure_message: None,
            arrival_date: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Move the payout to `next`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` for an illegal transition.
    pub fn transition(&mut self, next: PayoutStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(BillingError::invalid_state(
                "payout",
                self.status,
                match next {
                    PayoutStatus::InTransit => "send",
                    PayoutStatus::Paid => "mark paid",
                    PayoutStatus::Failed => "fail",
                    PayoutStatus::Canceled => "cancel",
                    PayoutStatus::Pending => "reset",
                },
            ));
        }
        self.status = next;
        self.updated_at = now;
        if next == PayoutStatus::Paid {
            self.arrival_date = Some(now);
        }
        Ok(())
    }

    /// Fail the payout with a message.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the payout already settled.
    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.transition(PayoutStatus::Failed, now)?;
        self.failure_message = Some(message.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoice::LineItemKind;

    #[test]
    fn source_requires_exactly_one_id() {
        assert!(RefundSource::from_ids(None, None).is_err());
        assert!(RefundSource::from_ids(
            Some(PaymentIntentId::from("pi_1")),
            Some(InvoiceId::from("in_1"))
        )
        .is_err());
        assert!(RefundSource::from_ids(Some(PaymentIntentId::from("")), None).is_err());
        assert_eq!(
            RefundSource::from_ids(None, Some(InvoiceId::from("in_1"))).unwrap(),
            RefundSource::Invoice(InvoiceId::from("in_1"))
        );
    }

    #[test]
    fn refundable_excludes_failed_refunds() {
        let source = RefundSource::PaymentIntent(PaymentIntentId::from("pi_1"));
        let now = Utc::now();
        let cus = CustomerId::from("cus_1");
        let mut ok = Refund::new(cus.clone(), source.clone(), 300, "usd", None, now);
        ok.mark_succeeded("re_ref");
        let mut failed = Refund::new(cus.clone(), source.clone(), 500, "usd", None, now);
        failed.mark_failed("declined");
        let other = Refund::new(
            cus,
            RefundSource::Invoice(InvoiceId::from("in_1")),
            900,
            "usd",
            None,
            now,
        );

        assert_eq!(refundable_amount(1000, &source, [&ok, &failed, &other]), 700);
    }

    #[test]
    fn credit_note_amount_from_lines() {
        let params = CreditNoteParams {
            line_items: vec![
                LineItem::new(LineItemKind::OneOff, "a", 200),
                LineItem::new(LineItemKind::OneOff, "b", 300),
            ],
            out_of_band_amount: 50,
            ..CreditNoteParams::for_invoice(InvoiceId::from("in_1"))
        };
        assert_eq!(params.resolve_amount().unwrap(), 550);

        let explicit = CreditNoteParams {
            amount: Some(0),
            ..params
        };
        assert!(explicit.resolve_amount().is_err());
    }

    #[test]
    fn credit_note_numbers_are_padded() {
        assert_eq!(credit_note_number(1), "CN-0001");
        assert_eq!(credit_note_number(42), "CN-0042");
        assert_eq!(credit_note_number(12345), "CN-12345");
    }

    #[test]
    fn payout_transitions() {
        let now = Utc::now();
        let mut payout = Payout::new(10_000, "USD", "ba_123", now).unwrap();
        assert!(payout.transition(PayoutStatus::Paid, now).is_err());
        payout.transition(PayoutStatus::InTransit, now).unwrap();
        payout.transition(PayoutStatus::Paid, now).unwrap();
        assert_eq!(payout.arrival_date, Some(now));
        let err = payout.transition(PayoutStatus::Canceled, now).unwrap_err();
        assert_eq!(err.to_string(), "cannot cancel payout in status paid");

        let mut failing = Payout::new(100, "usd", "ba_123", now).unwrap();
        failing.fail("account closed", now).unwrap();
        assert_eq!(failing.failure_message.as_deref(), Some("account closed"));

        assert!(Payout::new(0, "usd", "ba_123", now).is_err());
        assert!(Payout::new(10, "usd", " ", now).is_err());
    }
}
