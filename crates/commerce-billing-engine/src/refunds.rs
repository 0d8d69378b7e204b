//! Refunds and credit notes.

use commerce_billing_core::{
    credit_note_number, event_types, refundable_amount, BalanceTransactionType, BillingError,
    BillingInvoice, CreditNote, CreditNoteId, CreditNoteParams, CreditNoteStatus, CustomerId,
    InvoiceId, InvoiceStatus, PaymentIntent, PaymentIntentId, PaymentIntentStatus, Refund,
    RefundId, RefundSource, Result, INTERNAL_PROVIDER_REF,
};
use commerce_billing_store::StoreExt;

use crate::engine::{BillingEngine, Tx};
use crate::events::snapshot;
use crate::ledger::BalanceAdjustment;

/// Sequence counter behind credit note numbers.
const CREDIT_NOTE_SEQUENCE: &str = "credit-note";

/// Parameters for a refund. Exactly one source id must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefundParams {
    /// Refund a succeeded payment intent.
    pub payment_intent_id: Option<PaymentIntentId>,
    /// Refund a paid invoice.
    pub invoice_id: Option<InvoiceId>,
    /// Amount; everything still refundable when `None`.
    pub amount: Option<i64>,
    /// Why the refund is issued.
    pub reason: Option<String>,
}

impl RefundParams {
    /// Refund a payment intent.
    #[must_use]
    pub fn for_payment_intent(id: PaymentIntentId) -> Self {
        Self {
            payment_intent_id: Some(id),
            ..Self::default()
        }
    }

    /// Refund an invoice.
    #[must_use]
    pub fn for_invoice(id: InvoiceId) -> Self {
        Self {
            invoice_id: Some(id),
            ..Self::default()
        }
    }

    /// Refund `amount` instead of the full refundable amount.
    #[must_use]
    pub fn amount(mut self, amount: i64) -> Self {
        self.amount = Some(amount);
        self
    }

    /// Record a reason.
    #[must_use]
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// What a refund source allows.
struct SourceFunds {
    customer_id: CustomerId,
    currency: String,
    amount: i64,
    provider_ref: Option<String>,
}

// =============================================================================
// Refunds
// =============================================================================

impl BillingEngine {
    /// Refund a succeeded payment intent or a paid invoice.
    ///
    /// Refunds of processor-settled payments go through the processor. Anything else is
    /// credited to the customer balance.
    ///
    /// # Errors
    ///
    /// - `Validation` unless exactly one source is given, or if the amount is not positive
    ///   or exceeds what is still refundable.
    /// - `NotFound` if the source does not exist.
    /// - `InvalidState` unless the source succeeded (intent) or was paid (invoice).
    /// - The processor's error; the refund is then stored as failed.
    pub async fn create_refund(&self, params: RefundParams) -> Result<Refund> {
        let source = RefundSource::from_ids(params.payment_intent_id, params.invoice_id)?;

        let (refund, provider_ref) = self.store().transaction(|tx| {
            let funds = source_funds(tx, &source)?;
            let existing = tx.query::<Refund>(|r| r.source == source)?;
            let refundable = refundable_amount(funds.amount, &source, &existing);
            let amount = params.amount.unwrap_or(refundable);
            if amount <= 0 {
                return Err(BillingError::validation("refund amount must be positive"));
            }
            if amount > refundable {
                return Err(BillingError::validation(format!(
                    "refund amount {amount} exceeds refundable amount {refundable}"
                )));
            }
            let refund = Refund::new(
                funds.customer_id,
                source.clone(),
                amount,
                funds.currency,
                params.reason,
                self.now(),
            );
            tx.create(&refund)?;
            Ok((refund, funds.provider_ref))
        })?;

        let external_ref = provider_ref.filter(|r| r != INTERNAL_PROVIDER_REF);
        let processor = self.available_processor();
        let (Some(provider_ref), Some(processor)) = (external_ref, processor) else {
            return self.refund_to_balance(&refund);
        };

        match processor.refund(&provider_ref, refund.amount).await {
            Ok(response) => {
                let refund = self.mutate(
                    refund.id.as_str(),
                    event_types::REFUND_CREATED,
                    |refund: &mut Refund, _| {
                        refund.mark_succeeded(response.provider_ref);
                        Ok(())
                    },
                )?;
                tracing::info!(
                    refund_id = %refund.id,
                    amount = refund.amount,
                    processor = processor.processor_type(),
                    "Refund settled"
                );
                Ok(refund)
            }
            Err(e) => {
                let message = e.to_string();
                self.mutate(
                    refund.id.as_str(),
                    event_types::REFUND_FAILED,
                    |refund: &mut Refund, _| {
                        refund.mark_failed(message);
                        Ok(())
                    },
                )?;
                tracing::warn!(refund_id = %refund.id, error = %e, "Refund failed");
                Err(e)
            }
        }
    }

    /// Get a refund.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the refund does not exist.
    pub fn get_refund(&self, id: &RefundId) -> Result<Refund> {
        Ok(self.store().require(id.as_str())?)
    }

    /// A customer's refunds, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the scan fails.
    pub fn list_refunds(&self, customer_id: &CustomerId) -> Result<Vec<Refund>> {
        let mut refunds = self
            .store()
            .query::<Refund>(|r| r.customer_id == *customer_id)?;
        refunds.sort_by_key(|r| r.created_at);
        Ok(refunds)
    }

    fn refund_to_balance(&self, refund: &Refund) -> Result<Refund> {
        let refund = self.store().transaction(|tx| {
            let mut refund: Refund = tx.require(refund.id.as_str())?;
            let previous = snapshot(&refund)?;
            let mut adjustment = BalanceAdjustment::new(
                refund.customer_id.clone(),
                refund.amount,
                BalanceTransactionType::Refund,
                format!("Refund {}", refund.id),
            )
            .in_currency(refund.currency.as_str());
            if let RefundSource::Invoice(invoice_id) = &refund.source {
                adjustment = adjustment.for_invoice(invoice_id.clone());
            }
            let entry = self.adjust_balance_in(tx, &adjustment)?;
            refund.mark_succeeded(entry.id.to_string());
            tx.update(&refund)?;
            self.record(tx, event_types::REFUND_CREATED, &refund, Some(previous))?;
            Ok::<_, BillingError>(refund)
        })?;
        self.wake_dispatcher();
        tracing::info!(
            refund_id = %refund.id,
            customer_id = %refund.customer_id,
            amount = refund.amount,
            "Refund credited to customer balance"
        );
        Ok(refund)
    }
}

fn source_funds(tx: &Tx<'_>, source: &RefundSource) -> Result<SourceFunds> {
    match source {
        RefundSource::PaymentIntent(id) => {
            let intent: PaymentIntent = tx.require(id.as_str())?;
            if intent.status != PaymentIntentStatus::Succeeded {
                return Err(BillingError::invalid_state("payment intent", intent.status, "refund"));
            }
            Ok(SourceFunds {
                customer_id: intent.customer_id,
                currency: intent.currency,
                amount: intent.amount_received,
                provider_ref: intent.provider_ref,
            })
        }
        RefundSource::Invoice(id) => {
            let invoice: BillingInvoice = tx.require(id.as_str())?;
            if invoice.status != InvoiceStatus::Paid {
                return Err(BillingError::invalid_state("invoice", invoice.status, "refund"));
            }
            Ok(SourceFunds {
                customer_id: invoice.customer_id,
                currency: invoice.currency,
                amount: invoice.amount_paid,
                provider_ref: invoice.payment_reference,
            })
        }
    }
}

// =============================================================================
// Credit notes
// =============================================================================

impl BillingEngine {
    /// Issue a credit note against an open or paid invoice.
    ///
    /// Notes are numbered `CN-0001`, `CN-0002`, ... from a counter incremented in the same
    /// transaction that stores the note.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the invoice does not exist.
    /// - `InvalidState` unless the invoice is open or paid.
    /// - `Validation` if the amount is not positive or the invoice's issued notes would
    ///   exceed its total.
    pub fn create_credit_note(&self, params: CreditNoteParams) -> Result<CreditNote> {
        let amount = params.resolve_amount()?;

        let note = self.store().transaction(|tx| {
            let invoice: BillingInvoice = tx.require(params.invoice_id.as_str())?;
            if !matches!(invoice.status, InvoiceStatus::Open | InvoiceStatus::Paid) {
                return Err(BillingError::invalid_state("invoice", invoice.status, "credit"));
            }
            let credited: i64 = tx
                .query::<CreditNote>(|n| {
                    n.invoice_id == invoice.id && n.status == CreditNoteStatus::Issued
                })?
                .iter()
                .map(|n| n.amount)
                .sum();
            let limit = invoice.subtotal + invoice.tax;
            if credited + amount > limit {
                return Err(BillingError::validation(format!(
                    "credit note amount {amount} exceeds remaining creditable amount {}",
                    limit - credited
                )));
            }

            let sequence = tx.next_sequence(CREDIT_NOTE_SEQUENCE)?;
            let note = CreditNote {
                id: CreditNoteId::generate(),
                number: credit_note_number(sequence),
                invoice_id: invoice.id.clone(),
                customer_id: invoice.customer_id.clone(),
                currency: invoice.currency.clone(),
                line_items: params.line_items,
                amount,
                out_of_band_amount: params.out_of_band_amount,
                reason: params.reason,
                memo: params.memo,
                status: CreditNoteStatus::Issued,
                credited_to_balance: params.credit_to_balance,
                issued_at: self.now(),
                voided_at: None,
            };
            tx.create(&note)?;

            if note.credited_to_balance {
                let adjustment = BalanceAdjustment::new(
                    note.customer_id.clone(),
                    amount,
                    BalanceTransactionType::CreditNote,
                    format!("Credit note {}", note.number),
                )
                .in_currency(note.currency.as_str())
                .for_invoice(note.invoice_id.clone())
                .for_credit_note(note.id.clone());
                self.adjust_balance_in(tx, &adjustment)?;
            }
            self.record(tx, event_types::CREDIT_NOTE_CREATED, &note, None)?;
            Ok(note)
        })?;
        self.wake_dispatcher();

        tracing::info!(
            credit_note_id = %note.id,
            number = %note.number,
            invoice_id = %note.invoice_id,
            amount = note.amount,
            "Credit note issued"
        );
        Ok(note)
    }

    /// Void an issued credit note, reversing its balance credit if it made one.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the note does not exist.
    /// - `InvalidState` if it is already void.
    pub fn void_credit_note(&self, id: &CreditNoteId) -> Result<CreditNote> {
        let note = self.store().transaction(|tx| {
            let mut note: CreditNote = tx.require(id.as_str())?;
            let previous = snapshot(&note)?;
            note.void(self.now())?;
            if note.credited_to_balance {
                let adjustment = BalanceAdjustment::new(
                    note.customer_id.clone(),
                    -note.amount,
                    BalanceTransactionType::CreditNote,
                    format!("Credit note {} voided", note.number),
                )
                .in_currency(note.currency.as_str())
                .for_invoice(note.invoice_id.clone())
                .for_credit_note(note.id.clone());
                self.adjust_balance_in(tx, &adjustment)?;
            }
            tx.update(&note)?;
            self.record(tx, event_types::CREDIT_NOTE_VOIDED, &note, Some(previous))?;
            Ok::<_, BillingError>(note)
        })?;
        self.wake_dispatcher();
        tracing::info!(credit_note_id = %note.id, number = %note.number, "Credit note voided");
        Ok(note)
    }

    /// Get a credit note.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the note does not exist.
    pub fn get_credit_note(&self, id: &CreditNoteId) -> Result<CreditNote> {
        Ok(self.store().require(id.as_str())?)
    }

    /// Credit notes issued against an invoice, in number order.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the scan fails.
    pub fn list_credit_notes(&self, invoice_id: &InvoiceId) -> Result<Vec<CreditNote>> {
        let mut notes = self
            .store()
            .query::<CreditNote>(|n| n.invoice_id == *invoice_id)?;
        notes.sort_by(|a, b| a.number.cmp(&b.number));
        Ok(notes)
    }
}
