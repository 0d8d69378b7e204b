//! Payment intent, refund, credit note and payout integration tests.

mod common;

use common::{FakeProcessor, TestHarness};

use commerce_billing_core::{
    event_types, BillingError, BillingInvoice, CreditNoteParams, CreditNoteStatus, CustomerId,
    InvoiceStatus, LineItem, LineItemKind, PaymentIntentStatus, PaymentMethod, PaymentMethodType,
    PayoutStatus, RefundSource, RefundStatus, SetupIntentStatus, INTERNAL_PROVIDER_REF,
};
use commerce_billing_engine::{NewInvoice, NewPaymentIntent, RefundParams};

fn card(harness: &TestHarness, customer: &str) -> PaymentMethod {
    harness
        .engine
        .create_payment_method(&CustomerId::from(customer), PaymentMethodType::Card, "tok_visa")
        .unwrap()
}

fn paid_invoice(harness: &TestHarness, customer: &str, amount: i64) -> BillingInvoice {
    let invoice = harness
        .engine
        .create_invoice(NewInvoice::for_customer(customer))
        .unwrap();
    harness
        .engine
        .add_invoice_line_item(&invoice.id, LineItem::new(LineItemKind::OneOff, "Seat", amount))
        .unwrap();
    harness.engine.finalize_invoice(&invoice.id, None).unwrap();
    harness.fund(customer, amount);
    harness.engine.collect_invoice(&invoice.id).unwrap();
    harness.engine.get_invoice(&invoice.id).unwrap()
}

// ============================================================================
// Payment intents
// ============================================================================

#[tokio::test]
async fn intent_without_processor_settles_internally() {
    let harness = TestHarness::new();
    let pm = card(&harness, "cus_1");
    let intent = harness
        .engine
        .create_payment_intent(NewPaymentIntent::new("cus_1", 2500))
        .unwrap();
    assert_eq!(intent.status, PaymentIntentStatus::RequiresPaymentMethod);

    let intent = harness
        .engine
        .confirm_payment_intent(&intent.id, Some(pm.id))
        .await
        .unwrap();

    assert_eq!(intent.status, PaymentIntentStatus::Succeeded);
    assert_eq!(intent.amount_received, 2500);
    assert_eq!(intent.provider_ref.as_deref(), Some(INTERNAL_PROVIDER_REF));
    assert_eq!(harness.count_events(event_types::PAYMENT_INTENT_SUCCEEDED), 1);
}

#[tokio::test]
async fn intent_is_charged_through_processor() {
    let processor = FakeProcessor::new();
    let harness = TestHarness::new().with_processor(processor.clone());
    let pm = card(&harness, "cus_1");
    let intent = harness
        .engine
        .create_payment_intent(NewPaymentIntent::new("cus_1", 2500))
        .unwrap();
    harness
        .engine
        .attach_payment_method(&intent.id, &pm.id)
        .unwrap();

    let intent = harness
        .engine
        .confirm_payment_intent(&intent.id, None)
        .await
        .unwrap();

    assert_eq!(intent.status, PaymentIntentStatus::Succeeded);
    assert_eq!(intent.provider_ref.as_deref(), Some("charge_tok_visa"));
    assert_eq!(processor.calls(), vec!["charge:tok_visa:2500"]);
}

#[tokio::test]
async fn manual_capture_authorizes_then_captures() {
    let processor = FakeProcessor::new();
    let harness = TestHarness::new().with_processor(processor.clone());
    let pm = card(&harness, "cus_1");
    let intent = harness
        .engine
        .create_payment_intent(NewPaymentIntent::new("cus_1", 2500).manual_capture())
        .unwrap();

    let authorized = harness
        .engine
        .confirm_payment_intent(&intent.id, Some(pm.id))
        .await
        .unwrap();
    assert_eq!(authorized.status, PaymentIntentStatus::RequiresCapture);
    assert_eq!(authorized.amount_capturable, 2500);

    let too_much = harness
        .engine
        .capture_payment_intent(&intent.id, Some(3000))
        .await;
    assert!(matches!(too_much, Err(BillingError::Validation(_))));

    let captured = harness
        .engine
        .capture_payment_intent(&intent.id, Some(2000))
        .await
        .unwrap();
    assert_eq!(captured.status, PaymentIntentStatus::Succeeded);
    assert_eq!(captured.amount_received, 2000);
    assert_eq!(
        processor.calls(),
        vec!["authorize:tok_visa:2500", "capture:authorize_tok_visa:2000"]
    );
}

#[tokio::test]
async fn declined_charge_needs_a_new_payment_method() {
    let harness = TestHarness::new().with_processor(FakeProcessor::failing());
    let pm = card(&harness, "cus_1");
    let intent = harness
        .engine
        .create_payment_intent(NewPaymentIntent::new("cus_1", 2500))
        .unwrap();

    let result = harness
        .engine
        .confirm_payment_intent(&intent.id, Some(pm.id))
        .await;
    assert!(matches!(result, Err(BillingError::External { .. })));

    let intent = harness.engine.get_payment_intent(&intent.id).unwrap();
    assert_eq!(intent.status, PaymentIntentStatus::RequiresPaymentMethod);
    assert!(intent.last_error.is_some());
    assert_eq!(
        harness.count_events(event_types::PAYMENT_INTENT_PAYMENT_FAILED),
        1
    );
}

#[tokio::test]
async fn offline_processor_falls_back_to_internal_settlement() {
    let processor = FakeProcessor::new();
    processor
        .offline
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let harness = TestHarness::new().with_processor(processor.clone());
    let pm = card(&harness, "cus_1");
    let intent = harness
        .engine
        .create_payment_intent(NewPaymentIntent::new("cus_1", 900))
        .unwrap();

    let intent = harness
        .engine
        .confirm_payment_intent(&intent.id, Some(pm.id))
        .await
        .unwrap();

    assert_eq!(intent.provider_ref.as_deref(), Some(INTERNAL_PROVIDER_REF));
    assert!(processor.calls().is_empty());
}

#[tokio::test]
async fn confirm_without_payment_method_fails() {
    let harness = TestHarness::new();
    let intent = harness
        .engine
        .create_payment_intent(NewPaymentIntent::new("cus_1", 100))
        .unwrap();

    let result = harness.engine.confirm_payment_intent(&intent.id, None).await;

    assert!(matches!(result, Err(BillingError::Validation(_))));
}

#[test]
fn payment_method_of_another_customer_is_rejected() {
    let harness = TestHarness::new();
    let pm = card(&harness, "cus_2");
    let intent = harness
        .engine
        .create_payment_intent(NewPaymentIntent::new("cus_1", 100))
        .unwrap();

    let result = harness.engine.attach_payment_method(&intent.id, &pm.id);

    assert!(matches!(result, Err(BillingError::Validation(_))));
}

#[test]
fn intent_amount_must_be_positive() {
    let harness = TestHarness::new();

    let result = harness
        .engine
        .create_payment_intent(NewPaymentIntent::new("cus_1", 0));

    assert!(matches!(result, Err(BillingError::Validation(_))));
}

#[tokio::test]
async fn succeeded_intent_cannot_be_canceled() {
    let harness = TestHarness::new();
    let pm = card(&harness, "cus_1");
    let open = harness
        .engine
        .create_payment_intent(NewPaymentIntent::new("cus_1", 100))
        .unwrap();
    let canceled = harness
        .engine
        .cancel_payment_intent(&open.id, "duplicate")
        .unwrap();
    assert_eq!(canceled.status, PaymentIntentStatus::Canceled);
    assert_eq!(canceled.cancellation_reason.as_deref(), Some("duplicate"));

    let settled = harness
        .engine
        .create_payment_intent(NewPaymentIntent::new("cus_1", 100))
        .unwrap();
    harness
        .engine
        .confirm_payment_intent(&settled.id, Some(pm.id))
        .await
        .unwrap();
    let result = harness.engine.cancel_payment_intent(&settled.id, "too late");
    assert!(matches!(result, Err(BillingError::InvalidState { .. })));
}

// ============================================================================
// Setup intents
// ============================================================================

#[test]
fn setup_intent_succeeds_with_provider_token() {
    let harness = TestHarness::new();
    let pm = card(&harness, "cus_1");
    let intent = harness
        .engine
        .create_setup_intent(&CustomerId::from("cus_1"))
        .unwrap();

    let intent = harness
        .engine
        .confirm_setup_intent(&intent.id, Some(pm.id))
        .unwrap();

    assert_eq!(intent.status, SetupIntentStatus::Succeeded);
    assert_eq!(intent.provider_ref.as_deref(), Some("tok_visa"));

    let cancel = harness.engine.cancel_setup_intent(&intent.id, "late");
    assert!(matches!(cancel, Err(BillingError::InvalidState { .. })));
}

#[test]
fn unknown_payment_method_id_is_used_as_token() {
    let harness = TestHarness::new();
    let intent = harness
        .engine
        .create_setup_intent(&CustomerId::from("cus_1"))
        .unwrap();

    let intent = harness
        .engine
        .confirm_setup_intent(&intent.id, Some("pm_external".into()))
        .unwrap();

    assert_eq!(intent.provider_ref.as_deref(), Some("pm_external"));
}

// ============================================================================
// Refunds
// ============================================================================

#[tokio::test]
async fn refund_of_paid_invoice_credits_balance() {
    let harness = TestHarness::new();
    let invoice = paid_invoice(&harness, "cus_1", 1000);
    assert_eq!(invoice.status, InvoiceStatus::Paid);
    assert_eq!(harness.balance("cus_1"), 0);

    let refund = harness
        .engine
        .create_refund(RefundParams::for_invoice(invoice.id.clone()).amount(400))
        .await
        .unwrap();
    assert_eq!(refund.status, RefundStatus::Succeeded);
    assert_eq!(refund.source, RefundSource::Invoice(invoice.id.clone()));
    assert_eq!(harness.balance("cus_1"), 400);

    // Only 600 remains refundable.
    let over = harness
        .engine
        .create_refund(RefundParams::for_invoice(invoice.id.clone()).amount(700))
        .await;
    assert!(matches!(over, Err(BillingError::Validation(_))));

    let rest = harness
        .engine
        .create_refund(RefundParams::for_invoice(invoice.id.clone()))
        .await
        .unwrap();
    assert_eq!(rest.amount, 600);
    assert_eq!(harness.balance("cus_1"), 1000);
    assert_eq!(
        harness
            .engine
            .list_refunds(&CustomerId::from("cus_1"))
            .unwrap()
            .len(),
        2
    );
}

#[tokio::test]
async fn refund_of_processor_payment_goes_through_processor() {
    let processor = FakeProcessor::new();
    let harness = TestHarness::new().with_processor(processor.clone());
    let pm = card(&harness, "cus_1");
    let intent = harness
        .engine
        .create_payment_intent(NewPaymentIntent::new("cus_1", 2500))
        .unwrap();
    harness
        .engine
        .confirm_payment_intent(&intent.id, Some(pm.id))
        .await
        .unwrap();

    let refund = harness
        .engine
        .create_refund(RefundParams::for_payment_intent(intent.id.clone()).amount(500))
        .await
        .unwrap();

    assert_eq!(refund.status, RefundStatus::Succeeded);
    assert_eq!(refund.provider_ref.as_deref(), Some("refund_charge_tok_visa"));
    assert_eq!(processor.calls().last().map(String::as_str), Some("refund:charge_tok_visa:500"));
    assert_eq!(harness.balance("cus_1"), 0);
}

#[tokio::test]
async fn failed_processor_refund_is_recorded() {
    let processor = FakeProcessor::new();
    let harness = TestHarness::new().with_processor(processor.clone());
    let pm = card(&harness, "cus_1");
    let intent = harness
        .engine
        .create_payment_intent(NewPaymentIntent::new("cus_1", 2500))
        .unwrap();
    harness
        .engine
        .confirm_payment_intent(&intent.id, Some(pm.id))
        .await
        .unwrap();
    processor
        .failing
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let result = harness
        .engine
        .create_refund(RefundParams::for_payment_intent(intent.id.clone()))
        .await;
    assert!(matches!(result, Err(BillingError::External { .. })));

    let refunds = harness
        .engine
        .list_refunds(&CustomerId::from("cus_1"))
        .unwrap();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].status, RefundStatus::Failed);
    assert_eq!(harness.count_events(event_types::REFUND_FAILED), 1);
}

#[tokio::test]
async fn refund_needs_exactly_one_source() {
    let harness = TestHarness::new();

    let none = harness.engine.create_refund(RefundParams::default()).await;
    assert!(matches!(none, Err(BillingError::Validation(_))));

    let both = RefundParams {
        payment_intent_id: Some("pi_1".into()),
        invoice_id: Some("in_1".into()),
        ..RefundParams::default()
    };
    let both = harness.engine.create_refund(both).await;
    assert!(matches!(both, Err(BillingError::Validation(_))));
}

#[tokio::test]
async fn unpaid_invoice_cannot_be_refunded() {
    let harness = TestHarness::new();
    let invoice = harness
        .engine
        .create_invoice(NewInvoice::for_customer("cus_1"))
        .unwrap();

    let result = harness
        .engine
        .create_refund(RefundParams::for_invoice(invoice.id))
        .await;

    assert!(matches!(result, Err(BillingError::InvalidState { .. })));
}

// ============================================================================
// Credit notes
// ============================================================================

#[test]
fn credit_notes_are_numbered_in_sequence() {
    let harness = TestHarness::new();
    let invoice = paid_invoice(&harness, "cus_1", 1000);

    let mut params = CreditNoteParams::for_invoice(invoice.id.clone());
    params.amount = Some(300);
    let first = harness.engine.create_credit_note(params.clone()).unwrap();
    let second = harness.engine.create_credit_note(params).unwrap();

    assert_eq!(first.number, "CN-0001");
    assert_eq!(second.number, "CN-0002");
    assert_eq!(first.status, CreditNoteStatus::Issued);
    let notes = harness.engine.list_credit_notes(&invoice.id).unwrap();
    assert_eq!(notes.len(), 2);
}

#[test]
fn credit_notes_cannot_exceed_invoice_total() {
    let harness = TestHarness::new();
    let invoice = paid_invoice(&harness, "cus_1", 1000);

    let mut params = CreditNoteParams::for_invoice(invoice.id.clone());
    params.amount = Some(800);
    harness.engine.create_credit_note(params.clone()).unwrap();

    let result = harness.engine.create_credit_note(params);
    assert!(matches!(result, Err(BillingError::Validation(_))));
}

#[test]
fn credit_note_amount_defaults_to_lines_plus_out_of_band() {
    let harness = TestHarness::new();
    let invoice = paid_invoice(&harness, "cus_1", 1000);

    let mut params = CreditNoteParams::for_invoice(invoice.id.clone());
    params.line_items = vec![LineItem::new(LineItemKind::OneOff, "Returned seat", 250)];
    params.out_of_band_amount = 50;
    let note = harness.engine.create_credit_note(params).unwrap();

    assert_eq!(note.amount, 300);
}

#[test]
fn voiding_a_balance_credit_note_reverses_the_credit() {
    let harness = TestHarness::new();
    let invoice = paid_invoice(&harness, "cus_1", 1000);

    let mut params = CreditNoteParams::for_invoice(invoice.id.clone());
    params.amount = Some(400);
    params.credit_to_balance = true;
    let note = harness.engine.create_credit_note(params).unwrap();
    assert_eq!(harness.balance("cus_1"), 400);

    let voided = harness.engine.void_credit_note(&note.id).unwrap();
    assert_eq!(voided.status, CreditNoteStatus::Void);
    assert_eq!(harness.balance("cus_1"), 0);

    let again = harness.engine.void_credit_note(&note.id);
    assert!(matches!(again, Err(BillingError::InvalidState { .. })));
    assert_eq!(harness.count_events(event_types::CREDIT_NOTE_VOIDED), 1);
}

#[test]
fn draft_invoice_cannot_be_credited() {
    let harness = TestHarness::new();
    let invoice = harness
        .engine
        .create_invoice(NewInvoice::for_customer("cus_1"))
        .unwrap();

    let mut params = CreditNoteParams::for_invoice(invoice.id);
    params.amount = Some(100);
    let result = harness.engine.create_credit_note(params);

    assert!(matches!(result, Err(BillingError::InvalidState { .. })));
}

// ============================================================================
// Payouts
// ============================================================================

#[test]
fn payout_moves_through_transit_to_paid() {
    let harness = TestHarness::new();
    let payout = harness
        .engine
        .create_payout(10_000, None, "acct_bank_1")
        .unwrap();
    assert_eq!(payout.status, PayoutStatus::Pending);
    assert_eq!(payout.currency, "usd");

    let early = harness.engine.mark_payout_paid(&payout.id);
    assert!(matches!(early, Err(BillingError::InvalidState { .. })));

    harness.engine.mark_payout_in_transit(&payout.id).unwrap();
    let paid = harness.engine.mark_payout_paid(&payout.id).unwrap();
    assert_eq!(paid.status, PayoutStatus::Paid);
    assert!(paid.arrival_date.is_some());

    let cancel = harness.engine.cancel_payout(&payout.id);
    assert!(matches!(cancel, Err(BillingError::InvalidState { .. })));
}

#[test]
fn failed_payout_keeps_the_message() {
    let harness = TestHarness::new();
    let payout = harness
        .engine
        .create_payout(500, Some("EUR"), "acct_bank_1")
        .unwrap();
    assert_eq!(payout.currency, "eur");

    let failed = harness
        .engine
        .mark_payout_failed(&payout.id, "account closed")
        .unwrap();

    assert_eq!(failed.status, PayoutStatus::Failed);
    assert_eq!(failed.failure_message.as_deref(), Some("account closed"));
    assert_eq!(harness.count_events(event_types::PAYOUT_FAILED), 1);
}

#[test]
fn payout_requires_positive_amount_and_destination() {
    let harness = TestHarness::new();

    let zero = harness.engine.create_payout(0, None, "acct_bank_1");
    assert!(matches!(zero, Err(BillingError::Validation(_))));

    let nowhere = harness.engine.create_payout(100, None, " ");
    assert!(matches!(nowhere, Err(BillingError::Validation(_))));
}
