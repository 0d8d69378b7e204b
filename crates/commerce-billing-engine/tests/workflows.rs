//! Subscription lifecycle and dunning workflow tests.
//!
//! All tests run on paused tokio time: the runtime jumps straight to the next timer whenever
//! every task is idle, so months of billing pass instantly.

mod common;

use std::time::Duration;

use common::TestHarness;

use commerce_billing_core::{
    event_types, BillingError, CustomerId, InvoiceStatus, LineItemKind, Plan, Subscription,
    SubscriptionStatus,
};
use commerce_billing_engine::{
    LifecycleOutcome, NewSubscription, Signal, WorkflowPhase, WorkflowRun, WorkflowRunner,
};
use commerce_billing_store::StoreExt;

const HOUR: u64 = 60 * 60;
const DAY: u64 = 24 * HOUR;

fn days(n: u64) -> Duration {
    Duration::from_secs(n * DAY)
}

fn runner(harness: &TestHarness) -> WorkflowRunner {
    WorkflowRunner::new(harness.engine.clone())
}

fn basic() -> Plan {
    Plan::monthly("basic", "Basic", 1000)
}

fn subscription(harness: &TestHarness, sub: &Subscription) -> Subscription {
    harness.engine.get_subscription(&sub.id).unwrap()
}

fn workflow_run(harness: &TestHarness, sub: &Subscription) -> WorkflowRun {
    harness
        .engine
        .store()
        .get::<WorkflowRun>(sub.id.as_str())
        .unwrap()
        .expect("workflow checkpoint")
}

// ============================================================================
// Trial and renewal
// ============================================================================

#[tokio::test(start_paused = true)]
async fn trial_ends_then_period_renews_from_balance() {
    let harness = TestHarness::paused();
    harness.fund("cus_1", 5000);
    let runner = runner(&harness);

    let sub = runner
        .start_subscription(NewSubscription::new("cus_1", basic().with_trial_days(14)))
        .unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Trialing);

    tokio::time::sleep(days(15)).await;
    let after_trial = subscription(&harness, &sub);
    assert_eq!(after_trial.status, SubscriptionStatus::Active);
    assert_eq!(harness.count_events(event_types::SUBSCRIPTION_TRIAL_ENDED), 1);
    assert_eq!(workflow_run(&harness, &sub).phase, WorkflowPhase::Renewal);
    assert!(harness
        .engine
        .list_invoices(&CustomerId::from("cus_1"))
        .unwrap()
        .is_empty());

    // The first period starts when the trial ends and lasts a calendar month.
    tokio::time::sleep(days(31)).await;
    let renewed = subscription(&harness, &sub);
    assert_eq!(renewed.status, SubscriptionStatus::Active);
    assert_eq!(renewed.current_period_start, after_trial.current_period_end);

    let invoices = harness
        .engine
        .list_invoices(&CustomerId::from("cus_1"))
        .unwrap();
    assert_eq!(invoices.len(), 1);
    assert_eq!(invoices[0].status, InvoiceStatus::Paid);
    assert_eq!(invoices[0].amount_due, 1000);
    assert_eq!(invoices[0].period_start, Some(after_trial.current_period_start));
    assert_eq!(renewed.latest_invoice_id, Some(invoices[0].id.clone()));
    assert_eq!(harness.balance("cus_1"), 4000);

    runner
        .signal(&sub.id, Signal::Cancel { at_period_end: false })
        .unwrap();
    let outcome = runner.wait(&sub.id).await.unwrap();
    assert_eq!(outcome, LifecycleOutcome::Canceled);
    assert_eq!(subscription(&harness, &sub).status, SubscriptionStatus::Canceled);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_trial_is_immediate() {
    let harness = TestHarness::paused();
    let runner = runner(&harness);
    let sub = runner
        .start_subscription(NewSubscription::new("cus_1", basic().with_trial_days(14)))
        .unwrap();

    runner
        .signal(&sub.id, Signal::Cancel { at_period_end: true })
        .unwrap();
    let outcome = runner.wait(&sub.id).await.unwrap();

    assert_eq!(outcome, LifecycleOutcome::Canceled);
    let canceled = subscription(&harness, &sub);
    assert_eq!(canceled.status, SubscriptionStatus::Canceled);
    assert!(canceled.ended_at.is_some());
    assert_eq!(harness.count_events(event_types::SUBSCRIPTION_TRIAL_ENDED), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_at_period_end_skips_the_renewal_invoice() {
    let harness = TestHarness::paused();
    harness.fund("cus_1", 5000);
    let runner = runner(&harness);
    let sub = runner
        .start_subscription(NewSubscription::new("cus_1", basic()))
        .unwrap();

    runner
        .signal(&sub.id, Signal::Cancel { at_period_end: true })
        .unwrap();
    tokio::time::sleep(Duration::from_secs(HOUR)).await;
    let pending = subscription(&harness, &sub);
    assert!(pending.cancel_at_period_end);
    assert_eq!(pending.status, SubscriptionStatus::Active);

    let outcome = runner.wait(&sub.id).await.unwrap();

    assert_eq!(outcome, LifecycleOutcome::Canceled);
    let ended = subscription(&harness, &sub);
    assert_eq!(ended.status, SubscriptionStatus::Canceled);
    assert!(ended.ended_at.expect("ended") >= sub.current_period_end);
    assert!(harness
        .engine
        .list_invoices(&CustomerId::from("cus_1"))
        .unwrap()
        .is_empty());
    assert_eq!(harness.balance("cus_1"), 5000);
    assert_eq!(workflow_run(&harness, &sub).phase, WorkflowPhase::Completed);
}

#[tokio::test(start_paused = true)]
async fn plan_change_is_prorated_on_the_next_invoice() {
    let harness = TestHarness::paused();
    harness.fund("cus_1", 100_000);
    let runner = runner(&harness);
    let sub = runner
        .start_subscription(NewSubscription::new(
            "cus_1",
            Plan::monthly("basic", "Basic", 3100),
        ))
        .unwrap();

    // January has 31 days; 16 whole days remain late on the 15th.
    tokio::time::sleep(days(15) - Duration::from_secs(HOUR)).await;
    runner
        .signal(
            &sub.id,
            Signal::ChangePlan {
                plan: Plan::monthly("pro", "Pro", 6200),
                prorate: true,
            },
        )
        .unwrap();
    tokio::time::sleep(days(17)).await;

    let renewed = subscription(&harness, &sub);
    assert_eq!(renewed.plan.id.as_str(), "pro");
    assert!(renewed.pending_invoice_items.is_empty());

    let invoices = harness
        .engine
        .list_invoices(&CustomerId::from("cus_1"))
        .unwrap();
    assert_eq!(invoices.len(), 1);
    let invoice = &invoices[0];
    let proration = invoice
        .line_items
        .iter()
        .find(|l| l.kind == LineItemKind::Proration)
        .expect("proration line");
    assert_eq!(proration.amount, 3200 - 1600);
    assert_eq!(invoice.subtotal, 6200 + 1600);
    assert_eq!(invoice.status, InvoiceStatus::Paid);

    runner.shutdown();
}

// ============================================================================
// Dunning
// ============================================================================

#[tokio::test(start_paused = true)]
async fn exhausted_dunning_leaves_the_subscription_unpaid() {
    let harness = TestHarness::paused();
    let runner = runner(&harness);
    let sub = runner
        .start_subscription(NewSubscription::new("cus_1", basic()))
        .unwrap();

    let outcome = runner.wait(&sub.id).await.unwrap();

    assert_eq!(outcome, LifecycleOutcome::Unpaid);
    let ended = subscription(&harness, &sub);
    assert_eq!(ended.status, SubscriptionStatus::Unpaid);
    assert!(ended.ended_at.is_some());

    let invoice = harness
        .engine
        .get_invoice(ended.latest_invoice_id.as_ref().expect("renewal invoice"))
        .unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Uncollectible);
    // The renewal collection plus four dunning attempts.
    assert_eq!(invoice.attempt_count, 5);
    let last_attempt = invoice.last_attempt_at.expect("attempted");
    assert!(last_attempt >= sub.current_period_end + chrono::Duration::hours(24 + 72 + 168));
    assert_eq!(harness.count_events(event_types::INVOICE_PAYMENT_FAILED), 5);
    assert_eq!(
        harness.count_events(event_types::INVOICE_MARKED_UNCOLLECTIBLE),
        1
    );

    let run = workflow_run(&harness, &sub);
    assert_eq!(run.phase, WorkflowPhase::Completed);
    assert_eq!(run.outcome, Some(LifecycleOutcome::Unpaid));
}

#[tokio::test(start_paused = true)]
async fn dunning_collects_once_funds_arrive() {
    let harness = TestHarness::paused();
    let runner = runner(&harness);
    let sub = runner
        .start_subscription(NewSubscription::new("cus_1", basic()))
        .unwrap();

    // Renewal and the immediate dunning attempt both fail.
    tokio::time::sleep(days(31) + Duration::from_secs(HOUR)).await;
    let past_due = subscription(&harness, &sub);
    assert_eq!(past_due.status, SubscriptionStatus::PastDue);
    let invoice_id = past_due.latest_invoice_id.clone().expect("renewal invoice");
    let invoice = harness.engine.get_invoice(&invoice_id).unwrap();
    assert_eq!(invoice.attempt_count, 2);
    assert!(invoice.next_attempt_at.is_some());
    let run = workflow_run(&harness, &sub);
    assert_eq!(run.phase, WorkflowPhase::Dunning);
    assert_eq!(run.dunning_invoice_id, Some(invoice_id.clone()));

    harness.fund("cus_1", 1000);
    tokio::time::sleep(days(1)).await;

    let invoice = harness.engine.get_invoice(&invoice_id).unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Paid);
    assert_eq!(invoice.attempt_count, 3);
    assert_eq!(subscription(&harness, &sub).status, SubscriptionStatus::Active);
    assert_eq!(workflow_run(&harness, &sub).phase, WorkflowPhase::Renewal);
    assert!(runner.is_running(&sub.id));

    runner.shutdown();
}

#[tokio::test(start_paused = true)]
async fn payment_received_signal_stops_dunning() {
    let harness = TestHarness::paused();
    let runner = runner(&harness);
    let sub = runner
        .start_subscription(NewSubscription::new("cus_1", basic()))
        .unwrap();

    tokio::time::sleep(days(31) + Duration::from_secs(HOUR)).await;
    let invoice_id = subscription(&harness, &sub)
        .latest_invoice_id
        .expect("renewal invoice");

    harness
        .engine
        .mark_invoice_paid(&invoice_id, "wire", Some("wire-123".into()))
        .unwrap();
    runner
        .signal(
            &sub.id,
            Signal::PaymentReceived {
                invoice_id: invoice_id.clone(),
            },
        )
        .unwrap();
    tokio::time::sleep(Duration::from_secs(HOUR)).await;

    let invoice = harness.engine.get_invoice(&invoice_id).unwrap();
    assert_eq!(invoice.attempt_count, 2);
    assert_eq!(invoice.payment_method.as_deref(), Some("wire"));
    assert_eq!(subscription(&harness, &sub).status, SubscriptionStatus::Active);
    let run = workflow_run(&harness, &sub);
    assert_eq!(run.phase, WorkflowPhase::Renewal);
    assert!(run.dunning_invoice_id.is_none());
    assert!(runner.is_running(&sub.id));

    runner.shutdown();
}

#[tokio::test(start_paused = true)]
async fn payment_signal_for_an_open_invoice_keeps_the_schedule() {
    let harness = TestHarness::paused();
    let runner = runner(&harness);
    let sub = runner
        .start_subscription(NewSubscription::new("cus_1", basic()))
        .unwrap();

    tokio::time::sleep(days(31) + Duration::from_secs(HOUR)).await;
    let invoice_id = subscription(&harness, &sub)
        .latest_invoice_id
        .expect("renewal invoice");
    let waiting = workflow_run(&harness, &sub);
    assert_eq!(waiting.phase, WorkflowPhase::Dunning);

    // Nothing was paid, so the signal must not end dunning.
    runner
        .signal(
            &sub.id,
            Signal::PaymentReceived {
                invoice_id: invoice_id.clone(),
            },
        )
        .unwrap();
    tokio::time::sleep(Duration::from_secs(HOUR)).await;
    let run = workflow_run(&harness, &sub);
    assert_eq!(run.phase, WorkflowPhase::Dunning);
    assert_eq!(run.dunning_invoice_id.as_ref(), Some(&invoice_id));
    assert_eq!(run.dunning_attempt, waiting.dunning_attempt);
    assert_eq!(run.wake_at, waiting.wake_at);

    let outcome = runner.wait(&sub.id).await.unwrap();

    assert_eq!(outcome, LifecycleOutcome::Unpaid);
    let invoice = harness.engine.get_invoice(&invoice_id).unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Uncollectible);
    assert_eq!(invoice.attempt_count, 5);
    assert_eq!(harness.count_events(event_types::INVOICE_PAYMENT_FAILED), 5);
}

// ============================================================================
// Durability
// ============================================================================

#[tokio::test(start_paused = true)]
async fn resumed_workflow_continues_from_its_checkpoint() {
    let harness = TestHarness::paused();
    harness.fund("cus_1", 5000);
    let first = runner(&harness);
    let sub = first
        .start_subscription(NewSubscription::new("cus_1", basic()))
        .unwrap();
    tokio::time::sleep(days(10)).await;
    assert_eq!(workflow_run(&harness, &sub).wake_at, Some(sub.current_period_end));

    first.shutdown();
    assert!(!first.is_running(&sub.id));

    let second = runner(&harness);
    assert_eq!(second.resume_all().unwrap(), 1);
    assert_eq!(second.resume_all().unwrap(), 0);

    tokio::time::sleep(days(22)).await;
    let renewed = subscription(&harness, &sub);
    assert_eq!(renewed.status, SubscriptionStatus::Active);
    assert_eq!(renewed.current_period_start, sub.current_period_end);
    assert_eq!(
        harness
            .engine
            .list_invoices(&CustomerId::from("cus_1"))
            .unwrap()
            .len(),
        1
    );

    second.shutdown();
}

#[tokio::test(start_paused = true)]
async fn resume_picks_up_subscriptions_without_a_run() {
    let harness = TestHarness::paused();
    let ended = harness
        .engine
        .start_subscription(NewSubscription::new("cus_2", basic()))
        .unwrap();
    harness.engine.cancel_subscription(&ended.id, false).unwrap();
    let orphan = harness
        .engine
        .start_subscription(NewSubscription::new("cus_1", basic()))
        .unwrap();
    let runner = runner(&harness);

    assert_eq!(runner.resume_all().unwrap(), 1);
    assert!(runner.is_running(&orphan.id));
    assert!(!runner.is_running(&ended.id));

    runner.shutdown();
}

#[tokio::test(start_paused = true)]
async fn signal_without_workflow_is_not_found() {
    let harness = TestHarness::paused();
    let runner = runner(&harness);

    let result = runner.signal(
        &"sub_missing".into(),
        Signal::Cancel { at_period_end: false },
    );

    assert!(matches!(result, Err(BillingError::NotFound { .. })));
}

#[test]
fn starting_a_workflow_needs_a_runtime() {
    let harness = TestHarness::new();
    let runner = runner(&harness);

    let result = runner.start_subscription(NewSubscription::new("cus_1", basic()));

    assert!(matches!(result, Err(BillingError::Configuration(_))));
    assert!(harness
        .engine
        .list_subscriptions(&CustomerId::from("cus_1"))
        .unwrap()
        .is_empty());
}
