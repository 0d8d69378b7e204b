//! Webhook outbox and dispatcher integration tests.

mod common;

use std::time::Duration;

use common::TestHarness;
use serde_json::{json, Value};
use tokio::sync::watch;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use commerce_billing_core::{event_types, BillingError, BillingEvent, CustomerId, OutboxEntry};
use commerce_billing_engine::{
    verify_webhook_signature, DrainReport, EngineConfig, WebhookConfig, WebhookDispatcher,
    SIGNATURE_HEADER,
};
use commerce_billing_store::StoreExt;

fn harness_without_backoff(max_attempts: u32) -> TestHarness {
    TestHarness::with_config(EngineConfig::default().with_webhook(WebhookConfig {
        initial_backoff: Duration::ZERO,
        max_attempts,
        ..WebhookConfig::default()
    }))
}

fn emit_paid(harness: &TestHarness) -> BillingEvent {
    harness
        .engine
        .emit_billing_event(
            event_types::INVOICE_PAID,
            "invoice",
            "in_1",
            Some(&CustomerId::from("cus_1")),
            json!({"id": "in_1", "amount_paid": 1000}),
            None,
        )
        .unwrap()
}

async fn respond(server: &MockServer, route: &str, status: u16) {
    Mock::given(method("POST"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

async fn requests_to(server: &MockServer, route: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == route)
        .count()
}

async fn dispatcher_drain(harness: &TestHarness) -> DrainReport {
    WebhookDispatcher::new(harness.engine.clone())
        .unwrap()
        .drain_once()
        .await
        .unwrap()
}

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test]
async fn delivers_signed_payload() {
    let server = MockServer::start().await;
    respond(&server, "/hooks", 200).await;
    let harness = TestHarness::new();
    let endpoint = harness
        .engine
        .create_webhook_endpoint(&format!("{}/hooks", server.uri()), Vec::new(), None)
        .unwrap();
    assert!(endpoint.secret.starts_with("whsec_"));
    let event = emit_paid(&harness);
    let dispatcher = WebhookDispatcher::new(harness.engine.clone()).unwrap();

    let report = dispatcher.drain_once().await.unwrap();

    assert_eq!(report.events, 1);
    assert_eq!(report.delivered, 1);
    assert_eq!(report.failed, 0);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body = String::from_utf8(requests[0].body.clone()).unwrap();
    let header = requests[0]
        .headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .expect("signature header");
    verify_webhook_signature(&body, header, &endpoint.secret).unwrap();
    assert!(matches!(
        verify_webhook_signature(&body, header, "whsec_wrong"),
        Err(BillingError::SignatureMismatch)
    ));

    let payload: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(payload["type"], "invoice.paid");
    assert_eq!(payload["objectId"], "in_1");
    assert_eq!(payload["data"]["amount_paid"], 1000);

    let stored = harness.engine.get_event(event.id.as_str()).unwrap();
    assert!(!stored.pending);
    assert_eq!(stored.delivered_to, vec![endpoint.id]);
}

#[test]
fn state_changes_are_queued_for_delivery() {
    let harness = TestHarness::new();

    harness.fund("cus_1", 500);

    let events = harness
        .engine
        .list_events(Some(&CustomerId::from("cus_1")))
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, event_types::CUSTOMER_BALANCE_UPDATED);
    assert!(events[0].pending);
    assert_eq!(events[0].data["balance"], 500);
}

#[tokio::test]
async fn unsubscribed_and_disabled_endpoints_are_skipped() {
    let server = MockServer::start().await;
    respond(&server, "/refunds", 200).await;
    respond(&server, "/disabled", 200).await;
    let harness = TestHarness::new();
    harness
        .engine
        .create_webhook_endpoint(
            &format!("{}/refunds", server.uri()),
            vec![event_types::REFUND_CREATED.to_string()],
            None,
        )
        .unwrap();
    let disabled = harness
        .engine
        .create_webhook_endpoint(&format!("{}/disabled", server.uri()), Vec::new(), None)
        .unwrap();
    harness
        .engine
        .set_webhook_endpoint_enabled(&disabled.id, false)
        .unwrap();
    let event = emit_paid(&harness);
    let dispatcher = WebhookDispatcher::new(harness.engine.clone()).unwrap();

    let report = dispatcher.drain_once().await.unwrap();

    assert_eq!(report.events, 1);
    assert_eq!(report.delivered, 0);
    assert!(server.received_requests().await.unwrap().is_empty());
    assert!(!harness.engine.get_event(event.id.as_str()).unwrap().pending);
}

#[test]
fn endpoint_url_must_be_absolute() {
    let harness = TestHarness::new();

    let result = harness
        .engine
        .create_webhook_endpoint("/relative/hooks", Vec::new(), None);

    assert!(matches!(result, Err(BillingError::Validation(_))));
}

// ============================================================================
// Retries
// ============================================================================

#[tokio::test]
async fn failed_delivery_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    respond(&server, "/hooks", 200).await;
    let harness = harness_without_backoff(5);
    harness
        .engine
        .create_webhook_endpoint(&format!("{}/hooks", server.uri()), Vec::new(), None)
        .unwrap();
    let event = emit_paid(&harness);
    let dispatcher = WebhookDispatcher::new(harness.engine.clone()).unwrap();

    let first = dispatcher.drain_once().await.unwrap();
    assert_eq!(first.failed, 1);
    let stored = harness.engine.get_event(event.id.as_str()).unwrap();
    assert!(stored.pending);
    assert_eq!(stored.delivery_attempts, 1);

    let second = dispatcher.drain_once().await.unwrap();
    assert_eq!(second.delivered, 1);
    let stored = harness.engine.get_event(event.id.as_str()).unwrap();
    assert!(!stored.pending);
    assert_eq!(stored.delivery_attempts, 2);
    assert_eq!(requests_to(&server, "/hooks").await, 2);
}

#[tokio::test]
async fn retry_skips_endpoints_that_already_received_the_event() {
    let server = MockServer::start().await;
    respond(&server, "/ok", 200).await;
    respond(&server, "/broken", 503).await;
    let harness = harness_without_backoff(5);
    for route in ["/ok", "/broken"] {
        harness
            .engine
            .create_webhook_endpoint(&format!("{}{route}", server.uri()), Vec::new(), None)
            .unwrap();
    }
    emit_paid(&harness);
    let dispatcher = WebhookDispatcher::new(harness.engine.clone()).unwrap();

    let first = dispatcher.drain_once().await.unwrap();
    assert_eq!(first.delivered, 1);
    assert_eq!(first.failed, 1);
    let second = dispatcher.drain_once().await.unwrap();
    assert_eq!(second.delivered, 0);
    assert_eq!(second.failed, 1);

    assert_eq!(requests_to(&server, "/ok").await, 1);
    assert_eq!(requests_to(&server, "/broken").await, 2);
}

#[tokio::test]
async fn delivery_stops_after_max_attempts() {
    let server = MockServer::start().await;
    respond(&server, "/hooks", 500).await;
    let harness = harness_without_backoff(2);
    harness
        .engine
        .create_webhook_endpoint(&format!("{}/hooks", server.uri()), Vec::new(), None)
        .unwrap();
    let event = emit_paid(&harness);
    let dispatcher = WebhookDispatcher::new(harness.engine.clone()).unwrap();

    dispatcher.drain_once().await.unwrap();
    dispatcher.drain_once().await.unwrap();
    let third = dispatcher.drain_once().await.unwrap();

    assert_eq!(third.events, 0);
    let stored = harness.engine.get_event(event.id.as_str()).unwrap();
    assert!(!stored.pending);
    assert_eq!(stored.delivery_attempts, 2);
    assert!(stored.delivered_to.is_empty());
}

#[tokio::test]
async fn finished_events_leave_the_outbox_but_stay_in_the_log() {
    let server = MockServer::start().await;
    respond(&server, "/hooks", 200).await;
    let harness = TestHarness::new();
    harness
        .engine
        .create_webhook_endpoint(&format!("{}/hooks", server.uri()), Vec::new(), None)
        .unwrap();
    let event = emit_paid(&harness);
    harness.fund("cus_1", 500);
    let logged = harness.engine.list_events(None).unwrap().len();

    let queued: Vec<OutboxEntry> = harness.engine.store().get_all().unwrap();
    assert!(queued.iter().any(|entry| entry.event_id == event.id));
    assert_eq!(queued.len(), logged);

    let first = dispatcher_drain(&harness).await;
    assert_eq!(first.events, logged);

    let remaining: Vec<OutboxEntry> = harness.engine.store().get_all().unwrap();
    assert!(remaining.is_empty());
    let events = harness.engine.list_events(None).unwrap();
    assert_eq!(events.len(), logged);
    assert!(events.iter().all(|e| !e.pending));
    assert_eq!(dispatcher_drain(&harness).await.events, 0);
}

#[tokio::test]
async fn retried_event_keeps_its_outbox_entry_until_final() {
    let server = MockServer::start().await;
    respond(&server, "/hooks", 500).await;
    let harness = TestHarness::new();
    harness
        .engine
        .create_webhook_endpoint(&format!("{}/hooks", server.uri()), Vec::new(), None)
        .unwrap();
    let event = emit_paid(&harness);

    dispatcher_drain(&harness).await;

    let entry: OutboxEntry = harness
        .engine
        .store()
        .require(event.id.as_str())
        .unwrap();
    let stored = harness.engine.get_event(event.id.as_str()).unwrap();
    assert_eq!(entry.next_delivery_at, stored.next_delivery_at);
    assert!(!entry.is_due(harness.engine.now()));
}

#[tokio::test]
async fn backoff_delays_the_next_round() {
    let server = MockServer::start().await;
    respond(&server, "/hooks", 500).await;
    let harness = TestHarness::new();
    harness
        .engine
        .create_webhook_endpoint(&format!("{}/hooks", server.uri()), Vec::new(), None)
        .unwrap();
    let event = emit_paid(&harness);
    let dispatcher = WebhookDispatcher::new(harness.engine.clone()).unwrap();

    dispatcher.drain_once().await.unwrap();
    let again = dispatcher.drain_once().await.unwrap();

    assert_eq!(again.events, 0);
    let stored = harness.engine.get_event(event.id.as_str()).unwrap();
    assert!(stored.pending);
    assert!(stored.next_delivery_at.unwrap() > stored.created_at);
}

// ============================================================================
// Background loop
// ============================================================================

#[tokio::test]
async fn running_dispatcher_delivers_new_events() {
    let server = MockServer::start().await;
    respond(&server, "/hooks", 200).await;
    let harness = TestHarness::new();
    harness
        .engine
        .create_webhook_endpoint(&format!("{}/hooks", server.uri()), Vec::new(), None)
        .unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = WebhookDispatcher::new(harness.engine.clone())
        .unwrap()
        .spawn(shutdown_rx);

    emit_paid(&harness);
    let mut received = 0;
    for _ in 0..100 {
        received = requests_to(&server, "/hooks").await;
        if received > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(received, 1);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("dispatcher stops on shutdown")
        .unwrap();
}
