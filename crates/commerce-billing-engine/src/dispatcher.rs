//! Webhook dispatcher: drains the event outbox.
//!
//! Each drain reads the outbox index for events that are due, posts every one of them to
//! the enabled endpoints that subscribe to its type and have not received it yet, and
//! records the round on the event. Endpoints are independent: one failing never blocks the
//! others, and an endpoint that already received an event is never sent it again.

use futures::future::join_all;
use reqwest::header::CONTENT_TYPE;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use commerce_billing_core::{BillingError, BillingEvent, OutboxEntry, Result, WebhookEndpoint};
use commerce_billing_store::StoreExt;

use crate::crypto::{sign_payload, SIGNATURE_HEADER};
use crate::engine::BillingEngine;
use crate::events::sync_outbox;

/// Counts from one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Events processed.
    pub events: usize,
    /// Successful endpoint deliveries.
    pub delivered: usize,
    /// Failed endpoint deliveries.
    pub failed: usize,
}

/// Posts pending events to webhook endpoints.
pub struct WebhookDispatcher {
    engine: BillingEngine,
    client: reqwest::Client,
}

impl WebhookDispatcher {
    /// Create a dispatcher with an HTTP client using the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the HTTP client cannot be built.
    pub fn new(engine: BillingEngine) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(engine.config().webhook.timeout)
            .build()
            .map_err(|e| BillingError::Configuration(format!("webhook http client: {e}")))?;
        Ok(Self { engine, client })
    }

    /// Run the dispatcher on its own task until `shutdown` turns true.
    #[must_use]
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Drain, then sleep until woken by a new event, the poll interval, or shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let wake = self.engine.dispatch_signal().clone();
        let poll_interval = self.engine.config().webhook.poll_interval;
        tracing::info!(poll_interval_ms = poll_interval.as_millis(), "Webhook dispatcher started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.drain_once().await {
                Ok(report) if report.events > 0 => {
                    tracing::debug!(
                        events = report.events,
                        delivered = report.delivered,
                        failed = report.failed,
                        "Webhook drain complete"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Webhook drain failed"),
            }

            tokio::select! {
                () = wake.notified() => {}
                () = tokio::time::sleep(poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Webhook dispatcher stopped");
    }

    /// Deliver every pending event that is due now.
    ///
    /// Only the outbox index is scanned; delivered and dead events are never read again.
    ///
    /// # Errors
    ///
    /// Returns a storage error if events cannot be read or updated. Delivery failures are
    /// recorded on the event, not returned.
    pub async fn drain_once(&self) -> Result<DrainReport> {
        let store = self.engine.store();
        let now = self.engine.now();
        let due = store.query::<OutboxEntry>(|entry| entry.is_due(now))?;
        if due.is_empty() {
            return Ok(DrainReport::default());
        }
        let endpoints = store.query::<WebhookEndpoint>(|e| e.enabled)?;

        let mut report = DrainReport::default();
        for entry in due {
            let event = store.get::<BillingEvent>(entry.event_id.as_str())?;
            let Some(event) = event.filter(|e| e.is_due(now)) else {
                tracing::debug!(event_id = %entry.event_id, "Stale outbox entry, resyncing");
                store.transaction(|tx| {
                    match tx.get::<BillingEvent>(entry.event_id.as_str())? {
                        Some(current) => sync_outbox(tx, &current)?,
                        None => tx.delete::<OutboxEntry>(entry.event_id.as_str()),
                    }
                    Ok::<_, BillingError>(())
                })?;
                continue;
            };

            let targets: Vec<&WebhookEndpoint> = endpoints
                .iter()
                .filter(|ep| ep.matches(&event.event_type) && !event.was_delivered_to(&ep.id))
                .collect();

            let body = serde_json::to_string(&event.to_payload())
                .map_err(|e| BillingError::Serialization(e.to_string()))?;
            let outcomes = join_all(targets.iter().map(|ep| self.deliver(ep, &event, &body))).await;

            let delivered: Vec<_> = targets
                .iter()
                .zip(&outcomes)
                .filter(|(_, ok)| **ok)
                .map(|(ep, _)| ep.id.clone())
                .collect();
            let failed = outcomes.len() - delivered.len();
            report.events += 1;
            report.delivered += delivered.len();
            report.failed += failed;

            let webhook = &self.engine.config().webhook;
            let retry_after =
                chrono::Duration::from_std(webhook.backoff(event.delivery_attempts + 1))
                    .unwrap_or_else(|_| chrono::Duration::hours(1));
            store.transaction(|tx| {
                let mut current: BillingEvent = tx.require(event.id.as_str())?;
                current.record_delivery_round(
                    delivered,
                    failed,
                    webhook.max_attempts,
                    retry_after,
                    self.engine.now(),
                );
                if current.pending {
                    tracing::warn!(
                        event_id = %current.id,
                        attempts = current.delivery_attempts,
                        failed,
                        "Webhook delivery incomplete, will retry"
                    );
                } else if failed > 0 {
                    tracing::warn!(
                        event_id = %current.id,
                        attempts = current.delivery_attempts,
                        failed,
                        "Webhook delivery attempts exhausted"
                    );
                }
                tx.update(&current)?;
                sync_outbox(tx, &current)
            })?;
        }

        Ok(report)
    }

    /// Post one event to one endpoint. Returns whether the endpoint answered 2xx.
    async fn deliver(&self, endpoint: &WebhookEndpoint, event: &BillingEvent, body: &str) -> bool {
        let signature = sign_payload(&endpoint.secret, body, self.engine.now().timestamp());
        let result = self
            .client
            .post(&endpoint.url)
            .header(CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(body.to_owned())
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(
                    event_id = %event.id,
                    endpoint_id = %endpoint.id,
                    status = %response.status(),
                    "Webhook delivered"
                );
                true
            }
            Ok(response) => {
                tracing::warn!(
                    event_id = %event.id,
                    endpoint_id = %endpoint.id,
                    status = %response.status(),
                    "Webhook endpoint rejected delivery"
                );
                false
            }
            Err(e) => {
                tracing::warn!(
                    event_id = %event.id,
                    endpoint_id = %endpoint.id,
                    error = %e,
                    "Webhook delivery failed"
                );
                false
            }
        }
    }
}
