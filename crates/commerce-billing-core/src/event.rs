//! Billing events and webhook endpoints.
//!
//! Every state change the engine makes is recorded as an append-only [`BillingEvent`]. The
//! event row doubles as its own delivery outbox: it stays `pending` until each matching
//! [`WebhookEndpoint`] has received it or the delivery budget is spent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BillingError, Result};
use crate::ids::{CustomerId, EventId, WebhookEndpointId};

/// Event type names.
pub mod event_types {
    /// Usage reached a configured threshold.
    pub const USAGE_THRESHOLD_REACHED: &str = "usage.threshold_reached";
    /// A customer balance changed.
    pub const CUSTOMER_BALANCE_UPDATED: &str = "customer.balance.updated";

    /// Invoice drafted.
    pub const INVOICE_CREATED: &str = "invoice.created";
    /// Invoice line items changed.
    pub const INVOICE_UPDATED: &str = "invoice.updated";
    /// Invoice finalized.
    pub const INVOICE_FINALIZED: &str = "invoice.finalized";
    /// Invoice paid.
    pub const INVOICE_PAID: &str = "invoice.paid";
    /// Collection attempt failed.
    pub const INVOICE_PAYMENT_FAILED: &str = "invoice.payment_failed";
    /// Invoice voided.
    pub const INVOICE_VOIDED: &str = "invoice.voided";
    /// Invoice written off.
    pub const INVOICE_MARKED_UNCOLLECTIBLE: &str = "invoice.marked_uncollectible";

    /// Payment intent created.
    pub const PAYMENT_INTENT_CREATED: &str = "payment_intent.created";
    /// Payment intent submitted to the processor.
    pub const PAYMENT_INTENT_PROCESSING: &str = "payment_intent.processing";
    /// Payment intent settled.
    pub const PAYMENT_INTENT_SUCCEEDED: &str = "payment_intent.succeeded";
    /// Payment intent authorized, awaiting capture.
    pub const PAYMENT_INTENT_REQUIRES_CAPTURE: &str = "payment_intent.requires_capture";
    /// Payment intent failed at the processor.
    pub const PAYMENT_INTENT_PAYMENT_FAILED: &str = "payment_intent.payment_failed";
    /// Payment intent canceled.
    pub const PAYMENT_INTENT_CANCELED: &str = "payment_intent.canceled";
    /// Setup intent created.
    pub const SETUP_INTENT_CREATED: &str = "setup_intent.created";
    /// Setup intent verified.
    pub const SETUP_INTENT_SUCCEEDED: &str = "setup_intent.succeeded";
    /// Setup intent canceled.
    pub const SETUP_INTENT_CANCELED: &str = "setup_intent.canceled";

    /// Refund created.
    pub const REFUND_CREATED: &str = "refund.created";
    /// Refund failed at the processor.
    pub const REFUND_FAILED: &str = "refund.failed";
    /// Credit note issued.
    pub const CREDIT_NOTE_CREATED: &str = "credit_note.created";
    /// Credit note voided.
    pub const CREDIT_NOTE_VOIDED: &str = "credit_note.voided";

    /// Payout created.
    pub const PAYOUT_CREATED: &str = "payout.created";
    /// Payout submitted.
    pub const PAYOUT_IN_TRANSIT: &str = "payout.in_transit";
    /// Payout arrived.
    pub const PAYOUT_PAID: &str = "payout.paid";
    /// Payout failed.
    pub const PAYOUT_FAILED: &str = "payout.failed";
    /// Payout canceled.
    pub const PAYOUT_CANCELED: &str = "payout.canceled";

    /// Subscription created.
    pub const SUBSCRIPTION_CREATED: &str = "customer.subscription.created";
    /// Subscription changed (plan, status, cancellation flag).
    pub const SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";
    /// Subscription trial ended.
    pub const SUBSCRIPTION_TRIAL_ENDED: &str = "customer.subscription.trial_ended";
    /// Subscription ended.
    pub const SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";
}

/// An append-only record of a billing state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingEvent {
    /// Event identifier.
    pub id: EventId,
    /// Event type, see [`event_types`].
    pub event_type: String,
    /// Kind of object the event is about ("invoice", "refund", ...).
    pub object_type: String,
    /// Identifier of that object.
    pub object_id: String,
    /// Customer the object belongs to.
    pub customer_id: Option<CustomerId>,
    /// Snapshot of the object after the change.
    pub data: Value,
    /// Snapshot of the changed fields before the change.
    pub previous_data: Option<Value>,
    /// Whether the event happened in live mode.
    pub livemode: bool,
    /// Still awaiting webhook delivery.
    pub pending: bool,
    /// Delivery rounds attempted so far.
    pub delivery_attempts: u32,
    /// Earliest time of the next delivery round.
    pub next_delivery_at: Option<DateTime<Utc>>,
    /// Endpoints that already acknowledged the event.
    #[serde(default)]
    pub delivered_to: Vec<WebhookEndpointId>,
    /// When the event was recorded.
    pub created_at: DateTime<Utc>,
}

impl BillingEvent {
    /// Create a pending event due for immediate delivery.
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        object_type: impl Into<String>,
        object_id: impl Into<String>,
        customer_id: Option<CustomerId>,
        data: Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EventId::generate(),
            event_type: event_type.into(),
            object_type: object_type.into(),
            object_id: object_id.into(),
            customer_id,
            data,
            previous_data: None,
            livemode: false,
            pending: true,
            delivery_attempts: 0,
            next_delivery_at: Some(now),
            delivered_to: Vec::new(),
            created_at: now,
        }
    }

    /// Attach a previous-data snapshot.
    #[must_use]
    pub fn with_previous(mut self, previous_data: Option<Value>) -> Self {
        self.previous_data = previous_data;
        self
    }

    /// Set the live mode flag.
    #[must_use]
    pub fn with_livemode(mut self, livemode: bool) -> Self {
        self.livemode = livemode;
        self
    }

    /// Whether the event is pending and due at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.pending && self.next_delivery_at.map_or(true, |at| at <= now)
    }

    /// Whether the endpoint already received the event.
    #[must_use]
    pub fn was_delivered_to(&self, endpoint: &WebhookEndpointId) -> bool {
        self.delivered_to.contains(endpoint)
    }

    /// Record the outcome of a delivery round.
    ///
    /// `failed` is the number of endpoints that still did not receive the event. The event
    /// stops being pending once nothing failed or `max_attempts` rounds were made; otherwise
    /// the next round is scheduled `retry_after` from `now`.
    pub fn record_delivery_round(
        &mut self,
        delivered: impl IntoIterator<Item = WebhookEndpointId>,
        failed: usize,
        max_attempts: u32,
        retry_after: chrono::Duration,
        now: DateTime<Utc>,
    ) {
        for endpoint in delivered {
            if !self.delivered_to.contains(&endpoint) {
                self.delivered_to.push(endpoint);
            }
        }
        self.delivery_attempts += 1;
        if failed == 0 || self.delivery_attempts >= max_attempts {
            self.pending = false;
            self.next_delivery_at = None;
        } else {
            self.next_delivery_at = Some(now + retry_after);
        }
    }

    /// The JSON body posted to webhook endpoints.
    #[must_use]
    pub fn to_payload(&self) -> WebhookPayload {
        WebhookPayload {
            id: self.id.clone(),
            event_type: self.event_type.clone(),
            object_type: self.object_type.clone(),
            object_id: self.object_id.clone(),
            customer_id: self.customer_id.clone(),
            data: self.data.clone(),
            previous_data: self.previous_data.clone(),
            livemode: self.livemode,
            created: self.created_at.timestamp(),
        }
    }
}

/// Index entry for an event still awaiting webhook delivery.
///
/// Stored under its own kind so the dispatcher reads only undelivered events, never the
/// whole event log. The entry goes away once delivery of its event is final.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// The pending event.
    pub event_id: EventId,
    /// Earliest time of the next delivery round.
    pub next_delivery_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    /// The entry tracking `event`, or `None` once the event is no longer pending.
    #[must_use]
    pub fn for_event(event: &BillingEvent) -> Option<Self> {
        event.pending.then(|| Self {
            event_id: event.id.clone(),
            next_delivery_at: event.next_delivery_at,
        })
    }

    /// Whether the next delivery round is due at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_delivery_at.map_or(true, |at| at <= now)
    }
}

/// Wire shape of a webhook delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    /// Event identifier.
    pub id: EventId,
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Object kind.
    pub object_type: String,
    /// Object identifier.
    pub object_id: String,
    /// Customer, if any.
    pub customer_id: Option<CustomerId>,
    /// Object snapshot.
    pub data: Value,
    /// Previous values.
    pub previous_data: Option<Value>,
    /// Live mode flag.
    pub livemode: bool,
    /// Creation time, unix seconds.
    pub created: i64,
}

/// A registered receiver of billing events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    /// Endpoint identifier.
    pub id: WebhookEndpointId,
    /// Delivery URL.
    pub url: String,
    /// Signing secret (`whsec_...`).
    pub secret: String,
    /// Whether deliveries are made.
    pub enabled: bool,
    /// Event types delivered; empty or `"*"` means all.
    #[serde(default)]
    pub enabled_events: Vec<String>,
    /// Free-text description.
    pub description: Option<String>,
    /// When the endpoint was registered.
    pub created_at: DateTime<Utc>,
}

impl WebhookEndpoint {
    /// Register a new enabled endpoint.
    ///
    /// # Errors
    ///
    /// Returns `Validation` unless `url` is an absolute http(s) URL.
    pub fn new(
        url: impl Into<String>,
        secret: impl Into<String>,
        enabled_events: Vec<String>,
        description: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let url = url.into();
        let rest = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"));
        if rest.map_or(true, |host| host.trim().is_empty() || host.starts_with('/')) {
            return Err(BillingError::validation(format!(
                "webhook url must be an absolute http(s) url: {url}"
            )));
        }
        Ok(Self {
            id: WebhookEndpointId::generate(),
            url,
            secret: secret.into(),
            enabled: true,
            enabled_events,
            description,
            created_at: now,
        })
    }

    /// Whether the endpoint subscribes to `event_type`.
    #[must_use]
    pub fn matches(&self, event_type: &str) -> bool {
        self.enabled_events.is_empty()
            || self
                .enabled_events
                .iter()
                .any(|e| e == "*" || e == event_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn event() -> BillingEvent {
        BillingEvent::new(
            event_types::INVOICE_PAID,
            "invoice",
            "in_1",
            Some(CustomerId::from("cus_1")),
            json!({"id": "in_1"}),
            Utc::now(),
        )
    }

    #[test]
    fn payload_uses_camel_case_and_type() {
        let payload = serde_json::to_value(event().to_payload()).unwrap();
        assert_eq!(payload["type"], "invoice.paid");
        assert_eq!(payload["objectType"], "invoice");
        assert_eq!(payload["objectId"], "in_1");
        assert_eq!(payload["customerId"], "cus_1");
        assert!(payload.get("previousData").is_some());
        assert!(payload["created"].is_i64());
    }

    #[test]
    fn outbox_entry_follows_delivery_rounds() {
        let now = Utc::now();
        let mut event = event();
        let entry = OutboxEntry::for_event(&event).unwrap();
        assert_eq!(entry.event_id, event.id);
        assert!(entry.is_due(now));

        event.record_delivery_round(Vec::new(), 1, 3, Duration::minutes(5), now);
        let retry = OutboxEntry::for_event(&event).unwrap();
        assert!(!retry.is_due(now));
        assert!(retry.is_due(now + Duration::minutes(5)));

        event.record_delivery_round(Vec::new(), 0, 3, Duration::minutes(5), now);
        assert!(OutboxEntry::for_event(&event).is_none());
    }

    #[test]
    fn endpoint_filter() {
        let now = Utc::now();
        let all =
            WebhookEndpoint::new("https://a.test/hook", "whsec_x", vec![], None, now).unwrap();
        let star =
            WebhookEndpoint::new("https://a.test/hook", "whsec_x", vec!["*".into()], None, now)
                .unwrap();
        let some = WebhookEndpoint::new(
            "https://a.test/hook",
            "whsec_x",
            vec!["invoice.paid".into()],
            None,
            now,
        )
        .unwrap();
        assert!(all.matches("refund.created"));
        assert!(star.matches("refund.created"));
        assert!(some.matches("invoice.paid"));
        assert!(!some.matches("refund.created"));
    }

    #[test]
    fn endpoint_url_validation() {
        let now = Utc::now();
        assert!(WebhookEndpoint::new("ftp://x", "s", vec![], None, now).is_err());
        assert!(WebhookEndpoint::new("https://", "s", vec![], None, now).is_err());
        assert!(WebhookEndpoint::new("not a url", "s", vec![], None, now).is_err());
        assert!(WebhookEndpoint::new("http://127.0.0.1:9/x", "s", vec![], None, now).is_ok());
    }

    #[test]
    fn delivery_rounds() {
        let now = Utc::now();
        let mut e = event();
        assert!(e.is_due(now));

        e.record_delivery_round(
            [WebhookEndpointId::from("we_1")],
            1,
            3,
            Duration::seconds(10),
            now,
        );
        assert!(e.pending);
        assert!(!e.is_due(now));
        assert!(e.is_due(now + Duration::seconds(10)));
        assert!(e.was_delivered_to(&WebhookEndpointId::from("we_1")));

        e.record_delivery_round(
            [WebhookEndpointId::from("we_2")],
            0,
            3,
            Duration::seconds(10),
            now,
        );
        assert!(!e.pending);
        assert_eq!(e.delivered_to.len(), 2);
    }

    #[test]
    fn delivery_budget_exhaustion_clears_pending() {
        let now = Utc::now();
        let mut e = event();
        for _ in 0..2 {
            let none = Vec::<WebhookEndpointId>::new();
            e.record_delivery_round(none, 1, 2, Duration::seconds(1), now);
        }
        assert!(!e.pending);
        assert_eq!(e.delivery_attempts, 2);
    }
}
