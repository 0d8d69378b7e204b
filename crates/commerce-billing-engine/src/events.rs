//! Billing events and webhook endpoints.
//!
//! Every state change records a [`BillingEvent`] in the same store transaction as the change
//! itself, together with an [`OutboxEntry`] that indexes it for the
//! [`WebhookDispatcher`](crate::dispatcher::WebhookDispatcher). The event stays `pending`
//! and keeps its outbox entry until delivery is final.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use commerce_billing_core::{
    BillingError, BillingEvent, BillingInvoice, CreditNote, CustomerBalance, CustomerId,
    OutboxEntry, PaymentIntent, Payout, Refund, Result, SetupIntent, Subscription,
    WebhookEndpoint, WebhookEndpointId,
};
use commerce_billing_store::{Entity, StoreExt};

use crate::crypto::generate_webhook_secret;
use crate::engine::{BillingEngine, Tx};

/// An entity that events are emitted about.
pub trait EventSubject: Serialize {
    /// Object type named in the event (`"invoice"`, `"payment_intent"`, ...).
    const OBJECT_TYPE: &'static str;

    /// Identifier named in the event.
    fn object_id(&self) -> String;

    /// Owning customer, if any.
    fn customer_id(&self) -> Option<&CustomerId>;
}

macro_rules! customer_subject {
    ($($ty:ty => $object_type:literal),* $(,)?) => {
        $(
            impl EventSubject for $ty {
                const OBJECT_TYPE: &'static str = $object_type;

                fn object_id(&self) -> String {
                    self.id.to_string()
                }

                fn customer_id(&self) -> Option<&CustomerId> {
                    Some(&self.customer_id)
                }
            }
        )*
    };
}

customer_subject! {
    BillingInvoice => "invoice",
    PaymentIntent => "payment_intent",
    SetupIntent => "setup_intent",
    Refund => "refund",
    CreditNote => "credit_note",
    Subscription => "subscription",
}

impl EventSubject for CustomerBalance {
    const OBJECT_TYPE: &'static str = "customer_balance";

    fn object_id(&self) -> String {
        self.key()
    }

    fn customer_id(&self) -> Option<&CustomerId> {
        Some(&self.customer_id)
    }
}

impl EventSubject for Payout {
    const OBJECT_TYPE: &'static str = "payout";

    fn object_id(&self) -> String {
        self.id.to_string()
    }

    fn customer_id(&self) -> Option<&CustomerId> {
        None
    }
}

/// Serialize an entity for an event's `data` / `previous_data`.
pub(crate) fn snapshot<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| BillingError::Serialization(e.to_string()))
}

/// Build an event about `subject`.
pub(crate) fn subject_event<T: EventSubject>(
    event_type: &str,
    subject: &T,
    previous: Option<Value>,
    now: DateTime<Utc>,
) -> Result<BillingEvent> {
    Ok(BillingEvent::new(
        event_type,
        T::OBJECT_TYPE,
        subject.object_id(),
        subject.customer_id().cloned(),
        snapshot(subject)?,
        now,
    )
    .with_previous(previous))
}

/// Put or drop the outbox entry of `event` to match its delivery state.
pub(crate) fn sync_outbox(tx: &mut Tx<'_>, event: &BillingEvent) -> Result<()> {
    match OutboxEntry::for_event(event) {
        Some(entry) => tx.put(&entry)?,
        None => tx.delete::<OutboxEntry>(event.id.as_str()),
    }
    Ok(())
}

impl BillingEngine {
    /// Stage `event` in `tx`. Callers wake the dispatcher once the transaction commits.
    pub(crate) fn stage_event(&self, tx: &mut Tx<'_>, event: BillingEvent) -> Result<()> {
        let event = event.with_livemode(self.config().livemode);
        tracing::debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            object_id = %event.object_id,
            "Billing event recorded"
        );
        tx.create(&event)?;
        sync_outbox(tx, &event)
    }

    /// Stage an event about `subject`.
    pub(crate) fn record<T: EventSubject>(
        &self,
        tx: &mut Tx<'_>,
        event_type: &str,
        subject: &T,
        previous: Option<Value>,
    ) -> Result<()> {
        let event = subject_event(event_type, subject, previous, self.now())?;
        self.stage_event(tx, event)
    }

    /// Wake the dispatcher after new events committed.
    pub(crate) fn wake_dispatcher(&self) {
        self.dispatch_signal().notify_one();
    }

    /// Load `key`, apply `change`, store it and record `event_type` with the previous state,
    /// all in one transaction.
    pub(crate) fn mutate<E, F>(&self, key: &str, event_type: &str, change: F) -> Result<E>
    where
        E: Entity + EventSubject,
        F: FnOnce(&mut E, DateTime<Utc>) -> Result<()>,
    {
        let entity = self.store().transaction(|tx| {
            let mut entity: E = tx.require(key)?;
            let previous = snapshot(&entity)?;
            change(&mut entity, self.now())?;
            tx.update(&entity)?;
            self.record(tx, event_type, &entity, Some(previous))?;
            Ok::<_, BillingError>(entity)
        })?;
        self.wake_dispatcher();
        Ok(entity)
    }

    /// Record an event outside any other operation.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for an empty event type, or a storage error.
    pub fn emit_billing_event(
        &self,
        event_type: &str,
        object_type: &str,
        object_id: &str,
        customer_id: Option<&CustomerId>,
        data: Value,
        previous: Option<Value>,
    ) -> Result<BillingEvent> {
        if event_type.trim().is_empty() {
            return Err(BillingError::validation("event type is required"));
        }
        let event = BillingEvent::new(
            event_type,
            object_type,
            object_id,
            customer_id.cloned(),
            data,
            self.now(),
        )
        .with_previous(previous)
        .with_livemode(self.config().livemode);

        self.store().transaction(|tx| self.stage_event(tx, event.clone()))?;
        self.wake_dispatcher();
        Ok(event)
    }

    /// Get an event by id.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the event does not exist.
    pub fn get_event(&self, id: &str) -> Result<BillingEvent> {
        Ok(self.store().require(id)?)
    }

    /// List events oldest first, optionally for one customer.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the scan fails.
    pub fn list_events(&self, customer_id: Option<&CustomerId>) -> Result<Vec<BillingEvent>> {
        let mut events = self.store().query::<BillingEvent>(|e| {
            customer_id.map_or(true, |c| e.customer_id.as_ref() == Some(c))
        })?;
        events.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.as_str().cmp(b.id.as_str()))
        });
        Ok(events)
    }

    /// Register a webhook endpoint with a freshly generated secret.
    ///
    /// An empty `enabled_events` list (or `"*"`) subscribes to every event type.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the URL is not an absolute http(s) URL.
    pub fn create_webhook_endpoint(
        &self,
        url: &str,
        enabled_events: Vec<String>,
        description: Option<String>,
    ) -> Result<WebhookEndpoint> {
        let endpoint = WebhookEndpoint::new(
            url,
            generate_webhook_secret(),
            enabled_events,
            description,
            self.now(),
        )?;
        self.store().create(&endpoint)?;
        tracing::info!(endpoint_id = %endpoint.id, url = %endpoint.url, "Webhook endpoint created");
        Ok(endpoint)
    }

    /// Enable or disable an endpoint.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the endpoint does not exist.
    pub fn set_webhook_endpoint_enabled(
        &self,
        id: &WebhookEndpointId,
        enabled: bool,
    ) -> Result<WebhookEndpoint> {
        let endpoint = self.store().transaction(|tx| {
            let mut endpoint: WebhookEndpoint = tx.require(id.as_str())?;
            endpoint.enabled = enabled;
            tx.update(&endpoint)?;
            Ok::<_, BillingError>(endpoint)
        })?;
        tracing::info!(endpoint_id = %id, enabled, "Webhook endpoint updated");
        Ok(endpoint)
    }

    /// List all endpoints.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the scan fails.
    pub fn list_webhook_endpoints(&self) -> Result<Vec<WebhookEndpoint>> {
        Ok(self.store().get_all()?)
    }
}
