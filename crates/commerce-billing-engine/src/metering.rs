//! Meters, pricing rules, usage ingestion and aggregation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use commerce_billing_core::{
    aggregate, event_types, in_window, BillingError, BillingEvent, CustomerId, InvoiceId,
    LineItem, LineItemKind, Meter, MeterEvent, MeterEventId, MeterId, PricingModel, PricingRule,
    Result, Subscription, SubscriptionItem, UsageWatermark, WatermarkId,
};
use commerce_billing_store::StoreExt;

use crate::engine::{BillingEngine, Tx};

/// A usage event to ingest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageEventInput {
    /// Meter the usage belongs to.
    pub meter_id: MeterId,
    /// Customer that used it.
    pub customer_id: CustomerId,
    /// Usage amount.
    pub value: i64,
    /// Caller token for at-most-once ingestion.
    pub idempotency_key: Option<String>,
    /// When the usage happened; now when absent.
    pub timestamp: Option<DateTime<Utc>>,
    /// Dimension values.
    pub dimensions: HashMap<String, String>,
}

impl UsageEventInput {
    /// Usage of `value` on `meter_id` by `customer_id`, happening now.
    #[must_use]
    pub fn new(
        meter_id: impl Into<MeterId>,
        customer_id: impl Into<CustomerId>,
        value: i64,
    ) -> Self {
        Self {
            meter_id: meter_id.into(),
            customer_id: customer_id.into(),
            value,
            idempotency_key: None,
            timestamp: None,
            dimensions: HashMap::new(),
        }
    }

    /// Set the idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Set when the usage happened.
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Add a dimension value.
    #[must_use]
    pub fn with_dimension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(key.into(), value.into());
        self
    }
}

/// Result of ingesting a usage event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    /// The stored event; the original one for a duplicate.
    pub event: MeterEvent,
    /// Whether the idempotency key had already been used.
    pub duplicate: bool,
}

/// Priced usage of one subscription item over a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemUsage {
    /// Aggregated quantity.
    pub quantity: i64,
    /// Number of events aggregated.
    pub event_count: u64,
    /// Timestamp of the newest aggregated event.
    pub last_event_timestamp: Option<DateTime<Utc>>,
    /// Zero or one usage line item.
    pub line_items: Vec<LineItem>,
}

impl ItemUsage {
    fn empty() -> Self {
        Self {
            quantity: 0,
            event_count: 0,
            last_event_timestamp: None,
            line_items: Vec::new(),
        }
    }

    /// Total priced amount.
    #[must_use]
    pub fn amount(&self) -> i64 {
        self.line_items.iter().map(|l| l.amount).sum()
    }
}

/// Result of a usage threshold check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThresholdCheck {
    /// All-time aggregated usage.
    pub total: i64,
    /// The threshold checked against.
    pub threshold: i64,
    /// Whether `total >= threshold`.
    pub reached: bool,
}

impl BillingEngine {
    /// Register a meter.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for an empty id or name, or if the id is taken.
    pub fn create_meter(&self, meter: Meter) -> Result<Meter> {
        if meter.id.is_empty() {
            return Err(BillingError::validation("meter id is required"));
        }
        if meter.name.trim().is_empty() {
            return Err(BillingError::validation("meter name is required"));
        }
        self.store().create(&meter)?;
        tracing::info!(
            meter_id = %meter.id,
            aggregation = meter.aggregation.as_str(),
            "Meter created"
        );
        Ok(meter)
    }

    /// Get a meter.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the meter does not exist.
    pub fn get_meter(&self, meter_id: &MeterId) -> Result<Meter> {
        Ok(self.store().require(meter_id.as_str())?)
    }

    /// Merge `metadata` into the meter's metadata. Nothing else about a meter is mutable.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the meter does not exist.
    pub fn update_meter_metadata(
        &self,
        meter_id: &MeterId,
        metadata: HashMap<String, String>,
    ) -> Result<Meter> {
        self.store().transaction(|tx| {
            let mut meter: Meter = tx.require(meter_id.as_str())?;
            meter.metadata.extend(metadata);
            tx.update(&meter)?;
            Ok::<_, BillingError>(meter)
        })
    }

    /// Register a pricing rule for an existing meter.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the meter does not exist.
    /// - `Validation` if the tiers are malformed.
    pub fn create_pricing_rule(&self, rule: PricingRule) -> Result<PricingRule> {
        rule.validate().map_err(BillingError::Validation)?;
        self.store().transaction(|tx| {
            tx.require::<Meter>(rule.meter_id.as_str())?;
            tx.create(&rule)
        })?;
        tracing::info!(rule_id = %rule.id, meter_id = %rule.meter_id, "Pricing rule created");
        Ok(rule)
    }

    /// Ingest one usage event.
    ///
    /// With an idempotency key that was already used, the stored event is returned with
    /// `duplicate = true` and nothing is written. The lookup and the insert share one
    /// transaction, so concurrent submissions of one key store a single event.
    ///
    /// # Errors
    ///
    /// - `Validation` if the meter id or customer id is empty.
    /// - `NotFound` if the meter does not exist.
    pub fn ingest_usage_event(&self, input: UsageEventInput) -> Result<IngestOutcome> {
        if input.meter_id.is_empty() {
            return Err(BillingError::validation("meter_id is required"));
        }
        if input.customer_id.is_empty() {
            return Err(BillingError::validation("customer_id is required"));
        }
        let idempotency_key = input
            .idempotency_key
            .filter(|key| !key.trim().is_empty());

        self.store().transaction(|tx| {
            tx.require::<Meter>(input.meter_id.as_str())?;

            if let Some(key) = idempotency_key.as_deref() {
                let existing =
                    tx.query::<MeterEvent>(|e| e.idempotency_key.as_deref() == Some(key))?;
                if let Some(event) = existing.into_iter().next() {
                    tracing::debug!(
                        event_id = %event.id,
                        idempotency_key = %key,
                        "Duplicate usage event ignored"
                    );
                    return Ok(IngestOutcome {
                        event,
                        duplicate: true,
                    });
                }
            }

            let event = MeterEvent {
                id: MeterEventId::generate(),
                meter_id: input.meter_id,
                customer_id: input.customer_id,
                value: input.value,
                timestamp: input.timestamp.unwrap_or_else(|| self.now()),
                idempotency_key,
                dimensions: input.dimensions,
            };
            tx.create(&event)?;
            tracing::debug!(
                event_id = %event.id,
                meter_id = %event.meter_id,
                customer_id = %event.customer_id,
                value = event.value,
                "Usage event ingested"
            );
            Ok::<_, BillingError>(IngestOutcome {
                event,
                duplicate: false,
            })
        })
    }

    /// Aggregate and price an item's usage in `(period_start, period_end]`.
    ///
    /// Usage at or before the item's latest watermark is skipped. Nothing is written; the
    /// caller records a watermark with [`BillingEngine::create_watermark`] once the usage is
    /// invoiced.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the subscription or meter does not exist.
    pub fn aggregate_item_usage(
        &self,
        item: &SubscriptionItem,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<ItemUsage> {
        let store = self.store();
        let subscription: Subscription = store.require(item.subscription_id.as_str())?;
        store.transaction(|tx| {
            self.item_usage_in(tx, item, &subscription.customer_id, period_start, period_end)
        })
    }

    /// Record that `usage` of `item` was invoiced on `invoice_id`.
    ///
    /// Returns `None` when the usage had no events, since there is no boundary to move.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write fails.
    pub fn create_watermark(
        &self,
        item: &SubscriptionItem,
        invoice_id: &InvoiceId,
        usage: &ItemUsage,
    ) -> Result<Option<UsageWatermark>> {
        self.store()
            .transaction(|tx| self.stage_watermark(tx, item, invoice_id, usage))
    }

    /// Compare an item's all-time usage with `threshold`, ignoring periods and watermarks.
    ///
    /// Records `usage.threshold_reached` when the threshold is reached.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the subscription or meter does not exist.
    pub fn check_threshold(
        &self,
        item: &SubscriptionItem,
        threshold: i64,
    ) -> Result<ThresholdCheck> {
        let check = self.store().transaction(|tx| {
            let subscription: Subscription = tx.require(item.subscription_id.as_str())?;
            let meter: Meter = tx.require(item.meter_id.as_str())?;
            let events = tx.query::<MeterEvent>(|e| {
                e.meter_id == meter.id && e.customer_id == subscription.customer_id
            })?;
            let total = aggregate(meter.aggregation, &events).value;
            let check = ThresholdCheck {
                total,
                threshold,
                reached: total >= threshold,
            };

            if check.reached {
                let data = serde_json::json!({
                    "subscription_item_id": item.id.as_str(),
                    "meter_id": meter.id.as_str(),
                    "total": total,
                    "threshold": threshold,
                });
                let event = BillingEvent::new(
                    event_types::USAGE_THRESHOLD_REACHED,
                    "subscription_item",
                    item.id.as_str(),
                    Some(subscription.customer_id.clone()),
                    data,
                    self.now(),
                );
                self.stage_event(tx, event)?;
                tracing::info!(
                    subscription_item_id = %item.id,
                    total,
                    threshold,
                    "Usage threshold reached"
                );
            }
            Ok::<_, BillingError>(check)
        })?;
        if check.reached {
            self.wake_dispatcher();
        }
        Ok(check)
    }

    pub(crate) fn item_usage_in(
        &self,
        tx: &mut Tx<'_>,
        item: &SubscriptionItem,
        customer_id: &CustomerId,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<ItemUsage> {
        let meter: Meter = tx.require(item.meter_id.as_str())?;

        let watermark = tx
            .query::<UsageWatermark>(|w| {
                w.subscription_item_id == item.id && w.meter_id == item.meter_id
            })?
            .into_iter()
            .max_by_key(|w| w.last_event_timestamp);
        let effective_start = watermark
            .as_ref()
            .map_or(period_start, |w| w.last_event_timestamp.max(period_start));

        let events = tx.query::<MeterEvent>(|e| {
            e.meter_id == meter.id
                && e.customer_id == *customer_id
                && in_window(e, effective_start, period_end)
        })?;
        let usage = aggregate(meter.aggregation, &events);
        if usage.event_count == 0 {
            return Ok(ItemUsage::empty());
        }

        let rule = match &item.pricing_rule_id {
            Some(rule_id) => tx.get::<PricingRule>(rule_id.as_str())?,
            None => tx
                .query::<PricingRule>(|r| r.meter_id == meter.id)?
                .into_iter()
                .next(),
        };
        if rule.is_none() {
            tracing::warn!(meter_id = %meter.id, "No pricing rule for meter, usage priced at zero");
        }

        let mut line = LineItem::new(
            LineItemKind::Usage,
            format!("{} usage", meter.name),
            rule.as_ref().map_or(0, |r| r.calculate_cost(usage.value)),
        )
        .with_period(period_start, period_end);
        line.quantity = usage.value;
        line.unit_amount = rule
            .as_ref()
            .filter(|r| r.model == PricingModel::PerUnit)
            .map(|r| r.unit_price);
        line.meter_id = Some(meter.id.clone());
        line.subscription_item_id = Some(item.id.clone());

        Ok(ItemUsage {
            quantity: usage.value,
            event_count: usage.event_count,
            last_event_timestamp: usage.last_event_timestamp,
            line_items: vec![line],
        })
    }

    pub(crate) fn stage_watermark(
        &self,
        tx: &mut Tx<'_>,
        item: &SubscriptionItem,
        invoice_id: &InvoiceId,
        usage: &ItemUsage,
    ) -> Result<Option<UsageWatermark>> {
        let Some(last_event_timestamp) = usage.last_event_timestamp else {
            return Ok(None);
        };
        let watermark = UsageWatermark {
            id: WatermarkId::generate(),
            subscription_item_id: item.id.clone(),
            meter_id: item.meter_id.clone(),
            invoice_id: invoice_id.clone(),
            aggregated_value: usage.quantity,
            event_count: usage.event_count,
            last_event_timestamp,
            created_at: self.now(),
        };
        tx.create(&watermark)?;
        tracing::debug!(
            subscription_item_id = %item.id,
            invoice_id = %invoice_id,
            last_event_timestamp = %last_event_timestamp,
            "Usage watermark recorded"
        );
        Ok(Some(watermark))
    }
}

