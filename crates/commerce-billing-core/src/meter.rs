//! Usage metering types.
//!
//! Services report [`MeterEvent`]s against a [`Meter`]. At invoicing time the events of a
//! billing period are aggregated per meter and priced; a [`UsageWatermark`] then records the
//! last event included so that the same usage is never invoiced twice.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{
    CustomerId, InvoiceId, MeterEventId, MeterId, SubscriptionItemId, WatermarkId,
};

/// How the events of a meter are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationType {
    /// Sum of event values.
    Sum,
    /// Number of events.
    Count,
    /// Value of the most recent event.
    Last,
}

impl AggregationType {
    /// Get the aggregation name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Count => "count",
            Self::Last => "last",
        }
    }
}

/// A named usage metric.
///
/// Meters are immutable after creation except for their metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meter {
    /// Meter identifier.
    pub id: MeterId,
    /// Display name.
    pub name: String,
    /// Aggregation strategy.
    pub aggregation: AggregationType,
    /// Currency of the usage charges.
    pub currency: String,
    /// Names of the dimensions events may carry.
    #[serde(default)]
    pub dimensions: Vec<String>,
    /// Free-form metadata (the only mutable part).
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// When the meter was created.
    pub created_at: DateTime<Utc>,
}

impl Meter {
    /// Create a new meter.
    #[must_use]
    pub fn new(
        id: MeterId,
        name: impl Into<String>,
        aggregation: AggregationType,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            aggregation,
            currency: currency.into(),
            dimensions: Vec::new(),
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Set the dimension names.
    #[must_use]
    pub fn with_dimensions(mut self, dimensions: Vec<String>) -> Self {
        self.dimensions = dimensions;
        self
    }
}

/// A single reported usage event. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterEvent {
    /// Event identifier.
    pub id: MeterEventId,
    /// The meter the event belongs to.
    pub meter_id: MeterId,
    /// The customer that generated the usage.
    pub customer_id: CustomerId,
    /// Usage value in whole units.
    pub value: i64,
    /// When the usage occurred.
    pub timestamp: DateTime<Utc>,
    /// Caller-supplied idempotency key.
    pub idempotency_key: Option<String>,
    /// Dimension values.
    #[serde(default)]
    pub dimensions: HashMap<String, String>,
}

/// The invoiced boundary of a (subscription item, meter) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageWatermark {
    /// Watermark identifier.
    pub id: WatermarkId,
    /// The subscription item that was invoiced.
    pub subscription_item_id: SubscriptionItemId,
    /// The meter that was aggregated.
    pub meter_id: MeterId,
    /// The invoice that billed the usage.
    pub invoice_id: InvoiceId,
    /// Aggregated value included in the invoice.
    pub aggregated_value: i64,
    /// Number of events included.
    pub event_count: u64,
    /// Timestamp of the latest included event.
    pub last_event_timestamp: DateTime<Utc>,
    /// When the watermark was written.
    pub created_at: DateTime<Utc>,
}

/// Result of aggregating a set of events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aggregate {
    /// Aggregated value.
    pub value: i64,
    /// Number of events folded in.
    pub event_count: u64,
    /// Timestamp of the latest event, if any.
    pub last_event_timestamp: Option<DateTime<Utc>>,
}

/// Aggregate events according to the meter's strategy.
#[must_use]
pub fn aggregate<'a, I>(aggregation: AggregationType, events: I) -> Aggregate
where
    I: IntoIterator<Item = &'a MeterEvent>,
{
    let mut sum: i64 = 0;
    let mut count: u64 = 0;
    let mut latest: Option<&MeterEvent> = None;

    for event in events {
        sum = sum.saturating_add(event.value);
        count += 1;
        if latest.map_or(true, |l| event.timestamp >= l.timestamp) {
            latest = Some(event);
        }
    }

    let value = match aggregation {
        AggregationType::Sum => sum,
        AggregationType::Count => i64::try_from(count).unwrap_or(i64::MAX),
        AggregationType::Last => latest.map_or(0, |e| e.value),
    };

    Aggregate {
        value,
        event_count: count,
        last_event_timestamp: latest.map(|e| e.timestamp),
    }
}

/// Whether an event falls in the half-open window `(start, end]`.
#[must_use]
pub fn in_window(event: &MeterEvent, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    event.timestamp > start && event.timestamp <= end
}
