//! Core types and pure billing rules for commerce-billing.
//!
//! This crate holds everything about billing that does not touch storage, the network or
//! the clock:
//!
//! - **Identifiers**: `CustomerId`, `InvoiceId`, `PaymentIntentId`, ...
//! - **Pricing**: `PricingRule`, `Tier`, `PricingModel`
//! - **Metering**: `Meter`, `MeterEvent`, `UsageWatermark`, aggregation
//! - **Ledger**: `CustomerBalance`, `BalanceTransaction`
//! - **Invoices**: `BillingInvoice`, `LineItem` and the invoice state machine
//! - **Intents**: `PaymentIntent`, `SetupIntent`, `PaymentMethod`
//! - **Refunds**: `Refund`, `CreditNote`, `Payout`
//! - **Tax**: `TaxRegion`, `TaxRate`, `calculate_tax`
//! - **Events**: `BillingEvent`, `WebhookEndpoint`, `WebhookPayload`
//! - **Subscriptions**: `Plan`, `Subscription`, proration and period arithmetic
//!
//! # Money
//!
//! Every amount is an `i64` count of the currency's minor unit (cents). Rates and
//! proration fractions are the only floating point values, and they are rounded back to
//! whole cents as soon as they are applied.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod event;
pub mod ids;
pub mod intent;
pub mod invoice;
pub mod ledger;
pub mod meter;
pub mod pricing;
pub mod refund;
pub mod subscription;
pub mod tax;

pub use error::{BillingError, Result};
pub use event::{event_types, BillingEvent, OutboxEntry, WebhookEndpoint, WebhookPayload};
pub use ids::{
    BalanceTransactionId, CreditNoteId, CustomerId, EventId, InvoiceId, LineItemId, MeterEventId,
    MeterId, PaymentIntentId, PaymentMethodId, PayoutId, PlanId, PricingRuleId, RefundId,
    ScheduleId, SetupIntentId, SubscriptionId, SubscriptionItemId, TaxRateId, TaxRegionId,
    WatermarkId, WebhookEndpointId, WorkflowRunId,
};
pub use intent::{
    CaptureMethod, PaymentIntent, PaymentIntentStatus, PaymentMethod, PaymentMethodType,
    SetupIntent, SetupIntentStatus, INTERNAL_PROVIDER_REF,
};
pub use invoice::{BillingInvoice, InvoiceStatus, LineItem, LineItemKind};
pub use ledger::{BalanceTransaction, BalanceTransactionType, CustomerBalance};
pub use meter::{
    aggregate, in_window, Aggregate, AggregationType, Meter, MeterEvent, UsageWatermark,
};
pub use pricing::{PricingModel, PricingRule, Tier};
pub use refund::{
    credit_note_number, refundable_amount, CreditNote, CreditNoteParams, CreditNoteStatus, Payout,
    PayoutStatus, Refund, RefundSource, RefundStatus,
};
pub use subscription::{
    advance_period, start_subscription, Plan, PlanInterval, ScheduleStatus, Subscription,
    SubscriptionItem, SubscriptionSchedule, SubscriptionStatus,
};
pub use tax::{calculate_tax, Address, TaxCalculation, TaxLine, TaxRate, TaxRegion};
