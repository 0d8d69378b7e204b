//! Entity kinds and their storage keys.
//!
//! Every persisted type is an [`Entity`] with a kind (a namespace in the in-memory store, a
//! column family in `RocksDB`) and a key unique within that kind.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use commerce_billing_core::{
    BalanceTransaction, BillingEvent, BillingInvoice, CreditNote, CustomerBalance, Meter,
    MeterEvent, OutboxEntry, PaymentIntent, PaymentMethod, Payout, PricingRule, Refund,
    SetupIntent, Subscription, SubscriptionItem, SubscriptionSchedule, TaxRate, TaxRegion,
    UsageWatermark, WebhookEndpoint,
};

/// Entity kind names.
pub mod kind {
    /// Usage meters, keyed by meter id.
    pub const METER: &str = "meter";
    /// Usage events, keyed by event id (ULID, time ordered).
    pub const METER_EVENT: &str = "meter-event";
    /// Pricing rules, keyed by rule id.
    pub const PRICING_RULE: &str = "billing-pricing-rule";
    /// Usage watermarks, keyed by watermark id.
    pub const USAGE_WATERMARK: &str = "usage-watermark";
    /// Customer balances, keyed by `customer:currency`.
    pub const CUSTOMER_BALANCE: &str = "customer-balance";
    /// Balance ledger entries, keyed by entry id.
    pub const BALANCE_TRANSACTION: &str = "balance-transaction";
    /// Invoices, keyed by invoice id.
    pub const INVOICE: &str = "billing-invoice";
    /// Payment intents, keyed by intent id.
    pub const PAYMENT_INTENT: &str = "payment-intent";
    /// Setup intents, keyed by intent id.
    pub const SETUP_INTENT: &str = "setup-intent";
    /// Stored payment methods, keyed by payment method id.
    pub const PAYMENT_METHOD: &str = "payment-method";
    /// Refunds, keyed by refund id.
    pub const REFUND: &str = "refund";
    /// Credit notes, keyed by credit note id.
    pub const CREDIT_NOTE: &str = "credit-note";
    /// Payouts, keyed by payout id.
    pub const PAYOUT: &str = "billing-payout";
    /// Billing events, keyed by event id.
    pub const EVENT: &str = "billing-event";
    /// Events awaiting webhook delivery, keyed by event id.
    pub const OUTBOX: &str = "webhook-outbox";
    /// Webhook endpoints, keyed by endpoint id.
    pub const WEBHOOK_ENDPOINT: &str = "webhook-endpoint";
    /// Subscriptions, keyed by subscription id.
    pub const SUBSCRIPTION: &str = "subscription";
    /// Subscription items, keyed by item id.
    pub const SUBSCRIPTION_ITEM: &str = "subscription-item";
    /// Subscription schedules, keyed by schedule id.
    pub const SUBSCRIPTION_SCHEDULE: &str = "subscription-schedule";
    /// Tax regions, keyed by region id.
    pub const TAX_REGION: &str = "tax-region";
    /// Tax rates, keyed by rate id.
    pub const TAX_RATE: &str = "tax-rate";
    /// Workflow checkpoints, keyed by subscription id.
    pub const WORKFLOW_RUN: &str = "workflow-run";
    /// Named counters, keyed by name.
    pub const SEQUENCE: &str = "sequence";
}

/// Returns all entity kinds for database initialization.
#[must_use]
pub fn all_kinds() -> Vec<&'static str> {
    vec![
        kind::METER,
        kind::METER_EVENT,
        kind::PRICING_RULE,
        kind::USAGE_WATERMARK,
        kind::CUSTOMER_BALANCE,
        kind::BALANCE_TRANSACTION,
        kind::INVOICE,
        kind::PAYMENT_INTENT,
        kind::SETUP_INTENT,
        kind::PAYMENT_METHOD,
        kind::REFUND,
        kind::CREDIT_NOTE,
        kind::PAYOUT,
        kind::EVENT,
        kind::OUTBOX,
        kind::WEBHOOK_ENDPOINT,
        kind::SUBSCRIPTION,
        kind::SUBSCRIPTION_ITEM,
        kind::SUBSCRIPTION_SCHEDULE,
        kind::TAX_REGION,
        kind::TAX_RATE,
        kind::WORKFLOW_RUN,
        kind::SEQUENCE,
    ]
}

/// A type the store can persist.
pub trait Entity: Serialize + DeserializeOwned {
    /// The kind the entity is stored under.
    const KIND: &'static str;

    /// The entity's key within its kind.
    fn key(&self) -> String;
}

/// A named monotonically increasing counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequence {
    /// Counter name.
    pub name: String,
    /// Last value handed out.
    pub value: u64,
}

impl Entity for Sequence {
    const KIND: &'static str = kind::SEQUENCE;

    fn key(&self) -> String {
        self.name.clone()
    }
}

macro_rules! entity_by_id {
    ($($ty:ty => $kind:expr),* $(,)?) => {
        $(
            impl Entity for $ty {
                const KIND: &'static str = $kind;

                fn key(&self) -> String {
                    self.id.to_string()
                }
            }
        )*
    };
}

entity_by_id! {
    Meter => kind::METER,
    MeterEvent => kind::METER_EVENT,
    PricingRule => kind::PRICING_RULE,
    UsageWatermark => kind::USAGE_WATERMARK,
    BalanceTransaction => kind::BALANCE_TRANSACTION,
    BillingInvoice => kind::INVOICE,
    PaymentIntent => kind::PAYMENT_INTENT,
    SetupIntent => kind::SETUP_INTENT,
    PaymentMethod => kind::PAYMENT_METHOD,
    Refund => kind::REFUND,
    CreditNote => kind::CREDIT_NOTE,
    Payout => kind::PAYOUT,
    BillingEvent => kind::EVENT,
    WebhookEndpoint => kind::WEBHOOK_ENDPOINT,
    Subscription => kind::SUBSCRIPTION,
    SubscriptionItem => kind::SUBSCRIPTION_ITEM,
    SubscriptionSchedule => kind::SUBSCRIPTION_SCHEDULE,
    TaxRegion => kind::TAX_REGION,
    TaxRate => kind::TAX_RATE,
}

impl Entity for OutboxEntry {
    const KIND: &'static str = kind::OUTBOX;

    fn key(&self) -> String {
        self.event_id.to_string()
    }
}

impl Entity for CustomerBalance {
    const KIND: &'static str = kind::CUSTOMER_BALANCE;

    fn key(&self) -> String {
        CustomerBalance::key(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn kinds_are_unique() {
        let kinds = all_kinds();
        let unique: HashSet<_> = kinds.iter().collect();
        assert_eq!(unique.len(), kinds.len());
    }
}
