//! Common test utilities for commerce-billing engine integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use commerce_billing_core::{
    AggregationType, BalanceTransaction, BalanceTransactionType, BillingError, CustomerId, Meter,
    MeterId, PricingRule, Result,
};
use commerce_billing_engine::{
    BalanceAdjustment, BillingEngine, ChargeRequest, EngineConfig, PaymentProcessor,
    ProcessorResponse, TokioClock,
};
use commerce_billing_store::MemoryStore;

/// Wall-clock start of paused-time tests.
pub fn anchor() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Test harness wrapping an engine over a fresh in-memory store.
pub struct TestHarness {
    /// The engine under test.
    pub engine: BillingEngine,
}

impl TestHarness {
    /// An engine with the default configuration on the system clock.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// An engine with `config` on the system clock.
    pub fn with_config(config: EngineConfig) -> Self {
        let engine = BillingEngine::new(Arc::new(MemoryStore::new()), config);
        Self { engine }
    }

    /// An engine whose clock follows paused tokio time from [`anchor`].
    ///
    /// Must be created inside a `start_paused` test.
    pub fn paused() -> Self {
        let harness = Self::new();
        let engine = harness
            .engine
            .with_clock(Arc::new(TokioClock::starting_at(anchor())));
        Self { engine }
    }

    /// Attach a payment processor.
    pub fn with_processor(self, processor: Arc<dyn PaymentProcessor>) -> Self {
        Self {
            engine: self.engine.with_processor(processor),
        }
    }

    /// Credit a customer's balance in the default currency.
    pub fn fund(&self, customer: &str, amount: i64) -> BalanceTransaction {
        let credit = BalanceAdjustment::new(
            CustomerId::from(customer),
            amount,
            BalanceTransactionType::Adjustment,
            "Test funding",
        );
        self.engine
            .adjust_customer_balance(&credit)
            .expect("Failed to fund customer")
    }

    /// The customer's balance in the default currency.
    pub fn balance(&self, customer: &str) -> i64 {
        self.engine
            .get_or_create_customer_balance(&CustomerId::from(customer), None)
            .expect("Failed to read balance")
            .balance
    }

    /// Create a sum meter priced per unit.
    pub fn priced_meter(&self, id: &str, unit_price: i64) -> (Meter, PricingRule) {
        let meter = self
            .engine
            .create_meter(Meter::new(
                MeterId::from(id),
                format!("{id} meter"),
                AggregationType::Sum,
                "usd",
            ))
            .expect("Failed to create meter");
        let rule = self
            .engine
            .create_pricing_rule(PricingRule::per_unit(meter.id.clone(), unit_price, "usd"))
            .expect("Failed to create pricing rule");
        (meter, rule)
    }

    /// Types of every recorded event, oldest first.
    pub fn event_types(&self) -> Vec<String> {
        self.engine
            .list_events(None)
            .expect("Failed to list events")
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    /// How many events of `event_type` were recorded.
    pub fn count_events(&self, event_type: &str) -> usize {
        self.event_types()
            .iter()
            .filter(|t| t.as_str() == event_type)
            .count()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// A scripted payment processor recording what it was asked to do.
#[derive(Default)]
pub struct FakeProcessor {
    /// Fail every call with an external error.
    pub failing: AtomicBool,
    /// Report the processor as unavailable.
    pub offline: AtomicBool,
    /// Calls made, as `"<operation>:<token or ref>:<amount>"`.
    pub calls: Mutex<Vec<String>>,
}

impl FakeProcessor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let processor = Self::default();
        processor.failing.store(true, Ordering::SeqCst);
        Arc::new(processor)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn respond(&self, operation: &str, target: &str, amount: i64) -> Result<ProcessorResponse> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{operation}:{target}:{amount}"));
        if self.failing.load(Ordering::SeqCst) {
            return Err(BillingError::external("fake", "card declined"));
        }
        Ok(ProcessorResponse {
            provider_ref: format!("{operation}_{target}"),
            amount,
        })
    }
}

#[async_trait]
impl PaymentProcessor for FakeProcessor {
    fn processor_type(&self) -> &str {
        "fake"
    }

    fn is_available(&self) -> bool {
        !self.offline.load(Ordering::SeqCst)
    }

    async fn authorize(&self, request: &ChargeRequest) -> Result<ProcessorResponse> {
        self.respond("authorize", &request.payment_token, request.amount)
    }

    async fn charge(&self, request: &ChargeRequest) -> Result<ProcessorResponse> {
        self.respond("charge", &request.payment_token, request.amount)
    }

    async fn capture(&self, provider_ref: &str, amount: i64) -> Result<ProcessorResponse> {
        self.respond("capture", provider_ref, amount)
    }

    async fn refund(&self, provider_ref: &str, amount: i64) -> Result<ProcessorResponse> {
        self.respond("refund", provider_ref, amount)
    }
}
