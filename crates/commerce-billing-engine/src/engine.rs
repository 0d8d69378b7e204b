//! The shared engine handle.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use commerce_billing_store::{Store, Transaction};

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::processor::{CreditBurner, PaymentProcessor};

/// A store transaction over the engine's store.
pub(crate) type Tx<'a> = Transaction<'a, dyn Store>;

/// The billing engine.
///
/// Cheap to clone; every clone shares the same store, configuration and integrations.
/// Operations live in the topical modules (`metering`, `invoicing`, `collection`, ...) as
/// `impl BillingEngine` blocks.
#[derive(Clone)]
pub struct BillingEngine {
    store: Arc<dyn Store>,
    config: Arc<EngineConfig>,
    processor: Option<Arc<dyn PaymentProcessor>>,
    credit_burner: Option<Arc<dyn CreditBurner>>,
    clock: Arc<dyn Clock>,
    dispatch: Arc<Notify>,
}

impl BillingEngine {
    /// Create an engine with no processor or credit burner, on the system clock.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: EngineConfig) -> Self {
        tracing::info!(
            default_currency = %config.default_currency,
            livemode = config.livemode,
            dunning_attempts = config.dunning.attempts(),
            "Billing engine initialized"
        );
        Self {
            store,
            config: Arc::new(config),
            processor: None,
            credit_burner: None,
            clock: Arc::new(SystemClock),
            dispatch: Arc::new(Notify::new()),
        }
    }

    /// Attach a payment processor.
    #[must_use]
    pub fn with_processor(mut self, processor: Arc<dyn PaymentProcessor>) -> Self {
        tracing::info!(processor = processor.processor_type(), "Payment processor configured");
        self.processor = Some(processor);
        self
    }

    /// Attach a credit burner used first in the collection waterfall.
    #[must_use]
    pub fn with_credit_burner(mut self, burner: Arc<dyn CreditBurner>) -> Self {
        tracing::info!("Credit burner configured");
        self.credit_burner = Some(burner);
        self
    }

    /// Replace the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The engine clock.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The current time on the engine clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// The configured processor, if it is currently available.
    pub(crate) fn available_processor(&self) -> Option<&Arc<dyn PaymentProcessor>> {
        match &self.processor {
            Some(processor) if processor.is_available() => Some(processor),
            Some(processor) => {
                tracing::warn!(
                    processor = processor.processor_type(),
                    "Payment processor unavailable"
                );
                None
            }
            None => None,
        }
    }

    pub(crate) fn credit_burner(&self) -> Option<&Arc<dyn CreditBurner>> {
        self.credit_burner.as_ref()
    }

    pub(crate) fn dispatch_signal(&self) -> &Arc<Notify> {
        &self.dispatch
    }

    /// Currency to use when the caller passes none or an empty one.
    pub(crate) fn currency_or_default(&self, currency: Option<&str>) -> String {
        currency
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(&self.config.default_currency)
            .to_lowercase()
    }
}
