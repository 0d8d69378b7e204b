//! Commerce billing engine.
//!
//! [`BillingEngine`] is the single entry point over a [`Store`](commerce_billing_store::Store):
//!
//! - Usage metering with idempotent ingestion and billing watermarks
//! - Customer balance ledger and tax calculation
//! - Invoices and the collection waterfall (credits, then balance)
//! - Payment and setup intents against a pluggable [`PaymentProcessor`]
//! - Refunds, credit notes and payouts
//! - An event outbox delivered to webhook endpoints by the [`WebhookDispatcher`]
//!
//! Subscriptions are driven by durable workflows run by the [`WorkflowRunner`]: trial expiry,
//! renewals and dunning, suspended on timers raced against [`Signal`]s.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use commerce_billing_core::BalanceTransactionType;
//! use commerce_billing_engine::{BalanceAdjustment, BillingEngine, EngineConfig};
//! use commerce_billing_store::MemoryStore;
//!
//! let engine = BillingEngine::new(Arc::new(MemoryStore::new()), EngineConfig::default());
//! let credit = BalanceAdjustment::new(
//!     "cus_1".into(),
//!     5_000,
//!     BalanceTransactionType::Promotion,
//!     "Welcome credit",
//! );
//! let entry = engine.adjust_customer_balance(&credit).unwrap();
//! assert_eq!(entry.ending_balance, 5_000);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod clock;
pub mod collection;
pub mod config;
pub mod crypto;
pub mod dispatcher;
pub mod engine;
pub mod events;
pub mod intents;
pub mod invoicing;
pub mod ledger;
pub mod metering;
pub mod payouts;
pub mod processor;
pub mod refunds;
pub mod retry;
pub mod subscriptions;
pub mod tax;
pub mod workflow;

pub use clock::{Clock, SystemClock, TokioClock};
pub use collection::CollectionResult;
pub use config::{ActivityOptions, DunningConfig, EngineConfig, RetryPolicy, WebhookConfig};
pub use crypto::{verify_webhook_signature, SIGNATURE_HEADER};
pub use dispatcher::{DrainReport, WebhookDispatcher};
pub use engine::BillingEngine;
pub use events::EventSubject;
pub use intents::NewPaymentIntent;
pub use invoicing::NewInvoice;
pub use ledger::{AppliedBalance, BalanceAdjustment};
pub use metering::{IngestOutcome, ItemUsage, ThresholdCheck, UsageEventInput};
pub use processor::{ChargeRequest, CreditBurner, PaymentProcessor, ProcessorResponse};
pub use refunds::RefundParams;
pub use subscriptions::NewSubscription;
pub use workflow::{
    LifecycleOutcome, RenewalOutcome, Signal, WorkflowPhase, WorkflowRun, WorkflowRunner,
};
