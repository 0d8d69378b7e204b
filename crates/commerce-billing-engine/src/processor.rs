//! Extension points injected into the engine: payment processors and credit burners.

use async_trait::async_trait;

use commerce_billing_core::{CustomerId, MeterId, Result};
use commerce_billing_store::{Store, Transaction};

/// A charge or authorization request sent to a processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeRequest {
    /// The paying customer.
    pub customer_id: CustomerId,
    /// Amount in cents.
    pub amount: i64,
    /// Currency code.
    pub currency: String,
    /// Processor token of the stored payment method.
    pub payment_token: String,
    /// Key the processor uses to deduplicate retries (the intent id).
    pub idempotency_key: String,
}

/// Outcome of a successful processor call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorResponse {
    /// The processor's reference for the charge, authorization or refund.
    pub provider_ref: String,
    /// Amount the processor acted on.
    pub amount: i64,
}

/// An external payment processor.
///
/// Failures are reported as `BillingError::External` so workflow activities may retry them.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Short processor name for logs ("stripe", "adyen", ...).
    fn processor_type(&self) -> &str;

    /// Whether the processor can take requests right now.
    fn is_available(&self) -> bool;

    /// Authorize without capturing.
    async fn authorize(&self, request: &ChargeRequest) -> Result<ProcessorResponse>;

    /// Authorize and capture.
    async fn charge(&self, request: &ChargeRequest) -> Result<ProcessorResponse>;

    /// Capture part or all of an authorization.
    async fn capture(&self, provider_ref: &str, amount: i64) -> Result<ProcessorResponse>;

    /// Refund part or all of a settled charge.
    async fn refund(&self, provider_ref: &str, amount: i64) -> Result<ProcessorResponse>;
}

/// Burns prepaid credits toward an invoice.
///
/// Runs inside the collection transaction: writes staged through `tx` commit together with
/// the invoice update, or not at all. Returns the amount still owed after burning, so
/// `amount` means nothing was burned and `0` means credits covered everything.
pub trait CreditBurner: Send + Sync {
    /// Burn up to `amount` of the customer's credits.
    ///
    /// # Errors
    ///
    /// Any error aborts the collection attempt; the caller reports it as a retryable
    /// `BillingError::External`.
    fn burn(
        &self,
        tx: &mut Transaction<'_, dyn Store>,
        customer_id: &CustomerId,
        amount: i64,
        meter_id: Option<&MeterId>,
    ) -> Result<i64>;
}

impl<F> CreditBurner for F
where
    F: Fn(&mut Transaction<'_, dyn Store>, &CustomerId, i64, Option<&MeterId>) -> Result<i64>
        + Send
        + Sync,
{
    fn burn(
        &self,
        tx: &mut Transaction<'_, dyn Store>,
        customer_id: &CustomerId,
        amount: i64,
        meter_id: Option<&MeterId>,
    ) -> Result<i64> {
        self(tx, customer_id, amount, meter_id)
    }
}
