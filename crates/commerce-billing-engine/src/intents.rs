//! Payment intents, setup intents and stored payment methods.
//!
//! The state machines live in `commerce_billing_core::intent`; this module persists them,
//! records their events and drives the configured [`PaymentProcessor`]. Without an available
//! processor a confirmed payment settles internally under [`INTERNAL_PROVIDER_REF`].

use std::collections::HashMap;
use std::sync::Arc;

use commerce_billing_core::{
    event_types, BillingError, CaptureMethod, CustomerId, InvoiceId, PaymentIntent,
    PaymentIntentId, PaymentMethod, PaymentMethodId, PaymentMethodType, Result, SetupIntent,
    SetupIntentId, INTERNAL_PROVIDER_REF,
};
use commerce_billing_store::StoreExt;

use crate::engine::{BillingEngine, Tx};
use crate::events::snapshot;
use crate::processor::{ChargeRequest, PaymentProcessor};

/// Parameters for a new payment intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPaymentIntent {
    /// Paying customer.
    pub customer_id: CustomerId,
    /// Amount in cents.
    pub amount: i64,
    /// Currency; the engine default when `None`.
    pub currency: Option<String>,
    /// Automatic charges on confirmation, manual authorizes only.
    pub capture_method: CaptureMethod,
    /// Invoice the payment settles.
    pub invoice_id: Option<InvoiceId>,
    /// Caller metadata.
    pub metadata: HashMap<String, String>,
}

impl NewPaymentIntent {
    /// An automatic-capture intent in the default currency.
    #[must_use]
    pub fn new(customer_id: impl Into<CustomerId>, amount: i64) -> Self {
        Self {
            customer_id: customer_id.into(),
            amount,
            currency: None,
            capture_method: CaptureMethod::Automatic,
            invoice_id: None,
            metadata: HashMap::new(),
        }
    }

    /// Use `currency`.
    #[must_use]
    pub fn currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = Some(currency.into());
        self
    }

    /// Authorize on confirmation and capture later.
    #[must_use]
    pub fn manual_capture(mut self) -> Self {
        self.capture_method = CaptureMethod::Manual;
        self
    }

    /// Link the payment to an invoice.
    #[must_use]
    pub fn for_invoice(mut self, invoice_id: InvoiceId) -> Self {
        self.invoice_id = Some(invoice_id);
        self
    }

    /// Add a metadata entry.
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

// =============================================================================
// Payment methods
// =============================================================================

impl BillingEngine {
    /// Store a payment method for a customer.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for an empty customer id or provider token.
    pub fn create_payment_method(
        &self,
        customer_id: &CustomerId,
        method_type: PaymentMethodType,
        provider_token: &str,
    ) -> Result<PaymentMethod> {
        if customer_id.is_empty() {
            return Err(BillingError::validation("customer_id is required"));
        }
        if provider_token.trim().is_empty() {
            return Err(BillingError::validation("provider_token is required"));
        }
        let method = PaymentMethod {
            id: PaymentMethodId::generate(),
            customer_id: customer_id.clone(),
            method_type,
            provider_token: provider_token.to_string(),
            created_at: self.now(),
        };
        self.store().create(&method)?;
        tracing::info!(
            payment_method_id = %method.id,
            customer_id = %customer_id,
            "Payment method stored"
        );
        Ok(method)
    }

    /// Get a payment method.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the payment method does not exist.
    pub fn get_payment_method(&self, id: &PaymentMethodId) -> Result<PaymentMethod> {
        Ok(self.store().require(id.as_str())?)
    }

    /// A customer's payment methods, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the scan fails.
    pub fn list_payment_methods(&self, customer_id: &CustomerId) -> Result<Vec<PaymentMethod>> {
        let mut methods = self
            .store()
            .query::<PaymentMethod>(|m| m.customer_id == *customer_id)?;
        methods.sort_by_key(|m| m.created_at);
        Ok(methods)
    }
}

// =============================================================================
// Payment intents
// =============================================================================

impl BillingEngine {
    /// Create a payment intent waiting for a payment method.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for an empty customer id or a non-positive amount.
    pub fn create_payment_intent(&self, params: NewPaymentIntent) -> Result<PaymentIntent> {
        if params.customer_id.is_empty() {
            return Err(BillingError::validation("customer_id is required"));
        }
        if params.amount <= 0 {
            return Err(BillingError::validation("payment intent amount must be positive"));
        }
        let currency = self.currency_or_default(params.currency.as_deref());
        let mut intent = PaymentIntent::new(
            params.customer_id,
            params.amount,
            currency,
            params.capture_method,
            self.now(),
        );
        intent.invoice_id = params.invoice_id;
        intent.metadata = params.metadata;

        self.store().transaction(|tx| {
            tx.create(&intent)?;
            self.record(tx, event_types::PAYMENT_INTENT_CREATED, &intent, None)
        })?;
        self.wake_dispatcher();
        tracing::info!(
            payment_intent_id = %intent.id,
            amount = intent.amount,
            currency = %intent.currency,
            "Payment intent created"
        );
        Ok(intent)
    }

    /// Get a payment intent.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the intent does not exist.
    pub fn get_payment_intent(&self, id: &PaymentIntentId) -> Result<PaymentIntent> {
        Ok(self.store().require(id.as_str())?)
    }

    /// Attach a stored payment method to an intent.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the intent or payment method does not exist.
    /// - `Validation` if the payment method belongs to another customer.
    /// - `InvalidState` unless the intent still needs a payment method or confirmation.
    pub fn attach_payment_method(
        &self,
        id: &PaymentIntentId,
        payment_method_id: &PaymentMethodId,
    ) -> Result<PaymentIntent> {
        let intent = self.store().transaction(|tx| {
            let mut intent: PaymentIntent = tx.require(id.as_str())?;
            let method: PaymentMethod = tx.require(payment_method_id.as_str())?;
            ensure_owner(&method, &intent.customer_id)?;
            intent.attach_payment_method(method.id)?;
            intent.updated_at = self.now();
            tx.update(&intent)?;
            Ok::<_, BillingError>(intent)
        })?;
        tracing::debug!(
            payment_intent_id = %intent.id,
            payment_method_id = %payment_method_id,
            "Payment method attached"
        );
        Ok(intent)
    }

    /// Confirm an intent and settle it.
    ///
    /// With no available processor the intent succeeds internally for its full amount.
    /// Otherwise the stored payment method's token is authorized (manual capture) or
    /// charged (automatic capture).
    ///
    /// # Errors
    ///
    /// - `NotFound` if the intent does not exist.
    /// - `InvalidState` / `Validation` from the confirm transition.
    /// - The processor's error; the intent is then back in `requires_payment_method` with
    ///   the error recorded.
    pub async fn confirm_payment_intent(
        &self,
        id: &PaymentIntentId,
        payment_method_id: Option<PaymentMethodId>,
    ) -> Result<PaymentIntent> {
        let (intent, token) = self.store().transaction(|tx| {
            let mut intent: PaymentIntent = tx.require(id.as_str())?;
            let previous = snapshot(&intent)?;
            intent.confirm(payment_method_id)?;
            let token =
                self.provider_token(tx, intent.payment_method_id.as_ref(), &intent.customer_id)?;
            intent.updated_at = self.now();
            tx.update(&intent)?;
            self.record(tx, event_types::PAYMENT_INTENT_PROCESSING, &intent, Some(previous))?;
            Ok::<_, BillingError>((intent, token))
        })?;
        self.wake_dispatcher();

        let Some(processor) = self.available_processor().map(Arc::clone) else {
            let amount = intent.amount;
            let intent = self.mutate(
                id.as_str(),
                event_types::PAYMENT_INTENT_SUCCEEDED,
                |intent: &mut PaymentIntent, now| {
                    intent.mark_succeeded(INTERNAL_PROVIDER_REF, amount);
                    intent.updated_at = now;
                    Ok(())
                },
            )?;
            tracing::info!(
                payment_intent_id = %intent.id,
                amount,
                "Payment intent settled internally"
            );
            return Ok(intent);
        };

        self.settle_with_processor(processor.as_ref(), intent, token).await
    }

    async fn settle_with_processor(
        &self,
        processor: &dyn PaymentProcessor,
        intent: PaymentIntent,
        token: String,
    ) -> Result<PaymentIntent> {
        let request = ChargeRequest {
            customer_id: intent.customer_id.clone(),
            amount: intent.amount,
            currency: intent.currency.clone(),
            payment_token: token,
            idempotency_key: intent.id.to_string(),
        };
        let manual = intent.capture_method == CaptureMethod::Manual;
        let outcome = if manual {
            processor.authorize(&request).await
        } else {
            processor.charge(&request).await
        };

        match outcome {
            Ok(response) => {
                let event_type = if manual {
                    event_types::PAYMENT_INTENT_REQUIRES_CAPTURE
                } else {
                    event_types::PAYMENT_INTENT_SUCCEEDED
                };
                let intent = self.mutate(
                    intent.id.as_str(),
                    event_type,
                    |intent: &mut PaymentIntent, now| {
                        if manual {
                            intent.mark_requires_capture(response.provider_ref);
                        } else {
                            intent.mark_succeeded(response.provider_ref, response.amount);
                        }
                        intent.updated_at = now;
                        Ok(())
                    },
                )?;
                tracing::info!(
                    payment_intent_id = %intent.id,
                    processor = processor.processor_type(),
                    status = %intent.status,
                    "Payment intent confirmed"
                );
                Ok(intent)
            }
            Err(e) => {
                let message = e.to_string();
                self.mutate(
                    intent.id.as_str(),
                    event_types::PAYMENT_INTENT_PAYMENT_FAILED,
                    |intent: &mut PaymentIntent, now| {
                        intent.mark_failed(message);
                        intent.updated_at = now;
                        Ok(())
                    },
                )?;
                tracing::warn!(
                    payment_intent_id = %intent.id,
                    processor = processor.processor_type(),
                    error = %e,
                    "Payment intent failed"
                );
                Err(e)
            }
        }
    }

    /// Capture an authorized intent, in full when `amount` is `None`.
    ///
    /// The processor is asked to capture only when the authorization came from it.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the intent does not exist.
    /// - `InvalidState` unless the intent requires capture.
    /// - `Validation` if the amount exceeds the capturable amount.
    /// - The processor's error, leaving the intent unchanged.
    pub async fn capture_payment_intent(
        &self,
        id: &PaymentIntentId,
        amount: Option<i64>,
    ) -> Result<PaymentIntent> {
        let mut intent = self.get_payment_intent(id)?;
        let amount = amount.unwrap_or(intent.amount_capturable);
        // Validate on a copy before calling out.
        intent.capture(amount)?;

        let external_ref = intent
            .provider_ref
            .clone()
            .filter(|r| r != INTERNAL_PROVIDER_REF);
        if let (Some(provider_ref), Some(processor)) = (external_ref, self.available_processor()) {
            processor.capture(&provider_ref, amount).await?;
        }

        let intent = self.mutate(
            id.as_str(),
            event_types::PAYMENT_INTENT_SUCCEEDED,
            |intent: &mut PaymentIntent, now| {
                intent.capture(amount)?;
                intent.updated_at = now;
                Ok(())
            },
        )?;
        tracing::info!(payment_intent_id = %intent.id, amount, "Payment intent captured");
        Ok(intent)
    }

    /// Cancel an intent that has not succeeded.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the intent does not exist.
    /// - `InvalidState` if it already succeeded or was canceled.
    pub fn cancel_payment_intent(
        &self,
        id: &PaymentIntentId,
        reason: &str,
    ) -> Result<PaymentIntent> {
        let intent = self.mutate(
            id.as_str(),
            event_types::PAYMENT_INTENT_CANCELED,
            |intent: &mut PaymentIntent, now| {
                intent.cancel(reason, now)?;
                intent.updated_at = now;
                Ok(())
            },
        )?;
        tracing::info!(payment_intent_id = %intent.id, reason, "Payment intent canceled");
        Ok(intent)
    }

    /// Provider token for the intent's payment method.
    ///
    /// A payment method id that was never stored is passed through as the token.
    fn provider_token(
        &self,
        tx: &Tx<'_>,
        payment_method_id: Option<&PaymentMethodId>,
        customer_id: &CustomerId,
    ) -> Result<String> {
        let Some(pm) = payment_method_id else {
            return Err(BillingError::validation("a payment method is required"));
        };
        match tx.get::<PaymentMethod>(pm.as_str())? {
            Some(method) => {
                ensure_owner(&method, customer_id)?;
                Ok(method.provider_token)
            }
            None => Ok(pm.to_string()),
        }
    }
}

// =============================================================================
// Setup intents
// =============================================================================

impl BillingEngine {
    /// Create a setup intent for a customer.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for an empty customer id.
    pub fn create_setup_intent(&self, customer_id: &CustomerId) -> Result<SetupIntent> {
        if customer_id.is_empty() {
            return Err(BillingError::validation("customer_id is required"));
        }
        let intent = SetupIntent::new(customer_id.clone(), self.now());
        self.store().transaction(|tx| {
            tx.create(&intent)?;
            self.record(tx, event_types::SETUP_INTENT_CREATED, &intent, None)
        })?;
        self.wake_dispatcher();
        tracing::info!(
            setup_intent_id = %intent.id,
            customer_id = %customer_id,
            "Setup intent created"
        );
        Ok(intent)
    }

    /// Get a setup intent.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the intent does not exist.
    pub fn get_setup_intent(&self, id: &SetupIntentId) -> Result<SetupIntent> {
        Ok(self.store().require(id.as_str())?)
    }

    /// Confirm a setup intent. It succeeds with the payment method's token as reference.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the intent does not exist.
    /// - `InvalidState` / `Validation` from the confirm transition, or a payment method of
    ///   another customer.
    pub fn confirm_setup_intent(
        &self,
        id: &SetupIntentId,
        payment_method_id: Option<PaymentMethodId>,
    ) -> Result<SetupIntent> {
        let intent = self.store().transaction(|tx| {
            let mut intent: SetupIntent = tx.require(id.as_str())?;
            let previous = snapshot(&intent)?;
            intent.confirm(payment_method_id)?;
            let token =
                self.provider_token(tx, intent.payment_method_id.as_ref(), &intent.customer_id)?;
            intent.mark_succeeded(token);
            intent.updated_at = self.now();
            tx.update(&intent)?;
            self.record(tx, event_types::SETUP_INTENT_SUCCEEDED, &intent, Some(previous))?;
            Ok::<_, BillingError>(intent)
        })?;
        self.wake_dispatcher();
        tracing::info!(setup_intent_id = %intent.id, "Setup intent succeeded");
        Ok(intent)
    }

    /// Cancel a setup intent.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the intent does not exist.
    /// - `InvalidState` if it already succeeded or was canceled.
    pub fn cancel_setup_intent(&self, id: &SetupIntentId, reason: &str) -> Result<SetupIntent> {
        self.mutate(
            id.as_str(),
            event_types::SETUP_INTENT_CANCELED,
            |intent: &mut SetupIntent, now| {
                intent.cancel(reason, now)?;
                intent.updated_at = now;
                Ok(())
            },
        )
    }
}

fn ensure_owner(method: &PaymentMethod, customer_id: &CustomerId) -> Result<()> {
    if method.customer_id == *customer_id {
        Ok(())
    } else {
        Err(BillingError::validation(format!(
            "payment method {} does not belong to customer {customer_id}",
            method.id
        )))
    }
}
