//! Payment and setup intents.
//!
//! A [`PaymentIntent`] tracks one attempt to move money from a customer:
//!
//! ```text
//! requires_payment_method ─▶ requires_confirmation ─▶ processing ─┬─▶ succeeded
//!          ▲                                              │         └─▶ requires_capture
//!          └──────────────── (processor failure) ─────────┘
//! requires_capture ─(capture)─▶ succeeded
//! any non-final status ─▶ canceled
//! ```
//!
//! A [`SetupIntent`] follows the same path without an amount or a capture step.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, Result};
use crate::ids::{CustomerId, InvoiceId, PaymentIntentId, PaymentMethodId, SetupIntentId};

/// Provider reference used when a payment settles without an external processor.
pub const INTERNAL_PROVIDER_REF: &str = "internal";

/// Payment intent status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentIntentStatus {
    /// Waiting for a payment method.
    RequiresPaymentMethod,
    /// Payment method attached, waiting for confirmation.
    RequiresConfirmation,
    /// Submitted to the processor.
    Processing,
    /// Authorized, waiting for capture.
    RequiresCapture,
    /// Funds received.
    Succeeded,
    /// Abandoned.
    Canceled,
}

impl PaymentIntentStatus {
    /// Get the status name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RequiresPaymentMethod => "requires_payment_method",
            Self::RequiresConfirmation => "requires_confirmation",
            Self::Processing => "processing",
            Self::RequiresCapture => "requires_capture",
            Self::Succeeded => "succeeded",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for PaymentIntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When an authorized payment is captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMethod {
    /// Charge immediately on confirmation.
    #[default]
    Automatic,
    /// Authorize on confirmation, capture later.
    Manual,
}

/// A payment in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    /// Intent identifier.
    pub id: PaymentIntentId,
    /// The paying customer.
    pub customer_id: CustomerId,
    /// Amount in cents.
    pub amount: i64,
    /// Currency code.
    pub currency: String,
    /// Capture behaviour.
    pub capture_method: CaptureMethod,
    /// Current status.
    pub status: PaymentIntentStatus,
    /// Attached payment method.
    pub payment_method_id: Option<PaymentMethodId>,
    /// Amount authorized and still capturable.
    pub amount_capturable: i64,
    /// Amount actually received.
    pub amount_received: i64,
    /// Processor reference for the charge or authorization.
    pub provider_ref: Option<String>,
    /// Last processor error.
    pub last_error: Option<String>,
    /// Invoice the intent pays, if any.
    pub invoice_id: Option<InvoiceId>,
    /// Cancellation reason.
    pub cancellation_reason: Option<String>,
    /// When the intent was canceled.
    pub canceled_at: Option<DateTime<Utc>>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// When the intent was created.
    pub created_at: DateTime<Utc>,
    /// When the intent last changed.
    pub updated_at: DateTime<Utc>,
}

impl PaymentIntent {
    /// Create a new intent waiting for a payment method.
    #[must_use]
    pub fn new(
        customer_id: CustomerId,
        amount: i64,
        currency: impl Into<String>,
        capture_method: CaptureMethod,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PaymentIntentId::generate(),
            customer_id,
            amount,
            currency: currency.into().to_lowercase(),
            capture_method,
            status: PaymentIntentStatus::RequiresPaymentMethod,
            payment_method_id: None,
            amount_capturable: 0,
            amount_received: 0,
            provider_ref: None,
            last_error: None,
            invoice_id: None,
            cancellation_reason: None,
            canceled_at: None,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach a payment method.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the intent is waiting for a payment method or
    /// confirmation.
    pub fn attach_payment_method(&mut self, payment_method_id: PaymentMethodId) -> Result<()> {
        if !matches!(
            self.status,
            PaymentIntentStatus::RequiresPaymentMethod | PaymentIntentStatus::RequiresConfirmation
        ) {
            return Err(self.illegal("attach payment method to"));
        }
        self.payment_method_id = Some(payment_method_id);
        self.status = PaymentIntentStatus::RequiresConfirmation;
        Ok(())
    }

    /// Confirm the intent, moving it to `processing`.
    ///
    /// # Errors
    ///
    /// - `InvalidState` unless the intent requires a payment method or confirmation.
    /// - `Validation` if no payment method is given or attached.
    pub fn confirm(&mut self, payment_method_id: Option<PaymentMethodId>) -> Result<()> {
        if !matches!(
            self.status,
            PaymentIntentStatus::RequiresPaymentMethod | PaymentIntentStatus::RequiresConfirmation
        ) {
            return Err(self.illegal("confirm"));
        }
        if let Some(pm) = payment_method_id {
            self.payment_method_id = Some(pm);
        }
        if self.payment_method_id.as_ref().map_or(true, PaymentMethodId::is_empty) {
            return Err(BillingError::validation(
                "a payment method is required to confirm a payment intent",
            ));
        }
        self.status = PaymentIntentStatus::Processing;
        self.last_error = None;
        Ok(())
    }

    /// Record a settled payment.
    pub fn mark_succeeded(&mut self, provider_ref: impl Into<String>, amount_received: i64) {
        self.status = PaymentIntentStatus::Succeeded;
        self.provider_ref = Some(provider_ref.into());
        self.amount_received = amount_received;
        self.amount_capturable = 0;
        self.last_error = None;
    }

    /// Record an authorization awaiting capture.
    pub fn mark_requires_capture(&mut self, provider_ref: impl Into<String>) {
        self.status = PaymentIntentStatus::RequiresCapture;
        self.provider_ref = Some(provider_ref.into());
        self.amount_capturable = self.amount;
    }

    /// Record a processor failure; the intent needs a new payment method.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = PaymentIntentStatus::RequiresPaymentMethod;
        self.last_error = Some(error.into());
    }

    /// Capture an authorized amount.
    ///
    /// # Errors
    ///
    /// - `InvalidState` unless the intent requires capture.
    /// - `Validation` if `amount` is not positive or exceeds the capturable amount.
    pub fn capture(&mut self, amount: i64) -> Result<()> {
        if self.status != PaymentIntentStatus::RequiresCapture {
            return Err(self.illegal("capture"));
        }
        if amount <= 0 {
            return Err(BillingError::validation("capture amount must be positive"));
        }
        if amount > self.amount_capturable {
            return Err(BillingError::validation(format!(
                "capture amount {amount} exceeds capturable amount {}",
                self.amount_capturable
            )));
        }
        self.status = PaymentIntentStatus::Succeeded;
        self.amount_received = amount;
        self.amount_capturable = 0;
        Ok(())
    }

    /// Cancel the intent.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the intent already succeeded or was canceled.
    pub fn cancel(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        if matches!(
            self.status,
            PaymentIntentStatus::Succeeded | PaymentIntentStatus::Canceled
        ) {
            return Err(self.illegal("cancel"));
        }
        self.status = PaymentIntentStatus::Canceled;
        self.cancellation_reason = Some(reason.into());
        self.canceled_at = Some(now);
        self.amount_capturable = 0;
        Ok(())
    }

    fn illegal(&self, operation: &'static str) -> BillingError {
        BillingError::invalid_state("payment intent", self.status, operation)
    }
}

/// Setup intent status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupIntentStatus {
    /// Waiting for a payment method.
    RequiresPaymentMethod,
    /// Payment method attached, waiting for confirmation.
    RequiresConfirmation,
    /// Verification in flight.
    Processing,
    /// Payment method verified.
    Succeeded,
    /// Abandoned.
    Canceled,
}

impl SetupIntentStatus {
    /// Get the status name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RequiresPaymentMethod => "requires_payment_method",
            Self::RequiresConfirmation => "requires_confirmation",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for SetupIntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payment method verification in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupIntent {
    /// Intent identifier.
    pub id: SetupIntentId,
    /// The customer.
    pub customer_id: CustomerId,
    /// Current status.
    pub status: SetupIntentStatus,
    /// Payment method being verified.
    pub payment_method_id: Option<PaymentMethodId>,
    /// Processor reference.
    pub provider_ref: Option<String>,
    /// Last processor error.
    pub last_error: Option<String>,
    /// Cancellation reason.
    pub cancellation_reason: Option<String>,
    /// When the intent was canceled.
    pub canceled_at: Option<DateTime<Utc>>,
    /// When the intent was created.
    pub created_at: DateTime<Utc>,
    /// When the intent last changed.
    pub updated_at: DateTime<Utc>,
}

impl SetupIntent {
    /// Create a new setup intent.
    #[must_use]
    pub fn new(customer_id: CustomerId, now: DateTime<Utc>) -> Self {
        Self {
            id: SetupIntentId::generate(),
            customer_id,
            status: SetupIntentStatus::RequiresPaymentMethod,
            payment_method_id: None,
            provider_ref: None,
            last_error: None,
            cancellation_reason: None,
            canceled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Confirm the intent, moving it to `processing`.
    ///
    /// # Errors
    ///
    /// - `InvalidState` unless the intent requires a payment method or confirmation.
    /// - `Validation` if no payment method is given or attached.
    pub fn confirm(&mut self, payment_method_id: Option<PaymentMethodId>) -> Result<()> {
        if !matches!(
            self.status,
            SetupIntentStatus::RequiresPaymentMethod | SetupIntentStatus::RequiresConfirmation
        ) {
            return Err(BillingError::invalid_state("setup intent", self.status, "confirm"));
        }
        if let Some(pm) = payment_method_id {
            self.payment_method_id = Some(pm);
        }
        if self.payment_method_id.as_ref().map_or(true, PaymentMethodId::is_empty) {
            return Err(BillingError::validation(
                "a payment method is required to confirm a setup intent",
            ));
        }
        self.status = SetupIntentStatus::Processing;
        self.last_error = None;
        Ok(())
    }

    /// Record a verified payment method.
    pub fn mark_succeeded(&mut self, provider_ref: impl Into<String>) {
        self.status = SetupIntentStatus::Succeeded;
        self.provider_ref = Some(provider_ref.into());
        self.last_error = None;
    }

    /// Record a verification failure.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = SetupIntentStatus::RequiresPaymentMethod;
        self.last_error = Some(error.into());
    }

    /// Cancel the intent.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the intent already succeeded or was canceled.
    pub fn cancel(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        if matches!(
            self.status,
            SetupIntentStatus::Succeeded | SetupIntentStatus::Canceled
        ) {
            return Err(BillingError::invalid_state("setup intent", self.status, "cancel"));
        }
        self.status = SetupIntentStatus::Canceled;
        self.cancellation_reason = Some(reason.into());
        self.canceled_at = Some(now);
        Ok(())
    }
}

/// Kind of stored payment method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethodType {
    /// Payment card.
    Card,
    /// Bank account debit.
    BankAccount,
    /// Anything else the processor understands.
    Other,
}

/// A customer's stored payment method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMethod {
    /// Payment method identifier.
    pub id: PaymentMethodId,
    /// Owning customer.
    pub customer_id: CustomerId,
    /// Kind of method.
    pub method_type: PaymentMethodType,
    /// Processor token handed to `authorize`/`charge`.
    pub provider_token: String,
    /// When the method was stored.
    pub created_at: DateTime<Utc>,
}
