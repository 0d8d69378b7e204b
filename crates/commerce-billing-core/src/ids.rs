//! Identifier types for commerce-billing.
//!
//! Every persisted entity has its own strongly-typed identifier so that an invoice id can
//! never be passed where a payment intent id is expected.
//!
//! # Macro-based ID Types
//!
//! The `prefixed_id_type!` macro generates a newtype around `String`. Generated ids look like
//! `in_01j9zq4v7m3x8c2k5t6w0y1b9d`: a short entity prefix followed by a lowercase ULID, so ids
//! sort by creation time. Ids supplied by callers are accepted verbatim, which lets the engine
//! report an empty id as a validation error instead of a parse failure.

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Macro to define a prefixed, ULID-backed identifier type.
///
/// This macro generates a newtype wrapper around `String` with implementations for:
/// - `Clone`, `PartialEq`, `Eq`, `Hash`, `PartialOrd`, `Ord`
/// - `Serialize`, `Deserialize` (transparent string)
/// - `Display`, `Debug`
/// - `From<String>`, `From<&str>`, `Into<String>`, `AsRef<str>`
///
/// # Example
///
/// ```ignore
/// prefixed_id_type!(WidgetId, "wdg", "A widget identifier.");
/// let id = WidgetId::generate();
/// assert!(id.as_str().starts_with("wdg_"));
/// ```
macro_rules! prefixed_id_type {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Prefix used for generated identifiers of this type.
            pub const PREFIX: &'static str = $prefix;

            /// Wrap an existing identifier string.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a new time-ordered identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(format!(
                    "{}_{}",
                    Self::PREFIX,
                    Ulid::new().to_string().to_lowercase()
                ))
            }

            /// Return the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether the identifier is empty (or whitespace only).
            #[must_use]
            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

prefixed_id_type!(CustomerId, "cus", "A customer (billed user) identifier.");
prefixed_id_type!(MeterId, "mtr", "A usage meter identifier.");
prefixed_id_type!(MeterEventId, "mev", "A usage event identifier.");
prefixed_id_type!(PricingRuleId, "prule", "A pricing rule identifier.");
prefixed_id_type!(WatermarkId, "uwm", "A usage watermark identifier.");
prefixed_id_type!(BalanceTransactionId, "btx", "A customer balance ledger entry identifier.");
prefixed_id_type!(InvoiceId, "in", "A billing invoice identifier.");
prefixed_id_type!(LineItemId, "ii", "An invoice line item identifier.");
prefixed_id_type!(PaymentIntentId, "pi", "A payment intent identifier.");
prefixed_id_type!(SetupIntentId, "seti", "A setup intent identifier.");
prefixed_id_type!(PaymentMethodId, "pm", "A stored payment method identifier.");
prefixed_id_type!(RefundId, "re", "A refund identifier.");
prefixed_id_type!(CreditNoteId, "cn", "A credit note identifier.");
prefixed_id_type!(PayoutId, "po", "A payout identifier.");
prefixed_id_type!(EventId, "evt", "A billing event identifier.");
prefixed_id_type!(WebhookEndpointId, "we", "A webhook endpoint identifier.");
prefixed_id_type!(SubscriptionId, "sub", "A subscription identifier.");
prefixed_id_type!(SubscriptionItemId, "si", "A metered subscription item identifier.");
prefixed_id_type!(ScheduleId, "ssch", "A subscription schedule identifier.");
prefixed_id_type!(PlanId, "plan", "A plan identifier.");
prefixed_id_type!(TaxRegionId, "txr", "A tax region identifier.");
prefixed_id_type!(TaxRateId, "txrate", "A tax rate identifier.");
prefixed_id_type!(WorkflowRunId, "wfr", "A durable workflow run identifier.");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_carry_prefix() {
        let id = InvoiceId::generate();
        assert!(id.as_str().starts_with("in_"));
        assert_eq!(id.as_str().len(), "in_".len() + 26);
        assert!(!id.is_empty());
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = PaymentIntentId::generate();
        let b = PaymentIntentId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn caller_ids_are_kept_verbatim() {
        let id = MeterId::from("api_requests");
        assert_eq!(id.to_string(), "api_requests");
        assert!(MeterId::from("  ").is_empty());
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = CustomerId::from("cus_123");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"cus_123\"");
        let parsed: CustomerId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }
}
