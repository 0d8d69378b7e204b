//! Error types for commerce-billing.

/// Result type for commerce-billing operations.
pub type Result<T> = std::result::Result<T, BillingError>;

/// Errors that can occur in billing operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BillingError {
    /// A required field is missing or a value is out of range.
    #[error("validation error: {0}")]
    Validation(String),

    /// The operation is not legal in the entity's current status.
    #[error("cannot {operation} {entity} in status {status}")]
    InvalidState {
        /// The entity kind (e.g. "invoice").
        entity: &'static str,
        /// The current status of the entity.
        status: String,
        /// The attempted operation.
        operation: &'static str,
    },

    /// A referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The entity kind.
        entity: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// External service error (payment processor, webhook endpoint).
    #[error("external service error: {service} - {message}")]
    External {
        /// The service that failed.
        service: String,
        /// Error message.
        message: String,
    },

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A webhook signature header could not be parsed.
    #[error("invalid signature header: {0}")]
    SignatureFormat(String),

    /// A webhook signature did not match the payload.
    #[error("webhook signature verification failed")]
    SignatureMismatch,

    /// A workflow activity did not finish within its timeout.
    #[error("activity timed out: {activity}")]
    ActivityTimeout {
        /// The activity name.
        activity: String,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl BillingError {
    /// Build a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Build a state-transition error naming the current status.
    #[must_use]
    pub fn invalid_state(
        entity: &'static str,
        status: impl ToString,
        operation: &'static str,
    ) -> Self {
        Self::InvalidState {
            entity,
            status: status.to_string(),
            operation,
        }
    }

    /// Build a not-found error.
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Build an external-dependency error.
    #[must_use]
    pub fn external(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::External {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Whether an activity that failed with this error may be retried.
    ///
    /// Only infrastructure failures are retryable. Validation, state and lookup errors are
    /// deterministic and fail the same way on every attempt.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::External { .. } | Self::Storage(_) | Self::ActivityTimeout { .. }
        )
    }
}
