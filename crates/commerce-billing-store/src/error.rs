//! Error types for commerce-billing storage.

use commerce_billing_core::BillingError;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Entity kind.
        kind: &'static str,
        /// Record key.
        id: String,
    },

    /// A record with the same key already exists.
    #[error("{kind} already exists: {id}")]
    AlreadyExists {
        /// Entity kind.
        kind: &'static str,
        /// Record key.
        id: String,
    },

    /// A lock guarding the store was poisoned by a panicking writer.
    #[error("store lock poisoned")]
    LockPoisoned,
}

impl From<StoreError> for BillingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind, id } => Self::NotFound { entity: kind, id },
            StoreError::AlreadyExists { kind, id } => {
                Self::Validation(format!("{kind} already exists: {id}"))
            }
            StoreError::Serialization(message) => Self::Serialization(message),
            StoreError::Database(message) => Self::Storage(message),
            StoreError::LockPoisoned => Self::Storage("store lock poisoned".to_string()),
        }
    }
}
