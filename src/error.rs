//! Error types for taskledger.
//!
//! One enum for the whole crate. [`Error::class`] folds the variants into the
//! coarse taxonomy the HTTP layer and the consumer loop act on.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("contract violation for {event_type}: {reason}")]
    ContractViolation { event_type: String, reason: String },

    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("no workers available")]
    NoWorkersAvailable,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Coarse error classes. Decides HTTP status and whether a failure is the
/// caller's fault or ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input, missing resource, forbidden action. Never retried.
    Client,
    /// Payload failed its event contract.
    ContractViolation,
    /// The broker (or the schema gate service) could not be reached.
    DeliveryFailure,
    /// Database errors.
    PersistenceFailure,
    Internal,
}

impl Error {
    pub fn contract(event_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ContractViolation {
            event_type: event_type.into(),
            reason: reason.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Error::NotFound(_)
            | Error::InvalidInput(_)
            | Error::InvalidTransition { .. }
            | Error::NoWorkersAvailable
            | Error::Forbidden(_)
            | Error::Unauthenticated(_)
            | Error::UnknownEventType(_) => ErrorClass::Client,
            Error::ContractViolation { .. } => ErrorClass::ContractViolation,
            Error::Delivery(_) | Error::Http(_) => ErrorClass::DeliveryFailure,
            Error::Storage(_) | Error::Migrate(_) => ErrorClass::PersistenceFailure,
            Error::Config(_) | Error::Serialization(_) | Error::Io(_) | Error::Other(_) => {
                ErrorClass::Internal
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
