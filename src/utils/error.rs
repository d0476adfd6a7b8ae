//! The `error` module defines the error taxonomy of the broker.
//!
//! Every pipeline (publish, delivery, acknowledgement, topic and subscriber
//! management) reports failures through [`BrokerError`]. Client-caused
//! rejections carry a human-readable reason that the HTTP layer returns
//! verbatim; store failures are surfaced as server errors.

use thiserror::Error;

use crate::persistence::StoreError;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Malformed or incomplete request, duplicate id.
    #[error("{0}")]
    Validation(String),
    /// A configured cap would be exceeded under the reject policy.
    #[error("{0}")]
    Capacity(String),
    /// Unknown topic, subscriber, message or subscription.
    #[error("{0}")]
    NotFound(String),
    /// The entity already exists.
    #[error("{0}")]
    Conflict(String),
    /// Acknowledgement arrived after the acknowledgement window closed.
    #[error("{0}")]
    Window(String),
    /// The operation is not available in the configured delivery mode.
    #[error("{0}")]
    Mode(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BrokerError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }

    pub fn capacity(reason: impl Into<String>) -> Self {
        Self::Capacity(reason.into())
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::NotFound(reason.into())
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict(reason.into())
    }

    /// Whether the failure was caused by the request rather than the broker.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::Internal(_) | Self::Store(_))
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;
