//! Error types for the broker core.

use crate::types::{SessionName, SubscriptionId, TopicId};
use thiserror::Error;

/// Main error type for broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    // --- Configuration errors ---
    #[error("Invalid query '{query}': {reason}")]
    InvalidQuery { query: String, reason: String },

    #[error("Topic '{0}' is readonly, rejecting publish")]
    ReadonlyTopic(TopicId),

    #[error("Invalid subscription id: {0}")]
    InvalidSubscriptionId(String),

    #[error("Topic '{0}' is being erased, rejecting publish")]
    TopicErased(TopicId),

    // --- Resource errors ---
    #[error("Callback queue overflow for session '{session}' (capacity {capacity})")]
    QueueOverflow { session: SessionName, capacity: usize },

    #[error("Message store overflow for topic '{topic}' (capacity {capacity})")]
    StoreOverflow { topic: TopicId, capacity: usize },

    #[error("Unknown destination session '{0}' and forceQueuing is not set")]
    UnknownDestination(SessionName),

    #[error("Session '{0}' has no callback channel, subscribe rejected")]
    NoCallback(SessionName),

    // --- Not found ---
    #[error("Topic not found: {0}")]
    TopicNotFound(TopicId),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    #[error("Session not found: {0}")]
    SessionNotFound(SessionName),

    // --- Internal ---
    /// Invariant violation. Callers that can continue log this at error
    /// severity and degrade instead of propagating.
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Access filter '{plugin}' failed: {reason}")]
    FilterFailed { plugin: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::Serialization(e.to_string())
    }
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;
