//! Broker and topic configuration.

use serde::{Deserialize, Serialize};

/// Per-topic configuration, fixed when the topic is configured by its first
/// publish (or taken from broker defaults).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Reject publishes once at least one history entry exists.
    pub readonly: bool,

    /// Grace period in milliseconds a topic stays UNREFERENCED before
    /// automatic destruction. Zero destroys immediately, negative waits for
    /// an explicit erase.
    pub destroy_delay_ms: i64,

    /// Maximum entries in the history queue; zero disables history.
    pub history_max_entries: usize,

    /// Maximum entries in the message store.
    pub store_max_entries: usize,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            readonly: false,
            destroy_delay_ms: 60_000,
            history_max_entries: 10,
            store_max_entries: 10_000,
        }
    }
}

/// Broker-wide configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Node name, embedded in internal session names and dead-letter topics.
    pub node_id: String,

    /// Defaults applied to topics whose publish carries no topic config.
    pub topic: TopicConfig,

    /// Capacity of each session callback queue.
    pub callback_queue_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            node_id: "relaymq".to_string(),
            topic: TopicConfig::default(),
            callback_queue_capacity: 1000,
        }
    }
}
