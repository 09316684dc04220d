//! relaymq: an embeddable publish/subscribe message broker core.
//!
//! The crate implements the matching and delivery heart of a topic-based
//! broker:
//!
//! - topics with a five-state lifecycle (UNCONFIGURED, ALIVE, UNREFERENCED,
//!   SOFT_ERASED, DEAD), each owning a reference-counted message store and
//!   a bounded history queue;
//! - exact, domain and XPath-subset subscription matching, with query
//!   subscriptions spawning child subscriptions retroactively as matching
//!   topics appear;
//! - publish/subscribe fan-out and point-to-point delivery into per-session
//!   callback queues, with access filters, dead letters and erase
//!   notifications.
//!
//! Everything is synchronous and in-process; an embedding server supplies
//! transports and drains the callback queues.
//!
//! ```
//! use relaymq::{Broker, BrokerConfig, KeyQuery, MsgUnit, SubscribeQos, TopicKey};
//!
//! let broker = Broker::new(BrokerConfig::default());
//! let publisher = broker.connect("client/pub/1".into()).name().clone();
//! let reader = broker.connect("client/sub/1".into()).name().clone();
//!
//! broker.subscribe(&reader, KeyQuery::exact("news"), SubscribeQos::default()).unwrap();
//! broker.publish(&publisher, MsgUnit::new(TopicKey::new("news"), b"hello".to_vec())).unwrap();
//!
//! let delivered = broker.consume(&reader, 10);
//! assert_eq!(delivered[0].entry.msg().content, b"hello");
//! ```

pub mod broker;
pub mod config;
pub mod delivery;
pub mod error;
pub mod history;
pub mod query;
pub mod session;
pub mod store;
pub mod subscription;
pub mod timer;
pub mod topic;
pub mod types;

pub use broker::{
    Broker, BrokerStats, ListenerHandle, SubscriptionListener, TopicListener, DEAD_LETTER_TOPIC,
};
pub use config::{BrokerConfig, TopicConfig};
pub use delivery::AccessFilter;
pub use error::{BrokerError, Result};
pub use history::{EntryQueue, MemQueue, QueueEntry};
pub use query::{KeyQueryIndex, QueryIndex};
pub use session::{SessionDirectory, SessionInfo};
pub use store::{MemStore, MsgEntry, MsgStore, ReleaseOutcome};
pub use subscription::{ClientSubscriptions, SubscriptionInfo};
pub use topic::{TopicHandler, TopicState};
pub use types::{
    Destination, EntryId, EraseQos, FilterSpec, KeyQuery, MsgUnit, PublishAck, PublishQos,
    QueryKind, SessionName, SubscribeQos, SubscriptionId, Timestamp, TopicId, TopicKey,
    UnSubscribeQos, SUB_ID_PREFIX,
};
