//! Core types for the broker: identities, topic keys, messages and QoS.

use crate::config::TopicConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Unique identifier for a topic (the "oid" of its key).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicId(pub String);

impl TopicId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TopicId({})", self.0)
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TopicId {
    fn from(s: &str) -> Self {
        TopicId(s.to_string())
    }
}

/// Name of a client session, e.g. `client/joe/session/1`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionName(pub String);

impl SessionName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionName({})", self.0)
    }
}

impl fmt::Display for SessionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionName {
    fn from(s: &str) -> Self {
        SessionName(s.to_string())
    }
}

/// Unique identifier for a subscription.
///
/// Generated ids follow the `__subId:<session>-<kind><timestamp>` scheme;
/// a query-spawned child gets `<parentId>:<timestamp>`. Client-supplied ids
/// are accepted verbatim.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub String);

/// Prefix of every generated subscription id.
pub const SUB_ID_PREFIX: &str = "__subId:";

impl SubscriptionId {
    /// Generate an id for a top-level subscription.
    pub fn generate(session: &SessionName, kind: QueryKind) -> Self {
        SubscriptionId(format!(
            "{}{}-{}{}",
            SUB_ID_PREFIX,
            session.0,
            kind.tag(),
            Timestamp::unique().0
        ))
    }

    /// Generate an id for a child spawned by a query subscription.
    pub fn generate_child(parent: &SubscriptionId) -> Self {
        SubscriptionId(format!("{}:{}", parent.0, Timestamp::unique().0))
    }

    /// Whether this id was generated by the broker (as opposed to supplied
    /// by the client).
    pub fn is_generated(&self) -> bool {
        self.0.starts_with(SUB_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-local identifier for a message store entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub u64);

impl fmt::Debug for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryId({})", self.0)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards");
        Timestamp(duration.as_micros() as i64)
    }

    /// Current time, guaranteed strictly increasing across calls in this
    /// process. Used wherever a timestamp doubles as a unique id.
    pub fn unique() -> Self {
        static LAST: AtomicI64 = AtomicI64::new(0);
        let now = Self::now().0;
        let mut last = LAST.load(Ordering::Relaxed);
        loop {
            let next = if now > last { now } else { last + 1 };
            match LAST.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return Timestamp(next),
                Err(observed) => last = observed,
            }
        }
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// The key of a topic: its oid plus optional domain and free-form attributes
/// used by domain and query matching.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicKey {
    /// The topic id this key describes.
    pub oid: TopicId,

    /// Optional domain attribute, matched by domain subscriptions.
    pub domain: Option<String>,

    /// Free-form attributes, matched by XPath-style queries.
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl TopicKey {
    pub fn new(oid: impl Into<String>) -> Self {
        Self {
            oid: TopicId(oid.into()),
            domain: None,
            attributes: HashMap::new(),
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Look up an attribute, treating `domain` as an attribute too.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        if name == "domain" {
            return self.domain.as_deref();
        }
        self.attributes.get(name).map(|s| s.as_str())
    }
}

/// Which matching strategy a request key selects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryKind {
    Exact,
    Domain,
    XPath,
}

impl QueryKind {
    /// Tag used inside generated subscription ids.
    pub fn tag(self) -> &'static str {
        match self {
            QueryKind::Exact => "EXACT",
            QueryKind::Domain => "DOMAIN",
            QueryKind::XPath => "XPATH",
        }
    }
}

/// A request key: names one topic exactly, a domain, or a content query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyQuery {
    /// Matches exactly one topic id, whether or not it exists yet.
    Exact(TopicId),

    /// Matches every known topic whose key carries this domain.
    Domain(String),

    /// XPath-style structural query over topic keys.
    XPath(String),
}

impl KeyQuery {
    pub fn exact(oid: impl Into<String>) -> Self {
        KeyQuery::Exact(TopicId(oid.into()))
    }

    pub fn domain(domain: impl Into<String>) -> Self {
        KeyQuery::Domain(domain.into())
    }

    pub fn xpath(query: impl Into<String>) -> Self {
        KeyQuery::XPath(query.into())
    }

    pub fn kind(&self) -> QueryKind {
        match self {
            KeyQuery::Exact(_) => QueryKind::Exact,
            KeyQuery::Domain(_) => QueryKind::Domain,
            KeyQuery::XPath(_) => QueryKind::XPath,
        }
    }
}

/// A point-to-point destination.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub session: SessionName,

    /// Queue the message even if the destination is currently unknown;
    /// a deferred session is created to hold it.
    #[serde(default)]
    pub force_queuing: bool,
}

impl Destination {
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: SessionName(session.into()),
            force_queuing: false,
        }
    }

    pub fn force_queuing(mut self) -> Self {
        self.force_queuing = true;
        self
    }
}

/// Quality of service for a publish.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublishQos {
    /// Point-to-point destinations. Empty means pure publish/subscribe.
    #[serde(default)]
    pub destinations: Vec<Destination>,

    /// Whether subscribers may also see this message. Defaults to true for
    /// publish/subscribe, false for point-to-point.
    pub subscribable: Option<bool>,

    /// Volatile messages never outlive their delivery fan-out.
    #[serde(default)]
    pub volatile: bool,

    /// Message lifetime in milliseconds; None means no expiry.
    pub lifetime_ms: Option<i64>,

    /// Insert into history even if content equals the newest history entry.
    #[serde(default)]
    pub force_update: bool,

    /// Skip the history insert when content is byte-identical to the newest
    /// queued entry (unless `force_update`).
    #[serde(default)]
    pub only_update_on_change: bool,

    /// Topic configuration applied if this publish is the one that
    /// configures the topic. On an already-configured topic only the store
    /// capacity and destroy delay are retuned.
    pub topic_config: Option<TopicConfig>,

    /// Free-form metadata forwarded to subscribers.
    #[serde(default)]
    pub client_properties: HashMap<String, String>,

    /// Set on erase notifications so subscribers can suppress them.
    #[serde(default)]
    pub erase_notify: bool,

    /// Set on dead letters; guards against recursive dead-lettering.
    #[serde(default)]
    pub dead_letter: bool,
}

impl Default for PublishQos {
    fn default() -> Self {
        Self {
            destinations: Vec::new(),
            subscribable: None,
            volatile: false,
            lifetime_ms: None,
            force_update: false,
            only_update_on_change: false,
            topic_config: None,
            client_properties: HashMap::new(),
            erase_notify: false,
            dead_letter: false,
        }
    }
}

impl PublishQos {
    /// Whether this message is addressed point-to-point.
    pub fn is_ptp(&self) -> bool {
        !self.destinations.is_empty()
    }

    /// Effective subscribable flag (PtP messages default to invisible).
    pub fn is_subscribable(&self) -> bool {
        self.subscribable.unwrap_or(!self.is_ptp())
    }
}

/// A message unit: key, content and publish QoS.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MsgUnit {
    pub key: TopicKey,
    pub content: Vec<u8>,
    pub qos: PublishQos,
}

impl MsgUnit {
    pub fn new(key: TopicKey, content: impl Into<Vec<u8>>) -> Self {
        Self {
            key,
            content: content.into(),
            qos: PublishQos::default(),
        }
    }

    pub fn with_qos(mut self, qos: PublishQos) -> Self {
        self.qos = qos;
        self
    }
}

/// An access filter attached to a subscription.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    /// Name of the filter plugin to invoke.
    pub plugin: String,
    /// Filter query passed to the plugin per delivery.
    pub query: String,
}

/// Quality of service for a subscribe.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscribeQos {
    /// Deliver existing history entries to the new subscriber immediately.
    pub want_initial_update: bool,

    /// How many history entries an initial update may carry.
    pub history_num_updates: u64,

    /// Allow multiple subscriptions with the identical key from the same
    /// session. When false, a duplicate subscribe updates the existing
    /// subscription in place and returns its id.
    pub multi_subscribe: bool,

    /// Allow a query subscription to deliver a message the session already
    /// receives through another subscription on the same topic. When false,
    /// no child is spawned for a topic the session is already attached to.
    pub duplicate_updates: bool,

    /// Receive messages published by this same session (local echo).
    pub local: bool,

    /// Receive erase notifications when a subscribed topic is erased.
    pub want_notify: bool,

    /// Access filters applied per delivery.
    pub filters: Vec<FilterSpec>,

    /// Client-supplied subscription id; None means the broker generates one.
    pub subscription_id: Option<SubscriptionId>,
}

impl Default for SubscribeQos {
    fn default() -> Self {
        Self {
            want_initial_update: true,
            history_num_updates: 1,
            multi_subscribe: true,
            duplicate_updates: true,
            local: true,
            want_notify: true,
            filters: Vec::new(),
            subscription_id: None,
        }
    }
}

/// Quality of service for an unsubscribe. Currently carries no options but
/// keeps the call signature symmetric with the other verbs.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UnSubscribeQos {}

/// Quality of service for an erase.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EraseQos {
    /// Destroy the topic even if store entries are still referenced by
    /// undelivered callback-queue entries.
    #[serde(default)]
    pub force_destroy: bool,

    /// Clear only the history queue, leaving the topic alive.
    #[serde(default)]
    pub history_only: bool,
}

/// Acknowledgement returned by publish.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublishAck {
    pub topic: TopicId,
    /// The store entry created, if the message entered the store.
    pub entry: Option<EntryId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_timestamps_are_strictly_increasing() {
        let a = Timestamp::unique();
        let b = Timestamp::unique();
        let c = Timestamp::unique();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_generated_subscription_id_format() {
        let session = SessionName::from("client/joe/1");
        let id = SubscriptionId::generate(&session, QueryKind::XPath);
        assert!(id.is_generated());
        assert!(id.0.contains("client/joe/1"));
        assert!(id.0.contains("XPATH"));
    }

    #[test]
    fn test_child_id_extends_parent() {
        let session = SessionName::from("client/joe/1");
        let parent = SubscriptionId::generate(&session, QueryKind::XPath);
        let child = SubscriptionId::generate_child(&parent);
        assert!(child.0.starts_with(&parent.0));
        assert_ne!(child, parent);
    }

    #[test]
    fn test_topic_key_attributes() {
        let key = TopicKey::new("Game1")
            .with_domain("sports")
            .with_attribute("league", "nba");
        assert_eq!(key.attribute("domain"), Some("sports"));
        assert_eq!(key.attribute("league"), Some("nba"));
        assert_eq!(key.attribute("missing"), None);
    }

    #[test]
    fn test_ptp_defaults_not_subscribable() {
        let mut qos = PublishQos::default();
        assert!(qos.is_subscribable());

        qos.destinations.push(Destination::new("client/jack/1"));
        assert!(qos.is_ptp());
        assert!(!qos.is_subscribable());

        qos.subscribable = Some(true);
        assert!(qos.is_subscribable());
    }
}
