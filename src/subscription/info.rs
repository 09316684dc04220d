//! One client subscription.

use crate::types::{
    KeyQuery, QueryKind, SessionName, SubscribeQos, SubscriptionId, Timestamp, TopicId,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// One client's interest in a topic or query.
///
/// Query subscriptions act as parents: each topic a query matches gets a
/// lazily created child subscription attached to that topic. Links between
/// parent and children are by id, never by pointer, so cleanup is an index
/// removal rather than a graph traversal.
pub struct SubscriptionInfo {
    id: SubscriptionId,
    session: SessionName,
    query: KeyQuery,
    qos: Mutex<SubscribeQos>,
    parent: Option<SubscriptionId>,
    children: Mutex<Vec<SubscriptionId>>,
    /// Topic this subscription is attached to; None for query parents and
    /// for exact subscriptions whose topic does not exist yet.
    topic: Mutex<Option<TopicId>>,
    /// Counts repeated identical subscribes when multiSubscribe=false.
    subscribe_counter: AtomicU32,
    shutdown: AtomicBool,
    created: Timestamp,
}

impl SubscriptionInfo {
    /// Create a top-level subscription.
    pub fn new(session: SessionName, query: KeyQuery, qos: SubscribeQos) -> Self {
        let id = qos
            .subscription_id
            .clone()
            .unwrap_or_else(|| SubscriptionId::generate(&session, query.kind()));
        Self {
            id,
            session,
            query,
            qos: Mutex::new(qos),
            parent: None,
            children: Mutex::new(Vec::new()),
            topic: Mutex::new(None),
            subscribe_counter: AtomicU32::new(1),
            shutdown: AtomicBool::new(false),
            created: Timestamp::now(),
        }
    }

    /// Create a child spawned by a query parent for one matched topic.
    pub fn new_child(parent: &SubscriptionInfo, topic: TopicId) -> Self {
        let id = SubscriptionId::generate_child(&parent.id);
        Self {
            id,
            session: parent.session.clone(),
            query: KeyQuery::Exact(topic),
            qos: Mutex::new(parent.qos.lock().clone()),
            parent: Some(parent.id.clone()),
            children: Mutex::new(Vec::new()),
            topic: Mutex::new(None),
            subscribe_counter: AtomicU32::new(1),
            shutdown: AtomicBool::new(false),
            created: Timestamp::now(),
        }
    }

    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    pub fn session(&self) -> &SessionName {
        &self.session
    }

    pub fn query(&self) -> &KeyQuery {
        &self.query
    }

    pub fn created(&self) -> Timestamp {
        self.created
    }

    pub fn parent(&self) -> Option<&SubscriptionId> {
        self.parent.as_ref()
    }

    /// A query or domain subscription that spawns children per matched topic.
    pub fn is_query(&self) -> bool {
        self.query.kind() != QueryKind::Exact
    }

    pub fn is_exact(&self) -> bool {
        self.query.kind() == QueryKind::Exact
    }

    pub fn is_child(&self) -> bool {
        self.parent.is_some()
    }

    /// Snapshot of the subscribe QoS.
    pub fn qos(&self) -> SubscribeQos {
        self.qos.lock().clone()
    }

    /// Replace the QoS in place (duplicate subscribe with
    /// multiSubscribe=false).
    pub fn update_qos(&self, qos: SubscribeQos) {
        *self.qos.lock() = qos;
    }

    // --- Subscribe counter ---

    pub fn incr_subscribe_counter(&self) -> u32 {
        self.subscribe_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrement; returns the remaining count. Zero means the subscription
    /// must really be detached now.
    pub fn decr_subscribe_counter(&self) -> u32 {
        let prev = self.subscribe_counter.fetch_sub(1, Ordering::SeqCst);
        prev.saturating_sub(1)
    }

    pub fn subscribe_counter(&self) -> u32 {
        self.subscribe_counter.load(Ordering::SeqCst)
    }

    // --- Topic attachment ---

    pub fn attach_topic(&self, topic: TopicId) {
        *self.topic.lock() = Some(topic);
    }

    pub fn topic(&self) -> Option<TopicId> {
        self.topic.lock().clone()
    }

    // --- Children ---

    pub fn add_child(&self, child: SubscriptionId) {
        self.children.lock().push(child);
    }

    pub fn remove_child(&self, child: &SubscriptionId) {
        self.children.lock().retain(|id| id != child);
    }

    pub fn children(&self) -> Vec<SubscriptionId> {
        self.children.lock().clone()
    }

    // --- Shutdown ---

    /// Detach this subscription. It may stay reachable through indexes for
    /// a short while but delivers nothing anymore.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for SubscriptionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionInfo")
            .field("id", &self.id)
            .field("session", &self.session)
            .field("query", &self.query)
            .field("parent", &self.parent)
            .field("counter", &self.subscribe_counter())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
