//! The broker orchestrator: owns the topic table and wires publishes,
//! subscriptions, erases and session lifecycle together.
//!
//! Lock order is strict: subscription registry, then session map, then one
//! topic, then one entry. Topic handlers return deferred `TopicAction`s so
//! no timer, listener or callback queue is ever touched while a topic lock
//! is held.

use crate::config::BrokerConfig;
use crate::delivery::{AccessFilter, DeliveryPipeline};
use crate::error::{BrokerError, Result};
use crate::history::{EntryQueue, QueueEntry};
use crate::query::{KeyQueryIndex, QueryIndex};
use crate::session::{SessionDirectory, SessionInfo};
use crate::store::MsgEntry;
use crate::subscription::{ClientSubscriptions, SubscriptionInfo};
use crate::timer::DestroyTimer;
use crate::topic::{TopicAction, TopicHandler, TopicState};
use crate::types::{
    EntryId, EraseQos, KeyQuery, MsgUnit, PublishAck, PublishQos, SessionName, SubscribeQos,
    SubscriptionId, TopicId, TopicKey, UnSubscribeQos,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Topic that receives undeliverable messages.
pub const DEAD_LETTER_TOPIC: &str = "__sys__deadMessage";

/// Observes subscription registration and removal.
pub trait SubscriptionListener: Send + Sync {
    fn subscription_added(&self, _sub: &Arc<SubscriptionInfo>) {}
    fn subscription_removed(&self, _sub: &Arc<SubscriptionInfo>) {}
}

/// Observes topic lifecycle endpoints and intermediate state changes.
pub trait TopicListener: Send + Sync {
    fn topic_alive(&self, _topic: &TopicId) {}
    fn topic_state_changed(&self, _topic: &TopicId, _from: TopicState, _to: TopicState) {}
    fn topic_destroyed(&self, _topic: &TopicId) {}
}

/// Handle returned by listener registration, used to unregister.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenerHandle {
    priority: i32,
    id: u64,
}

/// Monotonic operation counters.
#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    dead_letters: AtomicU64,
}

/// Snapshot of the broker counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub published: u64,
    pub delivered: u64,
    pub dead_letters: u64,
}

/// The broker core. Constructed as an `Arc` because destroy-timer callbacks
/// hold a weak reference back into it.
pub struct Broker {
    config: BrokerConfig,
    topics: RwLock<HashMap<TopicId, Arc<TopicHandler>>>,
    subscriptions: ClientSubscriptions,
    sessions: SessionDirectory,
    query_index: Arc<dyn QueryIndex>,
    pipeline: DeliveryPipeline,
    timer: DestroyTimer,
    /// Listener maps are keyed by (priority, registration id), so iteration
    /// yields lower priorities first and registration order breaks ties.
    sub_listeners: RwLock<BTreeMap<(i32, u64), Arc<dyn SubscriptionListener>>>,
    topic_listeners: RwLock<BTreeMap<(i32, u64), Arc<dyn TopicListener>>>,
    next_listener_id: AtomicU64,
    stats: Counters,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Arc<Self> {
        let callback_capacity = config.callback_queue_capacity;
        Arc::new(Self {
            topics: RwLock::new(HashMap::new()),
            subscriptions: ClientSubscriptions::new(),
            sessions: SessionDirectory::new(callback_capacity),
            query_index: Arc::new(KeyQueryIndex::new()),
            pipeline: DeliveryPipeline::new(),
            timer: DestroyTimer::new(),
            sub_listeners: RwLock::new(BTreeMap::new()),
            topic_listeners: RwLock::new(BTreeMap::new()),
            next_listener_id: AtomicU64::new(1),
            stats: Counters::default(),
            config,
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionDirectory {
        &self.sessions
    }

    pub fn subscriptions(&self) -> &ClientSubscriptions {
        &self.subscriptions
    }

    pub fn register_filter(&self, filter: Arc<dyn AccessFilter>) {
        self.pipeline.register_filter(filter);
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            published: self.stats.published.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            dead_letters: self.stats.dead_letters.load(Ordering::Relaxed),
        }
    }

    // --- Sessions ---

    /// Register a connected session, claiming any deferred placeholder
    /// created by a force-queued PtP message.
    pub fn connect(&self, name: SessionName) -> Arc<SessionInfo> {
        info!(session = %name, "session connected");
        self.sessions.connect(name)
    }

    /// Remove a session: all its subscriptions detach from their topics and
    /// its callback queue drains, releasing the entry references it held.
    pub fn disconnect(self: &Arc<Self>, name: &SessionName) {
        let subs = self.subscriptions.remove_session(name);
        for sub in subs {
            sub.shutdown();
            if let Some(topic_id) = sub.topic() {
                if let Some(handler) = self.topic(&topic_id) {
                    let actions = handler.remove_subscriber(sub.id());
                    self.process_actions(&handler, actions);
                }
            }
            self.notify_subscription_removed(&sub);
        }
        if let Some(session) = self.sessions.remove(name) {
            for qe in session.callback_queue().clear() {
                self.release_reference(&qe.entry);
            }
        }
        info!(session = %name, "session disconnected");
    }

    /// Drain up to `max` pending deliveries for a session, releasing the
    /// broker-side entry references. The returned `QueueEntry`s keep the
    /// message payloads alive for the caller.
    pub fn consume(self: &Arc<Self>, session: &SessionName, max: usize) -> Vec<QueueEntry> {
        let Some(session) = self.sessions.resolve(session) else {
            return Vec::new();
        };
        let taken = session.callback_queue().take_lowest(max);
        for qe in &taken {
            self.release_reference(&qe.entry);
        }
        taken
    }

    /// Release one callback-queue reference to a store entry. External
    /// dispatchers that drain queues themselves call this per entry.
    pub fn release_reference(self: &Arc<Self>, entry: &Arc<MsgEntry>) {
        match self.topic(entry.topic()) {
            Some(handler) => {
                let actions = handler.release_entry(entry);
                self.process_actions(&handler, actions);
            }
            // Topic already gone (or the entry never lived in a store, like
            // an erase notification): nothing to update beyond the count.
            None => {
                entry.release();
            }
        }
    }

    // --- Topics ---

    pub fn topic(&self, id: &TopicId) -> Option<Arc<TopicHandler>> {
        self.topics.read().get(id).cloned()
    }

    pub fn topic_state(&self, id: &TopicId) -> Option<TopicState> {
        self.topic(id).map(|handler| handler.state())
    }

    pub fn num_topics(&self) -> usize {
        self.topics.read().len()
    }

    /// Fetch the live handler for a topic id, replacing a dead leftover
    /// that lost the race between destruction and deregistration.
    fn get_or_create_topic(&self, oid: &TopicId) -> Arc<TopicHandler> {
        if let Some(handler) = self.topics.read().get(oid).cloned() {
            if !handler.state().is_dead() {
                return handler;
            }
        }
        let mut topics = self.topics.write();
        match topics.get(oid) {
            Some(handler) if !handler.state().is_dead() => handler.clone(),
            _ => {
                let handler = Arc::new(TopicHandler::new(oid.clone(), self.config.topic.clone()));
                topics.insert(oid.clone(), handler.clone());
                handler
            }
        }
    }

    // --- Subscribe ---

    /// Subscribe a session to a topic, domain or query. Returns the id of
    /// the (possibly pre-existing) subscription.
    pub fn subscribe(
        self: &Arc<Self>,
        session: &SessionName,
        query: KeyQuery,
        qos: SubscribeQos,
    ) -> Result<SubscriptionId> {
        if !self.sessions.has_callback(session) {
            return Err(BrokerError::NoCallback(session.clone()));
        }

        if !qos.multi_subscribe {
            if let Some(existing) = self.subscriptions.find_duplicate(session, &query) {
                existing.update_qos(qos);
                let count = existing.incr_subscribe_counter();
                debug!(
                    id = %existing.id(),
                    session = %session,
                    count,
                    "duplicate subscribe absorbed"
                );
                return Ok(existing.id().clone());
            }
        }

        // Matching also validates an XPath query, so a bad subscribe fails
        // before anything is registered.
        let matched: Vec<TopicId> = match &query {
            KeyQuery::Exact(_) => Vec::new(),
            KeyQuery::Domain(domain) => self.query_index.match_domain(domain),
            KeyQuery::XPath(expr) => self.query_index.match_query(expr)?,
        };

        let duplicate_updates = qos.duplicate_updates;
        let sub = Arc::new(SubscriptionInfo::new(session.clone(), query.clone(), qos));
        self.subscriptions.add(sub.clone());
        self.notify_subscription_added(&sub);

        match &query {
            KeyQuery::Exact(oid) => {
                // Reserves the topic in UNCONFIGURED state if it does not
                // exist yet.
                let handler = self.get_or_create_topic(oid);
                self.attach_subscription(&handler, &sub);
            }
            _ => {
                for oid in matched {
                    let Some(handler) = self.topic(&oid) else { continue };
                    if handler.state().is_dead() {
                        continue;
                    }
                    // With duplicate updates disabled, a subscription the
                    // session already holds on this topic keeps delivering
                    // alone.
                    if !duplicate_updates
                        && !self.subscriptions.find_by_topic(session, &oid).is_empty()
                    {
                        debug!(
                            topic = %oid,
                            parent = %sub.id(),
                            "duplicate updates disabled, reusing existing subscription"
                        );
                        continue;
                    }
                    let child = Arc::new(SubscriptionInfo::new_child(&sub, oid.clone()));
                    sub.add_child(child.id().clone());
                    self.subscriptions.add(child.clone());
                    self.notify_subscription_added(&child);
                    self.attach_subscription(&handler, &child);
                }
            }
        }
        Ok(sub.id().clone())
    }

    /// Attach one exact subscription to its topic and deliver the initial
    /// update it is owed.
    fn attach_subscription(
        self: &Arc<Self>,
        handler: &Arc<TopicHandler>,
        sub: &Arc<SubscriptionInfo>,
    ) {
        let (initial, actions) = handler.add_subscriber(sub.clone());
        self.process_actions(handler, actions);
        if initial.is_empty() {
            return;
        }
        let Some(session) = self.sessions.resolve(sub.session()) else {
            return;
        };
        for entry in initial {
            entry.retain();
            match session
                .callback_queue()
                .put(QueueEntry::delivery(entry.clone(), Some(sub.id().clone())))
            {
                Ok(()) => {
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    entry.release();
                    warn!(
                        sub = %sub.id(),
                        entry = %entry.id(),
                        error = %e,
                        "initial update dropped"
                    );
                }
            }
        }
    }

    // --- Unsubscribe ---

    /// Cancel subscriptions addressed by subscription id or by key. Returns
    /// the ids of the subscriptions actually removed.
    pub fn unsubscribe(
        self: &Arc<Self>,
        session: &SessionName,
        query: &KeyQuery,
        _qos: &UnSubscribeQos,
    ) -> Result<Vec<SubscriptionId>> {
        // An exact oid may actually be a subscription id.
        if let KeyQuery::Exact(oid) = query {
            let id = SubscriptionId(oid.as_str().to_string());
            if let Some(sub) = self.subscriptions.get(session, &id) {
                if sub.decr_subscribe_counter() > 0 {
                    debug!(id = %id, "unsubscribe decremented duplicate counter");
                    return Ok(vec![id]);
                }
                return Ok(self.detach_subscription(&sub));
            }
            if id.is_generated() {
                return Err(BrokerError::SubscriptionNotFound(id));
            }
        }

        let topics: Vec<TopicId> = match query {
            KeyQuery::Exact(oid) => vec![oid.clone()],
            KeyQuery::Domain(domain) => self.query_index.match_domain(domain),
            KeyQuery::XPath(expr) => self.query_index.match_query(expr)?,
        };

        let mut removed = Vec::new();
        for oid in &topics {
            for sub in self.subscriptions.find_by_topic(session, oid) {
                if sub.decr_subscribe_counter() > 0 {
                    removed.push(sub.id().clone());
                    continue;
                }
                removed.extend(self.detach_subscription(&sub));
            }
        }
        if removed.is_empty() {
            warn!(session = %session, ?query, "unsubscribe matched nothing");
        }
        Ok(removed)
    }

    /// Remove a subscription and its children from every index and topic.
    fn detach_subscription(self: &Arc<Self>, sub: &Arc<SubscriptionInfo>) -> Vec<SubscriptionId> {
        let mut removed = Vec::new();
        for child_id in sub.children() {
            if let Some(child) = self.subscriptions.get(sub.session(), &child_id) {
                removed.extend(self.detach_subscription(&child));
            }
        }
        sub.shutdown();
        if self.subscriptions.remove(sub.session(), sub.id()).is_some() {
            removed.push(sub.id().clone());
        }
        if let Some(parent_id) = sub.parent() {
            if let Some(parent) = self.subscriptions.get(sub.session(), parent_id) {
                parent.remove_child(sub.id());
            }
        }
        if let Some(topic_id) = sub.topic() {
            if let Some(handler) = self.topic(&topic_id) {
                let actions = handler.remove_subscriber(sub.id());
                self.process_actions(&handler, actions);
            }
        }
        self.notify_subscription_removed(sub);
        removed
    }

    // --- Publish ---

    /// Publish one message: configure or revive its topic, deliver PtP
    /// destinations, fan out to subscribers, then drop the publish call's
    /// own entry reference.
    pub fn publish(self: &Arc<Self>, sender: &SessionName, msg: MsgUnit) -> Result<PublishAck> {
        let oid = msg.key.oid.clone();
        let msg = Arc::new(msg);
        let mut handler = self.get_or_create_topic(&oid);

        // The destroy timer can kill the topic between the lookup and the
        // prepare; fetching again replaces the dead leftover.
        let mut retried = false;
        let prep = loop {
            match handler.prepare_publish(sender, msg.clone(), &self.config.topic) {
                Ok(prep) => break prep,
                Err(_) if !retried && handler.state().is_dead() => {
                    retried = true;
                    debug!(topic = %oid, "topic died mid-publish, retrying on a fresh handler");
                    handler = self.get_or_create_topic(&oid);
                }
                Err(e) => return Err(e),
            }
        };
        let crate::topic::PublishPrep {
            entry,
            first_time_alive,
            actions,
        } = prep;
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        // Index the key before listeners hear about the new topic.
        if first_time_alive {
            if let Some(key) = handler.key() {
                self.query_index.insert_key(&key);
            }
        }
        self.process_actions(&handler, actions);

        if first_time_alive {
            if let Some(key) = handler.key() {
                self.match_pending_queries(&handler, &key);
            }
        }

        if msg.qos.is_ptp() {
            match self
                .pipeline
                .deliver_ptp(&entry, &msg.qos.destinations, &self.sessions)
            {
                Ok(n) => {
                    self.stats.delivered.fetch_add(n as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    let actions = handler.finish_publish(entry.id());
                    self.process_actions(&handler, actions);
                    return Err(e);
                }
            }
        }

        if msg.qos.is_subscribable() {
            let subscribers = handler.subscriber_snapshot();
            let result = self.pipeline.fan_out(&entry, &subscribers, &self.sessions);
            self.stats
                .delivered
                .fetch_add(result.delivered as u64, Ordering::Relaxed);
            for failed in result.failed {
                warn!(
                    topic = %oid,
                    sub = %failed.sub.id(),
                    reason = %failed.reason,
                    "delivery failed, dead-lettering and detaching subscriber"
                );
                self.dead_letter(&entry, &failed.reason, Some(failed.sub.id()));
                self.detach_subscription(&failed.sub);
            }
        }

        let entry_id = entry.id();
        let actions = handler.finish_publish(entry_id);
        self.process_actions(&handler, actions);

        Ok(PublishAck {
            topic: oid,
            entry: Some(entry_id),
        })
    }

    /// Spawn children for query subscriptions that match a topic key seen
    /// for the first time. The children skip the initial update; the fan-out
    /// that follows delivers the triggering message.
    fn match_pending_queries(self: &Arc<Self>, handler: &Arc<TopicHandler>, key: &TopicKey) {
        for parent in self.subscriptions.query_snapshot() {
            if parent.is_shutdown() {
                continue;
            }
            let matched = match parent.query() {
                KeyQuery::Domain(domain) => key.domain.as_deref() == Some(domain.as_str()),
                KeyQuery::XPath(expr) => self.query_index.matches(expr, key).unwrap_or(false),
                KeyQuery::Exact(_) => false,
            };
            if !matched {
                continue;
            }
            let already_attached = parent.children().iter().any(|child_id| {
                self.subscriptions
                    .get(parent.session(), child_id)
                    .and_then(|child| child.topic())
                    .map(|topic| &topic == handler.id())
                    .unwrap_or(false)
            });
            if already_attached {
                continue;
            }
            if !parent.qos().duplicate_updates
                && !self
                    .subscriptions
                    .find_by_topic(parent.session(), handler.id())
                    .is_empty()
            {
                debug!(
                    topic = %handler.id(),
                    parent = %parent.id(),
                    "duplicate updates disabled, reusing existing subscription"
                );
                continue;
            }
            debug!(
                topic = %handler.id(),
                parent = %parent.id(),
                "query matched new topic, spawning child subscription"
            );
            let child = Arc::new(SubscriptionInfo::new_child(&parent, handler.id().clone()));
            parent.add_child(child.id().clone());
            self.subscriptions.add(child.clone());
            self.notify_subscription_added(&child);
            let (_, actions) = handler.add_subscriber(child);
            self.process_actions(handler, actions);
        }
    }

    /// Publish an undeliverable message to the dead-letter topic. A failing
    /// dead letter is dropped with an error log instead of recursing.
    fn dead_letter(self: &Arc<Self>, entry: &Arc<MsgEntry>, reason: &str, sub: Option<&SubscriptionId>) {
        let original = entry.msg();
        if original.qos.dead_letter {
            error!(
                entry = %entry.id(),
                topic = %entry.topic(),
                reason,
                "dead letter could not be delivered, dropping"
            );
            return;
        }
        self.stats.dead_letters.fetch_add(1, Ordering::Relaxed);

        let mut qos = PublishQos::default();
        qos.dead_letter = true;
        qos.client_properties
            .insert("__oid".to_string(), entry.topic().as_str().to_string());
        qos.client_properties
            .insert("__sender".to_string(), entry.sender().as_str().to_string());
        qos.client_properties
            .insert("__reason".to_string(), reason.to_string());
        if let Some(sub) = sub {
            qos.client_properties
                .insert("__subscriptionId".to_string(), sub.as_str().to_string());
        }
        let unit =
            MsgUnit::new(TopicKey::new(DEAD_LETTER_TOPIC), original.content.clone()).with_qos(qos);

        let sender = self.internal_sender();
        if let Err(e) = self.publish(&sender, unit) {
            error!(
                entry = %entry.id(),
                topic = %entry.topic(),
                error = %e,
                "dead letter publish failed"
            );
        }
    }

    // --- Erase ---

    /// Erase topics addressed by key. Detached subscribers get an erase
    /// notification through their callback queue. Returns the erased ids.
    pub fn erase(
        self: &Arc<Self>,
        sender: &SessionName,
        query: &KeyQuery,
        qos: &EraseQos,
    ) -> Result<Vec<TopicId>> {
        let targets: Vec<Arc<TopicHandler>> = match query {
            KeyQuery::Exact(oid) => {
                let handler = self
                    .topic(oid)
                    .ok_or_else(|| BrokerError::TopicNotFound(oid.clone()))?;
                vec![handler]
            }
            KeyQuery::Domain(domain) => {
                self.collect_handlers(&self.query_index.match_domain(domain))
            }
            KeyQuery::XPath(expr) => self.collect_handlers(&self.query_index.match_query(expr)?),
        };

        let mut erased = Vec::new();
        for handler in targets {
            if qos.history_only {
                let n = handler.erase_history();
                debug!(topic = %handler.id(), drained = n, sender = %sender, "history erased");
                erased.push(handler.id().clone());
                continue;
            }

            let key = handler.key();
            let outcome = handler.erase(qos.force_destroy);
            let crate::topic::EraseOutcome {
                detached,
                state,
                actions,
            } = outcome;
            debug!(topic = %handler.id(), %state, sender = %sender, "topic erased");
            self.process_actions(&handler, actions);

            for sub in &detached {
                self.subscriptions.remove(sub.session(), sub.id());
                if let Some(parent_id) = sub.parent() {
                    if let Some(parent) = self.subscriptions.get(sub.session(), parent_id) {
                        parent.remove_child(sub.id());
                    }
                }
                self.notify_subscription_removed(sub);
                self.send_erase_notification(sub, handler.id(), key.as_ref());
            }
            erased.push(handler.id().clone());
        }
        Ok(erased)
    }

    fn collect_handlers(&self, oids: &[TopicId]) -> Vec<Arc<TopicHandler>> {
        oids.iter().filter_map(|oid| self.topic(oid)).collect()
    }

    /// Enqueue a volatile erase notification for one detached subscriber.
    /// The entry never enters a store; the queue takes over its initial
    /// reference.
    fn send_erase_notification(
        &self,
        sub: &Arc<SubscriptionInfo>,
        topic: &TopicId,
        key: Option<&TopicKey>,
    ) {
        if !sub.qos().want_notify {
            return;
        }
        let Some(session) = self.sessions.resolve(sub.session()) else {
            return;
        };

        let mut qos = PublishQos::default();
        qos.volatile = true;
        qos.erase_notify = true;
        qos.client_properties
            .insert("__oid".to_string(), topic.as_str().to_string());
        qos.client_properties
            .insert("__subscriptionId".to_string(), sub.id().as_str().to_string());
        let key = key
            .cloned()
            .unwrap_or_else(|| TopicKey::new(topic.as_str()));
        let unit = MsgUnit::new(key, Vec::new()).with_qos(qos);
        let entry = Arc::new(MsgEntry::new(
            EntryId(0),
            topic.clone(),
            self.internal_sender(),
            Arc::new(unit),
        ));

        if let Err(e) = session
            .callback_queue()
            .put(QueueEntry::delivery(entry, Some(sub.id().clone())))
        {
            warn!(
                session = %sub.session(),
                topic = %topic,
                error = %e,
                "erase notification dropped"
            );
        }
    }

    // --- Deferred actions ---

    /// Execute the side effects a topic handler deferred until its lock was
    /// released.
    fn process_actions(self: &Arc<Self>, handler: &Arc<TopicHandler>, actions: Vec<TopicAction>) {
        for action in actions {
            match action {
                TopicAction::ArmDestroyTimer { delay } => {
                    let weak = Arc::downgrade(self);
                    let timed = handler.clone();
                    let token = self.timer.schedule(delay, move || {
                        if let Some(broker) = weak.upgrade() {
                            let actions = timed.on_destroy_timeout();
                            broker.process_actions(&timed, actions);
                        }
                    });
                    // The topic may have been revived between returning the
                    // action and arming the timer.
                    if let Some(token) = handler.set_timer_token(token) {
                        self.timer.cancel(token);
                    }
                }
                TopicAction::CancelDestroyTimer(token) => {
                    self.timer.cancel(token);
                }
                TopicAction::StateChanged { from, to } => {
                    let listeners: Vec<_> =
                        self.topic_listeners.read().values().cloned().collect();
                    for listener in listeners {
                        listener.topic_state_changed(handler.id(), from, to);
                    }
                    if from == TopicState::Unconfigured && to == TopicState::Alive {
                        self.notify_topic_alive(handler.id());
                    }
                }
                TopicAction::Destroyed => {
                    {
                        let mut topics = self.topics.write();
                        if let Some(current) = topics.get(handler.id()) {
                            if Arc::ptr_eq(current, handler) {
                                topics.remove(handler.id());
                            }
                        }
                    }
                    self.query_index.remove_key(handler.id());
                    self.notify_topic_destroyed(handler.id());
                }
            }
        }
    }

    // --- Listeners ---

    pub fn add_subscription_listener(
        &self,
        priority: i32,
        listener: Arc<dyn SubscriptionListener>,
    ) -> ListenerHandle {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.sub_listeners.write().insert((priority, id), listener);
        ListenerHandle { priority, id }
    }

    pub fn remove_subscription_listener(&self, handle: ListenerHandle) {
        self.sub_listeners
            .write()
            .remove(&(handle.priority, handle.id));
    }

    pub fn add_topic_listener(
        &self,
        priority: i32,
        listener: Arc<dyn TopicListener>,
    ) -> ListenerHandle {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.topic_listeners.write().insert((priority, id), listener);
        ListenerHandle { priority, id }
    }

    pub fn remove_topic_listener(&self, handle: ListenerHandle) {
        self.topic_listeners
            .write()
            .remove(&(handle.priority, handle.id));
    }

    fn notify_subscription_added(&self, sub: &Arc<SubscriptionInfo>) {
        let listeners: Vec<_> = self.sub_listeners.read().values().cloned().collect();
        for listener in listeners {
            listener.subscription_added(sub);
        }
    }

    fn notify_subscription_removed(&self, sub: &Arc<SubscriptionInfo>) {
        let listeners: Vec<_> = self.sub_listeners.read().values().cloned().collect();
        for listener in listeners {
            listener.subscription_removed(sub);
        }
    }

    fn notify_topic_alive(&self, topic: &TopicId) {
        let listeners: Vec<_> = self.topic_listeners.read().values().cloned().collect();
        for listener in listeners {
            listener.topic_alive(topic);
        }
    }

    fn notify_topic_destroyed(&self, topic: &TopicId) {
        let listeners: Vec<_> = self.topic_listeners.read().values().cloned().collect();
        for listener in listeners {
            listener.topic_destroyed(topic);
        }
    }

    fn internal_sender(&self) -> SessionName {
        SessionName(format!("{}/__broker", self.config.node_id))
    }
}
