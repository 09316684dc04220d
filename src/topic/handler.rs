//! The topic handler: one topic's store, history, subscribers and state
//! machine.
//!
//! Everything mutable sits behind one per-topic lock so a transition is
//! observed atomically by concurrent publishers, subscribers and
//! unsubscribers. The handler never calls out to callback queues, timers or
//! listeners while holding that lock; instead mutating operations return
//! `TopicAction`s for the orchestrator to perform afterwards.

use crate::config::TopicConfig;
use crate::error::{BrokerError, Result};
use crate::history::{EntryQueue, MemQueue, QueueEntry};
use crate::store::{MemStore, MsgEntry, MsgStore, ReleaseOutcome};
use crate::subscription::SubscriptionInfo;
use crate::timer::TimerToken;
use crate::topic::TopicState;
use crate::types::{EntryId, MsgUnit, SessionName, SubscriptionId, TopicId, TopicKey};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Deferred side effect of a topic mutation, executed by the orchestrator
/// after the topic lock is released.
#[derive(Debug)]
pub(crate) enum TopicAction {
    ArmDestroyTimer { delay: Duration },
    CancelDestroyTimer(TimerToken),
    /// The state changed; listeners are notified outside the lock.
    StateChanged { from: TopicState, to: TopicState },
    /// The topic reached DEAD; deregister it everywhere.
    Destroyed,
}

/// Result of preparing a publish, before fan-out.
#[derive(Debug)]
pub struct PublishPrep {
    /// The store entry created; the publish call holds one reference until
    /// `finish_publish`.
    pub entry: Arc<MsgEntry>,

    /// True when this publish configured the topic, so pending query
    /// subscriptions must be matched against it before fan-out.
    pub first_time_alive: bool,

    pub(crate) actions: Vec<TopicAction>,
}

/// Result of an erase request.
pub struct EraseOutcome {
    /// Subscribers that were detached; each gets an erase notification.
    pub detached: Vec<Arc<SubscriptionInfo>>,

    /// State after the erase (SOFT_ERASED or DEAD).
    pub state: TopicState,

    pub(crate) actions: Vec<TopicAction>,
}

struct TopicInner {
    state: TopicState,
    /// None while UNCONFIGURED.
    key: Option<TopicKey>,
    config: TopicConfig,
    creator: Option<SessionName>,
    /// Created when the topic is configured by its first publish.
    store: Option<Box<dyn MsgStore>>,
    /// Absent when the configured history capacity is zero.
    history: Option<Box<dyn EntryQueue>>,
    /// Newest entry sitting in the history queue, for onlyUpdateOnChange.
    newest_in_history: Option<Arc<MsgEntry>>,
    subscribers: BTreeMap<SubscriptionId, Arc<SubscriptionInfo>>,
    /// Entries between store allocation and fan-out completion. Keeps a
    /// half-constructed message from being destroyed by a concurrent
    /// eviction of its own queue references.
    under_construction: HashMap<EntryId, Arc<MsgEntry>>,
    timer_token: Option<TimerToken>,
    next_entry_id: u64,
    /// Bounds lifecycle re-entry from entry-destruction paths to one level.
    in_transition: bool,
    pending_check: bool,
}

/// One topic. Shared by reference between the orchestrator's topic table
/// and in-flight operations.
pub struct TopicHandler {
    id: TopicId,
    inner: Mutex<TopicInner>,
}

impl TopicHandler {
    /// Create an UNCONFIGURED handler, from a subscribe reservation or a
    /// publish about to configure it.
    pub fn new(id: TopicId, defaults: TopicConfig) -> Self {
        Self {
            id,
            inner: Mutex::new(TopicInner {
                state: TopicState::Unconfigured,
                key: None,
                config: defaults,
                creator: None,
                store: None,
                history: None,
                newest_in_history: None,
                subscribers: BTreeMap::new(),
                under_construction: HashMap::new(),
                timer_token: None,
                next_entry_id: 1,
                in_transition: false,
                pending_check: false,
            }),
        }
    }

    pub fn id(&self) -> &TopicId {
        &self.id
    }

    pub fn state(&self) -> TopicState {
        self.inner.lock().state
    }

    pub fn key(&self) -> Option<TopicKey> {
        self.inner.lock().key.clone()
    }

    pub fn config(&self) -> TopicConfig {
        self.inner.lock().config.clone()
    }

    pub fn creator(&self) -> Option<SessionName> {
        self.inner.lock().creator.clone()
    }

    pub fn num_subscribers(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    pub fn has_subscriber(&self, id: &SubscriptionId) -> bool {
        self.inner.lock().subscribers.contains_key(id)
    }

    pub fn num_store_entries(&self) -> usize {
        let inner = self.inner.lock();
        inner.store.as_ref().map(|s| s.num_entries()).unwrap_or(0)
    }

    pub fn num_history_entries(&self) -> usize {
        let inner = self.inner.lock();
        inner.history.as_ref().map(|h| h.num_entries()).unwrap_or(0)
    }

    /// History entries, oldest first.
    pub fn history_snapshot(&self) -> Vec<Arc<MsgEntry>> {
        let inner = self.inner.lock();
        match &inner.history {
            Some(history) => history
                .peek(history.num_entries())
                .into_iter()
                .map(|qe| qe.entry)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Stable snapshot of the current subscriber set for fan-out.
    pub fn subscriber_snapshot(&self) -> Vec<Arc<SubscriptionInfo>> {
        self.inner.lock().subscribers.values().cloned().collect()
    }

    // --- Publish ---

    /// Configure the topic if needed, allocate the store entry and update
    /// the history queue. Fan-out happens afterwards, outside the topic
    /// lock; the caller must invoke `finish_publish` once it completes.
    pub(crate) fn prepare_publish(
        &self,
        sender: &SessionName,
        msg: Arc<MsgUnit>,
        defaults: &TopicConfig,
    ) -> Result<PublishPrep> {
        let mut inner = self.inner.lock();
        let mut actions = Vec::new();

        match inner.state {
            TopicState::Dead => {
                return Err(BrokerError::Internal(format!(
                    "publish on dead topic '{}'",
                    self.id
                )))
            }
            TopicState::SoftErased => return Err(BrokerError::TopicErased(self.id.clone())),
            _ => {}
        }

        // Readonly topics accept exactly one message.
        if inner.config.readonly
            && inner
                .history
                .as_ref()
                .map(|h| h.num_entries() > 0)
                .unwrap_or(false)
        {
            return Err(BrokerError::ReadonlyTopic(self.id.clone()));
        }

        let mut first_time_alive = false;
        match inner.state {
            TopicState::Unconfigured => {
                let config = msg.qos.topic_config.clone().unwrap_or_else(|| defaults.clone());
                debug!(topic = %self.id, "configuring topic on first publish");
                inner.key = Some(msg.key.clone());
                inner.creator = Some(sender.clone());
                inner.store = Some(Box::new(MemStore::new(
                    self.id.clone(),
                    config.store_max_entries,
                )));
                if config.history_max_entries > 0 {
                    inner.history =
                        Some(Box::new(MemQueue::new(config.history_max_entries)));
                }
                inner.config = config;
                inner.state = TopicState::Alive;
                actions.push(TopicAction::StateChanged {
                    from: TopicState::Unconfigured,
                    to: TopicState::Alive,
                });
                first_time_alive = true;
            }
            TopicState::Unreferenced => {
                Self::to_alive(&mut inner, &mut actions);
                debug!(topic = %self.id, "topic revived by publish");
            }
            _ => {}
        }

        // An already-configured topic only accepts retuning of the runtime
        // knobs; identity and history shape are fixed at configure time.
        if !first_time_alive {
            if let Some(update) = &msg.qos.topic_config {
                inner.config.store_max_entries = update.store_max_entries;
                inner.config.destroy_delay_ms = update.destroy_delay_ms;
                if let Some(store) = &inner.store {
                    store.set_properties(&inner.config);
                }
            }
        }

        let entry_id = EntryId(inner.next_entry_id);
        inner.next_entry_id += 1;
        let entry = Arc::new(MsgEntry::new(
            entry_id,
            self.id.clone(),
            sender.clone(),
            msg.clone(),
        ));

        let store = inner
            .store
            .as_ref()
            .ok_or_else(|| BrokerError::Internal(format!("topic '{}' has no store", self.id)))?;
        store.put(entry.clone())?;
        inner.under_construction.insert(entry_id, entry.clone());

        // History: skipped for invisible PtP and volatile messages.
        if inner.history.is_some() && msg.qos.is_subscribable() && !msg.qos.volatile {
            let same_as_last = msg.qos.only_update_on_change
                && !msg.qos.force_update
                && inner
                    .newest_in_history
                    .as_ref()
                    .map(|newest| newest.msg().content == msg.content)
                    .unwrap_or(false);
            if same_as_last {
                debug!(topic = %self.id, "content unchanged, history insert skipped");
            } else {
                Self::append_history(&mut inner, &entry);
            }
        }

        Ok(PublishPrep {
            entry,
            first_time_alive,
            actions,
        })
    }

    /// Append one entry to the history queue, evicting oldest entries until
    /// the configured bound holds.
    fn append_history(inner: &mut TopicInner, entry: &Arc<MsgEntry>) {
        let max = inner.config.history_max_entries;
        let evicted: Vec<QueueEntry> = match &inner.history {
            Some(history) => {
                let mut evicted = Vec::new();
                while history.num_entries() >= max {
                    evicted.extend(history.take_lowest(1));
                }
                evicted
            }
            None => return,
        };
        for old in evicted {
            Self::release_and_maybe_destroy(inner, &old.entry);
        }

        entry.retain();
        let put = match &inner.history {
            Some(history) => history.put(QueueEntry::history(entry.clone())),
            None => return,
        };
        if let Err(e) = put {
            error!(topic = %entry.topic(), error = %e, "history insert failed after eviction");
            entry.release();
            return;
        }
        inner.newest_in_history = Some(entry.clone());
    }

    /// Release the publish call's own reference and re-check the lifecycle.
    /// A volatile message with zero holders disappears here.
    pub(crate) fn finish_publish(&self, entry_id: EntryId) -> Vec<TopicAction> {
        let mut inner = self.inner.lock();
        let mut actions = Vec::new();
        if let Some(entry) = inner.under_construction.remove(&entry_id) {
            Self::release_and_maybe_destroy(&mut inner, &entry);
        } else {
            warn!(topic = %self.id, entry = %entry_id, "finish_publish for unknown entry");
        }
        Self::check_lifecycle(&mut inner, &self.id, &mut actions);
        actions
    }

    // --- Subscribers ---

    /// Attach a subscription. Returns the history entries owed to the new
    /// subscriber as an initial update (newest first bounded by the QoS),
    /// plus deferred actions.
    pub(crate) fn add_subscriber(
        &self,
        sub: Arc<SubscriptionInfo>,
    ) -> (Vec<Arc<MsgEntry>>, Vec<TopicAction>) {
        let mut inner = self.inner.lock();
        let mut actions = Vec::new();

        if inner.state.is_dead() {
            warn!(topic = %self.id, sub = %sub.id(), "subscriber attach on dead topic ignored");
            return (Vec::new(), actions);
        }
        if inner.state == TopicState::Unreferenced {
            Self::to_alive(&mut inner, &mut actions);
            debug!(topic = %self.id, "topic revived by subscriber");
        }

        sub.attach_topic(self.id.clone());
        let qos = sub.qos();
        inner.subscribers.insert(sub.id().clone(), sub.clone());

        let mut initial = Vec::new();
        if qos.want_initial_update {
            if let Some(history) = &inner.history {
                let n = history.num_entries();
                let take = n.min(qos.history_num_updates as usize);
                initial = history
                    .peek(n)
                    .into_iter()
                    .skip(n - take)
                    .map(|qe| qe.entry)
                    .filter(|entry| !entry.is_expired())
                    .collect();
            }
        }
        (initial, actions)
    }

    /// Detach a subscription and re-check the lifecycle.
    pub(crate) fn remove_subscriber(&self, id: &SubscriptionId) -> Vec<TopicAction> {
        let mut inner = self.inner.lock();
        let mut actions = Vec::new();
        if let Some(sub) = inner.subscribers.remove(id) {
            sub.shutdown();
            debug!(topic = %self.id, sub = %id, "subscriber detached");
        }
        Self::check_lifecycle(&mut inner, &self.id, &mut actions);
        actions
    }

    // --- Erase ---

    /// Clear only the history queue.
    pub(crate) fn erase_history(&self) -> usize {
        let mut inner = self.inner.lock();
        Self::clear_history(&mut inner)
    }

    /// Drive the erase transition: clear history, detach all subscribers,
    /// then DEAD if nothing references the store anymore (or `force`),
    /// SOFT_ERASED otherwise.
    pub(crate) fn erase(&self, force: bool) -> EraseOutcome {
        let mut inner = self.inner.lock();
        let mut actions = Vec::new();

        if inner.state.is_dead() {
            return EraseOutcome {
                detached: Vec::new(),
                state: TopicState::Dead,
                actions,
            };
        }

        Self::clear_history(&mut inner);

        let detached: Vec<_> = inner.subscribers.values().cloned().collect();
        for sub in &detached {
            sub.shutdown();
        }
        inner.subscribers.clear();

        let referenced = inner
            .store
            .as_ref()
            .map(|s| s.num_entries())
            .unwrap_or(0)
            + inner.under_construction.len();

        if force || referenced == 0 {
            Self::to_dead(&mut inner, &self.id, &mut actions);
        } else {
            debug!(
                topic = %self.id,
                referenced,
                "erase deferred, store entries still referenced"
            );
            let from = inner.state;
            inner.state = TopicState::SoftErased;
            actions.push(TopicAction::StateChanged {
                from,
                to: TopicState::SoftErased,
            });
        }

        EraseOutcome {
            detached,
            state: inner.state,
            actions,
        }
    }

    // --- Reference management ---

    /// Release one holder of a store entry, typically a callback-queue
    /// worker that delivered (or dropped) it. Drives SOFT_ERASED to DEAD
    /// when the last reference goes.
    pub(crate) fn release_entry(&self, entry: &Arc<MsgEntry>) -> Vec<TopicAction> {
        let mut inner = self.inner.lock();
        let mut actions = Vec::new();
        Self::release_and_maybe_destroy(&mut inner, entry);
        Self::check_lifecycle(&mut inner, &self.id, &mut actions);
        actions
    }

    fn release_and_maybe_destroy(inner: &mut TopicInner, entry: &Arc<MsgEntry>) -> bool {
        match entry.release() {
            ReleaseOutcome::BecameUnreferenced => {
                if inner.under_construction.contains_key(&entry.id()) {
                    // Destroyed by finish_publish once construction ends.
                    return false;
                }
                if let Some(store) = &inner.store {
                    store.remove(entry.id());
                }
                true
            }
            _ => false,
        }
    }

    fn clear_history(inner: &mut TopicInner) -> usize {
        let drained = match &inner.history {
            Some(history) => history.clear(),
            None => return 0,
        };
        inner.newest_in_history = None;
        let n = drained.len();
        for qe in drained {
            Self::release_and_maybe_destroy(inner, &qe.entry);
        }
        n
    }

    // --- Timer ---

    /// Store the token of the armed destroy timer. Returns it back when the
    /// topic already left UNREFERENCED, in which case the caller cancels.
    pub(crate) fn set_timer_token(&self, token: TimerToken) -> Option<TimerToken> {
        let mut inner = self.inner.lock();
        if inner.state == TopicState::Unreferenced {
            inner.timer_token = Some(token);
            None
        } else {
            Some(token)
        }
    }

    /// The destroy-delay elapsed.
    pub(crate) fn on_destroy_timeout(&self) -> Vec<TopicAction> {
        let mut inner = self.inner.lock();
        let mut actions = Vec::new();
        inner.timer_token = None;
        if inner.state == TopicState::Unreferenced {
            debug!(topic = %self.id, "destroy delay elapsed");
            Self::to_dead(&mut inner, &self.id, &mut actions);
        }
        actions
    }

    // --- State machine internals (lock held) ---

    fn to_alive(inner: &mut TopicInner, actions: &mut Vec<TopicAction>) {
        if let Some(token) = inner.timer_token.take() {
            actions.push(TopicAction::CancelDestroyTimer(token));
        }
        let from = inner.state;
        inner.state = TopicState::Alive;
        if from != TopicState::Alive {
            actions.push(TopicAction::StateChanged {
                from,
                to: TopicState::Alive,
            });
        }
    }

    fn to_dead(inner: &mut TopicInner, id: &TopicId, actions: &mut Vec<TopicAction>) {
        if inner.state.is_dead() {
            return;
        }
        if let Some(token) = inner.timer_token.take() {
            actions.push(TopicAction::CancelDestroyTimer(token));
        }
        Self::clear_history(inner);
        if let Some(store) = &inner.store {
            store.clear();
        }
        if !inner.subscribers.is_empty() {
            error!(
                topic = %id,
                count = inner.subscribers.len(),
                "topic died with attached subscribers"
            );
            for sub in inner.subscribers.values() {
                sub.shutdown();
            }
            inner.subscribers.clear();
        }
        debug!(topic = %id, from = %inner.state, "topic destroyed");
        let from = inner.state;
        inner.state = TopicState::Dead;
        actions.push(TopicAction::StateChanged {
            from,
            to: TopicState::Dead,
        });
        actions.push(TopicAction::Destroyed);
    }

    /// Re-evaluate the "has content / has subscribers" condition and drive
    /// the resulting transition. Re-entry from an entry-destruction path is
    /// folded into the running evaluation instead of recursing.
    fn check_lifecycle(inner: &mut TopicInner, id: &TopicId, actions: &mut Vec<TopicAction>) {
        if inner.in_transition {
            inner.pending_check = true;
            return;
        }
        inner.in_transition = true;
        loop {
            match inner.state {
                TopicState::Alive => {
                    let no_content = inner
                        .store
                        .as_ref()
                        .map(|s| s.num_entries() == 0)
                        .unwrap_or(true)
                        && inner.under_construction.is_empty();
                    if no_content && inner.subscribers.is_empty() {
                        let delay = inner.config.destroy_delay_ms;
                        if delay == 0 {
                            Self::to_dead(inner, id, actions);
                        } else {
                            inner.state = TopicState::Unreferenced;
                            debug!(topic = %id, delay_ms = delay, "topic unreferenced");
                            actions.push(TopicAction::StateChanged {
                                from: TopicState::Alive,
                                to: TopicState::Unreferenced,
                            });
                            if delay > 0 {
                                actions.push(TopicAction::ArmDestroyTimer {
                                    delay: Duration::from_millis(delay as u64),
                                });
                            }
                        }
                    }
                }
                TopicState::SoftErased => {
                    let empty = inner
                        .store
                        .as_ref()
                        .map(|s| s.num_entries() == 0)
                        .unwrap_or(true)
                        && inner.under_construction.is_empty();
                    if empty {
                        Self::to_dead(inner, id, actions);
                    }
                }
                TopicState::Unconfigured => {
                    if inner.subscribers.is_empty() {
                        Self::to_dead(inner, id, actions);
                    }
                }
                TopicState::Unreferenced | TopicState::Dead => {}
            }
            if inner.pending_check {
                inner.pending_check = false;
                continue;
            }
            break;
        }
        inner.in_transition = false;
    }
}

impl std::fmt::Debug for TopicHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TopicHandler")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("subscribers", &inner.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{KeyQuery, PublishQos, SubscribeQos};

    fn msg(oid: &str, content: &[u8]) -> Arc<MsgUnit> {
        Arc::new(MsgUnit::new(TopicKey::new(oid), content.to_vec()))
    }

    fn sender() -> SessionName {
        SessionName::from("client/joe/1")
    }

    fn publish(handler: &TopicHandler, m: Arc<MsgUnit>) -> Result<PublishPrep> {
        let prep = handler.prepare_publish(&sender(), m, &TopicConfig::default())?;
        Ok(prep)
    }

    fn publish_and_finish(handler: &TopicHandler, m: Arc<MsgUnit>) -> Arc<MsgEntry> {
        let prep = publish(handler, m).unwrap();
        let entry = prep.entry.clone();
        handler.finish_publish(entry.id());
        entry
    }

    fn make_sub(topic: &str) -> Arc<SubscriptionInfo> {
        Arc::new(SubscriptionInfo::new(
            sender(),
            KeyQuery::exact(topic),
            SubscribeQos::default(),
        ))
    }

    #[test]
    fn test_first_publish_configures_topic() {
        let handler = TopicHandler::new(TopicId::from("T"), TopicConfig::default());
        assert_eq!(handler.state(), TopicState::Unconfigured);

        let prep = publish(&handler, msg("T", b"a")).unwrap();
        assert!(prep.first_time_alive);
        assert_eq!(handler.state(), TopicState::Alive);
        assert_eq!(handler.num_store_entries(), 1);
        assert_eq!(handler.num_history_entries(), 1);

        handler.finish_publish(prep.entry.id());
        // History still references the entry.
        assert_eq!(handler.num_store_entries(), 1);
        assert_eq!(prep.entry.ref_count(), 1);
    }

    #[test]
    fn test_history_bound_evicts_oldest() {
        let config = TopicConfig {
            history_max_entries: 2,
            ..Default::default()
        };
        let handler = TopicHandler::new(TopicId::from("T"), config.clone());

        let mut unit = MsgUnit::new(TopicKey::new("T"), b"1".to_vec());
        unit.qos.topic_config = Some(config);
        let first = publish_and_finish(&handler, Arc::new(unit));
        let _second = publish_and_finish(&handler, msg("T", b"2"));
        let third = publish_and_finish(&handler, msg("T", b"3"));

        assert_eq!(handler.num_history_entries(), 2);
        // The oldest lost its last reference and left the store.
        assert!(first.is_destroyed());
        assert_eq!(handler.num_store_entries(), 2);

        let snapshot = handler.history_snapshot();
        assert_eq!(snapshot.last().unwrap().id(), third.id());
    }

    #[test]
    fn test_volatile_message_without_holders_disappears() {
        let handler = TopicHandler::new(TopicId::from("T"), TopicConfig::default());
        let mut unit = MsgUnit::new(TopicKey::new("T"), b"x".to_vec());
        unit.qos.volatile = true;
        let prep = publish(&handler, Arc::new(unit)).unwrap();

        assert_eq!(handler.num_store_entries(), 1);
        assert_eq!(handler.num_history_entries(), 0);

        handler.finish_publish(prep.entry.id());
        assert!(prep.entry.is_destroyed());
        assert_eq!(handler.num_store_entries(), 0);
    }

    #[test]
    fn test_readonly_rejects_second_publish() {
        let config = TopicConfig {
            readonly: true,
            ..Default::default()
        };
        let handler = TopicHandler::new(TopicId::from("T"), TopicConfig::default());
        let mut unit = MsgUnit::new(TopicKey::new("T"), b"1".to_vec());
        unit.qos.topic_config = Some(config);
        publish_and_finish(&handler, Arc::new(unit));

        let err = publish(&handler, msg("T", b"2")).unwrap_err();
        assert!(matches!(err, BrokerError::ReadonlyTopic(_)));
    }

    #[test]
    fn test_only_update_on_change_skips_identical_content() {
        let handler = TopicHandler::new(TopicId::from("T"), TopicConfig::default());
        publish_and_finish(&handler, msg("T", b"same"));

        let mut unit = MsgUnit::new(TopicKey::new("T"), b"same".to_vec());
        unit.qos.only_update_on_change = true;
        publish_and_finish(&handler, Arc::new(unit));
        assert_eq!(handler.num_history_entries(), 1);

        let mut unit = MsgUnit::new(TopicKey::new("T"), b"same".to_vec());
        unit.qos.only_update_on_change = true;
        unit.qos.force_update = true;
        publish_and_finish(&handler, Arc::new(unit));
        assert_eq!(handler.num_history_entries(), 2);
    }

    #[test]
    fn test_later_publish_retunes_store_capacity() {
        let handler = TopicHandler::new(TopicId::from("T"), TopicConfig::default());
        publish_and_finish(&handler, msg("T", b"1"));
        publish_and_finish(&handler, msg("T", b"2"));
        assert_eq!(handler.num_store_entries(), 2);

        let mut unit = MsgUnit::new(TopicKey::new("T"), b"3".to_vec());
        unit.qos.topic_config = Some(TopicConfig {
            store_max_entries: 2,
            ..Default::default()
        });
        // The retune applies before the entry is allocated, so this publish
        // already sees the tighter bound.
        let err = publish(&handler, Arc::new(unit)).unwrap_err();
        assert!(matches!(err, BrokerError::StoreOverflow { capacity: 2, .. }));
        // History shape is untouched.
        assert_eq!(handler.config().history_max_entries, 10);
        assert_eq!(handler.config().store_max_entries, 2);
    }

    #[test]
    fn test_unreferenced_after_last_subscriber_leaves() {
        let config = TopicConfig {
            history_max_entries: 0,
            destroy_delay_ms: 60_000,
            ..Default::default()
        };
        let handler = TopicHandler::new(TopicId::from("T"), TopicConfig::default());
        let mut unit = MsgUnit::new(TopicKey::new("T"), b"1".to_vec());
        unit.qos.topic_config = Some(config);
        publish_and_finish(&handler, Arc::new(unit));
        // No history queue, nothing holds the entry: content already gone.
        assert_eq!(handler.num_store_entries(), 0);
        assert_eq!(handler.state(), TopicState::Unreferenced);

        let sub = make_sub("T");
        let (_, _) = handler.add_subscriber(sub.clone());
        assert_eq!(handler.state(), TopicState::Alive);

        let actions = handler.remove_subscriber(sub.id());
        assert_eq!(handler.state(), TopicState::Unreferenced);
        assert!(actions
            .iter()
            .any(|a| matches!(a, TopicAction::ArmDestroyTimer { .. })));
    }

    #[test]
    fn test_destroy_delay_zero_goes_straight_to_dead() {
        let config = TopicConfig {
            history_max_entries: 0,
            destroy_delay_ms: 0,
            ..Default::default()
        };
        let handler = TopicHandler::new(TopicId::from("T"), TopicConfig::default());
        let mut unit = MsgUnit::new(TopicKey::new("T"), b"1".to_vec());
        unit.qos.topic_config = Some(config);
        let prep = publish(&handler, Arc::new(unit)).unwrap();
        let actions = handler.finish_publish(prep.entry.id());

        assert_eq!(handler.state(), TopicState::Dead);
        assert!(actions.iter().any(|a| matches!(a, TopicAction::Destroyed)));
    }

    #[test]
    fn test_timeout_destroys_unreferenced_topic() {
        let config = TopicConfig {
            history_max_entries: 0,
            destroy_delay_ms: 10,
            ..Default::default()
        };
        let handler = TopicHandler::new(TopicId::from("T"), TopicConfig::default());
        let mut unit = MsgUnit::new(TopicKey::new("T"), b"1".to_vec());
        unit.qos.topic_config = Some(config);
        publish_and_finish(&handler, Arc::new(unit));
        assert_eq!(handler.state(), TopicState::Unreferenced);

        let actions = handler.on_destroy_timeout();
        assert_eq!(handler.state(), TopicState::Dead);
        assert!(actions.iter().any(|a| matches!(a, TopicAction::Destroyed)));

        // Idempotent once dead.
        assert!(handler.on_destroy_timeout().is_empty());
    }

    #[test]
    fn test_soft_erase_waits_for_last_reference() {
        let handler = TopicHandler::new(TopicId::from("T"), TopicConfig::default());
        let entry = publish_and_finish(&handler, msg("T", b"1"));

        // A callback queue still holds the message.
        entry.retain();

        let sub = make_sub("T");
        handler.add_subscriber(sub.clone());

        let outcome = handler.erase(false);
        assert_eq!(outcome.state, TopicState::SoftErased);
        assert_eq!(outcome.detached.len(), 1);
        assert!(sub.is_shutdown());
        assert_eq!(handler.num_history_entries(), 0);
        // Store still alive: the callback reference remains.
        assert_eq!(handler.num_store_entries(), 1);

        let actions = handler.release_entry(&entry);
        assert_eq!(handler.state(), TopicState::Dead);
        assert!(actions.iter().any(|a| matches!(a, TopicAction::Destroyed)));
    }

    #[test]
    fn test_forced_erase_is_immediate() {
        let handler = TopicHandler::new(TopicId::from("T"), TopicConfig::default());
        let entry = publish_and_finish(&handler, msg("T", b"1"));
        entry.retain();

        let outcome = handler.erase(true);
        assert_eq!(outcome.state, TopicState::Dead);
        assert!(outcome
            .actions
            .iter()
            .any(|a| matches!(a, TopicAction::Destroyed)));
    }

    #[test]
    fn test_publish_on_soft_erased_topic_is_rejected() {
        let handler = TopicHandler::new(TopicId::from("T"), TopicConfig::default());
        let entry = publish_and_finish(&handler, msg("T", b"1"));
        entry.retain();
        handler.erase(false);
        assert_eq!(handler.state(), TopicState::SoftErased);

        let err = publish(&handler, msg("T", b"2")).unwrap_err();
        assert!(matches!(err, BrokerError::TopicErased(_)));
    }

    #[test]
    fn test_initial_update_delivers_newest_history() {
        let config = TopicConfig {
            history_max_entries: 5,
            ..Default::default()
        };
        let handler = TopicHandler::new(TopicId::from("T"), TopicConfig::default());
        let mut unit = MsgUnit::new(TopicKey::new("T"), b"1".to_vec());
        unit.qos.topic_config = Some(config);
        publish_and_finish(&handler, Arc::new(unit));
        publish_and_finish(&handler, msg("T", b"2"));
        let third = publish_and_finish(&handler, msg("T", b"3"));

        let qos = SubscribeQos {
            history_num_updates: 1,
            ..Default::default()
        };
        let sub = Arc::new(SubscriptionInfo::new(sender(), KeyQuery::exact("T"), qos));
        let (initial, _) = handler.add_subscriber(sub);
        assert_eq!(initial.len(), 1);
        assert_eq!(initial[0].id(), third.id());
    }

    #[test]
    fn test_unconfigured_topic_dies_with_last_subscriber() {
        let handler = TopicHandler::new(TopicId::from("T"), TopicConfig::default());
        let sub = make_sub("T");
        handler.add_subscriber(sub.clone());
        assert_eq!(handler.state(), TopicState::Unconfigured);

        let actions = handler.remove_subscriber(sub.id());
        assert_eq!(handler.state(), TopicState::Dead);
        assert!(actions.iter().any(|a| matches!(a, TopicAction::Destroyed)));
    }
}
