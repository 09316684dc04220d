//! The subscription registry: cross-cutting indexes over all subscriptions.

use super::SubscriptionInfo;
use crate::types::{KeyQuery, SessionName, SubscriptionId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

type SessionIndex = Arc<Mutex<HashMap<SubscriptionId, Arc<SubscriptionInfo>>>>;

/// Two cross-indexes over all live subscriptions:
///
/// - per-session: subscription id to subscription, for logout cleanup;
/// - the query set: all query-type (non-exact) subscriptions, consulted when
///   a new topic appears to retroactively spawn matching children.
///
/// Lock order: the outer map lock is held only long enough to fetch a
/// per-session sub-index, which has its own lock for iteration and mutation.
pub struct ClientSubscriptions {
    by_session: RwLock<HashMap<SessionName, SessionIndex>>,
    query_subs: RwLock<Vec<Arc<SubscriptionInfo>>>,
}

impl ClientSubscriptions {
    pub fn new() -> Self {
        Self {
            by_session: RwLock::new(HashMap::new()),
            query_subs: RwLock::new(Vec::new()),
        }
    }

    /// Register a subscription in the per-session index, and in the query
    /// set if it is a query parent.
    pub fn add(&self, sub: Arc<SubscriptionInfo>) {
        let index = {
            let mut sessions = self.by_session.write();
            sessions
                .entry(sub.session().clone())
                .or_insert_with(|| Arc::new(Mutex::new(HashMap::new())))
                .clone()
        };
        index.lock().insert(sub.id().clone(), sub.clone());

        if sub.is_query() {
            self.query_subs.write().push(sub.clone());
        }
        debug!(id = %sub.id(), session = %sub.session(), "subscription registered");
    }

    /// Remove one subscription from both indexes. Returns it if present.
    pub fn remove(&self, session: &SessionName, id: &SubscriptionId) -> Option<Arc<SubscriptionInfo>> {
        let index = self.by_session.read().get(session).cloned()?;
        let removed = index.lock().remove(id);

        if let Some(sub) = &removed {
            if sub.is_query() {
                self.query_subs.write().retain(|q| q.id() != id);
            }
        }
        removed
    }

    /// Look up one subscription of a session.
    pub fn get(&self, session: &SessionName, id: &SubscriptionId) -> Option<Arc<SubscriptionInfo>> {
        let index = self.by_session.read().get(session).cloned()?;
        let sub = index.lock().get(id).cloned();
        sub
    }

    /// Find an existing non-shutdown subscription of this session with the
    /// identical key. Used to suppress duplicates when multiSubscribe=false.
    /// Child subscriptions are skipped; a duplicate subscribe matches the
    /// parent it would recreate, not a query-spawned child.
    pub fn find_duplicate(
        &self,
        session: &SessionName,
        query: &KeyQuery,
    ) -> Option<Arc<SubscriptionInfo>> {
        let index = self.by_session.read().get(session).cloned()?;
        let index = index.lock();
        index
            .values()
            .find(|sub| !sub.is_child() && !sub.is_shutdown() && sub.query() == query)
            .cloned()
    }

    /// Find the session's exact subscriptions attached to the given topic id.
    pub fn find_by_topic(
        &self,
        session: &SessionName,
        topic: &crate::types::TopicId,
    ) -> Vec<Arc<SubscriptionInfo>> {
        let Some(index) = self.by_session.read().get(session).cloned() else {
            return Vec::new();
        };
        let index = index.lock();
        index
            .values()
            .filter(|sub| {
                !sub.is_shutdown() && matches!(sub.query(), KeyQuery::Exact(oid) if oid == topic)
            })
            .cloned()
            .collect()
    }

    /// All subscriptions of one session.
    pub fn session_subscriptions(&self, session: &SessionName) -> Vec<Arc<SubscriptionInfo>> {
        let Some(index) = self.by_session.read().get(session).cloned() else {
            return Vec::new();
        };
        let subs = index.lock().values().cloned().collect();
        subs
    }

    /// Remove every subscription of a session from both indexes. Returns
    /// them for the caller to detach from their topics.
    pub fn remove_session(&self, session: &SessionName) -> Vec<Arc<SubscriptionInfo>> {
        let index = self.by_session.write().remove(session);
        let Some(index) = index else {
            return Vec::new();
        };
        let subs: Vec<_> = index.lock().drain().map(|(_, sub)| sub).collect();

        if subs.iter().any(|sub| sub.is_query()) {
            self.query_subs
                .write()
                .retain(|q| q.session() != session);
        }
        debug!(session = %session, count = subs.len(), "session subscriptions removed");
        subs
    }

    /// Stable snapshot of the query-subscription set.
    pub fn query_snapshot(&self) -> Vec<Arc<SubscriptionInfo>> {
        self.query_subs.read().clone()
    }

    /// Total number of subscriptions across all sessions.
    pub fn num_subscriptions(&self) -> usize {
        let indexes: Vec<SessionIndex> = self.by_session.read().values().cloned().collect();
        indexes.iter().map(|index| index.lock().len()).sum()
    }

    /// Number of subscriptions owned by one session.
    pub fn num_session_subscriptions(&self, session: &SessionName) -> usize {
        let Some(index) = self.by_session.read().get(session).cloned() else {
            return 0;
        };
        let n = index.lock().len();
        n
    }
}

impl Default for ClientSubscriptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SubscribeQos, TopicId};

    fn make_sub(session: &str, query: KeyQuery) -> Arc<SubscriptionInfo> {
        Arc::new(SubscriptionInfo::new(
            SessionName::from(session),
            query,
            SubscribeQos::default(),
        ))
    }

    #[test]
    fn test_add_and_get() {
        let registry = ClientSubscriptions::new();
        let sub = make_sub("client/joe/1", KeyQuery::exact("T"));
        registry.add(sub.clone());

        let session = SessionName::from("client/joe/1");
        assert!(registry.get(&session, sub.id()).is_some());
        assert_eq!(registry.num_subscriptions(), 1);
    }

    #[test]
    fn test_query_subscriptions_enter_query_set() {
        let registry = ClientSubscriptions::new();
        registry.add(make_sub("client/joe/1", KeyQuery::exact("T")));
        registry.add(make_sub("client/joe/1", KeyQuery::xpath("//*[@domain='d']")));
        registry.add(make_sub("client/jack/1", KeyQuery::domain("sports")));

        assert_eq!(registry.query_snapshot().len(), 2);
    }

    #[test]
    fn test_remove_clears_query_set() {
        let registry = ClientSubscriptions::new();
        let sub = make_sub("client/joe/1", KeyQuery::domain("sports"));
        registry.add(sub.clone());

        let session = SessionName::from("client/joe/1");
        assert!(registry.remove(&session, sub.id()).is_some());
        assert!(registry.query_snapshot().is_empty());
        assert_eq!(registry.num_subscriptions(), 0);
    }

    #[test]
    fn test_find_duplicate_matches_identical_key_only() {
        let registry = ClientSubscriptions::new();
        let sub = make_sub("client/joe/1", KeyQuery::exact("T"));
        registry.add(sub.clone());

        let session = SessionName::from("client/joe/1");
        assert!(registry.find_duplicate(&session, &KeyQuery::exact("T")).is_some());
        assert!(registry.find_duplicate(&session, &KeyQuery::exact("U")).is_none());
        assert!(registry
            .find_duplicate(&SessionName::from("client/jack/1"), &KeyQuery::exact("T"))
            .is_none());
    }

    #[test]
    fn test_remove_session_drains_both_indexes() {
        let registry = ClientSubscriptions::new();
        registry.add(make_sub("client/joe/1", KeyQuery::exact("T")));
        registry.add(make_sub("client/joe/1", KeyQuery::xpath("//*[@domain='d']")));
        registry.add(make_sub("client/jack/1", KeyQuery::exact("T")));

        let removed = registry.remove_session(&SessionName::from("client/joe/1"));
        assert_eq!(removed.len(), 2);
        assert_eq!(registry.num_subscriptions(), 1);
        assert!(registry.query_snapshot().is_empty());
        assert_eq!(
            registry.num_session_subscriptions(&SessionName::from("client/joe/1")),
            0
        );
    }

    #[test]
    fn test_find_by_topic() {
        let registry = ClientSubscriptions::new();
        let sub = make_sub("client/joe/1", KeyQuery::exact("T"));
        registry.add(sub);
        registry.add(make_sub("client/joe/1", KeyQuery::exact("U")));

        let session = SessionName::from("client/joe/1");
        let found = registry.find_by_topic(&session, &TopicId::from("T"));
        assert_eq!(found.len(), 1);
    }
}
