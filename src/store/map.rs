//! In-memory message store implementation.

use super::{MsgEntry, MsgStore};
use crate::config::TopicConfig;
use crate::error::{BrokerError, Result};
use crate::types::{EntryId, TopicId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// RAM-based `MsgStore`, ordered by entry id.
pub struct MemStore {
    topic: TopicId,
    inner: Mutex<Inner>,
}

struct Inner {
    entries: BTreeMap<EntryId, Arc<MsgEntry>>,
    max_entries: usize,
}

impl MemStore {
    pub fn new(topic: TopicId, max_entries: usize) -> Self {
        Self {
            topic,
            inner: Mutex::new(Inner {
                entries: BTreeMap::new(),
                max_entries,
            }),
        }
    }
}

impl MsgStore for MemStore {
    fn put(&self, entry: Arc<MsgEntry>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.entries.len() >= inner.max_entries {
            return Err(BrokerError::StoreOverflow {
                topic: self.topic.clone(),
                capacity: inner.max_entries,
            });
        }
        inner.entries.insert(entry.id(), entry);
        Ok(())
    }

    fn get(&self, id: EntryId) -> Option<Arc<MsgEntry>> {
        self.inner.lock().entries.get(&id).cloned()
    }

    fn remove(&self, id: EntryId) -> Option<Arc<MsgEntry>> {
        self.inner.lock().entries.remove(&id)
    }

    fn get_all(&self) -> Vec<Arc<MsgEntry>> {
        self.inner.lock().entries.values().cloned().collect()
    }

    fn num_entries(&self) -> usize {
        self.inner.lock().entries.len()
    }

    fn clear(&self) -> Vec<Arc<MsgEntry>> {
        let mut inner = self.inner.lock();
        let drained: Vec<_> = inner.entries.values().cloned().collect();
        inner.entries.clear();
        drained
    }

    fn set_properties(&self, config: &TopicConfig) {
        self.inner.lock().max_entries = config.store_max_entries;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MsgUnit, SessionName, TopicKey};

    fn make_entry(id: u64) -> Arc<MsgEntry> {
        Arc::new(MsgEntry::new(
            EntryId(id),
            TopicId::from("T"),
            SessionName::from("client/joe/1"),
            Arc::new(MsgUnit::new(TopicKey::new("T"), b"x".to_vec())),
        ))
    }

    #[test]
    fn test_put_get_remove() {
        let store = MemStore::new(TopicId::from("T"), 10);
        store.put(make_entry(1)).unwrap();
        store.put(make_entry(2)).unwrap();

        assert_eq!(store.num_entries(), 2);
        assert!(store.get(EntryId(1)).is_some());

        let removed = store.remove(EntryId(1)).unwrap();
        assert_eq!(removed.id(), EntryId(1));
        assert_eq!(store.num_entries(), 1);
        assert!(store.get(EntryId(1)).is_none());
    }

    #[test]
    fn test_capacity_enforced() {
        let store = MemStore::new(TopicId::from("T"), 1);
        store.put(make_entry(1)).unwrap();
        let err = store.put(make_entry(2)).unwrap_err();
        assert!(matches!(err, BrokerError::StoreOverflow { capacity: 1, .. }));
    }

    #[test]
    fn test_get_all_is_ordered() {
        let store = MemStore::new(TopicId::from("T"), 10);
        store.put(make_entry(3)).unwrap();
        store.put(make_entry(1)).unwrap();
        store.put(make_entry(2)).unwrap();

        let ids: Vec<_> = store.get_all().iter().map(|e| e.id()).collect();
        assert_eq!(ids, vec![EntryId(1), EntryId(2), EntryId(3)]);
    }

    #[test]
    fn test_clear_returns_drained_entries() {
        let store = MemStore::new(TopicId::from("T"), 10);
        store.put(make_entry(1)).unwrap();
        store.put(make_entry(2)).unwrap();

        let drained = store.clear();
        assert_eq!(drained.len(), 2);
        assert_eq!(store.num_entries(), 0);
    }
}
