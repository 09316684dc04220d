//! Ordered bounded queues over message store entries.
//!
//! One `MemQueue` serves as a topic's history queue; another instance backs
//! each session's callback queue. The queue itself never touches reference
//! counts: retain happens in the core just before `put`, release just after
//! an entry leaves the queue (`take_lowest`, `remove_random`, `clear`).

use crate::error::{BrokerError, Result};
use crate::store::MsgEntry;
use crate::types::{EntryId, SessionName, SubscriptionId, Timestamp};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// One queued reference to a message store entry.
#[derive(Clone)]
pub struct QueueEntry {
    /// The referenced store entry.
    pub entry: Arc<MsgEntry>,

    /// The subscription this delivery belongs to; None for history slots
    /// and plain point-to-point deliveries.
    pub subscription: Option<SubscriptionId>,

    /// Insertion time, defines queue order.
    pub queued_at: Timestamp,
}

impl QueueEntry {
    pub fn history(entry: Arc<MsgEntry>) -> Self {
        Self {
            entry,
            subscription: None,
            queued_at: Timestamp::unique(),
        }
    }

    pub fn delivery(entry: Arc<MsgEntry>, subscription: Option<SubscriptionId>) -> Self {
        Self {
            entry,
            subscription,
            queued_at: Timestamp::unique(),
        }
    }
}

impl std::fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEntry")
            .field("entry", &self.entry.id())
            .field("subscription", &self.subscription)
            .field("queued_at", &self.queued_at)
            .finish()
    }
}

/// Contract an ordered bounded queue implementation must satisfy.
pub trait EntryQueue: Send + Sync {
    /// Append one entry. Fails with `QueueOverflow` when the bound would be
    /// exceeded; the caller decides between eviction and dead-lettering.
    fn put(&self, entry: QueueEntry) -> Result<()>;

    /// The oldest `n` entries, oldest first, without removing them.
    fn peek(&self, n: usize) -> Vec<QueueEntry>;

    /// Remove and return the oldest `n` entries.
    fn take_lowest(&self, n: usize) -> Vec<QueueEntry>;

    /// Remove the given entries wherever they sit in the queue. Returns the
    /// ones actually removed.
    fn remove_random(&self, ids: &[EntryId]) -> Vec<QueueEntry>;

    fn num_entries(&self) -> usize;

    /// Drain the queue, returning everything that was in it.
    fn clear(&self) -> Vec<QueueEntry>;
}

/// RAM-based `EntryQueue`: a `VecDeque` under one lock, which is what makes
/// per-subscriber delivery order hold.
pub struct MemQueue {
    /// Session the queue belongs to; None for history queues.
    owner: Option<SessionName>,
    inner: Mutex<Inner>,
}

struct Inner {
    entries: VecDeque<QueueEntry>,
    capacity: usize,
}

impl MemQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            owner: None,
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                capacity,
            }),
        }
    }

    pub fn for_session(owner: SessionName, capacity: usize) -> Self {
        Self {
            owner: Some(owner),
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                capacity,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// The newest queued entry, if any.
    pub fn newest(&self) -> Option<QueueEntry> {
        self.inner.lock().entries.back().cloned()
    }
}

impl EntryQueue for MemQueue {
    fn put(&self, entry: QueueEntry) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.entries.len() >= inner.capacity {
            return Err(BrokerError::QueueOverflow {
                session: self
                    .owner
                    .clone()
                    .unwrap_or_else(|| SessionName::from("<history>")),
                capacity: inner.capacity,
            });
        }
        inner.entries.push_back(entry);
        Ok(())
    }

    fn peek(&self, n: usize) -> Vec<QueueEntry> {
        self.inner.lock().entries.iter().take(n).cloned().collect()
    }

    fn take_lowest(&self, n: usize) -> Vec<QueueEntry> {
        let mut inner = self.inner.lock();
        let n = n.min(inner.entries.len());
        inner.entries.drain(..n).collect()
    }

    fn remove_random(&self, ids: &[EntryId]) -> Vec<QueueEntry> {
        let mut inner = self.inner.lock();
        let mut removed = Vec::new();
        inner.entries.retain(|qe| {
            if ids.contains(&qe.entry.id()) {
                removed.push(qe.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    fn num_entries(&self) -> usize {
        self.inner.lock().entries.len()
    }

    fn clear(&self) -> Vec<QueueEntry> {
        self.inner.lock().entries.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MsgUnit, TopicId, TopicKey};

    fn make_entry(id: u64) -> Arc<MsgEntry> {
        Arc::new(MsgEntry::new(
            EntryId(id),
            TopicId::from("T"),
            SessionName::from("client/joe/1"),
            Arc::new(MsgUnit::new(TopicKey::new("T"), b"x".to_vec())),
        ))
    }

    #[test]
    fn test_fifo_order() {
        let queue = MemQueue::new(10);
        for id in 1..=3 {
            queue.put(QueueEntry::history(make_entry(id))).unwrap();
        }

        let peeked = queue.peek(2);
        assert_eq!(peeked.len(), 2);
        assert_eq!(peeked[0].entry.id(), EntryId(1));
        assert_eq!(peeked[1].entry.id(), EntryId(2));
        assert_eq!(queue.num_entries(), 3);

        let taken = queue.take_lowest(2);
        assert_eq!(taken[0].entry.id(), EntryId(1));
        assert_eq!(queue.num_entries(), 1);
        assert_eq!(queue.newest().unwrap().entry.id(), EntryId(3));
    }

    #[test]
    fn test_put_over_capacity_fails() {
        let queue = MemQueue::for_session(SessionName::from("client/joe/1"), 1);
        queue.put(QueueEntry::history(make_entry(1))).unwrap();
        let err = queue.put(QueueEntry::history(make_entry(2))).unwrap_err();
        assert!(matches!(err, BrokerError::QueueOverflow { capacity: 1, .. }));
    }

    #[test]
    fn test_remove_random() {
        let queue = MemQueue::new(10);
        for id in 1..=4 {
            queue.put(QueueEntry::history(make_entry(id))).unwrap();
        }

        let removed = queue.remove_random(&[EntryId(2), EntryId(4), EntryId(99)]);
        let removed_ids: Vec<_> = removed.iter().map(|qe| qe.entry.id()).collect();
        assert_eq!(removed_ids, vec![EntryId(2), EntryId(4)]);
        assert_eq!(queue.num_entries(), 2);
    }

    #[test]
    fn test_clear_drains() {
        let queue = MemQueue::new(10);
        queue.put(QueueEntry::history(make_entry(1))).unwrap();
        queue.put(QueueEntry::history(make_entry(2))).unwrap();

        let drained = queue.clear();
        assert_eq!(drained.len(), 2);
        assert_eq!(queue.num_entries(), 0);
    }
}
