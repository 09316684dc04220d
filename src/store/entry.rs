//! A single reference-counted message store entry.

use crate::types::{EntryId, MsgUnit, SessionName, Timestamp, TopicId};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::error;

/// Result of releasing one reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Other holders remain.
    StillReferenced,
    /// The count reached zero; the caller must remove the entry from its
    /// store and re-check the owning topic's lifecycle.
    BecameUnreferenced,
    /// The entry was already destroyed (double release, logged).
    AlreadyDestroyed,
}

/// Mutable portion of an entry, guarded by the entry's own lock.
#[derive(Debug)]
struct EntryState {
    ref_count: i64,
    destroyed: bool,
}

/// An immutable message payload plus a mutable reference count and expiry
/// clock. Owned jointly by whichever containers hold a reference.
pub struct MsgEntry {
    id: EntryId,
    topic: TopicId,
    sender: SessionName,
    msg: Arc<MsgUnit>,
    created: Timestamp,
    /// Absolute expiry instant, derived from the publish QoS lifetime.
    expiry: Option<Timestamp>,
    state: Mutex<EntryState>,
}

impl MsgEntry {
    /// Create an entry with an initial count of one, held by the publish
    /// call itself until fan-out completes.
    pub fn new(id: EntryId, topic: TopicId, sender: SessionName, msg: Arc<MsgUnit>) -> Self {
        let created = Timestamp::now();
        let expiry = msg
            .qos
            .lifetime_ms
            .map(|ms| Timestamp(created.0 + ms.max(0) * 1000));
        Self {
            id,
            topic,
            sender,
            msg,
            created,
            expiry,
            state: Mutex::new(EntryState {
                ref_count: 1,
                destroyed: false,
            }),
        }
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn topic(&self) -> &TopicId {
        &self.topic
    }

    pub fn sender(&self) -> &SessionName {
        &self.sender
    }

    pub fn msg(&self) -> &Arc<MsgUnit> {
        &self.msg
    }

    pub fn created(&self) -> Timestamp {
        self.created
    }

    /// Current reference count. Diagnostic only; holders change it
    /// concurrently.
    pub fn ref_count(&self) -> i64 {
        self.state.lock().ref_count
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Whether the entry's lifetime has elapsed. Expired entries are
    /// skipped at delivery time; there is no expiry timer.
    pub fn is_expired(&self) -> bool {
        match self.expiry {
            Some(expiry) => Timestamp::now() >= expiry,
            None => false,
        }
    }

    /// Register one more holder.
    pub fn retain(&self) -> i64 {
        let mut state = self.state.lock();
        if state.destroyed {
            error!(entry = %self.id, topic = %self.topic, "retain on destroyed entry");
        }
        state.ref_count += 1;
        state.ref_count
    }

    /// Drop one holder. The count never goes negative; a release below zero
    /// is an invariant violation that is logged and clamped.
    pub fn release(&self) -> ReleaseOutcome {
        let mut state = self.state.lock();
        if state.destroyed {
            error!(entry = %self.id, topic = %self.topic, "release on destroyed entry");
            return ReleaseOutcome::AlreadyDestroyed;
        }
        state.ref_count -= 1;
        if state.ref_count < 0 {
            error!(
                entry = %self.id,
                topic = %self.topic,
                count = state.ref_count,
                "reference count went negative, clamping to zero"
            );
            state.ref_count = 0;
            return ReleaseOutcome::AlreadyDestroyed;
        }
        if state.ref_count == 0 {
            state.destroyed = true;
            ReleaseOutcome::BecameUnreferenced
        } else {
            ReleaseOutcome::StillReferenced
        }
    }
}

impl std::fmt::Debug for MsgEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MsgEntry")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("ref_count", &state.ref_count)
            .field("destroyed", &state.destroyed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TopicKey;

    fn make_entry(id: u64) -> MsgEntry {
        let msg = Arc::new(MsgUnit::new(TopicKey::new("T"), b"payload".to_vec()));
        MsgEntry::new(
            EntryId(id),
            TopicId::from("T"),
            SessionName::from("client/joe/1"),
            msg,
        )
    }

    #[test]
    fn test_initial_count_is_one() {
        let entry = make_entry(1);
        assert_eq!(entry.ref_count(), 1);
        assert!(!entry.is_destroyed());
    }

    #[test]
    fn test_retain_release_balance() {
        let entry = make_entry(1);
        entry.retain();
        entry.retain();
        assert_eq!(entry.ref_count(), 3);

        assert_eq!(entry.release(), ReleaseOutcome::StillReferenced);
        assert_eq!(entry.release(), ReleaseOutcome::StillReferenced);
        assert_eq!(entry.release(), ReleaseOutcome::BecameUnreferenced);
        assert!(entry.is_destroyed());
    }

    #[test]
    fn test_release_past_zero_is_clamped() {
        let entry = make_entry(1);
        assert_eq!(entry.release(), ReleaseOutcome::BecameUnreferenced);
        assert_eq!(entry.release(), ReleaseOutcome::AlreadyDestroyed);
        assert_eq!(entry.ref_count(), 0);
    }

    #[test]
    fn test_expiry_from_lifetime() {
        let mut msg = MsgUnit::new(TopicKey::new("T"), b"x".to_vec());
        msg.qos.lifetime_ms = Some(0);
        let entry = MsgEntry::new(
            EntryId(1),
            TopicId::from("T"),
            SessionName::from("client/joe/1"),
            Arc::new(msg),
        );
        assert!(entry.is_expired());

        let entry = make_entry(2);
        assert!(!entry.is_expired());
    }
}
