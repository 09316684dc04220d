//! Session directory: resolves destination sessions and owns their
//! callback queues.
//!
//! A "deferred" session is a placeholder created for a force-queued
//! point-to-point destination that is not connected yet; its queue holds the
//! messages until the real client connects and claims it.

use crate::history::MemQueue;
use crate::types::SessionName;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// One known session and its callback channel.
pub struct SessionInfo {
    name: SessionName,
    /// Bounded delivery queue; the external dispatch machinery drains it.
    callback: Arc<MemQueue>,
    /// Created ahead of the client by a force-queued PtP message.
    deferred: AtomicBool,
}

impl SessionInfo {
    pub fn name(&self) -> &SessionName {
        &self.name
    }

    pub fn callback_queue(&self) -> &Arc<MemQueue> {
        &self.callback
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for SessionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionInfo")
            .field("name", &self.name)
            .field("deferred", &self.is_deferred())
            .finish()
    }
}

/// Directory of all known sessions.
pub struct SessionDirectory {
    sessions: RwLock<HashMap<SessionName, Arc<SessionInfo>>>,
    queue_capacity: usize,
}

impl SessionDirectory {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            queue_capacity,
        }
    }

    /// Register a connected session. If a deferred placeholder exists it is
    /// claimed, keeping any messages already queued for it.
    pub fn connect(&self, name: SessionName) -> Arc<SessionInfo> {
        let mut sessions = self.sessions.write();
        if let Some(existing) = sessions.get(&name) {
            if existing.is_deferred() {
                existing.deferred.store(false, Ordering::SeqCst);
                debug!(session = %name, "deferred session claimed");
            }
            return existing.clone();
        }
        let session = Arc::new(SessionInfo {
            name: name.clone(),
            callback: Arc::new(MemQueue::for_session(name.clone(), self.queue_capacity)),
            deferred: AtomicBool::new(false),
        });
        sessions.insert(name, session.clone());
        session
    }

    /// Create a deferred placeholder for a force-queued PtP destination.
    pub fn connect_deferred(&self, name: SessionName) -> Arc<SessionInfo> {
        let mut sessions = self.sessions.write();
        if let Some(existing) = sessions.get(&name) {
            return existing.clone();
        }
        debug!(session = %name, "creating deferred session for force-queued delivery");
        let session = Arc::new(SessionInfo {
            name: name.clone(),
            callback: Arc::new(MemQueue::for_session(name.clone(), self.queue_capacity)),
            deferred: AtomicBool::new(true),
        });
        sessions.insert(name, session.clone());
        session
    }

    /// Resolve a session by name.
    pub fn resolve(&self, name: &SessionName) -> Option<Arc<SessionInfo>> {
        self.sessions.read().get(name).cloned()
    }

    /// Whether the named session exists and can receive callbacks. Deferred
    /// sessions hold messages but cannot subscribe.
    pub fn has_callback(&self, name: &SessionName) -> bool {
        match self.resolve(name) {
            Some(session) => !session.is_deferred(),
            None => false,
        }
    }

    /// Remove a session on logout. Returns it so the caller can drain its
    /// queue and release the entry references it still holds.
    pub fn remove(&self, name: &SessionName) -> Option<Arc<SessionInfo>> {
        self.sessions.write().remove(name)
    }

    pub fn num_sessions(&self) -> usize {
        self.sessions.read().len()
    }
}
