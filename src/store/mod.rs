//! Message store: reference-counted shared storage for published messages.
//!
//! Each topic owns one store. Entries are kept alive by explicit
//! retain/release pairs from their holders (the history queue and callback
//! queues); an entry leaves the store exactly when its count reaches zero
//! and it is no longer under construction.

mod entry;
mod map;

pub use entry::{MsgEntry, ReleaseOutcome};
pub use map::MemStore;

use crate::config::TopicConfig;
use crate::error::Result;
use crate::types::EntryId;
use std::sync::Arc;

/// Contract a message store implementation must satisfy.
///
/// Content-addressed storage keyed by store-local id. `remove` is driven by
/// the core's reference counting, never by the store itself.
pub trait MsgStore: Send + Sync {
    fn put(&self, entry: Arc<MsgEntry>) -> Result<()>;
    fn get(&self, id: EntryId) -> Option<Arc<MsgEntry>>;
    fn remove(&self, id: EntryId) -> Option<Arc<MsgEntry>>;
    fn get_all(&self) -> Vec<Arc<MsgEntry>>;
    fn num_entries(&self) -> usize;
    fn clear(&self) -> Vec<Arc<MsgEntry>>;
    fn set_properties(&self, config: &TopicConfig);
}
