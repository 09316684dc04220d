//! Subscriptions and the cross-cutting subscription registry.
//!
//! - `info`: one client's interest in a topic or query, arena-style with
//!   parent/child links by id.
//! - `registry`: the two cross-indexes (per-session and query-subscription
//!   set) used for logout cleanup and retroactive query matching.

mod info;
mod registry;

pub use info::SubscriptionInfo;
pub use registry::ClientSubscriptions;
