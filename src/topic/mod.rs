//! Topics: owner of one message store, at most one history queue, and the
//! current subscriber set for one topic id.

mod handler;
mod state;

pub use handler::{EraseOutcome, PublishPrep, TopicHandler};
pub use state::TopicState;

pub(crate) use handler::TopicAction;
