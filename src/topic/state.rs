//! The five-state topic lifecycle.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a topic.
///
/// ```text
/// UNCONFIGURED -> ALIVE <-> UNREFERENCED -> DEAD
///       |          |                         ^
///       |          v                         |
///       +----> SOFT_ERASED ------------------+
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopicState {
    /// Created by a subscribe on a not-yet-published id; no content, no
    /// store or history queue yet.
    Unconfigured,
    /// Has content and/or exact subscribers.
    Alive,
    /// Configured but currently has neither content nor exact subscribers;
    /// still visible to query matching until the destroy timer fires.
    Unreferenced,
    /// Erase requested while store entries are still referenced by
    /// undelivered callback-queue entries; history cleared, subscribers
    /// detached, store kept alive.
    SoftErased,
    /// Terminal; all resources released, deregistered everywhere.
    Dead,
}

impl TopicState {
    /// Whether the documented state machine permits this transition.
    /// Self-transitions are idempotent no-ops and always allowed.
    pub fn may_transition(self, to: TopicState) -> bool {
        use TopicState::*;
        if self == to {
            return true;
        }
        match (self, to) {
            (Unconfigured, Alive) => true,
            (Unconfigured, SoftErased) => true,
            (Unconfigured, Dead) => true,
            (Alive, Unreferenced) => true,
            (Alive, SoftErased) => true,
            (Alive, Dead) => true,
            (Unreferenced, Alive) => true,
            (Unreferenced, Dead) => true,
            (SoftErased, Dead) => true,
            _ => false,
        }
    }

    pub fn is_dead(self) -> bool {
        self == TopicState::Dead
    }

    pub fn is_alive(self) -> bool {
        self == TopicState::Alive
    }

    pub fn is_unconfigured(self) -> bool {
        self == TopicState::Unconfigured
    }
}

impl fmt::Display for TopicState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TopicState::Unconfigured => "UNCONFIGURED",
            TopicState::Alive => "ALIVE",
            TopicState::Unreferenced => "UNREFERENCED",
            TopicState::SoftErased => "SOFT_ERASED",
            TopicState::Dead => "DEAD",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::TopicState::*;

    #[test]
    fn test_dead_is_terminal() {
        for to in [Unconfigured, Alive, Unreferenced, SoftErased] {
            assert!(!Dead.may_transition(to), "DEAD -> {} must be rejected", to);
        }
        assert!(Dead.may_transition(Dead));
    }

    #[test]
    fn test_documented_paths() {
        assert!(Unconfigured.may_transition(Alive));
        assert!(Alive.may_transition(Unreferenced));
        assert!(Unreferenced.may_transition(Alive));
        assert!(Unreferenced.may_transition(Dead));
        assert!(Alive.may_transition(SoftErased));
        assert!(SoftErased.may_transition(Dead));
    }

    #[test]
    fn test_undocumented_paths_rejected() {
        assert!(!Alive.may_transition(Unconfigured));
        assert!(!Unreferenced.may_transition(Unconfigured));
        assert!(!Unreferenced.may_transition(SoftErased));
        assert!(!SoftErased.may_transition(Alive));
        assert!(!SoftErased.may_transition(Unreferenced));
    }
}
