//! The delivery pipeline: point-to-point resolution and publish/subscribe
//! fan-out into session callback queues.
//!
//! Fan-out iterates a stable snapshot of a topic's subscriber set with no
//! topic lock held. Per-subscriber failures never reach the publisher; they
//! are collected and turned into dead letters and detaches by the
//! orchestrator after the loop.

use crate::error::{BrokerError, Result};
use crate::history::{EntryQueue, QueueEntry};
use crate::session::SessionDirectory;
use crate::store::MsgEntry;
use crate::subscription::SubscriptionInfo;
use crate::types::{Destination, MsgUnit, SessionName};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Optional per-subscription content filter, invoked per delivery.
pub trait AccessFilter: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the message passes the filter for this receiver. An error is
    /// converted into a dead letter for that one destination, never
    /// propagated to the publisher.
    fn matches(&self, receiver: &SessionName, msg: &MsgUnit, query: &str) -> Result<bool>;
}

/// One fan-out failure, to be dead-lettered and detached.
pub(crate) struct FailedDelivery {
    pub sub: Arc<SubscriptionInfo>,
    pub reason: String,
}

/// Result of one fan-out pass.
#[derive(Default)]
pub(crate) struct FanOutResult {
    pub delivered: usize,
    pub failed: Vec<FailedDelivery>,
}

/// Fans messages out to callback destinations, applying access filters.
pub struct DeliveryPipeline {
    filters: RwLock<HashMap<String, Arc<dyn AccessFilter>>>,
}

impl DeliveryPipeline {
    pub fn new() -> Self {
        Self {
            filters: RwLock::new(HashMap::new()),
        }
    }

    /// Register an access filter plugin under its name.
    pub fn register_filter(&self, filter: Arc<dyn AccessFilter>) {
        self.filters.write().insert(filter.name().to_string(), filter);
    }

    /// Deliver to explicit point-to-point destinations. All destinations
    /// are resolved before anything is enqueued, so an unknown destination
    /// fails the whole publish synchronously.
    pub(crate) fn deliver_ptp(
        &self,
        entry: &Arc<MsgEntry>,
        destinations: &[Destination],
        sessions: &SessionDirectory,
    ) -> Result<usize> {
        let mut resolved = Vec::with_capacity(destinations.len());
        for destination in destinations {
            let session = match sessions.resolve(&destination.session) {
                Some(session) => session,
                None if destination.force_queuing => {
                    sessions.connect_deferred(destination.session.clone())
                }
                None => {
                    return Err(BrokerError::UnknownDestination(destination.session.clone()))
                }
            };
            resolved.push(session);
        }

        let mut delivered = 0;
        for session in resolved {
            entry.retain();
            match session
                .callback_queue()
                .put(QueueEntry::delivery(entry.clone(), None))
            {
                Ok(()) => delivered += 1,
                Err(e) => {
                    entry.release();
                    warn!(
                        session = %session.name(),
                        entry = %entry.id(),
                        error = %e,
                        "PtP enqueue failed"
                    );
                }
            }
        }
        Ok(delivered)
    }

    /// Fan one store entry out to a subscriber snapshot. Enqueue and filter
    /// failures are collected, never raised while iterating.
    pub(crate) fn fan_out(
        &self,
        entry: &Arc<MsgEntry>,
        subscribers: &[Arc<SubscriptionInfo>],
        sessions: &SessionDirectory,
    ) -> FanOutResult {
        let mut result = FanOutResult::default();
        let msg = entry.msg();

        for sub in subscribers {
            if sub.is_shutdown() {
                continue;
            }
            let qos = sub.qos();

            // Suppress local echo when asked to.
            if !qos.local && entry.sender() == sub.session() {
                continue;
            }
            // Subscribers may opt out of erase notifications.
            if msg.qos.erase_notify && !qos.want_notify {
                continue;
            }
            if entry.is_expired() {
                debug!(entry = %entry.id(), "entry expired, skipping delivery");
                continue;
            }

            match self.passes_filters(sub, &qos.filters, msg) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    result.failed.push(FailedDelivery {
                        sub: sub.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            }

            let Some(session) = sessions.resolve(sub.session()) else {
                result.failed.push(FailedDelivery {
                    sub: sub.clone(),
                    reason: format!("session '{}' has vanished", sub.session()),
                });
                continue;
            };

            entry.retain();
            match session
                .callback_queue()
                .put(QueueEntry::delivery(entry.clone(), Some(sub.id().clone())))
            {
                Ok(()) => result.delivered += 1,
                Err(e) => {
                    entry.release();
                    result.failed.push(FailedDelivery {
                        sub: sub.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        result
    }

    fn passes_filters(
        &self,
        sub: &Arc<SubscriptionInfo>,
        specs: &[crate::types::FilterSpec],
        msg: &MsgUnit,
    ) -> Result<bool> {
        for spec in specs {
            let filter = self.filters.read().get(&spec.plugin).cloned();
            let Some(filter) = filter else {
                return Err(BrokerError::FilterFailed {
                    plugin: spec.plugin.clone(),
                    reason: "filter plugin not registered".to_string(),
                });
            };
            match filter.matches(sub.session(), msg, &spec.query) {
                Ok(true) => {}
                Ok(false) => return Ok(false),
                Err(e) => {
                    return Err(BrokerError::FilterFailed {
                        plugin: spec.plugin.clone(),
                        reason: e.to_string(),
                    })
                }
            }
        }
        Ok(true)
    }
}

impl Default for DeliveryPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntryId, FilterSpec, KeyQuery, SubscribeQos, TopicId, TopicKey};

    fn make_entry(sender: &str, content: &[u8]) -> Arc<MsgEntry> {
        Arc::new(MsgEntry::new(
            EntryId(1),
            TopicId::from("T"),
            SessionName::from(sender),
            Arc::new(MsgUnit::new(TopicKey::new("T"), content.to_vec())),
        ))
    }

    fn make_sub(session: &str, qos: SubscribeQos) -> Arc<SubscriptionInfo> {
        Arc::new(SubscriptionInfo::new(
            SessionName::from(session),
            KeyQuery::exact("T"),
            qos,
        ))
    }

    struct RejectAll;
    impl AccessFilter for RejectAll {
        fn name(&self) -> &str {
            "reject-all"
        }
        fn matches(&self, _: &SessionName, _: &MsgUnit, _: &str) -> Result<bool> {
            Ok(false)
        }
    }

    struct Exploding;
    impl AccessFilter for Exploding {
        fn name(&self) -> &str {
            "exploding"
        }
        fn matches(&self, _: &SessionName, _: &MsgUnit, _: &str) -> Result<bool> {
            Err(BrokerError::Internal("boom".to_string()))
        }
    }

    #[test]
    fn test_fan_out_enqueues_and_retains() {
        let pipeline = DeliveryPipeline::new();
        let sessions = SessionDirectory::new(10);
        let session = sessions.connect(SessionName::from("client/jack/1"));

        let entry = make_entry("client/joe/1", b"x");
        let sub = make_sub("client/jack/1", SubscribeQos::default());

        let result = pipeline.fan_out(&entry, &[sub], &sessions);
        assert_eq!(result.delivered, 1);
        assert!(result.failed.is_empty());
        assert_eq!(session.callback_queue().num_entries(), 1);
        // Publisher hold + callback queue hold.
        assert_eq!(entry.ref_count(), 2);
    }

    #[test]
    fn test_local_echo_suppressed() {
        let pipeline = DeliveryPipeline::new();
        let sessions = SessionDirectory::new(10);
        sessions.connect(SessionName::from("client/joe/1"));

        let entry = make_entry("client/joe/1", b"x");
        let qos = SubscribeQos {
            local: false,
            ..Default::default()
        };
        let sub = make_sub("client/joe/1", qos);

        let result = pipeline.fan_out(&entry, &[sub], &sessions);
        assert_eq!(result.delivered, 0);
        assert!(result.failed.is_empty());
        assert_eq!(entry.ref_count(), 1);
    }

    #[test]
    fn test_filter_rejection_drops_silently() {
        let pipeline = DeliveryPipeline::new();
        pipeline.register_filter(Arc::new(RejectAll));
        let sessions = SessionDirectory::new(10);
        sessions.connect(SessionName::from("client/jack/1"));

        let qos = SubscribeQos {
            filters: vec![FilterSpec {
                plugin: "reject-all".to_string(),
                query: "".to_string(),
            }],
            ..Default::default()
        };
        let entry = make_entry("client/joe/1", b"x");
        let result = pipeline.fan_out(&entry, &[make_sub("client/jack/1", qos)], &sessions);
        assert_eq!(result.delivered, 0);
        assert!(result.failed.is_empty());
    }

    #[test]
    fn test_filter_error_collects_failure() {
        let pipeline = DeliveryPipeline::new();
        pipeline.register_filter(Arc::new(Exploding));
        let sessions = SessionDirectory::new(10);
        sessions.connect(SessionName::from("client/jack/1"));

        let qos = SubscribeQos {
            filters: vec![FilterSpec {
                plugin: "exploding".to_string(),
                query: "".to_string(),
            }],
            ..Default::default()
        };
        let entry = make_entry("client/joe/1", b"x");
        let result = pipeline.fan_out(&entry, &[make_sub("client/jack/1", qos)], &sessions);
        assert_eq!(result.delivered, 0);
        assert_eq!(result.failed.len(), 1);
        // No reference leaked for the failed destination.
        assert_eq!(entry.ref_count(), 1);
    }

    #[test]
    fn test_queue_overflow_collects_failure() {
        let pipeline = DeliveryPipeline::new();
        let sessions = SessionDirectory::new(1);
        sessions.connect(SessionName::from("client/jack/1"));

        let entry = make_entry("client/joe/1", b"x");
        let subs = vec![
            make_sub("client/jack/1", SubscribeQos::default()),
            make_sub("client/jack/1", SubscribeQos::default()),
        ];
        let result = pipeline.fan_out(&entry, &subs, &sessions);
        assert_eq!(result.delivered, 1);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(entry.ref_count(), 2);
    }

    #[test]
    fn test_ptp_unknown_destination_fails_synchronously() {
        let pipeline = DeliveryPipeline::new();
        let sessions = SessionDirectory::new(10);

        let entry = make_entry("client/joe/1", b"x");
        let err = pipeline
            .deliver_ptp(&entry, &[Destination::new("client/nobody/1")], &sessions)
            .unwrap_err();
        assert!(matches!(err, BrokerError::UnknownDestination(_)));
        assert_eq!(entry.ref_count(), 1);
    }

    #[test]
    fn test_ptp_force_queuing_creates_deferred_session() {
        let pipeline = DeliveryPipeline::new();
        let sessions = SessionDirectory::new(10);

        let entry = make_entry("client/joe/1", b"x");
        let delivered = pipeline
            .deliver_ptp(
                &entry,
                &[Destination::new("client/late/1").force_queuing()],
                &sessions,
            )
            .unwrap();
        assert_eq!(delivered, 1);

        let deferred = sessions.resolve(&SessionName::from("client/late/1")).unwrap();
        assert!(deferred.is_deferred());
        assert_eq!(deferred.callback_queue().num_entries(), 1);
        assert_eq!(entry.ref_count(), 2);
    }
}
