//! Tracking of messages sent on behalf of the federation.
//!
//! Every accepted request becomes an [OutstandingMessage] that lists its destination
//! entities. Each destination is reported to the federation at most once, when the
//! message reaches it. The message is finally summarized in a single timeout
//! notification, sent either when every destination has been reached or when the
//! request times out (whichever happens first).

use crate::{
    notification::{Notification, Outcome},
    registry::EntityHandle,
    types::{EntityId, NodeId},
    Clock, Error, Federation,
};
use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};
use std::{collections::HashMap, time::Duration};
use tracing::debug;

/// Delivery state of one destination entity of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DestinationRecord {
    pub handle: EntityHandle,
    /// Identifier reported to the federation.
    pub entity: EntityId,
    pub processed: bool,
    pub success: bool,
}

impl DestinationRecord {
    pub fn new(handle: EntityHandle, entity: EntityId) -> Self {
        Self {
            handle,
            entity,
            processed: false,
            success: false,
        }
    }
}

/// A message that has not yet been summarized to the federation.
#[derive(Clone, Debug, PartialEq)]
pub struct OutstandingMessage {
    pub sender: EntityId,
    pub radio: u16,
    /// Timestamp of the request that created the message.
    pub timestamp: u32,
    pub send_time: Duration,
    pub destinations: Vec<DestinationRecord>,
}

impl OutstandingMessage {
    fn summary(&self) -> Result<Notification, Error> {
        let outcomes = self
            .destinations
            .iter()
            .map(|record| Outcome {
                entity: record.entity,
                success: record.success,
            })
            .collect();
        Notification::timeout(self.sender, self.radio, self.timestamp, outcomes)
    }
}

/// Outstanding messages keyed by source node and message identifier.
pub struct Tracker {
    max_message_id: u32,
    next: HashMap<NodeId, u32>,
    tracked: HashMap<(NodeId, u32), OutstandingMessage>,

    outstanding: Gauge,
    requests: Counter,
    completions: Counter,
    timeouts: Counter,
}

impl Tracker {
    /// Creates a tracker that assigns identifiers below `max_message_id`.
    pub fn new(max_message_id: u32, registry: &mut Registry) -> Self {
        let outstanding = Gauge::default();
        let requests = Counter::default();
        let completions = Counter::default();
        let timeouts = Counter::default();
        registry.register(
            "outstanding",
            "messages awaiting a summary",
            outstanding.clone(),
        );
        registry.register("requests", "accepted requests", requests.clone());
        registry.register(
            "completions",
            "destinations reported as reached",
            completions.clone(),
        );
        registry.register("timeouts", "messages that timed out", timeouts.clone());
        Self {
            max_message_id,
            next: HashMap::new(),
            tracked: HashMap::new(),
            outstanding,
            requests,
            completions,
            timeouts,
        }
    }

    /// Assigns the next message identifier of `source`, starting at 0.
    pub fn next_id(&mut self, source: NodeId) -> Result<u32, Error> {
        let next = self.next.entry(source).or_insert(0);
        let id = *next;
        if id >= self.max_message_id {
            return Err(Error::MessageIdExhausted(source));
        }
        *next += 1;
        Ok(id)
    }

    /// Starts tracking `message` of `source`.
    pub fn track(&mut self, source: NodeId, id: u32, message: OutstandingMessage) {
        self.requests.inc();
        self.tracked.insert((source, id), message);
        self.outstanding.set(self.tracked.len() as i64);
    }

    pub fn get(&self, source: NodeId, id: u32) -> Option<&OutstandingMessage> {
        self.tracked.get(&(source, id))
    }

    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    /// Handles the result of delivering message `id` of `source` to a node of the
    /// `destination` entity.
    ///
    /// Failures are ignored (they are reported in the summary). Results for unknown
    /// messages or destinations, and repeated results, are ignored.
    pub fn complete<E: Clock + Federation>(
        &mut self,
        ctx: &mut E,
        source: NodeId,
        id: u32,
        destination: EntityHandle,
        success: bool,
    ) -> Result<(), Error> {
        if !success {
            return Ok(());
        }
        let Some(message) = self.tracked.get_mut(&(source, id)) else {
            debug!(source, id, ?destination, "ignoring result for completed message");
            return Ok(());
        };
        let Some(record) = message
            .destinations
            .iter_mut()
            .find(|record| record.handle == destination)
        else {
            return Ok(());
        };
        if record.processed {
            return Ok(());
        }
        record.processed = true;
        record.success = true;
        let receiver = record.entity;

        // Report the destination
        let delay = ctx.current().saturating_sub(message.send_time);
        ctx.notify(Notification::ProcessMessage {
            sender: message.sender,
            radio: message.radio,
            timestamp: message.timestamp,
            receiver,
            delay: delay.as_secs_f64(),
        });
        self.completions.inc();
        debug!(source, id, %receiver, ?delay, "message processed");

        // Summarize once every destination has been reached
        if message.destinations.iter().all(|record| record.processed) {
            let summary = message.summary()?;
            ctx.notify(summary);
            self.remove(source, id);
        }
        Ok(())
    }

    /// Handles the timeout of message `id` of `source`.
    pub fn timeout<E: Federation>(
        &mut self,
        ctx: &mut E,
        source: NodeId,
        id: u32,
    ) -> Result<(), Error> {
        let Some(message) = self.tracked.get(&(source, id)) else {
            debug!(source, id, "ignoring timeout for completed message");
            return Ok(());
        };
        let summary = message.summary()?;
        ctx.notify(summary);
        self.timeouts.inc();
        debug!(source, id, "message timed out");
        self.remove(source, id);
        Ok(())
    }

    fn remove(&mut self, source: NodeId, id: u32) {
        self.tracked.remove(&(source, id));
        self.outstanding.set(self.tracked.len() as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use commonware_codec::Decode;
    use commonware_macros::test_traced;

    #[derive(Default)]
    struct Context {
        now: Duration,
        sent: Vec<Notification>,
    }

    impl Clock for Context {
        fn current(&self) -> Duration {
            self.now
        }

        fn external(&self) -> Duration {
            self.now
        }

        fn seconds_past_hour(&self) -> f64 {
            0.0
        }
    }

    impl Federation for Context {
        fn send(&mut self, datum: u32, value: Bytes) {
            let notification = Notification::decode_cfg(value, &datum).unwrap();
            self.sent.push(notification);
        }
    }

    const SENDER: EntityId = EntityId::new(1, 1, 1);

    fn message(destinations: &[(usize, EntityId)]) -> OutstandingMessage {
        OutstandingMessage {
            sender: SENDER,
            radio: 1,
            timestamp: 42,
            send_time: Duration::from_secs(1),
            destinations: destinations
                .iter()
                .map(|(handle, entity)| DestinationRecord::new(EntityHandle::new(*handle), *entity))
                .collect(),
        }
    }

    fn tracker() -> Tracker {
        Tracker::new(u32::MAX, &mut Registry::default())
    }

    #[test]
    fn test_message_ids() {
        let mut tracker = Tracker::new(3, &mut Registry::default());
        assert_eq!(tracker.next_id(1).unwrap(), 0);
        assert_eq!(tracker.next_id(1).unwrap(), 1);
        assert_eq!(tracker.next_id(2).unwrap(), 0);
        assert_eq!(tracker.next_id(1).unwrap(), 2);
        assert!(matches!(
            tracker.next_id(1),
            Err(Error::MessageIdExhausted(1))
        ));
    }

    #[test_traced]
    fn test_completion_then_late_timeout() {
        let mut tracker = tracker();
        let mut ctx = Context::default();
        let receiver = EntityId::new(1, 1, 2);
        tracker.track(5, 0, message(&[(6, receiver)]));

        ctx.now = Duration::from_millis(2500);
        tracker
            .complete(&mut ctx, 5, 0, EntityHandle::new(6), true)
            .unwrap();
        assert!(tracker.is_empty());
        assert_eq!(ctx.sent.len(), 2);
        assert_eq!(
            ctx.sent[0],
            Notification::ProcessMessage {
                sender: SENDER,
                radio: 1,
                timestamp: 42,
                receiver,
                delay: 1.5,
            }
        );
        assert_eq!(
            ctx.sent[1],
            Notification::timeout(
                SENDER,
                1,
                42,
                vec![Outcome {
                    entity: receiver,
                    success: true
                }]
            )
            .unwrap()
        );

        // Duplicate completion and late timeout are ignored
        tracker
            .complete(&mut ctx, 5, 0, EntityHandle::new(6), true)
            .unwrap();
        tracker.timeout(&mut ctx, 5, 0).unwrap();
        assert_eq!(ctx.sent.len(), 2);
    }

    #[test]
    fn test_timeout_without_completion() {
        let mut tracker = tracker();
        let mut ctx = Context::default();
        let receiver = EntityId::new(1, 1, 2);
        tracker.track(5, 0, message(&[(6, receiver)]));

        // Failures are only reported in the summary
        tracker
            .complete(&mut ctx, 5, 0, EntityHandle::new(6), false)
            .unwrap();
        assert!(ctx.sent.is_empty());

        tracker.timeout(&mut ctx, 5, 0).unwrap();
        assert!(tracker.is_empty());
        assert_eq!(ctx.sent.len(), 1);
        let Notification::Timeout { outcomes, .. } = &ctx.sent[0] else {
            panic!("expected timeout");
        };
        assert_eq!(outcomes.iter().filter(|o| o.success).count(), 0);
    }

    #[test]
    fn test_partial_completion() {
        let mut tracker = tracker();
        let mut ctx = Context::default();
        let (a, b) = (EntityId::new(1, 1, 2), EntityId::new(1, 1, 3));
        tracker.track(5, 0, message(&[(6, a), (7, b)]));

        tracker
            .complete(&mut ctx, 5, 0, EntityHandle::new(7), true)
            .unwrap();
        // Spurious destination and duplicate are ignored
        tracker
            .complete(&mut ctx, 5, 0, EntityHandle::new(9), true)
            .unwrap();
        tracker
            .complete(&mut ctx, 5, 0, EntityHandle::new(7), true)
            .unwrap();
        assert_eq!(ctx.sent.len(), 1);
        assert_eq!(tracker.len(), 1);
        let record = tracker.get(5, 0).unwrap().destinations[1];
        assert!(record.processed && record.success);

        tracker.timeout(&mut ctx, 5, 0).unwrap();
        assert_eq!(ctx.sent.len(), 2);
        let Notification::Timeout {
            receiver, outcomes, ..
        } = &ctx.sent[1]
        else {
            panic!("expected timeout");
        };
        assert_eq!(*receiver, EntityId::BROADCAST);
        assert_eq!(
            outcomes,
            &vec![
                Outcome {
                    entity: a,
                    success: false
                },
                Outcome {
                    entity: b,
                    success: true
                }
            ]
        );
    }

    #[test]
    fn test_unreflected_destinations_are_distinct() {
        // Two entities without a federation identifier report the same id
        let mut tracker = tracker();
        let mut ctx = Context::default();
        let unreflected = EntityId::default();
        tracker.track(5, 0, message(&[(6, unreflected), (7, unreflected)]));

        tracker
            .complete(&mut ctx, 5, 0, EntityHandle::new(7), true)
            .unwrap();
        assert_eq!(ctx.sent.len(), 1);
        let destinations = &tracker.get(5, 0).unwrap().destinations;
        assert!(!destinations[0].processed);
        assert!(destinations[1].processed && destinations[1].success);

        tracker
            .complete(&mut ctx, 5, 0, EntityHandle::new(6), true)
            .unwrap();
        assert!(tracker.is_empty());
        assert_eq!(ctx.sent.len(), 3);
    }
}
