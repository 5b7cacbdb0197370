//! A deterministic, multi-partition simulation for tests.
//!
//! All partitions share one clock. Timers and delivery results are kept in a min-heap of
//! alarms. Envelopes are encoded and sent through one unbounded mailbox per partition,
//! then collected into the heap before each step. Every effect the bridge has on nodes
//! and on the federation is recorded for inspection.

use crate::{
    bridge::{Bridge, Event},
    forwarder::{Envelope, Forwarder, Mode},
    geo::{Geodetic, Orientation},
    mobility::Placement,
    notification::Notification,
    request::{Delivery, Destination},
    types::{NodeId, PartitionId, FEDERATION_PARTITION},
    Clock, Error, Federation, Messenger, Nodes, Scheduler,
};
use bytes::Bytes;
use commonware_codec::{Decode, Encode};
use futures::channel::mpsc;
use prometheus_client::registry::Registry;
use std::{
    collections::{BTreeMap, BTreeSet, BinaryHeap},
    sync::{Arc, Mutex},
    time::Duration,
};

/// A frame in a partition's mailbox.
struct Frame {
    at: Duration,
    mode: Mode,
    data: Bytes,
}

enum Task {
    Event(Event),
    Frame(Bytes),
    Result {
        source: NodeId,
        message: u32,
        destination: NodeId,
        success: bool,
    },
}

struct Alarm {
    time: Duration,
    sequence: u64,
    partition: PartitionId,
    task: Task,
}

impl PartialEq for Alarm {
    fn eq(&self, other: &Self) -> bool {
        (self.time, self.sequence) == (other.time, other.sequence)
    }
}

impl Eq for Alarm {}

impl PartialOrd for Alarm {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Alarm {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse the ordering for min-heap
        (other.time, other.sequence).cmp(&(self.time, self.sequence))
    }
}

#[derive(Default)]
struct State {
    now: Duration,
    external: Duration,
    seconds_past_hour: f64,

    nodes: BTreeMap<NodeId, PartitionId>,
    mailboxes: Vec<mpsc::UnboundedSender<Frame>>,
    alarms: BinaryHeap<Alarm>,
    sequence: u64,

    latencies: BTreeMap<NodeId, Duration>,
    failing: BTreeSet<NodeId>,
    channels: Vec<Vec<NodeId>>,

    notifications: Vec<(Duration, Notification)>,
    deliveries: Vec<(PartitionId, Delivery)>,
    forwarded: Vec<(PartitionId, PartitionId, Mode)>,
    interfaces: Vec<(NodeId, Duration, bool)>,
    placements: Vec<(NodeId, Duration, Placement)>,
    hierarchies: Vec<(Duration, u32, Geodetic, Orientation)>,
    powers: Vec<(NodeId, f64)>,
}

impl State {
    fn push(&mut self, time: Duration, partition: PartitionId, task: Task) {
        self.sequence += 1;
        self.alarms.push(Alarm {
            time,
            sequence: self.sequence,
            partition,
            task,
        });
    }
}

/// The view of the simulation from one partition.
#[derive(Clone)]
pub struct Context {
    partition: PartitionId,
    state: Arc<Mutex<State>>,
}

impl Clock for Context {
    fn current(&self) -> Duration {
        self.state.lock().unwrap().now
    }

    fn external(&self) -> Duration {
        self.state.lock().unwrap().external
    }

    fn seconds_past_hour(&self) -> f64 {
        self.state.lock().unwrap().seconds_past_hour
    }
}

impl Scheduler for Context {
    fn partition(&self) -> PartitionId {
        self.partition
    }

    fn partition_of(&self, node: NodeId) -> Option<PartitionId> {
        self.state.lock().unwrap().nodes.get(&node).copied()
    }

    fn schedule(&mut self, delay: Duration, event: Event) {
        let mut state = self.state.lock().unwrap();
        let time = state.now + delay;
        state.push(time, self.partition, Task::Event(event));
    }

    fn forward(&mut self, partition: PartitionId, delay: Duration, mode: Mode, envelope: Envelope) {
        let mut state = self.state.lock().unwrap();
        let frame = Frame {
            at: state.now + delay,
            mode,
            data: envelope.encode().freeze(),
        };
        state.forwarded.push((self.partition, partition, mode));
        state.mailboxes[partition as usize]
            .unbounded_send(frame)
            .expect("mailbox closed");
    }
}

impl Nodes for Context {
    fn set_interface(&mut self, node: NodeId, at: Duration, enabled: bool) {
        self.state
            .lock()
            .unwrap()
            .interfaces
            .push((node, at, enabled));
    }

    fn place(&mut self, node: NodeId, at: Duration, placement: Placement) {
        self.state
            .lock()
            .unwrap()
            .placements
            .push((node, at, placement));
    }

    fn move_hierarchy(&mut self, hierarchy: u32, position: Geodetic, orientation: Orientation) {
        let mut state = self.state.lock().unwrap();
        let now = state.now;
        state
            .hierarchies
            .push((now, hierarchy, position, orientation));
    }

    fn set_tx_power(&mut self, node: NodeId, power: f64) {
        self.state.lock().unwrap().powers.push((node, power));
    }
}

impl Federation for Context {
    fn send(&mut self, datum: u32, value: Bytes) {
        let notification = Notification::decode_cfg(value, &datum).expect("invalid datum");
        let mut state = self.state.lock().unwrap();
        let now = state.now;
        state.notifications.push((now, notification));
    }
}

impl Messenger for Context {
    fn deliver(&mut self, delivery: Delivery) {
        let mut state = self.state.lock().unwrap();
        let destinations = match delivery.destination {
            Destination::Node(node) => vec![node],
            Destination::Broadcast => state
                .channels
                .iter()
                .filter(|channel| channel.contains(&delivery.source))
                .flatten()
                .copied()
                .filter(|node| *node != delivery.source)
                .collect(),
        };

        // Nodes without a latency never receive anything
        for destination in destinations {
            let Some(latency) = state.latencies.get(&destination).copied() else {
                continue;
            };
            let partition = state.nodes[&destination];
            let success = !state.failing.contains(&destination);
            let time = state.now + delivery.delay + latency;
            state.push(
                time,
                partition,
                Task::Result {
                    source: delivery.source,
                    message: delivery.message,
                    destination,
                    success,
                },
            );
        }
        state.deliveries.push((self.partition, delivery));
    }
}

/// A simulation of `partitions` partitions running one [Bridge] on partition 0.
pub struct Simulation {
    state: Arc<Mutex<State>>,
    mailboxes: Vec<mpsc::UnboundedReceiver<Frame>>,
    forwarders: Vec<Forwarder>,
}

impl Simulation {
    /// Creates a simulation in which node `n` lives on partition `n % partitions`.
    pub fn new(partitions: u32, nodes: &[NodeId]) -> Self {
        let mut state = State::default();
        let mut mailboxes = Vec::new();
        let mut forwarders = Vec::new();
        let mut registry = Registry::default();
        for partition in 0..partitions {
            let (sender, receiver) = mpsc::unbounded();
            state.mailboxes.push(sender);
            mailboxes.push(receiver);
            let metrics = registry.sub_registry_with_prefix(format!("p{partition}"));
            forwarders.push(Forwarder::new(partition, metrics));
        }
        for node in nodes {
            state.nodes.insert(*node, node % partitions);
        }
        Self {
            state: Arc::new(Mutex::new(state)),
            mailboxes,
            forwarders,
        }
    }

    pub fn context(&self, partition: PartitionId) -> Context {
        Context {
            partition,
            state: self.state.clone(),
        }
    }

    /// Sets the time the federation allows the simulation to advance to.
    pub fn grant(&self, external: Duration) {
        self.state.lock().unwrap().external = external;
    }

    pub fn set_seconds_past_hour(&self, seconds: f64) {
        self.state.lock().unwrap().seconds_past_hour = seconds;
    }

    /// Makes `node` receive every message sent to it after `latency`.
    pub fn connect(&self, node: NodeId, latency: Duration) {
        self.state.lock().unwrap().latencies.insert(node, latency);
    }

    /// Makes every delivery to `node` report a failure.
    pub fn fail(&self, node: NodeId) {
        self.state.lock().unwrap().failing.insert(node);
    }

    /// Places `members` on one channel, reached by each other's broadcasts.
    pub fn channel(&self, members: &[NodeId]) {
        self.state.lock().unwrap().channels.push(members.to_vec());
    }

    pub fn now(&self) -> Duration {
        self.state.lock().unwrap().now
    }

    pub fn notifications(&self) -> Vec<(Duration, Notification)> {
        self.state.lock().unwrap().notifications.clone()
    }

    pub fn deliveries(&self) -> Vec<(PartitionId, Delivery)> {
        self.state.lock().unwrap().deliveries.clone()
    }

    pub fn forwarded(&self) -> Vec<(PartitionId, PartitionId, Mode)> {
        self.state.lock().unwrap().forwarded.clone()
    }

    pub fn interfaces(&self) -> Vec<(NodeId, Duration, bool)> {
        self.state.lock().unwrap().interfaces.clone()
    }

    pub fn placements(&self) -> Vec<(NodeId, Duration, Placement)> {
        self.state.lock().unwrap().placements.clone()
    }

    pub fn hierarchies(&self) -> Vec<(Duration, u32, Geodetic, Orientation)> {
        self.state.lock().unwrap().hierarchies.clone()
    }

    pub fn powers(&self) -> Vec<(NodeId, f64)> {
        self.state.lock().unwrap().powers.clone()
    }

    /// Moves frames from the mailboxes into the alarm heap.
    fn collect(&mut self) {
        let mut state = self.state.lock().unwrap();
        for (partition, mailbox) in self.mailboxes.iter_mut().enumerate() {
            while let Ok(Some(frame)) = mailbox.try_next() {
                // Safe frames are never handled before their send time
                let time = match frame.mode {
                    Mode::Safe => frame.at.max(state.now),
                    Mode::Loose => frame.at,
                };
                state.push(time, partition as PartitionId, Task::Frame(frame.data));
            }
        }
    }

    /// Runs every alarm due no later than `deadline`, then advances the clock to it.
    pub fn run_until(&mut self, bridge: &mut Bridge, deadline: Duration) -> Result<(), Error> {
        loop {
            self.collect();
            let alarm = {
                let mut state = self.state.lock().unwrap();
                let due = state
                    .alarms
                    .peek()
                    .is_some_and(|alarm| alarm.time <= deadline);
                if !due {
                    state.now = state.now.max(deadline);
                    return Ok(());
                }
                let alarm = state.alarms.pop().unwrap();
                state.now = state.now.max(alarm.time);
                alarm
            };
            self.dispatch(bridge, alarm)?;
        }
    }

    fn dispatch(&mut self, bridge: &mut Bridge, alarm: Alarm) -> Result<(), Error> {
        let mut ctx = self.context(alarm.partition);
        let federation = alarm.partition == FEDERATION_PARTITION;
        match alarm.task {
            Task::Event(event) => bridge.on_event(&mut ctx, event),
            Task::Frame(data) if federation => bridge.on_frame(&mut ctx, data),
            Task::Frame(data) => {
                let forwarder = &self.forwarders[alarm.partition as usize];
                match forwarder.receive(&mut ctx, data)? {
                    Some(envelope) => panic!("unexpected envelope: {envelope:?}"),
                    None => Ok(()),
                }
            }
            Task::Result {
                source,
                message,
                destination,
                success,
            } => {
                let forwarder = if federation {
                    bridge.forwarder()
                } else {
                    &self.forwarders[alarm.partition as usize]
                };
                match forwarder.delivered(&mut ctx, source, message, destination, success) {
                    Some(envelope) => bridge.on_envelope(&mut ctx, envelope),
                    None => Ok(()),
                }
            }
        }
    }
}
