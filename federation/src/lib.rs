//! Bridge a partitioned discrete-event simulation to an external simulation federation.
//!
//! The bridge mirrors federation entities and radios onto local simulation nodes, turns
//! communication requests from other federates into simulated message deliveries, and
//! reports the outcome of each delivery (success or timeout) back to the federation.
//!
//! # Partitions
//!
//! The local simulation may be split into partitions that share no memory. Only
//! partition 0 holds the federation connection (and the [bridge::Bridge]). Work that
//! must run elsewhere (starting a delivery on the source node's partition) or that must
//! reach the federation from elsewhere (delivery results) travels in
//! [forwarder::Envelope]s. Each partition runs a [forwarder::Forwarder] to decode and
//! route them.
//!
//! # Collaborators
//!
//! The bridge never reaches for global state. Every operation receives a context that
//! implements the collaborator traits defined here ([Clock], [Scheduler], [Nodes],
//! [Federation], and [Messenger]). The `mocks` module provides a deterministic,
//! multi-partition implementation for tests.
//!
//! # Errors
//!
//! Conditions that indicate a defective configuration or corrupted state are returned
//! as [Error] and are fatal. Conditions caused by a single bad request or update
//! ([Warning]) are logged and the input is dropped.
//!
//! # Status
//!
//! `commonware-federation` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

#![doc(
    html_logo_url = "https://commonware.xyz/imgs/rustdoc_logo.svg",
    html_favicon_url = "https://commonware.xyz/favicon.ico"
)]

use bytes::Bytes;
use commonware_codec::Encode;
use std::{path::PathBuf, time::Duration};
use thiserror::Error;

pub mod bridge;
pub mod config;
pub mod damage;
pub mod forwarder;
pub mod geo;
pub mod mobility;
pub mod notification;
pub mod reflector;
pub mod registry;
pub mod request;
pub mod tracker;
pub mod types;

#[cfg(test)]
pub mod mocks;

use bridge::Event;
use forwarder::{Envelope, Mode};
use geo::{Geodetic, Orientation};
use mobility::Placement;
use notification::Notification;
use request::Delivery;
use types::{EntityId, NodeId, PartitionId, RadioKey};

/// Fatal errors. Any of these aborts the bridge.
#[derive(Error, Debug)]
pub enum Error {
    #[error("missing parameter: {0}")]
    MissingParameter(&'static str),
    #[error("invalid parameter {0}: {1}")]
    InvalidParameter(&'static str, String),
    #[error("unable to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("duplicate entity marking: {0}")]
    DuplicateMarking(String),
    #[error("entity not found for radio: {0}")]
    EntityNotFound(String),
    #[error("duplicate radio for node: {0}")]
    DuplicateNode(NodeId),
    #[error("network has no members: {0}")]
    EmptyNetwork(String),
    #[error("network has too many members: {0}")]
    NetworkTooLarge(String),
    #[error("network member has no radio: {0}")]
    UnknownMember(NodeId),
    #[error("node already belongs to a network: {0}")]
    DuplicateMembership(NodeId),
    #[error("default destination already set: {0}")]
    DuplicateDefaultDestination(NodeId),
    #[error("can't determine default destination: {0}")]
    NoDefaultDestination(NodeId),
    #[error("entity already reflected: {0}")]
    DuplicateReflectedEntity(EntityId),
    #[error("radio already reflected: {0}")]
    DuplicateReflectedRadio(RadioKey),
    #[error("invalid damage state: {0}")]
    InvalidDamageState(u8),
    #[error("invalid coordinates: {0:?}")]
    InvalidCoordinates(Geodetic),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(f64),
    #[error("maximum message id reached: {0}")]
    MessageIdExhausted(NodeId),
    #[error("too many destinations: {0}")]
    TooManyDestinations(usize),
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),
    #[error("envelope received outside the federation partition: {0}")]
    MisroutedEnvelope(PartitionId),
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(#[from] commonware_codec::Error),
}

/// Recoverable conditions. The offending request or update is dropped.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Warning {
    #[error("radio not mapped to a node: {0}")]
    UnmappedRadio(RadioKey),
    #[error("radio not found for the reflected entity: {0}")]
    RadioNotFound(RadioKey),
    #[error("sample rate is 0 for a standard radio")]
    ZeroSampleRate,
    #[error("malformed header: {0}")]
    MalformedHeader(&'static str),
    #[error("can't map receiver to entity: {0}")]
    UnknownReceiver(EntityId),
    #[error("source and destination entities cannot be same")]
    SelfDestination,
    #[error("can't find associated network")]
    NoNetwork,
    #[error("destination is not in same network: {0}")]
    NotInNetwork(EntityId),
    #[error("ignoring broadcast to network with no potential receivers")]
    NoReceivers,
    #[error("world location outside terrain: {0:?}")]
    OutsideTerrain(Geodetic),
}

/// Time on the local simulation clock.
pub trait Clock {
    /// Returns the current simulation time of this partition.
    fn current(&self) -> Duration;

    /// Returns the time up to which the federation has allowed the simulation to advance.
    fn external(&self) -> Duration;

    /// Returns the (wall-clock) number of seconds past the current hour, used to stamp
    /// notifications.
    fn seconds_past_hour(&self) -> f64;
}

/// Scheduling of local timers and cross-partition envelopes.
pub trait Scheduler: Clock {
    /// Returns the partition this context runs on.
    fn partition(&self) -> PartitionId;

    /// Returns the partition that owns `node`, if the node exists.
    fn partition_of(&self, node: NodeId) -> Option<PartitionId>;

    /// Schedules `event` on this partition after `delay`.
    fn schedule(&mut self, delay: Duration, event: Event);

    /// Sends `envelope` to `partition`, to be handled after `delay`.
    fn forward(&mut self, partition: PartitionId, delay: Duration, mode: Mode, envelope: Envelope);
}

/// Primitives that act on simulation nodes.
///
/// The simulator is responsible for applying changes to nodes that live on other
/// partitions.
pub trait Nodes {
    /// Enables or disables the interfaces of `node` at time `at`.
    fn set_interface(&mut self, node: NodeId, at: Duration, enabled: bool);

    /// Moves `node` at time `at`.
    fn place(&mut self, node: NodeId, at: Duration, placement: Placement);

    /// Moves a display hierarchy now.
    fn move_hierarchy(&mut self, hierarchy: u32, position: Geodetic, orientation: Orientation);

    /// Sets the maximum transmit power (mW) of the first physical layer of `node`.
    fn set_tx_power(&mut self, node: NodeId, power: f64);
}

/// Outbound connection to the federation.
pub trait Federation {
    /// Sends the encoded `value` of datum `datum` to the federation.
    fn send(&mut self, datum: u32, value: Bytes);

    /// Encodes `notification` and sends it.
    fn notify(&mut self, notification: Notification) {
        self.send(notification.datum(), notification.encode().freeze());
    }
}

/// Simulated delivery of messages between nodes.
///
/// Results are reported, per destination node, to the [forwarder::Forwarder] of the
/// destination's partition.
pub trait Messenger {
    /// Starts simulating `delivery`.
    fn deliver(&mut self, delivery: Delivery);
}
