use super::{EntityHandle, NetworkHandle, RadioHandle};
use crate::{
    geo::{Geodetic, Vector},
    types::{LinkClass, NodeId, TxStatus},
};
use rand::{rngs::StdRng, SeedableRng};

/// Transmit power of a radio, in milliwatts.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TxPower {
    pub max: f64,
    pub current: f64,
}

impl TxPower {
    pub fn new(max: f64) -> Self {
        Self { max, current: max }
    }

    /// Radios without a physical layer report no power and are never adjusted.
    pub fn in_use(&self) -> bool {
        self.max > 0.0
    }
}

/// A radio carried by an entity and simulated by exactly one node.
#[derive(Clone, Debug)]
pub struct Radio {
    pub(crate) entity: EntityHandle,
    pub(crate) node: NodeId,
    pub(crate) index: u16,
    pub(crate) network: Option<NetworkHandle>,
    pub(crate) tx: TxStatus,
    pub(crate) relative: Vector,
    pub(crate) scheduled: Geodetic,
    pub(crate) default_destination: Option<RadioHandle>,
    pub(crate) power: TxPower,
    pub(crate) link: LinkClass,
    pub(crate) rx_rate: f64,
    pub(crate) rng: StdRng,
}

impl Radio {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        seed: u64,
        entity: EntityHandle,
        node: NodeId,
        index: u16,
        relative: Vector,
        scheduled: Geodetic,
        power: f64,
        link: LinkClass,
        rx_rate: f64,
    ) -> Self {
        Self {
            entity,
            node,
            index,
            network: None,
            tx: TxStatus::OnNotTransmitting,
            relative,
            scheduled,
            default_destination: None,
            power: TxPower::new(power),
            link,
            rx_rate,
            rng: StdRng::seed_from_u64(stream(seed, node)),
        }
    }

    pub fn entity(&self) -> EntityHandle {
        self.entity
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn network(&self) -> Option<NetworkHandle> {
        self.network
    }

    pub fn tx(&self) -> TxStatus {
        self.tx
    }

    pub fn relative_position(&self) -> Vector {
        self.relative
    }

    /// Last geodetic position handed to the simulation.
    pub fn scheduled(&self) -> Geodetic {
        self.scheduled
    }

    pub fn default_destination(&self) -> Option<RadioHandle> {
        self.default_destination
    }

    pub fn power(&self) -> TxPower {
        self.power
    }

    pub fn link(&self) -> LinkClass {
        self.link
    }

    pub fn rx_rate(&self) -> f64 {
        self.rx_rate
    }
}

/// Derives the seed of a radio's random stream so that each node draws
/// independently of the others.
fn stream(seed: u64, node: NodeId) -> u64 {
    seed.rotate_left(32) ^ u64::from(node).wrapping_mul(0x9e37_79b9_7f4a_7c15)
}
