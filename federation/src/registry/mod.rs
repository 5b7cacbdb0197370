//! Static entities, radios, and networks, and the maps used to find them.
//!
//! Records are registered once, before the federation connection opens, and are never
//! deleted. Objects refer to each other through handles into the registry's arenas.

use crate::{
    config::{EntityRecord, NetworkRecord, RadioRecord, Records},
    geo::Geodetic,
    notification::MAX_NETWORK_MEMBERS,
    types::{EntityId, NodeId},
    Error,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

mod entity;
mod network;
mod radio;

pub use entity::{Entity, Shadow};
pub use network::Network;
pub use radio::{Radio, TxPower};

/// Handle to an [Entity] held by a [Registry].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityHandle(usize);

#[cfg(test)]
impl EntityHandle {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }
}

/// Handle to a [Radio] held by a [Registry].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RadioHandle(usize);

/// Handle to a [Network] held by a [Registry].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NetworkHandle(usize);

/// Owner of all static objects.
pub struct Registry {
    seed: u64,

    entities: Vec<Entity>,
    radios: Vec<Radio>,
    networks: Vec<Network>,

    by_marking: HashMap<String, EntityHandle>,
    by_node: BTreeMap<NodeId, RadioHandle>,
    entity_nodes: BTreeMap<EntityId, BTreeSet<NodeId>>,
}

impl Registry {
    /// Creates an empty registry. `seed` initializes the random stream of each radio.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            entities: Vec::new(),
            radios: Vec::new(),
            networks: Vec::new(),
            by_marking: HashMap::new(),
            by_node: BTreeMap::new(),
            entity_nodes: BTreeMap::new(),
        }
    }

    /// Creates a registry holding all `records`.
    pub fn load(seed: u64, records: &Records) -> Result<Self, Error> {
        let mut registry = Self::new(seed);
        for record in &records.entities {
            registry.register_entity(record)?;
        }
        for record in &records.radios {
            registry.register_radio(record)?;
        }
        for record in &records.networks {
            registry.register_network(record)?;
        }
        Ok(registry)
    }

    pub fn register_entity(&mut self, record: &EntityRecord) -> Result<EntityHandle, Error> {
        if self.by_marking.contains_key(&record.marking) {
            return Err(Error::DuplicateMarking(record.marking.clone()));
        }
        let handle = EntityHandle(self.entities.len());
        self.entities.push(Entity::new(record)?);
        self.by_marking.insert(record.marking.clone(), handle);
        Ok(handle)
    }

    pub fn register_radio(&mut self, record: &RadioRecord) -> Result<RadioHandle, Error> {
        let entity = self
            .find_entity_by_marking(&record.marking)
            .ok_or_else(|| Error::EntityNotFound(record.marking.clone()))?;
        if self.by_node.contains_key(&record.node) {
            return Err(Error::DuplicateNode(record.node));
        }

        let position = self.entity(entity).position + record.relative_position;
        let scheduled = Geodetic::from_geocentric(&position);
        if !scheduled.is_valid() {
            return Err(Error::InvalidCoordinates(scheduled));
        }

        let handle = RadioHandle(self.radios.len());
        self.radios.push(radio::Radio::new(
            self.seed,
            entity,
            record.node,
            record.index,
            record.relative_position,
            scheduled,
            record.tx_power,
            record.link,
            record.rx_rate,
        ));
        self.by_node.insert(record.node, handle);

        let radios = &mut self.entities[entity.0].radios;
        if radios.contains_key(&record.index) {
            warn!(
                marking = %record.marking,
                index = record.index,
                node = record.node,
                "duplicate radio index"
            );
        } else {
            radios.insert(record.index, handle);
        }
        Ok(handle)
    }

    pub fn register_network(&mut self, record: &NetworkRecord) -> Result<NetworkHandle, Error> {
        if record.members.is_empty() {
            return Err(Error::EmptyNetwork(record.name.clone()));
        }
        if record.members.len() > MAX_NETWORK_MEMBERS {
            return Err(Error::NetworkTooLarge(record.name.clone()));
        }

        // Resolve and claim members
        let handle = NetworkHandle(self.networks.len());
        let mut members = Vec::with_capacity(record.members.len());
        for node in &record.members {
            let radio = self
                .radio_by_node(*node)
                .ok_or(Error::UnknownMember(*node))?;
            if self.radios[radio.0].network.is_some() {
                return Err(Error::DuplicateMembership(*node));
            }
            self.radios[radio.0].network = Some(handle);
            members.push(radio);
        }
        let network = Network {
            name: record.name.clone(),
            frequency: record.frequency,
            address: record.address,
            members,
        };

        // Unicast members send to the first other member on a different node
        if network.is_unicast() {
            for member in &network.members {
                let node = self.radios[member.0].node;
                let default = network
                    .members
                    .iter()
                    .copied()
                    .find(|other| self.radios[other.0].node != node)
                    .ok_or(Error::NoDefaultDestination(node))?;
                let radio = &mut self.radios[member.0];
                if radio.default_destination.is_some() {
                    return Err(Error::DuplicateDefaultDestination(node));
                }
                radio.default_destination = Some(default);
            }
        }
        debug!(
            name = %network.name,
            members = network.members.len(),
            unicast = network.is_unicast(),
            "registered network"
        );
        self.networks.push(network);
        Ok(handle)
    }

    /// Gives every node in `nodes` without a configured radio a synthetic entity
    /// (and a radio with index 0) so that it can be addressed as a receiver.
    pub fn assign_synthetic_ids(
        &mut self,
        nodes: impl IntoIterator<Item = NodeId>,
        site: u16,
        application: u16,
    ) {
        for node in nodes {
            if self.by_node.contains_key(&node) {
                continue;
            }
            let id = synthetic_id(node, site, application);
            let entity = EntityHandle(self.entities.len());
            let mut synthetic = Entity::synthetic(id, node);
            let handle = RadioHandle(self.radios.len());
            synthetic.radios.insert(0, handle);
            self.entities.push(synthetic);
            self.radios.push(radio::Radio::new(
                self.seed,
                entity,
                node,
                0,
                Default::default(),
                Geodetic::default(),
                0.0,
                Default::default(),
                0.0,
            ));
            self.by_node.insert(node, handle);
            self.map_node(id, node);
            debug!(node, %id, "assigned synthetic id");
        }
    }

    pub fn find_entity_by_marking(&self, marking: &str) -> Option<EntityHandle> {
        self.by_marking.get(marking).copied()
    }

    pub fn find_radio_by_entity_and_index(
        &self,
        entity: EntityHandle,
        index: u16,
    ) -> Option<RadioHandle> {
        self.entities.get(entity.0)?.radios.get(&index).copied()
    }

    /// Returns the nodes that currently represent `id`, in ascending order.
    pub fn nodes_for_entity(&self, id: &EntityId) -> impl Iterator<Item = NodeId> + '_ {
        self.entity_nodes.get(id).into_iter().flatten().copied()
    }

    pub fn is_mapped(&self, id: &EntityId) -> bool {
        self.entity_nodes.contains_key(id)
    }

    pub fn radio_by_node(&self, node: NodeId) -> Option<RadioHandle> {
        self.by_node.get(&node).copied()
    }

    pub(crate) fn map_node(&mut self, id: EntityId, node: NodeId) {
        self.entity_nodes.entry(id).or_default().insert(node);
    }

    pub(crate) fn unmap_node(&mut self, id: &EntityId, node: NodeId) {
        if let Some(nodes) = self.entity_nodes.get_mut(id) {
            nodes.remove(&node);
            if nodes.is_empty() {
                self.entity_nodes.remove(id);
            }
        }
    }

    pub(crate) fn unmap_entity(&mut self, id: &EntityId) {
        self.entity_nodes.remove(id);
    }

    pub fn entity(&self, handle: EntityHandle) -> &Entity {
        &self.entities[handle.0]
    }

    pub(crate) fn entity_mut(&mut self, handle: EntityHandle) -> &mut Entity {
        &mut self.entities[handle.0]
    }

    pub fn radio(&self, handle: RadioHandle) -> &Radio {
        &self.radios[handle.0]
    }

    pub(crate) fn radio_mut(&mut self, handle: RadioHandle) -> &mut Radio {
        &mut self.radios[handle.0]
    }

    pub fn network(&self, handle: NetworkHandle) -> &Network {
        &self.networks[handle.0]
    }

    /// Returns the network of `radio`, if it belongs to one.
    pub fn network_of(&self, radio: RadioHandle) -> Option<&Network> {
        self.radio(radio).network.map(|network| self.network(network))
    }

    /// Returns every radio, ordered by node.
    pub fn radios(&self) -> impl Iterator<Item = RadioHandle> + '_ {
        self.by_node.values().copied()
    }
}

/// Identity given to a node without a configured radio.
pub fn synthetic_id(node: NodeId, site: u16, application: u16) -> EntityId {
    EntityId::new(
        site,
        ((u32::from(application) + (node >> 16)) & 0xffff) as u16,
        (node & 0xffff) as u16,
    )
}
