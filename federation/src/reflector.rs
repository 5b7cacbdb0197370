//! Reflection of federation objects onto the [Registry].
//!
//! The federation reports entities and radios as they are discovered, updated, and
//! removed. Entities are matched to the registry by marking and radios by their host
//! entity and radio index. Radios reported before their entity are held, per entity,
//! until the entity is discovered.

use crate::{
    config::{Config, Terrain},
    damage::{self, Reactor},
    geo::{Geodetic, Orientation, TaitBryan, Vector},
    mobility::Gate,
    registry::{EntityHandle, RadioHandle, Registry},
    types::{DamageState, Domain, EntityId, Force, Protocol, RadioKey, TxStatus},
    Error, Nodes, Scheduler, Warning,
};
use prometheus_client::{metrics::counter::Counter, registry::Registry as Metrics};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Attributes of an entity, as reported by the federation.
#[derive(Clone, Debug, PartialEq)]
pub struct EntityState {
    pub id: EntityId,
    pub marking: String,
    /// Raw damage value (see [Protocol::decode_damage]).
    pub damage: u8,
    /// Geocentric location (meters).
    pub location: Vector,
    /// Geocentric velocity (meters per second).
    pub velocity: Vector,
    pub orientation: TaitBryan,
    /// Raw force identifier.
    pub force: u8,
    /// Raw entity-type domain.
    pub domain: u8,
}

/// Attributes of a radio transmitter, as reported by the federation.
#[derive(Clone, Debug, PartialEq)]
pub struct RadioState {
    /// Entity hosting the radio.
    pub entity: EntityId,
    pub index: u16,
    /// Global object identifier (HLA).
    pub object: String,
    pub tx: TxStatus,
}

/// Federation objects currently reflected onto local objects.
pub struct Reflector {
    protocol: Protocol,
    gateway_compatibility: bool,
    terrain: Terrain,
    gate: Gate,
    reactor: Reactor,

    registry: Registry,
    entities: HashMap<EntityId, EntityHandle>,
    radios: HashMap<RadioKey, RadioHandle>,
    pending: HashMap<EntityId, Vec<RadioState>>,

    dropped: Counter,
    mobility_events: Counter,
    tx_power_changes: Counter,
}

impl Reflector {
    /// Creates a reflector over `registry`.
    ///
    /// Updates that are dropped are counted in `dropped`.
    pub fn new(config: &Config, registry: Registry, metrics: &mut Metrics, dropped: Counter) -> Self {
        let mobility_events = Counter::default();
        let tx_power_changes = Counter::default();
        metrics.register(
            "mobility_events",
            "entity mobility events scheduled",
            mobility_events.clone(),
        );
        metrics.register(
            "tx_power_changes",
            "radio transmit power changes",
            tx_power_changes.clone(),
        );
        Self {
            protocol: config.protocol,
            gateway_compatibility: config.nawc_gateway_compatibility,
            terrain: config.terrain,
            gate: Gate::new(config.mobility_interval(), config.xyz_epsilon, config.gui),
            reactor: Reactor::new(config.damage),
            registry,
            entities: HashMap::new(),
            radios: HashMap::new(),
            pending: HashMap::new(),
            dropped,
            mobility_events,
            tx_power_changes,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn find_entity(&self, id: &EntityId) -> Option<EntityHandle> {
        self.entities.get(id).copied()
    }

    pub fn find_radio_by_federation_id(&self, key: &RadioKey) -> Option<RadioHandle> {
        self.radios.get(key).copied()
    }

    /// Returns the radios waiting for `entity` to be discovered.
    pub fn pending(&self, entity: &EntityId) -> &[RadioState] {
        self.pending.get(entity).map(Vec::as_slice).unwrap_or_default()
    }

    /// Handles the discovery of an entity.
    ///
    /// Returns the radios that became reflected because they were waiting for it.
    pub fn discover_entity<E: Scheduler + Nodes>(
        &mut self,
        ctx: &mut E,
        state: &EntityState,
    ) -> Result<Vec<RadioHandle>, Error> {
        let Some(handle) = self.registry.find_entity_by_marking(&state.marking) else {
            debug!(id = %state.id, marking = %state.marking, "ignoring foreign entity");
            return Ok(Vec::new());
        };
        if self.entities.contains_key(&state.id) {
            return Err(Error::DuplicateReflectedEntity(state.id));
        }
        self.registry.entity_mut(handle).set_id(state.id);
        self.entities.insert(state.id, handle);
        debug!(id = %state.id, marking = %state.marking, "reflecting entity");
        self.reflect(ctx, handle, state)?;

        // Replay radios that arrived first
        let mut reflected = Vec::new();
        for radio in self.pending.remove(&state.id).unwrap_or_default() {
            if let Some(radio) = self.reflect_radio(ctx, handle, radio)? {
                reflected.push(radio);
            }
        }
        Ok(reflected)
    }

    /// Handles new attributes of a reflected entity.
    pub fn update_entity<E: Scheduler + Nodes>(
        &mut self,
        ctx: &mut E,
        state: &EntityState,
    ) -> Result<(), Error> {
        let Some(handle) = self.find_entity(&state.id) else {
            return Ok(());
        };
        self.reflect(ctx, handle, state)
    }

    /// Handles the removal of an entity.
    ///
    /// The local entity is kept (destroyed, with every radio off) so that it can be
    /// discovered again.
    pub fn remove_entity(&mut self, id: &EntityId) {
        let Some(handle) = self.entities.remove(id) else {
            return;
        };
        let entity = self.registry.entity_mut(handle);
        entity.damage = DamageState::Destroyed;
        let radios: Vec<_> = entity.radios().collect();
        for radio in &radios {
            self.registry.radio_mut(*radio).tx = TxStatus::Off;
        }
        self.radios.retain(|_, radio| !radios.contains(radio));
        self.registry.unmap_entity(id);
        debug!(%id, "removed entity");
    }

    /// Handles the discovery of a radio.
    ///
    /// Returns the radio if it was reflected immediately.
    pub fn discover_radio<E: Scheduler + Nodes>(
        &mut self,
        ctx: &mut E,
        state: &RadioState,
    ) -> Result<Option<RadioHandle>, Error> {
        let key = self.key(state);
        let waiting = self
            .pending
            .get(&state.entity)
            .is_some_and(|pending| pending.iter().any(|radio| self.key(radio) == key));
        if self.radios.contains_key(&key) || waiting {
            return Err(Error::DuplicateReflectedRadio(key));
        }
        match self.find_entity(&state.entity) {
            Some(entity) => self.reflect_radio(ctx, entity, state.clone()),
            None => {
                debug!(%key, "deferring radio until entity is discovered");
                self.pending
                    .entry(state.entity)
                    .or_default()
                    .push(state.clone());
                Ok(None)
            }
        }
    }

    /// Handles a new transmit status of a radio.
    pub fn update_radio<E: Scheduler + Nodes>(&mut self, ctx: &mut E, state: &RadioState) {
        let key = self.key(state);
        if let Some(radio) = self.find_radio_by_federation_id(&key) {
            self.reflect_tx(ctx, radio, state.tx);
            return;
        }
        let protocol = self.protocol;
        if let Some(waiting) = self.pending.get_mut(&state.entity).and_then(|pending| {
            pending
                .iter_mut()
                .find(|radio| protocol.radio_key(radio.entity, radio.index, &radio.object) == key)
        }) {
            waiting.tx = state.tx;
        }
    }

    /// Handles the removal of a radio.
    pub fn remove_radio<E: Scheduler + Nodes>(&mut self, ctx: &mut E, state: &RadioState) {
        let key = self.key(state);
        let Some(radio) = self.radios.remove(&key) else {
            let protocol = self.protocol;
            if let Some(pending) = self.pending.get_mut(&state.entity) {
                pending.retain(|radio| {
                    protocol.radio_key(radio.entity, radio.index, &radio.object) != key
                });
            }
            return;
        };

        // Turning the radio off still deactivates its interface
        self.reflect_tx(ctx, radio, TxStatus::Off);
        let radio = self.registry.radio(radio);
        let node = radio.node();
        if let Some(id) = self.registry.entity(radio.entity()).id() {
            self.registry.unmap_node(&id, node);
        }
        debug!(%key, node, "removed radio");
    }

    /// Applies a transmit power change scheduled by a damage transition.
    pub fn change_max_tx_power<E: Nodes>(
        &mut self,
        ctx: &mut E,
        entity: EntityHandle,
        damage: DamageState,
    ) {
        let changed = self
            .reactor
            .change_max_tx_power(ctx, &mut self.registry, entity, damage);
        self.tx_power_changes.inc_by(changed as u64);
    }

    fn key(&self, state: &RadioState) -> RadioKey {
        self.protocol
            .radio_key(state.entity, state.index, &state.object)
    }

    fn drop_update(&self, warning: Warning) {
        warn!(%warning, "dropping update");
        self.dropped.inc();
    }

    fn reflect_radio<E: Scheduler + Nodes>(
        &mut self,
        ctx: &mut E,
        entity: EntityHandle,
        state: RadioState,
    ) -> Result<Option<RadioHandle>, Error> {
        let key = self.key(&state);
        let Some(radio) = self.registry.find_radio_by_entity_and_index(entity, state.index) else {
            self.drop_update(Warning::RadioNotFound(key));
            return Ok(None);
        };
        if self.radios.values().any(|mapped| *mapped == radio) {
            return Err(Error::DuplicateReflectedRadio(key));
        }
        self.radios.insert(key.clone(), radio);
        self.reflect_tx(ctx, radio, state.tx);
        let node = self.registry.radio(radio).node();
        if let Some(id) = self.registry.entity(entity).id() {
            self.registry.map_node(id, node);
        }
        debug!(%key, node, "reflecting radio");
        Ok(Some(radio))
    }

    fn reflect_tx<E: Scheduler + Nodes>(&mut self, ctx: &mut E, handle: RadioHandle, tx: TxStatus) {
        let radio = self.registry.radio(handle);
        let old = radio.tx();
        if old == tx {
            return;
        }
        let node = radio.node();
        let destroyed = self.registry.entity(radio.entity()).damage() == DamageState::Destroyed;
        debug!(node, ?old, new = ?tx, "transmit status changed");
        if old.is_on() != tx.is_on() && !destroyed {
            damage::set_interface(ctx, node, tx.is_on());
        }
        self.registry.radio_mut(handle).tx = tx;
    }

    fn reflect<E: Scheduler + Nodes>(
        &mut self,
        ctx: &mut E,
        handle: EntityHandle,
        state: &EntityState,
    ) -> Result<(), Error> {
        // Damage
        let damage = damage::decode(self.protocol, state.damage, self.gateway_compatibility)?;
        self.reactor.reflect(ctx, &mut self.registry, handle, damage);

        let mut possible = false;

        // Velocity
        let entity = self.registry.entity_mut(handle);
        if entity.velocity != state.velocity {
            entity.velocity = state.velocity;
            entity.speed = state.velocity.magnitude();
            possible = true;
        }

        // World location
        if entity.position != state.location {
            let geodetic = Geodetic::from_geocentric(&state.location);
            if !geodetic.is_valid() {
                return Err(Error::InvalidCoordinates(geodetic));
            }
            if self.terrain.contains(&geodetic) {
                entity.position = state.location;
                entity.geodetic = geodetic;
                possible = true;
            } else {
                self.drop_update(Warning::OutsideTerrain(geodetic));
            }
        }

        // Orientation
        let entity = self.registry.entity_mut(handle);
        if entity.attitude != state.orientation {
            entity.attitude = state.orientation;
            entity.orientation = Orientation::from_tait_bryan(&entity.geodetic, &state.orientation);
            possible = true;
        }

        // Force and domain
        let force = Force::from_raw(state.force);
        if entity.force != force {
            debug!(entity = %state.id, force = %force.code(), "force changed");
            entity.force = force;
        }
        entity.domain = Domain::from_raw(state.domain);

        if possible && self.gate.schedule(ctx, &mut self.registry, handle)? {
            self.mobility_events.inc();
        }
        Ok(())
    }
}
