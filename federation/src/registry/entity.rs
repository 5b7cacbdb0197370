use super::RadioHandle;
use crate::{
    config::EntityRecord,
    geo::{Geodetic, Orientation, TaitBryan, Vector},
    types::{DamageState, Domain, EntityId, Force},
    Error,
};
use std::{collections::BTreeMap, time::Duration};

/// Last values handed to the simulation for an entity.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Shadow {
    pub position: Vector,
    pub geodetic: Geodetic,
    pub orientation: Orientation,
    pub velocity: Vector,
}

/// An entity the local simulation represents in the federation.
#[derive(Clone, Debug)]
pub struct Entity {
    pub(crate) id: Option<EntityId>,
    pub(crate) marking: String,
    pub(crate) nationality: String,
    pub(crate) force: Force,
    pub(crate) domain: Domain,
    pub(crate) damage: DamageState,
    pub(crate) position: Vector,
    pub(crate) geodetic: Geodetic,
    pub(crate) velocity: Vector,
    pub(crate) speed: f64,
    pub(crate) attitude: TaitBryan,
    pub(crate) orientation: Orientation,
    pub(crate) hierarchy: Option<u32>,
    pub(crate) last_scheduled: Option<Duration>,
    pub(crate) scheduled: Shadow,
    pub(crate) radios: BTreeMap<u16, RadioHandle>,
}

impl Entity {
    pub(super) fn new(record: &EntityRecord) -> Result<Self, Error> {
        if !record.position.is_valid() {
            return Err(Error::InvalidCoordinates(record.position));
        }
        let position = record.position.to_geocentric();
        Ok(Self {
            id: None,
            marking: record.marking.clone(),
            nationality: record.nationality.clone(),
            force: record.force,
            domain: Domain::default(),
            damage: DamageState::None,
            position,
            geodetic: record.position,
            velocity: Vector::default(),
            speed: 0.0,
            attitude: TaitBryan::default(),
            orientation: Orientation::default(),
            hierarchy: record.hierarchy,
            last_scheduled: None,
            scheduled: Shadow {
                position,
                geodetic: record.position,
                orientation: Orientation::default(),
                velocity: Vector::default(),
            },
            radios: BTreeMap::new(),
        })
    }

    /// Creates an entity standing in for a node that has no configured radio.
    pub(super) fn synthetic(id: EntityId, node: u32) -> Self {
        Self {
            id: Some(id),
            marking: format!("node-{node}"),
            nationality: String::new(),
            force: Force::default(),
            domain: Domain::default(),
            damage: DamageState::None,
            position: Vector::default(),
            geodetic: Geodetic::default(),
            velocity: Vector::default(),
            speed: 0.0,
            attitude: TaitBryan::default(),
            orientation: Orientation::default(),
            hierarchy: None,
            last_scheduled: None,
            scheduled: Shadow::default(),
            radios: BTreeMap::new(),
        }
    }

    /// Records the federation identity. Returns false (and keeps the existing
    /// identity) if one was already set.
    pub(crate) fn set_id(&mut self, id: EntityId) -> bool {
        if self.id.is_some() {
            return false;
        }
        self.id = Some(id);
        true
    }

    pub fn id(&self) -> Option<EntityId> {
        self.id
    }

    pub fn marking(&self) -> &str {
        &self.marking
    }

    pub fn nationality(&self) -> &str {
        &self.nationality
    }

    pub fn force(&self) -> Force {
        self.force
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn damage(&self) -> DamageState {
        self.damage
    }

    pub fn position(&self) -> Vector {
        self.position
    }

    pub fn geodetic(&self) -> Geodetic {
        self.geodetic
    }

    pub fn velocity(&self) -> Vector {
        self.velocity
    }

    /// Magnitude of the last reflected velocity (meters per second).
    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn hierarchy(&self) -> Option<u32> {
        self.hierarchy
    }

    pub fn last_scheduled(&self) -> Option<Duration> {
        self.last_scheduled
    }

    pub fn scheduled(&self) -> &Shadow {
        &self.scheduled
    }

    /// Returns the radios of this entity, ordered by radio index.
    pub fn radios(&self) -> impl Iterator<Item = RadioHandle> + '_ {
        self.radios.values().copied()
    }

    pub fn has_radios(&self) -> bool {
        !self.radios.is_empty()
    }
}
