//! Decides when a change in an entity's position, orientation, or velocity is
//! handed to the simulation.
//!
//! Federates report entity state far more often than the simulation needs it. The
//! [Gate] limits each entity to one mobility event per interval and ignores
//! displacements below a threshold.

use crate::{
    bridge::Event,
    geo::{Geodetic, Orientation},
    registry::{EntityHandle, Registry},
    Error, Nodes, Scheduler,
};
use std::time::Duration;
use tracing::debug;

/// Smallest step of the simulation clock.
const TICK: Duration = Duration::from_nanos(1);

/// Where a node is, where it faces, and how fast (degrees and meters per second)
/// it moves.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Placement {
    pub position: Geodetic,
    pub orientation: Orientation,
    pub velocity: Geodetic,
}

/// Returns the time at which a mobility event observed at `now` takes effect.
pub fn event_time(now: Duration, external: Duration) -> Duration {
    external.max(now + TICK)
}

/// Rate limiter and change detector for mobility events.
#[derive(Clone, Debug)]
pub struct Gate {
    interval: Duration,
    epsilon: f64,
    hierarchies: bool,
}

impl Gate {
    /// Creates a gate that admits one event per `interval` for each entity and
    /// ignores displacements below `epsilon` meters on every axis.
    ///
    /// If `hierarchies` is set, the display hierarchy of an entity follows it.
    pub fn new(interval: Duration, epsilon: f64, hierarchies: bool) -> Self {
        Self {
            interval,
            epsilon,
            hierarchies,
        }
    }

    /// Returns true if an event at `event` may follow one scheduled at `last`.
    pub fn admits(&self, last: Option<Duration>, event: Duration) -> bool {
        match last {
            Some(last) => event >= last + self.interval,
            None => true,
        }
    }

    /// Schedules the placement of every radio of `entity` if its state moved far
    /// enough from what was last scheduled.
    ///
    /// Returns true if an event was scheduled.
    pub fn schedule<E: Scheduler + Nodes>(
        &self,
        ctx: &mut E,
        registry: &mut Registry,
        handle: EntityHandle,
    ) -> Result<bool, Error> {
        let now = ctx.current();
        let event = event_time(now, ctx.external());
        let entity = registry.entity(handle);
        if !self.admits(entity.last_scheduled, event) {
            return Ok(false);
        }

        // Detect changes against the values last handed to the simulation
        let shadow = entity.scheduled;
        let moved = entity.position.moved(&shadow.position, self.epsilon);
        let turned = entity.orientation != shadow.orientation;
        let accelerated = entity.velocity != shadow.velocity;
        if !moved && !turned && !accelerated {
            return Ok(false);
        }
        let orientation = if turned {
            entity.orientation
        } else {
            shadow.orientation
        };
        let velocity = if accelerated {
            entity.velocity
        } else {
            shadow.velocity
        };
        let position = entity.position;
        let geodetic = if moved {
            entity.geodetic
        } else {
            shadow.geodetic
        };
        let hierarchy = entity.hierarchy;
        let radios: Vec<_> = entity.radios().collect();

        // Place every radio of the entity
        for radio in radios {
            let radio = registry.radio_mut(radio);
            let location = if moved {
                let location = Geodetic::from_geocentric(&(position + radio.relative));
                if !location.is_valid() {
                    return Err(Error::InvalidCoordinates(location));
                }
                location
            } else {
                radio.scheduled
            };
            radio.scheduled = location;
            let placement = Placement {
                position: location,
                orientation,
                velocity: location.rate(&velocity),
            };
            debug!(node = radio.node, ?event, ?placement, "scheduling mobility");
            ctx.place(radio.node, event, placement);
        }

        // Move the display hierarchy just before its members
        if let Some(hierarchy) = hierarchy.filter(|_| self.hierarchies && (moved || turned)) {
            ctx.schedule(
                (event - TICK).saturating_sub(now),
                Event::HierarchyMobility {
                    hierarchy,
                    position: geodetic,
                    orientation,
                },
            );
        }

        // Advance the shadow for the fields that changed
        let entity = registry.entity_mut(handle);
        if moved {
            entity.scheduled.position = position;
            entity.scheduled.geodetic = geodetic;
        }
        if turned {
            entity.scheduled.orientation = orientation;
        }
        if accelerated {
            entity.scheduled.velocity = velocity;
        }
        entity.last_scheduled = Some(event);
        Ok(true)
    }
}
