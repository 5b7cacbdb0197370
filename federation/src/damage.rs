//! Reactions to damage reported for an entity.
//!
//! A destroyed entity loses all of its interfaces. Increasing damage may reduce the
//! transmit power of the entity's radios and repair restores it.

use crate::{
    bridge::Event,
    config::{DamageProfiles, Reduction},
    registry::{EntityHandle, Registry},
    types::{DamageState, NodeId, Protocol, TxStatus},
    Clock, Error, Nodes, Scheduler,
};
use rand::Rng;
use tracing::debug;

/// Change of transmit power that follows a damage transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerChange {
    /// Reduce the current power using the profile of the given damage state.
    Reduce(DamageState),
    /// Restore the maximum power.
    Restore,
}

/// Actions that follow a damage transition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Reaction {
    /// Enable (true) or disable (false) the interfaces of the entity's radios.
    pub interfaces: Option<bool>,
    pub power: Option<PowerChange>,
}

/// Returns the actions that follow a transition from `old` to `new`.
pub fn react(old: DamageState, new: DamageState) -> Reaction {
    let interfaces = match (old, new) {
        (DamageState::Destroyed, DamageState::Destroyed) => None,
        (_, DamageState::Destroyed) => Some(false),
        (DamageState::Destroyed, _) => Some(true),
        _ => None,
    };
    let power = match (old, new) {
        _ if old == new => None,
        (_, DamageState::None) => Some(PowerChange::Restore),
        _ if old < new => Some(PowerChange::Reduce(new)),
        _ => None,
    };
    Reaction { interfaces, power }
}

/// Decodes a raw damage value received from the federation.
pub fn decode(protocol: Protocol, raw: u8, gateway_compatibility: bool) -> Result<DamageState, Error> {
    let raw = protocol.decode_damage(raw, gateway_compatibility);
    DamageState::try_from(raw).map_err(Error::InvalidDamageState)
}

/// Enables or disables the interfaces of `node` once the federation has granted the
/// current time.
pub(crate) fn set_interface<E: Clock + Nodes>(ctx: &mut E, node: NodeId, enabled: bool) {
    let at = ctx.external().max(ctx.current());
    debug!(node, enabled, ?at, "scheduling interface change");
    ctx.set_interface(node, at, enabled);
}

/// Applies damage transitions to the simulation.
#[derive(Clone, Debug)]
pub struct Reactor {
    profiles: DamageProfiles,
}

impl Reactor {
    pub fn new(profiles: DamageProfiles) -> Self {
        Self { profiles }
    }

    /// Records `new` as the damage state of `entity` and schedules the actions of
    /// the transition.
    pub fn reflect<E: Scheduler + Nodes>(
        &self,
        ctx: &mut E,
        registry: &mut Registry,
        entity: EntityHandle,
        new: DamageState,
    ) {
        let old = registry.entity(entity).damage();
        if old == new {
            return;
        }
        registry.entity_mut(entity).damage = new;
        if !registry.entity(entity).has_radios() {
            return;
        }
        let reaction = react(old, new);
        debug!(?old, ?new, ?reaction, "damage changed");

        if let Some(enabled) = reaction.interfaces {
            let radios: Vec<_> = registry.entity(entity).radios().collect();
            for radio in radios {
                let radio = registry.radio(radio);
                if enabled && radio.tx() == TxStatus::Off {
                    continue;
                }
                set_interface(ctx, radio.node(), enabled);
            }
        }
        if let Some(change) = reaction.power {
            let damage = match change {
                PowerChange::Reduce(damage) => damage,
                PowerChange::Restore => DamageState::None,
            };
            let delay = ctx.external().saturating_sub(ctx.current());
            ctx.schedule(delay, Event::ChangeMaxTxPower { entity, damage });
        }
    }

    /// Adjusts the transmit power of every radio of `entity` for `damage`.
    ///
    /// Returns the number of radios whose power was set.
    pub fn change_max_tx_power<E: Nodes>(
        &self,
        ctx: &mut E,
        registry: &mut Registry,
        entity: EntityHandle,
        damage: DamageState,
    ) -> usize {
        let reduction = self.reduction(damage);
        let radios: Vec<_> = registry.entity(entity).radios().collect();
        let mut changed = 0;
        for handle in radios {
            let radio = registry.radio_mut(handle);
            if !radio.power.in_use() {
                continue;
            }
            match reduction {
                None => radio.power.current = radio.power.max,
                Some(reduction) => {
                    let draw: f64 = radio.rng.gen();
                    if draw > reduction.probability {
                        continue;
                    }
                    let fraction: f64 = radio.rng.gen();
                    radio.power.current *= reduction.max_fraction * fraction;
                }
            }
            debug!(node = radio.node, power = radio.power.current, "changing max tx power");
            ctx.set_tx_power(radio.node, radio.power.current);
            changed += 1;
        }
        changed
    }

    fn reduction(&self, damage: DamageState) -> Option<Reduction> {
        match damage {
            DamageState::None => None,
            DamageState::Slight => Some(self.profiles.slight),
            DamageState::Moderate => Some(self.profiles.moderate),
            DamageState::Destroyed => Some(self.profiles.destroyed),
        }
    }
}
