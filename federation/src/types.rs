//! Identifiers and enumerations shared across the bridge.

use bytes::{Buf, BufMut};
use commonware_codec::{Error as CodecError, FixedSize, Read, ReadExt, Write};
use serde::Deserialize;
use std::{fmt, str::FromStr};

/// Identifier of a node in the local simulation.
pub type NodeId = u32;

/// Index of an execution partition.
pub type PartitionId = u32;

/// The partition that owns the federation connection.
pub const FEDERATION_PARTITION: PartitionId = 0;

/// Federation identity of an entity (`site.application.entity`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
pub struct EntityId {
    pub site: u16,
    pub application: u16,
    pub entity: u16,
}

impl EntityId {
    /// Identifier used by the federation to address every entity.
    pub const BROADCAST: Self = Self::new(0xffff, 0xffff, 0xffff);

    pub const fn new(site: u16, application: u16, entity: u16) -> Self {
        Self {
            site,
            application,
            entity,
        }
    }
}

impl Write for EntityId {
    fn write(&self, buf: &mut impl BufMut) {
        self.site.write(buf);
        self.application.write(buf);
        self.entity.write(buf);
    }
}

impl Read for EntityId {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self::new(u16::read(buf)?, u16::read(buf)?, u16::read(buf)?))
    }
}

impl FixedSize for EntityId {
    const SIZE: usize = 3 * u16::SIZE;
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.site, self.application, self.entity)
    }
}

impl FromStr for EntityId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split('.');
        let mut next = || -> Result<u16, ()> {
            parts.next().ok_or(())?.trim().parse().map_err(|_| ())
        };
        let id = Self::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(());
        }
        Ok(id)
    }
}

/// Damage reported for an entity, ordered from least to most damaged.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DamageState {
    #[default]
    None,
    Slight,
    Moderate,
    Destroyed,
}

impl TryFrom<u8> for DamageState {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Slight),
            2 => Ok(Self::Moderate),
            3 => Ok(Self::Destroyed),
            other => Err(other),
        }
    }
}

/// Operational status of a radio transmitter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TxStatus {
    #[default]
    Off,
    OnNotTransmitting,
    OnTransmitting,
}

impl TxStatus {
    pub fn is_on(self) -> bool {
        !matches!(self, Self::Off)
    }
}

/// Force affiliation of an entity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
pub enum Force {
    #[serde(alias = "F")]
    Friendly,
    #[serde(alias = "O")]
    Opposing,
    #[default]
    #[serde(alias = "N")]
    Neutral,
}

impl Force {
    /// Maps a federation force value. Anything other than friendly (1) or
    /// opposing (2) is treated as neutral.
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Friendly,
            2 => Self::Opposing,
            _ => Self::Neutral,
        }
    }

    pub fn code(self) -> char {
        match self {
            Self::Friendly => 'F',
            Self::Opposing => 'O',
            Self::Neutral => 'N',
        }
    }
}

/// Domain classification of an entity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Domain {
    Air,
    #[default]
    Surface,
}

impl Domain {
    const AIR: u8 = 2;
    const SPACE: u8 = 5;

    /// Maps a federation domain value. Air and space map to [Domain::Air], everything
    /// else to [Domain::Surface].
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            Self::AIR | Self::SPACE => Self::Air,
            _ => Self::Surface,
        }
    }
}

/// Class of link a radio belongs to.
///
/// Link-11 and Link-16 radios send each message as a single transmission, use MAC
/// transport, and announce readiness to send.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkClass {
    #[default]
    Standard,
    Link11,
    Link16,
}

impl LinkClass {
    pub fn is_tactical(self) -> bool {
        matches!(self, Self::Link11 | Self::Link16)
    }
}

/// Key used by the federation to identify a reflected radio.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RadioKey {
    /// Host entity and radio index (DIS).
    Indexed(EntityId, u16),
    /// Global object identifier (HLA).
    Global(String),
}

impl fmt::Display for RadioKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Indexed(entity, index) => write!(f, "{entity}:{index}"),
            Self::Global(id) => f.write_str(id),
        }
    }
}

/// Federation protocol spoken by the bridge.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    #[default]
    Dis,
    Hla13,
    Hla1516,
}

impl Protocol {
    /// Returns the key under which the federation reports a radio.
    pub fn radio_key(self, entity: EntityId, index: u16, object: &str) -> RadioKey {
        match self {
            Self::Dis => RadioKey::Indexed(entity, index),
            Self::Hla13 | Self::Hla1516 => RadioKey::Global(object.to_string()),
        }
    }

    /// Returns the prefix used by parameter names that predate the shared bridge.
    pub fn legacy_prefix(self) -> &'static str {
        match self {
            Self::Dis => "dis-",
            Self::Hla13 | Self::Hla1516 => "hla-",
        }
    }

    /// Returns the RPR FOM version assumed when none is configured.
    pub fn default_rpr_fom_version(self) -> Option<f64> {
        match self {
            Self::Dis => None,
            Self::Hla13 => Some(1.0),
            Self::Hla1516 => Some(2.0017),
        }
    }

    /// Decodes a raw damage value, applying the gateway appearance-record layout
    /// when requested (HLA only).
    pub fn decode_damage(self, raw: u8, gateway_compatibility: bool) -> u8 {
        match self {
            Self::Hla13 | Self::Hla1516 if gateway_compatibility => (raw & 24) >> 3,
            _ => raw,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_parse() {
        let id: EntityId = "1.4000.17".parse().unwrap();
        assert_eq!(id, EntityId::new(1, 4000, 17));
        assert_eq!(id.to_string(), "1.4000.17");
        assert!("1.2".parse::<EntityId>().is_err());
        assert!("1.2.3.4".parse::<EntityId>().is_err());
        assert!("1.x.3".parse::<EntityId>().is_err());
        assert!("1.2.70000".parse::<EntityId>().is_err());
    }

    #[test]
    fn test_entity_id_order() {
        let mut ids = vec![
            EntityId::new(2, 0, 0),
            EntityId::new(1, 5, 0),
            EntityId::new(1, 1, 9),
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec![
                EntityId::new(1, 1, 9),
                EntityId::new(1, 5, 0),
                EntityId::new(2, 0, 0)
            ]
        );
    }

    #[test]
    fn test_damage_order() {
        assert!(DamageState::None < DamageState::Slight);
        assert!(DamageState::Slight < DamageState::Moderate);
        assert!(DamageState::Moderate < DamageState::Destroyed);
        assert_eq!(DamageState::try_from(2), Ok(DamageState::Moderate));
        assert_eq!(DamageState::try_from(4), Err(4));
    }

    #[test]
    fn test_force_and_domain() {
        assert_eq!(Force::from_raw(1).code(), 'F');
        assert_eq!(Force::from_raw(2).code(), 'O');
        assert_eq!(Force::from_raw(3).code(), 'N');
        assert_eq!(Force::from_raw(0).code(), 'N');
        assert_eq!(Domain::from_raw(2), Domain::Air);
        assert_eq!(Domain::from_raw(5), Domain::Air);
        assert_eq!(Domain::from_raw(1), Domain::Surface);
    }

    #[test]
    fn test_protocol_dispatch() {
        let entity = EntityId::new(1, 2, 3);
        assert_eq!(
            Protocol::Dis.radio_key(entity, 4, "ignored"),
            RadioKey::Indexed(entity, 4)
        );
        assert_eq!(
            Protocol::Hla1516.radio_key(entity, 4, "radio-7"),
            RadioKey::Global("radio-7".into())
        );
        assert_eq!(Protocol::Hla13.default_rpr_fom_version(), Some(1.0));
        assert_eq!(Protocol::Dis.decode_damage(0b11000, true), 0b11000);
        assert_eq!(Protocol::Hla13.decode_damage(0b11000, true), 3);
        assert_eq!(Protocol::Hla13.decode_damage(2, false), 2);
    }
}
