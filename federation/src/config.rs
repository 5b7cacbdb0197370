//! Bridge configuration and static records.
//!
//! Configuration is read from YAML with kebab-case keys. Keys that carry the legacy
//! protocol prefix (`dis-` or `hla-`) are accepted when the unprefixed key is absent.

use crate::{
    geo::{Geodetic, Vector},
    types::{Force, LinkClass, NodeId, Protocol},
    Error,
};
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::{fs, net::Ipv4Addr, path::Path, path::PathBuf, time::Duration};

const DEFAULT_SITE_ID: u16 = 1;
const DEFAULT_APPLICATION_ID: u16 = 4000;
const DEFAULT_MOBILITY_INTERVAL_MS: u64 = 500;
const DEFAULT_DIS_PORT: u16 = 3000;
const DEFAULT_DIS_EXERCISE: u8 = 1;

/// Displacement (meters) on any axis below which a position change is not scheduled.
///
/// Corresponds to a total displacement of one meter.
pub const DEFAULT_XYZ_EPSILON: f64 = 0.577_350_269_189_625_76;

/// Largest message identifier a source node may assign.
pub const DEFAULT_MAX_MESSAGE_ID: u32 = i32::MAX as u32 - 1;

/// Bounds of the simulated terrain, in degrees.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Terrain {
    pub min_latitude: f64,
    pub max_latitude: f64,
    pub min_longitude: f64,
    pub max_longitude: f64,
}

impl Default for Terrain {
    fn default() -> Self {
        Self {
            min_latitude: -90.0,
            max_latitude: 90.0,
            min_longitude: -180.0,
            max_longitude: 180.0,
        }
    }
}

impl Terrain {
    pub fn contains(&self, position: &Geodetic) -> bool {
        (self.min_latitude..=self.max_latitude).contains(&position.latitude)
            && (self.min_longitude..=self.max_longitude).contains(&position.longitude)
    }
}

/// Likelihood and magnitude of a transmit power reduction.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Reduction {
    /// Probability that a radio's power is reduced at all.
    pub probability: f64,
    /// Upper bound of the fraction of the current power that is kept.
    pub max_fraction: f64,
}

/// Transmit power reductions applied per damage tier.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DamageProfiles {
    pub slight: Reduction,
    pub moderate: Reduction,
    pub destroyed: Reduction,
}

impl Default for DamageProfiles {
    fn default() -> Self {
        Self {
            slight: Reduction {
                probability: 0.25,
                max_fraction: 0.75,
            },
            moderate: Reduction {
                probability: 0.25,
                max_fraction: 0.75,
            },
            destroyed: Reduction {
                probability: 0.50,
                max_fraction: 0.75,
            },
        }
    }
}

/// Connection parameters, as written in the configuration.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FederationParameters {
    pub port: Option<u16>,
    pub exercise_id: Option<u8>,
    pub ip_address: Option<Ipv4Addr>,
    pub federation_name: Option<String>,
    pub fed_file_path: Option<PathBuf>,
    pub federate_name: Option<String>,
    pub rpr_fom_version: Option<f64>,
}

/// Connection parameters resolved for a [Protocol].
#[derive(Clone, Debug, PartialEq)]
pub enum Connection {
    Dis {
        port: u16,
        exercise: u8,
        destination: Ipv4Addr,
    },
    Hla {
        federation: String,
        fed_file: PathBuf,
        federate: String,
        rpr_fom_version: f64,
    },
}

/// Configuration of the bridge.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default = "default_site_id")]
    pub site_id: u16,
    #[serde(default = "default_application_id")]
    pub application_id: u16,
    #[serde(default = "default_mobility_interval_ms")]
    pub mobility_interval_ms: u64,
    #[serde(default = "default_xyz_epsilon")]
    pub xyz_epsilon: f64,
    #[serde(default)]
    pub terrain: Terrain,
    #[serde(default)]
    pub damage: DamageProfiles,
    #[serde(default = "default_max_message_id")]
    pub max_message_id: u32,
    #[serde(default)]
    pub seed: u64,
    /// Log conditions that are otherwise dropped silently.
    #[serde(default)]
    pub verbose: bool,
    /// Move display hierarchies along with their entities.
    #[serde(default)]
    pub gui: bool,
    /// Decode damage from a gateway-copied appearance record (HLA only).
    #[serde(default)]
    pub nawc_gateway_compatibility: bool,
    #[serde(default)]
    pub federation: FederationParameters,
    pub entities_file_path: Option<PathBuf>,
    pub radios_file_path: Option<PathBuf>,
    pub networks_file_path: Option<PathBuf>,
}

fn default_site_id() -> u16 {
    DEFAULT_SITE_ID
}

fn default_application_id() -> u16 {
    DEFAULT_APPLICATION_ID
}

fn default_mobility_interval_ms() -> u64 {
    DEFAULT_MOBILITY_INTERVAL_MS
}

fn default_xyz_epsilon() -> f64 {
    DEFAULT_XYZ_EPSILON
}

fn default_max_message_id() -> u32 {
    DEFAULT_MAX_MESSAGE_ID
}

impl Default for Config {
    fn default() -> Self {
        Self {
            protocol: Protocol::default(),
            site_id: DEFAULT_SITE_ID,
            application_id: DEFAULT_APPLICATION_ID,
            mobility_interval_ms: DEFAULT_MOBILITY_INTERVAL_MS,
            xyz_epsilon: DEFAULT_XYZ_EPSILON,
            terrain: Terrain::default(),
            damage: DamageProfiles::default(),
            max_message_id: DEFAULT_MAX_MESSAGE_ID,
            seed: 0,
            verbose: false,
            gui: false,
            nawc_gateway_compatibility: false,
            federation: FederationParameters::default(),
            entities_file_path: None,
            radios_file_path: None,
            networks_file_path: None,
        }
    }
}

impl Config {
    /// Parses and validates a configuration.
    pub fn parse(yaml: &str) -> Result<Self, Error> {
        let mut value: Value = serde_yaml::from_str(yaml)?;
        if let Value::Mapping(mapping) = &mut value {
            let protocol = match mapping.get("protocol") {
                Some(protocol) => serde_yaml::from_value(protocol.clone())?,
                None => Protocol::default(),
            };
            promote_legacy(mapping, protocol.legacy_prefix());
        }
        let config: Self = serde_yaml::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses, and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        Self::parse(&read(path)?)
    }

    /// Checks parameter ranges and required parameters.
    pub fn validate(&self) -> Result<(), Error> {
        if !(self.xyz_epsilon >= 0.0) {
            return Err(Error::InvalidParameter(
                "xyz-epsilon",
                self.xyz_epsilon.to_string(),
            ));
        }
        for (name, reduction) in [
            ("damage.slight", self.damage.slight),
            ("damage.moderate", self.damage.moderate),
            ("damage.destroyed", self.damage.destroyed),
        ] {
            let in_range = |v: f64| (0.0..=1.0).contains(&v);
            if !in_range(reduction.probability) || !in_range(reduction.max_fraction) {
                return Err(Error::InvalidParameter(name, format!("{reduction:?}")));
            }
        }
        if self.entities_file_path.is_none() {
            return Err(Error::MissingParameter("entities-file-path"));
        }
        if self.radios_file_path.is_none() {
            return Err(Error::MissingParameter("radios-file-path"));
        }
        if self.networks_file_path.is_none() {
            return Err(Error::MissingParameter("networks-file-path"));
        }
        self.connection()?;
        Ok(())
    }

    /// Returns the minimum spacing between two mobility events of the same entity.
    pub fn mobility_interval(&self) -> Duration {
        Duration::from_millis(self.mobility_interval_ms)
    }

    /// Resolves the federation connection parameters for the configured protocol.
    pub fn connection(&self) -> Result<Connection, Error> {
        let parameters = &self.federation;
        match self.protocol {
            Protocol::Dis => Ok(Connection::Dis {
                port: parameters.port.unwrap_or(DEFAULT_DIS_PORT),
                exercise: parameters.exercise_id.unwrap_or(DEFAULT_DIS_EXERCISE),
                destination: parameters.ip_address.unwrap_or(Ipv4Addr::BROADCAST),
            }),
            Protocol::Hla13 | Protocol::Hla1516 => Ok(Connection::Hla {
                federation: parameters
                    .federation_name
                    .clone()
                    .ok_or(Error::MissingParameter("federation.federation-name"))?,
                fed_file: parameters
                    .fed_file_path
                    .clone()
                    .ok_or(Error::MissingParameter("federation.fed-file-path"))?,
                federate: parameters
                    .federate_name
                    .clone()
                    .ok_or(Error::MissingParameter("federation.federate-name"))?,
                rpr_fom_version: parameters
                    .rpr_fom_version
                    .or(self.protocol.default_rpr_fom_version())
                    .ok_or(Error::MissingParameter("federation.rpr-fom-version"))?,
            }),
        }
    }
}

/// Renames `<prefix><key>` entries to `<key>` unless `<key>` is already present.
fn promote_legacy(mapping: &mut Mapping, prefix: &str) {
    let legacy: Vec<(String, Value)> = mapping
        .iter()
        .filter_map(|(key, value)| {
            let key = key.as_str()?;
            let stripped = key.strip_prefix(prefix)?;
            Some((stripped.to_string(), value.clone()))
        })
        .collect();
    for (key, value) in legacy {
        let prefixed = Value::String(format!("{prefix}{key}"));
        mapping.remove(&prefixed);
        let key = Value::String(key);
        if !mapping.contains_key(&key) {
            mapping.insert(key, value);
        }
    }
}

fn read(path: &Path) -> Result<String, Error> {
    fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// A federation entity the local simulation represents.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EntityRecord {
    pub marking: String,
    #[serde(default)]
    pub force: Force,
    #[serde(default)]
    pub nationality: String,
    pub position: Geodetic,
    #[serde(default)]
    pub hierarchy: Option<u32>,
}

/// A radio carried by an entity, bound to one local node.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RadioRecord {
    pub node: NodeId,
    pub marking: String,
    pub index: u16,
    #[serde(default)]
    pub relative_position: Vector,
    #[serde(default)]
    pub link: LinkClass,
    /// Initial maximum transmit power (mW). Zero for radios without a physical layer.
    #[serde(default)]
    pub tx_power: f64,
    /// Receive data rate (bits per second), used to size Link-11 voice messages.
    #[serde(default)]
    pub rx_rate: f64,
}

/// A set of radios sharing a channel.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NetworkRecord {
    pub name: String,
    #[serde(default)]
    pub frequency: u64,
    pub members: Vec<NodeId>,
    /// `0.0.0.0` for broadcast networks, the unicast address otherwise.
    pub address: Ipv4Addr,
}

/// All static records, loaded once at startup.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Records {
    pub entities: Vec<EntityRecord>,
    pub radios: Vec<RadioRecord>,
    pub networks: Vec<NetworkRecord>,
}

impl Records {
    /// Loads the record files named by `config`.
    pub fn load(config: &Config) -> Result<Self, Error> {
        let path = |path: &Option<PathBuf>, name| path.clone().ok_or(Error::MissingParameter(name));
        let entities = path(&config.entities_file_path, "entities-file-path")?;
        let radios = path(&config.radios_file_path, "radios-file-path")?;
        let networks = path(&config.networks_file_path, "networks-file-path")?;
        Ok(Self {
            entities: serde_yaml::from_str(&read(&entities)?)?,
            radios: serde_yaml::from_str(&read(&radios)?)?,
            networks: serde_yaml::from_str(&read(&networks)?)?,
        })
    }
}
