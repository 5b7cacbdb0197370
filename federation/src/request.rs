//! Communication-effects requests: header parsing, routing, and the messages handed
//! to the messenger.
//!
//! A request payload starts with a text header:
//!
//! ```text
//! HEADER
//! size=1000 bytes
//! timeout=5
//! timestamp=0x0000abcd
//! receiver=1.4000.7
//! EOH
//! ```
//!
//! followed by the (opaque) message body. `receiver` is optional.

use crate::{
    reflector::Reflector,
    registry::{EntityHandle, RadioHandle},
    types::{EntityId, LinkClass, NodeId, Protocol},
    Warning,
};
use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{EncodeSize, Error as CodecError, FixedSize, Read, ReadExt, Write};
use std::time::Duration;

/// Bytes the messenger adds to every message.
pub const MIN_BYTES: u32 = 56;

const DATA_FRAGMENT_SIZE: u32 = 128;
const VOICE_FRAGMENT_SIZE: u32 = 250;
const VOICE_INTERVAL: Duration = Duration::from_millis(250);

/// Voice rate (bytes per second) assumed for Link-16 voice messages.
const LINK16_VOICE_RATE: f64 = 1000.0;

/// A communication request received from the federation.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    /// Entity hosting the source radio.
    pub entity: EntityId,
    /// Index of the source radio on its entity.
    pub radio: u16,
    /// Global identifier of the source radio (HLA).
    pub object: String,
    /// Requested data rate (bits per second).
    pub sample_rate: f64,
    pub data: Bytes,
}

/// Size of a simulated message.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Size {
    Bytes(u32),
    /// Duration of a voice message, in seconds.
    Seconds(f64),
}

impl Size {
    pub fn is_voice(&self) -> bool {
        matches!(self, Self::Seconds(_))
    }
}

/// Parsed request header.
#[derive(Clone, Debug, PartialEq)]
pub struct Header {
    pub size: Size,
    pub timeout: Duration,
    pub timestamp: u32,
    pub receiver: Option<EntityId>,
}

impl Header {
    /// Parses the header at the start of `payload`.
    pub fn parse(payload: &[u8]) -> Result<Self, Warning> {
        let mut lines = payload.split(|b| *b == b'\n').map(|line| {
            let line = std::str::from_utf8(line).map_err(|_| Warning::MalformedHeader("encoding"))?;
            Ok::<_, Warning>(line.trim_end_matches('\r').trim())
        });
        match lines.next() {
            Some(Ok("HEADER")) => {}
            _ => return Err(Warning::MalformedHeader("HEADER")),
        }

        let mut size = None;
        let mut timeout = None;
        let mut timestamp = None;
        let mut receiver = None;
        let mut terminated = false;
        for line in lines {
            let line = line?;
            if line == "EOH" {
                terminated = true;
                break;
            }
            let Some((name, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match name.trim() {
                "size" => size = Some(parse_size(value)?),
                "timeout" => timeout = Some(parse_seconds(value, "timeout")?),
                "timestamp" => timestamp = Some(parse_timestamp(value)?),
                "receiver" => {
                    receiver = Some(
                        value
                            .parse()
                            .map_err(|_| Warning::MalformedHeader("receiver"))?,
                    )
                }
                _ => {}
            }
        }
        if !terminated {
            return Err(Warning::MalformedHeader("EOH"));
        }
        Ok(Self {
            size: size.ok_or(Warning::MalformedHeader("size"))?,
            timeout: timeout.ok_or(Warning::MalformedHeader("timeout"))?,
            timestamp: timestamp.ok_or(Warning::MalformedHeader("timestamp"))?,
            receiver,
        })
    }
}

fn parse_size(value: &str) -> Result<Size, Warning> {
    let mut parts = value.split_whitespace();
    let (Some(amount), Some(unit), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(Warning::MalformedHeader("size"));
    };
    match unit {
        "bytes" => amount
            .parse()
            .map(Size::Bytes)
            .map_err(|_| Warning::MalformedHeader("size")),
        "seconds" => {
            let seconds: f64 = amount
                .parse()
                .map_err(|_| Warning::MalformedHeader("size"))?;
            if !seconds.is_finite() || seconds < 0.0 {
                return Err(Warning::MalformedHeader("size"));
            }
            Ok(Size::Seconds(seconds))
        }
        _ => Err(Warning::MalformedHeader("size")),
    }
}

fn parse_seconds(value: &str, field: &'static str) -> Result<Duration, Warning> {
    let seconds: f64 = value.parse().map_err(|_| Warning::MalformedHeader(field))?;
    Duration::try_from_secs_f64(seconds).map_err(|_| Warning::MalformedHeader(field))
}

fn parse_timestamp(value: &str) -> Result<u32, Warning> {
    let digits = value
        .strip_prefix("0x")
        .filter(|digits| digits.len() == 8)
        .ok_or(Warning::MalformedHeader("timestamp"))?;
    u32::from_str_radix(digits, 16).map_err(|_| Warning::MalformedHeader("timestamp"))
}

/// How a message is split into fragments by the messenger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FragmentPlan {
    pub count: u32,
    /// Bytes per fragment.
    pub size: u32,
    /// Spacing between consecutive fragments.
    pub interval: Duration,
}

impl FragmentPlan {
    /// Plans a message of `size` sent by a radio of class `link`.
    ///
    /// `sample_rate` (bits per second) paces standard data messages and `rx_rate`
    /// (bits per second) sizes Link-11 voice messages.
    pub fn new(size: Size, link: LinkClass, sample_rate: f64, rx_rate: f64) -> Self {
        match (size, link) {
            (Size::Bytes(bytes), LinkClass::Standard) => {
                let interval = f64::from(DATA_FRAGMENT_SIZE) * 8.0 / sample_rate;
                Self {
                    count: bytes
                        .div_ceil(DATA_FRAGMENT_SIZE)
                        .max(MIN_BYTES.div_ceil(DATA_FRAGMENT_SIZE)),
                    size: DATA_FRAGMENT_SIZE,
                    interval: Duration::try_from_secs_f64(interval).unwrap_or_default(),
                }
            }
            (Size::Bytes(bytes), LinkClass::Link11 | LinkClass::Link16) => Self::single(bytes),
            (Size::Seconds(seconds), LinkClass::Standard) => {
                let count = (seconds / VOICE_INTERVAL.as_secs_f64()).ceil() as u32;
                Self {
                    count: count.max(MIN_BYTES.div_ceil(VOICE_FRAGMENT_SIZE)),
                    size: VOICE_FRAGMENT_SIZE,
                    interval: VOICE_INTERVAL,
                }
            }
            (Size::Seconds(seconds), LinkClass::Link11) => {
                Self::single((seconds * rx_rate / 8.0) as u32)
            }
            (Size::Seconds(seconds), LinkClass::Link16) => {
                Self::single((seconds * LINK16_VOICE_RATE) as u32)
            }
        }
    }

    /// One fragment carrying the whole message.
    fn single(bytes: u32) -> Self {
        Self {
            count: 1,
            size: bytes.max(MIN_BYTES),
            interval: Duration::ZERO,
        }
    }
}

impl Write for FragmentPlan {
    fn write(&self, buf: &mut impl BufMut) {
        self.count.write(buf);
        self.size.write(buf);
        write_duration(self.interval, buf);
    }
}

impl Read for FragmentPlan {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            count: u32::read(buf)?,
            size: u32::read(buf)?,
            interval: read_duration(buf)?,
        })
    }
}

impl FixedSize for FragmentPlan {
    const SIZE: usize = u32::SIZE + u32::SIZE + DURATION_SIZE;
}

/// Transport used by the messenger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Directly over the link's MAC layer.
    Mac,
    Unreliable,
}

impl Transport {
    pub fn for_link(link: LinkClass) -> Self {
        if link.is_tactical() {
            Self::Mac
        } else {
            Self::Unreliable
        }
    }
}

impl Write for Transport {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Self::Mac => 0u8.write(buf),
            Self::Unreliable => 1u8.write(buf),
        }
    }
}

impl Read for Transport {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            0 => Ok(Self::Mac),
            1 => Ok(Self::Unreliable),
            i => Err(CodecError::InvalidEnum(i)),
        }
    }
}

impl FixedSize for Transport {
    const SIZE: usize = u8::SIZE;
}

/// Addressee of a delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Destination {
    Node(NodeId),
    /// Every node sharing the source node's channel.
    Broadcast,
}

impl Write for Destination {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Self::Node(node) => {
                0u8.write(buf);
                node.write(buf);
            }
            Self::Broadcast => 1u8.write(buf),
        }
    }
}

impl Read for Destination {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            0 => Ok(Self::Node(NodeId::read(buf)?)),
            1 => Ok(Self::Broadcast),
            i => Err(CodecError::InvalidEnum(i)),
        }
    }
}

impl EncodeSize for Destination {
    fn encode_size(&self) -> usize {
        1 + match self {
            Self::Node(node) => node.encode_size(),
            Self::Broadcast => 0,
        }
    }
}

/// A simulated message for the messenger.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub source: NodeId,
    pub message: u32,
    pub destination: Destination,
    pub transport: Transport,
    pub plan: FragmentPlan,
    pub voice: bool,
    /// Delay before the first fragment is sent.
    pub delay: Duration,
    /// Time after which the message no longer matters.
    pub timeout: Duration,
}

impl Write for Delivery {
    fn write(&self, buf: &mut impl BufMut) {
        self.source.write(buf);
        self.message.write(buf);
        self.destination.write(buf);
        self.transport.write(buf);
        self.plan.write(buf);
        self.voice.write(buf);
        write_duration(self.delay, buf);
        write_duration(self.timeout, buf);
    }
}

impl Read for Delivery {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            source: NodeId::read(buf)?,
            message: u32::read(buf)?,
            destination: Destination::read(buf)?,
            transport: Transport::read(buf)?,
            plan: FragmentPlan::read(buf)?,
            voice: bool::read(buf)?,
            delay: read_duration(buf)?,
            timeout: read_duration(buf)?,
        })
    }
}

impl EncodeSize for Delivery {
    fn encode_size(&self) -> usize {
        self.source.encode_size()
            + self.message.encode_size()
            + self.destination.encode_size()
            + Transport::SIZE
            + FragmentPlan::SIZE
            + self.voice.encode_size()
            + 2 * DURATION_SIZE
    }
}

/// Encoded seconds and sub-second nanoseconds of a [Duration].
const DURATION_SIZE: usize = u64::SIZE + u32::SIZE;

fn write_duration(duration: Duration, buf: &mut impl BufMut) {
    duration.as_secs().write(buf);
    duration.subsec_nanos().write(buf);
}

fn read_duration(buf: &mut impl Buf) -> Result<Duration, CodecError> {
    let secs = u64::read(buf)?;
    let nanos = u32::read(buf)?;
    if nanos >= 1_000_000_000 {
        return Err(CodecError::Invalid("Duration", "nanoseconds out of range"));
    }
    Ok(Duration::new(secs, nanos))
}

/// A destination entity of a message and the node that represents it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Target {
    pub node: NodeId,
    pub handle: EntityHandle,
    pub entity: EntityId,
}

/// Resolved source, destinations, and deliveries of a request.
#[derive(Clone, Debug, PartialEq)]
pub struct Route {
    pub source: RadioHandle,
    pub sender: EntityId,
    pub targets: Vec<Target>,
    pub destinations: Vec<Destination>,
}

/// Resolves the source radio and destinations of `request`.
pub fn route(
    reflector: &Reflector,
    protocol: Protocol,
    request: &Request,
    header: &Header,
) -> Result<Route, Warning> {
    let registry = reflector.registry();

    // Resolve source
    let key = protocol.radio_key(request.entity, request.radio, &request.object);
    let source = reflector
        .find_radio_by_federation_id(&key)
        .ok_or_else(|| Warning::UnmappedRadio(key.clone()))?;
    let radio = registry.radio(source);
    if radio.link() == LinkClass::Standard && request.sample_rate == 0.0 {
        return Err(Warning::ZeroSampleRate);
    }
    let entity = radio.entity();
    let sender = registry.entity(entity).id().unwrap_or(request.entity);
    let target_of = |radio: RadioHandle| {
        let radio = registry.radio(radio);
        Target {
            node: radio.node(),
            handle: radio.entity(),
            entity: registry.entity(radio.entity()).id().unwrap_or_default(),
        }
    };

    // Resolve receiver
    let mut explicit = None;
    if let Some(receiver) = header.receiver {
        if receiver == sender {
            return Err(Warning::SelfDestination);
        }
        match reflector.find_entity(&receiver) {
            Some(handle) if handle == entity => return Err(Warning::SelfDestination),
            Some(handle) => explicit = Some((receiver, handle)),
            None if registry.is_mapped(&receiver) => {
                let targets: Vec<Target> = registry
                    .nodes_for_entity(&receiver)
                    .filter(|node| *node != radio.node())
                    .filter_map(|node| registry.radio_by_node(node))
                    .map(|radio| Target {
                        entity: receiver,
                        ..target_of(radio)
                    })
                    .collect();
                if targets.is_empty() {
                    return Err(Warning::NoReceivers);
                }
                let destinations = targets.iter().map(|t| Destination::Node(t.node)).collect();
                return Ok(Route {
                    source,
                    sender,
                    targets,
                    destinations,
                });
            }
            None => return Err(Warning::UnknownReceiver(receiver)),
        }
    }

    // Validate against the source network
    let network = registry.network_of(source).ok_or(Warning::NoNetwork)?;
    let member_of = |handle: EntityHandle| {
        network.members().iter().copied().find(|member| {
            let member = registry.radio(*member);
            member.node() != radio.node() && member.entity() == handle
        })
    };
    if network.is_unicast() {
        let destination = match explicit {
            None => radio.default_destination().ok_or(Warning::NoNetwork)?,
            Some((receiver, handle)) => {
                member_of(handle).ok_or(Warning::NotInNetwork(receiver))?
            }
        };
        let target = target_of(destination);
        return Ok(Route {
            source,
            sender,
            targets: vec![target],
            destinations: vec![Destination::Node(target.node)],
        });
    }

    // A broadcast reaches the whole channel but only the receiver, if any, is tracked
    let targets: Vec<Target> = match explicit {
        Some((receiver, handle)) => {
            vec![target_of(member_of(handle).ok_or(Warning::NotInNetwork(receiver))?)]
        }
        None => network
            .members()
            .iter()
            .copied()
            .filter(|member| registry.radio(*member).node() != radio.node())
            .map(target_of)
            .collect(),
    };
    if targets.is_empty() {
        return Err(Warning::NoReceivers);
    }
    Ok(Route {
        source,
        sender,
        targets,
        destinations: vec![Destination::Broadcast],
    })
}
