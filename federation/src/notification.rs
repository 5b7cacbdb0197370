//! Notifications sent to the federation and their datum encoding.
//!
//! Datums are encoded big-endian. Every datum starts with the identity of the sending
//! entity and the index of the radio the notification is about.

use crate::{types::EntityId, Error};
use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error as CodecError, FixedSize, Read, ReadExt, Write};

/// Datum identifier of a process-message notification.
pub const PROCESS_MESSAGE_DATUM: u32 = 60001;

/// Datum identifier of a timeout notification.
pub const TIMEOUT_DATUM: u32 = 60002;

/// Datum identifier of a ready-to-send notification.
pub const READY_TO_SEND_DATUM: u32 = 60010;

/// Largest datum (bytes) the federation accepts.
const MAX_DATUM_SIZE: usize = 1000;

/// Bytes of a timeout datum that precede the per-destination records, plus the
/// datum header added by the federation library.
const TIMEOUT_OVERHEAD: usize = 8 + 6 + 2 + 4 + 4 + 4;

/// Encoded size of one destination record (entity identifier and result).
const DESTINATION_SIZE: usize = 6 + 1;

/// Largest number of destinations a single timeout notification can report.
pub const MAX_TIMEOUT_DESTINATIONS: usize = (MAX_DATUM_SIZE - TIMEOUT_OVERHEAD) / DESTINATION_SIZE;

/// Largest number of members of a network.
pub const MAX_NETWORK_MEMBERS: usize = 254;

/// Timestamp units per second (2^31 units per hour).
const TIMESTAMP_SCALE: f64 = 596_523.235_277_778;

/// Seconds in the hour a timestamp is relative to.
const SECONDS_PER_HOUR: f64 = 3600.0;

/// Encodes `seconds` past the hour as a federation timestamp.
///
/// The low bit marks absolute timestamps.
pub fn encode_timestamp(seconds: f64, absolute: bool) -> Result<u32, Error> {
    if !(0.0..SECONDS_PER_HOUR).contains(&seconds) {
        return Err(Error::InvalidTimestamp(seconds));
    }
    let units = (seconds * TIMESTAMP_SCALE) as u32;
    if units & 0x8000_0000 != 0 {
        return Err(Error::InvalidTimestamp(seconds));
    }
    Ok((units << 1) | u32::from(absolute))
}

/// Result of delivering a message to one destination entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Outcome {
    pub entity: EntityId,
    pub success: bool,
}

/// A notification for the federation.
#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    /// A message reached `receiver`.
    ProcessMessage {
        sender: EntityId,
        radio: u16,
        timestamp: u32,
        receiver: EntityId,
        /// Seconds between the send time and the delivery.
        delay: f64,
    },
    /// Final report of a message, sent once per message.
    Timeout {
        sender: EntityId,
        radio: u16,
        timestamp: u32,
        receiver: EntityId,
        outcomes: Vec<Outcome>,
    },
    /// A link radio is ready to accept messages.
    ReadyToSend {
        sender: EntityId,
        radio: u16,
        timestamp: u32,
    },
}

impl Notification {
    /// Creates a timeout notification.
    ///
    /// The receiver is the only destination when there is exactly one, and
    /// [EntityId::BROADCAST] otherwise.
    pub fn timeout(
        sender: EntityId,
        radio: u16,
        timestamp: u32,
        outcomes: Vec<Outcome>,
    ) -> Result<Self, Error> {
        if outcomes.len() > MAX_TIMEOUT_DESTINATIONS {
            return Err(Error::TooManyDestinations(outcomes.len()));
        }
        Ok(Self::Timeout {
            sender,
            radio,
            timestamp,
            receiver: receiver_of(&outcomes),
            outcomes,
        })
    }

    pub fn datum(&self) -> u32 {
        match self {
            Self::ProcessMessage { .. } => PROCESS_MESSAGE_DATUM,
            Self::Timeout { .. } => TIMEOUT_DATUM,
            Self::ReadyToSend { .. } => READY_TO_SEND_DATUM,
        }
    }

    pub fn sender(&self) -> EntityId {
        match self {
            Self::ProcessMessage { sender, .. }
            | Self::Timeout { sender, .. }
            | Self::ReadyToSend { sender, .. } => *sender,
        }
    }

    /// Returns the entity the notification is addressed to.
    pub fn receiver(&self) -> EntityId {
        match self {
            Self::ProcessMessage { receiver, .. } | Self::Timeout { receiver, .. } => *receiver,
            Self::ReadyToSend { .. } => EntityId::BROADCAST,
        }
    }
}

fn receiver_of(outcomes: &[Outcome]) -> EntityId {
    match outcomes {
        [only] => only.entity,
        _ => EntityId::BROADCAST,
    }
}

/// Packets a notification stands for. Always one.
const PACKET_COUNT: u32 = 1;

impl Write for Outcome {
    fn write(&self, buf: &mut impl BufMut) {
        self.entity.write(buf);
        self.success.write(buf);
    }
}

impl Read for Outcome {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            entity: EntityId::read(buf)?,
            success: bool::read(buf)?,
        })
    }
}

impl FixedSize for Outcome {
    const SIZE: usize = EntityId::SIZE + bool::SIZE;
}

impl Write for Notification {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Self::ProcessMessage {
                sender,
                radio,
                timestamp,
                receiver,
                delay,
            } => {
                sender.write(buf);
                radio.write(buf);
                timestamp.write(buf);
                PACKET_COUNT.write(buf);
                receiver.write(buf);
                delay.write(buf);
            }
            Self::Timeout {
                sender,
                radio,
                timestamp,
                outcomes,
                ..
            } => {
                sender.write(buf);
                radio.write(buf);
                timestamp.write(buf);
                PACKET_COUNT.write(buf);
                (outcomes.len() as u32).write(buf);
                for outcome in outcomes {
                    outcome.write(buf);
                }
            }
            Self::ReadyToSend {
                sender,
                radio,
                timestamp,
            } => {
                sender.write(buf);
                radio.write(buf);
                timestamp.write(buf);
                // Window time
                0f32.write(buf);
            }
        }
    }
}

/// Decodes the value of the datum given as configuration.
impl Read for Notification {
    type Cfg = u32;

    fn read_cfg(buf: &mut impl Buf, datum: &u32) -> Result<Self, CodecError> {
        let sender = EntityId::read(buf)?;
        let radio = u16::read(buf)?;
        let timestamp = u32::read(buf)?;
        match *datum {
            PROCESS_MESSAGE_DATUM => {
                read_packet_count(buf)?;
                Ok(Self::ProcessMessage {
                    sender,
                    radio,
                    timestamp,
                    receiver: EntityId::read(buf)?,
                    delay: f64::read(buf)?,
                })
            }
            TIMEOUT_DATUM => {
                read_packet_count(buf)?;
                let count = u32::read(buf)? as usize;
                if count > MAX_TIMEOUT_DESTINATIONS {
                    return Err(CodecError::Invalid("Notification", "too many destinations"));
                }
                let mut outcomes = Vec::with_capacity(count);
                for _ in 0..count {
                    outcomes.push(Outcome::read(buf)?);
                }
                Ok(Self::Timeout {
                    sender,
                    radio,
                    timestamp,
                    receiver: receiver_of(&outcomes),
                    outcomes,
                })
            }
            READY_TO_SEND_DATUM => {
                f32::read(buf)?;
                Ok(Self::ReadyToSend {
                    sender,
                    radio,
                    timestamp,
                })
            }
            _ => Err(CodecError::Invalid("Notification", "unknown datum")),
        }
    }
}

fn read_packet_count(buf: &mut impl Buf) -> Result<(), CodecError> {
    if u32::read(buf)? != PACKET_COUNT {
        return Err(CodecError::Invalid("Notification", "unexpected packet count"));
    }
    Ok(())
}

impl EncodeSize for Notification {
    fn encode_size(&self) -> usize {
        let header = EntityId::SIZE + u16::SIZE + u32::SIZE;
        header
            + match self {
                Self::ProcessMessage { .. } => u32::SIZE + EntityId::SIZE + f64::SIZE,
                Self::Timeout { outcomes, .. } => {
                    u32::SIZE + u32::SIZE + outcomes.len() * Outcome::SIZE
                }
                Self::ReadyToSend { .. } => f32::SIZE,
            }
    }
}
