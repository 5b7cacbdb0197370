//! Envelopes exchanged between partitions and their routing.
//!
//! Only partition 0 talks to the federation. Deliveries must start on the partition
//! that owns the source node, and their results must come back to partition 0, so both
//! travel as [Envelope]s. Each envelope is encoded as a tagged binary frame.

use crate::{
    request::Delivery,
    types::{NodeId, PartitionId, FEDERATION_PARTITION},
    Messenger, Scheduler,
};
use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{DecodeExt, EncodeSize, Error as CodecError, Read, ReadExt, Write};
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use std::time::Duration;
use tracing::debug;

/// Delay of envelopes that must be handled after the sender's current time.
const TICK: Duration = Duration::from_nanos(1);

/// Delivery guarantee of a forwarded envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Handled no earlier than the receiver's equivalent of the send time. Required
    /// when the handler schedules further simulation events.
    Safe,
    /// Handled as soon as possible.
    Loose,
}

/// Work sent from one partition to another.
#[derive(Clone, Debug, PartialEq)]
pub enum Envelope {
    /// Start simulating a delivery on the partition of its source node.
    StartMessenger(Delivery),
    /// Result of a delivery at one destination node.
    Completed {
        source: NodeId,
        message: u32,
        destination: NodeId,
        success: bool,
    },
    /// Check whether the radio of `node` is ready to send.
    SendRtss { node: NodeId },
    /// The radio of `node` is ready to send.
    RtssReady { node: NodeId },
}

impl Write for Envelope {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Envelope::StartMessenger(delivery) => {
                0u8.write(buf);
                delivery.write(buf);
            }
            Envelope::Completed {
                source,
                message,
                destination,
                success,
            } => {
                1u8.write(buf);
                source.write(buf);
                message.write(buf);
                destination.write(buf);
                success.write(buf);
            }
            Envelope::SendRtss { node } => {
                2u8.write(buf);
                node.write(buf);
            }
            Envelope::RtssReady { node } => {
                3u8.write(buf);
                node.write(buf);
            }
        }
    }
}

impl Read for Envelope {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let envelope = match u8::read(buf)? {
            0 => Envelope::StartMessenger(Delivery::read(buf)?),
            1 => Envelope::Completed {
                source: NodeId::read(buf)?,
                message: u32::read(buf)?,
                destination: NodeId::read(buf)?,
                success: bool::read(buf)?,
            },
            2 => Envelope::SendRtss {
                node: NodeId::read(buf)?,
            },
            3 => Envelope::RtssReady {
                node: NodeId::read(buf)?,
            },
            i => return Err(CodecError::InvalidEnum(i)),
        };
        Ok(envelope)
    }
}

impl EncodeSize for Envelope {
    fn encode_size(&self) -> usize {
        1 + match self {
            Envelope::StartMessenger(delivery) => delivery.encode_size(),
            Envelope::Completed {
                source,
                message,
                destination,
                success,
            } => {
                source.encode_size()
                    + message.encode_size()
                    + destination.encode_size()
                    + success.encode_size()
            }
            Envelope::SendRtss { node } | Envelope::RtssReady { node } => node.encode_size(),
        }
    }
}

/// Routes envelopes into and out of one partition.
pub struct Forwarder {
    partition: PartitionId,
    forwarded: Counter,
}

impl Forwarder {
    pub fn new(partition: PartitionId, registry: &mut Registry) -> Self {
        let forwarded = Counter::default();
        registry.register(
            "forwarded",
            "envelopes sent to another partition",
            forwarded.clone(),
        );
        Self {
            partition,
            forwarded,
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Starts `delivery` on the partition of its source node.
    pub fn start<E: Scheduler + Messenger>(
        &self,
        ctx: &mut E,
        delivery: Delivery,
    ) -> Result<(), crate::Error> {
        let partition = ctx
            .partition_of(delivery.source)
            .ok_or(crate::Error::UnknownNode(delivery.source))?;
        if partition == self.partition {
            ctx.deliver(delivery);
            return Ok(());
        }
        self.forward(ctx, partition, Duration::ZERO, Mode::Safe, Envelope::StartMessenger(delivery));
        Ok(())
    }

    /// Reports the result of a delivery at `destination` to partition 0.
    ///
    /// On partition 0 the result is returned to the caller instead.
    pub fn delivered<E: Scheduler>(
        &self,
        ctx: &mut E,
        source: NodeId,
        message: u32,
        destination: NodeId,
        success: bool,
    ) -> Option<Envelope> {
        let envelope = Envelope::Completed {
            source,
            message,
            destination,
            success,
        };
        if self.partition == FEDERATION_PARTITION {
            return Some(envelope);
        }
        self.forward(ctx, FEDERATION_PARTITION, Duration::ZERO, Mode::Loose, envelope);
        None
    }

    /// Asks the partition of `node` to report when its radio is ready to send.
    pub fn request_ready<E: Scheduler>(&self, ctx: &mut E, node: NodeId) -> Result<(), crate::Error> {
        let partition = ctx
            .partition_of(node)
            .ok_or(crate::Error::UnknownNode(node))?;
        self.forward(ctx, partition, TICK, Mode::Safe, Envelope::SendRtss { node });
        Ok(())
    }

    /// Handles a frame received from another partition.
    ///
    /// Envelopes that must be handled by the bridge ([Envelope::Completed] and
    /// [Envelope::RtssReady]) are returned.
    pub fn receive<E: Scheduler + Messenger>(
        &self,
        ctx: &mut E,
        frame: Bytes,
    ) -> Result<Option<Envelope>, crate::Error> {
        let envelope = Envelope::decode(frame)?;
        match envelope {
            Envelope::StartMessenger(delivery) => {
                debug!(
                    source = delivery.source,
                    message = delivery.message,
                    "starting forwarded delivery"
                );
                ctx.deliver(delivery);
                Ok(None)
            }
            Envelope::SendRtss { node } => {
                self.forward(
                    ctx,
                    FEDERATION_PARTITION,
                    Duration::ZERO,
                    Mode::Loose,
                    Envelope::RtssReady { node },
                );
                Ok(None)
            }
            Envelope::Completed { .. } | Envelope::RtssReady { .. } => {
                if self.partition != FEDERATION_PARTITION {
                    return Err(crate::Error::MisroutedEnvelope(self.partition));
                }
                Ok(Some(envelope))
            }
        }
    }

    fn forward<E: Scheduler>(
        &self,
        ctx: &mut E,
        partition: PartitionId,
        delay: Duration,
        mode: Mode,
        envelope: Envelope,
    ) {
        debug!(from = self.partition, to = partition, ?mode, ?envelope, "forwarding");
        if partition != self.partition {
            self.forwarded.inc();
        }
        ctx.forward(partition, delay, mode, envelope);
    }
}
