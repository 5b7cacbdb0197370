//! Entry points of the bridge on partition 0.
//!
//! The [Bridge] receives federation callbacks (discoveries, updates, removals, and
//! communication requests), its own timers ([Event]), and envelopes returned by other
//! partitions. Fatal conditions are returned as [Error]; everything else is logged and
//! dropped.

use crate::{
    config::{Config, Records},
    forwarder::{Envelope, Forwarder},
    geo::{Geodetic, Orientation},
    notification::{encode_timestamp, Notification, MAX_TIMEOUT_DESTINATIONS},
    reflector::{EntityState, RadioState, Reflector},
    registry::{EntityHandle, RadioHandle, Registry},
    request::{self, Delivery, FragmentPlan, Header, Request, Transport},
    tracker::{DestinationRecord, OutstandingMessage, Tracker},
    types::{DamageState, EntityId, NodeId, FEDERATION_PARTITION},
    Clock, Error, Federation, Messenger, Nodes, Scheduler, Warning,
};
use bytes::Bytes;
use prometheus_client::{metrics::counter::Counter, registry::Registry as Metrics};
use tracing::{debug, info, warn};

/// Timers scheduled by the bridge on partition 0.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// Message `message` of node `source` timed out.
    Timeout { source: NodeId, message: u32 },
    /// Adjust the transmit power of the radios of `entity` for `damage`.
    ChangeMaxTxPower {
        entity: EntityHandle,
        damage: DamageState,
    },
    /// Move a display hierarchy.
    HierarchyMobility {
        hierarchy: u32,
        position: Geodetic,
        orientation: Orientation,
    },
}

/// The federation side of the simulation.
pub struct Bridge {
    config: Config,
    reflector: Reflector,
    tracker: Tracker,
    forwarder: Forwarder,

    dropped: Counter,
}

impl Bridge {
    /// Creates a bridge over a populated `registry`.
    pub fn new(config: Config, registry: Registry, metrics: &mut Metrics) -> Self {
        let dropped = Counter::default();
        metrics.register(
            "dropped",
            "requests and updates dropped",
            dropped.clone(),
        );
        let reflector = Reflector::new(&config, registry, metrics, dropped.clone());
        let tracker = Tracker::new(config.max_message_id, metrics);
        let forwarder = Forwarder::new(FEDERATION_PARTITION, metrics);
        Self {
            config,
            reflector,
            tracker,
            forwarder,
            dropped,
        }
    }

    /// Creates a bridge from static records.
    ///
    /// Every node in `nodes` that has no configured radio is given a synthetic
    /// identity.
    pub fn init(
        config: Config,
        records: &Records,
        nodes: impl IntoIterator<Item = NodeId>,
        metrics: &mut Metrics,
    ) -> Result<Self, Error> {
        let mut registry = Registry::load(config.seed, records)?;
        registry.assign_synthetic_ids(nodes, config.site_id, config.application_id);
        info!(
            entities = records.entities.len(),
            radios = records.radios.len(),
            networks = records.networks.len(),
            "loaded records"
        );
        Ok(Self::new(config, registry, metrics))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn reflector(&self) -> &Reflector {
        &self.reflector
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn forwarder(&self) -> &Forwarder {
        &self.forwarder
    }

    pub fn on_entity_discovered<E: Scheduler + Nodes>(
        &mut self,
        ctx: &mut E,
        state: &EntityState,
    ) -> Result<(), Error> {
        for radio in self.reflector.discover_entity(ctx, state)? {
            self.announce(ctx, radio)?;
        }
        Ok(())
    }

    pub fn on_entity_updated<E: Scheduler + Nodes>(
        &mut self,
        ctx: &mut E,
        state: &EntityState,
    ) -> Result<(), Error> {
        self.reflector.update_entity(ctx, state)
    }

    pub fn on_entity_removed(&mut self, id: &EntityId) {
        self.reflector.remove_entity(id);
    }

    pub fn on_radio_discovered<E: Scheduler + Nodes>(
        &mut self,
        ctx: &mut E,
        state: &RadioState,
    ) -> Result<(), Error> {
        if let Some(radio) = self.reflector.discover_radio(ctx, state)? {
            self.announce(ctx, radio)?;
        }
        Ok(())
    }

    pub fn on_radio_updated<E: Scheduler + Nodes>(&mut self, ctx: &mut E, state: &RadioState) {
        self.reflector.update_radio(ctx, state);
    }

    pub fn on_radio_removed<E: Scheduler + Nodes>(&mut self, ctx: &mut E, state: &RadioState) {
        self.reflector.remove_radio(ctx, state);
    }

    /// Turns a communication request into a simulated message.
    pub fn on_comm_effects_request<E: Scheduler + Messenger>(
        &mut self,
        ctx: &mut E,
        request: &Request,
    ) -> Result<(), Error> {
        // Parse and route
        let header = match Header::parse(&request.data) {
            Ok(header) => header,
            Err(warning) => {
                self.drop_request(warning);
                return Ok(());
            }
        };
        let route = match request::route(&self.reflector, self.config.protocol, request, &header) {
            Ok(route) => route,
            Err(warning) => {
                self.drop_request(warning);
                return Ok(());
            }
        };
        if route.targets.len() > MAX_TIMEOUT_DESTINATIONS {
            return Err(Error::TooManyDestinations(route.targets.len()));
        }

        // Assign an identifier
        let radio = self.reflector.registry().radio(route.source);
        let (source, index, link, rx_rate) =
            (radio.node(), radio.index(), radio.link(), radio.rx_rate());
        let id = self.tracker.next_id(source)?;

        // Start the messenger once the federation has granted the current time
        let now = ctx.current();
        let send_time = ctx.external().max(now);
        let delay = send_time - now;
        let plan = FragmentPlan::new(header.size, link, request.sample_rate, rx_rate);
        for destination in route.destinations {
            let delivery = Delivery {
                source,
                message: id,
                destination,
                transport: Transport::for_link(link),
                plan,
                voice: header.size.is_voice(),
                delay,
                timeout: header.timeout,
            };
            self.forwarder.start(ctx, delivery)?;
        }
        ctx.schedule(delay + header.timeout, Event::Timeout { source, message: id });

        // Track each destination entity once
        let mut destinations: Vec<DestinationRecord> = Vec::with_capacity(route.targets.len());
        for target in &route.targets {
            if destinations.iter().all(|record| record.handle != target.handle) {
                destinations.push(DestinationRecord::new(target.handle, target.entity));
            }
        }
        debug!(
            source,
            id,
            sender = %route.sender,
            destinations = destinations.len(),
            ?send_time,
            "request accepted"
        );
        self.tracker.track(
            source,
            id,
            OutstandingMessage {
                sender: route.sender,
                radio: index,
                timestamp: header.timestamp,
                send_time,
                destinations,
            },
        );
        Ok(())
    }

    /// Handles a timer scheduled by the bridge.
    pub fn on_event<E: Scheduler + Nodes + Federation>(
        &mut self,
        ctx: &mut E,
        event: Event,
    ) -> Result<(), Error> {
        match event {
            Event::Timeout { source, message } => self.tracker.timeout(ctx, source, message),
            Event::ChangeMaxTxPower { entity, damage } => {
                self.reflector.change_max_tx_power(ctx, entity, damage);
                Ok(())
            }
            Event::HierarchyMobility {
                hierarchy,
                position,
                orientation,
            } => {
                ctx.move_hierarchy(hierarchy, position, orientation);
                Ok(())
            }
        }
    }

    /// Handles a frame received from another partition.
    pub fn on_frame<E: Scheduler + Messenger + Federation>(
        &mut self,
        ctx: &mut E,
        frame: Bytes,
    ) -> Result<(), Error> {
        match self.forwarder.receive(ctx, frame)? {
            Some(envelope) => self.on_envelope(ctx, envelope),
            None => Ok(()),
        }
    }

    /// Handles an envelope addressed to the bridge.
    pub fn on_envelope<E: Clock + Federation>(
        &mut self,
        ctx: &mut E,
        envelope: Envelope,
    ) -> Result<(), Error> {
        match envelope {
            Envelope::Completed {
                source,
                message,
                destination,
                success,
            } => {
                // Results are matched to the entity the node represents
                let Some(radio) = self.reflector.registry().radio_by_node(destination) else {
                    debug!(source, message, destination, "ignoring result for unknown node");
                    return Ok(());
                };
                let entity = self.reflector.registry().radio(radio).entity();
                self.tracker
                    .complete(ctx, source, message, entity, success)
            }
            Envelope::RtssReady { node } => {
                let registry = self.reflector.registry();
                let radio = registry
                    .radio_by_node(node)
                    .ok_or(Error::UnknownNode(node))?;
                let radio = registry.radio(radio);
                let Some(sender) = registry.entity(radio.entity()).id() else {
                    debug!(node, "ignoring ready-to-send for unreflected radio");
                    return Ok(());
                };
                let timestamp = encode_timestamp(ctx.seconds_past_hour(), true)?;
                ctx.notify(Notification::ReadyToSend {
                    sender,
                    radio: radio.index(),
                    timestamp,
                });
                Ok(())
            }
            Envelope::StartMessenger(_) | Envelope::SendRtss { .. } => {
                Err(Error::MisroutedEnvelope(FEDERATION_PARTITION))
            }
        }
    }

    /// Announces link radios that just became reflected.
    fn announce<E: Scheduler>(&self, ctx: &mut E, radio: RadioHandle) -> Result<(), Error> {
        let radio = self.reflector.registry().radio(radio);
        if !radio.link().is_tactical() {
            return Ok(());
        }
        self.forwarder.request_ready(ctx, radio.node())
    }

    fn drop_request(&self, warning: Warning) {
        self.dropped.inc();
        if warning == Warning::NoReceivers && !self.config.verbose {
            debug!(%warning, "dropping request");
            return;
        }
        warn!(%warning, "dropping request");
    }
}
