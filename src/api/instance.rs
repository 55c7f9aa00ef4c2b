//! Instance implementation, the main entry point of the fabric
//!
//! An `Instance` ties together the link layer, the router, and the
//! protocols riding on it. It is configured through [`InstanceBuilder`],
//! owns the background tasks that move peer events and frames into the
//! router, and exposes the protocol surfaces (bus, messenger, streams,
//! affinities) to the embedding application.

use crate::address::VertexId;
use crate::affinity::Affinity;
use crate::api::config::FabricConfig;
use crate::api::events::{Event, EventHandlers, SubscriptionHandle};
use crate::bus::Bus;
use crate::error::{Error, Result};
use crate::link::bridge::{LinkBridge, OpenBridge};
use crate::link::directory::LinkDirectory;
use crate::link::protocol_link::{InboundFrame, PeerEvent, ProtocolLink};
use crate::link::switchboard::{SwitchBoard, SwitchEvent};
use crate::link::{LinkId, LinkRef};
use crate::messenger::Messenger;
use crate::protocol::HandlerKind;
use crate::routing::{PacketHandler, PathHandler, PathVector, RouteInfo, Router};
use crate::stream::{Multiplexer, Streamer};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Current operational state of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Built but not started
    Created,
    /// Background tasks are running
    Running,
    /// Stopped; links are closed
    Stopped,
}

/// Builder for creating instances with progressive configuration
///
/// # Examples
///
/// ```no_run
/// use weftmesh::api::InstanceBuilder;
///
/// # fn example() -> weftmesh::Result<()> {
/// let instance = InstanceBuilder::new()
///     .with_max_hops(16)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct InstanceBuilder {
    config: FabricConfig,
    id: Option<VertexId>,
    bridge: Option<Arc<dyn LinkBridge>>,
}

impl InstanceBuilder {
    /// Create a builder with default settings
    pub fn new() -> Self {
        Self {
            config: FabricConfig::default(),
            id: None,
            bridge: None,
        }
    }

    /// Replace the whole configuration
    pub fn with_config(mut self, config: FabricConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a fixed identity instead of a generated one.
    ///
    /// Useful for tests and for embedders that persist identity
    /// themselves.
    pub fn with_id(mut self, id: VertexId) -> Self {
        self.id = Some(id);
        self
    }

    /// Restrict forwarding to explicitly associated link pairs
    pub fn with_bridge(mut self, bridge: Arc<dyn LinkBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    /// Set the maximum hops a path vector may carry
    pub fn with_max_hops(mut self, max_hops: usize) -> Self {
        self.config.max_hops = max_hops;
        self
    }

    /// Set the most distant source level this instance accepts
    pub fn with_accept_level(mut self, level: crate::protocol::Neighborhood) -> Self {
        self.config.accept_level = level;
        self
    }

    /// Build the instance.
    ///
    /// Validates the configuration and wires every protocol onto the
    /// router; nothing runs until [`Instance::start`].
    pub fn build(self) -> Result<Instance> {
        self.config.validate()?;
        let config = Arc::new(self.config);
        let local = self.id.unwrap_or_else(VertexId::random);
        let bridge = self.bridge.unwrap_or_else(|| Arc::new(OpenBridge));

        let events = EventHandlers::new();
        let (switch_tx, switch_rx) = mpsc::unbounded_channel();
        let switch = Arc::new(SwitchBoard::new(switch_tx));
        let router = Router::new(
            local,
            Arc::clone(&config),
            Arc::clone(&switch),
            bridge,
            events.clone(),
        );

        let path_vector = PathVector::new(router.clone());
        router.register_handler(
            HandlerKind::PathVector,
            Arc::downgrade(&path_vector) as Weak<dyn PacketHandler>,
        );

        let bus = Bus::new(router.clone());
        router.register_handler(
            HandlerKind::Bus,
            Arc::downgrade(&bus) as Weak<dyn PacketHandler>,
        );

        let affinity = Affinity::new(router.clone(), Arc::clone(&config));
        router.register_handler(
            HandlerKind::Affinity,
            Arc::downgrade(&affinity) as Weak<dyn PacketHandler>,
        );

        let messenger = Messenger::new(
            router.clone(),
            Arc::clone(&path_vector),
            Arc::clone(&config),
        );
        path_vector.register_handler(
            HandlerKind::Messenger,
            Arc::downgrade(&messenger) as Weak<dyn PathHandler>,
        );

        let mux = Multiplexer::new(
            local,
            Arc::clone(&path_vector),
            events.clone(),
            Arc::clone(&config),
        );
        path_vector.register_handler(
            HandlerKind::Streamer,
            Arc::downgrade(&mux) as Weak<dyn PathHandler>,
        );

        // Chains anchored through a vanished destination are torn down as
        // soon as the route goes.
        let weak_affinity = Arc::downgrade(&affinity);
        events.subscribe(move |event| {
            if let Event::RouteUnavailable { dest } = event {
                if let Some(affinity) = weak_affinity.upgrade() {
                    affinity.handle_route_loss(dest);
                }
            }
        });

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        Ok(Instance {
            directory: Arc::new(LinkDirectory::new(local)),
            config,
            events,
            switch,
            router,
            path_vector,
            bus,
            affinity,
            messenger,
            streamer: Streamer::new(mux),
            links: Mutex::new(HashMap::new()),
            peer_tx,
            inbound_tx,
            intake: Mutex::new(Some(Intake {
                switch_rx,
                peer_rx,
                inbound_rx,
            })),
            state: RwLock::new(InstanceState::Created),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

impl Default for InstanceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver halves consumed by the background tasks on start
struct Intake {
    switch_rx: mpsc::UnboundedReceiver<SwitchEvent>,
    peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    inbound_rx: mpsc::UnboundedReceiver<InboundFrame>,
}

/// One participant in the fabric.
///
/// Create it through [`InstanceBuilder`], register links, start it, and
/// use the protocol accessors to talk to the rest of the mesh.
pub struct Instance {
    directory: Arc<LinkDirectory>,
    config: Arc<FabricConfig>,
    events: EventHandlers,
    switch: Arc<SwitchBoard>,
    router: Router,
    path_vector: Arc<PathVector>,
    bus: Arc<Bus>,
    affinity: Arc<Affinity>,
    messenger: Arc<Messenger>,
    streamer: Streamer,
    links: Mutex<HashMap<LinkId, Arc<ProtocolLink>>>,
    peer_tx: mpsc::UnboundedSender<PeerEvent>,
    inbound_tx: mpsc::UnboundedSender<InboundFrame>,
    intake: Mutex<Option<Intake>>,
    state: RwLock<InstanceState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Instance {
    /// The identity this instance presents on internal links
    pub fn id(&self) -> VertexId {
        self.directory.local_id()
    }

    /// The active configuration
    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    /// Current state
    pub fn state(&self) -> InstanceState {
        *self.state.read()
    }

    /// Subscribe to instance events
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        self.events.subscribe(callback)
    }

    /// Remove an event subscription
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.events.unsubscribe(handle);
    }

    /// The controlled-flooding event bus
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// The point-to-point messenger
    pub fn messenger(&self) -> &Messenger {
        &self.messenger
    }

    /// The stream surface
    pub fn streamer(&self) -> &Streamer {
        &self.streamer
    }

    /// Host-affinity failure chains
    pub fn affinity(&self) -> &Affinity {
        &self.affinity
    }

    /// The router underneath the protocols
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// The current route toward `dest`, if any
    pub fn route_to(&self, dest: &VertexId) -> Option<RouteInfo> {
        self.router.route_to(dest)
    }

    /// All destinations with a live route
    pub fn known_destinations(&self) -> Vec<VertexId> {
        self.router.known_destinations()
    }

    /// Register a link.
    ///
    /// Started immediately when the instance is running, otherwise when
    /// [`Instance::start`] is called.
    pub fn add_link(&self, link: LinkRef) -> Result<()> {
        self.directory.register(link.clone())?;
        let id = link.id().clone();
        let plink = Arc::new(ProtocolLink::new(
            link,
            self.directory.identity_for(&id),
            self.config.handshake_timeout,
            self.peer_tx.clone(),
            self.inbound_tx.clone(),
        ));
        if *self.state.read() == InstanceState::Running {
            plink.start()?;
        }
        self.links.lock().insert(id, plink);
        Ok(())
    }

    /// Unregister and close a link
    pub fn remove_link(&self, id: &LinkId) -> Result<()> {
        self.directory
            .unregister(id)
            .ok_or_else(|| Error::Link(format!("link {id} not registered")))?;
        if let Some(plink) = self.links.lock().remove(id) {
            plink.close();
        }
        Ok(())
    }

    /// Start the instance: bring up every registered link and spawn the
    /// background tasks.
    pub fn start(&self) -> Result<()> {
        let Some(intake) = self.intake.lock().take() else {
            return Err(Error::Config("instance already started".into()));
        };
        *self.state.write() = InstanceState::Running;

        for plink in self.links.lock().values() {
            plink.start()?;
        }

        let mut tasks = self.tasks.lock();
        tasks.push(self.spawn_peer_task(intake.peer_rx));
        tasks.push(self.spawn_switch_task(intake.switch_rx));
        tasks.push(self.spawn_inbound_task(intake.inbound_rx));
        tasks.push(self.spawn_maintenance_task());
        drop(tasks);

        info!(id = %self.id(), "instance started");
        self.events.dispatch(Event::Started);
        Ok(())
    }

    /// Stop the instance: close every link and cancel the background
    /// tasks. Peers observe the loss through their link layer.
    pub fn stop(&self) {
        if *self.state.read() != InstanceState::Running {
            return;
        }
        *self.state.write() = InstanceState::Stopped;
        for plink in self.links.lock().values() {
            plink.close();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!(id = %self.id(), "instance stopped");
        self.events.dispatch(Event::Stopped);
    }

    /// Peer channels settle here after the handshake
    fn spawn_peer_task(&self, mut rx: mpsc::UnboundedReceiver<PeerEvent>) -> JoinHandle<()> {
        let switch = Arc::clone(&self.switch);
        let directory = Arc::clone(&self.directory);
        let local = self.id();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    PeerEvent::PeerUp {
                        peer,
                        link,
                        cost,
                        external,
                        tx,
                    } => {
                        if external && !directory.note_external_peer(peer, &link) {
                            // The same edge id cannot arrive over two links.
                            warn!(%peer, %link, "rejecting duplicate external peer");
                            crate::link::protocol_link::send_goodbye(&tx, &local);
                            continue;
                        }
                        switch.add_channel(peer, link, cost, external, tx);
                    }
                    PeerEvent::PeerDown { peer, link } => {
                        debug!(%peer, %link, "peer channel down");
                        switch.remove_channel(&peer, &link);
                        if peer.is_external() && !switch.is_adjacent(&peer) {
                            directory.forget_external_peer(&peer);
                        }
                    }
                }
            }
        })
    }

    /// Adjacency changes flow into the router, which reacts with table
    /// deltas; those are flushed right away so convergence is not gated
    /// on the maintenance tick.
    fn spawn_switch_task(&self, mut rx: mpsc::UnboundedReceiver<SwitchEvent>) -> JoinHandle<()> {
        let router = self.router.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                router.handle_switch_event(event);
                router.flush_broadcasts();
            }
        })
    }

    fn spawn_inbound_task(&self, mut rx: mpsc::UnboundedReceiver<InboundFrame>) -> JoinHandle<()> {
        let router = self.router.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                router.handle_frame(frame);
                router.flush_broadcasts();
            }
        })
    }

    fn spawn_maintenance_task(&self) -> JoinHandle<()> {
        let router = self.router.clone();
        let affinity = Arc::downgrade(&self.affinity);
        let period = self.config.sweep_period;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                router.run_maintenance();
                match affinity.upgrade() {
                    Some(affinity) => affinity.expire(),
                    None => break,
                }
            }
        })
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.stop();
    }
}
