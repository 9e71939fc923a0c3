use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::config::ClientConfig;
use crate::error::{Result, SessionError};
use crate::events::{DisconnectReason, SessionEvent};
use crate::identity::{IdSpace, NetworkId, PeerIdentity};
use crate::message::{AnyMessage, Reliability, Role, Routing};
use crate::net::{
    Channel, Delivered, Frame, NetworkEndpoint, NetworkStats, Packet, PacketBody, PacketHeader,
    Peer, PeerTable, Transport,
};
use crate::object::{Outbound, ReplicatedObject};
use crate::prefab::PrefabTable;
use crate::registry::{Address, Decoded, Delivery, MessageRegistry};
use crate::scene::{SceneIndex, SceneLoader};
use crate::session::SessionContext;
use crate::system::{Destroy, PeerList, SceneChange, SceneLoaded, Spawn};

const MAX_DIRECT_PEERS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    AwaitingSceneDirective,
    /// Loading a scene; object traffic is dropped until it completes.
    Loading(SceneIndex),
    Synced,
}

/// A node following exactly one host.
pub struct Client<T> {
    endpoint: NetworkEndpoint<T>,
    session: SessionContext,
    config: ClientConfig,
    loader: Box<dyn SceneLoader>,
    state: ClientState,
    host_addr: SocketAddr,
    host: Option<PeerIdentity>,
    host_channel: Channel,
    last_host_receive: Instant,
    connect_started: Instant,
    last_request: Option<Instant>,
    direct: PeerTable,
}

impl<T: Transport> Client<T> {
    /// Starts connecting to the host at `host_addr`. The request goes out on
    /// the first pump and is retried until the host answers.
    pub fn connect(
        transport: T,
        host_addr: SocketAddr,
        config: ClientConfig,
        registry: MessageRegistry,
        prefabs: PrefabTable,
        loader: impl SceneLoader + 'static,
    ) -> Self {
        let endpoint = NetworkEndpoint::new(transport, config.session.max_receive_batch);
        let resend = config.session.resend_interval();
        let mut session =
            SessionContext::new(config.session.clone(), Role::Client, registry, prefabs);
        session.scheduler.freeze();

        log::info!(
            "client {} on {} connecting to {host_addr}",
            session.identity(),
            endpoint.local_addr()
        );

        let now = Instant::now();
        Self {
            endpoint,
            session,
            config,
            loader: Box::new(loader),
            state: ClientState::Connecting,
            host_addr,
            host: None,
            host_channel: Channel::new(resend),
            last_host_receive: now,
            connect_started: now,
            last_request: None,
            direct: PeerTable::new(MAX_DIRECT_PEERS, resend),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn transport(&self) -> &T {
        self.endpoint.transport()
    }

    pub fn identity(&self) -> PeerIdentity {
        self.session.identity()
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_synced(&self) -> bool {
        self.state == ClientState::Synced
    }

    pub fn host(&self) -> Option<PeerIdentity> {
        self.host
    }

    pub fn scene(&self) -> Option<SceneIndex> {
        self.session.scene()
    }

    /// Other clients this node can reach without going through the host.
    pub fn direct_peers(&self) -> impl Iterator<Item = &Peer> {
        self.direct.iter()
    }

    pub fn object(&self, id: NetworkId) -> Option<&ReplicatedObject> {
        self.session.object(id)
    }

    pub fn object_mut(&mut self, id: NetworkId) -> Option<&mut ReplicatedObject> {
        self.session.object_mut(id)
    }

    pub fn object_ids(&self) -> Vec<NetworkId> {
        self.session.object_ids()
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.session.drain_events()
    }

    pub fn stats(&self) -> NetworkStats {
        let mut stats = self.endpoint.stats().clone();
        stats.resends = self.host_channel.resends()
            + self.direct.iter().map(|peer| peer.channel.resends()).sum::<u64>();
        stats.rtt_ms = self.host_channel.srtt();
        stats.rtt_variance = self.host_channel.rtt_var();
        stats
    }

    /// Sends an application message. `ViaHost` messages go to the host for
    /// relaying, `PeerToPeer` messages go to the host and every direct peer.
    pub fn broadcast(&mut self, message: &dyn AnyMessage) -> Result<()> {
        self.require_connected()?;
        let encoded = self.session.registry.encode(None, message)?;
        self.route(Frame::new(encoded.bytes), encoded.delivery)
    }

    /// Sends an application message to the host or to one direct peer.
    pub fn send_to(&mut self, identity: PeerIdentity, message: &dyn AnyMessage) -> Result<()> {
        self.require_connected()?;
        let encoded = self.session.registry.encode(None, message)?;
        let frame = Frame::new(encoded.bytes);
        let lane = encoded.delivery.reliability;

        if Some(identity) == self.host {
            return self.queue_host(frame, lane);
        }
        let peer = self
            .direct
            .get_mut(identity)
            .ok_or(SessionError::UnknownPeer(identity))?;
        queue(&mut peer.channel, frame, lane)
    }

    /// Sends one behaviour message for an object this client owns, outside
    /// the tick cadence.
    pub fn send_update(
        &mut self,
        id: NetworkId,
        behaviour: u8,
        message: Box<dyn AnyMessage>,
    ) -> Result<()> {
        self.require_connected()?;
        self.session.require_local_owner(id)?;
        let outbound = Outbound::addressed(Address::new(id, behaviour), message);
        let (frame, delivery) = self.session.encode(&outbound)?;
        self.route(frame, delivery)
    }

    /// Destroys an object this client owns and asks the host to announce it.
    pub fn destroy(&mut self, id: NetworkId) -> Result<()> {
        self.require_connected()?;
        self.session.require_local_owner(id)?;
        self.session.destroy_local(id);
        self.send_to_host(&Outbound::system(Destroy { network_id: id }))
    }

    pub fn disconnect(&mut self) {
        if self.state == ClientState::Disconnected {
            return;
        }
        self.send_control(PacketBody::Disconnect);
        log::info!("disconnecting from {}", self.host_addr);
        self.end_session(DisconnectReason::Graceful);
    }

    /// One cycle: receive and dispatch, retry the handshake, advance scene
    /// loading, check the host timeout, produce updates on broadcast ticks,
    /// then flush.
    pub fn pump(&mut self, delta: Duration) -> Result<()> {
        for (packet, addr) in self.endpoint.receive()? {
            self.handle_packet(packet, addr);
        }

        match self.state {
            ClientState::Disconnected => return Ok(()),
            ClientState::Connecting => {
                if self.connect_started.elapsed() > self.config.session.timeout() {
                    log::warn!("host {} never answered", self.host_addr);
                    self.end_session(DisconnectReason::Timeout);
                    return Ok(());
                }
                self.retry_request();
                return Ok(());
            }
            _ => {}
        }

        self.poll_loader();

        if self.last_host_receive.elapsed() > self.config.session.timeout() {
            log::warn!("host {} timed out", self.host_addr);
            self.end_session(DisconnectReason::Timeout);
            return Ok(());
        }

        self.session.scheduler.advance(delta);
        if self.session.scheduler.should_broadcast() {
            self.broadcast_owned_updates();
        }

        self.flush();
        Ok(())
    }

    fn retry_request(&mut self) {
        let due = self
            .last_request
            .is_none_or(|sent| sent.elapsed() >= self.config.handshake_retry());
        if !due {
            return;
        }
        self.last_request = Some(Instant::now());
        let request = PacketBody::ConnectionRequest {
            identity: self.identity().get(),
            fingerprint: self.session.registry.fingerprint(),
        };
        self.send_control(request);
    }

    fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        if addr != self.host_addr {
            self.handle_direct_packet(packet, addr);
            return;
        }

        match packet.body {
            PacketBody::ConnectionAccepted { host_identity } => {
                if self.state != ClientState::Connecting {
                    return;
                }
                let host = PeerIdentity(host_identity);
                log::info!("connected to host {host} at {addr}");
                self.host = Some(host);
                self.host_channel.reset();
                self.last_host_receive = Instant::now();
                self.state = ClientState::AwaitingSceneDirective;
                self.session
                    .events
                    .push_back(SessionEvent::Connected { host });
            }
            PacketBody::ConnectionDenied { reason } => {
                if self.state != ClientState::Connecting {
                    return;
                }
                log::warn!("connection denied: {reason}");
                self.state = ClientState::Disconnected;
                self.session
                    .events
                    .push_back(SessionEvent::ConnectionDenied { reason });
            }
            PacketBody::Data {
                reliable,
                unreliable,
            } => {
                let Some(host) = self.host else {
                    return;
                };
                if self.state == ClientState::Disconnected {
                    return;
                }
                self.last_host_receive = Instant::now();
                if let Some(delivered) =
                    self.host_channel
                        .receive(&packet.header, reliable, unreliable)
                {
                    self.handle_delivered(host, delivered, true);
                }
            }
            PacketBody::Disconnect => {
                if self.state != ClientState::Disconnected {
                    log::info!("host closed the session");
                    self.end_session(DisconnectReason::Graceful);
                }
            }
            PacketBody::ConnectionRequest { .. } => {
                log::debug!("ignoring connection request from host address");
            }
        }
    }

    fn handle_direct_packet(&mut self, packet: Packet, addr: SocketAddr) {
        let PacketBody::Data {
            reliable,
            unreliable,
        } = packet.body
        else {
            log::trace!("non-data packet from {addr}; dropped");
            return;
        };
        let Some(peer) = self.direct.get_by_addr_mut(&addr) else {
            log::trace!("data from unknown address {addr}; dropped");
            return;
        };
        peer.touch();
        let sender = peer.identity;
        if let Some(delivered) = peer.channel.receive(&packet.header, reliable, unreliable) {
            self.handle_delivered(sender, delivered, false);
        }
    }

    fn handle_delivered(&mut self, sender: PeerIdentity, delivered: Delivered, from_host: bool) {
        for frame in delivered.reliable.into_iter().chain(delivered.unreliable) {
            let decoded = match self.session.registry.decode(&frame.bytes) {
                Ok(decoded) => decoded,
                Err(e) => {
                    log::warn!("dropping frame from {sender}: {e}");
                    continue;
                }
            };
            if from_host {
                self.handle_host_message(sender, frame.origin.map(PeerIdentity), decoded);
            } else {
                self.handle_peer_message(sender, decoded);
            }
        }
    }

    fn handle_host_message(
        &mut self,
        host: PeerIdentity,
        origin: Option<PeerIdentity>,
        decoded: Decoded,
    ) {
        if let Some(address) = decoded.address {
            // relayed updates must come from the owner; the host's own
            // traffic is authoritative
            let authorised = origin.is_none_or(|origin| {
                self.session.owner_of(address.network_id) == Some(origin)
            });
            if !authorised {
                log::debug!("relayed {} for {address} from non-owner; rejected", decoded.message.name());
                return;
            }
            self.apply_object_update(address, decoded);
            return;
        }

        if self.session.registry.is_system(decoded.id) {
            if origin.is_some() {
                log::warn!("relayed {} dropped", decoded.message.name());
                return;
            }
            self.handle_system_message(decoded.message);
            return;
        }

        self.session
            .dispatch_to_app(origin.unwrap_or(host), decoded);
    }

    fn handle_peer_message(&mut self, sender: PeerIdentity, decoded: Decoded) {
        if let Some(address) = decoded.address {
            if self.session.owner_of(address.network_id) != Some(sender) {
                log::debug!(
                    "{} for {address} from non-owner {sender}; rejected",
                    decoded.message.name()
                );
                return;
            }
            self.apply_object_update(address, decoded);
            return;
        }

        if self.session.registry.is_system(decoded.id) {
            log::warn!("{} from peer {sender}; dropped", decoded.message.name());
            return;
        }

        self.session.dispatch_to_app(sender, decoded);
    }

    fn apply_object_update(&mut self, address: Address, decoded: Decoded) {
        if !self.is_synced() {
            log::trace!("{} for {address} while loading; dropped", decoded.message.name());
            return;
        }
        if decoded.delivery.scope.admits(Role::Client) {
            self.session
                .apply_update(address, decoded.message.as_ref());
        }
    }

    fn handle_system_message(&mut self, message: Box<dyn AnyMessage>) {
        if let Some(change) = message.downcast_ref::<SceneChange>() {
            self.begin_scene_load(change.scene);
        } else if let Some(spawn) = message.downcast_ref::<Spawn>() {
            if self.is_synced() {
                self.spawn_remote(*spawn);
            } else {
                log::trace!("spawn of {} while loading; dropped", spawn.network_id);
            }
        } else if let Some(destroy) = message.downcast_ref::<Destroy>() {
            // persistent objects outlive a load, so their Destroy still applies
            let persistent = destroy.network_id.space() == Some(IdSpace::Persistent);
            if self.is_synced() || persistent {
                self.session.destroy_local(destroy.network_id);
            } else {
                log::trace!("destroy of {} while loading; dropped", destroy.network_id);
            }
        } else if let Some(list) = message.downcast_ref::<PeerList>() {
            self.update_direct_peers(list);
        } else {
            log::warn!("unexpected {} from host; dropped", message.name());
        }
    }

    fn spawn_remote(&mut self, spawn: Spawn) {
        if let Some(existing) = self.session.object(spawn.network_id) {
            if existing.prefab() == spawn.prefab {
                log::trace!("{} already live; spawn ignored", spawn.network_id);
                return;
            }
            log::warn!(
                "{} respawned as {} over {}",
                spawn.network_id,
                spawn.prefab,
                existing.prefab()
            );
        }
        if let Err(e) = self
            .session
            .instantiate(spawn.prefab, spawn.network_id, spawn.owner)
        {
            log::warn!("could not spawn {}: {e}", spawn.network_id);
        }
    }

    fn begin_scene_load(&mut self, scene: SceneIndex) {
        log::info!("host directed a change to {scene}");
        self.session.unload_scene_objects();
        self.session.scheduler.freeze();
        self.loader.begin_load(scene);
        self.state = ClientState::Loading(scene);
        self.poll_loader();
    }

    fn poll_loader(&mut self) {
        let ClientState::Loading(scene) = self.state else {
            return;
        };
        let Some(loaded) = self.loader.poll_loaded() else {
            return;
        };
        if loaded.index != scene {
            log::debug!("{} finished loading after being superseded", loaded.index);
            return;
        }
        let Some(host) = self.host else {
            return;
        };

        self.session.load_scene_objects(&loaded, host);
        if let Err(e) = self.send_to_host(&Outbound::system(SceneLoaded { scene })) {
            log::error!("could not confirm {scene}: {e}");
        }
        self.state = ClientState::Synced;
        self.session.scheduler.resume();
        self.session
            .events
            .push_back(SessionEvent::SceneLoaded { scene });
    }

    fn update_direct_peers(&mut self, list: &PeerList) {
        let me = self.identity();
        for identity in self.direct.identities() {
            if !list.peers.iter().any(|entry| entry.identity == identity) {
                log::debug!("direct peer {identity} left");
                self.direct.remove(identity);
            }
        }

        for entry in list.peers.iter().filter(|entry| entry.identity != me) {
            let known = self.direct.get(entry.identity).map(|peer| peer.addr);
            match known {
                Some(addr) if addr == entry.addr => {}
                Some(_) => {
                    if let Err(reason) = self.direct.rebind(entry.identity, entry.addr) {
                        log::warn!("could not move peer {}: {reason}", entry.identity);
                    }
                }
                None => match self.direct.insert(entry.identity, entry.addr) {
                    Ok(_) => log::debug!("direct peer {} at {}", entry.identity, entry.addr),
                    Err(reason) => log::warn!("ignoring peer {}: {reason}", entry.identity),
                },
            }
        }
    }

    fn broadcast_owned_updates(&mut self) {
        for outbound in self.session.collect_owned_updates() {
            let result = self
                .session
                .encode(&outbound)
                .and_then(|(frame, delivery)| self.route(frame, delivery));
            if let Err(e) = result {
                log::warn!("could not send update: {e}");
            }
        }
    }

    fn route(&mut self, mut frame: Frame, delivery: Delivery) -> Result<()> {
        match delivery.routing {
            Routing::ViaHost => {
                frame.relay = true;
                self.queue_host(frame, delivery.reliability)
            }
            Routing::PeerToPeer => {
                for peer in self.direct.iter_mut() {
                    queue(&mut peer.channel, frame.clone(), delivery.reliability)?;
                }
                self.queue_host(frame, delivery.reliability)
            }
        }
    }

    fn send_to_host(&mut self, outbound: &Outbound) -> Result<()> {
        let (frame, _) = self.session.encode(outbound)?;
        self.queue_host(frame, Reliability::Reliable)
    }

    fn queue_host(&mut self, frame: Frame, lane: Reliability) -> Result<()> {
        queue(&mut self.host_channel, frame, lane)
    }

    fn require_connected(&self) -> Result<()> {
        match self.state {
            ClientState::Disconnected | ClientState::Connecting => Err(SessionError::NotConnected),
            _ => Ok(()),
        }
    }

    fn end_session(&mut self, reason: DisconnectReason) {
        self.state = ClientState::Disconnected;
        self.host_channel.reset();
        for identity in self.direct.identities() {
            self.direct.remove(identity);
        }
        self.session.destroy_all();
        self.session.scheduler.freeze();
        self.session
            .events
            .push_back(SessionEvent::Disconnected { reason });
    }

    fn send_control(&mut self, body: PacketBody) {
        let packet = Packet::new(PacketHeader::new(0, 0, 0), body);
        if let Err(e) = self.endpoint.send_to(&packet, self.host_addr) {
            log::warn!("failed to send control packet to {}: {e}", self.host_addr);
        }
    }

    fn flush(&mut self) {
        let now = Instant::now();
        let heartbeat = self.config.session.heartbeat_interval();

        let mut outgoing: Vec<(Packet, SocketAddr)> = self
            .host_channel
            .build_packets(now, heartbeat)
            .into_iter()
            .map(|packet| (packet, self.host_addr))
            .collect();
        for peer in self.direct.iter_mut() {
            for packet in peer.channel.build_packets(now, heartbeat) {
                outgoing.push((packet, peer.addr));
            }
        }

        for (packet, addr) in outgoing {
            if let Err(e) = self.endpoint.send_to(&packet, addr) {
                log::warn!("failed to send to {addr}: {e}");
            }
        }
    }
}

fn queue(channel: &mut Channel, frame: Frame, lane: Reliability) -> Result<()> {
    match lane {
        Reliability::Reliable => channel.queue_reliable(frame)?,
        Reliability::Unreliable => channel.queue_unreliable(frame)?,
    }
    Ok(())
}
