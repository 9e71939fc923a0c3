use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::config::HostConfig;
use crate::error::{Result, SessionError};
use crate::events::{DisconnectReason, SessionEvent};
use crate::identity::{IdSpace, NetworkId, PeerIdentity};
use crate::message::{AnyMessage, Reliability, Role};
use crate::net::{
    Delivered, Frame, NetworkEndpoint, NetworkStats, Packet, PacketBody, PacketHeader, Peer,
    PeerPhase, PeerTable, Transport,
};
use crate::object::{Outbound, ReplicatedObject};
use crate::prefab::{PrefabRef, PrefabTable};
use crate::registry::{Address, MessageRegistry};
use crate::scene::{SceneIndex, SceneLoader};
use crate::session::SessionContext;
use crate::system::{Destroy, PeerEntry, PeerList, SceneChange, SceneLoaded};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    /// No scene loaded yet.
    Listening,
    SceneStable,
    /// Simulation frozen until the host and every peer that was connected at
    /// the scene change have loaded it.
    AwaitingPeerLoad,
}

/// The authoritative node.
pub struct Host<T> {
    endpoint: NetworkEndpoint<T>,
    peers: PeerTable,
    session: SessionContext,
    config: HostConfig,
    loader: Box<dyn SceneLoader>,
    state: HostState,
    target_scene: Option<SceneIndex>,
    scene_ready: bool,
    awaiting: HashSet<PeerIdentity>,
    confirmed: HashSet<PeerIdentity>,
    player: Option<NetworkId>,
}

impl<T: Transport> Host<T> {
    pub fn new(
        transport: T,
        config: HostConfig,
        registry: MessageRegistry,
        prefabs: PrefabTable,
        loader: impl SceneLoader + 'static,
    ) -> Self {
        let endpoint = NetworkEndpoint::new(transport, config.session.max_receive_batch);
        let peers = PeerTable::new(config.max_peers, config.session.resend_interval());
        let mut session = SessionContext::new(config.session.clone(), Role::Host, registry, prefabs);
        session.scheduler.freeze();

        log::info!(
            "host {} listening on {}",
            session.identity(),
            endpoint.local_addr()
        );

        Self {
            endpoint,
            peers,
            session,
            config,
            loader: Box::new(loader),
            state: HostState::Listening,
            target_scene: None,
            scene_ready: false,
            awaiting: HashSet::new(),
            confirmed: HashSet::new(),
            player: None,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn transport(&self) -> &T {
        self.endpoint.transport()
    }

    pub fn transport_mut(&mut self) -> &mut T {
        self.endpoint.transport_mut()
    }

    pub fn identity(&self) -> PeerIdentity {
        self.session.identity()
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn scene(&self) -> Option<SceneIndex> {
        self.target_scene
    }

    pub fn is_simulating(&self) -> bool {
        !self.session.scheduler.is_frozen()
    }

    pub fn tick(&self) -> u64 {
        self.session.scheduler.tick()
    }

    pub fn player(&self) -> Option<NetworkId> {
        self.player
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }

    pub fn peer(&self, identity: PeerIdentity) -> Option<&Peer> {
        self.peers.get(identity)
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
        let mut rtt = Vec::new();
        for peer in self.peers.iter() {
            stats.resends += peer.channel.resends();
            rtt.push((peer.channel.srtt(), peer.channel.rtt_var()));
        }
        if !rtt.is_empty() {
            let count = rtt.len() as f32;
            stats.rtt_ms = rtt.iter().map(|(srtt, _)| srtt).sum::<f32>() / count;
            stats.rtt_variance = rtt.iter().map(|(_, var)| var).sum::<f32>() / count;
        }
        stats
    }

    /// Starts a scene transition: scene objects are unloaded, every peer is
    /// told to load `scene`, and simulation freezes until the host and every
    /// peer connected right now have loaded it.
    pub fn load_scene(&mut self, scene: SceneIndex) {
        log::info!("loading {scene} for {} peers", self.peers.len());

        self.session.unload_scene_objects();
        self.target_scene = Some(scene);
        self.scene_ready = false;
        self.confirmed.clear();
        self.loader.begin_load(scene);

        self.awaiting = self.peers.identities().into_iter().collect();
        let change = Outbound::system(SceneChange { scene });
        for identity in self.peers.identities() {
            if let Some(peer) = self.peers.get_mut(identity) {
                peer.phase = PeerPhase::Loading(scene);
            }
            if let Err(e) = self.send_outbound(identity, &change, Some(Reliability::Reliable)) {
                log::warn!("could not queue scene change for {identity}: {e}");
            }
        }

        self.session.scheduler.freeze();
        self.state = HostState::AwaitingPeerLoad;

        self.poll_loader();
        self.check_resume();
    }

    /// Instantiates `prefab` under a freshly reserved id and announces it to
    /// every synced peer.
    pub fn spawn(
        &mut self,
        prefab: PrefabRef,
        space: IdSpace,
        owner: PeerIdentity,
    ) -> Result<NetworkId> {
        let id = self.session.spawn_new(prefab, space, owner)?;
        self.announce(self.session.snapshot_of(id), None);
        Ok(id)
    }

    /// Destroys an object this host owns.
    pub fn destroy(&mut self, id: NetworkId) -> Result<()> {
        self.session.require_local_owner(id)?;
        self.destroy_and_announce(id, None);
        Ok(())
    }

    /// Sends an application message to every connected peer.
    pub fn broadcast(&mut self, message: &dyn AnyMessage) -> Result<()> {
        let encoded = self.session.registry.encode(None, message)?;
        for identity in self.peers.identities() {
            self.queue(identity, Frame::new(encoded.bytes.clone()), encoded.delivery.reliability)?;
        }
        Ok(())
    }

    pub fn send_to(&mut self, identity: PeerIdentity, message: &dyn AnyMessage) -> Result<()> {
        if !self.peers.contains(identity) {
            return Err(SessionError::UnknownPeer(identity));
        }
        let encoded = self.session.registry.encode(None, message)?;
        self.queue(identity, Frame::new(encoded.bytes), encoded.delivery.reliability)
    }

    /// Sends one behaviour message for an object this host owns, outside the
    /// tick cadence.
    pub fn send_update(
        &mut self,
        id: NetworkId,
        behaviour: u8,
        message: Box<dyn AnyMessage>,
    ) -> Result<()> {
        self.session.require_local_owner(id)?;
        let outbound = Outbound::addressed(Address::new(id, behaviour), message);
        let (frame, delivery) = self.session.encode(&outbound)?;
        self.fan_out_object_traffic(frame, delivery.reliability, None, false);
        Ok(())
    }

    pub fn kick(&mut self, identity: PeerIdentity) -> bool {
        let Some(peer) = self.peers.get(identity) else {
            return false;
        };
        let addr = peer.addr;
        self.send_control(PacketBody::Disconnect, addr);
        self.remove_peer(identity, DisconnectReason::Kicked);
        true
    }

    /// Says goodbye to every peer and forgets them.
    pub fn shutdown(&mut self) {
        for identity in self.peers.identities() {
            if let Some(peer) = self.peers.get(identity) {
                let addr = peer.addr;
                self.send_control(PacketBody::Disconnect, addr);
            }
            self.remove_peer(identity, DisconnectReason::Graceful);
        }
        log::info!("host {} shut down", self.identity());
    }

    /// One cycle: receive and dispatch, advance scene loading and timeouts,
    /// produce updates on broadcast ticks, then flush every peer.
    pub fn pump(&mut self, delta: Duration) -> Result<()> {
        for (packet, addr) in self.endpoint.receive()? {
            self.handle_packet(packet, addr);
        }

        self.poll_loader();

        for identity in self.peers.timed_out(self.config.session.timeout()) {
            log::info!("peer {identity} timed out");
            self.remove_peer(identity, DisconnectReason::Timeout);
        }

        self.check_resume();

        self.session.scheduler.advance(delta);
        if self.session.scheduler.should_broadcast() {
            self.broadcast_owned_updates();
        }

        self.flush();
        Ok(())
    }

    fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        match packet.body {
            PacketBody::ConnectionRequest {
                identity,
                fingerprint,
            } => self.handle_connection_request(addr, PeerIdentity(identity), fingerprint),
            PacketBody::Data {
                reliable,
                unreliable,
            } => {
                let Some(peer) = self.peers.get_by_addr_mut(&addr) else {
                    log::trace!("data from unknown address {addr}; dropped");
                    return;
                };
                peer.touch();
                let sender = peer.identity;
                if let Some(delivered) = peer.channel.receive(&packet.header, reliable, unreliable) {
                    self.handle_delivered(sender, delivered);
                }
            }
            PacketBody::Disconnect => {
                if let Some(identity) = self.peers.identity_of(&addr) {
                    log::info!("peer {identity} disconnected");
                    self.remove_peer(identity, DisconnectReason::Graceful);
                }
            }
            PacketBody::ConnectionAccepted { .. } | PacketBody::ConnectionDenied { .. } => {
                log::debug!("ignoring handshake reply from {addr}");
            }
        }
    }

    fn handle_connection_request(
        &mut self,
        addr: SocketAddr,
        identity: PeerIdentity,
        fingerprint: u64,
    ) {
        if fingerprint != self.session.registry.fingerprint() {
            log::warn!(
                "denying {identity} at {addr}: registry fingerprint {fingerprint:016x}, expected {:016x}",
                self.session.registry.fingerprint()
            );
            self.deny(addr, "Message registry mismatch");
            return;
        }
        if identity == self.identity() {
            self.deny(addr, "Identity in use");
            return;
        }

        let accepted = PacketBody::ConnectionAccepted {
            host_identity: self.identity().get(),
        };

        if let Some(existing) = self.peers.get(identity) {
            if existing.addr == addr {
                // retried request; the first acceptance was lost
                self.send_control(accepted, addr);
                return;
            }
            if let Err(reason) = self.reconnect(identity, addr) {
                log::info!("denying reconnect of {identity} at {addr}: {reason}");
                self.deny(addr, reason);
                return;
            }
            self.send_control(accepted, addr);
            return;
        }

        if let Err(reason) = self.peers.insert(identity, addr) {
            log::info!("denying {identity} at {addr}: {reason}");
            self.deny(addr, reason);
            return;
        }
        log::info!("peer {identity} connected from {addr}");
        self.send_control(accepted, addr);

        if self.session.prefabs.has_player() {
            match self
                .session
                .spawn_new(PrefabRef::Player, IdSpace::Persistent, identity)
            {
                Ok(player) => {
                    if let Some(peer) = self.peers.get_mut(identity) {
                        peer.player = Some(player);
                    }
                    self.announce(self.session.snapshot_of(player), Some(identity));
                }
                Err(e) => log::error!("could not spawn player for {identity}: {e}"),
            }
        }

        self.session
            .events
            .push_back(SessionEvent::PeerConnected { identity, addr });
        self.direct_to_scene(identity);
    }

    fn reconnect(&mut self, identity: PeerIdentity, addr: SocketAddr) -> Result<(), &'static str> {
        let peer = self.peers.rebind(identity, addr)?;
        peer.phase = PeerPhase::AwaitingScene;
        log::info!("peer {identity} reconnected from {addr}");
        self.confirmed.remove(&identity);
        self.session
            .events
            .push_back(SessionEvent::PeerReconnected { identity, addr });
        self.direct_to_scene(identity);
        Ok(())
    }

    /// Sends the current scene directive, if there is a scene.
    fn direct_to_scene(&mut self, identity: PeerIdentity) {
        let Some(scene) = self.target_scene else {
            return;
        };
        if let Some(peer) = self.peers.get_mut(identity) {
            peer.phase = PeerPhase::Loading(scene);
        }
        let change = Outbound::system(SceneChange { scene });
        if let Err(e) = self.send_outbound(identity, &change, Some(Reliability::Reliable)) {
            log::warn!("could not queue scene change for {identity}: {e}");
        }
    }

    fn deny(&mut self, addr: SocketAddr, reason: &str) {
        self.send_control(
            PacketBody::ConnectionDenied {
                reason: reason.to_string(),
            },
            addr,
        );
    }

    fn handle_delivered(&mut self, sender: PeerIdentity, delivered: Delivered) {
        for frame in delivered.reliable {
            self.handle_frame(sender, frame, Reliability::Reliable);
        }
        for frame in delivered.unreliable {
            self.handle_frame(sender, frame, Reliability::Unreliable);
        }
    }

    fn handle_frame(&mut self, sender: PeerIdentity, frame: Frame, lane: Reliability) {
        let decoded = match self.session.registry.decode(&frame.bytes) {
            Ok(decoded) => decoded,
            Err(e) => {
                log::warn!("dropping frame from {sender}: {e}");
                return;
            }
        };

        if let Some(address) = decoded.address {
            let owner = self.session.owner_of(address.network_id);
            if owner != Some(sender) {
                log::debug!(
                    "{} for {address} from non-owner {sender}; rejected",
                    decoded.message.name()
                );
                return;
            }
            if frame.relay {
                self.fan_out_object_traffic(relayed(frame, sender), lane, Some(sender), false);
            }
            if decoded.delivery.scope.admits(Role::Host) {
                self.session
                    .apply_update(address, decoded.message.as_ref());
            }
            return;
        }

        if self.session.registry.is_system(decoded.id) {
            if let Some(loaded) = decoded.message.downcast_ref::<SceneLoaded>() {
                self.handle_scene_loaded(sender, loaded.scene);
            } else if let Some(destroy) = decoded.message.downcast_ref::<Destroy>() {
                self.handle_destroy_request(sender, destroy.network_id);
            } else {
                log::warn!("{} from client {sender}; dropped", decoded.message.name());
            }
            return;
        }

        if frame.relay {
            let frame = relayed(frame, sender);
            for identity in self.peers.identities() {
                if identity == sender {
                    continue;
                }
                if let Err(e) = self.queue(identity, frame.clone(), lane) {
                    log::warn!("could not relay to {identity}: {e}");
                }
            }
        }
        self.session.dispatch_to_app(sender, decoded);
    }

    fn handle_scene_loaded(&mut self, sender: PeerIdentity, scene: SceneIndex) {
        let Some(peer) = self.peers.get(sender) else {
            return;
        };
        match peer.phase {
            PeerPhase::Loading(expected) if expected == scene => {}
            phase => {
                log::warn!("{sender} reported {scene} loaded while {phase:?}; ignored");
                return;
            }
        }

        log::debug!("{sender} finished loading {scene}");
        self.awaiting.remove(&sender);
        if self.scene_ready {
            self.sync_peer(sender);
        } else {
            self.confirmed.insert(sender);
        }
    }

    fn handle_destroy_request(&mut self, sender: PeerIdentity, id: NetworkId) {
        match self.session.owner_of(id) {
            None => log::debug!("destroy of absent {id} from {sender}; ignoring"),
            Some(owner) if owner != sender => {
                log::warn!("{sender} tried to destroy {id} owned by {owner}; rejected");
            }
            Some(_) => self.destroy_and_announce(id, Some(sender)),
        }
    }

    /// Streams the full snapshot to a peer that confirmed the current scene,
    /// then refreshes everyone's peer list.
    fn sync_peer(&mut self, identity: PeerIdentity) {
        let Some(peer) = self.peers.get_mut(identity) else {
            return;
        };
        peer.phase = PeerPhase::Synced;

        let snapshot = self.session.full_snapshot();
        log::debug!("streaming {} snapshot messages to {identity}", snapshot.len());
        for outbound in &snapshot {
            if let Err(e) = self.send_outbound(identity, outbound, Some(Reliability::Reliable)) {
                log::warn!("snapshot message for {identity} dropped: {e}");
            }
        }

        self.send_peer_lists();
        self.session
            .events
            .push_back(SessionEvent::PeerSynced { identity });
    }

    fn send_peer_lists(&mut self) {
        let synced: Vec<PeerEntry> = self
            .peers
            .iter()
            .filter(|peer| peer.is_synced())
            .map(|peer| PeerEntry {
                identity: peer.identity,
                addr: peer.addr,
            })
            .collect();

        for entry in &synced {
            let list = PeerList {
                peers: synced
                    .iter()
                    .filter(|other| other.identity != entry.identity)
                    .copied()
                    .collect(),
            };
            if let Err(e) = self.send_outbound(entry.identity, &Outbound::system(list), None) {
                log::warn!("peer list for {} dropped: {e}", entry.identity);
            }
        }
    }

    fn poll_loader(&mut self) {
        if self.scene_ready {
            return;
        }
        let Some(loaded) = self.loader.poll_loaded() else {
            return;
        };
        if Some(loaded.index) != self.target_scene {
            log::debug!("{} finished loading after being superseded", loaded.index);
            return;
        }

        let host = self.identity();
        self.session.load_scene_objects(&loaded, host);
        self.scene_ready = true;
        self.session
            .events
            .push_back(SessionEvent::SceneLoaded {
                scene: loaded.index,
            });

        if self.player.is_none() && self.session.prefabs.has_player() {
            match self.spawn(PrefabRef::Player, IdSpace::Persistent, host) {
                Ok(player) => self.player = Some(player),
                Err(e) => log::error!("could not spawn host player: {e}"),
            }
        }

        let mut confirmed: Vec<PeerIdentity> = self.confirmed.drain().collect();
        confirmed.sort();
        for identity in confirmed {
            self.sync_peer(identity);
        }
    }

    fn check_resume(&mut self) {
        if self.state != HostState::AwaitingPeerLoad || !self.scene_ready {
            return;
        }
        if !self.awaiting.is_empty() {
            return;
        }
        let Some(scene) = self.target_scene else {
            return;
        };

        self.session.scheduler.resume();
        self.state = HostState::SceneStable;
        log::info!("all peers loaded {scene}; simulation resumed");
        self.session
            .events
            .push_back(SessionEvent::SimulationResumed { scene });
    }

    fn remove_peer(&mut self, identity: PeerIdentity, reason: DisconnectReason) {
        let Some(peer) = self.peers.remove(identity) else {
            return;
        };
        self.awaiting.remove(&identity);
        self.confirmed.remove(&identity);

        for id in self.session.owned_by(identity) {
            self.destroy_and_announce(id, None);
        }
        log::info!("peer {identity} at {} {}", peer.addr, reason.as_str());

        self.session
            .events
            .push_back(SessionEvent::PeerDisconnected { identity, reason });
        self.send_peer_lists();
    }

    fn destroy_and_announce(&mut self, id: NetworkId, except: Option<PeerIdentity>) {
        if !self.session.destroy_local(id) {
            return;
        }
        match self.session.encode(&Outbound::system(Destroy { network_id: id })) {
            Ok((frame, _)) => {
                // loading peers keep persistent objects through the load, and
                // the snapshot they get afterwards no longer names this one
                let reach_loading = id.space() == Some(IdSpace::Persistent);
                self.fan_out_object_traffic(frame, Reliability::Reliable, except, reach_loading);
            }
            Err(e) => log::warn!("could not encode destroy of {id}: {e}"),
        }
    }

    fn broadcast_owned_updates(&mut self) {
        for outbound in self.session.collect_owned_updates() {
            match self.session.encode(&outbound) {
                Ok((frame, delivery)) => {
                    self.fan_out_object_traffic(frame, delivery.reliability, None, false)
                }
                Err(e) => log::warn!("could not encode update: {e}"),
            }
        }
    }

    /// Queues object messages on the reliable lane of every synced peer.
    fn announce(&mut self, messages: Vec<Outbound>, except: Option<PeerIdentity>) {
        for outbound in &messages {
            match self.session.encode(outbound) {
                Ok((frame, _)) => {
                    self.fan_out_object_traffic(frame, Reliability::Reliable, except, false)
                }
                Err(e) => log::warn!("could not encode {}: {e}", outbound.message.name()),
            }
        }
    }

    /// Object traffic only reaches synced peers unless `include_loading` is
    /// set; loading peers get the full snapshot once they confirm.
    fn fan_out_object_traffic(
        &mut self,
        frame: Frame,
        lane: Reliability,
        except: Option<PeerIdentity>,
        include_loading: bool,
    ) {
        let targets: Vec<PeerIdentity> = self
            .peers
            .iter()
            .filter(|peer| peer.is_synced() || (include_loading && peer.is_loading()))
            .filter(|peer| Some(peer.identity) != except)
            .map(|peer| peer.identity)
            .collect();
        for identity in targets {
            if let Err(e) = self.queue(identity, frame.clone(), lane) {
                log::warn!("could not queue for {identity}: {e}");
            }
        }
    }

    fn send_outbound(
        &mut self,
        identity: PeerIdentity,
        outbound: &Outbound,
        lane: Option<Reliability>,
    ) -> Result<()> {
        let (frame, delivery) = self.session.encode(outbound)?;
        self.queue(identity, frame, lane.unwrap_or(delivery.reliability))
    }

    fn queue(&mut self, identity: PeerIdentity, frame: Frame, lane: Reliability) -> Result<()> {
        let peer = self
            .peers
            .get_mut(identity)
            .ok_or(SessionError::UnknownPeer(identity))?;
        match lane {
            Reliability::Reliable => peer.channel.queue_reliable(frame)?,
            Reliability::Unreliable => peer.channel.queue_unreliable(frame)?,
        }
        Ok(())
    }

    fn send_control(&mut self, body: PacketBody, addr: SocketAddr) {
        let packet = Packet::new(PacketHeader::new(0, 0, 0), body);
        if let Err(e) = self.endpoint.send_to(&packet, addr) {
            log::warn!("failed to send control packet to {addr}: {e}");
        }
    }

    fn flush(&mut self) {
        let now = Instant::now();
        let heartbeat = self.config.session.heartbeat_interval();

        let mut outgoing = Vec::new();
        for peer in self.peers.iter_mut() {
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

fn relayed(mut frame: Frame, sender: PeerIdentity) -> Frame {
    frame.relay = false;
    frame.origin = Some(sender.get());
    frame
}
