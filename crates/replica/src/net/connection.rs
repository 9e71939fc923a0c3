use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use indexmap::IndexMap;

use super::channel::Channel;
use crate::identity::{NetworkId, PeerIdentity};
use crate::scene::SceneIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    /// Accepted before the host had a scene.
    AwaitingScene,
    /// Told to load this scene; receives no object traffic yet.
    Loading(SceneIndex),
    /// Holds the full snapshot and follows live traffic.
    Synced,
}

#[derive(Debug)]
pub struct Peer {
    pub identity: PeerIdentity,
    pub addr: SocketAddr,
    pub phase: PeerPhase,
    pub channel: Channel,
    pub player: Option<NetworkId>,
    pub last_receive_time: Instant,
}

impl Peer {
    pub fn new(identity: PeerIdentity, addr: SocketAddr, resend_interval: Duration) -> Self {
        Self {
            identity,
            addr,
            phase: PeerPhase::AwaitingScene,
            channel: Channel::new(resend_interval),
            player: None,
            last_receive_time: Instant::now(),
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.phase, PeerPhase::Loading(_))
    }

    pub fn is_synced(&self) -> bool {
        self.phase == PeerPhase::Synced
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_receive_time.elapsed() > timeout
    }

    pub fn touch(&mut self) {
        self.last_receive_time = Instant::now();
    }
}

/// Peers keyed by identity, in connection order, with an address index.
#[derive(Debug)]
pub struct PeerTable {
    peers: IndexMap<PeerIdentity, Peer>,
    by_addr: HashMap<SocketAddr, PeerIdentity>,
    max_peers: usize,
    resend_interval: Duration,
}

impl PeerTable {
    pub fn new(max_peers: usize, resend_interval: Duration) -> Self {
        Self {
            peers: IndexMap::new(),
            by_addr: HashMap::new(),
            max_peers,
            resend_interval,
        }
    }

    pub fn insert(
        &mut self,
        identity: PeerIdentity,
        addr: SocketAddr,
    ) -> Result<&mut Peer, &'static str> {
        if self.peers.contains_key(&identity) {
            return Err("Identity already connected");
        }
        if self.by_addr.contains_key(&addr) {
            return Err("Address already in use");
        }
        if self.peers.len() >= self.max_peers {
            return Err("Server full");
        }

        self.by_addr.insert(addr, identity);
        let peer = Peer::new(identity, addr, self.resend_interval);
        Ok(self.peers.entry(identity).or_insert(peer))
    }

    /// Moves a known identity to `addr` and starts its channel over. An
    /// address still held by another identity is refused.
    pub fn rebind(
        &mut self,
        identity: PeerIdentity,
        addr: SocketAddr,
    ) -> Result<&mut Peer, &'static str> {
        if self
            .by_addr
            .get(&addr)
            .is_some_and(|holder| *holder != identity)
        {
            return Err("Address already in use");
        }
        let peer = self.peers.get_mut(&identity).ok_or("Unknown identity")?;
        self.by_addr.remove(&peer.addr);
        self.by_addr.insert(addr, identity);
        peer.addr = addr;
        peer.channel.reset();
        peer.touch();
        Ok(peer)
    }

    pub fn get(&self, identity: PeerIdentity) -> Option<&Peer> {
        self.peers.get(&identity)
    }

    pub fn get_mut(&mut self, identity: PeerIdentity) -> Option<&mut Peer> {
        self.peers.get_mut(&identity)
    }

    pub fn identity_of(&self, addr: &SocketAddr) -> Option<PeerIdentity> {
        self.by_addr.get(addr).copied()
    }

    pub fn get_by_addr_mut(&mut self, addr: &SocketAddr) -> Option<&mut Peer> {
        let identity = self.by_addr.get(addr)?;
        self.peers.get_mut(identity)
    }

    pub fn contains(&self, identity: PeerIdentity) -> bool {
        self.peers.contains_key(&identity)
    }

    pub fn remove(&mut self, identity: PeerIdentity) -> Option<Peer> {
        let peer = self.peers.shift_remove(&identity)?;
        if self.by_addr.get(&peer.addr) == Some(&identity) {
            self.by_addr.remove(&peer.addr);
        }
        Some(peer)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.values_mut()
    }

    pub fn identities(&self) -> Vec<PeerIdentity> {
        self.peers.keys().copied().collect()
    }

    pub fn timed_out(&self, timeout: Duration) -> Vec<PeerIdentity> {
        self.peers
            .values()
            .filter(|peer| peer.is_timed_out(timeout))
            .map(|peer| peer.identity)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn synced_count(&self) -> usize {
        self.peers.values().filter(|peer| peer.is_synced()).count()
    }
}
