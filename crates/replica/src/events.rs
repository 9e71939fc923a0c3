use std::net::SocketAddr;

use crate::identity::{NetworkId, PeerIdentity};
use crate::message::AnyMessage;
use crate::prefab::PrefabRef;
use crate::scene::SceneIndex;

/// What happened during a pump, in the order it happened. Drained by the
/// application after each cycle.
#[derive(Debug)]
pub enum SessionEvent {
    PeerConnected {
        identity: PeerIdentity,
        addr: SocketAddr,
    },
    PeerReconnected {
        identity: PeerIdentity,
        addr: SocketAddr,
    },
    /// The peer confirmed the current scene and received the full snapshot.
    PeerSynced {
        identity: PeerIdentity,
    },
    PeerDisconnected {
        identity: PeerIdentity,
        reason: DisconnectReason,
    },
    Connected {
        host: PeerIdentity,
    },
    ConnectionDenied {
        reason: String,
    },
    Disconnected {
        reason: DisconnectReason,
    },
    ObjectSpawned {
        network_id: NetworkId,
        prefab: PrefabRef,
        owner: PeerIdentity,
    },
    LocalOwnershipEstablished {
        network_id: NetworkId,
    },
    ObjectDestroyed {
        network_id: NetworkId,
    },
    SceneLoaded {
        scene: SceneIndex,
    },
    SimulationResumed {
        scene: SceneIndex,
    },
    /// An application message whose scope admits this role.
    Message {
        from: PeerIdentity,
        message: Box<dyn AnyMessage>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Graceful,
    Timeout,
    Kicked,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Graceful => "disconnected",
            DisconnectReason::Timeout => "timed out",
            DisconnectReason::Kicked => "kicked",
        }
    }
}
