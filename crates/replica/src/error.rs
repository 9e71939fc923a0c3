use std::io;

use thiserror::Error;

use crate::identity::{DirectoryError, NetworkId, PeerIdentity};
use crate::net::{ChannelError, PacketError};
use crate::prefab::PrefabRef;
use crate::registry::{CodecError, RegistryError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("{0} is not in the prefab table")]
    UnknownPrefab(PrefabRef),
    #[error("no peer with identity {0}")]
    UnknownPeer(PeerIdentity),
    #[error("no live object {0}")]
    UnknownObject(NetworkId),
    #[error("{object} is owned by {owner}")]
    NotOwner {
        object: NetworkId,
        owner: PeerIdentity,
    },
    #[error("not connected to a host")]
    NotConnected,
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
