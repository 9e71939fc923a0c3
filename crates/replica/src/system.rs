//! Messages the roles exchange among themselves. They are always declared
//! first in a registry, in the order below.
//!
//! | type        | layout                                              |
//! |-------------|-----------------------------------------------------|
//! | Spawn       | network_id i32, prefab_index i32, owner u64         |
//! | Destroy     | network_id i32                                      |
//! | SceneChange | scene_index u16                                     |
//! | SceneLoaded | scene_index u16                                     |
//! | PeerList    | count u16, then per peer: identity u64, addr string |

use std::net::SocketAddr;

use crate::identity::{NetworkId, PeerIdentity};
use crate::message::{Message, Scope};
use crate::prefab::PrefabRef;
use crate::scene::SceneIndex;
use crate::wire::{WireError, WireReader, WireWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spawn {
    pub network_id: NetworkId,
    pub prefab: PrefabRef,
    pub owner: PeerIdentity,
}

impl Message for Spawn {
    const NAME: &'static str = "replica.Spawn";
    const SCOPE: Scope = Scope::CLIENT_ONLY;

    fn encode(&self, writer: &mut WireWriter) {
        writer.write_i32(self.network_id.get());
        writer.write_i32(self.prefab.to_wire());
        writer.write_u64(self.owner.get());
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            network_id: NetworkId(reader.read_i32()?),
            prefab: PrefabRef::from_wire(reader.read_i32()?)?,
            owner: PeerIdentity(reader.read_u64()?),
        })
    }
}

/// Issued by an object's owner. The host also accepts it from the owning
/// client and fans it out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destroy {
    pub network_id: NetworkId,
}

impl Message for Destroy {
    const NAME: &'static str = "replica.Destroy";

    fn encode(&self, writer: &mut WireWriter) {
        writer.write_i32(self.network_id.get());
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            network_id: NetworkId(reader.read_i32()?),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SceneChange {
    pub scene: SceneIndex,
}

impl Message for SceneChange {
    const NAME: &'static str = "replica.SceneChange";
    const SCOPE: Scope = Scope::CLIENT_ONLY;

    fn encode(&self, writer: &mut WireWriter) {
        writer.write_u16(self.scene.0);
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            scene: SceneIndex(reader.read_u16()?),
        })
    }
}

/// A client's confirmation that it finished loading `scene`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SceneLoaded {
    pub scene: SceneIndex,
}

impl Message for SceneLoaded {
    const NAME: &'static str = "replica.SceneLoaded";
    const SCOPE: Scope = Scope::HOST_ONLY;

    fn encode(&self, writer: &mut WireWriter) {
        writer.write_u16(self.scene.0);
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            scene: SceneIndex(reader.read_u16()?),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerEntry {
    pub identity: PeerIdentity,
    pub addr: SocketAddr,
}

/// The other synced peers, so clients can open direct channels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerList {
    pub peers: Vec<PeerEntry>,
}

impl Message for PeerList {
    const NAME: &'static str = "replica.PeerList";
    const SCOPE: Scope = Scope::CLIENT_ONLY;

    fn encode(&self, writer: &mut WireWriter) {
        writer.write_len(self.peers.len());
        for entry in &self.peers {
            writer.write_u64(entry.identity.get());
            writer.write_str(&entry.addr.to_string());
        }
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        let count = reader.read_len()?;
        let mut peers = Vec::with_capacity(count);
        for _ in 0..count {
            let identity = PeerIdentity(reader.read_u64()?);
            let addr = reader
                .read_string()?
                .parse()
                .map_err(|_| WireError::InvalidValue {
                    field: "peer_addr",
                    value: 0,
                })?;
            peers.push(PeerEntry { identity, addr });
        }
        Ok(Self { peers })
    }
}
