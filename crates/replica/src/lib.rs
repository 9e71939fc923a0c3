pub mod behaviour;
pub mod behaviours;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod host;
pub mod identity;
pub mod message;
pub mod net;
pub mod object;
pub mod prefab;
pub mod registry;
pub mod scene;
pub mod session;
pub mod system;
pub mod tick;
pub mod wire;

pub use behaviour::{ReplicatedBehaviour, Slot};
pub use behaviours::{TransformSync, TransformUpdate};
pub use client::{Client, ClientState};
pub use config::{ClientConfig, HostConfig, SessionConfig};
pub use error::{Result, SessionError};
pub use events::{DisconnectReason, SessionEvent};
pub use host::{Host, HostState};
pub use identity::{DirectoryError, IdSpace, IdentityDirectory, NetworkId, PeerIdentity};
pub use message::{AnyMessage, Message, Reliability, Role, Routing, Scope};
pub use net::{
    DEFAULT_PORT, DEFAULT_TICK_RATE, LossyTransport, MemoryNetwork, MemoryTransport, NetworkStats,
    Transport, UdpTransport,
};
pub use object::{Lifecycle, Outbound, ReplicatedObject};
pub use prefab::{PrefabRef, PrefabTable};
pub use registry::{
    Address, CodecError, MessageId, MessageRegistry, RegistryBuilder, RegistryError,
};
pub use scene::{LoadedScene, SceneIndex, SceneLoader, SceneObject, StaticScenes};
pub use session::SessionContext;
pub use system::{Destroy, PeerEntry, PeerList, SceneChange, SceneLoaded, Spawn};
pub use tick::TickScheduler;
pub use wire::{WireError, WireReader, WireWriter};
