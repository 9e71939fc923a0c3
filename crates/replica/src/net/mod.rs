mod channel;
mod connection;
mod endpoint;
mod memory;
mod protocol;
mod simulator;
mod stats;
mod tracking;
mod transport;

pub use channel::{Channel, ChannelError, Delivered};
pub use connection::{Peer, PeerPhase, PeerTable};
pub use endpoint::NetworkEndpoint;
pub use memory::{MemoryNetwork, MemoryTransport};
pub use protocol::{
    DEFAULT_PORT, DEFAULT_TICK_RATE, Frame, MAX_PACKET_SIZE, PAYLOAD_BUDGET, PROTOCOL_MAGIC,
    PROTOCOL_VERSION, Packet, PacketBody, PacketError, PacketHeader, ReliableFrame,
    sequence_greater_than,
};
pub use simulator::LossyTransport;
pub use stats::NetworkStats;
pub use tracking::{AckTracker, PendingPacket, ReceiveTracker};
pub use transport::{Transport, UdpTransport};
