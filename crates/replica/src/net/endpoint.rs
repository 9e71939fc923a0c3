use std::io;
use std::net::SocketAddr;

use super::protocol::{MAX_PACKET_SIZE, Packet};
use super::stats::NetworkStats;
use super::transport::Transport;

/// Packet-level socket: frames [`Packet`]s onto a [`Transport`] and keeps
/// traffic counters.
pub struct NetworkEndpoint<T> {
    transport: T,
    stats: NetworkStats,
    recv_buffer: [u8; MAX_PACKET_SIZE],
    max_batch: usize,
}

impl<T: Transport> NetworkEndpoint<T> {
    pub fn new(transport: T, max_batch: usize) -> Self {
        Self {
            transport,
            stats: NetworkStats::default(),
            recv_buffer: [0u8; MAX_PACKET_SIZE],
            max_batch: max_batch.max(1),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut NetworkStats {
        &mut self.stats
    }

    pub fn send_to(&mut self, packet: &Packet, addr: SocketAddr) -> io::Result<usize> {
        let data = packet.serialize().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Serialization error: {}", e),
            )
        })?;

        let bytes = self.transport.send_to(&data, addr)?;

        self.stats.packets_sent += 1;
        self.stats.bytes_sent += bytes as u64;

        Ok(bytes)
    }

    /// Reads up to the batch limit of datagrams without blocking. Anything
    /// that does not decode to a packet of this protocol is discarded.
    pub fn receive(&mut self) -> io::Result<Vec<(Packet, SocketAddr)>> {
        let mut packets = Vec::new();

        for _ in 0..self.max_batch {
            let Some((size, addr)) = self.transport.recv_from(&mut self.recv_buffer)? else {
                break;
            };

            match Packet::deserialize(&self.recv_buffer[..size]) {
                Ok(packet) if packet.header.is_valid() => {
                    self.stats.packets_received += 1;
                    self.stats.bytes_received += size as u64;
                    packets.push((packet, addr));
                }
                Ok(_) => {
                    self.stats.packets_rejected += 1;
                    log::debug!("packet from {addr} has a foreign header; dropped");
                }
                Err(e) => {
                    self.stats.packets_rejected += 1;
                    log::debug!("undecodable datagram from {addr}: {e}");
                }
            }
        }

        Ok(packets)
    }
}
