use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use thiserror::Error;

use super::protocol::{
    FRAME_OVERHEAD, Frame, PAYLOAD_BUDGET, Packet, PacketBody, PacketHeader, ReliableFrame,
};
use super::tracking::{AckTracker, ReceiveTracker};

const MAX_TRACKED_PACKETS: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("frame of {size} bytes does not fit a packet ({max} max)")]
    FrameTooLarge { size: usize, max: usize },
}

#[derive(Debug)]
struct Unacked {
    frame: Frame,
    last_sent: Option<Instant>,
}

/// Frames handed up by [`Channel::receive`], reliable ones already in order.
#[derive(Debug, Default)]
pub struct Delivered {
    pub reliable: Vec<Frame>,
    pub unreliable: Vec<Frame>,
}

/// Sequencing and reliability state for one remote node.
///
/// Reliable frames get ids that are acked per packet, resent on an interval
/// until acked, and released to the receiver strictly in id order.
#[derive(Debug)]
pub struct Channel {
    send_sequence: u32,
    acks: AckTracker,
    received: ReceiveTracker,
    next_reliable_id: u32,
    unacked: BTreeMap<u32, Unacked>,
    next_expected: u32,
    reorder: BTreeMap<u32, Frame>,
    unreliable: Vec<Frame>,
    ack_pending: bool,
    last_send: Option<Instant>,
    resend_interval: Duration,
    resends: u64,
}

impl Channel {
    pub fn new(resend_interval: Duration) -> Self {
        Self {
            send_sequence: 1,
            acks: AckTracker::new(MAX_TRACKED_PACKETS),
            received: ReceiveTracker::new(),
            next_reliable_id: 0,
            unacked: BTreeMap::new(),
            next_expected: 0,
            reorder: BTreeMap::new(),
            unreliable: Vec::new(),
            ack_pending: false,
            last_send: None,
            resend_interval,
            resends: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.resend_interval);
    }

    fn check_size(frame: &Frame) -> Result<(), ChannelError> {
        let size = frame.wire_size();
        if size > PAYLOAD_BUDGET {
            return Err(ChannelError::FrameTooLarge {
                size,
                max: PAYLOAD_BUDGET - FRAME_OVERHEAD,
            });
        }
        Ok(())
    }

    pub fn queue_reliable(&mut self, frame: Frame) -> Result<(), ChannelError> {
        Self::check_size(&frame)?;
        let id = self.next_reliable_id;
        self.next_reliable_id = self.next_reliable_id.wrapping_add(1);
        self.unacked.insert(
            id,
            Unacked {
                frame,
                last_sent: None,
            },
        );
        Ok(())
    }

    pub fn queue_unreliable(&mut self, frame: Frame) -> Result<(), ChannelError> {
        Self::check_size(&frame)?;
        self.unreliable.push(frame);
        Ok(())
    }

    /// Feeds one data packet in. Returns `None` for a duplicate packet.
    pub fn receive(
        &mut self,
        header: &PacketHeader,
        reliable: Vec<ReliableFrame>,
        unreliable: Vec<Frame>,
    ) -> Option<Delivered> {
        if !self.received.record_received(header.sequence) {
            return None;
        }

        for id in self.acks.process_ack(header.ack, header.ack_bitfield) {
            self.unacked.remove(&id);
        }

        // empty packets only carry acks and must not trigger an ack back
        if !reliable.is_empty() || !unreliable.is_empty() {
            self.ack_pending = true;
        }

        for ReliableFrame { id, frame } in reliable {
            let behind = self.next_expected.wrapping_sub(id);
            if behind != 0 && behind <= u32::MAX / 2 {
                continue;
            }
            self.reorder.entry(id).or_insert(frame);
        }

        let mut delivered = Delivered {
            reliable: Vec::new(),
            unreliable,
        };
        while let Some(frame) = self.reorder.remove(&self.next_expected) {
            delivered.reliable.push(frame);
            self.next_expected = self.next_expected.wrapping_add(1);
        }
        Some(delivered)
    }

    /// Drains everything due into packets: queued unreliable frames, reliable
    /// frames never sent or past their resend interval, and an empty packet
    /// when an ack or heartbeat is owed.
    pub fn build_packets(&mut self, now: Instant, heartbeat: Duration) -> Vec<Packet> {
        let mut packets = Vec::new();
        let mut reliable = Vec::new();
        let mut unreliable = Vec::new();
        let mut ids = Vec::new();
        let mut budget = 0usize;

        let resend_interval = self.resend_interval;
        let mut due: Vec<(u32, &mut Unacked)> = self
            .unacked
            .iter_mut()
            .filter(|(_, pending)| {
                pending
                    .last_sent
                    .is_none_or(|sent| now.duration_since(sent) >= resend_interval)
            })
            .map(|(id, pending)| (*id, pending))
            .collect();
        let queued_unreliable = std::mem::take(&mut self.unreliable);

        let mut finished = Vec::new();
        for (id, pending) in due.iter_mut() {
            let size = pending.frame.wire_size();
            if budget + size > PAYLOAD_BUDGET && budget > 0 {
                finished.push((
                    std::mem::take(&mut reliable),
                    Vec::new(),
                    std::mem::take(&mut ids),
                ));
                budget = 0;
            }
            if pending.last_sent.is_some() {
                self.resends += 1;
            }
            pending.last_sent = Some(now);
            reliable.push(ReliableFrame {
                id: *id,
                frame: pending.frame.clone(),
            });
            ids.push(*id);
            budget += size;
        }
        for frame in queued_unreliable {
            let size = frame.wire_size();
            if budget + size > PAYLOAD_BUDGET && budget > 0 {
                finished.push((
                    std::mem::take(&mut reliable),
                    std::mem::take(&mut unreliable),
                    std::mem::take(&mut ids),
                ));
                budget = 0;
            }
            unreliable.push(frame);
            budget += size;
        }
        if budget > 0 {
            finished.push((reliable, unreliable, ids));
        }

        let heartbeat_due = self
            .last_send
            .is_none_or(|sent| now.duration_since(sent) >= heartbeat);
        if finished.is_empty() && (self.ack_pending || heartbeat_due) {
            finished.push((Vec::new(), Vec::new(), Vec::new()));
        }

        for (reliable, unreliable, ids) in finished {
            let body = PacketBody::Data {
                reliable,
                unreliable,
            };
            packets.push(self.stamp(body, ids));
        }
        if !packets.is_empty() {
            self.ack_pending = false;
            self.last_send = Some(now);
        }
        packets
    }

    fn stamp(&mut self, body: PacketBody, reliable_ids: Vec<u32>) -> Packet {
        let sequence = self.send_sequence;
        self.send_sequence = self.send_sequence.wrapping_add(1);
        if self.send_sequence == 0 {
            self.send_sequence = 1;
        }
        self.acks.track_packet(sequence, reliable_ids);

        let (ack, ack_bitfield) = self.received.ack_data();
        Packet::new(PacketHeader::new(sequence, ack, ack_bitfield), body)
    }

    pub fn unacked_count(&self) -> usize {
        self.unacked.len()
    }

    pub fn srtt(&self) -> f32 {
        self.acks.srtt()
    }

    pub fn rtt_var(&self) -> f32 {
        self.acks.rtt_var()
    }

    pub fn resends(&self) -> u64 {
        self.resends
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEARTBEAT: Duration = Duration::from_secs(60);

    fn data(packet: Packet) -> (PacketHeader, Vec<ReliableFrame>, Vec<Frame>) {
        match packet.body {
            PacketBody::Data {
                reliable,
                unreliable,
            } => (packet.header, reliable, unreliable),
            other => panic!("unexpected body {other:?}"),
        }
    }

    fn deliver(from: &mut Channel, to: &mut Channel, now: Instant) -> Vec<Vec<u8>> {
        let mut bytes = Vec::new();
        for packet in from.build_packets(now, HEARTBEAT) {
            let (header, reliable, unreliable) = data(packet);
            if let Some(delivered) = to.receive(&header, reliable, unreliable) {
                bytes.extend(delivered.reliable.into_iter().map(|f| f.bytes));
            }
        }
        bytes
    }

    #[test]
    fn reliable_frames_arrive_in_order_once() {
        let mut a = Channel::new(Duration::from_millis(50));
        let mut b = Channel::new(Duration::from_millis(50));
        let now = Instant::now();

        for n in 0..5u8 {
            a.queue_reliable(Frame::new(vec![n])).unwrap();
        }
        let got = deliver(&mut a, &mut b, now);
        assert_eq!(got, (0..5u8).map(|n| vec![n]).collect::<Vec<_>>());

        // b acks; nothing is resent after that
        deliver(&mut b, &mut a, now);
        assert_eq!(a.unacked_count(), 0);
        assert!(deliver(&mut a, &mut b, now + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn lost_packet_is_resent_and_reordered() {
        let mut a = Channel::new(Duration::from_millis(50));
        let mut b = Channel::new(Duration::from_millis(50));
        let now = Instant::now();

        a.queue_reliable(Frame::new(vec![1])).unwrap();
        let lost = a.build_packets(now, HEARTBEAT);
        assert_eq!(lost.len(), 1);

        a.queue_reliable(Frame::new(vec![2])).unwrap();
        // first frame not due yet, only the second goes out
        let got = deliver(&mut a, &mut b, now + Duration::from_millis(10));
        assert!(got.is_empty(), "frame 2 must wait for frame 1");

        let got = deliver(&mut a, &mut b, now + Duration::from_millis(60));
        assert_eq!(got, vec![vec![1], vec![2]]);
        assert!(a.resends() >= 1);
    }

    #[test]
    fn duplicate_packet_is_dropped() {
        let mut a = Channel::new(Duration::from_millis(50));
        let mut b = Channel::new(Duration::from_millis(50));
        a.queue_unreliable(Frame::new(vec![7])).unwrap();

        let packet = a.build_packets(Instant::now(), HEARTBEAT).remove(0);
        let (header, reliable, unreliable) = data(packet);
        let first = b
            .receive(&header, reliable.clone(), unreliable.clone())
            .unwrap();
        assert_eq!(first.unreliable.len(), 1);
        assert!(b.receive(&header, reliable, unreliable).is_none());
    }

    #[test]
    fn ack_only_packet_does_not_echo() {
        let mut a = Channel::new(Duration::from_millis(50));
        let mut b = Channel::new(Duration::from_millis(50));
        let now = Instant::now();

        // initial heartbeats
        deliver(&mut a, &mut b, now);
        deliver(&mut b, &mut a, now);

        assert!(a.build_packets(now, HEARTBEAT).is_empty());
        assert!(b.build_packets(now, HEARTBEAT).is_empty());
    }

    #[test]
    fn large_batches_split_across_packets() {
        let mut a = Channel::new(Duration::from_millis(50));
        for _ in 0..40 {
            a.queue_reliable(Frame::new(vec![0; 100])).unwrap();
        }
        let packets = a.build_packets(Instant::now(), HEARTBEAT);
        assert!(packets.len() > 1);
        for packet in &packets {
            assert!(packet.serialize().is_ok());
        }
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut a = Channel::new(Duration::from_millis(50));
        assert!(matches!(
            a.queue_reliable(Frame::new(vec![0; PAYLOAD_BUDGET])),
            Err(ChannelError::FrameTooLarge { .. })
        ));
    }
}
