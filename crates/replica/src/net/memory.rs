use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;

use super::transport::Transport;

const FIRST_PORT: u16 = 10_000;

type Datagram = (SocketAddr, Vec<u8>);

#[derive(Debug, Default)]
struct Switch {
    inboxes: HashMap<SocketAddr, VecDeque<Datagram>>,
    next_port: u16,
}

/// In-process datagram network. Every bound [`MemoryTransport`] gets its own
/// loopback address; sends to an unbound address vanish like UDP.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    switch: Rc<RefCell<Switch>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self) -> MemoryTransport {
        let mut switch = self.switch.borrow_mut();
        if switch.next_port == 0 {
            switch.next_port = FIRST_PORT;
        }
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), switch.next_port);
        switch.next_port = switch.next_port.wrapping_add(1);
        switch.inboxes.insert(addr, VecDeque::new());

        MemoryTransport {
            switch: Rc::clone(&self.switch),
            addr,
        }
    }

    /// Datagrams waiting at `addr`.
    pub fn in_flight(&self, addr: SocketAddr) -> usize {
        self.switch
            .borrow()
            .inboxes
            .get(&addr)
            .map_or(0, VecDeque::len)
    }
}

#[derive(Debug)]
pub struct MemoryTransport {
    switch: Rc<RefCell<Switch>>,
    addr: SocketAddr,
}

impl Transport for MemoryTransport {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if let Some(inbox) = self.switch.borrow_mut().inboxes.get_mut(&addr) {
            inbox.push_back((self.addr, data.to_vec()));
        }
        Ok(data.len())
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let mut switch = self.switch.borrow_mut();
        let Some((from, data)) = switch
            .inboxes
            .get_mut(&self.addr)
            .and_then(VecDeque::pop_front)
        else {
            return Ok(None);
        };
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok(Some((len, from)))
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.switch.borrow_mut().inboxes.remove(&self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagrams_route_by_address() {
        let network = MemoryNetwork::new();
        let mut a = network.bind();
        let mut b = network.bind();
        assert_ne!(a.local_addr(), b.local_addr());

        a.send_to(b"hello", b.local_addr()).unwrap();
        assert_eq!(network.in_flight(b.local_addr()), 1);

        let mut buf = [0u8; 16];
        let (len, from) = b.recv_from(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(from, a.local_addr());
        assert!(b.recv_from(&mut buf).unwrap().is_none());
    }

    #[test]
    fn dropped_transport_stops_receiving() {
        let network = MemoryNetwork::new();
        let mut a = network.bind();
        let b = network.bind();
        let gone = b.local_addr();
        drop(b);

        assert_eq!(a.send_to(b"lost", gone).unwrap(), 4);
        assert_eq!(network.in_flight(gone), 0);
    }
}
