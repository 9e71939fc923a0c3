use std::io;
use std::net::SocketAddr;

use super::transport::Transport;

/// Wraps a transport and drops a share of outgoing datagrams. Seeded, so a
/// given seed loses the same packets every run.
#[derive(Debug)]
pub struct LossyTransport<T> {
    inner: T,
    loss_percent: f32,
    rng: fastrand::Rng,
    dropped: u64,
}

impl<T: Transport> LossyTransport<T> {
    pub fn new(inner: T, loss_percent: f32, seed: u64) -> Self {
        Self {
            inner,
            loss_percent: loss_percent.clamp(0.0, 100.0),
            rng: fastrand::Rng::with_seed(seed),
            dropped: 0,
        }
    }

    pub fn set_loss(&mut self, loss_percent: f32) {
        self.loss_percent = loss_percent.clamp(0.0, 100.0);
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    fn should_drop(&mut self) -> bool {
        self.loss_percent > 0.0 && self.rng.f32() * 100.0 < self.loss_percent
    }
}

impl<T: Transport> Transport for LossyTransport<T> {
    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }

    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if self.should_drop() {
            self.dropped += 1;
            log::trace!("simulated loss of {} bytes to {addr}", data.len());
            return Ok(data.len());
        }
        self.inner.send_to(data, addr)
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        self.inner.recv_from(buf)
    }
}
