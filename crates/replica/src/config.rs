use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::identity::PeerIdentity;
use crate::net::DEFAULT_TICK_RATE;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub identity: PeerIdentity,
    pub tick_rate: u32,
    pub resend_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub timeout_ms: u64,
    /// Upper bound on datagrams read per pump cycle.
    pub max_receive_batch: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            identity: PeerIdentity::random(),
            tick_rate: DEFAULT_TICK_RATE,
            resend_interval_ms: 100,
            heartbeat_interval_ms: 250,
            timeout_ms: 10_000,
            max_receive_batch: 256,
        }
    }
}

impl SessionConfig {
    pub fn with_identity(identity: PeerIdentity) -> Self {
        Self {
            identity,
            ..Default::default()
        }
    }

    pub fn resend_interval(&self) -> Duration {
        Duration::from_millis(self.resend_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub session: SessionConfig,
    pub max_peers: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            max_peers: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub session: SessionConfig,
    pub handshake_retry_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            handshake_retry_ms: 500,
        }
    }
}

impl ClientConfig {
    pub fn handshake_retry(&self) -> Duration {
        Duration::from_millis(self.handshake_retry_ms)
    }
}
