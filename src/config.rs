use std::time::Duration;

const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Configuration for the call controller.
#[derive(Clone, Debug)]
pub struct CallConfig {
    /// How long a call may ring before it is ended with `EndReason::Timeout`.
    pub ring_timeout: Duration,
    /// How long an unestablished call survives a signaling disconnect.
    pub reconnect_grace: Duration,
    /// Buffer size of the outward event channel.
    pub event_capacity: usize,
    /// ICE servers handed to the peer connection backend.
    pub stun_servers: Vec<String>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(45),
            reconnect_grace: Duration::from_secs(10),
            event_capacity: 64,
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl CallConfig {
    pub fn with_ring_timeout(mut self, timeout: Duration) -> Self {
        self.ring_timeout = timeout;
        self
    }

    pub fn with_reconnect_grace(mut self, grace: Duration) -> Self {
        self.reconnect_grace = grace;
        self
    }
}
