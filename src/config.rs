use std::time::Duration;

/// Per-session configuration, read-only after the session is built.
///
/// The concurrent-stream limits stand in for peer-advertised credit when the
/// transport never sends an explicit limit; a native engine that does send
/// one simply raises these at runtime.
#[derive(Debug, Clone)]
pub struct Config {
    /// How long the connect/handshake phase may take before the session
    /// resolves as failed.
    pub connect_timeout: Duration,

    /// Concurrent locally-initiated bidirectional streams.
    pub max_streams_bidi: u64,

    /// Concurrent locally-initiated unidirectional streams.
    pub max_streams_uni: u64,

    /// Send-credit window per stream, in bytes. On the fallback transport
    /// the window refills when the tunnel drains; native engines override
    /// it with explicit credit updates.
    pub initial_send_credit: u64,

    /// Outgoing datagrams held while the transport is busy. Overflow drops
    /// the oldest queued datagram.
    pub datagram_send_queue: usize,

    /// Incoming datagrams held until the caller reads them. Overflow drops
    /// new arrivals.
    pub datagram_recv_queue: usize,

    /// Largest capsule payload accepted before the session is failed with a
    /// protocol error. Also bounds datagram size in fallback mode.
    pub max_capsule_payload: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_streams_bidi: 100,
            max_streams_uni: 100,
            initial_send_credit: 1 << 20,
            datagram_send_queue: 32,
            datagram_recv_queue: 32,
            max_capsule_payload: 1 << 20,
        }
    }
}
