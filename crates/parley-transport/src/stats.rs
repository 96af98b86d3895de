//! Connection traffic counters.

use std::time::Duration;

/// A snapshot of connection statistics.
///
/// Updated by the connection core on every send and accepted receive;
/// cheap to clone out for a status display or a serverquery reply.
#[derive(Debug, Default, Clone)]
pub struct NetworkStats {
    /// Datagrams sent, resends included
    pub packets_sent: u64,
    /// Bytes sent on the wire
    pub bytes_sent: u64,
    /// Datagrams accepted from the peer
    pub packets_received: u64,
    /// Bytes accepted from the peer
    pub bytes_received: u64,
    /// Datagrams sent more than once
    pub resends: u64,
    /// Most recent round-trip sample
    pub last_rtt: Option<Duration>,
    /// Smoothed round-trip time
    pub smoothed_rtt: Option<Duration>,
    /// Round-trip variance
    pub rtt_variance: Duration,
}

impl NetworkStats {
    /// Record one outgoing datagram.
    pub fn record_sent(&mut self, bytes: usize) {
        self.packets_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    /// Record one accepted incoming datagram.
    pub fn record_received(&mut self, bytes: usize) {
        self.packets_received += 1;
        self.bytes_received += bytes as u64;
    }

    /// Record one resend (on top of [`record_sent`](Self::record_sent)).
    pub fn record_resend(&mut self) {
        self.resends += 1;
    }

    /// Record a round-trip sample with the estimator's current smoothing.
    pub fn record_rtt(&mut self, rtt: Duration, smoothed: Option<Duration>, variance: Duration) {
        self.last_rtt = Some(rtt);
        self.smoothed_rtt = smoothed;
        self.rtt_variance = variance;
    }
}
