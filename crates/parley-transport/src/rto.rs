//! Retransmission timing.
//!
//! RTT smoothing and timeout computation follow RFC 6298: on each sample
//!
//! ```text
//! rttvar = (1 - β) * rttvar + β * |srtt - rtt|        β = 0.25
//! srtt   = (1 - α) * srtt  + α * rtt                  α = 0.125
//! rto    = srtt + max(G, 4 * rttvar)
//! ```
//!
//! with the tick granularity as `G`. The voice use case wants fast
//! recovery over bandwidth thrift, so resend backoff doubles but is capped
//! at one second rather than growing unbounded.
//!
//! Only the first transmission of a packet feeds a sample (Karn's
//! algorithm); an ack for a resent packet says nothing reliable about the
//! path.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parley_core::PacketType;

/// RTO before the first sample, and the resend backoff cap
pub const MAX_RETRY_INTERVAL: Duration = Duration::from_millis(1000);

/// Clock granularity `G`; the tick interval
pub const CLOCK_GRANULARITY: Duration = Duration::from_millis(100);

const ALPHA: f64 = 0.125;
const BETA: f64 = 0.25;

/// Smoothed RTT state.
#[derive(Debug, Clone)]
pub struct RtoEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
}

impl RtoEstimator {
    /// Create an estimator with no samples.
    #[must_use]
    pub fn new() -> Self {
        Self {
            srtt: None,
            rttvar: Duration::ZERO,
        }
    }

    /// Feed one round-trip sample.
    pub fn sample(&mut self, rtt: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2;
            }
            Some(srtt) => {
                let deviation = if srtt > rtt { srtt - rtt } else { rtt - srtt };
                self.rttvar = Duration::from_secs_f64(
                    (1.0 - BETA) * self.rttvar.as_secs_f64() + BETA * deviation.as_secs_f64(),
                );
                self.srtt = Some(Duration::from_secs_f64(
                    (1.0 - ALPHA) * srtt.as_secs_f64() + ALPHA * rtt.as_secs_f64(),
                ));
            }
        }
    }

    /// The smoothed round-trip time, if any sample arrived yet.
    #[must_use]
    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// The RTT variance.
    #[must_use]
    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    /// The current retransmission timeout.
    #[must_use]
    pub fn rto(&self) -> Duration {
        match self.srtt {
            None => MAX_RETRY_INTERVAL,
            Some(srtt) => (srtt + CLOCK_GRANULARITY.max(4 * self.rttvar)).min(MAX_RETRY_INTERVAL),
        }
    }
}

impl Default for RtoEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// One packet waiting for its ack.
#[derive(Debug, Clone)]
pub struct ResendEntry {
    /// The exact datagram to put back on the wire
    pub wire: Vec<u8>,
    /// When the packet was first sent
    pub first_send: Instant,
    /// When it was last (re)sent
    pub last_send: Instant,
    /// Current backoff interval
    pub interval: Duration,
}

impl ResendEntry {
    /// Whether this entry was never resent.
    #[must_use]
    pub fn never_resent(&self) -> bool {
        self.first_send == self.last_send
    }
}

/// The pending-ack table with its RTT estimator.
///
/// Only Command and CommandLow packets are registered; everything else is
/// fire-and-forget.
#[derive(Debug)]
pub struct ResendQueue {
    estimator: RtoEstimator,
    pending: HashMap<(PacketType, u16), ResendEntry>,
}

impl ResendQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            estimator: RtoEstimator::new(),
            pending: HashMap::new(),
        }
    }

    /// Register a freshly sent ack-tracked packet.
    pub fn register(&mut self, kind: PacketType, packet_id: u16, wire: Vec<u8>, now: Instant) {
        debug_assert!(kind.is_ack_tracked());
        self.pending.insert(
            (kind, packet_id),
            ResendEntry {
                wire,
                first_send: now,
                last_send: now,
                interval: self.estimator.rto(),
            },
        );
    }

    /// Remove an acked packet. If the entry was sample worthy, feeds the
    /// estimator and returns the round-trip time.
    pub fn ack(&mut self, kind: PacketType, packet_id: u16, now: Instant) -> Option<Duration> {
        let entry = self.pending.remove(&(kind, packet_id))?;
        if !entry.never_resent() {
            return None;
        }
        let rtt = now - entry.first_send;
        self.estimator.sample(rtt);
        Some(rtt)
    }

    /// Collect the datagrams whose backoff expired, doubling each one's
    /// interval up to the cap.
    pub fn due_resends(&mut self, now: Instant) -> Vec<Vec<u8>> {
        let mut due = Vec::new();
        for entry in self.pending.values_mut() {
            if now >= entry.last_send + entry.interval {
                entry.last_send = now;
                entry.interval = (entry.interval * 2).min(MAX_RETRY_INTERVAL);
                due.push(entry.wire.clone());
            }
        }
        due
    }

    /// Age of the oldest unacked packet.
    #[must_use]
    pub fn oldest_age(&self, now: Instant) -> Option<Duration> {
        self.pending
            .values()
            .map(|entry| now - entry.first_send)
            .max()
    }

    /// Feed an RTT sample from outside the table (pong answers).
    pub fn sample(&mut self, rtt: Duration) {
        self.estimator.sample(rtt);
    }

    /// The RTT estimator.
    #[must_use]
    pub fn estimator(&self) -> &RtoEstimator {
        &self.estimator
    }

    /// Number of unacked packets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing waits for an ack.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop every pending packet without acking.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

impl Default for ResendQueue {
    fn default() -> Self {
        Self::new()
    }
}
