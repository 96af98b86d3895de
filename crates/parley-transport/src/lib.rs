//! # Parley Transport
//!
//! The connection layer: UDP plumbing, the Init1 handshake, adaptive
//! retransmission and the connection state machine tying it all to the
//! crypto engine.
//!
//! This crate provides:
//! - [`Connection`], the async client handle (connect, commands, voice)
//! - [`ConnectionCore`], the clock-driven state machine underneath it
//! - [`Init1Machine`], the five-step low-level handshake
//! - [`ResendQueue`] and [`RtoEstimator`], RFC 6298 retransmission
//! - [`Command`] encoding with the protocol's escape rules
//! - [`NetworkStats`] traffic and RTT counters
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Connection                                │
//! │     (UDP socket, receive task, 100 ms tick task, events)        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                      ConnectionCore                              │
//! │   (handshake, split/compress, ack bookkeeping, dispatch)        │
//! ├──────────────┬───────────────────┬──────────────────────────────┤
//! │ Init1Machine │    ResendQueue    │        CryptoSession         │
//! │  (handshake  │  (RFC 6298 RTO,   │     (parley-crypto: EAX,     │
//! │   steps 0-4) │   Karn, backoff)  │      key schedule)           │
//! └──────────────┴───────────────────┴──────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![forbid(unsafe_code)]

pub mod command;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod rto;
pub mod stats;
pub mod udp;

pub use command::Command;
pub use connection::{
    Connection, ConnectionConfig, ConnectionCore, ConnectionState, Event, MAX_OUT_CONTENT_SIZE,
    PACKET_TIMEOUT, PING_INTERVAL,
};
pub use error::{ConnectionError, HandshakeError, Reason};
pub use handshake::{Init1Machine, Init1Reply};
pub use rto::{ResendQueue, RtoEstimator, CLOCK_GRANULARITY, MAX_RETRY_INTERVAL};
pub use stats::NetworkStats;
pub use udp::UdpConnection;
