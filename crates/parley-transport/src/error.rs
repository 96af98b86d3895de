//! Transport error types.

use thiserror::Error;

/// Why a connection ended.
///
/// `Timeout` and `Error` originate in this crate; the server-initiated
/// reasons are mapped by the application from the notify command that
/// announced them. Reconnect policy on top of these is the application's
/// business.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// No reason given
    None,
    /// No traffic or unacknowledged packets for too long
    Timeout,
    /// Removed from the server by a moderator
    Kick,
    /// The server is shutting down
    ServerShutdown,
    /// Banned from the server
    Ban,
    /// A protocol or crypto error killed the connection
    Error,
    /// We left on our own
    LeftServer,
}

/// Errors from the Init1 handshake machine
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Empty Init1 payload
    #[error("empty init payload")]
    Empty,

    /// An Init1 payload had the wrong length for its step
    #[error("init step {step} payload has {actual} bytes")]
    WrongLength {
        /// The step byte of the offending payload
        step: u8,
        /// Its actual length
        actual: usize,
    },

    /// The server sent a step we were not waiting for
    #[error("unexpected init step {got}, expected {expected}")]
    UnexpectedStep {
        /// The step the machine was waiting for
        expected: u8,
        /// The step that arrived
        got: u8,
    },

    /// The server echoed back a wrong random value
    #[error("init random echo mismatch")]
    RandomMismatch,

    /// Puzzle or key errors bubbling up from the crypto engine
    #[error(transparent)]
    Crypto(#[from] parley_crypto::CryptoError),

    /// A key-negotiation command was missing a required field
    #[error("init command missing field {0}")]
    MissingField(&'static str),

    /// A key-negotiation command field had the wrong size or format
    #[error("init command field {0} malformed")]
    MalformedField(&'static str),
}

/// Errors surfaced by the connection engine
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Socket-level failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Packet framing failure
    #[error(transparent)]
    Packet(#[from] parley_core::PacketError),

    /// Reorder queue failure
    #[error(transparent)]
    Ring(#[from] parley_core::RingError),

    /// Crypto failure
    #[error(transparent)]
    Crypto(#[from] parley_crypto::CryptoError),

    /// Handshake failure
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// The connection is closed
    #[error("connection is closed")]
    Closed,

    /// A voice packet exceeded the datagram budget (voice is never split)
    #[error("voice packet of {0} bytes does not fit a datagram")]
    VoiceTooLarge(usize),
}
