//! # Parley Core
//!
//! Wire-level model for the Parley transport: the pieces that turn an
//! unordered UDP datagram stream into ordered, defragmented, decompressed
//! messages.
//!
//! This crate provides:
//! - Packet framing (header encode/decode for both directions)
//! - Generation windows over wrapping 16-bit packet ids
//! - The command reorder/defragmentation queue
//! - The QuickerLz compression codec
//! - Voice payload encoding/parsing
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Packet                                    │
//! │   ([MAC:8][header:3|5][payload], 9 kinds, 4 flag bits)          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                   GenerationWindow                               │
//! │   (wrapping 16-bit ids classified against a sliding window)     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                      RingQueue                                   │
//! │   (out-of-order buffer, fragment assembly, decompression)       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![forbid(unsafe_code)]

pub mod error;
pub mod packet;
pub mod quickerlz;
pub mod ring;
pub mod voice;
pub mod window;

pub use error::{CompressError, Error, PacketError, RingError, VoiceError, WindowError};
pub use packet::{Direction, Packet, PacketFlags, PacketType};
pub use ring::{RingQueue, SetState};
pub use voice::{VoiceFrame, WhisperTarget};
pub use window::GenerationWindow;

/// Size of the MAC (or fake-signature placeholder) prefixed to every packet
pub const MAC_SIZE: usize = 8;

/// Header size for server-to-client packets (packet id + type/flags)
pub const S2C_HEADER_SIZE: usize = 3;

/// Header size for client-to-server packets (packet id + client id + type/flags)
pub const C2S_HEADER_SIZE: usize = 5;

/// Modulus of the wrapping 16-bit packet id space
pub const ID_MODULUS: u32 = 1 << 16;

/// Largest UDP datagram the protocol ever emits
pub const MAX_UDP_PACKET_SIZE: usize = 500;
