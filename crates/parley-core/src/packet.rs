//! Packet framing for the Parley wire protocol.
//!
//! Wire layout is `[MAC:8][header][payload]`. The header is 3 bytes for
//! server-to-client packets and 5 bytes for client-to-server packets (the
//! extra field is the client id). All multi-byte fields are big-endian.
//!
//! This layer is pure framing: no payload semantics are validated here.

use crate::error::PacketError;
use crate::{C2S_HEADER_SIZE, MAC_SIZE, S2C_HEADER_SIZE};

/// Packet kinds, carried in the low nibble of the type/flags byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Real-time audio frame
    Voice = 0x00,
    /// Audio frame targeted at specific channels/clients
    VoiceWhisper = 0x01,
    /// Reliable control command
    Command = 0x02,
    /// Reliable low-priority command
    CommandLow = 0x03,
    /// Keepalive / RTT probe
    Ping = 0x04,
    /// Response to Ping
    Pong = 0x05,
    /// Acknowledgment for Command
    Ack = 0x06,
    /// Acknowledgment for CommandLow
    AckLow = 0x07,
    /// Pre-session handshake step
    Init1 = 0x08,
}

impl PacketType {
    /// Number of distinct packet kinds
    pub const COUNT: usize = 9;

    /// Whether this kind is ack-tracked (registered for resend until acked)
    #[must_use]
    pub fn is_ack_tracked(self) -> bool {
        matches!(self, Self::Command | Self::CommandLow)
    }

    /// Whether this kind carries audio
    #[must_use]
    pub fn is_voice(self) -> bool {
        matches!(self, Self::Voice | Self::VoiceWhisper)
    }

    /// The ack kind answering this kind, if any
    #[must_use]
    pub fn ack_kind(self) -> Option<PacketType> {
        match self {
            Self::Command => Some(Self::Ack),
            Self::CommandLow => Some(Self::AckLow),
            _ => None,
        }
    }
}

impl TryFrom<u8> for PacketType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Voice),
            0x01 => Ok(Self::VoiceWhisper),
            0x02 => Ok(Self::Command),
            0x03 => Ok(Self::CommandLow),
            0x04 => Ok(Self::Ping),
            0x05 => Ok(Self::Pong),
            0x06 => Ok(Self::Ack),
            0x07 => Ok(Self::AckLow),
            0x08 => Ok(Self::Init1),
            _ => Err(PacketError::InvalidType(value)),
        }
    }
}

/// Flag bits in the high nibble of the type/flags byte
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// More fragments of this message follow
    pub const FRAGMENTED: u8 = 0x10;
    /// Peer speaks the newer protocol revision
    pub const NEWPROTOCOL: u8 = 0x20;
    /// Payload is QuickerLz-compressed
    pub const COMPRESSED: u8 = 0x40;
    /// Payload is integrity-tagged but not encrypted
    pub const UNENCRYPTED: u8 = 0x80;

    /// Create empty flags
    #[must_use]
    pub fn new() -> Self {
        Self(0)
    }

    /// Create from the high nibble of a raw type/flags byte
    #[must_use]
    pub fn from_byte(byte: u8) -> Self {
        Self(byte & 0xF0)
    }

    /// Add the fragmented flag
    #[must_use]
    pub fn with_fragmented(mut self) -> Self {
        self.0 |= Self::FRAGMENTED;
        self
    }

    /// Add the newprotocol flag
    #[must_use]
    pub fn with_newprotocol(mut self) -> Self {
        self.0 |= Self::NEWPROTOCOL;
        self
    }

    /// Add the compressed flag
    #[must_use]
    pub fn with_compressed(mut self) -> Self {
        self.0 |= Self::COMPRESSED;
        self
    }

    /// Add the unencrypted flag
    #[must_use]
    pub fn with_unencrypted(mut self) -> Self {
        self.0 |= Self::UNENCRYPTED;
        self
    }

    /// Check the fragmented flag
    #[must_use]
    pub fn is_fragmented(&self) -> bool {
        self.0 & Self::FRAGMENTED != 0
    }

    /// Check the newprotocol flag
    #[must_use]
    pub fn is_newprotocol(&self) -> bool {
        self.0 & Self::NEWPROTOCOL != 0
    }

    /// Check the compressed flag
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    /// Check the unencrypted flag
    #[must_use]
    pub fn is_unencrypted(&self) -> bool {
        self.0 & Self::UNENCRYPTED != 0
    }

    /// Clear the fragmented flag
    pub fn clear_fragmented(&mut self) {
        self.0 &= !Self::FRAGMENTED;
    }

    /// Raw byte value (high nibble only)
    #[must_use]
    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

/// Packet direction, carrying the direction-specific header extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client-to-server packets carry the client id assigned by the server
    ClientToServer {
        /// Id the server assigned this client (0 before assignment)
        client_id: u16,
    },
    /// Server-to-client packets carry no extension
    ServerToClient,
}

impl Direction {
    /// Header length for this direction
    #[must_use]
    pub fn header_len(&self) -> usize {
        match self {
            Self::ClientToServer { .. } => C2S_HEADER_SIZE,
            Self::ServerToClient => S2C_HEADER_SIZE,
        }
    }
}

/// A single wire packet.
///
/// `generation` is derived locally from window state; it is never read from
/// the wire and never transmitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet kind
    pub packet_type: PacketType,
    /// Flag bits
    pub flags: PacketFlags,
    /// Wrapping 16-bit sequence id (the only wire-level ordering field)
    pub packet_id: u16,
    /// Wrap count of `packet_id` for this kind, inferred locally
    pub generation: u32,
    /// Direction and its header extension
    pub direction: Direction,
    /// Payload bytes (encrypted on the wire, plaintext in memory)
    pub payload: Vec<u8>,
}

impl Packet {
    /// Create a new packet with generation 0
    #[must_use]
    pub fn new(
        packet_type: PacketType,
        flags: PacketFlags,
        packet_id: u16,
        direction: Direction,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            packet_type,
            flags,
            packet_id,
            generation: 0,
            direction,
            payload,
        }
    }

    /// Header length for this packet's direction
    #[must_use]
    pub fn header_len(&self) -> usize {
        self.direction.header_len()
    }

    /// The combined type/flags byte
    #[must_use]
    pub fn type_and_flags(&self) -> u8 {
        self.flags.as_u8() | self.packet_type as u8
    }

    /// Write the header into `dst`: packet id, optional client id, type/flags
    pub fn build_header(&self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(&self.packet_id.to_be_bytes());
        if let Direction::ClientToServer { client_id } = self.direction {
            dst.extend_from_slice(&client_id.to_be_bytes());
        }
        dst.push(self.type_and_flags());
    }

    /// Header as an owned buffer (used as AEAD associated data)
    #[must_use]
    pub fn header_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.header_len());
        self.build_header(&mut buf);
        buf
    }

    /// Assemble the full wire datagram `[mac][header][payload]`
    #[must_use]
    pub fn to_wire(&self, mac: &[u8; MAC_SIZE]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MAC_SIZE + self.header_len() + self.payload.len());
        buf.extend_from_slice(mac);
        self.build_header(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse a raw datagram arriving from `direction`.
    ///
    /// Returns the packet (payload still encrypted) and its MAC. The
    /// payload may be empty; a datagram shorter than MAC + header is a
    /// framing error.
    ///
    /// # Errors
    ///
    /// Returns `PacketError::TooShort` or `PacketError::InvalidType`.
    pub fn from_raw(data: &[u8], direction: Direction) -> Result<(Self, [u8; MAC_SIZE]), PacketError> {
        let header_len = direction.header_len();
        if data.len() < MAC_SIZE + header_len {
            return Err(PacketError::TooShort {
                expected: MAC_SIZE + header_len,
                actual: data.len(),
            });
        }

        let mut mac = [0u8; MAC_SIZE];
        mac.copy_from_slice(&data[..MAC_SIZE]);

        let packet_id = u16::from_be_bytes([data[MAC_SIZE], data[MAC_SIZE + 1]]);
        let (direction, tf_index) = match direction {
            Direction::ClientToServer { .. } => {
                let client_id = u16::from_be_bytes([data[MAC_SIZE + 2], data[MAC_SIZE + 3]]);
                (Direction::ClientToServer { client_id }, MAC_SIZE + 4)
            }
            Direction::ServerToClient => (Direction::ServerToClient, MAC_SIZE + 2),
        };

        let type_and_flags = data[tf_index];
        let packet_type = PacketType::try_from(type_and_flags & 0x0F)?;
        let flags = PacketFlags::from_byte(type_and_flags);
        let payload = data[MAC_SIZE + header_len..].to_vec();

        Ok((
            Self {
                packet_type,
                flags,
                packet_id,
                generation: 0,
                direction,
                payload,
            },
            mac,
        ))
    }
}

/// Encode the 2-byte Ack/Pong payload (the id being answered)
#[must_use]
pub fn ack_payload(id: u16) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

/// Decode the 2-byte Ack/Pong payload
///
/// # Errors
///
/// Returns `PacketError::InvalidPayloadLength` unless the payload is
/// exactly 2 bytes.
pub fn parse_ack_payload(payload: &[u8]) -> Result<u16, PacketError> {
    if payload.len() != 2 {
        return Err(PacketError::InvalidPayloadLength {
            kind: "ack/pong",
            actual: payload.len(),
        });
    }
    Ok(u16::from_be_bytes([payload[0], payload[1]]))
}
