//! Voice payload encoding and parsing.
//!
//! Voice and VoiceWhisper packets carry `[seq:u16][codec:u8]` followed by
//! the encoded audio frame. Whisper packets insert a routing table between
//! the codec byte and the audio: `[N:u8][M:u8][channel ids:u64 BE x N]
//! [client ids:u16 BE x M]`.

use crate::error::VoiceError;

/// Whisper routing: the channels and clients a frame is addressed to
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WhisperTarget {
    /// Target channel ids
    pub channels: Vec<u64>,
    /// Target client ids
    pub clients: Vec<u16>,
}

/// A decoded voice payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceFrame {
    /// Per-stream audio sequence number (independent of packet ids)
    pub seq: u16,
    /// Audio codec identifier
    pub codec: u8,
    /// Whisper routing, present only for VoiceWhisper packets
    pub whisper: Option<WhisperTarget>,
    /// Encoded audio frame
    pub audio: Vec<u8>,
}

impl VoiceFrame {
    /// Encode into a packet payload
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let routing_len = self
            .whisper
            .as_ref()
            .map_or(0, |w| 2 + w.channels.len() * 8 + w.clients.len() * 2);
        let mut buf = Vec::with_capacity(3 + routing_len + self.audio.len());
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.push(self.codec);
        if let Some(whisper) = &self.whisper {
            buf.push(whisper.channels.len() as u8);
            buf.push(whisper.clients.len() as u8);
            for channel in &whisper.channels {
                buf.extend_from_slice(&channel.to_be_bytes());
            }
            for client in &whisper.clients {
                buf.extend_from_slice(&client.to_be_bytes());
            }
        }
        buf.extend_from_slice(&self.audio);
        buf
    }

    /// Parse a voice payload; `whisper` selects the VoiceWhisper layout.
    ///
    /// # Errors
    ///
    /// Returns `VoiceError::TooShort` for payloads missing the fixed
    /// prefix and `VoiceError::TruncatedRouting` when the whisper routing
    /// table overruns the payload.
    pub fn parse(payload: &[u8], whisper: bool) -> Result<Self, VoiceError> {
        if payload.len() < 3 {
            return Err(VoiceError::TooShort(payload.len()));
        }
        let seq = u16::from_be_bytes([payload[0], payload[1]]);
        let codec = payload[2];
        let mut pos = 3;

        let routing = if whisper {
            if payload.len() < pos + 2 {
                return Err(VoiceError::TruncatedRouting);
            }
            let channel_count = usize::from(payload[pos]);
            let client_count = usize::from(payload[pos + 1]);
            pos += 2;

            let table_len = channel_count * 8 + client_count * 2;
            if payload.len() < pos + table_len {
                return Err(VoiceError::TruncatedRouting);
            }

            let mut channels = Vec::with_capacity(channel_count);
            for _ in 0..channel_count {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&payload[pos..pos + 8]);
                channels.push(u64::from_be_bytes(bytes));
                pos += 8;
            }
            let mut clients = Vec::with_capacity(client_count);
            for _ in 0..client_count {
                clients.push(u16::from_be_bytes([payload[pos], payload[pos + 1]]));
                pos += 2;
            }
            Some(WhisperTarget { channels, clients })
        } else {
            None
        };

        Ok(Self {
            seq,
            codec,
            whisper: routing,
            audio: payload[pos..].to_vec(),
        })
    }
}
