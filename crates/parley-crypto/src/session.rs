//! Session key schedule.
//!
//! After the handshake both ends hold a 32-byte shared IV. Per-packet keys
//! are derived from it:
//!
//! ```text
//! h     = SHA-256(direction_byte ∥ kind_byte ∥ generation_be32 ∥ shared_iv)
//! key   = h[0..16],  key[0] ^= hi(packet_id),  key[1] ^= lo(packet_id)
//! nonce = h[16..32]
//! ```
//!
//! The hash is recomputed only when the generation changes; the result is
//! cached per (direction, kind) and the packet-id XOR is applied on top for
//! every packet.
//!
//! Before the handshake completes, a fixed dummy key/nonce pair derived
//! from a well-known constant is used instead, with no packet-id XOR. The
//! server may answer the first few client packets under the dummy key even
//! after key negotiation; the transport layer handles that race by calling
//! [`CryptoSession::decrypt_with_dummy`] as a fallback.

use parley_core::{Direction, Packet, PacketType};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::eax::{fake_mac, PacketKey};
use crate::error::CryptoError;
use crate::{KEY_SIZE, NONCE_SIZE, SHARED_IV_SIZE, TAG_SIZE};

/// Seed for the pre-handshake dummy key material.
const DUMMY_KEY_SEED: &[u8] = b"c:\\windows\\system\\firewall32.cpl";

/// Which traffic direction a derived key protects.
///
/// The discriminant is the direction byte fed into the key derivation hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeyDirection {
    /// Packets the client sends
    ClientToServer = 0x31,
    /// Packets the server sends
    ServerToClient = 0x30,
}

impl KeyDirection {
    fn index(self) -> usize {
        match self {
            Self::ClientToServer => 0,
            Self::ServerToClient => 1,
        }
    }
}

impl From<Direction> for KeyDirection {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::ClientToServer { .. } => Self::ClientToServer,
            Direction::ServerToClient => Self::ServerToClient,
        }
    }
}

/// Cached derivation result for one (direction, kind) slot.
#[derive(Clone, Zeroize)]
struct CachedKey {
    generation: u32,
    key: [u8; KEY_SIZE],
    nonce: [u8; NONCE_SIZE],
}

/// Per-connection packet crypto state.
///
/// Owns the shared IV and the derived-key cache. All key material is
/// zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct CryptoSession {
    shared_iv: Option<[u8; SHARED_IV_SIZE]>,
    fake_mac: [u8; TAG_SIZE],
    cache: [[Option<CachedKey>; PacketType::COUNT]; 2],
}

impl CryptoSession {
    /// Create a fresh pre-handshake session using the dummy key material.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared_iv: None,
            fake_mac: fake_mac(&dummy_material()),
            cache: std::array::from_fn(|_| std::array::from_fn(|_| None)),
        }
    }

    /// Whether the handshake has installed a real shared IV.
    #[must_use]
    pub fn is_established(&self) -> bool {
        self.shared_iv.is_some()
    }

    /// The fake MAC expected on unencrypted and Init1 packets.
    #[must_use]
    pub fn fake_mac(&self) -> [u8; TAG_SIZE] {
        self.fake_mac
    }

    /// Install a shared IV directly, clearing the derived-key cache.
    pub fn set_shared_iv(&mut self, iv: [u8; SHARED_IV_SIZE]) {
        self.fake_mac = fake_mac(&iv);
        self.shared_iv = Some(iv);
        self.cache = std::array::from_fn(|_| std::array::from_fn(|_| None));
    }

    /// Finish key negotiation: fold the alpha and beta nonces into the
    /// ECDH shared secret and install the result as the shared IV.
    pub fn crypto_init(
        &mut self,
        alpha: &[u8; 10],
        beta: &[u8; 10],
        shared_secret: &[u8; SHARED_IV_SIZE],
    ) {
        let mut iv = *shared_secret;
        for (dst, a) in iv[..10].iter_mut().zip(alpha) {
            *dst ^= a;
        }
        for (dst, b) in iv[10..20].iter_mut().zip(beta) {
            *dst ^= b;
        }
        self.set_shared_iv(iv);
    }

    /// Drop all key material, returning to the pre-handshake state.
    pub fn reset(&mut self) {
        self.shared_iv = None;
        self.fake_mac = fake_mac(&dummy_material());
        self.cache = std::array::from_fn(|_| std::array::from_fn(|_| None));
    }

    /// Encrypt a packet's payload in place and return its wire MAC.
    ///
    /// Init1 and Unencrypted-flagged packets are left as plaintext and get
    /// the fake MAC. Everything else is sealed under the derived key for
    /// the packet's direction, kind and generation (or the dummy key before
    /// the handshake).
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EncryptionFailed` if AEAD encryption fails.
    pub fn encrypt_packet(&mut self, packet: &mut Packet) -> Result<[u8; TAG_SIZE], CryptoError> {
        if packet.packet_type == PacketType::Init1 || packet.flags.is_unencrypted() {
            return Ok(self.fake_mac);
        }

        let key = self.packet_key(
            KeyDirection::from(packet.direction),
            packet.packet_type,
            packet.packet_id,
            packet.generation,
        );
        let header = packet.header_bytes();
        let (ciphertext, mac) = key.encrypt(&header, &packet.payload)?;
        packet.payload = ciphertext;
        Ok(mac)
    }

    /// Decrypt a packet's payload in place, verifying its wire MAC.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::WrongMac` for an unencrypted packet whose fake
    /// MAC does not match, or `CryptoError::DecryptionFailed` on AEAD
    /// authentication failure.
    pub fn decrypt_packet(
        &mut self,
        packet: &mut Packet,
        mac: &[u8; TAG_SIZE],
    ) -> Result<(), CryptoError> {
        if packet.packet_type == PacketType::Init1 || packet.flags.is_unencrypted() {
            if mac != &self.fake_mac {
                return Err(CryptoError::WrongMac);
            }
            return Ok(());
        }

        let key = self.packet_key(
            KeyDirection::from(packet.direction),
            packet.packet_type,
            packet.packet_id,
            packet.generation,
        );
        let header = packet.header_bytes();
        packet.payload = key.decrypt(&header, &packet.payload, mac)?;
        Ok(())
    }

    /// Decrypt under the dummy key regardless of session state.
    ///
    /// Used by the transport for early acks a server may still have sealed
    /// under the dummy key after the client already switched.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::DecryptionFailed` on authentication failure.
    pub fn decrypt_with_dummy(
        &self,
        packet: &mut Packet,
        mac: &[u8; TAG_SIZE],
    ) -> Result<(), CryptoError> {
        let key = dummy_key();
        let header = packet.header_bytes();
        packet.payload = key.decrypt(&header, &packet.payload, mac)?;
        Ok(())
    }

    /// The key/nonce pair for one packet.
    fn packet_key(
        &mut self,
        direction: KeyDirection,
        kind: PacketType,
        packet_id: u16,
        generation: u32,
    ) -> PacketKey {
        let Some(iv) = self.shared_iv else {
            return dummy_key();
        };

        let slot = &mut self.cache[direction.index()][kind as usize];
        let cached = match slot {
            Some(cached) if cached.generation == generation => cached,
            _ => {
                let h = Sha256::new()
                    .chain_update([direction as u8])
                    .chain_update([kind as u8])
                    .chain_update(generation.to_be_bytes())
                    .chain_update(iv)
                    .finalize();
                let mut key = [0u8; KEY_SIZE];
                let mut nonce = [0u8; NONCE_SIZE];
                key.copy_from_slice(&h[..KEY_SIZE]);
                nonce.copy_from_slice(&h[KEY_SIZE..]);
                slot.insert(CachedKey {
                    generation,
                    key,
                    nonce,
                })
            }
        };

        let mut key = cached.key;
        let [hi, lo] = packet_id.to_be_bytes();
        key[0] ^= hi;
        key[1] ^= lo;
        PacketKey::new(key, cached.nonce)
    }
}

impl Default for CryptoSession {
    fn default() -> Self {
        Self::new()
    }
}

/// SHA-256 of the dummy seed; the halves are the dummy key and nonce.
fn dummy_material() -> [u8; SHARED_IV_SIZE] {
    Sha256::digest(DUMMY_KEY_SEED).into()
}

/// The fixed pre-handshake key/nonce pair.
fn dummy_key() -> PacketKey {
    let material = dummy_material();
    let mut key = [0u8; KEY_SIZE];
    let mut nonce = [0u8; NONCE_SIZE];
    key.copy_from_slice(&material[..KEY_SIZE]);
    nonce.copy_from_slice(&material[KEY_SIZE..]);
    PacketKey::new(key, nonce)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::PacketFlags;

    fn command(id: u16, generation: u32, payload: &[u8]) -> Packet {
        let mut packet = Packet::new(
            PacketType::Command,
            PacketFlags::new().with_newprotocol(),
            id,
            Direction::ClientToServer { client_id: 5 },
            payload.to_vec(),
        );
        packet.generation = generation;
        packet
    }

    #[test]
    fn test_two_sessions_agree() {
        let mut client = CryptoSession::new();
        let mut server = CryptoSession::new();
        client.set_shared_iv([0x5A; SHARED_IV_SIZE]);
        server.set_shared_iv([0x5A; SHARED_IV_SIZE]);

        let mut packet = command(7, 0, b"channellist");
        let mac = client.encrypt_packet(&mut packet).unwrap();
        assert_ne!(&packet.payload[..], b"channellist");

        server.decrypt_packet(&mut packet, &mac).unwrap();
        assert_eq!(packet.payload, b"channellist");
    }

    #[test]
    fn test_key_schedule_matches_fixed_vector() {
        // Pinned derivation output so drift in the SHA-256 schedule is
        // caught against another implementation of the same wire crypto
        let mut session = CryptoSession::new();
        session.crypto_init(&[0x11; 10], &[0x22; 10], &[0x33; SHARED_IV_SIZE]);

        let key = session.packet_key(KeyDirection::ClientToServer, PacketType::Command, 0, 0);
        assert_eq!(
            key.key(),
            &[
                0x43, 0x70, 0xae, 0x87, 0xe6, 0xcb, 0xed, 0x87, 0x93, 0x63, 0x36, 0xa1, 0x42,
                0xe0, 0xd4, 0x65,
            ]
        );
        assert_eq!(
            key.nonce(),
            &[
                0x33, 0x49, 0x5d, 0xe2, 0x7a, 0x88, 0x4c, 0x3d, 0xa5, 0x38, 0x1d, 0x3c, 0xbd,
                0x82, 0xf6, 0xca,
            ]
        );
    }

    #[test]
    fn test_crypto_init_folds_nonces() {
        let secret = [0x11u8; SHARED_IV_SIZE];
        let alpha = [0xA0u8; 10];
        let beta = [0x0Bu8; 10];

        let mut with_nonces = CryptoSession::new();
        with_nonces.crypto_init(&alpha, &beta, &secret);
        let mut plain = CryptoSession::new();
        plain.set_shared_iv(secret);

        // Folding alpha/beta must change the keys
        let mut a = command(1, 0, b"x");
        let mut b = command(1, 0, b"x");
        let mac_a = with_nonces.encrypt_packet(&mut a).unwrap();
        let mac_b = plain.encrypt_packet(&mut b).unwrap();
        assert!(mac_a != mac_b || a.payload != b.payload);

        // And a matching peer must agree on the folded IV
        let mut peer = CryptoSession::new();
        peer.crypto_init(&alpha, &beta, &secret);
        assert!(with_nonces.decrypt_packet(&mut b, &mac_b).is_err());
        peer.decrypt_packet(&mut a, &mac_a).unwrap();
        assert_eq!(a.payload, b"x");
    }

    #[test]
    fn test_generation_changes_keys() {
        let mut session = CryptoSession::new();
        session.set_shared_iv([0x5A; SHARED_IV_SIZE]);

        let mut gen0 = command(7, 0, b"same payload");
        let mut gen1 = command(7, 1, b"same payload");
        session.encrypt_packet(&mut gen0).unwrap();
        session.encrypt_packet(&mut gen1).unwrap();
        assert_ne!(gen0.payload, gen1.payload);
    }

    #[test]
    fn test_packet_id_xored_into_key() {
        let mut session = CryptoSession::new();
        session.set_shared_iv([0x5A; SHARED_IV_SIZE]);

        let mut id1 = command(1, 0, b"same payload");
        let mut id2 = command(2, 0, b"same payload");
        session.encrypt_packet(&mut id1).unwrap();
        session.encrypt_packet(&mut id2).unwrap();
        assert_ne!(id1.payload, id2.payload);
    }

    #[test]
    fn test_dummy_key_before_handshake() {
        let mut client = CryptoSession::new();
        let mut server = CryptoSession::new();
        assert!(!client.is_established());

        let mut packet = command(0, 0, b"clientinitiv");
        let mac = client.encrypt_packet(&mut packet).unwrap();
        server.decrypt_packet(&mut packet, &mac).unwrap();
        assert_eq!(packet.payload, b"clientinitiv");
    }

    #[test]
    fn test_dummy_fallback_after_establishment() {
        let mut pre = CryptoSession::new();
        let mut packet = command(1, 0, b"late ack");
        let mac = pre.encrypt_packet(&mut packet).unwrap();

        // Receiver already switched to real keys
        let mut established = CryptoSession::new();
        established.set_shared_iv([0x5A; SHARED_IV_SIZE]);
        let mut copy = packet.clone();
        assert!(established.decrypt_packet(&mut copy, &mac).is_err());
        established.decrypt_with_dummy(&mut packet, &mac).unwrap();
        assert_eq!(packet.payload, b"late ack");
    }

    #[test]
    fn test_unencrypted_uses_fake_mac() {
        let mut session = CryptoSession::new();
        session.set_shared_iv([0x5A; SHARED_IV_SIZE]);

        let mut packet = Packet::new(
            PacketType::Command,
            PacketFlags::new().with_unencrypted(),
            3,
            Direction::ServerToClient,
            b"notify".to_vec(),
        );
        let mac = session.encrypt_packet(&mut packet).unwrap();
        assert_eq!(packet.payload, b"notify");
        assert_eq!(mac, session.fake_mac());

        session.decrypt_packet(&mut packet, &mac).unwrap();
        assert!(matches!(
            session.decrypt_packet(&mut packet, &[0u8; TAG_SIZE]),
            Err(CryptoError::WrongMac)
        ));
    }

    #[test]
    fn test_directions_use_distinct_keys() {
        let mut session = CryptoSession::new();
        session.set_shared_iv([0x5A; SHARED_IV_SIZE]);

        let mut c2s = command(7, 0, b"same payload");
        let mut s2c = Packet::new(
            PacketType::Command,
            PacketFlags::new(),
            7,
            Direction::ServerToClient,
            b"same payload".to_vec(),
        );
        session.encrypt_packet(&mut c2s).unwrap();
        session.encrypt_packet(&mut s2c).unwrap();
        assert_ne!(c2s.payload, s2c.payload);
    }

    #[test]
    fn test_reset_returns_to_dummy() {
        let mut session = CryptoSession::new();
        let pre_mac = session.fake_mac();
        session.set_shared_iv([0x5A; SHARED_IV_SIZE]);
        assert_ne!(session.fake_mac(), pre_mac);

        session.reset();
        assert!(!session.is_established());
        assert_eq!(session.fake_mac(), pre_mac);
    }
}
