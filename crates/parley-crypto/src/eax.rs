//! AES-128-EAX packet encryption.
//!
//! Every encrypted packet is sealed with AES-128 in EAX mode. The wire MAC
//! field is only 8 bytes, so the EAX tag is truncated at the type level
//! (`Eax<Aes128, U8>`); the packet header is fed in as associated data so a
//! tampered header fails authentication just like a tampered payload.
//!
//! Unencrypted and Init1 packets skip the AEAD entirely and carry a fake
//! MAC instead: the first 8 bytes of SHA-1 over the shared IV (or over the
//! dummy IV before the handshake). See [`fake_mac`].

use aes::Aes128;
use aes::cipher::consts::U8;
use eax::Eax;
use eax::aead::generic_array::GenericArray;
use eax::aead::{AeadInPlace, KeyInit};
use sha1::{Digest, Sha1};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

type PacketCipher = Eax<Aes128, U8>;

/// A derived per-packet key/nonce pair.
///
/// Key material is zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct PacketKey {
    key: [u8; KEY_SIZE],
    nonce: [u8; NONCE_SIZE],
}

impl PacketKey {
    /// Create a packet key from raw key and nonce bytes.
    #[must_use]
    pub fn new(key: [u8; KEY_SIZE], nonce: [u8; NONCE_SIZE]) -> Self {
        Self { key, nonce }
    }

    /// Raw key bytes.
    #[must_use]
    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// Raw nonce bytes.
    #[must_use]
    pub fn nonce(&self) -> &[u8; NONCE_SIZE] {
        &self.nonce
    }

    /// Encrypt a payload, authenticating the packet header.
    ///
    /// Returns the ciphertext (same length as the plaintext) and the
    /// truncated tag that becomes the wire MAC.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EncryptionFailed` if AEAD encryption fails.
    pub fn encrypt(
        &self,
        header: &[u8],
        plaintext: &[u8],
    ) -> Result<(Vec<u8>, [u8; TAG_SIZE]), CryptoError> {
        let cipher = PacketCipher::new(GenericArray::from_slice(&self.key));
        let mut buffer = plaintext.to_vec();

        let tag = cipher
            .encrypt_in_place_detached(GenericArray::from_slice(&self.nonce), header, &mut buffer)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut mac = [0u8; TAG_SIZE];
        mac.copy_from_slice(&tag);
        Ok((buffer, mac))
    }

    /// Decrypt a payload, verifying the truncated tag against the header
    /// and ciphertext.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::DecryptionFailed` on authentication failure.
    pub fn decrypt(
        &self,
        header: &[u8],
        ciphertext: &[u8],
        mac: &[u8; TAG_SIZE],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = PacketCipher::new(GenericArray::from_slice(&self.key));
        let mut buffer = ciphertext.to_vec();

        cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(&self.nonce),
                header,
                &mut buffer,
                GenericArray::from_slice(mac),
            )
            .map_err(|_| CryptoError::DecryptionFailed)?;

        Ok(buffer)
    }
}

/// Compute the fake MAC carried by unencrypted and Init1 packets.
///
/// The value is the first 8 bytes of SHA-1 over the shared IV. It proves
/// nothing cryptographically; it only lets both ends cheaply discard
/// datagrams from a different session.
#[must_use]
pub fn fake_mac(shared_iv: &[u8]) -> [u8; TAG_SIZE] {
    let digest = Sha1::digest(shared_iv);
    let mut mac = [0u8; TAG_SIZE];
    mac.copy_from_slice(&digest[..TAG_SIZE]);
    mac
}
