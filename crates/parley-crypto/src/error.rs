//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Packet MAC does not match the expected fake MAC
    #[error("wrong packet mac")]
    WrongMac,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Invalid key material (corrupted or wrong format)
    #[error("invalid key material")]
    InvalidKeyMaterial,

    /// Base64 decoding failed
    #[error("base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Invalid public key
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Invalid signature
    #[error("invalid signature")]
    InvalidSignature,

    /// Puzzle level exceeds the abuse cap
    #[error("puzzle level {0} exceeds maximum")]
    PuzzleLevelTooLarge(u32),

    /// Puzzle modulus is zero
    #[error("puzzle modulus is zero")]
    PuzzleModulusZero,

    /// License chain is truncated or malformed
    #[error("malformed license chain: {0}")]
    MalformedLicense(&'static str),

    /// Session keys requested before the handshake established them
    #[error("crypto session not established")]
    NotEstablished,
}
