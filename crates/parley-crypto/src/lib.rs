//! # Parley Crypto
//!
//! Cryptographic engine for the Parley transport.
//!
//! This crate provides:
//! - AES-128-EAX packet encryption with a truncated 8-byte tag
//! - The session key schedule (per direction/kind/generation cache)
//! - P-256 client identities with UID and hash-cash security levels
//! - The license-chain walk deriving the server's ephemeral public key
//! - The RSA time-lock puzzle solver used during Init1
//! - Version-signature verification
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      CryptoSession                               │
//! │   (shared IV, key/nonce cache, encrypt/decrypt per packet)      │
//! ├──────────────────────┬──────────────────────────────────────────┤
//! │      Identity        │            LicenseChain                  │
//! │  (P-256 ECDH, UID,   │   (Ed25519 verify, Edwards scalar        │
//! │   security level)    │    fold to the server key)               │
//! ├──────────────────────┴──────────────────────────────────────────┤
//! │                    puzzle / version                              │
//! │   (modpow time-lock, release-signature check)                   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![forbid(unsafe_code)]

pub mod eax;
pub mod error;
pub mod identity;
pub mod license;
pub mod puzzle;
pub mod session;
pub mod version;

pub use error::CryptoError;
pub use identity::{Identity, KeyScheme};
pub use license::LicenseChain;
pub use session::{CryptoSession, KeyDirection};

/// AEAD key size (AES-128)
pub const KEY_SIZE: usize = 16;

/// AEAD nonce size (one AES block)
pub const NONCE_SIZE: usize = 16;

/// Truncated authentication tag size, equal to the wire MAC field
pub const TAG_SIZE: usize = 8;

/// Shared IV size after the newprotocol handshake
pub const SHARED_IV_SIZE: usize = 32;
