//! Client identities.
//!
//! An identity is a P-256 keypair. The public side is exported as base64
//! of the uncompressed SEC1 point; the UID shown to other clients is the
//! base64 SHA-1 of that export.
//!
//! Servers gate entry on a hash-cash style *security level*: the number of
//! leading zero bits of `SHA-1(pubkey_b64 ++ decimal_offset)`, maximized
//! over offsets the client has brute-forced. Improvement is resumable, so
//! the search can run in bounded slices on a blocking thread.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand_core::CryptoRngCore;
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::error::CryptoError;

/// Key-agreement scheme for one connection attempt.
///
/// The server's negotiation reply picks the scheme: a license field makes
/// it [`KeyScheme::LicenseChain`], carrying the public key walked out of
/// the verified chain; without one the plain identity ECDH is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyScheme {
    /// Plain ECDH against the server identity key.
    EcdhP256,
    /// ECDH bound to the key derived from a verified license chain.
    LicenseChain([u8; 32]),
}

/// A P-256 client identity with its hash-cash state.
#[derive(Clone)]
pub struct Identity {
    key: SecretKey,
    /// Best offset found so far
    valid_key_offset: u64,
    /// Next offset the brute-force search will try
    last_checked_offset: u64,
}

impl Identity {
    /// Generate a fresh identity.
    pub fn generate(rng: &mut impl CryptoRngCore) -> Self {
        Self {
            key: SecretKey::random(rng),
            valid_key_offset: 0,
            last_checked_offset: 0,
        }
    }

    /// Import a previously exported private key with its hash-cash offsets.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::Base64` or `CryptoError::InvalidKeyMaterial`.
    pub fn import(exported: &str, valid_key_offset: u64) -> Result<Self, CryptoError> {
        let bytes = BASE64.decode(exported)?;
        let key = SecretKey::from_slice(&bytes).map_err(|_| CryptoError::InvalidKeyMaterial)?;
        Ok(Self {
            key,
            valid_key_offset,
            last_checked_offset: valid_key_offset,
        })
    }

    /// Export the private key as base64.
    #[must_use]
    pub fn export(&self) -> String {
        BASE64.encode(self.key.to_bytes())
    }

    /// The public key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.key.public_key()
    }

    /// The public key in its wire form: base64 of the uncompressed point.
    #[must_use]
    pub fn public_key_string(&self) -> String {
        BASE64.encode(self.public_key().to_encoded_point(false).as_bytes())
    }

    /// The UID other clients see: base64 of SHA-1 over the exported
    /// public key.
    #[must_use]
    pub fn uid(&self) -> String {
        BASE64.encode(Sha1::digest(self.public_key_string().as_bytes()))
    }

    /// The best offset found by the improvement search.
    #[must_use]
    pub fn valid_key_offset(&self) -> u64 {
        self.valid_key_offset
    }

    /// Where the improvement search will resume.
    #[must_use]
    pub fn last_checked_offset(&self) -> u64 {
        self.last_checked_offset
    }

    /// The security level at a specific counter offset.
    #[must_use]
    pub fn security_level_at(&self, offset: u64) -> u8 {
        let mut hasher = Sha1::new();
        hasher.update(self.public_key_string().as_bytes());
        hasher.update(offset.to_string().as_bytes());
        leading_zero_bits(&hasher.finalize())
    }

    /// The identity's current security level.
    #[must_use]
    pub fn level(&self) -> u8 {
        self.security_level_at(self.valid_key_offset)
    }

    /// Brute-force at most `budget` offsets towards `target` level.
    ///
    /// Returns true once the current level meets the target. State is kept
    /// across calls, so a caller can run this in slices (for example under
    /// `tokio::task::spawn_blocking`) until it reports success.
    pub fn improve(&mut self, target: u8, budget: u64) -> bool {
        let mut best = self.level();
        if best >= target {
            return true;
        }

        // Hashing the base64 export dominates; hoist it out of the loop.
        let pubkey = self.public_key_string();
        let mut prefix = Sha1::new();
        prefix.update(pubkey.as_bytes());

        for _ in 0..budget {
            let offset = self.last_checked_offset;
            self.last_checked_offset += 1;

            let mut hasher = prefix.clone();
            hasher.update(offset.to_string().as_bytes());
            let level = leading_zero_bits(&hasher.finalize());
            if level > best {
                best = level;
                self.valid_key_offset = offset;
                if best >= target {
                    return true;
                }
            }
        }
        false
    }

    /// ECDH against a peer key: SHA-256 of the shared x-coordinate.
    #[must_use]
    pub fn shared_secret(&self, peer: &PublicKey) -> [u8; 32] {
        let shared = diffie_hellman(self.key.to_nonzero_scalar(), peer.as_affine());
        Sha256::digest(shared.raw_secret_bytes()).into()
    }

    /// Agree on the 32-byte session secret under `scheme`.
    ///
    /// The license-chain scheme hashes the walked chain key into the ECDH
    /// x-coordinate, so both ends must have accepted the same chain.
    #[must_use]
    pub fn negotiate_secret(&self, peer: &PublicKey, scheme: &KeyScheme) -> [u8; 32] {
        match scheme {
            KeyScheme::EcdhP256 => self.shared_secret(peer),
            KeyScheme::LicenseChain(derived) => {
                let shared = diffie_hellman(self.key.to_nonzero_scalar(), peer.as_affine());
                Sha256::new()
                    .chain_update(shared.raw_secret_bytes())
                    .chain_update(derived)
                    .finalize()
                    .into()
            }
        }
    }
}

/// Parse a peer public key from its base64 wire form.
///
/// # Errors
///
/// Returns `CryptoError::Base64` or `CryptoError::InvalidPublicKey`.
pub fn parse_public_key(encoded: &str) -> Result<PublicKey, CryptoError> {
    let bytes = BASE64.decode(encoded)?;
    PublicKey::from_sec1_bytes(&bytes).map_err(|_| CryptoError::InvalidPublicKey)
}

fn leading_zero_bits(digest: &[u8]) -> u8 {
    let mut bits = 0u8;
    for &byte in digest {
        if byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros() as u8;
            break;
        }
    }
    bits
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn test_export_import_roundtrip() {
        let identity = Identity::generate(&mut OsRng);
        let restored = Identity::import(&identity.export(), identity.valid_key_offset()).unwrap();
        assert_eq!(identity.public_key_string(), restored.public_key_string());
        assert_eq!(identity.uid(), restored.uid());
    }

    #[test]
    fn test_import_rejects_garbage() {
        assert!(matches!(
            Identity::import("not base64!!", 0),
            Err(CryptoError::Base64(_))
        ));
        // Valid base64, wrong length for a scalar
        assert!(matches!(
            Identity::import("AAECAw==", 0),
            Err(CryptoError::InvalidKeyMaterial)
        ));
    }

    #[test]
    fn test_uid_matches_manual_hash() {
        let identity = Identity::generate(&mut OsRng);
        let expected =
            BASE64.encode(Sha1::digest(identity.public_key_string().as_bytes()));
        assert_eq!(identity.uid(), expected);
    }

    #[test]
    fn test_improve_is_monotonic_and_resumable() {
        let mut identity = Identity::generate(&mut OsRng);
        let start = identity.level();

        // Level 8 is one zero byte, expected after ~256 offsets.
        let mut reached = false;
        for _ in 0..64 {
            if identity.improve(8, 100) {
                reached = true;
                break;
            }
        }
        assert!(reached, "level 8 not reached in 6400 offsets");
        assert!(identity.level() >= 8);
        assert!(identity.level() >= start);
        assert!(identity.last_checked_offset() >= identity.valid_key_offset());

        // Already at target: no work, immediate true
        let checked = identity.last_checked_offset();
        assert!(identity.improve(8, 0));
        assert_eq!(identity.last_checked_offset(), checked);
    }

    #[test]
    fn test_level_reflects_best_offset() {
        let identity = Identity::generate(&mut OsRng);
        assert_eq!(identity.level(), identity.security_level_at(0));
    }

    #[test]
    fn test_ecdh_agreement() {
        let client = Identity::generate(&mut OsRng);
        let server = Identity::generate(&mut OsRng);

        let a = client.shared_secret(&server.public_key());
        let b = server.shared_secret(&client.public_key());
        assert_eq!(a, b);

        let other = Identity::generate(&mut OsRng);
        assert_ne!(a, client.shared_secret(&other.public_key()));
    }

    #[test]
    fn test_license_scheme_binds_derived_key() {
        let client = Identity::generate(&mut OsRng);
        let server = Identity::generate(&mut OsRng);
        let derived = [0x5Au8; 32];

        let a = client.negotiate_secret(
            &server.public_key(),
            &KeyScheme::LicenseChain(derived),
        );
        let b = server.negotiate_secret(
            &client.public_key(),
            &KeyScheme::LicenseChain(derived),
        );
        assert_eq!(a, b);

        // A different chain key yields a different secret
        assert_ne!(
            a,
            client.negotiate_secret(
                &server.public_key(),
                &KeyScheme::LicenseChain([0xA5; 32]),
            )
        );
        // The plain scheme is the bare ECDH secret
        assert_eq!(
            client.negotiate_secret(&server.public_key(), &KeyScheme::EcdhP256),
            client.shared_secret(&server.public_key())
        );
        assert_ne!(a, client.shared_secret(&server.public_key()));
    }

    #[test]
    fn test_parse_public_key_wire_form() {
        let identity = Identity::generate(&mut OsRng);
        let parsed = parse_public_key(&identity.public_key_string()).unwrap();
        assert_eq!(parsed, identity.public_key());
        assert!(parse_public_key("AAAA").is_err());
    }
}
