//! Client version signatures.
//!
//! Servers only admit clients announcing a release build, proven by an
//! Ed25519 signature over `platform ++ version` issued by the vendor's
//! release-signing key. Clients verify announcements from other peers the
//! same way before trusting their stated version.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::error::CryptoError;

/// Verify a version signature.
///
/// The signed message is the platform string immediately followed by the
/// version string, no separator.
///
/// # Errors
///
/// Returns `CryptoError::InvalidPublicKey` for a malformed signing key and
/// `CryptoError::InvalidSignature` if verification fails.
pub fn verify_version(
    signing_key: &[u8; 32],
    platform: &str,
    version: &str,
    signature: &[u8; 64],
) -> Result<(), CryptoError> {
    let key = VerifyingKey::from_bytes(signing_key).map_err(|_| CryptoError::InvalidPublicKey)?;

    let mut message = Vec::with_capacity(platform.len() + version.len());
    message.extend_from_slice(platform.as_bytes());
    message.extend_from_slice(version.as_bytes());

    key.verify(&message, &Signature::from_bytes(signature))
        .map_err(|_| CryptoError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use rand_core::OsRng;

    const PLATFORM: &str = "Linux";
    const VERSION: &str = "3.6.2 [Build: 1695203293]";

    fn signed() -> ([u8; 32], [u8; 64]) {
        let signing = SigningKey::generate(&mut OsRng);
        let mut message = PLATFORM.as_bytes().to_vec();
        message.extend_from_slice(VERSION.as_bytes());
        let signature = signing.sign(&message);
        (signing.verifying_key().to_bytes(), signature.to_bytes())
    }

    #[test]
    fn test_valid_signature_accepted() {
        let (key, signature) = signed();
        verify_version(&key, PLATFORM, VERSION, &signature).unwrap();
    }

    #[test]
    fn test_wrong_version_rejected() {
        let (key, signature) = signed();
        assert!(matches!(
            verify_version(&key, PLATFORM, "3.6.3 [Build: 1700000000]", &signature),
            Err(CryptoError::InvalidSignature)
        ));
    }

    #[test]
    fn test_wrong_platform_rejected() {
        let (key, signature) = signed();
        assert!(verify_version(&key, "Windows", VERSION, &signature).is_err());
    }

    #[test]
    fn test_malformed_key_rejected() {
        let (_, signature) = signed();
        // Non-canonical encoding: y >= p
        assert!(matches!(
            verify_version(&[0xFF; 32], PLATFORM, VERSION, &signature),
            Err(CryptoError::InvalidPublicKey)
        ));
    }
}
