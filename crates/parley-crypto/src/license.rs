//! License chains.
//!
//! The server proves it was provisioned by the root authority with a chain
//! of license blocks. The client walks the chain on the Ed25519 curve:
//! starting from the root public key, each block folds its own key in,
//!
//! ```text
//! point_{i+1} = scalar(block_i) * (point_i + key_i)
//! ```
//!
//! where `scalar(block)` hashes the encoded block to a scalar with SHA-512.
//! The final point is the server's ephemeral public key used for the rest
//! of the handshake. The whole chain carries an Ed25519 signature by the
//! root key; a chain that does not verify is rejected before any folding.

use curve25519_dalek::edwards::CompressedEdwardsY;
use curve25519_dalek::Scalar;
use ed25519_dalek::{Signature, VerifyingKey};
use sha2::Sha512;

use crate::error::CryptoError;

/// The root authority public key (compressed Edwards point).
pub const ROOT_KEY: [u8; 32] = [
    0x58, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66,
    0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66,
    0x66, 0x66,
];

/// Encoded size of one license block
const BLOCK_SIZE: usize = 41;

/// Size of the leading chain signature
const SIGNATURE_SIZE: usize = 64;

/// One block of a license chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseBlock {
    /// Compressed Edwards key folded into the walk
    pub key: [u8; 32],
    /// Block kind (intermediate, server, ephemeral)
    pub block_type: u8,
    /// Validity window start, seconds since the epoch
    pub not_valid_before: u32,
    /// Validity window end, seconds since the epoch
    pub not_valid_after: u32,
}

impl LicenseBlock {
    /// Encode the block in its wire layout.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; BLOCK_SIZE] {
        let mut bytes = [0u8; BLOCK_SIZE];
        bytes[..32].copy_from_slice(&self.key);
        bytes[32] = self.block_type;
        bytes[33..37].copy_from_slice(&self.not_valid_before.to_be_bytes());
        bytes[37..].copy_from_slice(&self.not_valid_after.to_be_bytes());
        bytes
    }

    /// The fold scalar for this block: SHA-512 of its encoding reduced
    /// modulo the group order.
    fn fold_scalar(&self) -> Scalar {
        Scalar::hash_from_bytes::<Sha512>(&self.to_bytes())
    }
}

/// A parsed license chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseChain {
    blocks: Vec<LicenseBlock>,
}

impl LicenseChain {
    /// Parse and verify a chain payload: `[signature:64][blocks:41 each]`.
    ///
    /// The signature is checked against `root` before anything else.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::MalformedLicense` for layout errors,
    /// `CryptoError::InvalidPublicKey` if `root` is not a valid verifying
    /// key, or `CryptoError::InvalidSignature`.
    pub fn parse_and_verify(data: &[u8], root: &[u8; 32]) -> Result<Self, CryptoError> {
        if data.len() < SIGNATURE_SIZE + BLOCK_SIZE {
            return Err(CryptoError::MalformedLicense("chain too short"));
        }
        let (signature, blocks) = data.split_at(SIGNATURE_SIZE);
        if blocks.len() % BLOCK_SIZE != 0 {
            return Err(CryptoError::MalformedLicense("truncated block"));
        }

        let mut signature_bytes = [0u8; SIGNATURE_SIZE];
        signature_bytes.copy_from_slice(signature);
        let verifying =
            VerifyingKey::from_bytes(root).map_err(|_| CryptoError::InvalidPublicKey)?;
        verifying
            .verify_strict(blocks, &Signature::from_bytes(&signature_bytes))
            .map_err(|_| CryptoError::InvalidSignature)?;

        let blocks = blocks
            .chunks_exact(BLOCK_SIZE)
            .map(|chunk| {
                let mut key = [0u8; 32];
                key.copy_from_slice(&chunk[..32]);
                LicenseBlock {
                    key,
                    block_type: chunk[32],
                    not_valid_before: u32::from_be_bytes([chunk[33], chunk[34], chunk[35], chunk[36]]),
                    not_valid_after: u32::from_be_bytes([chunk[37], chunk[38], chunk[39], chunk[40]]),
                }
            })
            .collect();

        Ok(Self { blocks })
    }

    /// The blocks in chain order.
    #[must_use]
    pub fn blocks(&self) -> &[LicenseBlock] {
        &self.blocks
    }

    /// Walk the chain from `root`, yielding the server's ephemeral public
    /// key as a compressed Edwards point.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::MalformedLicense` if a block key is not a
    /// curve point, or `CryptoError::InvalidPublicKey` for a bad root.
    pub fn derive_public_key(&self, root: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
        let mut point = CompressedEdwardsY(*root)
            .decompress()
            .ok_or(CryptoError::InvalidPublicKey)?;

        for block in &self.blocks {
            let block_point = CompressedEdwardsY(block.key)
                .decompress()
                .ok_or(CryptoError::MalformedLicense("block key not on the curve"))?;
            point = block.fold_scalar() * (point + block_point);
        }

        Ok(point.compress().to_bytes())
    }
}
