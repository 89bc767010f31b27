//! Transaction signer identity.

use alloy_core::primitives::{Address, keccak256};
use k256::ecdsa::SigningKey;

/// The identity that submits transactions.
///
/// Signing itself is delegated to the ledger endpoint (`eth_sendTransaction`),
/// so a signer is only ever used to name the `from` account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signer {
    address: Address,
}

impl Signer {
    /// A signer whose key is managed by the ledger node.
    pub fn account(address: Address) -> Self {
        Self { address }
    }

    /// Derive the signer's address from a secp256k1 private key.
    ///
    /// # Arguments
    /// * `private_key_hex` - 32-byte private key as hex string (with or without 0x prefix)
    pub fn from_private_key(private_key_hex: &str) -> Result<Self, anyhow::Error> {
        let private_key_hex = private_key_hex
            .trim()
            .strip_prefix("0x")
            .unwrap_or(private_key_hex.trim());

        let private_key_bytes: [u8; 32] = hex::decode(private_key_hex)?
            .try_into()
            .map_err(|_| anyhow::anyhow!("Private key must be exactly 32 bytes"))?;

        let signing_key = SigningKey::from_bytes(&private_key_bytes.into())
            .map_err(|e| anyhow::anyhow!("Invalid secp256k1 private key: {}", e))?;

        // Uncompressed point: 0x04 marker followed by the 64-byte public key.
        let public_key_point = signing_key.verifying_key().to_encoded_point(false);
        let hash = keccak256(&public_key_point.as_bytes()[1..]);

        Ok(Self {
            address: Address::from_slice(&hash[12..]),
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }
}
