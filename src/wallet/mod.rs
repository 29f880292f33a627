//! Wallet provisioning.
//!
//! Every registered account receives one freshly generated secp256k1 keypair.
//! The address is derived from the uncompressed public key the way Ethereum
//! derives it: Keccak-256 of the 64-byte point, last 20 bytes, EIP-55
//! checksum casing. Generation is pure and independent of any other account;
//! no funding, signing, or transaction logic lives here.

use k256::ecdsa::SigningKey;
use rand::rngs::OsRng;
use sha3::{Digest, Keccak256};

/// A generated keypair: the address is persisted, the private key is handed
/// to the caller exactly once and never stored server-side.
#[derive(Debug, Clone)]
pub struct Wallet {
    pub address: String,
    pub private_key: String,
}

/// Generate a new wallet from OS randomness.
#[must_use]
pub fn generate() -> Wallet {
    let signing_key = SigningKey::random(&mut OsRng);
    from_signing_key(&signing_key)
}

fn from_signing_key(signing_key: &SigningKey) -> Wallet {
    let public_key = signing_key.verifying_key().to_encoded_point(false);
    // Skip the 0x04 uncompressed-point marker
    let digest = Keccak256::digest(&public_key.as_bytes()[1..]);
    let address = to_checksum_address(&digest[12..]);
    let private_key = format!("0x{}", hex::encode(signing_key.to_bytes()));

    Wallet {
        address,
        private_key,
    }
}

/// EIP-55: uppercase every hex letter whose corresponding nibble in the
/// Keccak-256 hash of the lowercase address is >= 8.
fn to_checksum_address(bytes: &[u8]) -> String {
    let lower = hex::encode(bytes);
    let hash = Keccak256::digest(lower.as_bytes());

    let mut address = String::with_capacity(2 + lower.len());
    address.push_str("0x");

    for (index, character) in lower.chars().enumerate() {
        let nibble = if index % 2 == 0 {
            hash[index / 2] >> 4
        } else {
            hash[index / 2] & 0x0f
        };

        if character.is_ascii_alphabetic() && nibble >= 8 {
            address.push(character.to_ascii_uppercase());
        } else {
            address.push(character);
        }
    }

    address
}
