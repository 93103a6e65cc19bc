// secp256k1 wallet identities and EIP-55 address canonicalization.

use std::fmt;

use k256::ecdsa::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha3::{Digest, Keccak256};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("address `{0}` is not 20 bytes of hex")]
    Malformed(String),

    #[error("address `{0}` has a bad checksum")]
    BadChecksum(String),
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("private key is not 32 bytes of hex")]
    MalformedKey,

    #[error("private key is not a valid secp256k1 scalar: {0}")]
    InvalidKey(#[source] k256::ecdsa::Error),
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// Keccak-256 (the pre-standard SHA3 variant Ethereum uses everywhere).
pub(crate) fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&hasher.finalize());
    hash
}

// ---------------------------------------------------------------------------
// Addresses
// ---------------------------------------------------------------------------

/// Normalize a raw account identifier to its EIP-55 checksummed form.
///
/// Accepts the `0x` prefix or none. All-lowercase and all-uppercase input
/// is accepted as-is; mixed-case input must already carry a valid checksum.
pub fn canonical_address(raw: &str) -> Result<String, AddressError> {
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if digits.len() != 40 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(AddressError::Malformed(raw.to_string()));
    }

    let checksummed = checksum(&digits.to_ascii_lowercase());

    let has_lower = digits.bytes().any(|b| b.is_ascii_lowercase());
    let has_upper = digits.bytes().any(|b| b.is_ascii_uppercase());
    if has_lower && has_upper && checksummed[2..] != *digits {
        return Err(AddressError::BadChecksum(raw.to_string()));
    }

    Ok(checksummed)
}

/// Checksummed address for 20 raw address bytes.
pub fn address_from_bytes(bytes: &[u8; 20]) -> String {
    checksum(&hex::encode(bytes))
}

/// EIP-55: uppercase every hex letter whose nibble in keccak(lowercase) is >= 8.
fn checksum(lower_hex: &str) -> String {
    let hash = keccak256(lower_hex.as_bytes());
    let mut out = String::with_capacity(42);
    out.push_str("0x");
    for (i, c) in lower_hex.chars().enumerate() {
        let nibble = if i % 2 == 0 {
            hash[i / 2] >> 4
        } else {
            hash[i / 2] & 0x0f
        };
        if c.is_ascii_alphabetic() && nibble >= 8 {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn address_from_verifying_key(key: &VerifyingKey) -> String {
    let point = key.to_encoded_point(false);
    // Uncompressed SEC1 point minus the 0x04 tag, last 20 bytes of its hash.
    let hash = keccak256(&point.as_bytes()[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&hash[12..]);
    address_from_bytes(&address)
}

// ---------------------------------------------------------------------------
// WalletIdentity
// ---------------------------------------------------------------------------

/// A local wallet: checksummed address plus `0x`-prefixed private key hex.
#[derive(Clone, PartialEq, Eq)]
pub struct WalletIdentity {
    address: String,
    private_key: String,
}

impl WalletIdentity {
    /// Generate a fresh identity from the OS random number generator.
    pub fn generate() -> Self {
        Self::from_signing_key(&SigningKey::random(&mut OsRng))
    }

    /// Rebuild an identity from a stored private key. The address is always
    /// re-derived from the key.
    pub fn from_private_key(private_key: &str) -> Result<Self, IdentityError> {
        let digits = private_key
            .trim()
            .strip_prefix("0x")
            .unwrap_or(private_key.trim());
        let bytes = hex::decode(digits).map_err(|_| IdentityError::MalformedKey)?;
        if bytes.len() != 32 {
            return Err(IdentityError::MalformedKey);
        }
        let key = SigningKey::from_slice(&bytes).map_err(IdentityError::InvalidKey)?;
        Ok(Self::from_signing_key(&key))
    }

    fn from_signing_key(key: &SigningKey) -> Self {
        Self {
            address: address_from_verifying_key(key.verifying_key()),
            private_key: format!("0x{}", hex::encode(key.to_bytes())),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn private_key(&self) -> &str {
        &self.private_key
    }
}

impl fmt::Debug for WalletIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletIdentity")
            .field("address", &self.address)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
