//! WireGuard Key Handling
//!
//! Base64 X25519 keys as they travel through settings, the server catalog
//! and the daemon protocol.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use std::fmt;
use std::str::FromStr;

/// Length of a key prefix that is safe to put in logs
const LOG_PREFIX_LEN: usize = 8;

/// Device private key (Curve25519)
#[derive(Clone)]
pub struct PrivateKey {
    secret: StaticSecret,
}

impl PrivateKey {
    /// Generate a new random private key
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Create from base64 string
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        let bytes = decode_key(s)?;
        Ok(Self {
            secret: StaticSecret::from(bytes),
        })
    }

    /// Get the corresponding public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            key: X25519Public::from(&self.secret),
        }
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.secret.to_bytes())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([redacted])")
    }
}

/// Server or device public key (Curve25519)
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PublicKey {
    key: X25519Public,
}

impl PublicKey {
    /// Create from base64 string
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        let bytes = decode_key(s)?;
        Ok(Self {
            key: X25519Public::from(bytes),
        })
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.key.to_bytes())
    }

    /// Truncated form for log lines
    pub fn short(&self) -> String {
        short_key(&self.to_base64())
    }
}

impl FromStr for PublicKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base64(s)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", self.short())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

/// A key pair (private + public)
#[derive(Clone)]
pub struct KeyPair {
    pub private: PrivateKey,
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self::from_private(PrivateKey::generate())
    }

    /// Create from a private key
    pub fn from_private(private: PrivateKey) -> Self {
        let public = private.public_key();
        Self { private, public }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish()
    }
}

/// Truncate a base64 key for logging. Never pass private keys here.
pub(crate) fn short_key(key: &str) -> String {
    key.chars().take(LOG_PREFIX_LEN).collect()
}

fn decode_key(s: &str) -> Result<[u8; 32], KeyError> {
    let bytes = BASE64.decode(s.trim())
        .map_err(|_| KeyError::InvalidBase64)?;

    bytes.try_into().map_err(|_| KeyError::InvalidLength)
}

/// Key parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid base64 encoding")]
    InvalidBase64,

    #[error("Invalid key length (expected 32 bytes)")]
    InvalidLength,
}
