//! Visor identities.
//!
//! Every visor in the overlay is identified by the public half of an x25519 key pair. The routing
//! core never performs any cryptography itself, it only needs keys to be comparable, hashable and
//! printable, and to move them over the wire.

use core::fmt;
use std::str::FromStr;

use serde::{de::Visitor, Deserialize, Serialize};

/// Size of an encoded [`PublicKey`] in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// The public key of a visor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

/// A secret used to derive a [`PublicKey`].
///
/// This type intentionally does not implement or derive [`Debug`] to avoid accidentally leaking
/// secrets in logs.
#[derive(Clone)]
pub struct SecretKey(x25519_dalek::StaticSecret);

/// Error returned when parsing a [`PublicKey`] from its hex representation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("public key must be {} hex characters", PUBLIC_KEY_SIZE * 2)]
pub struct InvalidPublicKey;

impl SecretKey {
    /// Generate a new `SecretKey` from the OS's entropy source.
    pub fn new() -> Self {
        SecretKey(x25519_dalek::StaticSecret::random())
    }

    /// The [`PublicKey`] belonging to this `SecretKey`.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(x25519_dalek::PublicKey::from(&self.0).to_bytes())
    }
}

impl Default for SecretKey {
    fn default() -> Self {
        Self::new()
    }
}

impl From<[u8; 32]> for SecretKey {
    /// Load a secret key from a byte array.
    fn from(bytes: [u8; 32]) -> SecretKey {
        SecretKey(x25519_dalek::StaticSecret::from(bytes))
    }
}

impl PublicKey {
    /// The all zero key. It never identifies a real visor.
    pub const NULL: PublicKey = PublicKey([0; PUBLIC_KEY_SIZE]);

    /// Checks if this is the [`null key`](PublicKey::NULL).
    #[inline]
    pub fn is_null(&self) -> bool {
        self.0 == [0; PUBLIC_KEY_SIZE]
    }

    /// Convert this `PublicKey` to a byte array.
    #[inline]
    pub fn to_bytes(self) -> [u8; PUBLIC_KEY_SIZE] {
        self.0
    }

    /// View this `PublicKey` as a byte array.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }
}

impl From<[u8; PUBLIC_KEY_SIZE]> for PublicKey {
    fn from(bytes: [u8; PUBLIC_KEY_SIZE]) -> PublicKey {
        PublicKey(bytes)
    }
}

impl From<&SecretKey> for PublicKey {
    fn from(value: &SecretKey) -> Self {
        value.public_key()
    }
}

impl FromStr for PublicKey {
    type Err = InvalidPublicKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != PUBLIC_KEY_SIZE * 2 {
            return Err(InvalidPublicKey);
        }
        let mut backing = [0; PUBLIC_KEY_SIZE];
        faster_hex::hex_decode(s.as_bytes(), &mut backing).map_err(|_| InvalidPublicKey)?;
        Ok(PublicKey(backing))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&faster_hex::hex_string(self.as_bytes()))
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&faster_hex::hex_string(self.as_bytes()))
    }
}

struct PublicKeyVisitor;
impl Visitor<'_> for PublicKeyVisitor {
    type Value = PublicKey;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("A hex encoded public key (64 characters)")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        v.parse().map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(PublicKeyVisitor)
    }
}
