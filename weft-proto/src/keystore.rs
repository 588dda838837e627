//! Key store abstraction.
//!
//! The framing layer never owns key material; it asks a `KeyStore` for
//! symmetric keys, EC keys, ephemeral keys and certificates by
//! identifier. Applications supply their own store; `MemoryKeyStore` is
//! the in-process implementation used by the tests and examples.

use bytes::Bytes;
use elliptic_curve::sec1::ToEncodedPoint;
use hashbrown::HashMap;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;

use weft_core::error::{Error, Result};

/// Key identifier carried in COSE headers.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct KeyId(Bytes);

impl KeyId {
    #[must_use]
    pub fn new(id: impl Into<Bytes>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "KeyId({s})"),
            Err(_) => write!(f, "KeyId({})", hex_lower(&self.0)),
        }
    }
}

fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl From<&str> for KeyId {
    fn from(id: &str) -> Self {
        Self(Bytes::copy_from_slice(id.as_bytes()))
    }
}

impl From<&[u8]> for KeyId {
    fn from(id: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(id))
    }
}

/// Elliptic curves supported by the framing layer. Values are the COSE
/// curve registry identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcCurve {
    P384 = 2,
    P521 = 3,
}

impl EcCurve {
    /// Size of one coordinate in bytes.
    #[must_use]
    pub const fn coordinate_size(self) -> usize {
        match self {
            Self::P384 => 48,
            Self::P521 => 66,
        }
    }

    pub fn from_cose(value: i64) -> Result<Self> {
        match value {
            2 => Ok(Self::P384),
            3 => Ok(Self::P521),
            _ => Err(Error::NotImplemented),
        }
    }
}

/// An EC key; `d` is present for private keys only.
#[derive(Clone, PartialEq, Eq)]
pub struct EcKey {
    pub curve: EcCurve,
    pub x: Vec<u8>,
    pub y: Vec<u8>,
    pub d: Option<Vec<u8>>,
}

impl fmt::Debug for EcKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EcKey")
            .field("curve", &self.curve)
            .field("private", &self.d.is_some())
            .finish()
    }
}

/// Key material returned by a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key {
    /// Raw symmetric key bytes.
    Symmetric(Vec<u8>),
    /// EC key pair or public key.
    Ec(EcKey),
    /// An encoded certificate, used by discovery flows.
    Cert(Bytes),
}

impl Key {
    pub(crate) fn symmetric(&self) -> Result<&[u8]> {
        match self {
            Self::Symmetric(bytes) => Ok(bytes),
            _ => Err(Error::Missing("symmetric key")),
        }
    }

    pub(crate) fn ec(&self) -> Result<&EcKey> {
        match self {
            Self::Ec(key) => Ok(key),
            _ => Err(Error::Missing("ec key")),
        }
    }
}

/// What kind of ephemeral key is being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EphemeralRequest {
    /// A fresh random symmetric content key.
    Symmetric,
    /// A fresh EC key pair on the given curve.
    Ec(EcCurve),
}

/// Callbacks the framing layer uses to obtain key material.
pub trait KeyStore: Send + Sync {
    /// Look up a key by identifier.
    fn key(&self, id: &KeyId) -> Result<Key>;

    /// The local signing identity.
    fn identity(&self) -> Result<(KeyId, Key)> {
        Err(Error::Missing("identity"))
    }

    /// Produce an ephemeral key. Implementations should never reuse one.
    fn ephemeral_key(&self, request: EphemeralRequest) -> Result<Key>;

    /// The trust anchor for certificate flows.
    fn ca(&self) -> Result<Bytes> {
        Err(Error::Missing("ca"))
    }
}

/// Generate a random EC key pair on `curve`.
#[must_use]
pub fn generate_ec_key(curve: EcCurve) -> Key {
    match curve {
        EcCurve::P384 => {
            let secret = p384::SecretKey::random(&mut OsRng);
            let point = secret.public_key().to_encoded_point(false);
            Key::Ec(EcKey {
                curve,
                x: point.x().map(|x| x.to_vec()).unwrap_or_default(),
                y: point.y().map(|y| y.to_vec()).unwrap_or_default(),
                d: Some(secret.to_bytes().to_vec()),
            })
        }
        EcCurve::P521 => {
            let secret = p521::SecretKey::random(&mut OsRng);
            let point = secret.public_key().to_encoded_point(false);
            Key::Ec(EcKey {
                curve,
                x: point.x().map(|x| x.to_vec()).unwrap_or_default(),
                y: point.y().map(|y| y.to_vec()).unwrap_or_default(),
                d: Some(secret.to_bytes().to_vec()),
            })
        }
    }
}

/// A public-key-only view of `key`, suitable for handing to another
/// node's store.
#[must_use]
pub fn public_half(key: &Key) -> Key {
    match key {
        Key::Ec(ec) => Key::Ec(EcKey {
            curve: ec.curve,
            x: ec.x.clone(),
            y: ec.y.clone(),
            d: None,
        }),
        other => other.clone(),
    }
}

/// In-memory key store.
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: RwLock<HashMap<KeyId, Key>>,
    identity: RwLock<Option<KeyId>>,
    ca: RwLock<Option<Bytes>>,
}

impl MemoryKeyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, id: impl Into<KeyId>, key: Key) {
        self.keys.write().insert(id.into(), key);
    }

    pub fn remove(&self, id: &KeyId) {
        self.keys.write().remove(id);
    }

    /// Install the signing identity; the key must already be present.
    pub fn set_identity(&self, id: impl Into<KeyId>) {
        *self.identity.write() = Some(id.into());
    }

    pub fn set_ca(&self, cert: impl Into<Bytes>) {
        *self.ca.write() = Some(cert.into());
    }
}

impl KeyStore for MemoryKeyStore {
    fn key(&self, id: &KeyId) -> Result<Key> {
        self.keys
            .read()
            .get(id)
            .cloned()
            .ok_or(Error::Missing("key"))
    }

    fn identity(&self) -> Result<(KeyId, Key)> {
        let id = self
            .identity
            .read()
            .clone()
            .ok_or(Error::Missing("identity"))?;
        let key = self.key(&id)?;
        Ok((id, key))
    }

    fn ephemeral_key(&self, request: EphemeralRequest) -> Result<Key> {
        match request {
            EphemeralRequest::Symmetric => {
                let mut bytes = vec![0u8; 32];
                OsRng.fill_bytes(&mut bytes);
                Ok(Key::Symmetric(bytes))
            }
            EphemeralRequest::Ec(curve) => Ok(generate_ec_key(curve)),
        }
    }

    fn ca(&self) -> Result<Bytes> {
        self.ca.read().clone().ok_or(Error::Missing("ca"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_and_missing() {
        let store = MemoryKeyStore::new();
        let id = KeyId::from("alice");
        assert_eq!(store.key(&id), Err(Error::Missing("key")));
        store.put("alice", Key::Symmetric(vec![0x42; 32]));
        assert_eq!(store.key(&id), Ok(Key::Symmetric(vec![0x42; 32])));
        store.remove(&id);
        assert_eq!(store.key(&id), Err(Error::Missing("key")));
    }

    #[test]
    fn identity_requires_key_present() {
        let store = MemoryKeyStore::new();
        store.set_identity("signer");
        assert!(store.identity().is_err());
        store.put("signer", generate_ec_key(EcCurve::P384));
        let (id, key) = store.identity().unwrap();
        assert_eq!(id, KeyId::from("signer"));
        assert!(matches!(key, Key::Ec(_)));
    }

    #[test]
    fn ephemeral_keys_are_fresh() {
        let store = MemoryKeyStore::new();
        let a = store.ephemeral_key(EphemeralRequest::Symmetric).unwrap();
        let b = store.ephemeral_key(EphemeralRequest::Symmetric).unwrap();
        assert_ne!(a, b);

        let Key::Ec(ec) = store.ephemeral_key(EphemeralRequest::Ec(EcCurve::P384)).unwrap() else {
            panic!("expected an EC key");
        };
        assert_eq!(ec.x.len(), EcCurve::P384.coordinate_size());
        assert_eq!(ec.y.len(), EcCurve::P384.coordinate_size());
        assert!(ec.d.is_some());
    }
}
