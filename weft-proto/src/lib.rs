//! Weft Proto
//!
//! The wire layer of the weft publish/subscribe fabric:
//! - Canonical CBOR subset encoder/decoder (`cbor`)
//! - Key store trait and in-memory implementation (`keystore`)
//! - COSE secure framing: Encrypt0/Encrypt/Sign1 (`cose`)
//! - Typed SUB/SAK/PUB/ACK messages (`msg`)

#![deny(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]

pub mod cbor;
pub mod cose;
pub mod keystore;
pub mod msg;

pub mod prelude {
    pub use crate::cbor::{Decoder, Encoder};
    pub use crate::cose::Entity;
    pub use crate::keystore::{EcCurve, EphemeralRequest, Key, KeyId, KeyStore, MemoryKeyStore};
    pub use crate::msg::{MsgType, PubHeader, PubPayload, SakMessage, SubBody, SubMessage};
}
