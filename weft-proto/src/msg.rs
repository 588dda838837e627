//! Typed wire messages.
//!
//! Every frame is a five element CBOR array:
//! `[version, type, unprotected, protected, encrypted]`. The
//! unprotected map is hop-by-hop state a forwarder may rewrite; the
//! protected map is authenticated end to end (it is the external AAD of
//! the COSE framing); the encrypted element is either a plain map or a
//! COSE object whose plaintext is that map.
//!
//! Map keys are small integers and must never be renumbered; decoders
//! skip keys they do not recognize.

use bytes::Bytes;

use weft_core::bitvec::BitVector;
use weft_core::error::{Error, Result};
use weft_core::uuid::Uuid;

use crate::cbor::{Decoder, Encoder};
use crate::keystore::KeyId;

/// Protocol version.
pub const MSG_VERSION: u64 = 1;

/// Message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Pub = 1,
    Ack = 2,
    Sub = 3,
    Sak = 4,
}

impl MsgType {
    fn from_wire(value: u64) -> Result<Self> {
        match value {
            1 => Ok(Self::Pub),
            2 => Ok(Self::Ack),
            3 => Ok(Self::Sub),
            4 => Ok(Self::Sak),
            _ => Err(Error::Invalid),
        }
    }
}

/// Stable numeric map keys.
pub mod key {
    pub const PORT: i64 = 1;
    pub const TTL: i64 = 2;
    pub const PUB_ID: i64 = 3;
    pub const SEQ_NUM: i64 = 4;
    pub const ACK_REQUESTED: i64 = 5;
    pub const BLOOM: i64 = 6;
    pub const SUB_FLAGS: i64 = 7;
    pub const MESH_ID: i64 = 8;
    pub const NEEDS: i64 = 9;
    pub const INTERESTS: i64 = 10;
    pub const TOPICS: i64 = 11;
    pub const ACK_SEQ_NUM: i64 = 12;
    pub const SENDER_ID: i64 = 13;
    pub const RECIPIENTS: i64 = 14;
    pub const DATA: i64 = 15;
}

/// The advertised interests are a delta against the previous revision.
pub const SUB_FLAG_DELTA_IND: u8 = 0x01;
/// The sender has muted this link.
pub const SUB_FLAG_MUTE_IND: u8 = 0x02;

/// Interest state carried by a SUB, or piggy-backed on a SAK.
#[derive(Debug, Clone, PartialEq)]
pub struct SubBody {
    pub flags: u8,
    pub mesh_id: Uuid,
    /// Fuzzy hash of the interests, shipped raw.
    pub needs: BitVector,
    /// Full or delta interest filter.
    pub interests: BitVector,
}

/// A subscription message. `body` is `None` for an unlink request.
#[derive(Debug, Clone, PartialEq)]
pub struct SubMessage {
    pub port: u16,
    pub revision: u32,
    pub body: Option<SubBody>,
}

/// A subscription acknowledgement, optionally carrying the full
/// subscription state that is still owed to the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct SakMessage {
    pub port: u16,
    pub ack_revision: u32,
    pub sub: Option<(u32, SubBody)>,
}

/// Authenticated publication headers, the external AAD of the payload
/// framing.
#[derive(Debug, Clone, PartialEq)]
pub struct PubHeader {
    pub ttl: i16,
    pub pub_id: Uuid,
    pub sequence: u32,
    pub ack_requested: bool,
    pub bloom: BitVector,
    pub sender_id: Option<KeyId>,
    pub recipients: Vec<KeyId>,
}

/// A publication frame.
#[derive(Debug, Clone, PartialEq)]
pub struct PubMessage {
    pub port: u16,
    /// Hop-by-hop remaining TTL; forwarders of retained publications
    /// rewrite this as the publication ages.
    pub ttl: i16,
    pub header: PubHeader,
    /// Exact bytes of the protected map, preserved for AAD checks and
    /// re-forwarding.
    pub protected_raw: Bytes,
    /// Exact bytes of the encrypted element: a plain map or a COSE
    /// object.
    pub encrypted_raw: Bytes,
}

/// Authenticated acknowledgement headers.
#[derive(Debug, Clone, PartialEq)]
pub struct AckHeader {
    pub pub_id: Uuid,
    pub sequence: u32,
}

/// An end-to-end acknowledgement frame.
#[derive(Debug, Clone, PartialEq)]
pub struct AckMessage {
    pub port: u16,
    pub header: AckHeader,
    pub protected_raw: Bytes,
    pub encrypted_raw: Bytes,
}

/// The cleartext content of a publication's encrypted element.
#[derive(Debug, Clone, PartialEq)]
pub struct PubPayload {
    pub topics: Vec<String>,
    pub data: Bytes,
}

fn encode_bitvec(enc: &mut Encoder, bv: &BitVector) {
    let (flags, payload) = bv.to_wire();
    enc.array(3);
    enc.uint(u64::from(flags));
    enc.uint(bv.len() as u64);
    enc.bytes(&payload);
}

fn decode_bitvec(dec: &mut Decoder<'_>) -> Result<BitVector> {
    if dec.array()? != 3 {
        return Err(Error::Invalid);
    }
    let flags = u8::try_from(dec.uint()?).map_err(|_| Error::Invalid)?;
    let len = usize::try_from(dec.uint()?).map_err(|_| Error::Invalid)?;
    let payload = dec.bytes()?;
    BitVector::from_wire(len, flags, payload)
}

fn encode_fuzzy(enc: &mut Encoder, bv: &BitVector) {
    enc.bytes(&bv.to_bytes());
}

fn decode_fuzzy(dec: &mut Decoder<'_>) -> Result<BitVector> {
    let raw = dec.bytes()?;
    let mut bv = BitVector::new_fuzzy();
    bv.set_bits(raw).map_err(|_| Error::Invalid)?;
    Ok(bv)
}

fn decode_uuid(dec: &mut Decoder<'_>) -> Result<Uuid> {
    let raw = dec.bytes()?;
    let bytes: [u8; 16] = raw.try_into().map_err(|_| Error::Invalid)?;
    Ok(Uuid::from_bytes(bytes))
}

fn envelope(enc: &mut Encoder, msg_type: MsgType) {
    enc.array(5);
    enc.uint(MSG_VERSION);
    enc.uint(msg_type as u64);
}

/// Decode the envelope and return the message type with the decoder
/// positioned at the unprotected map.
pub fn decode_envelope<'a>(frame: &'a [u8]) -> Result<(MsgType, Decoder<'a>)> {
    let mut dec = Decoder::new(frame);
    if dec.array()? != 5 {
        return Err(Error::Invalid);
    }
    if dec.uint()? != MSG_VERSION {
        return Err(Error::Invalid);
    }
    let msg_type = MsgType::from_wire(dec.uint()?)?;
    Ok((msg_type, dec))
}

fn encode_sub_body(enc: &mut Encoder, revision: u32, body: &SubBody) {
    enc.int(key::SEQ_NUM);
    enc.uint(u64::from(revision));
    enc.int(key::SUB_FLAGS);
    enc.uint(u64::from(body.flags));
    enc.int(key::MESH_ID);
    enc.bytes(body.mesh_id.as_bytes());
    enc.int(key::NEEDS);
    encode_fuzzy(enc, &body.needs);
    enc.int(key::INTERESTS);
    encode_bitvec(enc, &body.interests);
}

impl SubMessage {
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut enc = Encoder::new();
        envelope(&mut enc, MsgType::Sub);
        match &self.body {
            Some(body) => {
                enc.map(6);
                enc.int(key::PORT);
                enc.uint(u64::from(self.port));
                encode_sub_body(&mut enc, self.revision, body);
            }
            None => {
                enc.map(2);
                enc.int(key::PORT);
                enc.uint(u64::from(self.port));
                enc.int(key::SEQ_NUM);
                enc.uint(u64::from(self.revision));
            }
        }
        enc.map(0);
        enc.map(0);
        enc.into_bytes()
    }

    /// Decode the unprotected map of a SUB. The caller has already
    /// consumed the envelope.
    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let fields = RawSubFields::decode(dec)?;
        Ok(Self {
            port: fields.port.ok_or(Error::Invalid)?,
            revision: fields.revision.ok_or(Error::Invalid)?,
            body: fields.body()?,
        })
    }
}

/// Field soup shared by SUB and SAK decoding.
#[derive(Default)]
struct RawSubFields {
    port: Option<u16>,
    revision: Option<u32>,
    flags: Option<u8>,
    mesh_id: Option<Uuid>,
    needs: Option<BitVector>,
    interests: Option<BitVector>,
    ack_revision: Option<u32>,
}

impl RawSubFields {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let mut fields = Self::default();
        let entries = dec.map()?;
        for _ in 0..entries {
            match dec.int()? {
                key::PORT => {
                    fields.port = Some(u16::try_from(dec.uint()?).map_err(|_| Error::Invalid)?);
                }
                key::SEQ_NUM => {
                    fields.revision =
                        Some(u32::try_from(dec.uint()?).map_err(|_| Error::Invalid)?);
                }
                key::SUB_FLAGS => {
                    fields.flags = Some(u8::try_from(dec.uint()?).map_err(|_| Error::Invalid)?);
                }
                key::MESH_ID => {
                    if fields.mesh_id.is_some() {
                        return Err(Error::Invalid);
                    }
                    fields.mesh_id = Some(decode_uuid(dec)?);
                }
                key::NEEDS => {
                    if fields.needs.is_some() {
                        return Err(Error::Invalid);
                    }
                    fields.needs = Some(decode_fuzzy(dec)?);
                }
                key::INTERESTS => {
                    if fields.interests.is_some() {
                        return Err(Error::Invalid);
                    }
                    fields.interests = Some(decode_bitvec(dec)?);
                }
                key::ACK_SEQ_NUM => {
                    fields.ack_revision =
                        Some(u32::try_from(dec.uint()?).map_err(|_| Error::Invalid)?);
                }
                _ => dec.skip()?,
            }
        }
        Ok(fields)
    }

    fn body(self) -> Result<Option<SubBody>> {
        match (self.flags, self.mesh_id, self.needs, self.interests) {
            (Some(flags), Some(mesh_id), Some(needs), Some(interests)) => Ok(Some(SubBody {
                flags,
                mesh_id,
                needs,
                interests,
            })),
            (None, None, None, None) => Ok(None),
            // A partial subscription is malformed
            _ => Err(Error::Invalid),
        }
    }
}

impl SakMessage {
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut enc = Encoder::new();
        envelope(&mut enc, MsgType::Sak);
        match &self.sub {
            Some((revision, body)) => {
                enc.map(7);
                enc.int(key::PORT);
                enc.uint(u64::from(self.port));
                encode_sub_body(&mut enc, *revision, body);
            }
            None => {
                enc.map(2);
                enc.int(key::PORT);
                enc.uint(u64::from(self.port));
            }
        }
        enc.int(key::ACK_SEQ_NUM);
        enc.uint(u64::from(self.ack_revision));
        enc.map(0);
        enc.map(0);
        enc.into_bytes()
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let fields = RawSubFields::decode(dec)?;
        let port = fields.port.ok_or(Error::Invalid)?;
        let ack_revision = fields.ack_revision.ok_or(Error::Invalid)?;
        let revision = fields.revision;
        let sub = match fields.body()? {
            Some(body) => Some((revision.ok_or(Error::Invalid)?, body)),
            None => None,
        };
        Ok(Self {
            port,
            ack_revision,
            sub,
        })
    }
}

impl PubHeader {
    /// Serialize the protected map. The exact bytes feed the payload
    /// framing as AAD, so this must stay deterministic.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut enc = Encoder::new();
        let mut entries = 5;
        if self.sender_id.is_some() {
            entries += 1;
        }
        if !self.recipients.is_empty() {
            entries += 1;
        }
        enc.map(entries);
        enc.int(key::TTL);
        enc.int(i64::from(self.ttl));
        enc.int(key::PUB_ID);
        enc.bytes(self.pub_id.as_bytes());
        enc.int(key::SEQ_NUM);
        enc.uint(u64::from(self.sequence));
        enc.int(key::ACK_REQUESTED);
        enc.bool(self.ack_requested);
        enc.int(key::BLOOM);
        encode_bitvec(&mut enc, &self.bloom);
        if let Some(sender) = &self.sender_id {
            enc.int(key::SENDER_ID);
            enc.bytes(sender.as_bytes());
        }
        if !self.recipients.is_empty() {
            enc.int(key::RECIPIENTS);
            enc.array(self.recipients.len());
            for kid in &self.recipients {
                enc.bytes(kid.as_bytes());
            }
        }
        enc.into_bytes()
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(raw);
        let mut ttl = None;
        let mut pub_id = None;
        let mut sequence = None;
        let mut ack_requested = false;
        let mut bloom = None;
        let mut sender_id = None;
        let mut recipients = Vec::new();
        let entries = dec.map()?;
        for _ in 0..entries {
            match dec.int()? {
                key::TTL => ttl = Some(i16::try_from(dec.int()?).map_err(|_| Error::Invalid)?),
                key::PUB_ID => pub_id = Some(decode_uuid(&mut dec)?),
                key::SEQ_NUM => {
                    sequence = Some(u32::try_from(dec.uint()?).map_err(|_| Error::Invalid)?);
                }
                key::ACK_REQUESTED => ack_requested = dec.bool()?,
                key::BLOOM => {
                    if bloom.is_some() {
                        return Err(Error::Invalid);
                    }
                    bloom = Some(decode_bitvec(&mut dec)?);
                }
                key::SENDER_ID => sender_id = Some(KeyId::from(dec.bytes()?)),
                key::RECIPIENTS => {
                    for _ in 0..dec.array()? {
                        recipients.push(KeyId::from(dec.bytes()?));
                    }
                }
                _ => dec.skip()?,
            }
        }
        Ok(Self {
            ttl: ttl.ok_or(Error::Invalid)?,
            pub_id: pub_id.ok_or(Error::Invalid)?,
            sequence: sequence.ok_or(Error::Invalid)?,
            ack_requested,
            bloom: bloom.ok_or(Error::Invalid)?,
            sender_id,
            recipients,
        })
    }
}

impl PubPayload {
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut enc = Encoder::new();
        enc.map(2);
        enc.int(key::TOPICS);
        enc.array(self.topics.len());
        for topic in &self.topics {
            enc.string(topic);
        }
        enc.int(key::DATA);
        enc.bytes(&self.data);
        enc.into_bytes()
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(raw);
        let mut topics = Vec::new();
        let mut data = Bytes::new();
        let entries = dec.map()?;
        for _ in 0..entries {
            match dec.int()? {
                key::TOPICS => {
                    for _ in 0..dec.array()? {
                        topics.push(dec.string()?.to_string());
                    }
                }
                key::DATA => data = Bytes::copy_from_slice(dec.bytes()?),
                _ => dec.skip()?,
            }
        }
        if topics.is_empty() {
            return Err(Error::Invalid);
        }
        Ok(Self { topics, data })
    }
}

/// The cleartext content of an acknowledgement's encrypted element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckPayload {
    pub data: Bytes,
}

impl AckPayload {
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut enc = Encoder::new();
        enc.map(1);
        enc.int(key::DATA);
        enc.bytes(&self.data);
        enc.into_bytes()
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(raw);
        let mut data = Bytes::new();
        let entries = dec.map()?;
        for _ in 0..entries {
            match dec.int()? {
                key::DATA => data = Bytes::copy_from_slice(dec.bytes()?),
                _ => dec.skip()?,
            }
        }
        Ok(Self { data })
    }
}

/// Assemble a PUB frame from pre-serialized protected and encrypted
/// elements. Forwarders reuse the received elements untouched and only
/// rewrite the unprotected map.
#[must_use]
pub fn encode_pub(port: u16, ttl: i16, protected_raw: &[u8], encrypted_raw: &[u8]) -> Bytes {
    let mut enc = Encoder::with_capacity(protected_raw.len() + encrypted_raw.len() + 32);
    envelope(&mut enc, MsgType::Pub);
    enc.map(2);
    enc.int(key::PORT);
    enc.uint(u64::from(port));
    enc.int(key::TTL);
    enc.int(i64::from(ttl));
    enc.raw(protected_raw);
    enc.raw(encrypted_raw);
    enc.into_bytes()
}

/// Decode a PUB after the envelope.
pub fn decode_pub(dec: &mut Decoder<'_>) -> Result<PubMessage> {
    let mut port = None;
    let mut ttl = None;
    let entries = dec.map()?;
    for _ in 0..entries {
        match dec.int()? {
            key::PORT => port = Some(u16::try_from(dec.uint()?).map_err(|_| Error::Invalid)?),
            key::TTL => ttl = Some(i16::try_from(dec.int()?).map_err(|_| Error::Invalid)?),
            _ => dec.skip()?,
        }
    }
    let protected_raw = Bytes::copy_from_slice(dec.raw_item()?);
    let encrypted_raw = Bytes::copy_from_slice(dec.raw_item()?);
    let header = PubHeader::decode(&protected_raw)?;
    Ok(PubMessage {
        port: port.ok_or(Error::Invalid)?,
        ttl: ttl.ok_or(Error::Invalid)?,
        header,
        protected_raw,
        encrypted_raw,
    })
}

impl AckHeader {
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut enc = Encoder::new();
        enc.map(2);
        enc.int(key::PUB_ID);
        enc.bytes(self.pub_id.as_bytes());
        enc.int(key::ACK_SEQ_NUM);
        enc.uint(u64::from(self.sequence));
        enc.into_bytes()
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(raw);
        let mut pub_id = None;
        let mut sequence = None;
        let entries = dec.map()?;
        for _ in 0..entries {
            match dec.int()? {
                key::PUB_ID => pub_id = Some(decode_uuid(&mut dec)?),
                key::ACK_SEQ_NUM => {
                    sequence = Some(u32::try_from(dec.uint()?).map_err(|_| Error::Invalid)?);
                }
                _ => dec.skip()?,
            }
        }
        Ok(Self {
            pub_id: pub_id.ok_or(Error::Invalid)?,
            sequence: sequence.ok_or(Error::Invalid)?,
        })
    }
}

/// Assemble an ACK frame.
#[must_use]
pub fn encode_ack(port: u16, protected_raw: &[u8], encrypted_raw: &[u8]) -> Bytes {
    let mut enc = Encoder::with_capacity(protected_raw.len() + encrypted_raw.len() + 16);
    envelope(&mut enc, MsgType::Ack);
    enc.map(1);
    enc.int(key::PORT);
    enc.uint(u64::from(port));
    enc.raw(protected_raw);
    enc.raw(encrypted_raw);
    enc.into_bytes()
}

/// Decode an ACK after the envelope.
pub fn decode_ack(dec: &mut Decoder<'_>) -> Result<AckMessage> {
    let mut port = None;
    let entries = dec.map()?;
    for _ in 0..entries {
        match dec.int()? {
            key::PORT => port = Some(u16::try_from(dec.uint()?).map_err(|_| Error::Invalid)?),
            _ => dec.skip()?,
        }
    }
    let protected_raw = Bytes::copy_from_slice(dec.raw_item()?);
    let encrypted_raw = Bytes::copy_from_slice(dec.raw_item()?);
    let header = AckHeader::decode(&protected_raw)?;
    Ok(AckMessage {
        port: port.ok_or(Error::Invalid)?,
        header,
        protected_raw,
        encrypted_raw,
    })
}

/// Build the 13-byte AEAD nonce for a publication or acknowledgement.
/// The top bit of the first byte distinguishes the two directions so a
/// PUB and its ACK never share a nonce.
#[must_use]
pub fn make_nonce(pub_id: &Uuid, sequence: u32, msg_type: MsgType) -> [u8; 13] {
    let mut nonce = [0u8; 13];
    nonce[..4].copy_from_slice(&sequence.to_le_bytes());
    nonce[4..].copy_from_slice(&pub_id.as_bytes()[..9]);
    match msg_type {
        MsgType::Pub => nonce[0] &= 0x7F,
        _ => nonce[0] |= 0x80,
    }
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_body(seed: &str) -> SubBody {
        let mut interests = BitVector::new(1024);
        interests.bloom_insert(seed.as_bytes(), 4);
        let needs = interests.fuzzy_hash();
        SubBody {
            flags: SUB_FLAG_DELTA_IND,
            mesh_id: Uuid::generate(),
            needs,
            interests,
        }
    }

    #[test]
    fn sub_round_trip() {
        let msg = SubMessage {
            port: 9000,
            revision: 7,
            body: Some(sample_body("a/b")),
        };
        let frame = msg.encode();
        let (msg_type, mut dec) = decode_envelope(&frame).unwrap();
        assert_eq!(msg_type, MsgType::Sub);
        assert_eq!(SubMessage::decode(&mut dec).unwrap(), msg);
    }

    #[test]
    fn unlink_sub_round_trip() {
        let msg = SubMessage {
            port: 9000,
            revision: 3,
            body: None,
        };
        let frame = msg.encode();
        let (_, mut dec) = decode_envelope(&frame).unwrap();
        let out = SubMessage::decode(&mut dec).unwrap();
        assert!(out.body.is_none());
        assert_eq!(out.revision, 3);
    }

    #[test]
    fn sak_round_trip_with_and_without_sub() {
        let bare = SakMessage {
            port: 9001,
            ack_revision: 12,
            sub: None,
        };
        let frame = bare.encode();
        let (msg_type, mut dec) = decode_envelope(&frame).unwrap();
        assert_eq!(msg_type, MsgType::Sak);
        assert_eq!(SakMessage::decode(&mut dec).unwrap(), bare);

        let full = SakMessage {
            port: 9001,
            ack_revision: 12,
            sub: Some((13, sample_body("x/y"))),
        };
        let frame = full.encode();
        let (_, mut dec) = decode_envelope(&frame).unwrap();
        assert_eq!(SakMessage::decode(&mut dec).unwrap(), full);
    }

    #[test]
    fn pub_round_trip() {
        let mut bloom = BitVector::new(1024);
        bloom.bloom_insert(b"t/u", 4);
        let header = PubHeader {
            ttl: 60,
            pub_id: Uuid::generate(),
            sequence: 2,
            ack_requested: true,
            bloom,
            sender_id: Some(KeyId::from("sender")),
            recipients: vec![KeyId::from("r1"), KeyId::from("r2")],
        };
        let payload = PubPayload {
            topics: vec!["t/u".to_string()],
            data: Bytes::from_static(b"hello"),
        };
        let frame = encode_pub(9002, 60, &header.encode(), &payload.encode());
        let (msg_type, mut dec) = decode_envelope(&frame).unwrap();
        assert_eq!(msg_type, MsgType::Pub);
        let out = decode_pub(&mut dec).unwrap();
        assert_eq!(out.port, 9002);
        assert_eq!(out.ttl, 60);
        assert_eq!(out.header, header);
        assert_eq!(PubPayload::decode(&out.encrypted_raw).unwrap(), payload);
        // Preserved bytes re-assemble into an identical frame
        let fwd = encode_pub(9002, 60, &out.protected_raw, &out.encrypted_raw);
        assert_eq!(frame, fwd);
    }

    #[test]
    fn ack_round_trip() {
        let header = AckHeader {
            pub_id: Uuid::generate(),
            sequence: 9,
        };
        let payload = PubPayload {
            topics: vec!["ack".to_string()],
            data: Bytes::from_static(b"done"),
        };
        let frame = encode_ack(9003, &header.encode(), &payload.encode());
        let (msg_type, mut dec) = decode_envelope(&frame).unwrap();
        assert_eq!(msg_type, MsgType::Ack);
        let out = decode_ack(&mut dec).unwrap();
        assert_eq!(out.header, header);
    }

    #[test]
    fn unknown_keys_are_skipped() {
        let mut enc = Encoder::new();
        enc.array(5);
        enc.uint(MSG_VERSION);
        enc.uint(MsgType::Sub as u64);
        enc.map(3);
        enc.int(key::PORT);
        enc.uint(9000);
        enc.int(key::SEQ_NUM);
        enc.uint(1);
        enc.int(99);
        enc.array(2);
        enc.string("future");
        enc.uint(1);
        enc.map(0);
        enc.map(0);
        let frame = enc.into_bytes();
        let (_, mut dec) = decode_envelope(&frame).unwrap();
        let out = SubMessage::decode(&mut dec).unwrap();
        assert_eq!(out.port, 9000);
        assert!(out.body.is_none());
    }

    #[test]
    fn bad_version_is_invalid() {
        let mut enc = Encoder::new();
        enc.array(5);
        enc.uint(2);
        enc.uint(3);
        enc.map(0);
        enc.map(0);
        enc.map(0);
        let frame = enc.into_bytes();
        assert_eq!(decode_envelope(&frame).unwrap_err(), Error::Invalid);
    }

    #[test]
    fn nonce_separates_pub_and_ack() {
        let id = Uuid::generate();
        let p = make_nonce(&id, 5, MsgType::Pub);
        let a = make_nonce(&id, 5, MsgType::Ack);
        assert_ne!(p, a);
        assert_eq!(p[0] & 0x80, 0);
        assert_eq!(a[0] & 0x80, 0x80);
        assert_eq!(&p[1..], &a[1..]);
    }
}
