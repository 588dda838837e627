//! COSE message framing: `Encrypt0`, `Encrypt` and `Sign1` objects.
//!
//! Content encryption is AES-256-GCM with a 128-bit tag and a 13-byte
//! nonce. Recipient key transforms: direct use of a pre-shared content
//! key, AES key wrap with a pre-shared KEK, or ECDH-ES (P-384/P-521)
//! through HKDF-SHA256 into AES key wrap. Signatures are ECDSA with the
//! digest matched to the curve (ES384/ES512).
//!
//! A counter signature rides in the unprotected header map and covers
//! the ciphertext, so the signer attests the exact transmitted object -
//! recipient list included - without holding the content key. On
//! receive, a counter signature that cannot be verified does not fail
//! the decrypt; the returned signer identity is cleared instead so
//! intermediaries can forward payloads they cannot attribute.

use aes_gcm::aead::generic_array::typenum::U13;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use aes_kw::Kek;
use elliptic_curve::sec1::FromEncodedPoint;
use hkdf::Hkdf;
use sha2::Sha256;
use tracing::warn;

use bytes::Bytes;
use weft_core::error::{Error, Result};

use crate::cbor::{Decoder, Encoder};
use crate::keystore::{EcCurve, EcKey, EphemeralRequest, Key, KeyId, KeyStore};

/// COSE_Encrypt0 tag.
pub const TAG_ENCRYPT0: u64 = 16;
/// COSE_Sign1 tag.
pub const TAG_SIGN1: u64 = 18;
/// COSE_Encrypt tag.
pub const TAG_ENCRYPT: u64 = 96;

/// AES-GCM nonce length used by the fabric.
pub const NONCE_LEN: usize = 13;

const GCM_TAG_LEN: usize = 16;
const AES_256_KEY_LEN: usize = 32;
const KEY_WRAP_LEN: usize = AES_256_KEY_LEN + 8;

/// Reserved algorithm value; as a recipient algorithm it selects the
/// single-recipient `Encrypt0` form.
pub const ALG_RESERVED: i64 = 0;
/// AES-GCM with a 256-bit key and 128-bit tag.
pub const ALG_A256GCM: i64 = 3;
/// AES key wrap with a 256-bit KEK.
pub const ALG_A256KW: i64 = -5;
/// Direct use of the content encryption key.
pub const ALG_DIRECT: i64 = -6;
/// ECDH-ES with HKDF and AES-256 key wrap.
pub const ALG_ECDH_ES_A256KW: i64 = -31;
/// ECDSA with SHA-384.
pub const ALG_ES384: i64 = -35;
/// ECDSA with SHA-512.
pub const ALG_ES512: i64 = -36;

const HDR_ALG: i64 = 1;
const HDR_KID: i64 = 4;
const HDR_IV: i64 = 5;
const HDR_COUNTER_SIGNATURE: i64 = 7;
const HDR_EPHEMERAL_KEY: i64 = -1;

const KEY_KTY: i64 = 1;
const KEY_KTY_EC: i64 = 2;
const EC_KEY_CRV: i64 = -1;
const EC_KEY_X: i64 = -2;
const EC_KEY_Y: i64 = -3;

const ENCRYPT0: &str = "Encrypt0";
const ENCRYPT: &str = "Encrypt";
const SIGNATURE1: &str = "Signature1";
const COUNTER_SIGNATURE: &str = "CounterSignature";

type A256Gcm = AesGcm<Aes256, U13>;

/// A recipient or signer referenced in a COSE object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub alg: i64,
    pub kid: KeyId,
}

impl Entity {
    #[must_use]
    pub fn new(alg: i64, kid: impl Into<KeyId>) -> Self {
        Self {
            alg,
            kid: kid.into(),
        }
    }
}

/// Result of a successful decrypt.
#[derive(Debug, Clone)]
pub struct Decrypted {
    pub plaintext: Vec<u8>,
    /// The recipient whose key unlocked the content.
    pub recipient: Entity,
    /// Verified counter-signer, `None` when absent or unverifiable.
    pub signer: Option<Entity>,
}

/// Result of parsing a `Sign1` object.
#[derive(Debug, Clone)]
pub struct Verified {
    pub payload: Vec<u8>,
    /// Verified signer, `None` when the signature did not verify.
    pub signer: Option<Entity>,
}

/// Protected header map, wrapped in a byte string.
fn encode_protected(enc: &mut Encoder, alg: i64) -> Result<()> {
    enc.wrap_bytes(|inner| {
        inner.map(1);
        inner.int(HDR_ALG);
        inner.int(alg);
        Ok(())
    })
}

/// `Enc_structure = [context, protected, external_aad]`
fn enc_structure(tag: u64, alg: i64, aad: &[u8]) -> Result<Vec<u8>> {
    let mut enc = Encoder::new();
    enc.array(3);
    enc.string(match tag {
        TAG_ENCRYPT0 => ENCRYPT0,
        TAG_ENCRYPT => ENCRYPT,
        _ => return Err(Error::Invalid),
    });
    encode_protected(&mut enc, alg)?;
    enc.bytes(aad);
    Ok(enc.into_bytes().to_vec())
}

/// `Sig_structure`: 5 elements for a counter signature over a
/// ciphertext, 4 for `Sign1`.
fn sig_structure(tag: u64, alg: i64, sig_alg: i64, aad: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
    let mut enc = Encoder::new();
    match tag {
        TAG_ENCRYPT0 | TAG_ENCRYPT => {
            enc.array(5);
            enc.string(COUNTER_SIGNATURE);
            encode_protected(&mut enc, alg)?;
            encode_protected(&mut enc, sig_alg)?;
        }
        TAG_SIGN1 => {
            enc.array(4);
            enc.string(SIGNATURE1);
            encode_protected(&mut enc, sig_alg)?;
        }
        _ => return Err(Error::Invalid),
    }
    enc.bytes(aad);
    enc.bytes(payload);
    Ok(enc.into_bytes().to_vec())
}

/// `COSE_KDF_Context` for deriving the key encryption key.
fn kdf_context(recipient_alg: i64) -> Result<Vec<u8>> {
    let mut enc = Encoder::new();
    enc.array(4);
    enc.int(ALG_A256KW);
    for _ in 0..2 {
        // PartyInfo = [identity, nonce, other], all nil
        enc.array(3);
        enc.null();
        enc.null();
        enc.null();
    }
    enc.array(2);
    enc.uint((AES_256_KEY_LEN * 8) as u64);
    encode_protected(&mut enc, recipient_alg)?;
    Ok(enc.into_bytes().to_vec())
}

fn gcm_encrypt(cek: &[u8], nonce: &[u8; NONCE_LEN], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = A256Gcm::new_from_slice(cek).map_err(|_| Error::Security)?;
    cipher
        .encrypt(
            GenericArray::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| Error::Security)
}

fn gcm_decrypt(cek: &[u8], nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if nonce.len() != NONCE_LEN || ciphertext.len() < GCM_TAG_LEN {
        return Err(Error::Security);
    }
    let cipher = A256Gcm::new_from_slice(cek).map_err(|_| Error::Security)?;
    cipher
        .decrypt(
            GenericArray::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| Error::Security)
}

fn key_wrap(cek: &[u8], kek_bytes: &[u8]) -> Result<[u8; KEY_WRAP_LEN]> {
    let kek = Kek::<Aes256>::try_from(kek_bytes).map_err(|_| Error::Security)?;
    let mut wrapped = [0u8; KEY_WRAP_LEN];
    kek.wrap(cek, &mut wrapped).map_err(|_| Error::Security)?;
    Ok(wrapped)
}

fn key_unwrap(wrapped: &[u8], kek_bytes: &[u8]) -> Result<[u8; AES_256_KEY_LEN]> {
    if wrapped.len() != KEY_WRAP_LEN {
        return Err(Error::Invalid);
    }
    let kek = Kek::<Aes256>::try_from(kek_bytes).map_err(|_| Error::Security)?;
    let mut cek = [0u8; AES_256_KEY_LEN];
    kek.unwrap(wrapped, &mut cek).map_err(|_| Error::Security)?;
    Ok(cek)
}

/// Raw ECDH shared secret between a peer public key and our scalar.
fn ecdh(curve: EcCurve, peer_x: &[u8], peer_y: &[u8], own_d: &[u8]) -> Result<Vec<u8>> {
    let size = curve.coordinate_size();
    if peer_x.len() != size || peer_y.len() != size {
        return Err(Error::Invalid);
    }
    match curve {
        EcCurve::P384 => {
            let point = p384::EncodedPoint::from_affine_coordinates(
                GenericArray::from_slice(peer_x),
                GenericArray::from_slice(peer_y),
                false,
            );
            let public: p384::PublicKey =
                Option::from(p384::PublicKey::from_encoded_point(&point)).ok_or(Error::Security)?;
            let secret = p384::SecretKey::from_slice(own_d).map_err(|_| Error::Security)?;
            let shared = p384::ecdh::diffie_hellman(secret.to_nonzero_scalar(), public.as_affine());
            Ok(shared.raw_secret_bytes().to_vec())
        }
        EcCurve::P521 => {
            let point = p521::EncodedPoint::from_affine_coordinates(
                GenericArray::from_slice(peer_x),
                GenericArray::from_slice(peer_y),
                false,
            );
            let public: p521::PublicKey =
                Option::from(p521::PublicKey::from_encoded_point(&point)).ok_or(Error::Security)?;
            let secret = p521::SecretKey::from_slice(own_d).map_err(|_| Error::Security)?;
            let shared = p521::ecdh::diffie_hellman(secret.to_nonzero_scalar(), public.as_affine());
            Ok(shared.raw_secret_bytes().to_vec())
        }
    }
}

/// Derive a key encryption key from an ECDH shared secret.
fn derive_kek(secret: &[u8], recipient_alg: i64) -> Result<[u8; AES_256_KEY_LEN]> {
    let context = kdf_context(recipient_alg)?;
    let hkdf = Hkdf::<Sha256>::new(None, secret);
    let mut kek = [0u8; AES_256_KEY_LEN];
    hkdf.expand(&context, &mut kek).map_err(|_| Error::Security)?;
    Ok(kek)
}

/// The signature algorithm a private key on `curve` produces.
const fn sig_alg_for(curve: EcCurve) -> i64 {
    match curve {
        EcCurve::P384 => ALG_ES384,
        EcCurve::P521 => ALG_ES512,
    }
}

fn ecdsa_sign(key: &EcKey, data: &[u8]) -> Result<Vec<u8>> {
    let d = key.d.as_deref().ok_or(Error::Missing("signing key"))?;
    match key.curve {
        EcCurve::P384 => {
            use p384::ecdsa::signature::Signer;
            let signing = p384::ecdsa::SigningKey::from_slice(d).map_err(|_| Error::Security)?;
            let signature: p384::ecdsa::Signature = signing.sign(data);
            Ok(signature.to_bytes().to_vec())
        }
        EcCurve::P521 => {
            use p521::ecdsa::signature::Signer;
            let signing = p521::ecdsa::SigningKey::from_slice(d).map_err(|_| Error::Security)?;
            let signature: p521::ecdsa::Signature = signing.sign(data);
            Ok(signature.to_bytes().to_vec())
        }
    }
}

fn ecdsa_verify(key: &EcKey, data: &[u8], signature: &[u8]) -> Result<()> {
    let size = key.curve.coordinate_size();
    if key.x.len() != size || key.y.len() != size {
        return Err(Error::Invalid);
    }
    match key.curve {
        EcCurve::P384 => {
            use p384::ecdsa::signature::Verifier;
            let point = p384::EncodedPoint::from_affine_coordinates(
                GenericArray::from_slice(&key.x),
                GenericArray::from_slice(&key.y),
                false,
            );
            let verifying =
                p384::ecdsa::VerifyingKey::from_encoded_point(&point).map_err(|_| Error::Security)?;
            let signature =
                p384::ecdsa::Signature::from_slice(signature).map_err(|_| Error::Security)?;
            verifying.verify(data, &signature).map_err(|_| Error::Security)
        }
        EcCurve::P521 => {
            use p521::ecdsa::signature::Verifier;
            let point = p521::EncodedPoint::from_affine_coordinates(
                GenericArray::from_slice(&key.x),
                GenericArray::from_slice(&key.y),
                false,
            );
            let verifying =
                p521::ecdsa::VerifyingKey::from_encoded_point(&point).map_err(|_| Error::Security)?;
            let signature =
                p521::ecdsa::Signature::from_slice(signature).map_err(|_| Error::Security)?;
            verifying.verify(data, &signature).map_err(|_| Error::Security)
        }
    }
}

/// Fetch and sanity-check the key for `entity` used to produce or check
/// a signature.
fn signature_key(key_store: &dyn KeyStore, entity: &Entity) -> Result<EcKey> {
    let key = key_store.key(&entity.kid)?;
    let ec = key.ec()?.clone();
    if sig_alg_for(ec.curve) != entity.alg {
        return Err(Error::Invalid);
    }
    Ok(ec)
}

fn encode_ec_public(enc: &mut Encoder, key: &EcKey) {
    let size = key.curve.coordinate_size();
    enc.map(4);
    enc.int(KEY_KTY);
    enc.int(KEY_KTY_EC);
    enc.int(EC_KEY_CRV);
    enc.int(key.curve as i64);
    enc.int(EC_KEY_X);
    enc.bytes(&key.x[..size.min(key.x.len())]);
    enc.int(EC_KEY_Y);
    enc.bytes(&key.y[..size.min(key.y.len())]);
}

fn decode_ec_public(dec: &mut Decoder<'_>) -> Result<EcKey> {
    let entries = dec.map()?;
    if entries < 1 {
        return Err(Error::Invalid);
    }
    if dec.int()? != KEY_KTY || dec.int()? != KEY_KTY_EC {
        return Err(Error::Invalid);
    }
    let mut curve = None;
    let mut x = None;
    let mut y = None;
    for _ in 1..entries {
        match dec.int()? {
            EC_KEY_CRV => curve = Some(EcCurve::from_cose(dec.int()?)?),
            EC_KEY_X => x = Some(dec.bytes()?.to_vec()),
            EC_KEY_Y => y = Some(dec.bytes()?.to_vec()),
            _ => return Err(Error::Invalid),
        }
    }
    let curve = curve.ok_or(Error::Invalid)?;
    let x = x.ok_or(Error::Invalid)?;
    let y = y.ok_or(Error::Invalid)?;
    if x.len() != curve.coordinate_size() || y.len() != curve.coordinate_size() {
        return Err(Error::Invalid);
    }
    Ok(EcKey {
        curve,
        x,
        y,
        d: None,
    })
}

struct CounterSig {
    alg: i64,
    kid: KeyId,
    signature: Vec<u8>,
}

/// Decode `{1: alg}` from a protected header byte string. An empty byte
/// string is valid and leaves the algorithm reserved.
fn decode_protected(dec: &mut Decoder<'_>) -> Result<i64> {
    let wrapped = dec.bytes()?;
    if wrapped.is_empty() {
        return Ok(ALG_RESERVED);
    }
    let mut inner = Decoder::new(wrapped);
    if inner.map()? != 1 {
        return Err(Error::Invalid);
    }
    if inner.int()? != HDR_ALG {
        return Err(Error::Invalid);
    }
    inner.int()
}

#[derive(Default)]
struct Unprotected {
    alg: Option<i64>,
    kid: Option<KeyId>,
    nonce: Option<Vec<u8>>,
    counter_sig: Option<CounterSig>,
    ephemeral: Option<EcKey>,
}

fn decode_unprotected(dec: &mut Decoder<'_>) -> Result<Unprotected> {
    let mut out = Unprotected::default();
    let entries = dec.map()?;
    for _ in 0..entries {
        match dec.int()? {
            HDR_ALG => out.alg = Some(dec.int()?),
            HDR_KID => out.kid = Some(KeyId::from(dec.bytes()?)),
            HDR_IV => out.nonce = Some(dec.bytes()?.to_vec()),
            HDR_COUNTER_SIGNATURE => {
                if dec.array()? != 3 {
                    return Err(Error::Invalid);
                }
                let alg = decode_protected(dec)?;
                if alg == ALG_RESERVED {
                    return Err(Error::Invalid);
                }
                let inner = decode_unprotected(dec)?;
                let kid = inner.kid.ok_or(Error::Invalid)?;
                let signature = dec.bytes()?.to_vec();
                out.counter_sig = Some(CounterSig {
                    alg,
                    kid,
                    signature,
                });
            }
            HDR_EPHEMERAL_KEY => out.ephemeral = Some(decode_ec_public(dec)?),
            _ => dec.skip()?,
        }
    }
    Ok(out)
}

/// Encrypt `payload` for `recipients`, optionally counter-signed by
/// `signer`. Returns the complete tagged object.
pub fn encrypt(
    alg: i64,
    nonce: &[u8; NONCE_LEN],
    signer: Option<&Entity>,
    recipients: &[Entity],
    aad: &[u8],
    payload: &[u8],
    key_store: &dyn KeyStore,
) -> Result<Bytes> {
    if alg != ALG_A256GCM {
        return Err(Error::NotImplemented);
    }
    if recipients.is_empty() {
        return Err(Error::InvalidArgs);
    }
    // The content key is shared, so every recipient must use the same
    // transform
    if recipients.iter().any(|r| r.alg != recipients[0].alg) {
        return Err(Error::InvalidArgs);
    }
    let tag = if recipients.len() == 1 && recipients[0].alg == ALG_RESERVED {
        TAG_ENCRYPT0
    } else {
        TAG_ENCRYPT
    };

    // Determine the content encryption key
    let cek: Vec<u8> = match recipients[0].alg {
        ALG_RESERVED | ALG_DIRECT => {
            if recipients.len() > 1 {
                return Err(Error::InvalidArgs);
            }
            key_store.key(&recipients[0].kid)?.symmetric()?.to_vec()
        }
        ALG_A256KW | ALG_ECDH_ES_A256KW => key_store
            .ephemeral_key(EphemeralRequest::Symmetric)?
            .symmetric()?
            .to_vec(),
        _ => return Err(Error::NotImplemented),
    };
    if cek.len() != AES_256_KEY_LEN {
        return Err(Error::Security);
    }

    let aad_structure = enc_structure(tag, alg, aad)?;
    let ciphertext = gcm_encrypt(&cek, nonce, payload, &aad_structure)?;

    // Counter-sign the ciphertext so the signature binds the whole
    // object
    let counter_sig = match signer {
        Some(signer) => {
            let key = signature_key(key_store, signer)?;
            let tbs = sig_structure(tag, alg, signer.alg, &[], &ciphertext)?;
            Some(CounterSig {
                alg: signer.alg,
                kid: signer.kid.clone(),
                signature: ecdsa_sign(&key, &tbs)?,
            })
        }
        None => None,
    };

    let mut enc = Encoder::with_capacity(ciphertext.len() + 256);
    enc.tag(tag);
    enc.array(if tag == TAG_ENCRYPT { 4 } else { 3 });
    encode_protected(&mut enc, alg)?;
    // Encrypt0 has no recipient entries, so the key id rides in the
    // unprotected map instead
    let mut entries = 1;
    if tag == TAG_ENCRYPT0 {
        entries += 1;
    }
    if counter_sig.is_some() {
        entries += 1;
    }
    enc.map(entries);
    if tag == TAG_ENCRYPT0 {
        enc.int(HDR_KID);
        enc.bytes(recipients[0].kid.as_bytes());
    }
    enc.int(HDR_IV);
    enc.bytes(nonce);
    if let Some(sig) = &counter_sig {
        enc.int(HDR_COUNTER_SIGNATURE);
        enc.array(3);
        encode_protected(&mut enc, sig.alg)?;
        enc.map(1);
        enc.int(HDR_KID);
        enc.bytes(sig.kid.as_bytes());
        enc.bytes(&sig.signature);
    }
    enc.bytes(&ciphertext);

    if tag == TAG_ENCRYPT {
        enc.array(recipients.len());
        let mut ephemeral: Option<EcKey> = None;
        for recipient in recipients {
            match recipient.alg {
                ALG_DIRECT => {
                    enc.array(3);
                    enc.bytes(&[]);
                    enc.map(2);
                    enc.int(HDR_ALG);
                    enc.int(recipient.alg);
                    enc.int(HDR_KID);
                    enc.bytes(recipient.kid.as_bytes());
                    enc.bytes(&[]);
                }
                ALG_A256KW => {
                    let kek = key_store.key(&recipient.kid)?.symmetric()?.to_vec();
                    let wrapped = key_wrap(&cek, &kek)?;
                    enc.array(3);
                    enc.bytes(&[]);
                    enc.map(2);
                    enc.int(HDR_ALG);
                    enc.int(recipient.alg);
                    enc.int(HDR_KID);
                    enc.bytes(recipient.kid.as_bytes());
                    enc.bytes(&wrapped);
                }
                ALG_ECDH_ES_A256KW => {
                    let static_key = key_store.key(&recipient.kid)?.ec()?.clone();
                    // One ephemeral key per curve per message
                    if ephemeral.as_ref().map(|k| k.curve) != Some(static_key.curve) {
                        ephemeral = Some(
                            key_store
                                .ephemeral_key(EphemeralRequest::Ec(static_key.curve))?
                                .ec()?
                                .clone(),
                        );
                    }
                    let eph = ephemeral.as_ref().ok_or(Error::Failure)?;
                    let eph_d = eph.d.as_deref().ok_or(Error::Missing("ephemeral key"))?;
                    let secret = ecdh(static_key.curve, &static_key.x, &static_key.y, eph_d)?;
                    let kek = derive_kek(&secret, recipient.alg)?;
                    let wrapped = key_wrap(&cek, &kek)?;
                    enc.array(3);
                    encode_protected(&mut enc, recipient.alg)?;
                    enc.map(2);
                    enc.int(HDR_EPHEMERAL_KEY);
                    encode_ec_public(&mut enc, eph);
                    enc.int(HDR_KID);
                    enc.bytes(recipient.kid.as_bytes());
                    enc.bytes(&wrapped);
                }
                _ => return Err(Error::NotImplemented),
            }
        }
    }
    Ok(enc.into_bytes())
}

struct Recipient {
    alg: i64,
    kid: KeyId,
    ephemeral: Option<EcKey>,
    wrapped: Vec<u8>,
}

fn decode_recipient(dec: &mut Decoder<'_>) -> Result<Recipient> {
    if dec.array()? != 3 {
        return Err(Error::Invalid);
    }
    let protected_alg = decode_protected(dec)?;
    let unprotected = decode_unprotected(dec)?;
    let alg = if protected_alg != ALG_RESERVED {
        protected_alg
    } else {
        unprotected.alg.ok_or(Error::Invalid)?
    };
    Ok(Recipient {
        alg,
        kid: unprotected.kid.ok_or(Error::Invalid)?,
        ephemeral: unprotected.ephemeral,
        wrapped: dec.bytes()?.to_vec(),
    })
}

/// Decrypt a tagged `Encrypt0`/`Encrypt` object. Recipient candidates
/// are tried in order; the first whose key unwraps and authenticates
/// wins. `nonce` overrides the IV header when supplied.
pub fn decrypt(
    nonce: Option<&[u8; NONCE_LEN]>,
    aad: &[u8],
    cipher_text: &[u8],
    key_store: &dyn KeyStore,
) -> Result<Decrypted> {
    let mut dec = Decoder::new(cipher_text);
    let tag = dec.tag().map_err(|_| Error::NotCose)?;
    if tag != TAG_ENCRYPT0 && tag != TAG_ENCRYPT {
        return Err(Error::NotCose);
    }
    let elements = dec.array()?;
    if (tag == TAG_ENCRYPT0 && elements != 3) || (tag == TAG_ENCRYPT && elements != 4) {
        return Err(Error::Invalid);
    }
    let alg = decode_protected(&mut dec)?;
    if alg != ALG_A256GCM {
        return Err(if alg == ALG_RESERVED {
            Error::Invalid
        } else {
            Error::NotImplemented
        });
    }
    let unprotected = decode_unprotected(&mut dec)?;
    let ciphertext = dec.bytes()?;

    // Verify the counter signature before decrypting; failure only
    // clears the signer identity
    let signer = match &unprotected.counter_sig {
        Some(sig) => {
            let entity = Entity {
                alg: sig.alg,
                kid: sig.kid.clone(),
            };
            match signature_key(key_store, &entity)
                .and_then(|key| {
                    let tbs = sig_structure(tag, alg, sig.alg, &[], ciphertext)?;
                    ecdsa_verify(&key, &tbs, &sig.signature)
                }) {
                Ok(()) => Some(entity),
                Err(err) => {
                    warn!(?err, "counter signature did not verify");
                    None
                }
            }
        }
        None => None,
    };

    let aad_structure = enc_structure(tag, alg, aad)?;
    let iv = unprotected.nonce.unwrap_or_default();
    let nonce: &[u8] = match nonce {
        Some(nonce) => nonce,
        None => &iv,
    };

    let recipients: Vec<Recipient> = if tag == TAG_ENCRYPT0 {
        vec![Recipient {
            alg: ALG_RESERVED,
            kid: unprotected.kid.clone().unwrap_or_else(|| KeyId::from(&b""[..])),
            ephemeral: None,
            wrapped: Vec::new(),
        }]
    } else {
        let count = dec.array()?;
        let mut recipients = Vec::with_capacity(count);
        for _ in 0..count {
            recipients.push(decode_recipient(&mut dec)?);
        }
        recipients
    };

    let mut last_err = Error::Missing("recipient");
    for recipient in recipients {
        let cek: Result<Vec<u8>> = match recipient.alg {
            ALG_RESERVED | ALG_DIRECT => key_store
                .key(&recipient.kid)
                .and_then(|k| Ok(k.symmetric()?.to_vec())),
            ALG_A256KW => key_store.key(&recipient.kid).and_then(|k| {
                let kek = k.symmetric()?;
                Ok(key_unwrap(&recipient.wrapped, kek)?.to_vec())
            }),
            ALG_ECDH_ES_A256KW => {
                let ephemeral = recipient.ephemeral.as_ref().ok_or(Error::Invalid);
                ephemeral.and_then(|eph| {
                    let static_key = key_store.key(&recipient.kid)?.ec()?.clone();
                    let d = static_key.d.as_deref().ok_or(Error::Missing("private key"))?;
                    let secret = ecdh(eph.curve, &eph.x, &eph.y, d)?;
                    let kek = derive_kek(&secret, recipient.alg)?;
                    Ok(key_unwrap(&recipient.wrapped, &kek)?.to_vec())
                })
            }
            _ => Err(Error::NotImplemented),
        };
        let cek = match cek {
            Ok(cek) => cek,
            Err(err) => {
                last_err = err;
                continue;
            }
        };
        match gcm_decrypt(&cek, nonce, ciphertext, &aad_structure) {
            Ok(plaintext) => {
                return Ok(Decrypted {
                    plaintext,
                    recipient: Entity {
                        alg: recipient.alg,
                        kid: recipient.kid,
                    },
                    signer,
                });
            }
            Err(err) => last_err = err,
        }
    }
    Err(last_err)
}

/// Produce a `Sign1` object over `payload`.
pub fn sign(signer: &Entity, aad: &[u8], payload: &[u8], key_store: &dyn KeyStore) -> Result<Bytes> {
    let key = signature_key(key_store, signer)?;
    let tbs = sig_structure(TAG_SIGN1, ALG_RESERVED, signer.alg, aad, payload)?;
    let signature = ecdsa_sign(&key, &tbs)?;

    let mut enc = Encoder::with_capacity(payload.len() + signature.len() + 128);
    enc.tag(TAG_SIGN1);
    enc.array(4);
    encode_protected(&mut enc, signer.alg)?;
    enc.map(1);
    enc.int(HDR_KID);
    enc.bytes(signer.kid.as_bytes());
    enc.bytes(payload);
    enc.bytes(&signature);
    Ok(enc.into_bytes())
}

/// Parse a `Sign1` object. Parsing succeeds even when the signature
/// does not verify; the signer identity is cleared in that case.
pub fn verify(aad: &[u8], data: &[u8], key_store: &dyn KeyStore) -> Result<Verified> {
    let mut dec = Decoder::new(data);
    let tag = dec.tag().map_err(|_| Error::NotCose)?;
    if tag != TAG_SIGN1 {
        return Err(Error::NotCose);
    }
    if dec.array()? != 4 {
        return Err(Error::Invalid);
    }
    let sig_alg = decode_protected(&mut dec)?;
    let unprotected = decode_unprotected(&mut dec)?;
    let payload = dec.bytes()?;
    let signature = dec.bytes()?;

    let signer = unprotected.kid.and_then(|kid| {
        let entity = Entity {
            alg: sig_alg,
            kid,
        };
        let verified = signature_key(key_store, &entity).and_then(|key| {
            let tbs = sig_structure(TAG_SIGN1, ALG_RESERVED, sig_alg, aad, payload)?;
            ecdsa_verify(&key, &tbs, &signature)
        });
        match verified {
            Ok(()) => Some(entity),
            Err(err) => {
                warn!(?err, "signature did not verify");
                None
            }
        }
    });
    Ok(Verified {
        payload: payload.to_vec(),
        signer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::{generate_ec_key, public_half, MemoryKeyStore};

    const NONCE: [u8; NONCE_LEN] = [0x11; NONCE_LEN];
    const AAD: &[u8] = b"external-aad";
    const MSG: &[u8] = b"the quick brown fox";

    fn store_with_symmetric(id: &str) -> MemoryKeyStore {
        let store = MemoryKeyStore::new();
        store.put(id, Key::Symmetric(vec![0x5a; 32]));
        store
    }

    #[test]
    fn encrypt0_direct_round_trip() {
        let store = store_with_symmetric("psk");
        let recipients = [Entity::new(ALG_RESERVED, "psk")];
        let obj = encrypt(ALG_A256GCM, &NONCE, None, &recipients, AAD, MSG, &store).unwrap();

        let out = decrypt(Some(&NONCE), AAD, &obj, &store).unwrap();
        assert_eq!(out.plaintext, MSG);
        assert!(out.signer.is_none());
    }

    #[test]
    fn encrypt0_uses_iv_header_when_nonce_omitted() {
        let store = store_with_symmetric("psk");
        let recipients = [Entity::new(ALG_RESERVED, "psk")];
        let obj = encrypt(ALG_A256GCM, &NONCE, None, &recipients, AAD, MSG, &store).unwrap();
        let out = decrypt(None, AAD, &obj, &store).unwrap();
        assert_eq!(out.plaintext, MSG);
    }

    #[test]
    fn tampered_ciphertext_fails_security() {
        let store = store_with_symmetric("psk");
        let recipients = [Entity::new(ALG_RESERVED, "psk")];
        let obj = encrypt(ALG_A256GCM, &NONCE, None, &recipients, AAD, MSG, &store).unwrap();
        let mut bad = obj.to_vec();
        let last = bad.len() - 1;
        bad[last] ^= 0x01;
        assert_eq!(
            decrypt(Some(&NONCE), AAD, &bad, &store).unwrap_err(),
            Error::Security
        );
    }

    #[test]
    fn wrong_aad_fails_security() {
        let store = store_with_symmetric("psk");
        let recipients = [Entity::new(ALG_RESERVED, "psk")];
        let obj = encrypt(ALG_A256GCM, &NONCE, None, &recipients, AAD, MSG, &store).unwrap();
        assert_eq!(
            decrypt(Some(&NONCE), b"other-aad", &obj, &store).unwrap_err(),
            Error::Security
        );
    }

    #[test]
    fn not_cose_without_tag() {
        let store = store_with_symmetric("psk");
        assert_eq!(
            decrypt(Some(&NONCE), AAD, b"\x83\x01\x02\x03", &store).unwrap_err(),
            Error::NotCose
        );
    }

    #[test]
    fn key_wrap_round_trip_multiple_recipients() {
        let store = MemoryKeyStore::new();
        store.put("kek-a", Key::Symmetric(vec![0x01; 32]));
        store.put("kek-b", Key::Symmetric(vec![0x02; 32]));
        let recipients = [
            Entity::new(ALG_A256KW, "kek-a"),
            Entity::new(ALG_A256KW, "kek-b"),
        ];
        let obj = encrypt(ALG_A256GCM, &NONCE, None, &recipients, AAD, MSG, &store).unwrap();

        // A store holding only the second KEK still decrypts
        let partial = MemoryKeyStore::new();
        partial.put("kek-b", Key::Symmetric(vec![0x02; 32]));
        let out = decrypt(Some(&NONCE), AAD, &obj, &partial).unwrap();
        assert_eq!(out.plaintext, MSG);
        assert_eq!(out.recipient.kid, KeyId::from("kek-b"));

        // A store with neither reports the missing key
        let empty = MemoryKeyStore::new();
        assert!(matches!(
            decrypt(Some(&NONCE), AAD, &obj, &empty).unwrap_err(),
            Error::Missing(_)
        ));
    }

    #[test]
    fn ecdh_round_trip_p384() {
        let recipient_key = generate_ec_key(EcCurve::P384);

        let sender = MemoryKeyStore::new();
        sender.put("r", public_half(&recipient_key));
        let recipients = [Entity::new(ALG_ECDH_ES_A256KW, "r")];
        let obj = encrypt(ALG_A256GCM, &NONCE, None, &recipients, AAD, MSG, &sender).unwrap();

        let receiver = MemoryKeyStore::new();
        receiver.put("r", recipient_key);
        let out = decrypt(Some(&NONCE), AAD, &obj, &receiver).unwrap();
        assert_eq!(out.plaintext, MSG);
        assert_eq!(out.recipient.alg, ALG_ECDH_ES_A256KW);

        // A node without the private key can parse but not decrypt
        let forwarder = MemoryKeyStore::new();
        assert!(decrypt(Some(&NONCE), AAD, &obj, &forwarder).is_err());
    }

    #[test]
    fn ecdh_round_trip_p521() {
        let recipient_key = generate_ec_key(EcCurve::P521);
        let sender = MemoryKeyStore::new();
        sender.put("r", public_half(&recipient_key));
        let recipients = [Entity::new(ALG_ECDH_ES_A256KW, "r")];
        let obj = encrypt(ALG_A256GCM, &NONCE, None, &recipients, AAD, MSG, &sender).unwrap();

        let receiver = MemoryKeyStore::new();
        receiver.put("r", recipient_key);
        let out = decrypt(Some(&NONCE), AAD, &obj, &receiver).unwrap();
        assert_eq!(out.plaintext, MSG);
    }

    #[test]
    fn counter_signature_verifies() {
        let signer_key = generate_ec_key(EcCurve::P384);
        let store = store_with_symmetric("psk");
        store.put("signer", signer_key.clone());
        let signer = Entity::new(ALG_ES384, "signer");
        let recipients = [Entity::new(ALG_RESERVED, "psk")];
        let obj = encrypt(
            ALG_A256GCM,
            &NONCE,
            Some(&signer),
            &recipients,
            AAD,
            MSG,
            &store,
        )
        .unwrap();

        // Receiver holds the signer public key
        let receiver = store_with_symmetric("psk");
        receiver.put("signer", public_half(&signer_key));
        let out = decrypt(Some(&NONCE), AAD, &obj, &receiver).unwrap();
        assert_eq!(out.plaintext, MSG);
        assert_eq!(out.signer, Some(signer));
    }

    #[test]
    fn unknown_signer_clears_identity_but_decrypts() {
        let signer_key = generate_ec_key(EcCurve::P384);
        let store = store_with_symmetric("psk");
        store.put("signer", signer_key);
        let signer = Entity::new(ALG_ES384, "signer");
        let recipients = [Entity::new(ALG_RESERVED, "psk")];
        let obj = encrypt(
            ALG_A256GCM,
            &NONCE,
            Some(&signer),
            &recipients,
            AAD,
            MSG,
            &store,
        )
        .unwrap();

        // Receiver cannot resolve the signer key
        let receiver = store_with_symmetric("psk");
        let out = decrypt(Some(&NONCE), AAD, &obj, &receiver).unwrap();
        assert_eq!(out.plaintext, MSG);
        assert!(out.signer.is_none());
    }

    #[test]
    fn missing_signer_key_fails_encrypt() {
        let store = store_with_symmetric("psk");
        let signer = Entity::new(ALG_ES384, "absent");
        let recipients = [Entity::new(ALG_RESERVED, "psk")];
        assert!(matches!(
            encrypt(
                ALG_A256GCM,
                &NONCE,
                Some(&signer),
                &recipients,
                AAD,
                MSG,
                &store
            )
            .unwrap_err(),
            Error::Missing(_)
        ));
    }

    #[test]
    fn sign1_round_trip_and_tamper() {
        let signer_key = generate_ec_key(EcCurve::P521);
        let store = MemoryKeyStore::new();
        store.put("id", signer_key.clone());
        let signer = Entity::new(ALG_ES512, "id");
        let obj = sign(&signer, AAD, MSG, &store).unwrap();

        let receiver = MemoryKeyStore::new();
        receiver.put("id", public_half(&signer_key));
        let out = verify(AAD, &obj, &receiver).unwrap();
        assert_eq!(out.payload, MSG);
        assert_eq!(out.signer, Some(signer));

        // Flip a payload byte: parse succeeds, signer is cleared
        let mut bad = obj.to_vec();
        let mid = bad.len() / 2;
        bad[mid] ^= 0x01;
        if let Ok(out) = verify(AAD, &bad, &receiver) {
            assert!(out.signer.is_none());
        }
    }

    #[test]
    fn mismatched_curve_and_alg_is_invalid() {
        let store = MemoryKeyStore::new();
        store.put("id", generate_ec_key(EcCurve::P384));
        let signer = Entity::new(ALG_ES512, "id");
        assert_eq!(sign(&signer, AAD, MSG, &store).unwrap_err(), Error::Invalid);
    }
}
