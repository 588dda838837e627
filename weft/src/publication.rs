//! Publication engine.
//!
//! A local publish serializes the authenticated headers, frames the
//! payload (plain, signed, or encrypted to the recipient list),
//! delivers to matching local subscriptions first, then forwards to
//! every peer whose inbound filter is a superset of the publication's
//! Bloom vector. Received publications follow the same path with the
//! arrival link excluded, reusing the received header and payload
//! bytes unchanged - an intermediate node can route what it cannot
//! read.
//!
//! Publications with a positive TTL are retained for late subscribers
//! and reaped when they expire. Acknowledgements retrace the forwarding
//! path one hop at a time using the recorded arrival link of each
//! publication.

use bytes::Bytes;
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use weft_core::bitvec::BitVector;
use weft_core::error::{Error, Result};
use weft_core::topic::{self, TopicRole};
use weft_core::uuid::Uuid;

use weft_proto::cbor::{Decoder, Kind};
use weft_proto::cose::{self, Entity};
use weft_proto::keystore::KeyId;
use weft_proto::msg::{self, AckMessage, MsgType, PubHeader, PubMessage, PubPayload};

use crate::linkmon::PROBE_TOPIC;
use crate::node::{AckHandler, Delivery, Effects, NodeState, PublicationInfo, TimerKind};
use crate::sub::clip_topic;
use crate::transport::PeerAddr;

/// How acknowledgements for a delivered publication are protected,
/// mirroring the framing the publication itself arrived with.
#[derive(Debug, Clone, Default)]
pub(crate) enum AckFraming {
    #[default]
    Plain,
    /// Pre-shared content key, Encrypt0 both ways.
    Psk(KeyId),
    /// Encrypt to the publisher's advertised identity.
    Ecdh(KeyId),
}

/// One publication the node holds: a local series, or a retained copy
/// of a remote one.
pub(crate) struct NodePub {
    pub pub_id: Uuid,
    pub sequence: u32,
    /// Known topics; empty when the payload could not be opened.
    pub topics: Vec<String>,
    pub bloom: BitVector,
    pub ack_requested: bool,
    pub local: bool,
    /// Local series is live (publish succeeded, not yet expired).
    pub publish: bool,
    pub retained: bool,
    pub expires: Option<Instant>,
    pub protected_raw: Bytes,
    pub encrypted_raw: Bytes,
    /// Arrival link of a remote publication.
    pub from: Option<PeerAddr>,
    pub sender: Option<Entity>,
    pub clear_payload: Option<Bytes>,
    pub recipients: Vec<Entity>,
    pub ack_handler: Option<Arc<AckHandler>>,
    /// Recent sequence numbers still eligible for acknowledgement.
    pub recent_seqs: SmallVec<[u32; 8]>,
    pub ack_framing: AckFraming,
}

impl NodePub {
    fn remaining_ttl(&self, now: Instant) -> i16 {
        match self.expires {
            Some(expires) if expires > now => {
                let millis = expires.duration_since(now).as_millis();
                ((millis + 999) / 1000).min(i16::MAX as u128) as i16
            }
            _ => 0,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.retained && self.expires.is_some_and(|expires| expires > now)
    }
}

impl NodeState {
    pub fn create_publication(
        &mut self,
        topics: &[String],
        recipients: Vec<Entity>,
        ack_handler: Option<Arc<AckHandler>>,
    ) -> Result<(u64, Uuid)> {
        if topics.is_empty() {
            return Err(Error::InvalidArgs);
        }
        let topics: Vec<String> = topics
            .iter()
            .map(|t| clip_topic(t, self.config.max_topic_len).to_string())
            .collect();
        let mut bloom = BitVector::new(self.config.bit_len);
        for topic in &topics {
            topic::add_topic(
                &mut bloom,
                topic,
                &self.config.separators,
                TopicRole::Publisher,
                self.config.num_hashes,
            )?;
        }
        let handle = self.next_id();
        let pub_id = Uuid::generate();
        debug!(%pub_id, ?topics, "publication created");
        self.pubs.insert(
            handle,
            NodePub {
                pub_id,
                sequence: 0,
                topics,
                bloom,
                ack_requested: ack_handler.is_some(),
                local: true,
                publish: false,
                retained: false,
                expires: None,
                protected_raw: Bytes::new(),
                encrypted_raw: Bytes::new(),
                from: None,
                sender: None,
                clear_payload: None,
                recipients,
                ack_handler,
                recent_seqs: SmallVec::new(),
                ack_framing: AckFraming::Plain,
            },
        );
        Ok((handle, pub_id))
    }

    /// Publish a new payload on a local series.
    pub fn publish(
        &mut self,
        handle: u64,
        payload: &[u8],
        ttl: i16,
        effects: &mut Effects,
    ) -> Result<()> {
        if ttl < 0 {
            return self.expire_publication(handle, effects);
        }
        let key_store = Arc::clone(&self.key_store);
        let signer = self.signer.clone();
        let now = Instant::now();

        let (info, bloom, protected_raw, encrypted_raw, data) = {
            let record = self
                .pubs
                .get_mut(&handle)
                .ok_or(Error::Missing("publication"))?;
            if !record.local {
                return Err(Error::InvalidArgs);
            }
            record.sequence += 1;
            let sequence = record.sequence;
            if record.recent_seqs.len() == record.recent_seqs.inline_size() {
                record.recent_seqs.remove(0);
            }
            record.recent_seqs.push(sequence);

            let header = PubHeader {
                ttl,
                pub_id: record.pub_id,
                sequence,
                ack_requested: record.ack_requested,
                bloom: record.bloom.clone(),
                sender_id: signer.as_ref().map(|s| s.kid.clone()),
                recipients: record.recipients.iter().map(|r| r.kid.clone()).collect(),
            };
            let protected_raw = header.encode();
            let data = Bytes::copy_from_slice(payload);
            let payload_map = PubPayload {
                topics: record.topics.clone(),
                data: data.clone(),
            }
            .encode();
            let encrypted_raw = if record.recipients.is_empty() {
                match &signer {
                    Some(signer) => {
                        cose::sign(signer, &protected_raw, &payload_map, key_store.as_ref())?
                    }
                    None => payload_map,
                }
            } else {
                let nonce = msg::make_nonce(&record.pub_id, sequence, MsgType::Pub);
                cose::encrypt(
                    cose::ALG_A256GCM,
                    &nonce,
                    signer.as_ref(),
                    &record.recipients,
                    &protected_raw,
                    &payload_map,
                    key_store.as_ref(),
                )?
            };
            record.protected_raw = protected_raw.clone();
            record.encrypted_raw = encrypted_raw.clone();
            record.clear_payload = Some(data.clone());
            record.publish = ttl > 0;
            record.retained = ttl > 0;
            record.expires = (ttl > 0).then(|| now + Duration::from_secs(u64::from(ttl as u16)));
            debug!(pub_id = %record.pub_id, sequence, ttl, "publishing");

            let info = PublicationInfo {
                pub_id: record.pub_id,
                sequence,
                topics: record.topics.clone(),
                ack_requested: record.ack_requested,
                ttl,
                sender: signer.clone(),
                ack_to: None,
                ack_framing: AckFraming::Plain,
            };
            (info, record.bloom.clone(), protected_raw, encrypted_raw, data)
        };

        self.history.record(info.pub_id, info.sequence, None);
        // Local subscribers see the publication before any forwarding
        self.deliver_to_local_subs(&info, &data, effects);
        self.forward_frame(&bloom, ttl, &protected_raw, &encrypted_raw, None, effects);
        if ttl > 0 {
            self.schedule_reap(now + Duration::from_secs(u64::from(ttl as u16)), effects);
        }
        Ok(())
    }

    /// Expire retained state; a local series keeps its handle and may
    /// publish again.
    pub fn expire_publication(&mut self, handle: u64, _effects: &mut Effects) -> Result<()> {
        let local = {
            let record = self
                .pubs
                .get_mut(&handle)
                .ok_or(Error::Missing("publication"))?;
            debug!(pub_id = %record.pub_id, "expiring publication");
            record.publish = false;
            record.retained = false;
            record.expires = None;
            record.local
        };
        if !local {
            self.pubs.remove(&handle);
        }
        Ok(())
    }

    pub fn destroy_publication(&mut self, handle: u64) -> Result<()> {
        self.pubs
            .remove(&handle)
            .map(|_| ())
            .ok_or(Error::Missing("publication"))
    }

    fn deliver_to_local_subs(
        &self,
        info: &PublicationInfo,
        payload: &Bytes,
        effects: &mut Effects,
    ) {
        for sub in self.subs.values() {
            match topic::match_any(&info.topics, &sub.topics, &self.config.separators) {
                Ok(true) => {
                    trace!(sub = sub.id, pub_id = %info.pub_id, "delivering");
                    effects.deliveries.push(Delivery::Publication {
                        handler: Arc::clone(&sub.handler),
                        info: info.clone(),
                        payload: payload.clone(),
                    });
                }
                Ok(false) => {}
                Err(err) => warn!(%err, "unmatchable topic"),
            }
        }
    }

    /// Forward a publication frame to every peer whose inbound filter
    /// covers it, skipping the arrival link and muted links.
    fn forward_frame(
        &self,
        bloom: &BitVector,
        ttl: i16,
        protected_raw: &[u8],
        encrypted_raw: &[u8],
        exclude: Option<PeerAddr>,
        effects: &mut Effects,
    ) {
        let fuzzy = bloom.fuzzy_hash();
        for (addr, peer) in self.peers.iter() {
            if Some(*addr) == exclude || peer.outbound.muted || peer.inbound.muted {
                continue;
            }
            let (Some(interests), Some(needs)) = (&peer.inbound.interests, &peer.inbound.needs)
            else {
                continue;
            };
            // Cheap summary test first, then the full subset check
            if !fuzzy.includes(needs) || !interests.includes(bloom) {
                continue;
            }
            trace!(peer = %addr, "forwarding publication");
            effects.send(
                *addr,
                msg::encode_pub(self.port, ttl, protected_raw, encrypted_raw),
            );
        }
    }

    /// Open a publication payload: plain map, signed, or encrypted.
    /// `None` means this node cannot read it (it may still forward).
    fn open_payload(
        &self,
        pm: &PubMessage,
    ) -> Result<Option<(PubPayload, Option<Entity>, AckFraming)>> {
        let mut dec = Decoder::new(&pm.encrypted_raw);
        match dec.peek()? {
            Kind::Tag => {
                let tag = dec.clone().tag()?;
                if tag == cose::TAG_SIGN1 {
                    let verified = cose::verify(
                        &pm.protected_raw,
                        &pm.encrypted_raw,
                        self.key_store.as_ref(),
                    )?;
                    let payload = PubPayload::decode(&verified.payload)?;
                    return Ok(Some((payload, verified.signer, AckFraming::Plain)));
                }
                let nonce =
                    msg::make_nonce(&pm.header.pub_id, pm.header.sequence, MsgType::Pub);
                match cose::decrypt(
                    Some(&nonce),
                    &pm.protected_raw,
                    &pm.encrypted_raw,
                    self.key_store.as_ref(),
                ) {
                    Ok(opened) => {
                        let framing = match opened.recipient.alg {
                            cose::ALG_RESERVED | cose::ALG_DIRECT => {
                                AckFraming::Psk(opened.recipient.kid.clone())
                            }
                            _ => pm
                                .header
                                .sender_id
                                .clone()
                                .map_or(AckFraming::Plain, AckFraming::Ecdh),
                        };
                        let payload = PubPayload::decode(&opened.plaintext)?;
                        Ok(Some((payload, opened.signer, framing)))
                    }
                    Err(Error::Security) | Err(Error::Missing(_)) => {
                        trace!(pub_id = %pm.header.pub_id, "not a recipient, forward only");
                        Ok(None)
                    }
                    Err(err) => Err(err),
                }
            }
            _ => Ok(Some((
                PubPayload::decode(&pm.encrypted_raw)?,
                None,
                AckFraming::Plain,
            ))),
        }
    }

    /// Process a received publication.
    pub fn on_pub(&mut self, from: PeerAddr, pm: PubMessage, effects: &mut Effects) -> Result<()> {
        if let Some(peer) = self.peers.lookup(&from) {
            // Only monitor probes travel on muted links, and their
            // arrival was already recorded as liveness
            if peer.outbound.muted || peer.inbound.muted {
                trace!(peer = %from, "publication on muted link");
                return Ok(());
            }
        }
        if self.history.is_duplicate(&pm.header.pub_id, pm.header.sequence) {
            trace!(pub_id = %pm.header.pub_id, sequence = pm.header.sequence, "duplicate publication");
            return Ok(());
        }
        self.history
            .record(pm.header.pub_id, pm.header.sequence, Some(from));
        let ttl = pm.ttl.max(0);

        let opened = self.open_payload(&pm)?;
        let mut retained_topics = Vec::new();
        let mut retained_payload = None;
        let mut retained_sender = None;
        let mut retained_framing = AckFraming::Plain;
        if let Some((payload, sender, framing)) = opened {
            if payload.topics.iter().any(|t| t == PROBE_TOPIC) {
                return Ok(());
            }
            let info = PublicationInfo {
                pub_id: pm.header.pub_id,
                sequence: pm.header.sequence,
                topics: payload.topics.clone(),
                ack_requested: pm.header.ack_requested,
                ttl,
                sender: sender.clone(),
                ack_to: Some(from),
                ack_framing: framing.clone(),
            };
            self.deliver_to_local_subs(&info, &payload.data, effects);
            retained_topics = payload.topics;
            retained_payload = Some(payload.data);
            retained_sender = sender;
            retained_framing = framing;
        }

        // A newer instance supersedes any retained copy of the series
        let stale: Vec<u64> = self
            .pubs
            .iter()
            .filter(|(_, record)| {
                !record.local
                    && record.pub_id == pm.header.pub_id
                    && record.sequence < pm.header.sequence
            })
            .map(|(handle, _)| *handle)
            .collect();
        for handle in stale {
            self.pubs.remove(&handle);
        }

        if ttl > 0 {
            let now = Instant::now();
            let expires = now + Duration::from_secs(u64::from(ttl as u16));
            let handle = self.next_id();
            self.pubs.insert(
                handle,
                NodePub {
                    pub_id: pm.header.pub_id,
                    sequence: pm.header.sequence,
                    topics: retained_topics,
                    bloom: pm.header.bloom.clone(),
                    ack_requested: pm.header.ack_requested,
                    local: false,
                    publish: false,
                    retained: true,
                    expires: Some(expires),
                    protected_raw: pm.protected_raw.clone(),
                    encrypted_raw: pm.encrypted_raw.clone(),
                    from: Some(from),
                    sender: retained_sender,
                    clear_payload: retained_payload,
                    recipients: Vec::new(),
                    ack_handler: None,
                    recent_seqs: SmallVec::new(),
                    ack_framing: retained_framing,
                },
            );
            self.schedule_reap(expires, effects);
        }

        self.forward_frame(
            &pm.header.bloom,
            ttl,
            &pm.protected_raw,
            &pm.encrypted_raw,
            Some(from),
            effects,
        );
        Ok(())
    }

    /// Deliver retained publications that match a newly created local
    /// subscription.
    pub fn deliver_retained(&mut self, sub_id: u64, effects: &mut Effects) {
        let now = Instant::now();
        let Some(sub) = self.subs.get(&sub_id) else {
            return;
        };
        let mut deliveries = Vec::new();
        for record in self.pubs.values() {
            let live = record.is_live(now) || (record.local && record.publish);
            if !live || record.topics.is_empty() {
                continue;
            }
            let Some(payload) = &record.clear_payload else {
                continue;
            };
            match topic::match_any(&record.topics, &sub.topics, &self.config.separators) {
                Ok(true) => {
                    let info = PublicationInfo {
                        pub_id: record.pub_id,
                        sequence: record.sequence,
                        topics: record.topics.clone(),
                        ack_requested: record.ack_requested,
                        ttl: record.remaining_ttl(now),
                        sender: record.sender.clone(),
                        ack_to: record.from,
                        ack_framing: record.ack_framing.clone(),
                    };
                    deliveries.push((Arc::clone(&sub.handler), info, payload.clone()));
                }
                Ok(false) => {}
                Err(err) => warn!(%err, "unmatchable topic"),
            }
        }
        for (handler, info, payload) in deliveries {
            trace!(pub_id = %info.pub_id, "delivering retained publication");
            effects.deliveries.push(Delivery::Publication {
                handler,
                info,
                payload,
            });
        }
    }

    /// Forward retained publications to a peer whose interests just
    /// changed. The receiver's duplicate history suppresses re-sends.
    pub fn forward_retained_to(&mut self, addr: &PeerAddr, effects: &mut Effects) {
        let now = Instant::now();
        let Some(peer) = self.peers.lookup(addr) else {
            return;
        };
        if peer.outbound.muted || peer.inbound.muted {
            return;
        }
        let (Some(interests), Some(needs)) = (&peer.inbound.interests, &peer.inbound.needs) else {
            return;
        };
        let mut frames = Vec::new();
        for record in self.pubs.values() {
            let live = record.is_live(now) || (record.local && record.publish);
            if !live || record.from == Some(*addr) {
                continue;
            }
            let fuzzy = record.bloom.fuzzy_hash();
            if !fuzzy.includes(needs) || !interests.includes(&record.bloom) {
                continue;
            }
            frames.push(msg::encode_pub(
                self.port,
                record.remaining_ttl(now),
                &record.protected_raw,
                &record.encrypted_raw,
            ));
        }
        for frame in frames {
            trace!(peer = %addr, "forwarding retained publication");
            effects.send(*addr, frame);
        }
    }

    pub fn schedule_reap(&mut self, at: Instant, effects: &mut Effects) {
        if self.reap_at.map_or(true, |current| at < current) {
            self.reap_at = Some(at);
            self.schedule(at, TimerKind::PubReap, effects);
        }
    }

    /// Sweep expired retained publications. Local series keep their
    /// handle with the live flag cleared; remote copies are removed.
    pub fn on_pub_reap(&mut self, effects: &mut Effects) {
        self.reap_at = None;
        let now = Instant::now();
        let expired: Vec<u64> = self
            .pubs
            .iter()
            .filter(|(_, record)| {
                record.retained && record.expires.is_some_and(|expires| expires <= now)
            })
            .map(|(handle, _)| *handle)
            .collect();
        for handle in expired {
            let mut remove = false;
            if let Some(record) = self.pubs.get_mut(&handle) {
                debug!(pub_id = %record.pub_id, "retained publication expired");
                if record.local {
                    record.publish = false;
                    record.retained = false;
                    record.expires = None;
                } else {
                    remove = true;
                }
            }
            if remove {
                self.pubs.remove(&handle);
            }
        }
        let next = self
            .pubs
            .values()
            .filter_map(|record| record.expires.filter(|_| record.retained))
            .min();
        if let Some(at) = next {
            self.schedule_reap(at, effects);
        }
    }

    /// Open an acknowledgement payload.
    fn open_ack_payload(&self, ack: &AckMessage) -> Result<(Bytes, Option<Entity>)> {
        let mut dec = Decoder::new(&ack.encrypted_raw);
        match dec.peek()? {
            Kind::Tag => {
                let nonce =
                    msg::make_nonce(&ack.header.pub_id, ack.header.sequence, MsgType::Ack);
                let opened = cose::decrypt(
                    Some(&nonce),
                    &ack.protected_raw,
                    &ack.encrypted_raw,
                    self.key_store.as_ref(),
                )?;
                let payload = msg::AckPayload::decode(&opened.plaintext)?;
                Ok((payload.data, opened.signer))
            }
            _ => {
                let payload = msg::AckPayload::decode(&ack.encrypted_raw)?;
                Ok((payload.data, None))
            }
        }
    }

    /// Process a received acknowledgement: deliver it if the matching
    /// publication originated here, otherwise pass it one hop back
    /// along the arrival path. Acks are opportunistic and never
    /// retransmitted.
    pub fn on_ack(&mut self, from: PeerAddr, ack: AckMessage, effects: &mut Effects) -> Result<()> {
        let matching = self.pubs.iter().find(|(_, record)| {
            record.local
                && record.pub_id == ack.header.pub_id
                && record.recent_seqs.contains(&ack.header.sequence)
        });
        if let Some((_, record)) = matching {
            let Some(handler) = record.ack_handler.clone() else {
                return Ok(());
            };
            let topics = record.topics.clone();
            let ack_requested = record.ack_requested;
            let (data, sender) = self.open_ack_payload(&ack)?;
            let info = PublicationInfo {
                pub_id: ack.header.pub_id,
                sequence: ack.header.sequence,
                topics,
                ack_requested,
                ttl: 0,
                sender,
                ack_to: None,
                ack_framing: AckFraming::Plain,
            };
            trace!(pub_id = %info.pub_id, "acknowledgement delivered");
            effects.deliveries.push(Delivery::Ack {
                handler,
                info,
                payload: data,
            });
            return Ok(());
        }
        match self.history.source(&ack.header.pub_id) {
            Some(next) if next != from => {
                trace!(pub_id = %ack.header.pub_id, %next, "routing acknowledgement");
                effects.send(
                    next,
                    msg::encode_ack(self.port, &ack.protected_raw, &ack.encrypted_raw),
                );
            }
            _ => trace!(pub_id = %ack.header.pub_id, "no route for acknowledgement"),
        }
        Ok(())
    }

    /// Emit an acknowledgement for a delivered publication.
    pub fn ack_publication(
        &mut self,
        info: &PublicationInfo,
        payload: &[u8],
        effects: &mut Effects,
    ) -> Result<()> {
        if !info.ack_requested {
            return Err(Error::InvalidArgs);
        }
        let header = msg::AckHeader {
            pub_id: info.pub_id,
            sequence: info.sequence,
        };
        let protected_raw = header.encode();
        let payload_map = msg::AckPayload {
            data: Bytes::copy_from_slice(payload),
        }
        .encode();
        let nonce = msg::make_nonce(&info.pub_id, info.sequence, MsgType::Ack);
        let encrypted_raw = match &info.ack_framing {
            AckFraming::Plain => payload_map,
            AckFraming::Psk(kid) => cose::encrypt(
                cose::ALG_A256GCM,
                &nonce,
                None,
                &[Entity::new(cose::ALG_RESERVED, kid.clone())],
                &protected_raw,
                &payload_map,
                self.key_store.as_ref(),
            )?,
            AckFraming::Ecdh(kid) => {
                match cose::encrypt(
                    cose::ALG_A256GCM,
                    &nonce,
                    None,
                    &[Entity::new(cose::ALG_ECDH_ES_A256KW, kid.clone())],
                    &protected_raw,
                    &payload_map,
                    self.key_store.as_ref(),
                ) {
                    Ok(framed) => framed,
                    // Without the publisher's key the ack still travels
                    Err(Error::Missing(_)) => payload_map,
                    Err(err) => return Err(err),
                }
            }
        };
        match info.ack_to {
            Some(next) => {
                trace!(pub_id = %info.pub_id, %next, "sending acknowledgement");
                effects.send(
                    next,
                    msg::encode_ack(self.port, &protected_raw, &encrypted_raw),
                );
                Ok(())
            }
            None => {
                // The publication originated here; deliver directly
                let ack = AckMessage {
                    port: self.port,
                    header,
                    protected_raw,
                    encrypted_raw,
                };
                self.on_ack(PeerAddr::local(self.port), ack, effects)
            }
        }
    }
}
