//! Subscription engine.
//!
//! Local subscriptions and peer inbound filters aggregate into two
//! count vectors: `interests` (union of Bloom filters) and `needs`
//! (intersection of fuzzy hashes). The filter advertised to a peer is
//! the aggregate minus that peer's own contribution, so interests never
//! reflect back across the link they came from.
//!
//! The SUB/SAK exchange is reliable: a revision advances only when the
//! advertised state changes, every unacknowledged revision is resent on
//! the debounce tick, and a peer that never acknowledges is declared
//! unreachable. Mesh identifiers ride along with every SUB; a node that
//! sees the same minimum identifier arrive over a second edge mutes the
//! link to keep the mesh loop-free.
//!
//! Record-level peer state lives in [`crate::peer::PeerTable`]; this
//! module drives the protocol around it and keeps the node aggregates
//! consistent with the records.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

use weft_core::bitvec::BitVector;
use weft_core::error::{Error, Result};
use weft_core::topic::{self, TopicRole};
use weft_core::uuid::Uuid;

use weft_proto::msg::{
    SakMessage, SubBody, SubMessage, SUB_FLAG_DELTA_IND, SUB_FLAG_MUTE_IND,
};

use crate::node::{Effects, NodeState, PublicationHandler, TimerKind};
use crate::peer::{LinkCompletion, RemotePeer};
use crate::transport::PeerAddr;

/// One local subscription and its filter contributions.
pub(crate) struct LocalSub {
    pub id: u64,
    pub topics: Vec<String>,
    pub bloom: BitVector,
    pub needs: BitVector,
    pub handler: Arc<PublicationHandler>,
}

/// Truncate a topic to the configured limit on a character boundary.
pub(crate) fn clip_topic(topic: &str, max_len: usize) -> &str {
    if topic.len() <= max_len {
        return topic;
    }
    let mut end = max_len;
    while end > 0 && !topic.is_char_boundary(end) {
        end -= 1;
    }
    &topic[..end]
}

impl NodeState {
    pub fn create_subscription(
        &mut self,
        topics: &[&str],
        handler: Arc<PublicationHandler>,
        effects: &mut Effects,
    ) -> Result<u64> {
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
                TopicRole::Subscriber,
                self.config.num_hashes,
            )?;
        }
        let needs = bloom.fuzzy_hash();
        self.interests.add(&bloom)?;
        self.needs.add(&needs)?;
        let id = self.next_id();
        debug!(id, ?topics, "subscribing");
        self.subs.insert(
            id,
            LocalSub {
                id,
                topics,
                bloom,
                needs,
                handler,
            },
        );
        // A retained publication the fabric already holds may match the
        // new subscription
        self.deliver_retained(id, effects);
        self.update_subs(effects);
        Ok(id)
    }

    pub fn destroy_subscription(&mut self, id: u64, effects: &mut Effects) -> Result<()> {
        let sub = self.subs.remove(&id).ok_or(Error::Missing("subscription"))?;
        self.interests.del(&sub.bloom)?;
        self.needs.del(&sub.needs)?;
        debug!(id, "unsubscribed");
        self.update_subs(effects);
        Ok(())
    }

    /// Schedule the debounced subscription propagation tick.
    pub fn update_subs(&mut self, effects: &mut Effects) {
        if self.stopping || self.subs_scheduled {
            return;
        }
        self.subs_scheduled = true;
        let at = Instant::now() + self.config.subs_rate;
        self.schedule(at, TimerKind::Subs, effects);
    }

    /// The debounce tick: refresh every peer's outbound state, send
    /// changed or unacknowledged subscriptions, and keep ticking while
    /// acknowledgements are outstanding.
    pub fn on_subs_tick(&mut self, effects: &mut Effects) {
        self.subs_scheduled = false;
        for addr in self.peers.addrs() {
            // Failed only once a send has driven the countdown to zero
            // with no acknowledgement, so the peer gets the full
            // 1 + max_sub_retries attempts
            let exhausted = self.peers.lookup(&addr).is_some_and(|peer| {
                peer.outbound.sub_pending && peer.outbound.ack_countdown == 0
            });
            if exhausted {
                warn!(peer = %addr, "subscription retries exhausted, dropping peer");
                self.delete_peer(&addr, Err(Error::Timeout), effects);
                self.unmute_alternates(effects);
                continue;
            }
            let changed = self.update_outbound(&addr);
            let Some(peer) = self.peers.lookup(&addr) else {
                continue;
            };
            if peer.outbound.unlink {
                continue;
            }
            if changed || peer.outbound.include_sub || peer.outbound.sub_pending {
                self.send_sub(&addr, effects);
            }
        }
        if self.peers.values().any(|peer| peer.outbound.sub_pending) {
            self.update_subs(effects);
        }
    }

    /// The mesh identifier to advertise to `exclude`: the minimum of
    /// our own and every other live peer's, or the maximum sentinel on
    /// a muted link so it can never win a minimum.
    fn outbound_mesh_id(&self, exclude: &PeerAddr) -> Uuid {
        if self
            .peers
            .lookup(exclude)
            .is_some_and(|peer| peer.outbound.muted)
        {
            return Uuid::MAX;
        }
        let mut min = self.mesh_id;
        for (addr, peer) in self.peers.iter() {
            if addr == exclude || peer.outbound.muted || peer.inbound.muted {
                continue;
            }
            if let Some(mesh_id) = peer.inbound.mesh_id {
                min = min.min(mesh_id);
            }
        }
        min
    }

    /// A loop exists when a mesh identifier we already carry arrives
    /// over a different edge: our own identifier returning, or another
    /// peer's minimum converging over two paths.
    fn mesh_has_loop(&self, from: &PeerAddr, mesh_id: &Uuid) -> bool {
        if *mesh_id == self.mesh_id {
            return true;
        }
        self.peers.iter().any(|(addr, peer)| {
            addr != from && !peer.outbound.muted && peer.inbound.mesh_id == Some(*mesh_id)
        })
    }

    /// Recompute the filter advertised to one peer. Returns true when
    /// the advertised state changed (which advances the revision).
    pub fn update_outbound(&mut self, addr: &PeerAddr) -> bool {
        let mesh_id = self.outbound_mesh_id(addr);
        let Some(peer) = self.peers.lookup(addr) else {
            return false;
        };
        let (interests, needs) = if peer.outbound.muted {
            (BitVector::new(self.config.bit_len), BitVector::new_fuzzy())
        } else {
            match (&peer.inbound.interests, &peer.inbound.needs) {
                (Some(in_interests), Some(in_needs)) => {
                    // Subtract the peer's own contribution from the
                    // aggregates, then restore it
                    let in_interests = in_interests.clone();
                    let in_needs = in_needs.clone();
                    let _ = self.interests.del(&in_interests);
                    let _ = self.needs.del(&in_needs);
                    let union = self.interests.to_union();
                    let needs = self.needs.to_intersection();
                    let _ = self.interests.add(&in_interests);
                    let _ = self.needs.add(&in_needs);
                    (union, needs)
                }
                _ => (self.interests.to_union(), self.needs.to_intersection()),
            }
        };
        let Some(peer) = self.peers.lookup_mut(addr) else {
            return false;
        };
        let changed = match &peer.outbound.interests {
            None => {
                peer.outbound.delta = None;
                peer.outbound.delta_ind = false;
                true
            }
            Some(previous) => {
                let mut delta = interests.clone();
                let unchanged =
                    delta.xor_with(previous) && peer.outbound.needs.as_ref() == Some(&needs);
                if unchanged {
                    false
                } else {
                    peer.outbound.delta = Some(delta);
                    peer.outbound.delta_ind = true;
                    true
                }
            }
        };
        let mesh_changed = peer.outbound.mesh_id != mesh_id;
        peer.outbound.mesh_id = mesh_id;
        if changed || mesh_changed {
            peer.outbound.revision += 1;
            peer.outbound.interests = Some(interests);
            peer.outbound.needs = Some(needs);
            peer.outbound.include_sub = true;
            // A new revision gets a fresh retransmission budget
            peer.outbound.sub_pending = false;
            peer.outbound.ack_countdown = 0;
            if !changed {
                // Mesh-id-only update still ships the full filter
                peer.outbound.delta = None;
                peer.outbound.delta_ind = false;
            }
            trace!(peer = %addr, revision = peer.outbound.revision, "outbound interests changed");
        }
        changed || mesh_changed
    }

    /// The interest body currently advertised to `peer`.
    fn outbound_body(&self, peer: &RemotePeer) -> SubBody {
        let interests = if peer.outbound.delta_ind {
            peer.outbound.delta.clone()
        } else {
            peer.outbound.interests.clone()
        }
        .unwrap_or_else(|| BitVector::new(self.config.bit_len));
        let needs = peer
            .outbound
            .needs
            .clone()
            .unwrap_or_else(BitVector::new_fuzzy);
        let mut flags = 0;
        if peer.outbound.delta_ind {
            flags |= SUB_FLAG_DELTA_IND;
        }
        if peer.outbound.muted {
            flags |= SUB_FLAG_MUTE_IND;
        }
        SubBody {
            flags,
            mesh_id: peer.outbound.mesh_id,
            needs,
            interests,
        }
    }

    /// Charge one send against the retransmission budget.
    fn charge_send(&mut self, addr: &PeerAddr) {
        let max_retries = self.config.max_sub_retries;
        if let Some(peer) = self.peers.lookup_mut(addr) {
            if !peer.outbound.sub_pending {
                peer.outbound.ack_countdown = 1 + max_retries;
            }
            peer.outbound.ack_countdown = peer.outbound.ack_countdown.saturating_sub(1);
            peer.outbound.sub_pending = true;
            peer.outbound.include_sub = true;
        }
    }

    /// Send the current subscription state (or an unlink) to a peer.
    pub fn send_sub(&mut self, addr: &PeerAddr, effects: &mut Effects) {
        let Some(peer) = self.peers.lookup(addr) else {
            return;
        };
        let msg = SubMessage {
            port: self.port,
            revision: peer.outbound.revision,
            body: if peer.outbound.unlink {
                None
            } else {
                Some(self.outbound_body(peer))
            },
        };
        let unlink = peer.outbound.unlink;
        trace!(peer = %addr, revision = msg.revision, unlink, "sending SUB");
        if !unlink {
            self.charge_send(addr);
        }
        effects.send(*addr, msg.encode());
    }

    /// Acknowledge `revision`, re-including the full subscription state
    /// while the peer still owes us an acknowledgement.
    fn send_sak(&mut self, addr: &PeerAddr, revision: u32, include_sub: bool, effects: &mut Effects) {
        let Some(peer) = self.peers.lookup(addr) else {
            return;
        };
        let msg = SakMessage {
            port: self.port,
            ack_revision: revision,
            sub: include_sub.then(|| (peer.outbound.revision, self.outbound_body(peer))),
        };
        trace!(peer = %addr, revision, include_sub, "sending SAK");
        if include_sub {
            self.charge_send(addr);
        }
        effects.send(*addr, msg.encode());
    }

    /// Remove a peer's inbound filters from the node aggregates.
    fn withdraw_inbound(&mut self, addr: &PeerAddr) -> Result<()> {
        let (interests, needs) = self.peers.clear_inbound_interests(addr);
        if let Some(interests) = interests {
            self.interests.del(&interests)?;
        }
        if let Some(needs) = needs {
            self.needs.del(&needs)?;
        }
        Ok(())
    }

    /// Fold a peer's new inbound filter into the node aggregates.
    fn update_inbound_interests(
        &mut self,
        addr: &PeerAddr,
        mut interests: BitVector,
        needs: BitVector,
        is_delta: bool,
    ) -> Result<()> {
        let (previous, previous_needs) = self.peers.clear_inbound_interests(addr);
        if let Some(previous) = previous {
            if is_delta {
                trace!(peer = %addr, "received interests delta");
                interests.xor_with(&previous);
            }
            self.interests.del(&previous)?;
        }
        if let Some(previous_needs) = previous_needs {
            self.needs.del(&previous_needs)?;
        }
        if !interests.is_clear() {
            self.interests.add(&interests)?;
            self.needs.add(&needs)?;
            if let Some(peer) = self.peers.lookup_mut(addr) {
                peer.inbound.interests = Some(interests);
                peer.inbound.needs = Some(needs);
            }
        }
        Ok(())
    }

    /// Process a received SUB.
    pub fn on_sub(&mut self, from: PeerAddr, msg: SubMessage, effects: &mut Effects) -> Result<()> {
        let Some(body) = msg.body else {
            // An empty subscription asks to unlink
            debug!(peer = %from, "received unlink");
            if self.peers.contains(&from) {
                self.send_sak(&from, msg.revision, false, effects);
                self.delete_peer(&from, Err(Error::Missing("peer")), effects);
                self.unmute_alternates(effects);
                self.update_subs(effects);
            }
            return Ok(());
        };

        let is_new = !self.peers.contains(&from);
        if is_new {
            debug!(peer = %from, "new peer");
            self.peers.add(from)?;
        } else {
            let stored = self
                .peers
                .lookup(&from)
                .map(|peer| (peer.inbound.revision, peer.outbound.include_sub));
            if let Some((revision, include_sub)) = stored {
                // Any revision at or below the stored one is answered
                // with a SAK and never replaces state; the peer is
                // resending because a SAK was lost
                if msg.revision < revision {
                    trace!(peer = %from, revision = msg.revision, "stale subscription");
                    self.send_sak(&from, msg.revision, false, effects);
                    return Ok(());
                }
                if msg.revision == revision {
                    self.send_sak(&from, msg.revision, include_sub, effects);
                    return Ok(());
                }
            }
        }
        if let Some(peer) = self.peers.lookup_mut(&from) {
            peer.inbound.revision = msg.revision;
        }
        trace!(peer = %from, mesh_id = %body.mesh_id, revision = msg.revision, "subscription in");

        // Loop control. Either end of a link can detect the loop; the
        // corrective action is to mute and stop exchanging interests.
        if body.flags & SUB_FLAG_MUTE_IND != 0 {
            let already_muted = self
                .peers
                .lookup(&from)
                .is_some_and(|peer| peer.outbound.muted);
            if let Some(peer) = self.peers.lookup_mut(&from) {
                peer.inbound.muted = true;
            }
            if !already_muted {
                self.mute_peer(&from, effects)?;
                self.start_monitor(from, effects);
            }
        } else if self
            .peers
            .lookup(&from)
            .is_some_and(|peer| peer.inbound.muted)
        {
            debug!(peer = %from, "peer has unmuted");
            self.unmute_peer(&from, effects)?;
        } else if self.mesh_has_loop(&from, &body.mesh_id) {
            info!(peer = %from, mesh_id = %body.mesh_id, "loop detected");
            if self
                .peers
                .lookup(&from)
                .is_some_and(|peer| !peer.outbound.muted)
            {
                self.mute_peer(&from, effects)?;
            }
        }

        if self
            .peers
            .lookup(&from)
            .is_some_and(|peer| !peer.outbound.muted)
        {
            if let Some(peer) = self.peers.lookup_mut(&from) {
                peer.inbound.mesh_id = Some(body.mesh_id);
            }
            let is_delta = body.flags & SUB_FLAG_DELTA_IND != 0;
            self.update_inbound_interests(&from, body.interests, body.needs, is_delta)?;
            // The new interests may match publications we hold
            self.forward_retained_to(&from, effects);
        }
        if body.mesh_id < self.min_mesh_id {
            self.min_mesh_id = body.mesh_id;
        }
        if is_new {
            self.update_outbound(&from);
        }
        let include_sub = self
            .peers
            .lookup(&from)
            .is_some_and(|peer| peer.outbound.include_sub);
        self.send_sak(&from, msg.revision, include_sub, effects);
        self.update_subs(effects);
        Ok(())
    }

    /// Process a received SAK.
    pub fn on_sak(&mut self, from: PeerAddr, msg: SakMessage, effects: &mut Effects) -> Result<()> {
        // A SAK may piggy-back the peer's full subscription state,
        // processed exactly like a SUB
        if let Some((revision, body)) = msg.sub.clone() {
            self.on_sub(
                from,
                SubMessage {
                    port: msg.port,
                    revision,
                    body: Some(body),
                },
                effects,
            )?;
        }
        let Some(peer) = self.peers.lookup_mut(&from) else {
            return Ok(());
        };
        if peer.outbound.revision != msg.ack_revision {
            trace!(peer = %from, got = msg.ack_revision, want = peer.outbound.revision, "SAK for old revision");
            return Ok(());
        }
        peer.outbound.include_sub = false;
        peer.outbound.sub_pending = false;
        peer.outbound.ack_countdown = 0;
        if let Some(completion) = peer.completion.take() {
            effects.completions.push((completion, Ok(())));
        }
        if peer.outbound.muted && peer.monitor.is_none() {
            peer.inbound.muted = true;
            self.start_monitor(from, effects);
        }
        Ok(())
    }

    /// Mute a looping link: withdraw the peer's interests from the
    /// aggregates, clear our advertisement, and tell the peer.
    pub fn mute_peer(&mut self, addr: &PeerAddr, effects: &mut Effects) -> Result<()> {
        info!(peer = %addr, "muting link");
        self.peers.mute(addr)?;
        self.withdraw_inbound(addr)?;
        self.peers.clear_outbound_interests(addr);
        self.update_outbound(addr);
        self.send_sub(addr, effects);
        // Other peers regain the interests this link was carrying
        self.update_subs(effects);
        Ok(())
    }

    /// Unmute a link; a fresh mesh identifier flushes stale loop state.
    pub fn unmute_peer(&mut self, addr: &PeerAddr, effects: &mut Effects) -> Result<()> {
        info!(peer = %addr, "unmuting link");
        self.stop_monitor(addr);
        self.peers.unmute(addr)?;
        self.mesh_id = Uuid::generate();
        self.min_mesh_id = self.mesh_id;
        self.update_outbound(addr);
        self.send_sub(addr, effects);
        self.update_subs(effects);
        Ok(())
    }

    /// Restore connectivity over muted links after a peer loss.
    pub fn unmute_alternates(&mut self, effects: &mut Effects) {
        let muted: Vec<PeerAddr> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.outbound.muted)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in muted {
            let _ = self.unmute_peer(&addr, effects);
        }
    }

    /// Create the link state for `addr` and send the first SUB.
    pub fn link(
        &mut self,
        addr: PeerAddr,
        completion: Option<LinkCompletion>,
        effects: &mut Effects,
    ) -> Result<()> {
        if addr.port() == self.port {
            return Err(Error::InvalidArgs);
        }
        debug!(peer = %addr, "linking");
        let peer = self.peers.add(addr)?;
        peer.completion = completion;
        self.update_outbound(&addr);
        self.send_sub(&addr, effects);
        self.update_subs(effects);
        Ok(())
    }

    /// Tell the peer to forget us and drop the link state.
    pub fn unlink(&mut self, addr: PeerAddr, effects: &mut Effects) -> Result<()> {
        let Some(peer) = self.peers.lookup_mut(&addr) else {
            return Err(Error::Missing("peer"));
        };
        debug!(peer = %addr, "unlinking");
        peer.outbound.unlink = true;
        self.send_sub(&addr, effects);
        self.delete_peer(&addr, Err(Error::Stopping), effects);
        self.update_subs(effects);
        Ok(())
    }

    /// Drop all state for a peer. Its inbound interests leave the
    /// aggregates and any pending link wait completes with `status`.
    pub fn delete_peer(&mut self, addr: &PeerAddr, status: Result<()>, effects: &mut Effects) {
        self.cancel_monitor_timer(addr);
        if let Some(mut peer) = self.peers.delete(addr) {
            debug!(peer = %addr, "peer deleted");
            if let Some(interests) = peer.inbound.interests.take() {
                let _ = self.interests.del(&interests);
            }
            if let Some(needs) = peer.inbound.needs.take() {
                let _ = self.needs.del(&needs);
            }
            if let Some(completion) = peer.completion.take() {
                effects.completions.push((completion, status));
            }
        }
        self.history.forget_source(addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_topic_respects_char_boundaries() {
        assert_eq!(clip_topic("abcdef", 4), "abcd");
        assert_eq!(clip_topic("abc", 16), "abc");
        // Multi-byte char straddling the limit is dropped whole
        let s = "ab\u{00e9}cd";
        assert_eq!(clip_topic(s, 3), "ab");
    }
}
