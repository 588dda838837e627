//! Remote peer records and the peer table.
//!
//! For every linked peer the node tracks two directions of interest
//! state. Inbound is what the peer has told us it wants; its filter is
//! added into the node aggregates. Outbound is what we last advertised
//! to the peer, with the revision counter, retransmission countdown and
//! delta bookkeeping of the subscription exchange.
//!
//! `PeerTable` owns the records, keyed by canonical address, and the
//! record-level state transitions: add, lookup, delete, mute, unmute,
//! interest clearing and link completion. Protocol orchestration - what
//! to send when a record changes, and the aggregate count-vector
//! bookkeeping - lives with the subscription engine.

use hashbrown::hash_map::Entry;
use hashbrown::HashMap;

use weft_core::bitvec::BitVector;
use weft_core::error::{Error, Result};
use weft_core::uuid::Uuid;

use crate::transport::PeerAddr;

/// Completion for a pending `link` request.
pub type LinkCompletion = flume::Sender<Result<()>>;

/// Interest state received from the peer.
#[derive(Debug, Default)]
pub struct Inbound {
    /// Highest revision accepted; only ever increases.
    pub revision: u32,
    pub interests: Option<BitVector>,
    pub needs: Option<BitVector>,
    pub mesh_id: Option<Uuid>,
    /// The peer told us it muted this link.
    pub muted: bool,
}

/// Interest state advertised to the peer.
#[derive(Debug)]
pub struct Outbound {
    /// Bumped only when the advertised state actually changes.
    pub revision: u32,
    pub interests: Option<BitVector>,
    /// XOR against the previous revision, shipped when `delta_ind`.
    pub delta: Option<BitVector>,
    pub needs: Option<BitVector>,
    pub mesh_id: Uuid,
    pub muted: bool,
    pub delta_ind: bool,
    /// The peer has not acknowledged our current state, so SAKs we send
    /// re-include the full subscription.
    pub include_sub: bool,
    /// A SUB is in flight awaiting acknowledgement.
    pub sub_pending: bool,
    /// Remaining send attempts before the peer is declared unreachable;
    /// zeroed by a matching SAK.
    pub ack_countdown: u8,
    /// An unlink is being sent; no further interest updates.
    pub unlink: bool,
}

impl Default for Outbound {
    fn default() -> Self {
        Self {
            revision: 0,
            interests: None,
            delta: None,
            needs: None,
            mesh_id: Uuid::MAX,
            muted: false,
            delta_ind: false,
            include_sub: false,
            sub_pending: false,
            ack_countdown: 0,
            unlink: false,
        }
    }
}

/// Muted-link monitor state.
#[derive(Debug)]
pub struct Monitor {
    /// Consecutive probe intervals with no traffic from the peer.
    pub probes_lost: u8,
    /// Traffic arrived since the last probe tick.
    pub probe_received: bool,
    /// Identifier of this monitor's probe publication series.
    pub probe_id: Uuid,
    /// Sequence of the last probe sent.
    pub probe_seq: u32,
}

impl Default for Monitor {
    fn default() -> Self {
        Self {
            probes_lost: 0,
            probe_received: false,
            probe_id: Uuid::generate(),
            probe_seq: 0,
        }
    }
}

/// One linked remote peer.
pub struct RemotePeer {
    pub addr: PeerAddr,
    pub inbound: Inbound,
    pub outbound: Outbound,
    pub monitor: Option<Monitor>,
    pub completion: Option<LinkCompletion>,
}

impl RemotePeer {
    #[must_use]
    pub fn new(addr: PeerAddr) -> Self {
        Self {
            addr,
            inbound: Inbound::default(),
            outbound: Outbound::default(),
            monitor: None,
            completion: None,
        }
    }

    /// Fire a pending link completion, if any.
    pub fn complete_link(&mut self, status: Result<()>) {
        if let Some(completion) = self.completion.take() {
            let _ = completion.send(status);
        }
    }
}

impl std::fmt::Debug for RemotePeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotePeer")
            .field("addr", &self.addr)
            .field("inbound", &self.inbound)
            .field("outbound", &self.outbound)
            .field("monitored", &self.monitor.is_some())
            .finish()
    }
}

/// The set of linked peers, keyed by family-normalized address.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<PeerAddr, RemotePeer>,
}

impl PeerTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
        }
    }

    /// Insert a fresh record for `addr`.
    pub fn add(&mut self, addr: PeerAddr) -> Result<&mut RemotePeer> {
        match self.peers.entry(addr) {
            Entry::Occupied(_) => Err(Error::Exists),
            Entry::Vacant(slot) => Ok(slot.insert(RemotePeer::new(addr))),
        }
    }

    #[must_use]
    pub fn lookup(&self, addr: &PeerAddr) -> Option<&RemotePeer> {
        self.peers.get(addr)
    }

    #[must_use]
    pub fn lookup_mut(&mut self, addr: &PeerAddr) -> Option<&mut RemotePeer> {
        self.peers.get_mut(addr)
    }

    #[must_use]
    pub fn contains(&self, addr: &PeerAddr) -> bool {
        self.peers.contains_key(addr)
    }

    /// Remove the record and hand it back; the caller withdraws its
    /// inbound filters from the aggregates and completes any pending
    /// link wait.
    pub fn delete(&mut self, addr: &PeerAddr) -> Option<RemotePeer> {
        self.peers.remove(addr)
    }

    /// Mark the link muted. The muted side advertises the maximum mesh
    /// identifier so it can never win a minimum.
    pub fn mute(&mut self, addr: &PeerAddr) -> Result<()> {
        let peer = self.peers.get_mut(addr).ok_or(Error::Missing("peer"))?;
        peer.outbound.muted = true;
        peer.outbound.mesh_id = Uuid::MAX;
        Ok(())
    }

    /// Clear both muted flags.
    pub fn unmute(&mut self, addr: &PeerAddr) -> Result<()> {
        let peer = self.peers.get_mut(addr).ok_or(Error::Missing("peer"))?;
        peer.outbound.muted = false;
        peer.inbound.muted = false;
        Ok(())
    }

    /// Take the peer's inbound filters out of the record. The caller
    /// removes the returned vectors from the node aggregates.
    pub fn clear_inbound_interests(
        &mut self,
        addr: &PeerAddr,
    ) -> (Option<BitVector>, Option<BitVector>) {
        match self.peers.get_mut(addr) {
            Some(peer) => (peer.inbound.interests.take(), peer.inbound.needs.take()),
            None => (None, None),
        }
    }

    /// Forget what has been advertised so the next update sends a full
    /// filter.
    pub fn clear_outbound_interests(&mut self, addr: &PeerAddr) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.outbound.interests = None;
            peer.outbound.delta = None;
            peer.outbound.delta_ind = false;
        }
    }

    /// Fire a pending link completion for `addr`, if any.
    pub fn complete_link(&mut self, addr: &PeerAddr, status: Result<()>) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.complete_link(status);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerAddr, &RemotePeer)> {
        self.peers.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &RemotePeer> {
        self.peers.values()
    }

    /// Snapshot of the linked addresses, for walks that mutate records.
    #[must_use]
    pub fn addrs(&self) -> Vec<PeerAddr> {
        self.peers.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(token: &str) -> BitVector {
        let mut bv = BitVector::new(256);
        bv.bloom_insert(token.as_bytes(), 4);
        bv
    }

    #[test]
    fn add_rejects_duplicates() {
        let mut table = PeerTable::new();
        let addr = PeerAddr::local(9000);
        assert!(table.add(addr).is_ok());
        assert_eq!(table.add(addr).err(), Some(Error::Exists));
        assert!(table.contains(&addr));
        assert!(table.delete(&addr).is_some());
        assert!(table.lookup(&addr).is_none());
    }

    #[test]
    fn mute_and_unmute_transition_flags() {
        let mut table = PeerTable::new();
        let addr = PeerAddr::local(9001);
        table.add(addr).unwrap();

        table.mute(&addr).unwrap();
        let peer = table.lookup(&addr).unwrap();
        assert!(peer.outbound.muted);
        assert_eq!(peer.outbound.mesh_id, Uuid::MAX);

        table.lookup_mut(&addr).unwrap().inbound.muted = true;
        table.unmute(&addr).unwrap();
        let peer = table.lookup(&addr).unwrap();
        assert!(!peer.outbound.muted);
        assert!(!peer.inbound.muted);

        let gone = PeerAddr::local(1);
        assert_eq!(table.mute(&gone).err(), Some(Error::Missing("peer")));
    }

    #[test]
    fn clearing_inbound_hands_filters_back() {
        let mut table = PeerTable::new();
        let addr = PeerAddr::local(9002);
        table.add(addr).unwrap();
        let bv = filter("a/b");
        {
            let peer = table.lookup_mut(&addr).unwrap();
            peer.inbound.interests = Some(bv.clone());
            peer.inbound.needs = Some(bv.fuzzy_hash());
        }
        let (interests, needs) = table.clear_inbound_interests(&addr);
        assert_eq!(interests, Some(bv));
        assert!(needs.is_some());
        // The record is empty afterwards
        let (interests, needs) = table.clear_inbound_interests(&addr);
        assert!(interests.is_none() && needs.is_none());
    }

    #[test]
    fn link_completion_fires_once() {
        let mut table = PeerTable::new();
        let addr = PeerAddr::local(9003);
        table.add(addr).unwrap();
        let (tx, rx) = flume::bounded(1);
        table.lookup_mut(&addr).unwrap().completion = Some(tx);

        table.complete_link(&addr, Ok(()));
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));
        // A second completion is a no-op
        table.complete_link(&addr, Err(Error::Timeout));
        assert!(rx.try_recv().is_err());
    }
}
