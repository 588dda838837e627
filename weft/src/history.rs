//! Publication history for duplicate suppression and ack routing.
//!
//! In a mesh the same publication can arrive over several edges.
//! Seeing a `(pub-id, sequence)` pair again is not an error, it just
//! must not be re-forwarded. The entry also remembers which peer the
//! publication arrived from, which is the next hop for routing an
//! acknowledgement back toward the publisher.

use hashbrown::HashMap;
use std::collections::VecDeque;

use weft_core::uuid::Uuid;

use crate::transport::PeerAddr;

/// Default bound on tracked publications.
pub const HISTORY_CAP: usize = 256;

#[derive(Debug, Clone, Copy)]
struct Entry {
    sequence: u32,
    from: Option<PeerAddr>,
}

/// Bounded `(pub-id, sequence)` history, FIFO-evicted.
#[derive(Debug)]
pub struct History {
    entries: HashMap<Uuid, Entry>,
    order: VecDeque<Uuid>,
    cap: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::new(HISTORY_CAP)
    }
}

impl History {
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(cap),
            order: VecDeque::with_capacity(cap),
            cap: cap.max(1),
        }
    }

    /// True when this `(pub-id, sequence)` has been seen already.
    #[must_use]
    pub fn is_duplicate(&self, pub_id: &Uuid, sequence: u32) -> bool {
        self.entries
            .get(pub_id)
            .is_some_and(|entry| sequence <= entry.sequence)
    }

    /// Record a sighting. A newer sequence replaces the stored entry.
    pub fn record(&mut self, pub_id: Uuid, sequence: u32, from: Option<PeerAddr>) {
        if let Some(entry) = self.entries.get_mut(&pub_id) {
            if sequence > entry.sequence {
                entry.sequence = sequence;
                entry.from = from;
            }
            return;
        }
        if self.entries.len() == self.cap {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
        self.entries.insert(pub_id, Entry { sequence, from });
        self.order.push_back(pub_id);
    }

    /// The peer a publication arrived from, for ack back-routing.
    #[must_use]
    pub fn source(&self, pub_id: &Uuid) -> Option<PeerAddr> {
        self.entries.get(pub_id).and_then(|entry| entry.from)
    }

    /// Forget everything that arrived from `addr`. Called when a peer
    /// is deleted so acks are not routed into a dead link.
    pub fn forget_source(&mut self, addr: &PeerAddr) {
        for entry in self.entries.values_mut() {
            if entry.from == Some(*addr) {
                entry.from = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicates_are_detected_per_sequence() {
        let mut history = History::new(8);
        let id = Uuid::generate();
        assert!(!history.is_duplicate(&id, 1));
        history.record(id, 1, None);
        assert!(history.is_duplicate(&id, 1));
        assert!(!history.is_duplicate(&id, 2));
        history.record(id, 2, None);
        assert!(history.is_duplicate(&id, 1));
        assert!(history.is_duplicate(&id, 2));
    }

    #[test]
    fn older_sequences_do_not_replace() {
        let mut history = History::new(8);
        let id = Uuid::generate();
        let a = PeerAddr::local(1);
        let b = PeerAddr::local(2);
        history.record(id, 5, Some(a));
        history.record(id, 3, Some(b));
        assert_eq!(history.source(&id), Some(a));
    }

    #[test]
    fn eviction_is_fifo() {
        let mut history = History::new(2);
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::generate()).collect();
        for id in &ids {
            history.record(*id, 1, None);
        }
        assert!(!history.is_duplicate(&ids[0], 1));
        assert!(history.is_duplicate(&ids[1], 1));
        assert!(history.is_duplicate(&ids[2], 1));
    }

    #[test]
    fn forget_source_clears_routing_only() {
        let mut history = History::new(8);
        let id = Uuid::generate();
        let addr = PeerAddr::local(9);
        history.record(id, 1, Some(addr));
        history.forget_source(&addr);
        assert_eq!(history.source(&id), None);
        assert!(history.is_duplicate(&id, 1));
    }
}
