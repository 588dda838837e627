//! Muted link monitoring.
//!
//! A muted link carries no subscriptions or publications, so a silent
//! partner is indistinguishable from a dead one. While a link is muted
//! the node periodically publishes a probe across it; any traffic from
//! the peer counts as life. After enough silent probe intervals the
//! peer is treated as lost: the monitor stops, the peer is dropped, and
//! muted alternates are unmuted so connectivity recovers over the
//! redundant path. Ordinarily publications are not permitted on a muted
//! link; the probe is the deliberate exception.

use std::time::Instant;
use tracing::{debug, trace, warn};

use bytes::Bytes;
use weft_core::error::{Error, Result};

use weft_proto::msg::{self, PubHeader, PubPayload};

use weft_core::bitvec::BitVector;
use weft_core::topic::{self, TopicRole};

use crate::node::{Effects, NodeState, TimerKind};
use crate::peer::Monitor;
use crate::transport::PeerAddr;

/// Reserved topic probes are published on.
pub(crate) const PROBE_TOPIC: &str = "$weft/probe";

impl NodeState {
    /// Begin monitoring a muted link.
    pub fn start_monitor(&mut self, addr: PeerAddr, effects: &mut Effects) {
        let spacing = self.config.link_monitor.probe_spacing;
        let Some(peer) = self.peers.lookup_mut(&addr) else {
            return;
        };
        if peer.monitor.is_some() {
            return;
        }
        debug!(peer = %addr, "link monitor started");
        peer.monitor = Some(Monitor::default());
        self.schedule(Instant::now() + spacing, TimerKind::Monitor(addr), effects);
    }

    /// Stop monitoring; the timer entry is discarded as well.
    pub fn stop_monitor(&mut self, addr: &PeerAddr) {
        if let Some(peer) = self.peers.lookup_mut(addr) {
            if peer.monitor.take().is_some() {
                debug!(peer = %addr, "link monitor stopped");
            }
        }
        self.cancel_monitor_timer(addr);
    }

    /// One probe interval elapsed.
    pub fn on_monitor_tick(&mut self, addr: PeerAddr, effects: &mut Effects) {
        let period = self.config.link_monitor.probe_period;
        let max_lost = self.config.link_monitor.max_probes_lost;
        let lost = {
            let Some(peer) = self.peers.lookup_mut(&addr) else {
                return;
            };
            let Some(monitor) = peer.monitor.as_mut() else {
                return;
            };
            if monitor.probe_received {
                monitor.probe_received = false;
                monitor.probes_lost = 0;
                false
            } else {
                monitor.probes_lost += 1;
                trace!(peer = %addr, lost = monitor.probes_lost, "probe unanswered");
                monitor.probes_lost >= max_lost
            }
        };
        if lost {
            warn!(peer = %addr, "muted peer lost, restoring alternate paths");
            self.delete_peer(&addr, Err(Error::Timeout), effects);
            self.unmute_alternates(effects);
            self.update_subs(effects);
            return;
        }
        if let Some(monitor) = self
            .peers
            .lookup_mut(&addr)
            .and_then(|peer| peer.monitor.as_mut())
        {
            monitor.probe_seq += 1;
        }
        match self.encode_probe(&addr) {
            Ok(frame) => effects.send(addr, frame),
            Err(err) => warn!(peer = %addr, %err, "probe encoding failed"),
        }
        self.schedule(Instant::now() + period, TimerKind::Monitor(addr), effects);
    }

    /// A minimal transient publication on the reserved probe topic,
    /// sent straight across the muted link.
    fn encode_probe(&self, addr: &PeerAddr) -> Result<Bytes> {
        let peer = self.peers.lookup(addr).ok_or(Error::Missing("peer"))?;
        let monitor = peer.monitor.as_ref().ok_or(Error::Missing("monitor"))?;
        let mut bloom = BitVector::new(self.config.bit_len);
        topic::add_topic(
            &mut bloom,
            PROBE_TOPIC,
            &self.config.separators,
            TopicRole::Publisher,
            self.config.num_hashes,
        )?;
        let header = PubHeader {
            ttl: 0,
            pub_id: monitor.probe_id,
            sequence: monitor.probe_seq,
            ack_requested: false,
            bloom,
            sender_id: None,
            recipients: Vec::new(),
        };
        let payload = PubPayload {
            topics: vec![PROBE_TOPIC.to_string()],
            data: Bytes::new(),
        };
        Ok(msg::encode_pub(
            self.port,
            0,
            &header.encode(),
            &payload.encode(),
        ))
    }
}
