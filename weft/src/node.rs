//! Node runtime: event loop, timers, dispatch and the public handle.
//!
//! All fabric state lives in one `NodeState` guarded by a mutex. Every
//! public entry point locks it, mutates, and collects side effects -
//! frames to send, application callbacks to run, link completions -
//! which are flushed only after the lock is released. Application
//! callbacks can therefore re-enter the API freely, and a transport
//! implementation can never observe the node lock held.
//!
//! A dedicated loop thread multiplexes received frames with an
//! earliest-deadline timer heap: subscription debounce, retained
//! publication reaping, and muted-link monitor probes.

use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

use weft_core::config::FabricConfig;
use weft_core::countvec::CountVector;
use weft_core::error::{Error, Result};
use weft_core::uuid::Uuid;

use weft_proto::cose::Entity;
use weft_proto::keystore::{KeyStore, MemoryKeyStore};
use weft_proto::msg::{self, MsgType};

use crate::history::History;
use crate::peer::{LinkCompletion, PeerTable};
use crate::publication::NodePub;
use crate::sub::LocalSub;
use crate::transport::{Inbox, MemNetwork, PeerAddr, Transport};

/// Callback invoked for every publication matching a subscription.
pub type PublicationHandler = dyn Fn(&PublicationInfo, &[u8]) + Send + Sync;

/// Callback invoked when an acknowledgement reaches the publisher.
pub type AckHandler = dyn Fn(&PublicationInfo, &[u8]) + Send + Sync;

/// What a delivery or ack callback learns about the publication.
#[derive(Debug, Clone)]
pub struct PublicationInfo {
    pub pub_id: Uuid,
    pub sequence: u32,
    pub topics: Vec<String>,
    pub ack_requested: bool,
    /// Remaining time to live in seconds at the time of delivery.
    pub ttl: i16,
    /// Verified sender identity, when the framing attested one.
    pub sender: Option<Entity>,
    /// Next hop toward the publisher; `None` when it is this node.
    pub(crate) ack_to: Option<PeerAddr>,
    /// How an acknowledgement for this publication is framed.
    pub(crate) ack_framing: crate::publication::AckFraming,
}

/// Messages that wake the loop thread.
pub(crate) enum LoopMsg {
    Frame(PeerAddr, Bytes),
    /// A transport send to this peer failed.
    SendFailed(PeerAddr),
    Wake,
    Stop,
}

/// Timer kinds multiplexed on the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// Debounced subscription propagation and SUB retransmission.
    Subs,
    /// Retained publication expiry sweep.
    PubReap,
    /// Muted link probe for one peer.
    Monitor(PeerAddr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Timer {
    pub at: Instant,
    pub kind: TimerKind,
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at.cmp(&other.at)
    }
}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A deferred application callback.
pub(crate) enum Delivery {
    Publication {
        handler: Arc<PublicationHandler>,
        info: PublicationInfo,
        payload: Bytes,
    },
    Ack {
        handler: Arc<AckHandler>,
        info: PublicationInfo,
        payload: Bytes,
    },
}

/// Side effects collected while the node lock is held and run after it
/// is released.
#[derive(Default)]
pub(crate) struct Effects {
    pub frames: Vec<(PeerAddr, Bytes)>,
    pub deliveries: Vec<Delivery>,
    pub completions: Vec<(LinkCompletion, Result<()>)>,
    /// The timer heap changed; the loop must recompute its deadline.
    pub wake: bool,
}

impl Effects {
    pub fn send(&mut self, to: PeerAddr, frame: Bytes) {
        self.frames.push((to, frame));
    }
}

/// All mutable node state. Only ever touched under the node lock.
pub(crate) struct NodeState {
    pub config: FabricConfig,
    pub port: u16,
    /// This node's mesh identifier; regenerated when links unmute.
    pub mesh_id: Uuid,
    /// Minimum mesh identifier observed so far.
    pub min_mesh_id: Uuid,
    /// Aggregate of local subscription filters and peer inbound filters.
    pub interests: CountVector,
    /// Aggregate of the matching fuzzy hashes, intersected for needs.
    pub needs: CountVector,
    pub subs: HashMap<u64, LocalSub>,
    pub pubs: HashMap<u64, NodePub>,
    pub peers: PeerTable,
    pub history: History,
    pub next_id: u64,
    timers: BinaryHeap<Reverse<Timer>>,
    pub subs_scheduled: bool,
    /// Earliest scheduled retained-publication sweep.
    pub reap_at: Option<Instant>,
    pub stopping: bool,
    pub key_store: Arc<dyn KeyStore>,
    /// Identity used to counter-sign publications, when configured.
    pub signer: Option<Entity>,
}

impl NodeState {
    fn new(config: FabricConfig, port: u16, key_store: Arc<dyn KeyStore>, signer: Option<Entity>) -> Self {
        let bit_len = config.bit_len;
        let mesh_id = Uuid::generate();
        Self {
            config,
            port,
            mesh_id,
            min_mesh_id: mesh_id,
            interests: CountVector::new(bit_len),
            needs: CountVector::new_fuzzy(),
            subs: HashMap::new(),
            pubs: HashMap::new(),
            peers: PeerTable::new(),
            history: History::default(),
            next_id: 1,
            timers: BinaryHeap::new(),
            subs_scheduled: false,
            reap_at: None,
            stopping: false,
            key_store,
            signer,
        }
    }

    pub fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn schedule(&mut self, at: Instant, kind: TimerKind, effects: &mut Effects) {
        self.timers.push(Reverse(Timer { at, kind }));
        effects.wake = true;
    }

    pub fn cancel_monitor_timer(&mut self, addr: &PeerAddr) {
        let timers = std::mem::take(&mut self.timers);
        self.timers = timers
            .into_iter()
            .filter(|Reverse(t)| t.kind != TimerKind::Monitor(*addr))
            .collect();
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.peek().map(|Reverse(t)| t.at)
    }

    /// Run every timer that is due. Due timers may schedule new ones.
    fn run_due_timers(&mut self, effects: &mut Effects) {
        let now = Instant::now();
        while self
            .timers
            .peek()
            .is_some_and(|Reverse(t)| t.at <= now)
        {
            let Some(Reverse(timer)) = self.timers.pop() else {
                break;
            };
            trace!(kind = ?timer.kind, "timer fired");
            match timer.kind {
                TimerKind::Subs => self.on_subs_tick(effects),
                TimerKind::PubReap => self.on_pub_reap(effects),
                TimerKind::Monitor(addr) => self.on_monitor_tick(addr, effects),
            }
        }
    }

    /// Decode and dispatch one received frame. Wire errors are local:
    /// log, drop the frame, carry on.
    fn on_frame(&mut self, from: PeerAddr, frame: &Bytes, effects: &mut Effects) {
        if self.stopping {
            return;
        }
        let result = (|| -> Result<()> {
            let (msg_type, mut dec) = msg::decode_envelope(frame)?;
            trace!(%from, ?msg_type, len = frame.len(), "frame in");
            match msg_type {
                MsgType::Sub => {
                    let sub = msg::SubMessage::decode(&mut dec)?;
                    let peer_addr = from.with_port(sub.port);
                    self.note_traffic(&peer_addr);
                    self.on_sub(peer_addr, sub, effects)
                }
                MsgType::Sak => {
                    let sak = msg::SakMessage::decode(&mut dec)?;
                    let peer_addr = from.with_port(sak.port);
                    self.note_traffic(&peer_addr);
                    self.on_sak(peer_addr, sak, effects)
                }
                MsgType::Pub => {
                    let publication = msg::decode_pub(&mut dec)?;
                    let peer_addr = from.with_port(publication.port);
                    self.note_traffic(&peer_addr);
                    self.on_pub(peer_addr, publication, effects)
                }
                MsgType::Ack => {
                    let ack = msg::decode_ack(&mut dec)?;
                    let peer_addr = from.with_port(ack.port);
                    self.note_traffic(&peer_addr);
                    self.on_ack(peer_addr, ack, effects)
                }
            }
        })();
        if let Err(err) = result {
            warn!(%from, %err, "dropping frame");
        }
    }

    /// A send to `addr` failed. The transport could not reach the
    /// peer, which is fatal to the peer but not to the node: drop it
    /// and restore connectivity over muted alternates.
    fn on_send_failed(&mut self, addr: PeerAddr, effects: &mut Effects) {
        if self.stopping || !self.peers.contains(&addr) {
            return;
        }
        warn!(peer = %addr, "send failed, dropping peer");
        self.delete_peer(&addr, Err(Error::Network), effects);
        self.unmute_alternates(effects);
        self.update_subs(effects);
    }

    /// Any traffic from a monitored peer proves the link is alive.
    fn note_traffic(&mut self, from: &PeerAddr) {
        if let Some(peer) = self.peers.lookup_mut(from) {
            if let Some(monitor) = peer.monitor.as_mut() {
                monitor.probe_received = true;
            }
        }
    }
}

pub(crate) struct NodeInner {
    pub state: Mutex<NodeState>,
    pub loop_tx: flume::Sender<LoopMsg>,
    pub transport: Arc<dyn Transport>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl NodeInner {
    /// Flush collected side effects. Never called with the state lock
    /// held.
    pub fn flush(&self, effects: Effects) {
        for (to, frame) in effects.frames {
            let loop_tx = self.loop_tx.clone();
            self.transport.send(
                &to,
                frame,
                Box::new(move |result| {
                    if let Err(err) = result {
                        debug!(%to, %err, "send failed");
                        let _ = loop_tx.send(LoopMsg::SendFailed(to));
                    }
                }),
            );
        }
        for delivery in effects.deliveries {
            match delivery {
                Delivery::Publication {
                    handler,
                    info,
                    payload,
                } => handler(&info, &payload),
                Delivery::Ack {
                    handler,
                    info,
                    payload,
                } => handler(&info, &payload),
            }
        }
        for (completion, status) in effects.completions {
            let _ = completion.send(status);
        }
        if effects.wake {
            let _ = self.loop_tx.send(LoopMsg::Wake);
        }
    }

    /// Lock, mutate, flush.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut NodeState, &mut Effects) -> R) -> R {
        let mut effects = Effects::default();
        let out = {
            let mut state = self.state.lock();
            f(&mut state, &mut effects)
        };
        self.flush(effects);
        out
    }
}

fn run_loop(inner: &Arc<NodeInner>, rx: &flume::Receiver<LoopMsg>) {
    loop {
        let deadline = inner.state.lock().next_deadline();
        let msg = match deadline {
            Some(deadline) => match rx.recv_deadline(deadline) {
                Ok(msg) => Some(msg),
                Err(flume::RecvTimeoutError::Timeout) => None,
                Err(flume::RecvTimeoutError::Disconnected) => break,
            },
            None => match rx.recv() {
                Ok(msg) => Some(msg),
                Err(_) => break,
            },
        };
        let mut effects = Effects::default();
        {
            let mut state = inner.state.lock();
            match msg {
                Some(LoopMsg::Frame(from, frame)) => state.on_frame(from, &frame, &mut effects),
                Some(LoopMsg::SendFailed(addr)) => state.on_send_failed(addr, &mut effects),
                Some(LoopMsg::Wake) | None => {}
                Some(LoopMsg::Stop) => break,
            }
            state.run_due_timers(&mut effects);
        }
        inner.flush(effects);
    }
    trace!("node loop exited");
}

/// Builds and starts a [`Node`].
pub struct NodeBuilder {
    config: FabricConfig,
    port: u16,
    key_store: Option<Arc<dyn KeyStore>>,
    signer: Option<Entity>,
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: FabricConfig::default(),
            port: 0,
            key_store: None,
            signer: None,
        }
    }

    #[must_use]
    pub fn config(mut self, config: FabricConfig) -> Self {
        self.config = config;
        self
    }

    /// Request a specific port; 0 lets the transport choose.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn key_store(mut self, key_store: Arc<dyn KeyStore>) -> Self {
        self.key_store = Some(key_store);
        self
    }

    /// Counter-sign outgoing publications with this identity.
    #[must_use]
    pub fn signer(mut self, signer: Entity) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Start the node with a transport produced by `factory`, which
    /// receives the requested port and the node's inbox.
    pub fn start_with<F>(self, factory: F) -> Result<Node>
    where
        F: FnOnce(u16, Inbox) -> Result<Arc<dyn Transport>>,
    {
        self.config.validate()?;
        let (loop_tx, loop_rx) = flume::unbounded();
        let transport = factory(self.port, Inbox::new(loop_tx.clone()))?;
        let port = transport.local_port();
        let key_store = self
            .key_store
            .unwrap_or_else(|| Arc::new(MemoryKeyStore::new()));
        let state = NodeState::new(self.config, port, key_store, self.signer);
        let inner = Arc::new(NodeInner {
            state: Mutex::new(state),
            loop_tx,
            transport,
            thread: Mutex::new(None),
        });
        let loop_inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name(format!("weft-node-{port}"))
            .spawn(move || run_loop(&loop_inner, &loop_rx))
            .map_err(|_| Error::Resources)?;
        *inner.thread.lock() = Some(handle);
        debug!(port, "node started");
        Ok(Node { inner })
    }

    /// Start the node on an in-process network.
    pub fn start_mem(self, network: &Arc<MemNetwork>) -> Result<Node> {
        let net = Arc::clone(network);
        self.start_with(move |port, inbox| net.open(port, inbox))
    }
}

/// Handle to a running fabric node. Cheap to clone; the node stops when
/// explicitly asked to.
#[derive(Clone)]
pub struct Node {
    pub(crate) inner: Arc<NodeInner>,
}

impl Node {
    /// The port this node is reachable on.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.inner.transport.local_port()
    }

    /// This node's address as peers see it.
    #[must_use]
    pub fn addr(&self) -> PeerAddr {
        PeerAddr::local(self.port())
    }

    fn check_running(state: &NodeState) -> Result<()> {
        if state.stopping {
            return Err(Error::Stopping);
        }
        Ok(())
    }

    /// Subscribe to a set of topic patterns. The handler runs on the
    /// node loop for every matching publication.
    pub fn subscribe<F>(&self, topics: &[&str], handler: F) -> Result<Subscription>
    where
        F: Fn(&PublicationInfo, &[u8]) + Send + Sync + 'static,
    {
        let handler: Arc<PublicationHandler> = Arc::new(handler);
        let id = self.inner.with_state(|state, effects| {
            Self::check_running(state)?;
            state.create_subscription(topics, handler, effects)
        })?;
        Ok(Subscription {
            node: self.clone(),
            id,
        })
    }

    /// Start building a publication.
    #[must_use]
    pub fn publication(&self, topics: &[&str]) -> PublicationBuilder {
        PublicationBuilder {
            node: self.clone(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
            recipients: Vec::new(),
            ack_handler: None,
        }
    }

    /// Link to a peer and block until the link is acknowledged or the
    /// retransmission budget is exhausted.
    pub fn link(&self, addr: PeerAddr) -> Result<()> {
        let (tx, rx) = flume::bounded(1);
        let deadline = self.link_deadline();
        self.inner.with_state(|state, effects| {
            Self::check_running(state)?;
            state.link(addr, Some(tx), effects)
        })?;
        match rx.recv_deadline(deadline) {
            Ok(status) => status,
            Err(_) => Err(Error::Timeout),
        }
    }

    fn link_deadline(&self) -> Instant {
        let state = self.inner.state.lock();
        let per_try = state.config.subs_rate;
        let tries = u32::from(state.config.max_sub_retries) + 2;
        Instant::now() + per_try * tries + Duration::from_secs(2)
    }

    /// Ask the peer to forget this node and drop the link state.
    pub fn unlink(&self, addr: PeerAddr) -> Result<()> {
        self.inner.with_state(|state, effects| {
            Self::check_running(state)?;
            state.unlink(addr, effects)
        })
    }

    /// Acknowledge a publication delivered with `ack_requested`.
    pub fn ack(&self, info: &PublicationInfo, payload: &[u8]) -> Result<()> {
        self.inner.with_state(|state, effects| {
            Self::check_running(state)?;
            state.ack_publication(info, payload, effects)
        })
    }

    /// Stop the node: reject new work, cancel timers, close the
    /// transport and join the loop thread.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.stopping {
                return;
            }
            state.stopping = true;
            state.timers.clear();
            // Fail link waits so no caller blocks on a dead node
            for addr in state.peers.addrs() {
                state.peers.complete_link(&addr, Err(Error::Stopping));
            }
        }
        self.inner.transport.close();
        let _ = self.inner.loop_tx.send(LoopMsg::Stop);
        let handle = self.inner.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("node loop panicked");
            }
        }
        debug!(port = self.port(), "node stopped");
    }
}

/// Handle to one local subscription.
pub struct Subscription {
    node: Node,
    id: u64,
}

impl Subscription {
    /// Remove the subscription and withdraw its interest contribution.
    pub fn close(self) -> Result<()> {
        self.node.inner.with_state(|state, effects| {
            state.destroy_subscription(self.id, effects)
        })
    }

    /// The patterns this subscription was created with.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.node
            .inner
            .state
            .lock()
            .subs
            .get(&self.id)
            .map(|sub| sub.topics.clone())
            .unwrap_or_default()
    }
}

/// Configures a new publication series.
pub struct PublicationBuilder {
    node: Node,
    topics: Vec<String>,
    recipients: Vec<Entity>,
    ack_handler: Option<Arc<AckHandler>>,
}

impl PublicationBuilder {
    /// Encrypt to these recipients instead of publishing in the clear.
    #[must_use]
    pub fn recipients(mut self, recipients: Vec<Entity>) -> Self {
        self.recipients = recipients;
        self
    }

    /// Request end-to-end acknowledgements, delivered to `handler`.
    #[must_use]
    pub fn ack_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&PublicationInfo, &[u8]) + Send + Sync + 'static,
    {
        self.ack_handler = Some(Arc::new(handler));
        self
    }

    pub fn create(self) -> Result<Publication> {
        let node = self.node.clone();
        let (handle, pub_id) = node.inner.with_state(|state, _effects| {
            Node::check_running(state)?;
            state.create_publication(&self.topics, self.recipients, self.ack_handler)
        })?;
        Ok(Publication {
            node,
            handle,
            pub_id,
        })
    }
}

/// Handle to one local publication series.
pub struct Publication {
    node: Node,
    handle: u64,
    pub_id: Uuid,
}

impl Publication {
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.pub_id
    }

    /// Publish a payload. A positive `ttl` (seconds) retains the
    /// publication for late subscribers; zero is transient; negative
    /// expires the retained state.
    pub fn publish(&self, payload: &[u8], ttl: i16) -> Result<()> {
        self.node.inner.with_state(|state, effects| {
            Node::check_running(state)?;
            state.publish(self.handle, payload, ttl, effects)
        })
    }

    /// Expire the retained state now.
    pub fn expire(&self) -> Result<()> {
        self.node.inner.with_state(|state, effects| {
            state.expire_publication(self.handle, effects)
        })
    }

    /// Drop the publication series.
    pub fn close(self) -> Result<()> {
        self.node
            .inner
            .with_state(|state, _| state.destroy_publication(self.handle))
    }
}
