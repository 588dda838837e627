//! Transport abstraction and the in-process network.
//!
//! The fabric core never touches sockets. A `Transport` delivers whole
//! frames to peer addresses and reports completion through a callback;
//! received frames enter the node through its `Inbox`. Address
//! resolution, connection management and multicast discovery live with
//! the transport implementation.
//!
//! `MemNetwork` is the in-process implementation: a registry of node
//! inboxes keyed by port, with an optional loss hook so tests can drop
//! selected frames.

use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use weft_core::error::{Error, Result};

/// A peer address, normalized so an IPv4-mapped IPv6 address compares
/// equal to the plain IPv4 form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddr(SocketAddr);

impl PeerAddr {
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => Self(SocketAddr::new(IpAddr::V4(v4), addr.port())),
                None => Self(addr),
            },
            IpAddr::V4(_) => Self(addr),
        }
    }

    /// The loopback address used by the in-process transport.
    #[must_use]
    pub fn local(port: u16) -> Self {
        Self(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    /// The same host with a different port. Connectionless transports
    /// report ephemeral source ports; messages carry the listening port
    /// so the peer can be keyed canonically.
    #[must_use]
    pub fn with_port(self, port: u16) -> Self {
        Self(SocketAddr::new(self.0.ip(), port))
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.0.port()
    }

    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr)
    }
}

/// Completion callback for a transport send. The frame buffer stays
/// alive until this fires.
pub type SendDone = Box<dyn FnOnce(Result<()>) + Send>;

/// Frame delivery into a node. Handed to the transport at start-up.
#[derive(Clone)]
pub struct Inbox {
    tx: flume::Sender<crate::node::LoopMsg>,
}

impl Inbox {
    pub(crate) fn new(tx: flume::Sender<crate::node::LoopMsg>) -> Self {
        Self { tx }
    }

    /// Deliver a received frame. Returns `Error::Stopping` once the
    /// node has shut down.
    pub fn deliver(&self, from: PeerAddr, frame: Bytes) -> Result<()> {
        self.tx
            .send(crate::node::LoopMsg::Frame(from, frame))
            .map_err(|_| Error::Stopping)
    }
}

/// Connection-oriented or connectionless frame delivery.
pub trait Transport: Send + Sync + 'static {
    /// The port this node is reachable on.
    fn local_port(&self) -> u16;

    /// Send one frame to `to`. `done` fires when the buffer may be
    /// released; transports report failures through it rather than the
    /// return value.
    fn send(&self, to: &PeerAddr, frame: Bytes, done: SendDone);

    /// Stop delivering frames and release the port.
    fn close(&self);
}

/// Decides whether the in-process network drops a frame:
/// `(from_port, to_port, frame)`.
pub type LossFn = Box<dyn Fn(u16, u16, &[u8]) -> bool + Send + Sync>;

struct MemNetworkInner {
    inboxes: HashMap<u16, Inbox>,
    next_port: u16,
}

/// An in-process network connecting nodes through their inboxes.
pub struct MemNetwork {
    inner: Mutex<MemNetworkInner>,
    loss: Mutex<Option<LossFn>>,
}

impl MemNetwork {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(MemNetworkInner {
                inboxes: HashMap::new(),
                next_port: 50000,
            }),
            loss: Mutex::new(None),
        })
    }

    /// Install (or clear) the frame-loss hook.
    pub fn set_loss(&self, f: Option<LossFn>) {
        *self.loss.lock() = f;
    }

    /// Open a transport on `port`, or on a fresh port when `port` is 0.
    pub fn open(
        self: &Arc<Self>,
        port: u16,
        inbox: Inbox,
    ) -> Result<Arc<dyn Transport>> {
        let mut inner = self.inner.lock();
        let port = if port == 0 {
            loop {
                let candidate = inner.next_port;
                inner.next_port = inner.next_port.wrapping_add(1).max(50000);
                if !inner.inboxes.contains_key(&candidate) {
                    break candidate;
                }
            }
        } else {
            port
        };
        if inner.inboxes.contains_key(&port) {
            return Err(Error::Exists);
        }
        inner.inboxes.insert(port, inbox);
        Ok(Arc::new(MemTransport {
            net: Arc::clone(self),
            port,
        }))
    }

    fn send_frame(&self, from: u16, to: &PeerAddr, frame: Bytes) -> Result<()> {
        if let Some(loss) = self.loss.lock().as_ref() {
            if loss(from, to.port(), &frame) {
                tracing::debug!(from, to = to.port(), "dropping frame");
                return Ok(());
            }
        }
        let inbox = self
            .inner
            .lock()
            .inboxes
            .get(&to.port())
            .cloned()
            .ok_or(Error::NoRoute)?;
        inbox.deliver(PeerAddr::local(from), frame)
    }

    fn release(&self, port: u16) {
        self.inner.lock().inboxes.remove(&port);
    }
}

struct MemTransport {
    net: Arc<MemNetwork>,
    port: u16,
}

impl Transport for MemTransport {
    fn local_port(&self) -> u16 {
        self.port
    }

    fn send(&self, to: &PeerAddr, frame: Bytes, done: SendDone) {
        let result = self.net.send_frame(self.port, to, frame);
        done(result);
    }

    fn close(&self) {
        self.net.release(self.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::LoopMsg;

    fn inbox() -> (Inbox, flume::Receiver<LoopMsg>) {
        let (tx, rx) = flume::unbounded();
        (Inbox::new(tx), rx)
    }

    fn expect_frame(rx: &flume::Receiver<LoopMsg>) -> (PeerAddr, Bytes) {
        match rx.try_recv() {
            Ok(LoopMsg::Frame(from, frame)) => (from, frame),
            _ => panic!("expected a delivered frame"),
        }
    }

    #[test]
    fn addr_normalization() {
        let v4: SocketAddr = "192.0.2.1:9000".parse().unwrap();
        let mapped: SocketAddr = "[::ffff:192.0.2.1]:9000".parse().unwrap();
        assert_eq!(PeerAddr::new(v4), PeerAddr::new(mapped));

        let v6: SocketAddr = "[2001:db8::1]:9000".parse().unwrap();
        assert_ne!(PeerAddr::new(v4), PeerAddr::new(v6));
        assert_eq!(PeerAddr::new(v4).with_port(9001).port(), 9001);
    }

    #[test]
    fn open_send_and_close() {
        let net = MemNetwork::new();
        let (receiver_inbox, rx) = inbox();
        let transport = net.open(0, receiver_inbox).unwrap();
        let port = transport.local_port();

        let (sender_inbox, _rx2) = inbox();
        let sender = net.open(0, sender_inbox).unwrap();

        let delivered = Arc::new(Mutex::new(None));
        let flag = Arc::clone(&delivered);
        sender.send(
            &PeerAddr::local(port),
            Bytes::from_static(b"frame"),
            Box::new(move |r| *flag.lock() = Some(r)),
        );
        assert_eq!(*delivered.lock(), Some(Ok(())));
        let (from, frame) = expect_frame(&rx);
        assert_eq!(from.port(), sender.local_port());
        assert_eq!(frame.as_ref(), b"frame");

        transport.close();
        let gone = Arc::new(Mutex::new(None));
        let flag = Arc::clone(&gone);
        sender.send(
            &PeerAddr::local(port),
            Bytes::from_static(b"frame"),
            Box::new(move |r| *flag.lock() = Some(r)),
        );
        assert_eq!(*gone.lock(), Some(Err(Error::NoRoute)));
    }

    #[test]
    fn duplicate_port_is_rejected() {
        let net = MemNetwork::new();
        let (a, _rx_a) = inbox();
        let (b, _rx_b) = inbox();
        net.open(60000, a).unwrap();
        assert!(matches!(net.open(60000, b), Err(Error::Exists)));
    }

    #[test]
    fn loss_hook_drops_selected_frames() {
        let net = MemNetwork::new();
        let (receiver_inbox, rx) = inbox();
        let receiver = net.open(0, receiver_inbox).unwrap();
        let (sender_inbox, _rx2) = inbox();
        let sender = net.open(0, sender_inbox).unwrap();

        net.set_loss(Some(Box::new(|_, _, _| true)));
        sender.send(
            &PeerAddr::local(receiver.local_port()),
            Bytes::from_static(b"lost"),
            Box::new(|r| assert_eq!(r, Ok(()))),
        );
        assert!(rx.try_recv().is_err());

        net.set_loss(None);
        sender.send(
            &PeerAddr::local(receiver.local_port()),
            Bytes::from_static(b"kept"),
            Box::new(|r| assert_eq!(r, Ok(()))),
        );
        assert!(rx.try_recv().is_ok());
    }
}
