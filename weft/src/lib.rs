//! Weft
//!
//! A content-based publish/subscribe fabric. Nodes form an arbitrary
//! overlay mesh and route publications by topic filter rather than by
//! address: subscriptions become Bloom-filter bit vectors, neighbors
//! exchange aggregated filters, and a publication travels every edge
//! whose filter covers it. Wildcard subscriptions, retained
//! publications, end-to-end encrypted payloads and acknowledgements are
//! built in; loop control keeps arbitrary meshes from echoing traffic.
//!
//! ```no_run
//! use weft::{MemNetwork, NodeBuilder};
//!
//! # fn main() -> weft::Result<()> {
//! let net = MemNetwork::new();
//! let sub_node = NodeBuilder::new().start_mem(&net)?;
//! let pub_node = NodeBuilder::new().start_mem(&net)?;
//! pub_node.link(sub_node.addr())?;
//!
//! let _sub = sub_node.subscribe(&["sensor/+/temp"], |info, payload| {
//!     println!("{:?}: {payload:?}", info.topics);
//! })?;
//!
//! let publication = pub_node.publication(&["sensor/3/temp"]).create()?;
//! publication.publish(b"21.5", 0)?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

mod history;
mod linkmon;
mod peer;
mod publication;
mod sub;

pub mod node;
pub mod transport;

pub use node::{
    AckHandler, Node, NodeBuilder, Publication, PublicationBuilder, PublicationHandler,
    PublicationInfo, Subscription,
};
pub use transport::{Inbox, LossFn, MemNetwork, PeerAddr, SendDone, Transport};

pub use weft_core::config::{FabricConfig, LinkMonitorConfig};
pub use weft_core::error::{Error, Result};
pub use weft_core::uuid::Uuid;

pub use weft_proto::cose::Entity;
pub use weft_proto::cose::{ALG_A256KW, ALG_DIRECT, ALG_ECDH_ES_A256KW, ALG_ES384, ALG_ES512, ALG_RESERVED};
pub use weft_proto::keystore::{
    generate_ec_key, public_half, EcCurve, EcKey, EphemeralRequest, Key, KeyId, KeyStore,
    MemoryKeyStore,
};
