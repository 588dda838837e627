//! Weft Core
//!
//! This crate contains the routing primitives of the weft
//! publish/subscribe fabric, free of any wire or I/O concerns:
//! - Bit vectors, Bloom operations, RLE wire codec, fuzzy hashes (`bitvec`)
//! - Add/remove aggregation of bit vectors (`countvec`)
//! - Topic parsing and token generation (`topic`)
//! - Node / publication identifiers (`uuid`)
//! - Fabric configuration (`config`)
//! - Error types (`error`)

#![deny(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::module_name_repetitions)]

pub mod bitvec;
pub mod config;
pub mod countvec;
pub mod error;
pub mod topic;
pub mod uuid;

// A small prelude for downstream crates; kept minimal to avoid API
// lock-in.
pub mod prelude {
    pub use crate::bitvec::BitVector;
    pub use crate::config::{FabricConfig, LinkMonitorConfig};
    pub use crate::countvec::CountVector;
    pub use crate::error::{Error, Result};
    pub use crate::topic::TopicRole;
    pub use crate::uuid::Uuid;
}
