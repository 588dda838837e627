//! Fabric-wide configuration.
//!
//! These parameters must agree across every node participating in one
//! mesh: the Bloom geometry decides which bits a topic hashes to, so two
//! nodes with different `bit_len` or `num_hashes` cannot exchange
//! interests.

use std::time::Duration;

use crate::error::{Error, Result};

/// Default bit vector width.
pub const DEFAULT_BIT_LEN: usize = 8192;

/// Default number of Bloom hashes per topic token.
pub const DEFAULT_NUM_HASHES: u8 = 4;

/// Width of the fuzzy-hash flavor of bit vector.
pub const FUZZY_BIT_LEN: usize = 256;

/// Topic separator characters recognized by default.
pub const DEFAULT_SEPARATORS: &str = "/.";

/// Configuration for monitoring a muted link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkMonitorConfig {
    /// Delay before the first probe after a link mutes.
    pub probe_spacing: Duration,
    /// Interval between subsequent probes.
    pub probe_period: Duration,
    /// Consecutive unanswered probes before the peer is declared lost.
    pub max_probes_lost: u8,
}

impl Default for LinkMonitorConfig {
    fn default() -> Self {
        Self {
            probe_spacing: Duration::from_millis(40),
            probe_period: Duration::from_millis(2000),
            max_probes_lost: 3,
        }
    }
}

/// Fabric configuration.
///
/// ```
/// use weft_core::config::FabricConfig;
///
/// let cfg = FabricConfig::default()
///     .with_bit_len(4096)
///     .with_num_hashes(3);
/// cfg.validate().unwrap();
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FabricConfig {
    /// Bit vector width in bits; must be a multiple of 64.
    pub bit_len: usize,

    /// Bloom hashes per token, 1..=16.
    pub num_hashes: u8,

    /// Characters that separate topic segments.
    pub separators: String,

    /// Debounce window for outbound subscription updates. Changes inside
    /// the window coalesce into one SUB per peer.
    pub subs_rate: Duration,

    /// Muted-link monitoring parameters.
    pub link_monitor: LinkMonitorConfig,

    /// Retransmissions of an unacknowledged SUB before the peer is
    /// declared unreachable.
    pub max_sub_retries: u8,

    /// Topic strings longer than this are truncated.
    pub max_topic_len: usize,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            bit_len: DEFAULT_BIT_LEN,
            num_hashes: DEFAULT_NUM_HASHES,
            separators: DEFAULT_SEPARATORS.to_string(),
            subs_rate: Duration::from_millis(1000),
            link_monitor: LinkMonitorConfig::default(),
            max_sub_retries: 8,
            max_topic_len: 2048,
        }
    }
}

impl FabricConfig {
    /// Set the bit vector width.
    #[must_use]
    pub fn with_bit_len(mut self, bit_len: usize) -> Self {
        self.bit_len = bit_len;
        self
    }

    /// Set the Bloom hash count.
    #[must_use]
    pub fn with_num_hashes(mut self, num_hashes: u8) -> Self {
        self.num_hashes = num_hashes;
        self
    }

    /// Set the topic separator characters.
    #[must_use]
    pub fn with_separators(mut self, separators: impl Into<String>) -> Self {
        self.separators = separators.into();
        self
    }

    /// Set the subscription update debounce window.
    #[must_use]
    pub fn with_subs_rate(mut self, subs_rate: Duration) -> Self {
        self.subs_rate = subs_rate;
        self
    }

    /// Set the muted-link monitor parameters.
    #[must_use]
    pub fn with_link_monitor(mut self, link_monitor: LinkMonitorConfig) -> Self {
        self.link_monitor = link_monitor;
        self
    }

    /// Set the SUB retransmission limit.
    #[must_use]
    pub fn with_max_sub_retries(mut self, max_sub_retries: u8) -> Self {
        self.max_sub_retries = max_sub_retries;
        self
    }

    /// Check the configuration for values the fabric cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.bit_len == 0 || self.bit_len % 64 != 0 {
            return Err(Error::InvalidArgs);
        }
        if self.num_hashes < 1 || self.num_hashes > 16 {
            return Err(Error::InvalidArgs);
        }
        if self.separators.is_empty() || self.max_topic_len == 0 {
            return Err(Error::InvalidArgs);
        }
        if self.link_monitor.max_probes_lost == 0 {
            return Err(Error::InvalidArgs);
        }
        Ok(())
    }
}
