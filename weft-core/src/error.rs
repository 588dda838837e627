/// Weft Error Types
///
/// One error taxonomy is shared by every layer of the fabric: the bit
/// vector codecs, the secure framing, and the node runtime all surface
/// the same kinds at the public boundary.

use thiserror::Error;

/// Main error type for weft operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// An argument was out of range or otherwise unusable
    #[error("Invalid arguments")]
    InvalidArgs,

    /// A resource limit was hit
    #[error("Out of resources")]
    Resources,

    /// The node has not been started
    #[error("Not started")]
    NotStarted,

    /// The node is shutting down
    #[error("Stopping")]
    Stopping,

    /// An operation did not complete in time
    #[error("Operation timed out")]
    Timeout,

    /// Payload is not a COSE object (no COSE tag)
    #[error("Not a COSE payload")]
    NotCose,

    /// AEAD or signature failure
    #[error("Security failure")]
    Security,

    /// A key, peer, or publication could not be found
    #[error("Missing: {0}")]
    Missing(&'static str),

    /// No route to the destination
    #[error("No route")]
    NoRoute,

    /// A peer address could not be resolved
    #[error("Address not resolved")]
    Unresolved,

    /// Malformed wire data
    #[error("Invalid wire data")]
    Invalid,

    /// Ran out of input while decoding
    #[error("Unexpected end of input")]
    EndOfData,

    /// A network send or receive failed
    #[error("Network error")]
    Network,

    /// An encoding would overflow its buffer
    #[error("Buffer overflow")]
    Overflow,

    /// Algorithm or feature not implemented
    #[error("Not implemented")]
    NotImplemented,

    /// The entry already exists
    #[error("Already exists")]
    Exists,

    /// Internal failure
    #[error("Failure")]
    Failure,
}

/// Result type alias for weft operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Errors that poison only the frame being processed, not the node.
    /// Receive paths log these and drop the frame.
    #[must_use]
    pub const fn is_frame_local(&self) -> bool {
        matches!(
            self,
            Self::Invalid | Self::EndOfData | Self::NotCose | Self::Security
        )
    }

    /// Errors that terminate the peer relationship but leave the node
    /// running.
    #[must_use]
    pub const fn is_peer_fatal(&self) -> bool {
        matches!(self, Self::Timeout | Self::NoRoute | Self::Network)
    }
}
