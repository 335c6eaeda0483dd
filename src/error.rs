use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors surfaced by the relay client.
///
/// Protocol-level failures (allocate rejections, lost refreshes, bad
/// integrity) are not errors in this sense: they are reported through
/// [`RelayEvent`](crate::relay::RelayEvent) signals or logged and ignored,
/// matching how the port reacts to an uncooperative server. `RelayError`
/// covers local failures the caller can act on.
#[derive(Debug, Error)]
pub enum RelayError {
    /// STUN codec errors
    #[error("STUN error: {0}")]
    Stun(#[from] StunError),

    /// Network I/O errors
    #[error("network I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Server hostname did not resolve
    #[error("failed to resolve server address {0}")]
    Resolution(String),

    /// Username or password is empty
    #[error("relay credentials missing")]
    MissingCredentials,

    /// Send to a peer address with no entry
    #[error("no entry for destination {0}")]
    UnknownDestination(SocketAddr),

    /// Channel number space exhausted
    #[error("channel numbers exhausted")]
    ChannelsExhausted,

    /// The port's event loop is gone
    #[error("relay port closed")]
    PortClosed,
}

/// STUN wire-format errors
#[derive(Debug, Error)]
pub enum StunError {
    /// Buffer shorter than a message header
    #[error("message too short: {0} bytes")]
    MessageTooShort(usize),

    /// Invalid magic cookie
    #[error("invalid magic cookie: expected 0x2112A442, got 0x{0:08X}")]
    InvalidMagicCookie(u32),

    /// Declared length does not match the buffer
    #[error("invalid message length: declared {declared}, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// Message type outside the TURN profile
    #[error("unknown message type: 0x{0:04X}")]
    UnknownMessageType(u16),

    /// Attribute value runs past the buffer
    #[error("truncated attribute 0x{0:04X}")]
    TruncatedAttribute(u16),

    /// Attribute value malformed
    #[error("failed to parse attribute 0x{attr_type:04X}: {reason}")]
    InvalidAttribute { attr_type: u16, reason: String },

    /// Address family byte is neither IPv4 nor IPv6
    #[error("invalid address family: 0x{0:02X}")]
    InvalidAddressFamily(u8),

    /// HMAC key rejected
    #[error("invalid message-integrity key")]
    InvalidKey,
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;
