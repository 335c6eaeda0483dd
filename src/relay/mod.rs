//! TURN relay client.
//!
//! A [`RelayPort`](port::RelayPort) owns one UDP socket and one server
//! allocation. It walks the allocate handshake (including the long-term
//! credential challenge), keeps the allocation refreshed, and relays
//! application data to remote peers either wrapped in Send/Data indications
//! or, once a channel is bound, in compact channel-data frames.
//!
//! Everything belonging to a port runs on its own task: entries, pending
//! requests, and timers are plain owned state, and other tasks talk to the
//! port through [`RelayHandle`](port::RelayHandle).

pub mod entry;
pub mod port;
pub mod request;

use bytes::{BufMut, BytesMut};
use std::time::Duration;

/// Default TURN server port when the configured address omits one.
pub const TURN_DEFAULT_PORT: u16 = 3478;

/// First channel number handed out to an entry.
pub const CHANNEL_NUMBER_START: u16 = 0x4000;

/// Last channel number in the valid range.
pub const CHANNEL_NUMBER_MAX: u16 = 0x7FFF;

/// Bytes in a channel-data frame header (channel number plus length).
pub const CHANNEL_HEADER_SIZE: usize = 4;

/// How long the server keeps a channel binding (and a permission) alive.
pub const PERMISSION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Margin subtracted from server lifetimes when scheduling renewals.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Allocations granted for less than this are not worth refreshing.
pub const MIN_REFRESHABLE_LIFETIME: u32 = 120;

/// REQUESTED-TRANSPORT protocol code for UDP.
pub const TRANSPORT_UDP: u8 = 17;

/// Error code of an authentication challenge.
pub const ERROR_UNAUTHORIZED: u16 = 401;

/// Error code for stale credentials; handled exactly like 401.
pub const ERROR_STALE_NONCE: u16 = 438;

/// True when the leading 16 bits of a packet fall in the channel-data range.
pub fn is_channel_data(msg_type: u16) -> bool {
    msg_type & 0xC000 == 0x4000
}

/// Frame a payload for transmission over a bound channel.
///
/// Four-byte header (channel number, payload length) followed by the raw
/// payload. The frame is not padded.
pub fn encode_channel_frame(channel: u16, payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= u16::MAX as usize);
    let mut buf = BytesMut::with_capacity(CHANNEL_HEADER_SIZE + payload.len());
    buf.put_u16(channel);
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    buf.to_vec()
}

/// Split a channel-data frame into channel number and payload.
///
/// Returns `None` unless the declared length matches the bytes present
/// exactly; UDP delivers whole frames or nothing.
pub fn decode_channel_frame(data: &[u8]) -> Option<(u16, &[u8])> {
    if data.len() < CHANNEL_HEADER_SIZE {
        return None;
    }
    let channel = u16::from_be_bytes([data[0], data[1]]);
    let declared = u16::from_be_bytes([data[2], data[3]]) as usize;
    if declared != data.len() - CHANNEL_HEADER_SIZE {
        return None;
    }
    Some((channel, &data[CHANNEL_HEADER_SIZE..]))
}

/// Transport carried by a candidate address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Protocol {
    /// UDP transport
    Udp,
    /// TCP transport (never relayed by this client)
    Tcp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Udp => write!(f, "udp"),
            Protocol::Tcp => write!(f, "tcp"),
        }
    }
}

/// A remote peer address a connection may be opened to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    /// Peer transport address
    pub address: std::net::SocketAddr,
    /// Peer transport protocol
    pub protocol: Protocol,
}

impl Candidate {
    /// Convenience constructor for a UDP candidate
    pub fn udp(address: std::net::SocketAddr) -> Self {
        Self {
            address,
            protocol: Protocol::Udp,
        }
    }
}

/// Signals emitted by a relay port to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// The server granted an allocation; the relayed address is usable.
    AddressReady {
        /// Address the server relays from on our behalf
        relayed: std::net::SocketAddr,
    },
    /// Allocation failed for good; the port will not retry on its own.
    AddressError,
    /// Relayed data arrived for a peer with no live connection receiver.
    DataReceived {
        /// Raw application payload
        data: Vec<u8>,
        /// Peer the server claims the data came from
        peer: std::net::SocketAddr,
        /// Transport the data was relayed over
        protocol: Protocol,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_frame_round_trip() {
        let frame = encode_channel_frame(0x4001, b"hello");
        assert_eq!(frame.len(), CHANNEL_HEADER_SIZE + 5);
        assert_eq!(&frame[..4], &[0x40, 0x01, 0x00, 0x05]);

        let (channel, payload) = decode_channel_frame(&frame).unwrap();
        assert_eq!(channel, 0x4001);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn empty_payload_frames_to_bare_header() {
        let frame = encode_channel_frame(0x4000, b"");
        assert_eq!(frame, vec![0x40, 0x00, 0x00, 0x00]);

        let (channel, payload) = decode_channel_frame(&frame).unwrap();
        assert_eq!(channel, 0x4000);
        assert!(payload.is_empty());
    }

    #[test]
    fn frames_are_not_padded() {
        // 3-byte payload stays 7 bytes on the wire.
        let frame = encode_channel_frame(0x4000, b"abc");
        assert_eq!(frame.len(), 7);
    }

    #[test]
    fn length_mismatch_rejected() {
        let mut frame = encode_channel_frame(0x4000, b"abcd");
        frame.push(0xFF);
        assert!(decode_channel_frame(&frame).is_none());

        let short = [0x40u8, 0x00, 0x00];
        assert!(decode_channel_frame(&short).is_none());
    }

    #[test]
    fn channel_range_detection() {
        assert!(is_channel_data(0x4000));
        assert!(is_channel_data(0x7FFF));
        assert!(!is_channel_data(0x0003));
        assert!(!is_channel_data(0x0113));
        assert!(!is_channel_data(0x8000));
        assert!(!is_channel_data(0xC000));
    }
}
