//! Per-peer relay state.
//!
//! A port keeps one entry per distinct peer address. The entry decides how
//! outbound data is framed (Send indication before a channel is bound,
//! channel-data frame after) and when the first application payload should
//! trigger a ChannelBind request. Entries never touch the socket; they hand
//! encoded bytes back to the port.

use std::net::SocketAddr;

use tracing::{debug, info, warn};

use crate::stun::{Attribute, Message, MessageType};

use super::encode_channel_frame;

/// Progress of the channel binding for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindState {
    /// No binding requested yet; data travels in Send indications.
    Unbound,
    /// ChannelBind is in flight; indications are still used.
    Binding,
    /// The server confirmed the binding; data travels in channel frames.
    Bound,
}

/// State for a single peer behind the relay.
#[derive(Debug)]
pub struct Entry {
    peer: SocketAddr,
    channel: u16,
    state: BindState,
}

impl Entry {
    /// Create an entry for a peer with its permanently assigned channel
    pub fn new(peer: SocketAddr, channel: u16) -> Self {
        Self {
            peer,
            channel,
            state: BindState::Unbound,
        }
    }

    /// Peer address this entry covers
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Channel number assigned at creation; never reused by the port
    pub fn channel(&self) -> u16 {
        self.channel
    }

    /// Current binding state
    pub fn state(&self) -> BindState {
        self.state
    }

    /// True once the server has confirmed the channel binding
    pub fn is_bound(&self) -> bool {
        self.state == BindState::Bound
    }

    /// Frame outbound data for this peer.
    ///
    /// Returns the wire bytes and whether the caller should issue a
    /// ChannelBind request now. The binding is kicked off by the first
    /// application payload; stun-keepalive style traffic (`is_payload`
    /// false) keeps using indications without ever binding.
    pub fn encode_send(&mut self, data: &[u8], is_payload: bool) -> (Vec<u8>, bool) {
        if self.state == BindState::Bound {
            return (encode_channel_frame(self.channel, data), false);
        }

        let mut message = Message::new(MessageType::SendIndication);
        message.add_attribute(Attribute::XorPeerAddress(self.peer));
        message.add_attribute(Attribute::Data(data.to_vec()));

        let kick_bind = is_payload && self.state == BindState::Unbound;
        if kick_bind {
            self.state = BindState::Binding;
        }
        (message.encode(), kick_bind)
    }

    /// The server installed a permission for this peer
    pub fn on_create_permission_success(&self) {
        debug!("Permission installed for {}", self.peer);
    }

    /// Permission was refused; the entry stays usable for indications
    pub fn on_create_permission_error(&self, code: u16, reason: &str) {
        warn!(
            "CreatePermission for {} rejected: {} {}",
            self.peer, code, reason
        );
    }

    /// The server confirmed the channel binding (initial bind or renewal)
    pub fn on_channel_bind_success(&mut self) {
        if self.state == BindState::Bound {
            debug!("Channel 0x{:04X} to {} renewed", self.channel, self.peer);
        } else {
            info!("Channel 0x{:04X} bound to {}", self.channel, self.peer);
            self.state = BindState::Bound;
        }
    }

    /// Binding failed; keep whatever framing currently works
    pub fn on_channel_bind_error(&mut self, code: u16, reason: &str) {
        warn!(
            "ChannelBind 0x{:04X} for {} rejected: {} {}",
            self.channel, self.peer, code, reason
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> Entry {
        Entry::new("192.0.2.7:7000".parse().unwrap(), 0x4000)
    }

    #[test]
    fn starts_unbound() {
        let e = entry();
        assert_eq!(e.state(), BindState::Unbound);
        assert!(!e.is_bound());
    }

    #[test]
    fn non_payload_data_goes_out_as_indication_without_binding() {
        let mut e = entry();
        let (wire, kick) = e.encode_send(b"probe", false);
        assert!(!kick);
        assert_eq!(e.state(), BindState::Unbound);

        let message = Message::decode(&wire).unwrap();
        assert_eq!(message.message_type, MessageType::SendIndication);
        assert_eq!(message.xor_peer_address(), Some(e.peer()));
        assert_eq!(message.data(), Some(&b"probe"[..]));
    }

    #[test]
    fn first_payload_kicks_the_channel_bind() {
        let mut e = entry();
        let (wire, kick) = e.encode_send(b"payload", true);
        assert!(kick);
        assert_eq!(e.state(), BindState::Binding);

        // Still an indication while the bind is in flight.
        let message = Message::decode(&wire).unwrap();
        assert_eq!(message.message_type, MessageType::SendIndication);

        // Only the first payload kicks; no request storm while binding.
        let (_, kick_again) = e.encode_send(b"more", true);
        assert!(!kick_again);
        assert_eq!(e.state(), BindState::Binding);
    }

    #[test]
    fn bound_entry_frames_payloads_on_the_channel() {
        let mut e = entry();
        e.encode_send(b"x", true);
        e.on_channel_bind_success();
        assert!(e.is_bound());

        let (wire, kick) = e.encode_send(b"data", true);
        assert!(!kick);
        assert_eq!(wire, encode_channel_frame(0x4000, b"data"));
    }

    #[test]
    fn bind_success_is_idempotent_for_renewals() {
        let mut e = entry();
        e.encode_send(b"x", true);
        e.on_channel_bind_success();
        e.on_channel_bind_success();
        assert!(e.is_bound());
    }

    #[test]
    fn bind_error_leaves_state_alone() {
        let mut e = entry();
        e.encode_send(b"x", true);
        e.on_channel_bind_error(403, "Forbidden");
        assert_eq!(e.state(), BindState::Binding);

        let (wire, _) = e.encode_send(b"y", true);
        let message = Message::decode(&wire).unwrap();
        assert_eq!(message.message_type, MessageType::SendIndication);
    }
}
