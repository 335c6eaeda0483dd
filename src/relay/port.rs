//! The relay port: one socket, one allocation, one task.
//!
//! [`RelayPort`] drives a complete TURN client session against a single
//! server. Everything it owns (credential state, per-peer entries, pending
//! requests, renewal timers) lives on the task running [`RelayPort::run`],
//! so no handler ever contends on a lock. Other tasks interact through a
//! cloneable [`RelayHandle`] and receive inbound data through
//! [`RelayConnection`] queues or the port's event stream.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::stun::{
    class_of, verify_integrity, Attribute, LongTermCredential, Message, MessageClass, MessageType,
};

use super::entry::Entry;
use super::request::{RequestKind, RequestManager, RetryAction};
use super::{
    decode_channel_frame, is_channel_data, Candidate, Protocol, RelayEvent, CHANNEL_HEADER_SIZE,
    CHANNEL_NUMBER_MAX, CHANNEL_NUMBER_START, ERROR_STALE_NONCE, ERROR_UNAUTHORIZED,
    MIN_REFRESHABLE_LIFETIME, PERMISSION_TIMEOUT, REFRESH_MARGIN, TRANSPORT_UDP,
};

const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Poll interval when no timer is armed.
const IDLE_TICK: Duration = Duration::from_secs(60);

/// Relayed transport address granted by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// Address the server relays from on our behalf
    pub relayed: SocketAddr,
    /// Our server-reflexive address as seen by the TURN server
    pub mapped: SocketAddr,
    /// Granted lifetime at the last allocate or refresh
    pub lifetime: Duration,
}

/// A request to rebuild and send when its timer fires.
#[derive(Debug)]
struct ScheduledRequest {
    kind: RequestKind,
    fire_at: Instant,
}

enum PortCommand {
    Send {
        peer: SocketAddr,
        data: Vec<u8>,
        is_payload: bool,
    },
    CreateConnection {
        candidate: Candidate,
        reply: oneshot::Sender<Option<RelayConnection>>,
    },
    Close,
}

enum LoopEvent {
    Packet { len: usize, from: SocketAddr },
    Command(Option<PortCommand>),
    Timer,
}

/// A TURN client session bound to one local UDP socket.
pub struct RelayPort {
    config: RelayConfig,
    socket: UdpSocket,
    local_addr: SocketAddr,
    server_addr: Option<SocketAddr>,
    credential: LongTermCredential,
    allocation: Option<Allocation>,
    entries: HashMap<SocketAddr, Entry>,
    next_channel: u16,
    requests: RequestManager,
    scheduled: Vec<ScheduledRequest>,
    connections: HashMap<SocketAddr, mpsc::UnboundedSender<Vec<u8>>>,
    events: mpsc::UnboundedSender<RelayEvent>,
    commands_tx: mpsc::UnboundedSender<PortCommand>,
    commands_rx: mpsc::UnboundedReceiver<PortCommand>,
}

impl RelayPort {
    /// Bind a local socket and set up port state.
    ///
    /// Returns the port and the event stream it reports on. Nothing is
    /// sent to the server until [`prepare_address`](Self::prepare_address).
    pub async fn bind(
        config: RelayConfig,
    ) -> RelayResult<(Self, mpsc::UnboundedReceiver<RelayEvent>)> {
        config.validate()?;
        let socket = bind_in_range(config.local_ip, config.min_port, config.max_port).await?;
        let local_addr = socket.local_addr()?;
        info!("Relay port bound on {} for server {}", local_addr, config.server);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let credential = LongTermCredential::new(&config.username, &config.password);
        let requests = RequestManager::new(config.retransmit.clone());

        let port = Self {
            config,
            socket,
            local_addr,
            server_addr: None,
            credential,
            allocation: None,
            entries: HashMap::new(),
            next_channel: CHANNEL_NUMBER_START,
            requests,
            scheduled: Vec::new(),
            connections: HashMap::new(),
            events: events_tx,
            commands_tx,
            commands_rx,
        };
        Ok((port, events_rx))
    }

    /// Local socket address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Resolved server address, once [`prepare_address`](Self::prepare_address) ran
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server_addr
    }

    /// The current allocation, if the server granted one
    pub fn allocation(&self) -> Option<&Allocation> {
        self.allocation.as_ref()
    }

    /// Relayed address of the current allocation
    pub fn relayed_address(&self) -> Option<SocketAddr> {
        self.allocation.as_ref().map(|a| a.relayed)
    }

    /// A cloneable handle for driving the port from other tasks
    pub fn handle(&self) -> RelayHandle {
        RelayHandle {
            commands: self.commands_tx.clone(),
        }
    }

    /// Resolve the server and send the first Allocate request.
    ///
    /// Failures that can never succeed later (missing credentials, failed
    /// resolution) surface as [`RelayEvent::AddressError`]; the port does
    /// not retry them on its own.
    pub async fn prepare_address(&mut self) {
        if self.credential.is_empty() {
            warn!("Allocation refused: relay server credentials are missing");
            self.emit_address_error();
            return;
        }

        let (host, port) = self.config.server_host_port();
        let resolved = match host.parse::<IpAddr>() {
            Ok(ip) => Some(SocketAddr::new(ip, port)),
            Err(_) => {
                debug!("Resolving relay server {}", host);
                match lookup_host((host.as_str(), port)).await {
                    Ok(mut addrs) => {
                        let want_v4 = self.local_addr.is_ipv4();
                        addrs.find(|a| a.is_ipv4() == want_v4)
                    }
                    Err(e) => {
                        warn!("Failed to resolve relay server {}: {}", host, e);
                        self.emit_address_error();
                        return;
                    }
                }
            }
        };

        match resolved {
            Some(addr) => {
                info!("Relay server {} resolved to {}", self.config.server, addr);
                self.server_addr = Some(addr);
            }
            None => {
                warn!(
                    "Relay server {} has no address in our family",
                    self.config.server
                );
                self.emit_address_error();
                return;
            }
        }

        if let Err(e) = self.send_request(RequestKind::Allocate).await {
            warn!("Failed to send allocate request: {}", e);
            self.emit_address_error();
        }
    }

    /// Open a connection to a peer through the relay.
    ///
    /// Only UDP candidates in the socket's address family are accepted.
    /// The first connection to a peer creates its entry, assigns the next
    /// channel number, and asks the server for a permission; later calls
    /// for the same peer reuse the entry and replace the inbound queue.
    /// Returns `None` when the candidate is unusable or the channel number
    /// space is exhausted.
    pub async fn create_connection(&mut self, candidate: Candidate) -> Option<RelayConnection> {
        if candidate.protocol != Protocol::Udp {
            debug!(
                "Ignoring {} candidate {}: relay is UDP only",
                candidate.protocol, candidate.address
            );
            return None;
        }
        if candidate.address.is_ipv4() != self.local_addr.is_ipv4() {
            debug!(
                "Ignoring candidate {}: address family differs from {}",
                candidate.address, self.local_addr
            );
            return None;
        }

        let peer = candidate.address;
        if !self.entries.contains_key(&peer) && !self.create_entry(peer).await {
            return None;
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        self.connections.insert(peer, inbound_tx);
        Some(RelayConnection {
            peer,
            commands: self.commands_tx.clone(),
            incoming: inbound_rx,
        })
    }

    /// Send data to a peer through the relay.
    ///
    /// Framing follows the peer's entry: a Send indication until the
    /// channel is bound, a channel-data frame afterwards. The first
    /// application payload (`is_payload` true) also kicks off the
    /// ChannelBind exchange.
    pub async fn send_to(
        &mut self,
        data: &[u8],
        peer: SocketAddr,
        is_payload: bool,
    ) -> RelayResult<usize> {
        let server = match self.server_addr {
            Some(addr) => addr,
            None => {
                return Err(RelayError::Configuration(
                    "relay server address not resolved".to_string(),
                ))
            }
        };
        let (wire, kick_bind, channel) = match self.entries.get_mut(&peer) {
            Some(entry) => {
                let (wire, kick_bind) = entry.encode_send(data, is_payload);
                (wire, kick_bind, entry.channel())
            }
            None => {
                warn!("Dropping send to {}: no relay entry", peer);
                return Err(RelayError::UnknownDestination(peer));
            }
        };

        self.socket.send_to(&wire, server).await?;

        if kick_bind {
            debug!("First payload for {}, requesting channel binding", peer);
            if let Err(e) = self
                .send_request(RequestKind::ChannelBind { peer, channel })
                .await
            {
                warn!("Failed to send channel-bind request for {}: {}", peer, e);
            }
        }
        Ok(data.len())
    }

    /// Arm the allocation refresh timer from a granted lifetime.
    ///
    /// Renewal fires one margin before expiry. Lifetimes under two
    /// margins are declined, otherwise the timer could fire in the past.
    pub fn schedule_refresh(&mut self, lifetime: u32) -> bool {
        if lifetime < MIN_REFRESHABLE_LIFETIME {
            warn!("Allocation lifetime {}s is too short to refresh", lifetime);
            return false;
        }
        let delay = Duration::from_secs(u64::from(lifetime)) - REFRESH_MARGIN;
        self.schedule(RequestKind::Refresh, delay);
        true
    }

    /// Handle one datagram from the socket.
    ///
    /// Packets not from the resolved server address and packets shorter
    /// than a channel-data header are dropped with a warning. The rest
    /// dispatch on the leading 16 bits: channel-data frame, Data
    /// indication, or a response to a pending request.
    pub async fn on_read_packet(&mut self, data: &[u8], from: SocketAddr) {
        match self.server_addr {
            Some(server) if server == from => {}
            _ => {
                warn!("Dropping packet from unexpected address {}", from);
                return;
            }
        }
        if data.len() < CHANNEL_HEADER_SIZE {
            warn!("Dropping runt packet of {} bytes", data.len());
            return;
        }

        let leading = u16::from_be_bytes([data[0], data[1]]);
        if is_channel_data(leading) {
            self.handle_channel_data(data);
        } else if leading == MessageType::DataIndication as u16 {
            self.handle_data_indication(data);
        } else {
            self.handle_response(data).await;
        }
    }

    /// Run the port's event loop until closed.
    ///
    /// Multiplexes socket reads, handle commands, and timer expiry
    /// (retransmissions plus scheduled refresh and rebind requests).
    pub async fn run(&mut self) -> RelayResult<()> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            let deadline = self
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + IDLE_TICK);

            let event = tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    let (len, from) = result?;
                    LoopEvent::Packet { len, from }
                }
                command = self.commands_rx.recv() => LoopEvent::Command(command),
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                    LoopEvent::Timer
                }
            };

            match event {
                LoopEvent::Packet { len, from } => self.on_read_packet(&buf[..len], from).await,
                LoopEvent::Command(Some(command)) => {
                    if self.handle_command(command).await {
                        return Ok(());
                    }
                }
                LoopEvent::Command(None) => return Ok(()),
                LoopEvent::Timer => self.process_timers(Instant::now()).await,
            }
        }
    }

    async fn handle_command(&mut self, command: PortCommand) -> bool {
        match command {
            PortCommand::Send {
                peer,
                data,
                is_payload,
            } => {
                if let Err(e) = self.send_to(&data, peer, is_payload).await {
                    debug!("Queued send to {} failed: {}", peer, e);
                }
                false
            }
            PortCommand::CreateConnection { candidate, reply } => {
                let connection = self.create_connection(candidate).await;
                let _ = reply.send(connection);
                false
            }
            PortCommand::Close => {
                info!("Relay port on {} closing", self.local_addr);
                self.release().await;
                true
            }
        }
    }

    /// Create the entry for a new peer and ask the server for a permission.
    ///
    /// Channel numbers are handed out strictly increasing and never
    /// reused, even after an entry is dropped.
    async fn create_entry(&mut self, peer: SocketAddr) -> bool {
        if self.next_channel > CHANNEL_NUMBER_MAX {
            warn!("Channel number space exhausted, cannot add {}", peer);
            return false;
        }
        let channel = self.next_channel;
        self.next_channel += 1;
        self.entries.insert(peer, Entry::new(peer, channel));
        info!("New relay entry for {} on channel 0x{:04X}", peer, channel);

        if let Err(e) = self
            .send_request(RequestKind::CreatePermission { peer })
            .await
        {
            warn!("Failed to send create-permission for {}: {}", peer, e);
        }
        true
    }

    fn build_request(&self, kind: &RequestKind) -> (Message, bool) {
        match kind {
            RequestKind::Allocate => {
                let mut message = Message::new(MessageType::AllocateRequest);
                message.add_attribute(Attribute::RequestedTransport(TRANSPORT_UDP));
                if self.credential.has_key() {
                    self.credential.apply(&mut message);
                    (message, true)
                } else {
                    (message, false)
                }
            }
            RequestKind::Refresh => {
                let mut message = Message::new(MessageType::RefreshRequest);
                self.credential.apply(&mut message);
                (message, true)
            }
            RequestKind::CreatePermission { peer } => {
                let mut message = Message::new(MessageType::CreatePermissionRequest);
                message.add_attribute(Attribute::XorPeerAddress(*peer));
                self.credential.apply(&mut message);
                (message, true)
            }
            RequestKind::ChannelBind { peer, channel } => {
                let mut message = Message::new(MessageType::ChannelBindRequest);
                message.add_attribute(Attribute::ChannelNumber(*channel));
                message.add_attribute(Attribute::XorPeerAddress(*peer));
                self.credential.apply(&mut message);
                (message, true)
            }
        }
    }

    /// Encode, transmit, and start tracking one request.
    async fn send_request(&mut self, kind: RequestKind) -> RelayResult<()> {
        let server = match self.server_addr {
            Some(addr) => addr,
            None => {
                return Err(RelayError::Configuration(
                    "relay server address not resolved".to_string(),
                ))
            }
        };
        let (message, signed) = self.build_request(&kind);
        let payload = if signed {
            let key = self.credential.key().ok_or(RelayError::MissingCredentials)?;
            message.encode_with_integrity(key)?
        } else {
            message.encode()
        };

        debug!(
            "Sending {} request to {} (transaction {})",
            kind, server, message.transaction_id
        );
        self.socket.send_to(&payload, server).await?;
        self.requests
            .track(message.transaction_id, kind, payload, Instant::now());
        Ok(())
    }

    fn schedule(&mut self, kind: RequestKind, delay: Duration) {
        debug!("Scheduling {} request in {:?}", kind, delay);
        self.scheduled.push(ScheduledRequest {
            kind,
            fire_at: Instant::now() + delay,
        });
    }

    fn next_deadline(&self) -> Option<Instant> {
        let scheduled = self.scheduled.iter().map(|s| s.fire_at).min();
        match (scheduled, self.requests.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    async fn process_timers(&mut self, now: Instant) {
        let mut due = Vec::new();
        let mut i = 0;
        while i < self.scheduled.len() {
            if self.scheduled[i].fire_at <= now {
                due.push(self.scheduled.swap_remove(i).kind);
            } else {
                i += 1;
            }
        }
        for kind in due {
            if let Err(e) = self.send_request(kind).await {
                warn!("Failed to send scheduled {} request: {}", kind, e);
            }
        }

        for action in self.requests.poll(now) {
            match action {
                RetryAction::Retransmit { payload } => {
                    if let Some(server) = self.server_addr {
                        if let Err(e) = self.socket.send_to(&payload, server).await {
                            warn!("Retransmission failed: {}", e);
                        }
                    }
                }
                RetryAction::TimedOut { kind, after } => {
                    warn!("{} request timed out after {:?}", kind, after);
                }
            }
        }
    }

    fn handle_channel_data(&mut self, data: &[u8]) {
        let (channel, payload) = match decode_channel_frame(data) {
            Some(frame) => frame,
            None => {
                warn!("Dropping malformed channel-data frame");
                return;
            }
        };
        let peer = match self.entries.values().find(|e| e.channel() == channel) {
            Some(entry) => entry.peer(),
            None => {
                warn!("Channel data on unknown channel 0x{:04X}", channel);
                return;
            }
        };
        let payload = payload.to_vec();
        self.dispatch_packet(payload, peer);
    }

    fn handle_data_indication(&mut self, data: &[u8]) {
        let message = match Message::decode(data) {
            Ok(message) => message,
            Err(e) => {
                warn!("Failed to decode data indication: {}", e);
                return;
            }
        };
        let peer = match message.xor_peer_address() {
            Some(addr) => addr,
            None => {
                warn!("Data indication without a peer address");
                return;
            }
        };
        let payload = match message.data() {
            Some(data) => data.to_vec(),
            None => {
                warn!("Data indication from {} without data", peer);
                return;
            }
        };
        // Permissions are granted per IP; any port on a permitted IP is fine.
        if !self.has_permission(peer.ip()) {
            warn!("Data indication from {} without a permission", peer);
            return;
        }
        self.dispatch_packet(payload, peer);
    }

    fn has_permission(&self, ip: IpAddr) -> bool {
        self.entries.keys().any(|peer| peer.ip() == ip)
    }

    fn dispatch_packet(&mut self, data: Vec<u8>, peer: SocketAddr) {
        let data = match self.connections.get(&peer) {
            Some(queue) => match queue.send(data) {
                Ok(()) => return,
                Err(failed) => {
                    // Receiver gone; fall back to the event stream.
                    self.connections.remove(&peer);
                    failed.0
                }
            },
            None => data,
        };
        debug!("Relayed {} bytes from {} to the event stream", data.len(), peer);
        let _ = self.events.send(RelayEvent::DataReceived {
            data,
            peer,
            protocol: Protocol::Udp,
        });
    }

    /// Verify, decode, and route a response to its request handler.
    async fn handle_response(&mut self, data: &[u8]) {
        let leading = u16::from_be_bytes([data[0], data[1]]);
        if class_of(leading) == MessageClass::SuccessResponse {
            let key: &[u8] = match self.credential.key() {
                Some(key) => key,
                None => &[],
            };
            if !verify_integrity(data, key) {
                warn!(
                    "Dropping response 0x{:04X} with bad message integrity",
                    leading
                );
                return;
            }
        }

        let message = match Message::decode(data) {
            Ok(message) => message,
            Err(e) => {
                warn!("Failed to decode server response: {}", e);
                return;
            }
        };
        let kind = match self.requests.match_response(&message) {
            Some(kind) => kind,
            None => {
                warn!(
                    "Response for unknown transaction {}",
                    message.transaction_id
                );
                return;
            }
        };

        match message.class() {
            MessageClass::SuccessResponse => self.on_request_success(kind, &message),
            MessageClass::ErrorResponse => self.on_request_error(kind, &message).await,
            _ => {}
        }
    }

    fn on_request_success(&mut self, kind: RequestKind, message: &Message) {
        match kind {
            RequestKind::Allocate => self.on_allocate_success(message),
            RequestKind::Refresh => self.on_refresh_success(message),
            RequestKind::CreatePermission { peer } => match self.entries.get(&peer) {
                Some(entry) => entry.on_create_permission_success(),
                None => warn!("Permission response for removed peer {}", peer),
            },
            RequestKind::ChannelBind { peer, channel } => {
                self.on_channel_bind_success(peer, channel)
            }
        }
    }

    fn on_allocate_success(&mut self, message: &Message) {
        let mapped = match message.xor_mapped_address() {
            Some(addr) => addr,
            None => {
                warn!("Allocate response is missing the mapped address");
                return;
            }
        };
        let relayed = match message.xor_relayed_address() {
            Some(addr) => addr,
            None => {
                warn!("Allocate response is missing the relayed address");
                return;
            }
        };
        let lifetime = match message.lifetime() {
            Some(seconds) => seconds,
            None => {
                warn!("Allocate response is missing the lifetime");
                return;
            }
        };

        info!(
            "Allocation granted: relayed {} mapped {} lifetime {}s",
            relayed, mapped, lifetime
        );
        self.allocation = Some(Allocation {
            relayed,
            mapped,
            lifetime: Duration::from_secs(u64::from(lifetime)),
        });
        let _ = self.events.send(RelayEvent::AddressReady { relayed });
        self.schedule_refresh(lifetime);
    }

    fn on_refresh_success(&mut self, message: &Message) {
        match message.lifetime() {
            Some(lifetime) => {
                debug!("Allocation refreshed for {}s", lifetime);
                if let Some(allocation) = self.allocation.as_mut() {
                    allocation.lifetime = Duration::from_secs(u64::from(lifetime));
                }
                self.schedule_refresh(lifetime);
            }
            None => warn!("Refresh response is missing the lifetime"),
        }
    }

    fn on_channel_bind_success(&mut self, peer: SocketAddr, channel: u16) {
        match self.entries.get_mut(&peer) {
            Some(entry) => {
                entry.on_channel_bind_success();
                // Renew before the server lets the binding lapse.
                self.schedule(
                    RequestKind::ChannelBind { peer, channel },
                    PERMISSION_TIMEOUT - REFRESH_MARGIN,
                );
            }
            None => warn!("Channel-bind response for removed peer {}", peer),
        }
    }

    async fn on_request_error(&mut self, kind: RequestKind, message: &Message) {
        match kind {
            RequestKind::Allocate => self.on_allocate_error(message).await,
            RequestKind::Refresh => {
                // No recovery; the allocation expires unless a later
                // scheduled refresh succeeds.
                let (code, reason) = message.error_code().unwrap_or((0, ""));
                warn!("Refresh rejected: {} {}", code, reason);
            }
            RequestKind::CreatePermission { peer } => {
                let (code, reason) = message.error_code().unwrap_or((0, ""));
                match self.entries.get(&peer) {
                    Some(entry) => entry.on_create_permission_error(code, reason),
                    None => warn!("Permission error for removed peer {}", peer),
                }
            }
            RequestKind::ChannelBind { peer, .. } => {
                let (code, reason) = message.error_code().unwrap_or((0, ""));
                match self.entries.get_mut(&peer) {
                    Some(entry) => entry.on_channel_bind_error(code, reason),
                    None => warn!("Channel-bind error for removed peer {}", peer),
                }
            }
        }
    }

    async fn on_allocate_error(&mut self, message: &Message) {
        let (code, reason) = match message.error_code() {
            Some(pair) => pair,
            None => {
                warn!("Allocate error response without an error code");
                self.emit_address_error();
                return;
            }
        };
        warn!("Allocate rejected: {} {}", code, reason);
        match code {
            ERROR_UNAUTHORIZED | ERROR_STALE_NONCE => self.on_auth_challenge(message).await,
            _ => self.emit_address_error(),
        }
    }

    /// React to a 401/438 challenge.
    ///
    /// The first challenge supplies realm and nonce for the credential
    /// key; the allocate is then retried once with auth attached. A
    /// challenge arriving after the key exists means our credentials are
    /// wrong, and the allocation attempt is abandoned.
    async fn on_auth_challenge(&mut self, message: &Message) {
        if self.credential.has_key() {
            warn!("Server challenged authenticated credentials, giving up");
            self.emit_address_error();
            return;
        }
        let realm = match message.realm() {
            Some(realm) => realm.to_string(),
            None => {
                warn!("Challenge without a realm attribute");
                return;
            }
        };
        let nonce = match message.nonce() {
            Some(nonce) => nonce.to_string(),
            None => {
                warn!("Challenge without a nonce attribute");
                return;
            }
        };

        debug!("Challenge received for realm {:?}", realm);
        self.credential.update(&realm, &nonce);
        if let Err(e) = self.send_request(RequestKind::Allocate).await {
            warn!("Failed to send authenticated allocate: {}", e);
            self.emit_address_error();
        }
    }

    fn emit_address_error(&self) {
        let _ = self.events.send(RelayEvent::AddressError);
    }

    /// Best-effort zero-lifetime refresh so the server can free the
    /// allocation right away instead of waiting out the lifetime.
    async fn release(&mut self) {
        if self.allocation.is_none() || !self.credential.has_key() {
            return;
        }
        let server = match self.server_addr {
            Some(addr) => addr,
            None => return,
        };
        let mut message = Message::new(MessageType::RefreshRequest);
        message.add_attribute(Attribute::Lifetime(0));
        self.credential.apply(&mut message);

        let key = match self.credential.key() {
            Some(key) => key,
            None => return,
        };
        match message.encode_with_integrity(key) {
            Ok(payload) => {
                if let Err(e) = self.socket.send_to(&payload, server).await {
                    debug!("Failed to send release refresh: {}", e);
                } else {
                    info!("Released allocation on {}", server);
                }
            }
            Err(e) => debug!("Failed to encode release refresh: {}", e),
        }
        self.allocation = None;
    }
}

/// Bind a UDP socket on `ip`, in `[min_port, max_port]` when given.
async fn bind_in_range(ip: IpAddr, min_port: u16, max_port: u16) -> RelayResult<UdpSocket> {
    if min_port == 0 && max_port == 0 {
        return Ok(UdpSocket::bind((ip, 0)).await?);
    }
    let mut last_err = None;
    for port in min_port..=max_port {
        match UdpSocket::bind((ip, port)).await {
            Ok(socket) => return Ok(socket),
            Err(e) => last_err = Some(e),
        }
    }
    match last_err {
        Some(e) => Err(RelayError::Io(e)),
        None => Err(RelayError::Configuration(format!(
            "empty port range {}-{}",
            min_port, max_port
        ))),
    }
}

/// Cloneable handle for talking to a running port from other tasks.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    commands: mpsc::UnboundedSender<PortCommand>,
}

impl RelayHandle {
    /// Open a connection to a peer; resolves once the port processed it
    pub async fn create_connection(
        &self,
        candidate: Candidate,
    ) -> RelayResult<Option<RelayConnection>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(PortCommand::CreateConnection {
                candidate,
                reply: reply_tx,
            })
            .map_err(|_| RelayError::PortClosed)?;
        reply_rx.await.map_err(|_| RelayError::PortClosed)
    }

    /// Queue data for a peer (`is_payload` governs channel binding)
    pub fn send_to(&self, peer: SocketAddr, data: &[u8], is_payload: bool) -> RelayResult<()> {
        self.commands
            .send(PortCommand::Send {
                peer,
                data: data.to_vec(),
                is_payload,
            })
            .map_err(|_| RelayError::PortClosed)
    }

    /// Release the allocation and stop the port's event loop
    pub fn close(&self) {
        let _ = self.commands.send(PortCommand::Close);
    }
}

/// One peer's view of the relay: send payloads, receive relayed data.
///
/// Dropping the connection redirects later inbound data for the peer to
/// the port's event stream.
#[derive(Debug)]
pub struct RelayConnection {
    peer: SocketAddr,
    commands: mpsc::UnboundedSender<PortCommand>,
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl RelayConnection {
    /// Peer this connection reaches
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queue an application payload for the peer
    pub fn send(&self, data: &[u8]) -> RelayResult<()> {
        self.commands
            .send(PortCommand::Send {
                peer: self.peer,
                data: data.to_vec(),
                is_payload: true,
            })
            .map_err(|_| RelayError::PortClosed)
    }

    /// Wait for the next relayed payload from the peer
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.incoming.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv)
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.incoming.try_recv().ok()
    }
}
