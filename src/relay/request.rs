//! In-flight request tracking and retransmission.
//!
//! STUN over UDP retransmits on a doubling timer until a response matches
//! the transaction id or the attempt budget runs out. The manager keeps the
//! encoded payload of every outstanding request so retransmissions reuse
//! the original transaction id, and it hands I/O decisions back to the
//! caller as [`RetryAction`] values instead of touching the socket itself.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::stun::{Message, MessageClass, TransactionId};

/// The request currently in flight for a transaction.
///
/// Permission and binding requests carry the peer they were issued for, so
/// a response can be routed to the right entry without the request holding
/// a reference into the port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Initial or authenticated Allocate
    Allocate,
    /// Allocation lifetime renewal
    Refresh,
    /// CreatePermission for one peer address
    CreatePermission {
        /// Peer the permission covers
        peer: SocketAddr,
    },
    /// ChannelBind tying a channel number to a peer
    ChannelBind {
        /// Peer the channel is bound to
        peer: SocketAddr,
        /// Channel number being bound
        channel: u16,
    },
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Allocate => write!(f, "allocate"),
            RequestKind::Refresh => write!(f, "refresh"),
            RequestKind::CreatePermission { .. } => write!(f, "create-permission"),
            RequestKind::ChannelBind { .. } => write!(f, "channel-bind"),
        }
    }
}

/// Retransmission timing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetransmitConfig {
    /// Initial retransmission timeout in milliseconds
    pub initial_rto_ms: u64,
    /// Ceiling the timeout doubles up to, in milliseconds
    pub max_rto_ms: u64,
    /// Retransmissions before the request is declared dead
    pub max_retries: u32,
}

impl Default for RetransmitConfig {
    fn default() -> Self {
        Self {
            initial_rto_ms: 500,
            max_rto_ms: 3200,
            max_retries: 7,
        }
    }
}

#[derive(Debug)]
struct PendingRequest {
    kind: RequestKind,
    payload: Vec<u8>,
    attempt: u32,
    rto: Duration,
    next_retry: Instant,
    sent_at: Instant,
}

/// What the caller should do after a timer poll.
#[derive(Debug)]
pub enum RetryAction {
    /// Put these bytes back on the wire.
    Retransmit {
        /// The originally encoded request
        payload: Vec<u8>,
    },
    /// The request exhausted its retries and was dropped.
    TimedOut {
        /// Which request gave up
        kind: RequestKind,
        /// Time since the first transmission
        after: Duration,
    },
}

/// Bookkeeping for every request awaiting a response.
#[derive(Debug)]
pub struct RequestManager {
    pending: HashMap<TransactionId, PendingRequest>,
    config: RetransmitConfig,
}

impl RequestManager {
    /// Create a manager with the given timing configuration
    pub fn new(config: RetransmitConfig) -> Self {
        Self {
            pending: HashMap::new(),
            config,
        }
    }

    /// Record a request that was just sent
    pub fn track(&mut self, id: TransactionId, kind: RequestKind, payload: Vec<u8>, now: Instant) {
        let rto = Duration::from_millis(self.config.initial_rto_ms);
        self.pending.insert(
            id,
            PendingRequest {
                kind,
                payload,
                attempt: 0,
                rto,
                next_retry: now + rto,
                sent_at: now,
            },
        );
    }

    /// Match a decoded response against the outstanding transactions.
    ///
    /// Only success and error responses settle a transaction; requests and
    /// indications never do. A match removes the pending entry, so a
    /// retransmitted response settles at most once.
    pub fn match_response(&mut self, message: &Message) -> Option<RequestKind> {
        match message.class() {
            MessageClass::SuccessResponse | MessageClass::ErrorResponse => {}
            _ => return None,
        }
        self.pending
            .remove(&message.transaction_id)
            .map(|request| request.kind)
    }

    /// Earliest instant any pending request wants attention
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|request| request.next_retry)
            .min()
    }

    /// Advance timers to `now`, returning retransmissions and timeouts
    pub fn poll(&mut self, now: Instant) -> Vec<RetryAction> {
        let mut actions = Vec::new();
        let mut dead = Vec::new();

        for (id, request) in self.pending.iter_mut() {
            if now < request.next_retry {
                continue;
            }
            if request.attempt >= self.config.max_retries {
                dead.push(*id);
                continue;
            }
            request.attempt += 1;
            let doubled = request.rto.as_millis() as u64 * 2;
            request.rto = Duration::from_millis(doubled.min(self.config.max_rto_ms));
            request.next_retry = now + request.rto;
            actions.push(RetryAction::Retransmit {
                payload: request.payload.clone(),
            });
        }

        for id in dead {
            if let Some(request) = self.pending.remove(&id) {
                actions.push(RetryAction::TimedOut {
                    kind: request.kind,
                    after: now - request.sent_at,
                });
            }
        }
        actions
    }

    /// True while a transaction is outstanding
    pub fn contains(&self, id: &TransactionId) -> bool {
        self.pending.contains_key(id)
    }

    /// Number of outstanding transactions
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True when nothing is in flight
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stun::MessageType;

    fn manager() -> RequestManager {
        RequestManager::new(RetransmitConfig::default())
    }

    #[test]
    fn tracked_request_sets_first_deadline() {
        let mut mgr = manager();
        let now = Instant::now();
        let id = TransactionId::new();
        mgr.track(id, RequestKind::Allocate, vec![1, 2, 3], now);

        assert!(mgr.contains(&id));
        assert_eq!(mgr.next_deadline(), Some(now + Duration::from_millis(500)));
    }

    #[test]
    fn poll_before_deadline_is_quiet() {
        let mut mgr = manager();
        let now = Instant::now();
        mgr.track(TransactionId::new(), RequestKind::Refresh, vec![0], now);

        let actions = mgr.poll(now + Duration::from_millis(100));
        assert!(actions.is_empty());
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn retransmission_doubles_the_timeout() {
        let mut mgr = manager();
        let now = Instant::now();
        mgr.track(TransactionId::new(), RequestKind::Allocate, vec![7], now);

        let at = now + Duration::from_millis(500);
        let actions = mgr.poll(at);
        assert_eq!(actions.len(), 1);
        assert!(matches!(
            &actions[0],
            RetryAction::Retransmit { payload } if payload == &vec![7]
        ));
        assert_eq!(mgr.next_deadline(), Some(at + Duration::from_millis(1000)));
    }

    #[test]
    fn timeout_caps_at_the_configured_maximum() {
        let mut mgr = manager();
        let mut now = Instant::now();
        mgr.track(TransactionId::new(), RequestKind::Allocate, vec![], now);

        // 500 -> 1000 -> 2000 -> 3200 -> 3200 ...
        let expected = [1000u64, 2000, 3200, 3200];
        for rto in expected {
            now = mgr.next_deadline().unwrap();
            mgr.poll(now);
            assert_eq!(mgr.next_deadline(), Some(now + Duration::from_millis(rto)));
        }
    }

    #[test]
    fn requests_give_up_after_the_retry_budget() {
        let mut mgr = RequestManager::new(RetransmitConfig {
            initial_rto_ms: 10,
            max_rto_ms: 20,
            max_retries: 2,
        });
        let now = Instant::now();
        let peer = "10.0.0.1:4000".parse().unwrap();
        mgr.track(
            TransactionId::new(),
            RequestKind::CreatePermission { peer },
            vec![],
            now,
        );

        let mut retransmits = 0;
        let mut timed_out = None;
        let mut at = now;
        for _ in 0..4 {
            at = match mgr.next_deadline() {
                Some(deadline) => deadline,
                None => break,
            };
            for action in mgr.poll(at) {
                match action {
                    RetryAction::Retransmit { .. } => retransmits += 1,
                    RetryAction::TimedOut { kind, after } => {
                        timed_out = Some((kind, after));
                    }
                }
            }
        }

        assert_eq!(retransmits, 2);
        let (kind, after) = timed_out.expect("request should time out");
        assert_eq!(kind, RequestKind::CreatePermission { peer });
        assert_eq!(after, at - now);
        assert!(mgr.is_empty());
    }

    #[test]
    fn response_settles_a_transaction_exactly_once() {
        let mut mgr = manager();
        let now = Instant::now();
        let id = TransactionId::new();
        mgr.track(id, RequestKind::Refresh, vec![], now);

        let response = Message::with_transaction_id(MessageType::RefreshResponse, id);
        assert_eq!(mgr.match_response(&response), Some(RequestKind::Refresh));
        assert_eq!(mgr.match_response(&response), None);
        assert!(mgr.is_empty());
    }

    #[test]
    fn non_response_classes_never_match() {
        let mut mgr = manager();
        let id = TransactionId::new();
        mgr.track(id, RequestKind::Allocate, vec![], Instant::now());

        let request = Message::with_transaction_id(MessageType::AllocateRequest, id);
        assert_eq!(mgr.match_response(&request), None);
        assert!(mgr.contains(&id));

        let indication = Message::with_transaction_id(MessageType::DataIndication, id);
        assert_eq!(mgr.match_response(&indication), None);
        assert!(mgr.contains(&id));
    }

    #[test]
    fn unknown_transactions_do_not_match() {
        let mut mgr = manager();
        mgr.track(
            TransactionId::new(),
            RequestKind::Allocate,
            vec![],
            Instant::now(),
        );

        let stray = Message::new(MessageType::AllocateResponse);
        assert_eq!(mgr.match_response(&stray), None);
        assert_eq!(mgr.len(), 1);
    }
}
