//! STUN message layer.
//!
//! TURN rides on STUN framing: a 20-byte header followed by TLV
//! attributes. This module owns the binary codec ([`message`]) and the
//! long-term credential derivation ([`auth`]) that keys the
//! MESSAGE-INTEGRITY attribute.

pub mod auth;
pub mod message;

pub use auth::{long_term_key, LongTermCredential};
pub use message::{
    class_of, verify_integrity, Attribute, Message, MessageClass, MessageType, TransactionId,
    HEADER_SIZE, MAGIC_COOKIE,
};
