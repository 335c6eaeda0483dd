//! Binary codec for the STUN message subset TURN uses.
//!
//! Network byte order throughout. Attribute values are padded to 4-byte
//! boundaries inside STUN messages; channel-data frames (which are not
//! STUN messages) are framed elsewhere.

use std::convert::TryFrom;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, BytesMut};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;

use crate::error::StunError;

type HmacSha1 = Hmac<Sha1>;

/// STUN magic cookie (RFC 5389)
pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// STUN header size in bytes
pub const HEADER_SIZE: usize = 20;

/// MESSAGE-INTEGRITY HMAC-SHA1 digest length
const INTEGRITY_DIGEST_LEN: usize = 20;

/// MESSAGE-INTEGRITY TLV size: 4-byte attribute header + digest
const INTEGRITY_ATTR_SIZE: usize = 4 + INTEGRITY_DIGEST_LEN;

// Attribute type codes (RFC 5389 / RFC 5766)
const ATTR_USERNAME: u16 = 0x0006;
const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
const ATTR_ERROR_CODE: u16 = 0x0009;
const ATTR_CHANNEL_NUMBER: u16 = 0x000C;
const ATTR_LIFETIME: u16 = 0x000D;
const ATTR_XOR_PEER_ADDRESS: u16 = 0x0012;
const ATTR_DATA: u16 = 0x0013;
const ATTR_REALM: u16 = 0x0014;
const ATTR_NONCE: u16 = 0x0015;
const ATTR_XOR_RELAYED_ADDRESS: u16 = 0x0016;
const ATTR_REQUESTED_TRANSPORT: u16 = 0x0019;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// TURN message types (RFC 5766 Section 13)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    /// Allocate request
    AllocateRequest = 0x0003,
    /// Allocate success response
    AllocateResponse = 0x0103,
    /// Allocate error response
    AllocateError = 0x0113,

    /// Refresh request
    RefreshRequest = 0x0004,
    /// Refresh success response
    RefreshResponse = 0x0104,
    /// Refresh error response
    RefreshError = 0x0114,

    /// Send indication (client → server, unacknowledged)
    SendIndication = 0x0016,
    /// Data indication (server → client, unacknowledged)
    DataIndication = 0x0017,

    /// CreatePermission request
    CreatePermissionRequest = 0x0008,
    /// CreatePermission success response
    CreatePermissionResponse = 0x0108,
    /// CreatePermission error response
    CreatePermissionError = 0x0118,

    /// ChannelBind request
    ChannelBindRequest = 0x0009,
    /// ChannelBind success response
    ChannelBindResponse = 0x0109,
    /// ChannelBind error response
    ChannelBindError = 0x0119,
}

impl MessageType {
    /// Message class from the two class bits
    pub fn class(&self) -> MessageClass {
        class_of(*self as u16)
    }
}

impl TryFrom<u16> for MessageType {
    type Error = StunError;

    fn try_from(value: u16) -> Result<Self, StunError> {
        match value {
            0x0003 => Ok(Self::AllocateRequest),
            0x0103 => Ok(Self::AllocateResponse),
            0x0113 => Ok(Self::AllocateError),
            0x0004 => Ok(Self::RefreshRequest),
            0x0104 => Ok(Self::RefreshResponse),
            0x0114 => Ok(Self::RefreshError),
            0x0016 => Ok(Self::SendIndication),
            0x0017 => Ok(Self::DataIndication),
            0x0008 => Ok(Self::CreatePermissionRequest),
            0x0108 => Ok(Self::CreatePermissionResponse),
            0x0118 => Ok(Self::CreatePermissionError),
            0x0009 => Ok(Self::ChannelBindRequest),
            0x0109 => Ok(Self::ChannelBindResponse),
            0x0119 => Ok(Self::ChannelBindError),
            other => Err(StunError::UnknownMessageType(other)),
        }
    }
}

/// STUN message class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// Request expecting a response
    Request,
    /// One-way indication
    Indication,
    /// Success response
    SuccessResponse,
    /// Error response
    ErrorResponse,
}

/// Extract the class bits from a raw message type. Usable before a full
/// decode, e.g. to decide whether an inbound buffer needs an integrity
/// check.
pub fn class_of(raw: u16) -> MessageClass {
    match raw & 0x0110 {
        0x0000 => MessageClass::Request,
        0x0010 => MessageClass::Indication,
        0x0100 => MessageClass::SuccessResponse,
        0x0110 => MessageClass::ErrorResponse,
        _ => unreachable!(),
    }
}

/// STUN transaction ID (96 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    /// Generate a random transaction ID from the OS RNG
    pub fn new() -> Self {
        let mut id = [0u8; 12];
        OsRng.fill_bytes(&mut id);
        Self(id)
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// A single STUN attribute, typed.
///
/// Only the attributes this client produces or consumes are represented;
/// anything else is skipped during decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    /// XOR-MAPPED-ADDRESS: the client's server-reflexive address
    XorMappedAddress(SocketAddr),
    /// XOR-PEER-ADDRESS: the remote peer an indication or permission concerns
    XorPeerAddress(SocketAddr),
    /// XOR-RELAYED-ADDRESS: the allocated relay address
    XorRelayedAddress(SocketAddr),
    /// USERNAME for long-term credentials
    Username(String),
    /// REALM from the authentication challenge
    Realm(String),
    /// NONCE from the authentication challenge
    Nonce(String),
    /// MESSAGE-INTEGRITY HMAC-SHA1 digest
    MessageIntegrity([u8; 20]),
    /// ERROR-CODE with its reason phrase
    ErrorCode {
        /// Numeric code, e.g. 401
        code: u16,
        /// Human-readable reason
        reason: String,
    },
    /// LIFETIME in seconds
    Lifetime(u32),
    /// REQUESTED-TRANSPORT protocol code (top byte of the 32-bit value)
    RequestedTransport(u8),
    /// CHANNEL-NUMBER (top 16 bits of the 32-bit value)
    ChannelNumber(u16),
    /// DATA: opaque relayed payload
    Data(Vec<u8>),
}

impl Attribute {
    fn type_code(&self) -> u16 {
        match self {
            Attribute::XorMappedAddress(_) => ATTR_XOR_MAPPED_ADDRESS,
            Attribute::XorPeerAddress(_) => ATTR_XOR_PEER_ADDRESS,
            Attribute::XorRelayedAddress(_) => ATTR_XOR_RELAYED_ADDRESS,
            Attribute::Username(_) => ATTR_USERNAME,
            Attribute::Realm(_) => ATTR_REALM,
            Attribute::Nonce(_) => ATTR_NONCE,
            Attribute::MessageIntegrity(_) => ATTR_MESSAGE_INTEGRITY,
            Attribute::ErrorCode { .. } => ATTR_ERROR_CODE,
            Attribute::Lifetime(_) => ATTR_LIFETIME,
            Attribute::RequestedTransport(_) => ATTR_REQUESTED_TRANSPORT,
            Attribute::ChannelNumber(_) => ATTR_CHANNEL_NUMBER,
            Attribute::Data(_) => ATTR_DATA,
        }
    }

    /// Encode this attribute (TLV plus padding) into `buf`
    fn encode(&self, buf: &mut BytesMut, tid: &TransactionId) {
        let start = buf.len();
        buf.put_u16(self.type_code());
        buf.put_u16(0); // length, patched below

        match self {
            Attribute::XorMappedAddress(addr)
            | Attribute::XorPeerAddress(addr)
            | Attribute::XorRelayedAddress(addr) => {
                encode_xor_address(buf, addr, tid);
            }
            Attribute::Username(s) | Attribute::Realm(s) | Attribute::Nonce(s) => {
                buf.put_slice(s.as_bytes());
            }
            Attribute::MessageIntegrity(digest) => {
                buf.put_slice(digest);
            }
            Attribute::ErrorCode { code, reason } => {
                buf.put_u16(0); // reserved
                buf.put_u8((code / 100) as u8);
                buf.put_u8((code % 100) as u8);
                buf.put_slice(reason.as_bytes());
            }
            Attribute::Lifetime(seconds) => {
                buf.put_u32(*seconds);
            }
            Attribute::RequestedTransport(protocol) => {
                buf.put_u8(*protocol);
                buf.put_u8(0);
                buf.put_u16(0);
            }
            Attribute::ChannelNumber(channel) => {
                buf.put_u16(*channel);
                buf.put_u16(0);
            }
            Attribute::Data(data) => {
                buf.put_slice(data);
            }
        }

        let value_len = buf.len() - start - 4;
        buf[start + 2..start + 4].copy_from_slice(&(value_len as u16).to_be_bytes());

        let padding = (4 - (value_len % 4)) % 4;
        for _ in 0..padding {
            buf.put_u8(0);
        }
    }

    /// Decode one attribute value. Returns `Ok(None)` for attribute types
    /// outside the TURN profile, which are skipped.
    fn decode(
        attr_type: u16,
        value: &[u8],
        tid: &TransactionId,
    ) -> Result<Option<Self>, StunError> {
        let attr = match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                Attribute::XorMappedAddress(decode_xor_address(attr_type, value, tid)?)
            }
            ATTR_XOR_PEER_ADDRESS => {
                Attribute::XorPeerAddress(decode_xor_address(attr_type, value, tid)?)
            }
            ATTR_XOR_RELAYED_ADDRESS => {
                Attribute::XorRelayedAddress(decode_xor_address(attr_type, value, tid)?)
            }
            ATTR_USERNAME => Attribute::Username(decode_utf8(attr_type, value)?),
            ATTR_REALM => Attribute::Realm(decode_utf8(attr_type, value)?),
            ATTR_NONCE => Attribute::Nonce(decode_utf8(attr_type, value)?),
            ATTR_MESSAGE_INTEGRITY => {
                if value.len() != INTEGRITY_DIGEST_LEN {
                    return Err(StunError::InvalidAttribute {
                        attr_type,
                        reason: format!("digest length {}", value.len()),
                    });
                }
                let mut digest = [0u8; 20];
                digest.copy_from_slice(value);
                Attribute::MessageIntegrity(digest)
            }
            ATTR_ERROR_CODE => {
                if value.len() < 4 {
                    return Err(StunError::InvalidAttribute {
                        attr_type,
                        reason: "value shorter than 4 bytes".to_string(),
                    });
                }
                let code = value[2] as u16 * 100 + value[3] as u16;
                let reason = String::from_utf8_lossy(&value[4..]).into_owned();
                Attribute::ErrorCode { code, reason }
            }
            ATTR_LIFETIME => {
                if value.len() != 4 {
                    return Err(StunError::InvalidAttribute {
                        attr_type,
                        reason: "value is not 32 bits".to_string(),
                    });
                }
                Attribute::Lifetime(u32::from_be_bytes([value[0], value[1], value[2], value[3]]))
            }
            ATTR_REQUESTED_TRANSPORT => {
                if value.len() != 4 {
                    return Err(StunError::InvalidAttribute {
                        attr_type,
                        reason: "value is not 32 bits".to_string(),
                    });
                }
                Attribute::RequestedTransport(value[0])
            }
            ATTR_CHANNEL_NUMBER => {
                if value.len() != 4 {
                    return Err(StunError::InvalidAttribute {
                        attr_type,
                        reason: "value is not 32 bits".to_string(),
                    });
                }
                Attribute::ChannelNumber(u16::from_be_bytes([value[0], value[1]]))
            }
            ATTR_DATA => Attribute::Data(value.to_vec()),
            _ => return Ok(None),
        };
        Ok(Some(attr))
    }
}

fn decode_utf8(attr_type: u16, value: &[u8]) -> Result<String, StunError> {
    String::from_utf8(value.to_vec()).map_err(|e| StunError::InvalidAttribute {
        attr_type,
        reason: format!("invalid UTF-8: {}", e),
    })
}

/// STUN message
#[derive(Debug, Clone)]
pub struct Message {
    /// Message type
    pub message_type: MessageType,
    /// Transaction ID correlating requests with responses
    pub transaction_id: TransactionId,
    /// Attributes in wire order
    pub attributes: Vec<Attribute>,
}

impl Message {
    /// Create a message with a fresh random transaction ID
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            transaction_id: TransactionId::new(),
            attributes: Vec::new(),
        }
    }

    /// Create a message with an explicit transaction ID
    pub fn with_transaction_id(message_type: MessageType, transaction_id: TransactionId) -> Self {
        Self {
            message_type,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Append an attribute
    pub fn add_attribute(&mut self, attribute: Attribute) {
        self.attributes.push(attribute);
    }

    /// Message class of this message's type
    pub fn class(&self) -> MessageClass {
        self.message_type.class()
    }

    /// First XOR-MAPPED-ADDRESS attribute
    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::XorMappedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// First XOR-RELAYED-ADDRESS attribute
    pub fn xor_relayed_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::XorRelayedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// First XOR-PEER-ADDRESS attribute
    pub fn xor_peer_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::XorPeerAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// LIFETIME attribute in seconds
    pub fn lifetime(&self) -> Option<u32> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Lifetime(seconds) => Some(*seconds),
            _ => None,
        })
    }

    /// REALM attribute
    pub fn realm(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Realm(realm) => Some(realm.as_str()),
            _ => None,
        })
    }

    /// NONCE attribute
    pub fn nonce(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Nonce(nonce) => Some(nonce.as_str()),
            _ => None,
        })
    }

    /// ERROR-CODE attribute as (code, reason)
    pub fn error_code(&self) -> Option<(u16, &str)> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::ErrorCode { code, reason } => Some((*code, reason.as_str())),
            _ => None,
        })
    }

    /// CHANNEL-NUMBER attribute
    pub fn channel_number(&self) -> Option<u16> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::ChannelNumber(channel) => Some(*channel),
            _ => None,
        })
    }

    /// DATA attribute payload
    pub fn data(&self) -> Option<&[u8]> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Data(data) => Some(data.as_slice()),
            _ => None,
        })
    }

    /// Encode without message integrity
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(128);
        self.encode_into(&mut buf, false);
        buf.to_vec()
    }

    /// Encode with a trailing MESSAGE-INTEGRITY attribute.
    ///
    /// The header length field is patched to cover the integrity
    /// attribute before the HMAC is computed, per the STUN signing rule.
    pub fn encode_with_integrity(&self, key: &[u8]) -> Result<Vec<u8>, StunError> {
        let mut buf = BytesMut::with_capacity(128);
        self.encode_into(&mut buf, true);

        let signed_len = buf.len() - HEADER_SIZE + INTEGRITY_ATTR_SIZE;
        buf[2..4].copy_from_slice(&(signed_len as u16).to_be_bytes());

        let mut mac = HmacSha1::new_from_slice(key).map_err(|_| StunError::InvalidKey)?;
        mac.update(&buf);
        let digest = mac.finalize().into_bytes();

        buf.put_u16(ATTR_MESSAGE_INTEGRITY);
        buf.put_u16(INTEGRITY_DIGEST_LEN as u16);
        buf.put_slice(&digest);

        Ok(buf.to_vec())
    }

    fn encode_into(&self, buf: &mut BytesMut, skip_integrity: bool) {
        buf.put_u16(self.message_type as u16);
        buf.put_u16(0); // length, patched below
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(self.transaction_id.as_bytes());

        for attr in &self.attributes {
            if skip_integrity && matches!(attr, Attribute::MessageIntegrity(_)) {
                continue;
            }
            attr.encode(buf, &self.transaction_id);
        }

        let msg_len = buf.len() - HEADER_SIZE;
        buf[2..4].copy_from_slice(&(msg_len as u16).to_be_bytes());
    }

    /// Decode a message from raw bytes.
    ///
    /// The magic cookie and declared length are enforced; unknown
    /// attribute types are skipped.
    pub fn decode(data: &[u8]) -> Result<Self, StunError> {
        if data.len() < HEADER_SIZE {
            return Err(StunError::MessageTooShort(data.len()));
        }

        let raw_type = u16::from_be_bytes([data[0], data[1]]);
        let declared = u16::from_be_bytes([data[2], data[3]]) as usize;
        let cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);

        if cookie != MAGIC_COOKIE {
            return Err(StunError::InvalidMagicCookie(cookie));
        }
        if declared != data.len() - HEADER_SIZE {
            return Err(StunError::LengthMismatch {
                declared,
                actual: data.len() - HEADER_SIZE,
            });
        }

        let message_type = MessageType::try_from(raw_type)?;

        let mut tid = [0u8; 12];
        tid.copy_from_slice(&data[8..20]);
        let transaction_id = TransactionId::from_bytes(tid);

        let mut attributes = Vec::new();
        let mut pos = HEADER_SIZE;
        while pos < data.len() {
            if data.len() - pos < 4 {
                return Err(StunError::TruncatedAttribute(0));
            }
            let attr_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
            let attr_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
            pos += 4;

            if data.len() - pos < attr_len {
                return Err(StunError::TruncatedAttribute(attr_type));
            }
            let value = &data[pos..pos + attr_len];
            if let Some(attr) = Attribute::decode(attr_type, value, &transaction_id)? {
                attributes.push(attr);
            }

            // A final attribute may legitimately lack its padding bytes;
            // the loop condition tolerates pos overshooting the end.
            pos += attr_len + (4 - (attr_len % 4)) % 4;
        }

        Ok(Self {
            message_type,
            transaction_id,
            attributes,
        })
    }
}

/// Verify the MESSAGE-INTEGRITY attribute of a raw message buffer.
///
/// Works on raw bytes so it can run before (or instead of) a full decode:
/// the integrity attribute is located by walking the TLVs, the length
/// field is patched to the value it had at signing time, and the HMAC is
/// recomputed over everything preceding the attribute.
pub fn verify_integrity(data: &[u8], key: &[u8]) -> bool {
    if data.len() < HEADER_SIZE {
        return false;
    }

    let mut pos = HEADER_SIZE;
    while pos + 4 <= data.len() {
        let attr_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let attr_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        let value_start = pos + 4;

        if data.len() - value_start < attr_len {
            return false;
        }

        if attr_type == ATTR_MESSAGE_INTEGRITY {
            if attr_len != INTEGRITY_DIGEST_LEN {
                return false;
            }
            let mut signed = data[..pos].to_vec();
            let patched = (pos - HEADER_SIZE + INTEGRITY_ATTR_SIZE) as u16;
            signed[2..4].copy_from_slice(&patched.to_be_bytes());

            let mut mac = match HmacSha1::new_from_slice(key) {
                Ok(mac) => mac,
                Err(_) => return false,
            };
            mac.update(&signed);
            return mac
                .verify_slice(&data[value_start..value_start + attr_len])
                .is_ok();
        }

        pos = value_start + attr_len + (4 - (attr_len % 4)) % 4;
    }

    false
}

fn encode_xor_address(buf: &mut BytesMut, addr: &SocketAddr, tid: &TransactionId) {
    buf.put_u8(0); // reserved
    match addr {
        SocketAddr::V4(v4) => {
            buf.put_u8(0x01);
            buf.put_u16(v4.port() ^ (MAGIC_COOKIE >> 16) as u16);
            let ip = v4.ip().octets();
            let cookie = MAGIC_COOKIE.to_be_bytes();
            for i in 0..4 {
                buf.put_u8(ip[i] ^ cookie[i]);
            }
        }
        SocketAddr::V6(v6) => {
            buf.put_u8(0x02);
            buf.put_u16(v6.port() ^ (MAGIC_COOKIE >> 16) as u16);
            let ip = v6.ip().octets();
            let cookie = MAGIC_COOKIE.to_be_bytes();
            let tid_bytes = tid.as_bytes();
            for i in 0..4 {
                buf.put_u8(ip[i] ^ cookie[i]);
            }
            for i in 0..12 {
                buf.put_u8(ip[i + 4] ^ tid_bytes[i]);
            }
        }
    }
}

fn decode_xor_address(
    attr_type: u16,
    value: &[u8],
    tid: &TransactionId,
) -> Result<SocketAddr, StunError> {
    if value.len() < 8 {
        return Err(StunError::InvalidAttribute {
            attr_type,
            reason: "address shorter than 8 bytes".to_string(),
        });
    }

    let family = value[1];
    let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
    let cookie = MAGIC_COOKIE.to_be_bytes();

    match family {
        0x01 => {
            let mut ip = [0u8; 4];
            ip.copy_from_slice(&value[4..8]);
            for i in 0..4 {
                ip[i] ^= cookie[i];
            }
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port))
        }
        0x02 => {
            if value.len() < 20 {
                return Err(StunError::InvalidAttribute {
                    attr_type,
                    reason: "IPv6 address shorter than 20 bytes".to_string(),
                });
            }
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&value[4..20]);
            let tid_bytes = tid.as_bytes();
            for i in 0..4 {
                ip[i] ^= cookie[i];
            }
            for i in 0..12 {
                ip[i + 4] ^= tid_bytes[i];
            }
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port))
        }
        other => Err(StunError::InvalidAddressFamily(other)),
    }
}
