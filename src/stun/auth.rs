//! Long-term credential handling.
//!
//! TURN servers authenticate with the long-term credential mechanism: the
//! first Allocate is rejected with a realm and nonce, the client derives a
//! 16-byte key from `username:realm:password`, and every later request
//! carries USERNAME/REALM/NONCE plus a MESSAGE-INTEGRITY digest keyed by
//! that hash.

use md5::{Digest, Md5};

use crate::stun::message::{Attribute, Message};

/// Derive the long-term credential key: MD5 of `username:realm:password`.
pub fn long_term_key(username: &str, realm: &str, password: &str) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(format!("{}:{}:{}", username, realm, password).as_bytes());
    let digest = hasher.finalize();
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest);
    key
}

/// Credential state owned by a relay port.
///
/// Username and password are given up front; realm and nonce arrive with
/// the server's first authentication challenge, at which point the key is
/// computed and cached. A port computes the key at most once: a second
/// challenge after the key is set is treated as fatal by the caller.
#[derive(Debug, Clone)]
pub struct LongTermCredential {
    username: String,
    password: String,
    realm: String,
    nonce: String,
    key: Option<[u8; 16]>,
}

impl LongTermCredential {
    /// Create from the configured username and password
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            realm: String::new(),
            nonce: String::new(),
            key: None,
        }
    }

    /// True when username or password is missing
    pub fn is_empty(&self) -> bool {
        self.username.is_empty() || self.password.is_empty()
    }

    /// Configured username
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Realm learned from the challenge (empty before it)
    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Nonce learned from the challenge (empty before it)
    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    /// Whether the key has been derived
    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    /// The derived key, once a challenge has been processed
    pub fn key(&self) -> Option<&[u8; 16]> {
        self.key.as_ref()
    }

    /// Store the challenge's realm and nonce and derive the key
    pub fn update(&mut self, realm: &str, nonce: &str) {
        self.realm = realm.to_string();
        self.nonce = nonce.to_string();
        self.key = Some(long_term_key(&self.username, &self.realm, &self.password));
    }

    /// Attach USERNAME, REALM, and NONCE to an outgoing request.
    ///
    /// The MESSAGE-INTEGRITY digest itself is appended at encode time by
    /// [`Message::encode_with_integrity`]. Must not be called before a
    /// challenge has set the key.
    pub fn apply(&self, message: &mut Message) {
        debug_assert!(self.has_key(), "auth info applied before a challenge");
        message.add_attribute(Attribute::Username(self.username.clone()));
        message.add_attribute(Attribute::Realm(self.realm.clone()));
        message.add_attribute(Attribute::Nonce(self.nonce.clone()));
    }
}
