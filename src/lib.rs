//! TURN relay client library (lib.rs)
//!
//! UDP relaying for hosts stuck behind symmetric NATs: allocates a relayed
//! address on a TURN server, keeps it refreshed, and moves application data
//! through Send/Data indications or bound channels.

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod error;
pub mod relay;
pub mod stun;

// Re-export the relay surface
pub use relay::port::{Allocation, RelayConnection, RelayHandle, RelayPort};
pub use relay::request::{RequestKind, RetransmitConfig};
pub use relay::{
    Candidate, Protocol, RelayEvent, CHANNEL_NUMBER_MAX, CHANNEL_NUMBER_START, PERMISSION_TIMEOUT,
    TURN_DEFAULT_PORT,
};

// Re-export wire-format types
pub use stun::{
    class_of, long_term_key, verify_integrity, Attribute, Message, MessageClass, MessageType,
    TransactionId,
};

// Re-export configuration and error types
pub use config::RelayConfig;
pub use error::{RelayError, RelayResult, StunError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging system with custom configuration
///
/// # Arguments
/// * `level` - Log level (trace/debug/info/warn/error)
///
/// # Example
/// ```
/// turn_relay::init_logging("info");
/// ```
pub fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
        // Reduce verbosity of some dependencies
        .add_directive("tokio=warn".parse().unwrap())
        .add_directive("runtime=warn".parse().unwrap());

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(true),
        )
        .with(filter)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_embedded() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn reexports_are_usable() {
        let config = RelayConfig::new("turn.example.org", "user", "pass");
        assert_eq!(config.server_host_port().1, TURN_DEFAULT_PORT);

        let message = Message::new(MessageType::AllocateRequest);
        assert_eq!(message.class(), MessageClass::Request);
    }
}
