//! Durable websocket client transport for dexlink sessions.
//!
//! Provides the connection an exchange client keeps with its server:
//! - TLS with an optional pinned certificate on top of system roots
//! - Inactivity detection via server pings and a configurable ping wait
//! - Automatic reconnection with capped backoff and a post-reconnect
//!   sync hook
//! - Request/response correlation with per-request expiry
//! - A single-consumer feed of server requests and notifications

pub mod connection;
pub mod error;
pub mod registry;
pub mod status;
mod tls;

pub use connection::{
    Connection, NetDialFn, RawHandlerFn, ReconnectSyncFn, WsCfg, DEFAULT_RESPONSE_TIMEOUT,
    MAX_RECONNECT_INTERVAL, RECONNECT_INTERVAL, WRITE_WAIT,
};
pub use dexlink_msg::{Message, MessageKind};
pub use error::{WsError, WsResult};
pub use registry::{ExpireFn, ResponseFn};
pub use status::{ConnectEventFn, ConnectionStatus};

use std::sync::Once;

static INIT_CRYPTO: Once = Once::new();

/// Initialize the TLS crypto provider. Runs implicitly when a
/// connection is constructed; call it earlier to pin provider selection
/// at startup.
pub fn init_crypto() {
    INIT_CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
