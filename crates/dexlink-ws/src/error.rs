//! Transport error types.

use std::time::Duration;

use dexlink_msg::MessageKind;
use thiserror::Error;

/// Transport error types.
///
/// Read errors are never surfaced through these variants; they manifest
/// as status transitions and eventual closure of the message source.
#[derive(Debug, Error)]
pub enum WsError {
    /// The server's certificate chain was rejected. Terminal unless the
    /// caller changes the pinned certificate.
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// The certificate chain was rejected and no pinned certificate was
    /// configured; the caller should supply one.
    #[error("certificate required: {0}")]
    CertificateRequired(String),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("cannot send on a broken connection")]
    ConnectionBroken,

    #[error("message is not a request: {0:?}")]
    NotARequest(MessageKind),

    #[error("failed to marshal message: {0}")]
    Marshal(#[from] serde_json::Error),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for transport operations.
pub type WsResult<T> = std::result::Result<T, WsError>;
